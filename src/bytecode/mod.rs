pub mod disasm;
pub mod ir;
pub mod op;
pub mod pool;
pub mod stream;
pub mod verify;

pub use ir::{Code, CodeIndex, Function, ImageError, MISSING_ARG};
pub use op::Opcode;
pub use pool::{Pool, PoolIndex};
pub use stream::{CodeStream, FunctionBuilder, Label};
