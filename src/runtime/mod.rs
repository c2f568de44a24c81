pub mod call;
pub mod host;
pub mod primitives;
pub mod promise;
pub mod runtime_error;
pub mod stack;
pub mod vm_bc;

pub use call::CallSite;
