use crate::bytecode::op::{self, BYTECODE_VERSION};
use crate::bytecode::pool::{Pool, PoolIndex};
use crate::runtime::runtime_error::Fault;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Index of a code object inside its [`Function`].
pub type CodeIndex = u32;

/// Call-argument offset meaning "argument left empty", e.g. `f(, 2)`.
pub const MISSING_ARG: i32 = -1;

/// Magic number at the start of every bytecode image.
pub const IMAGE_MAGIC: u32 = 0xCAFE_BABE;

/// A single compiled instruction stream.
///
/// Immutable once built. Immediates that refer to nested code are offsets
/// into `children`, which holds indices into the owning function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    /// Encoded instructions.
    pub bytes: Vec<u8>,
    /// Operand-stack high-water mark.
    pub stack_length: u32,
    /// Integer-stack high-water mark.
    pub istack_length: u32,
    /// Source-pool slot of the whole unit.
    pub src: PoolIndex,
    /// Source-pool slot per instruction, 0 = use `src`.
    pub src_map: Vec<PoolIndex>,
    /// Function-level indices of nested promise / closure code.
    pub children: Vec<CodeIndex>,
}

impl Code {
    pub fn instruction_count(&self) -> usize {
        self.src_map.len()
    }

    /// Index of the instruction starting at `pc`.
    ///
    /// Re-walks the stream from the start; only meant for diagnostics.
    pub fn instruction_index(&self, pc: usize) -> Result<usize, Fault> {
        let mut cursor = 0;
        let mut index = 0;
        while cursor < pc {
            cursor = op::advance_pc(&self.bytes, cursor)?;
            index += 1;
        }
        if cursor != pc {
            return Err(Fault::Misaligned { pc });
        }
        Ok(index)
    }

    /// Source-pool slot for the instruction starting at `pc`, falling back
    /// to the unit slot.
    pub fn source_slot(&self, pc: usize) -> Result<PoolIndex, Fault> {
        let index = self.instruction_index(pc)?;
        match self.src_map.get(index).copied() {
            Some(0) | None => Ok(self.src),
            Some(slot) => Ok(slot),
        }
    }

    /// Function-level index of the child at `offset`.
    pub fn child(&self, offset: u32) -> Result<CodeIndex, Fault> {
        self.children
            .get(offset as usize)
            .copied()
            .ok_or(Fault::ChildOutOfRange {
                offset,
                len: self.children.len(),
            })
    }
}

/// A compiled function: its code objects and the pools they share.
///
/// Convention: `codes[0]` is the body, the rest are promises and nested
/// code referenced from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub codes: Vec<Code>,
    pub constants: Pool,
    pub sources: Pool,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("not a bytecode image (magic {0:#010x})")]
    BadMagic(u32),
    #[error("bytecode version {found} is not supported (expected {expected})")]
    Version { found: u16, expected: u16 },
    #[error("image encoding failed: {0}")]
    Encoding(#[from] postcard::Error),
}

#[derive(Serialize)]
struct ImageRef<'a> {
    magic: u32,
    version: u16,
    function: &'a Function,
}

#[derive(Deserialize)]
struct Image {
    magic: u32,
    version: u16,
    function: Function,
}

impl Function {
    pub fn body(&self) -> Option<&Code> {
        self.codes.first()
    }

    pub fn code(&self, index: CodeIndex) -> Option<&Code> {
        self.codes.get(index as usize)
    }

    pub fn constant(&self, index: PoolIndex) -> Result<&crate::lang::value::Value, Fault> {
        self.constants
            .get(index)
            .ok_or(Fault::ConstantOutOfRange {
                index,
                len: self.constants.len(),
            })
    }

    pub fn source(&self, index: PoolIndex) -> Result<&crate::lang::value::Value, Fault> {
        self.sources.get(index).ok_or(Fault::SourceOutOfRange {
            index,
            len: self.sources.len(),
        })
    }

    /// Encode as a versioned binary image.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ImageError> {
        let image = ImageRef {
            magic: IMAGE_MAGIC,
            version: BYTECODE_VERSION,
            function: self,
        };
        Ok(postcard::to_allocvec(&image)?)
    }

    /// Decode a binary image produced by [`Function::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Function, ImageError> {
        let image: Image = postcard::from_bytes(bytes)?;
        if image.magic != IMAGE_MAGIC {
            return Err(ImageError::BadMagic(image.magic));
        }
        if image.version != BYTECODE_VERSION {
            return Err(ImageError::Version {
                found: image.version,
                expected: BYTECODE_VERSION,
            });
        }
        Ok(image.function)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::lang::value::Value;

    fn sample() -> Function {
        let mut constants = Pool::new();
        let k = constants.add(Value::real(2.0));
        let mut sources = Pool::new();
        let unit = sources.add(Value::symbol("unit"));
        let insn = sources.add(Value::symbol("insn"));

        let mut bytes = vec![Opcode::Push as u8];
        bytes.extend_from_slice(&k.to_le_bytes());
        bytes.push(Opcode::Dup as u8);
        bytes.push(Opcode::Pop as u8);
        bytes.push(Opcode::Ret as u8);

        Function {
            codes: vec![Code {
                bytes,
                stack_length: 2,
                istack_length: 0,
                src: unit,
                src_map: vec![0, insn, 0, 0],
                children: vec![],
            }],
            constants,
            sources,
        }
    }

    #[test]
    fn test_instruction_index_counts_boundaries() {
        let f = sample();
        let code = f.body().unwrap();
        assert_eq!(code.instruction_index(0), Ok(0));
        assert_eq!(code.instruction_index(5), Ok(1));
        assert_eq!(code.instruction_index(7), Ok(3));
        assert_eq!(code.instruction_index(2), Err(Fault::Misaligned { pc: 2 }));
    }

    #[test]
    fn test_source_slot_falls_back_to_unit() {
        let f = sample();
        let code = f.body().unwrap();
        assert_eq!(f.source(code.source_slot(0).unwrap()).unwrap(), &Value::symbol("unit"));
        assert_eq!(f.source(code.source_slot(5).unwrap()).unwrap(), &Value::symbol("insn"));
    }

    #[test]
    fn test_constant_out_of_range() {
        let f = sample();
        assert!(matches!(
            f.constant(9),
            Err(Fault::ConstantOutOfRange { index: 9, len: 2 })
        ));
    }

    #[test]
    fn test_image_round_trip() {
        let f = sample();
        let bytes = f.to_bytes().unwrap();
        let back = Function::from_bytes(&bytes).unwrap();

        assert_eq!(back.codes, f.codes);
        assert_eq!(back.constants.get(1), Some(&Value::real(2.0)));
        assert_eq!(back.sources.get(2), Some(&Value::symbol("insn")));
    }

    #[test]
    fn test_image_rejects_wrong_magic() {
        let image = ImageRef {
            magic: 0xDEAD_BEEF,
            version: BYTECODE_VERSION,
            function: &sample(),
        };
        let bytes = postcard::to_allocvec(&image).unwrap();
        assert!(matches!(
            Function::from_bytes(&bytes),
            Err(ImageError::BadMagic(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_runtime_values_are_not_serializable() {
        let mut f = sample();
        f.constants.add(Value::Env(crate::lang::env::Env::new()));
        assert!(f.to_bytes().is_err());
    }
}
