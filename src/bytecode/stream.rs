use crate::bytecode::ir::{Code, CodeIndex, Function};
use crate::bytecode::op::{IMMEDIATE_SIZE, Opcode};
use crate::bytecode::pool::{Pool, PoolIndex};
use crate::bytecode::verify::max_depths;
use crate::lang::value::{Value, Vector};
use std::rc::Rc;
use thiserror::Error;

// =============================================================================
// ASSEMBLER - Builds Code objects and Functions by hand
// =============================================================================
//
// The VM does not compile source; producers (a front-end compiler, tests,
// the demo programs) emit bytecode through this interface so that encoding,
// label resolution, source maps and stack sizing live in one place.

#[derive(Debug, Error, PartialEq)]
pub enum AssembleError {
    #[error("label {0} used but never bound")]
    UnboundLabel(usize),
    #[error("label {0} bound twice")]
    LabelRebound(usize),
    #[error("code index {0} reserved but never installed")]
    MissingCode(CodeIndex),
}

/// Jump target inside a [`CodeStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

pub struct CodeStream {
    bytes: Vec<u8>,
    src: PoolIndex,
    src_map: Vec<PoolIndex>,
    children: Vec<CodeIndex>,
    labels: Vec<Option<usize>>,
    patchpoints: Vec<(usize, Label)>,
    next_source: PoolIndex,
}

impl CodeStream {
    /// A new stream whose unit-level source is `src`.
    pub fn new(src: PoolIndex) -> Self {
        Self {
            bytes: Vec::new(),
            src,
            src_map: Vec::new(),
            children: Vec::new(),
            labels: Vec::new(),
            patchpoints: Vec::new(),
            next_source: 0,
        }
    }

    /// Source slot for the next emitted instruction only.
    pub fn with_source(&mut self, slot: PoolIndex) -> &mut Self {
        self.next_source = slot;
        self
    }

    /// Register a nested code and return its child offset.
    pub fn child(&mut self, index: CodeIndex) -> u32 {
        if let Some(pos) = self.children.iter().position(|c| *c == index) {
            return pos as u32;
        }
        self.children.push(index);
        (self.children.len() - 1) as u32
    }

    pub fn emit(&mut self, op: Opcode, immediates: &[u32]) -> &mut Self {
        debug_assert_eq!(op.immediates().len(), immediates.len());
        self.bytes.push(op as u8);
        for imm in immediates {
            self.bytes.extend_from_slice(&imm.to_le_bytes());
        }
        let slot = std::mem::take(&mut self.next_source);
        self.src_map.push(slot);
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut Self {
        self.emit(op, &[])
    }

    pub fn push(&mut self, constant: PoolIndex) -> &mut Self {
        self.emit(Opcode::Push, &[constant])
    }

    pub fn ldfun(&mut self, symbol: PoolIndex) -> &mut Self {
        self.emit(Opcode::Ldfun, &[symbol])
    }

    pub fn ldvar(&mut self, symbol: PoolIndex) -> &mut Self {
        self.emit(Opcode::Ldvar, &[symbol])
    }

    pub fn ldddvar(&mut self, symbol: PoolIndex) -> &mut Self {
        self.emit(Opcode::Ldddvar, &[symbol])
    }

    pub fn call(&mut self, args: PoolIndex, names: PoolIndex) -> &mut Self {
        self.emit(Opcode::Call, &[args, names])
    }

    /// `promise` over the function-level code `index`.
    pub fn promise(&mut self, index: CodeIndex) -> &mut Self {
        let offset = self.child(index);
        self.emit(Opcode::Promise, &[offset])
    }

    pub fn pusharg(&mut self, n: u32) -> &mut Self {
        self.emit(Opcode::Pusharg, &[n])
    }

    pub fn pushi(&mut self, n: i32) -> &mut Self {
        self.emit(Opcode::Pushi, &[n as u32])
    }

    pub fn isspecial(&mut self, symbol: PoolIndex) -> &mut Self {
        self.emit(Opcode::Isspecial, &[symbol])
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next instruction.
    pub fn bind(&mut self, label: Label) -> Result<&mut Self, AssembleError> {
        let slot = self
            .labels
            .get_mut(label.0)
            .ok_or(AssembleError::UnboundLabel(label.0))?;
        if slot.is_some() {
            return Err(AssembleError::LabelRebound(label.0));
        }
        *slot = Some(self.bytes.len());
        Ok(self)
    }

    /// Emit `br`, `brtrue` or `brfalse` towards `label`.
    pub fn jump(&mut self, op: Opcode, label: Label) -> &mut Self {
        debug_assert!(op.is_jump());
        self.patchpoints.push((self.bytes.len() + 1, label));
        self.emit(op, &[0])
    }

    pub fn br(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Br, label)
    }

    pub fn brtrue(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Brtrue, label)
    }

    pub fn brfalse(&mut self, label: Label) -> &mut Self {
        self.jump(Opcode::Brfalse, label)
    }

    pub fn ret(&mut self) -> &mut Self {
        self.op(Opcode::Ret)
    }

    /// Resolve labels and compute stack high-water marks.
    pub fn finish(mut self) -> Result<Code, AssembleError> {
        for (at, label) in std::mem::take(&mut self.patchpoints) {
            let target = self.labels[label.0].ok_or(AssembleError::UnboundLabel(label.0))?;
            let offset = target as i64 - (at + IMMEDIATE_SIZE) as i64;
            self.bytes[at..at + IMMEDIATE_SIZE].copy_from_slice(&(offset as i32).to_le_bytes());
        }

        let mut code = Code {
            bytes: self.bytes,
            stack_length: 0,
            istack_length: 0,
            src: self.src,
            src_map: self.src_map,
            children: self.children,
        };
        let (stack, istack) = max_depths(&code);
        code.stack_length = stack as u32;
        code.istack_length = istack as u32;
        Ok(code)
    }
}

/// Collects the code objects and pools of one [`Function`].
///
/// Index 0 is reserved for the body; nested code can be reserved first and
/// installed later, so a body can refer to promises built after it.
pub struct FunctionBuilder {
    codes: Vec<Option<Code>>,
    constants: Pool,
    sources: Pool,
}

impl Default for FunctionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionBuilder {
    pub fn new() -> Self {
        Self {
            codes: vec![None],
            constants: Pool::new(),
            sources: Pool::new(),
        }
    }

    pub fn reserve(&mut self) -> CodeIndex {
        self.codes.push(None);
        (self.codes.len() - 1) as CodeIndex
    }

    pub fn install(&mut self, index: CodeIndex, code: Code) {
        if let Some(slot) = self.codes.get_mut(index as usize) {
            *slot = Some(code);
        }
    }

    /// Reserve and install in one step.
    pub fn add_code(&mut self, code: Code) -> CodeIndex {
        let index = self.reserve();
        self.install(index, code);
        index
    }

    pub fn constant(&mut self, value: Value) -> PoolIndex {
        self.constants.add(value)
    }

    pub fn source(&mut self, value: Value) -> PoolIndex {
        self.sources.add(value)
    }

    pub fn symbol(&mut self, name: &str) -> PoolIndex {
        self.constants.add(Value::symbol(name))
    }

    /// Constants for a `call`: the child offsets of the arguments and their
    /// names. `MISSING_ARG` marks an empty argument, the name `...` forwards
    /// the caller's variadic binding. When no argument is named the names
    /// constant is the `Null` sentinel.
    pub fn call_consts(&mut self, args: &[(Option<&str>, i32)]) -> (PoolIndex, PoolIndex) {
        let offsets = args.iter().map(|(_, offset)| Some(*offset)).collect();
        let args_k = self.constant(Value::vector(Vector::Integer(offsets)));

        let names_k = if args.iter().all(|(name, _)| name.is_none()) {
            0
        } else {
            let names = args
                .iter()
                .map(|(name, _)| Some(Rc::from(name.unwrap_or(""))))
                .collect();
            self.constant(Value::vector(Vector::Str(names)))
        };
        (args_k, names_k)
    }

    pub fn finish(self) -> Result<Function, AssembleError> {
        let codes = self
            .codes
            .into_iter()
            .enumerate()
            .map(|(i, code)| code.ok_or(AssembleError::MissingCode(i as CodeIndex)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Function {
            codes,
            constants: self.constants,
            sources: self.sources,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::MISSING_ARG;
    use crate::bytecode::op::{instructions, read_i32};

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut cs = CodeStream::new(0);
        let top = cs.new_label();
        let exit = cs.new_label();
        cs.bind(top).unwrap();
        cs.op(Opcode::Dup).brfalse(exit).br(top);
        cs.bind(exit).unwrap();
        cs.ret();
        let code = cs.finish().unwrap();

        // dup@0 brfalse@1 br@6 ret@11
        let mut pc = 2;
        assert_eq!(read_i32(&code.bytes, &mut pc), Ok(5));
        let mut pc = 7;
        assert_eq!(read_i32(&code.bytes, &mut pc), Ok(-11));
    }

    #[test]
    fn test_unbound_label_is_an_error() {
        let mut cs = CodeStream::new(0);
        let nowhere = cs.new_label();
        cs.br(nowhere);
        assert_eq!(cs.finish().err(), Some(AssembleError::UnboundLabel(0)));
    }

    #[test]
    fn test_source_slot_applies_to_one_instruction() {
        let mut cs = CodeStream::new(1);
        cs.with_source(4).push(1).op(Opcode::Dup).ret();
        let code = cs.finish().unwrap();
        assert_eq!(code.src_map, vec![4, 0, 0]);
        assert_eq!(code.source_slot(0), Ok(4));
        assert_eq!(code.source_slot(5), Ok(1));
    }

    #[test]
    fn test_high_water_marks() {
        let mut cs = CodeStream::new(0);
        cs.push(1).push(1).op(Opcode::Add).pushi(0).op(Opcode::Dupi);
        cs.op(Opcode::Lti).op(Opcode::Pop).ret();
        let code = cs.finish().unwrap();
        assert_eq!(code.stack_length, 2);
        assert_eq!(code.istack_length, 2);
        assert_eq!(instructions(&code.bytes).count(), 8);
    }

    #[test]
    fn test_children_are_deduplicated() {
        let mut cs = CodeStream::new(0);
        cs.promise(3).promise(5).promise(3);
        assert_eq!(cs.child(5), 1);
        let code = cs.finish().unwrap();
        assert_eq!(code.children, vec![3, 5]);
    }

    #[test]
    fn test_call_consts() {
        let mut fb = FunctionBuilder::new();
        let (args, names) = fb.call_consts(&[(None, 0), (None, MISSING_ARG)]);
        assert_eq!(names, 0);
        assert_eq!(
            fb.constants.get(args),
            Some(&Value::vector(Vector::Integer(vec![Some(0), Some(-1)])))
        );

        let (_, names) = fb.call_consts(&[(Some("x"), 0), (None, 1)]);
        assert_eq!(
            fb.constants.get(names),
            Some(&Value::vector(Vector::Str(vec![
                Some(Rc::from("x")),
                Some(Rc::from(""))
            ])))
        );
    }

    #[test]
    fn test_missing_code_is_reported() {
        let mut fb = FunctionBuilder::new();
        let mut cs = CodeStream::new(0);
        cs.ret();
        fb.install(0, cs.finish().unwrap());
        fb.reserve();
        assert_eq!(fb.finish().err(), Some(AssembleError::MissingCode(1)));
    }
}
