use crate::bytecode::{CodeIndex, Function};
use crate::lang::env::Env;
use std::collections::TryReserveError;
use std::rc::Rc;

/// Smallest number of free slots a stack grows by.
pub const MIN_STACK_GROWTH: usize = 64;

/// Frames per frame-stack chunk.
pub const FRAME_CHUNK: usize = 64;

/// Growable stack addressed by index.
///
/// Growth only happens through [`Stack::ensure_free`], which the interpreter
/// calls before entering a code object, never in the middle of an
/// instruction.
#[derive(Debug)]
pub struct Stack<T> {
    items: Vec<T>,
}

impl<T: Clone> Stack<T> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    /// Make room for at least `n` more items, at least doubling the capacity.
    ///
    /// Fails instead of aborting when the allocation cannot be made.
    pub fn ensure_free(&mut self, n: usize) -> Result<(), TryReserveError> {
        let free = self.items.capacity() - self.items.len();
        if free >= n {
            return Ok(());
        }
        let target = (self.items.capacity().saturating_mul(2))
            .max(self.items.len().saturating_add(n))
            .max(MIN_STACK_GROWTH);
        self.items.try_reserve_exact(target - self.items.len())
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn top(&self) -> Option<&T> {
        self.items.last()
    }

    /// Item at absolute position `index`, counted from the bottom.
    pub fn at(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }
}

impl<T: Clone> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One active code invocation.
#[derive(Debug, Clone)]
pub struct Frame {
    pub function: Rc<Function>,
    pub code: CodeIndex,
    pub env: Env,
    /// Start of the instruction currently executing.
    pub pc: usize,
    /// Operand-stack depth on entry; stack-passed arguments sit just below.
    pub bp: usize,
    /// Integer-stack depth on entry.
    pub ibp: usize,
    pub num_args: usize,
}

struct FrameChunk {
    frames: Vec<Frame>,
    prev: Option<Box<FrameChunk>>,
}

impl FrameChunk {
    fn new() -> Box<Self> {
        Box::new(FrameChunk {
            frames: Vec::with_capacity(FRAME_CHUNK),
            prev: None,
        })
    }
}

/// Frame stack made of fixed-size chunks linked to their predecessor.
///
/// Frames never move once pushed. One emptied chunk is kept as a spare so
/// that a call depth oscillating across a chunk boundary does not allocate.
pub struct FrameStack {
    head: Box<FrameChunk>,
    spare: Option<Box<FrameChunk>>,
    len: usize,
}

impl FrameStack {
    pub fn new() -> Self {
        Self {
            head: FrameChunk::new(),
            spare: None,
            len: 0,
        }
    }

    pub fn push(&mut self, frame: Frame) {
        if self.head.frames.len() == FRAME_CHUNK {
            let fresh = self.spare.take().unwrap_or_else(FrameChunk::new);
            let full = std::mem::replace(&mut self.head, fresh);
            self.head.prev = Some(full);
        }
        self.head.frames.push(frame);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<Frame> {
        let frame = self.head.frames.pop()?;
        self.len -= 1;
        if self.head.frames.is_empty() {
            if let Some(prev) = self.head.prev.take() {
                let empty = std::mem::replace(&mut self.head, prev);
                self.spare = Some(empty);
            }
        }
        Some(frame)
    }

    pub fn top(&self) -> Option<&Frame> {
        self.head.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut Frame> {
        self.head.frames.last_mut()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Innermost frame first.
    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        std::iter::successors(Some(&*self.head), |chunk| chunk.prev.as_deref())
            .flat_map(|chunk| chunk.frames.iter().rev())
    }
}

impl Default for FrameStack {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::stream::{CodeStream, FunctionBuilder};

    fn frame(pc: usize) -> Frame {
        let mut fb = FunctionBuilder::new();
        let mut cs = CodeStream::new(0);
        cs.ret();
        fb.install(0, cs.finish().unwrap());
        Frame {
            function: Rc::new(fb.finish().unwrap()),
            code: 0,
            env: Env::new(),
            pc,
            bp: 0,
            ibp: 0,
            num_args: 0,
        }
    }

    #[test]
    fn test_ensure_free_grows_geometrically() {
        let mut s: Stack<i32> = Stack::new();
        s.ensure_free(1).unwrap();
        assert!(s.capacity() >= MIN_STACK_GROWTH);
        let cap = s.capacity();
        for i in 0..cap as i32 {
            s.push(i);
        }
        s.ensure_free(1).unwrap();
        assert!(s.capacity() >= cap * 2);
        assert_eq!(s.at(3), Some(&3));
        assert_eq!(s.top(), Some(&(cap as i32 - 1)));
    }

    #[test]
    fn test_ensure_free_reports_impossible_growth() {
        let mut s: Stack<i32> = Stack::new();
        s.push(1);
        assert!(s.ensure_free(usize::MAX).is_err());
        assert!(s.ensure_free(isize::MAX as usize / 2).is_err());
        assert_eq!(s.len(), 1);
        assert_eq!(s.top(), Some(&1));
    }

    #[test]
    fn test_pop_empty_is_none() {
        let mut s: Stack<i32> = Stack::new();
        assert_eq!(s.pop(), None);
        s.push(1);
        s.push(2);
        s.truncate(1);
        assert_eq!(s.as_slice(), &[1]);
    }

    #[test]
    fn test_frame_stack_crosses_chunks() {
        let mut frames = FrameStack::new();
        let n = FRAME_CHUNK * 2 + 3;
        for pc in 0..n {
            frames.push(frame(pc));
        }
        assert_eq!(frames.len(), n);
        assert_eq!(frames.top().map(|f| f.pc), Some(n - 1));

        let order: Vec<usize> = frames.iter().map(|f| f.pc).take(5).collect();
        assert_eq!(order, vec![n - 1, n - 2, n - 3, n - 4, n - 5]);
        assert_eq!(frames.iter().count(), n);

        for pc in (0..n).rev() {
            assert_eq!(frames.pop().map(|f| f.pc), Some(pc));
        }
        assert!(frames.is_empty());
        assert!(frames.pop().is_none());
    }

    #[test]
    fn test_top_mut_updates_pc() {
        let mut frames = FrameStack::new();
        frames.push(frame(0));
        if let Some(top) = frames.top_mut() {
            top.pc = 9;
        }
        assert_eq!(frames.top().unwrap().pc, 9);
    }
}
