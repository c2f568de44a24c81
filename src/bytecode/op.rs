use crate::runtime::runtime_error::Fault;

// =============================================================================
// OPCODE - Bytecode instruction set
// =============================================================================
//
// Every instruction is one opcode byte followed by a fixed number of 4-byte
// little-endian immediates. The table below is the single source of truth:
// the decoder, the instruction-length table, the stack-effect table and the
// disassembler names are all generated from it. Adding an opcode means adding
// one line here.

/// Width in bytes of every immediate operand.
pub const IMMEDIATE_SIZE: usize = 4;

/// Bytecode format version, bumped whenever the table below changes.
pub const BYTECODE_VERSION: u16 = 3;

/// What an immediate operand refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Imm {
    /// Index into the constant pool.
    Pool,
    /// Offset into the current code's `children` list.
    Child,
    /// Signed jump offset, relative to the end of the instruction.
    Jump,
    /// Signed integer literal.
    Int,
    /// Index of an argument passed on the operand stack.
    Arg,
}

/// Static stack effect: values popped/pushed on the operand stack and on the
/// integer stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Effect {
    pub pop: u8,
    pub push: u8,
    pub ipop: u8,
    pub ipush: u8,
}

macro_rules! instructions {
    ($(
        $(#[$doc:meta])*
        $name:ident = $byte:literal, $mnemonic:literal, [$($imm:ident),*],
            ($pop:literal, $push:literal, $ipop:literal, $ipush:literal);
    )*) => {
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $( $(#[$doc])* $name = $byte, )*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];

            pub fn from_byte(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $byte => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            pub fn immediates(self) -> &'static [Imm] {
                match self {
                    $( Opcode::$name => &[$(Imm::$imm),*], )*
                }
            }

            pub fn effect(self) -> Effect {
                match self {
                    $( Opcode::$name => Effect {
                        pop: $pop,
                        push: $push,
                        ipop: $ipop,
                        ipush: $ipush,
                    }, )*
                }
            }
        }
    };
}

instructions! {
    //                                   immediates     (pop push popi pushi)
    /// Traps execution of zero-initialized memory.
    Invalid = 0, "invalid", [], (0, 0, 0, 0);

    // ─────────────────────────── Loads & stores ─────────────────────────
    /// Push a constant. `( -- k )`
    Push = 1, "push", [Pool], (0, 1, 0, 0);
    /// Look up a callable binding. `( -- f )`
    Ldfun = 2, "ldfun", [Pool], (0, 1, 0, 0);
    /// Look up a variable, forcing promises. `( -- v )`
    Ldvar = 3, "ldvar", [Pool], (0, 1, 0, 0);
    /// Look up `..N` in the `...` binding. `( -- v )`
    Ldddvar = 4, "ldddvar", [Pool], (0, 1, 0, 0);
    /// Bind a symbol in the current environment. `( sym v -- v )`
    Stvar = 5, "stvar", [], (2, 1, 0, 0);

    // ─────────────────────────── Calls & closures ───────────────────────
    /// Call the callee on top of the stack. `( f -- result )`
    Call = 6, "call", [Pool, Pool], (1, 1, 0, 0);
    /// Create a promise over a child code. `( -- p )`
    Promise = 7, "promise", [Child], (0, 1, 0, 0);
    /// Create a closure. `( formals body -- closure )`
    Close = 8, "close", [], (2, 1, 0, 0);
    /// Return the top of the stack. `( v -- )`
    Ret = 9, "ret", [], (1, 0, 0, 0);
    /// Force a promise. `( p -- v )`
    Force = 10, "force", [], (1, 1, 0, 0);
    /// Push a stack-passed argument. `( -- arg )`
    Pusharg = 11, "pusharg", [Arg], (0, 1, 0, 0);
    /// Push the stack-passed argument whose index is on the int stack.
    Pushargi = 12, "pushargi", [], (0, 1, 1, 0);
    /// Replace a promise by the syntax it was created from. `( p -- ast )`
    Asast = 13, "asast", [], (1, 1, 0, 0);

    // ─────────────────────────── Stack operations ───────────────────────
    /// `( v -- )`
    Pop = 14, "pop", [], (1, 0, 0, 0);
    /// `( v -- v v )`
    Dup = 15, "dup", [], (1, 2, 0, 0);

    // ─────────────────────────── Control flow ───────────────────────────
    /// Coerce to a logical scalar. `( v -- bool )`
    Asbool = 16, "asbool", [], (1, 1, 0, 0);
    /// Jump if the popped value is TRUE. `( bool -- )`
    Brtrue = 17, "brtrue", [Jump], (1, 0, 0, 0);
    /// Jump if the popped value is FALSE. `( bool -- )`
    Brfalse = 18, "brfalse", [Jump], (1, 0, 0, 0);
    /// Unconditional jump.
    Br = 19, "br", [Jump], (0, 0, 0, 0);

    // ─────────────────────────── Integer stack ──────────────────────────
    /// `I:( -- n )`
    Pushi = 20, "pushi", [Int], (0, 0, 0, 1);
    /// `I:( n -- n n )`
    Dupi = 21, "dupi", [], (0, 0, 1, 2);
    /// `I:( n -- )`
    Popi = 22, "popi", [], (0, 0, 1, 0);
    /// `I:( n -- n+1 )`
    Inci = 23, "inci", [], (0, 0, 1, 1);
    /// `I:( a b -- )` `( -- a<b )`
    Lti = 24, "lti", [], (0, 1, 2, 0);
    /// `I:( a b -- )` `( -- a==b )`
    Eqi = 25, "eqi", [], (0, 1, 2, 0);

    // ─────────────────────────── Arithmetic ─────────────────────────────
    /// `( a b -- a+b )`
    Add = 26, "add", [], (2, 1, 0, 0);
    /// `( a b -- a-b )`
    Sub = 27, "sub", [], (2, 1, 0, 0);
    /// `( a b -- a<b )`
    Lt = 28, "lt", [], (2, 1, 0, 0);

    // ─────────────────────────── Guards ─────────────────────────────────
    /// Assert a symbol is still bound to a primitive.
    Isspecial = 29, "isspecial", [Pool], (0, 0, 0, 0);
    /// Assert the top of the stack is callable. `( f -- f )`
    Isfun = 30, "isfun", [], (1, 1, 0, 0);
    /// Mark the current result invisible.
    Invisible = 31, "invisible", [], (0, 0, 0, 0);
}

impl Opcode {
    /// Total encoded length of the instruction, opcode byte included.
    pub fn size(self) -> usize {
        1 + self.immediates().len() * IMMEDIATE_SIZE
    }

    pub fn is_jump(self) -> bool {
        matches!(self, Opcode::Br | Opcode::Brtrue | Opcode::Brfalse)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode the opcode at `pc`.
pub fn decode(code: &[u8], pc: usize) -> Result<Opcode, Fault> {
    let byte = *code.get(pc).ok_or(Fault::Truncated { pc })?;
    Opcode::from_byte(byte).ok_or(Fault::UnknownOpcode { byte, pc })
}

fn read_word(code: &[u8], pc: &mut usize) -> Result<[u8; IMMEDIATE_SIZE], Fault> {
    let word = code
        .get(*pc..*pc + IMMEDIATE_SIZE)
        .and_then(|bytes| <[u8; IMMEDIATE_SIZE]>::try_from(bytes).ok())
        .ok_or(Fault::Truncated { pc: *pc })?;
    *pc += IMMEDIATE_SIZE;
    Ok(word)
}

/// Read an unsigned immediate and advance `pc` past it.
pub fn read_u32(code: &[u8], pc: &mut usize) -> Result<u32, Fault> {
    read_word(code, pc).map(u32::from_le_bytes)
}

/// Read a signed immediate and advance `pc` past it.
pub fn read_i32(code: &[u8], pc: &mut usize) -> Result<i32, Fault> {
    read_word(code, pc).map(i32::from_le_bytes)
}

/// Move `pc` to the next instruction without looking at the immediates.
pub fn advance_pc(code: &[u8], pc: usize) -> Result<usize, Fault> {
    let op = decode(code, pc)?;
    let next = pc + op.size();
    if next > code.len() {
        return Err(Fault::Truncated { pc });
    }
    Ok(next)
}

/// Iterator over `(pc, opcode)` pairs of an instruction stream.
///
/// Stops after yielding the first decoding fault.
pub struct Instructions<'a> {
    code: &'a [u8],
    pc: usize,
    failed: bool,
}

pub fn instructions(code: &[u8]) -> Instructions<'_> {
    Instructions {
        code,
        pc: 0,
        failed: false,
    }
}

impl Iterator for Instructions<'_> {
    type Item = Result<(usize, Opcode), Fault>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc >= self.code.len() {
            return None;
        }
        let pc = self.pc;
        match advance_pc(self.code, pc) {
            Ok(next) => {
                self.pc = next;
                // advance_pc already decoded successfully
                Some(decode(self.code, pc).map(|op| (pc, op)))
            }
            Err(fault) => {
                self.failed = true;
                Some(Err(fault))
            }
        }
    }
}
