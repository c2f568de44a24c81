use crate::bytecode::op::{decode, read_i32, read_u32};
use crate::bytecode::{Code, CodeIndex, Function, Opcode};
use crate::lang::env::{Env, Lookup};
use crate::lang::promise::Promise;
use crate::lang::value::{Closure, Kind, Pairlist, Symbol, Value};
use crate::runtime::call::CallSite;
use crate::runtime::host::Host;
use crate::runtime::runtime_error::{ErrorKind, Fault, RuntimeError, error_at};
use crate::runtime::stack::{Frame, FrameStack, Stack};
use std::rc::Rc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct VmConfig {
    pub max_call_depth: usize,
    pub max_steps: Option<usize>,
    /// Compile closures found by `ldfun` whose body is still syntax.
    pub compile_on_demand: bool,
    /// Free operand-stack slots guaranteed on entry to any code object.
    pub min_stack_free: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            max_call_depth: 1000,
            max_steps: None,
            compile_on_demand: true,
            min_stack_free: 64,
        }
    }
}

/// Execution counters, cumulative until [`Vm::reset_stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmStats {
    pub instructions: u64,
    pub calls: u64,
    /// Unconditional jumps.
    pub jumps: u64,
    pub branches_taken: u64,
    pub branches_not_taken: u64,
    pub promises_forced: u64,
}

/// Execution context: the two value stacks, the frame stack and the
/// interpreter-wide flags. Independent contexts may coexist.
pub struct Vm {
    pub(crate) ostack: Stack<Value>,
    pub(crate) istack: Stack<i32>,
    pub(crate) frames: FrameStack,
    pub(crate) config: VmConfig,
    pub(crate) stats: VmStats,
    pub(crate) visible: bool,
    steps: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Self {
            ostack: Stack::new(),
            istack: Stack::new(),
            frames: FrameStack::new(),
            config,
            stats: VmStats::default(),
            visible: true,
            steps: 0,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn stats(&self) -> &VmStats {
        &self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = VmStats::default();
    }

    /// Whether the last result should be printed by a REPL.
    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    /// Current depth of the operand and integer stacks.
    pub fn depth(&self) -> (usize, usize) {
        (self.ostack.len(), self.istack.len())
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    pub fn reset_execution_state(&mut self) {
        self.steps = 0;
        self.visible = true;
    }

    /// Run the body of `function` as a top-level evaluation.
    pub fn run(
        &mut self,
        host: &mut dyn Host,
        function: &Rc<Function>,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        if self.frames.is_empty() {
            self.reset_execution_state();
        }
        self.execute(host, function, 0, env, 0)
    }

    /// Run code `index` of `function` with `args` passed on the operand stack.
    pub fn execute_with_args(
        &mut self,
        host: &mut dyn Host,
        function: &Rc<Function>,
        index: CodeIndex,
        env: &Env,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        let base = self.ostack.len();
        self.ostack.ensure_free(args.len()).map_err(|_| Fault::StackReserve {
            stack: "operand",
            requested: args.len(),
        })?;
        for arg in args {
            self.ostack.push(arg.clone());
        }
        let result = self.execute(host, function, index, env, args.len());
        self.ostack.truncate(base);
        result
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute code `index` of `function` in `env` until `ret`.
    ///
    /// `num_args` values directly below the current top of the operand stack
    /// are the stack-passed arguments read by `pusharg`. On return both
    /// stacks have the depth they had on entry; on error they are truncated
    /// back to it.
    pub fn execute(
        &mut self,
        host: &mut dyn Host,
        function: &Rc<Function>,
        index: CodeIndex,
        env: &Env,
        num_args: usize,
    ) -> Result<Value, RuntimeError> {
        let code = function.code(index).ok_or(Fault::CodeOutOfRange(index))?;

        if self.frames.len() >= self.config.max_call_depth {
            return Err(ErrorKind::CallDepth(self.config.max_call_depth).into());
        }

        let needed = (code.stack_length as usize).max(self.config.min_stack_free);
        self.ostack.ensure_free(needed).map_err(|_| Fault::StackReserve {
            stack: "operand",
            requested: needed,
        })?;
        let needed = code.istack_length as usize;
        self.istack.ensure_free(needed).map_err(|_| Fault::StackReserve {
            stack: "integer",
            requested: needed,
        })?;

        let bp = self.ostack.len();
        let ibp = self.istack.len();
        if num_args > bp {
            return Err(Fault::StackUnderflow.into());
        }

        self.frames.push(Frame {
            function: function.clone(),
            code: index,
            env: env.clone(),
            pc: 0,
            bp,
            ibp,
            num_args,
        });
        debug!(code = index, depth = self.frames.len(), "enter frame");

        let result = match self.exec_code(host, function, code, env) {
            Ok(value) => Ok(value),
            Err(err) => Err(self.annotate(err)),
        };

        self.frames.pop();
        if result.is_err() {
            self.ostack.truncate(bp);
            self.istack.truncate(ibp);
        }
        result
    }

    /// Attach the failing instruction's syntax and, for the innermost frame
    /// that sees the error, the backtrace.
    fn annotate(&self, mut err: RuntimeError) -> RuntimeError {
        if err.call.is_none() {
            err.call = self.current_source();
        }
        if err.call_stack.is_empty() {
            err.call_stack = self.backtrace();
        }
        err
    }

    /// Syntax of the instruction the innermost frame is executing.
    fn current_source(&self) -> Option<Value> {
        let frame = self.frames.top()?;
        let code = frame.function.code(frame.code)?;
        match source_at(&frame.function, code, frame.pc) {
            Ok(Value::Null) | Err(_) => None,
            Ok(src) => Some(src),
        }
    }

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;
        self.stats.instructions += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(ErrorKind::StepLimit(max).into());
            }
        }
        Ok(())
    }

    fn exec_code(
        &mut self,
        host: &mut dyn Host,
        function: &Rc<Function>,
        code: &Code,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let bytes = &code.bytes[..];
        let (bp, ibp, num_args) = match self.frames.top() {
            Some(frame) => (frame.bp, frame.ibp, frame.num_args),
            None => return Err(Fault::StackUnderflow.into()),
        };
        let mut pc: usize = 0;

        loop {
            self.check_limits()?;

            let start = pc;
            if let Some(frame) = self.frames.top_mut() {
                frame.pc = start;
            }
            let op = decode(bytes, pc)?;
            pc += 1;

            match op {
                Opcode::Invalid => return Err(Fault::InvalidInstruction { pc: start }.into()),

                // Loads & stores
                Opcode::Push => {
                    let k = read_u32(bytes, &mut pc)?;
                    let value = function.constant(k)?.clone();
                    self.ostack.push(value);
                }
                Opcode::Ldfun => {
                    let sym = read_symbol(function, bytes, &mut pc, op)?;
                    let fun = self.find_fun(host, &sym, env)?;
                    self.ostack.push(fun);
                }
                Opcode::Ldvar => {
                    let sym = read_symbol(function, bytes, &mut pc, op)?;
                    let value = self.lookup_var(host, &sym, env)?;
                    self.ostack.push(value);
                }
                Opcode::Ldddvar => {
                    let sym = read_symbol(function, bytes, &mut pc, op)?;
                    let value = self.lookup_ddvar(host, &sym, env)?;
                    self.ostack.push(value);
                }
                Opcode::Stvar => {
                    let value = self.pop()?;
                    match self.pop()? {
                        Value::Symbol(sym) => env.define(sym, value.clone()),
                        other => return Err(shape(op, "symbol", &other)),
                    }
                    self.ostack.push(value);
                }

                // Calls & closures
                Opcode::Call => {
                    let args = read_u32(bytes, &mut pc)?;
                    let names = read_u32(bytes, &mut pc)?;
                    let callee = self.pop()?;
                    let call = source_at(function, code, start)?;
                    let site = CallSite {
                        function,
                        code,
                        call: &call,
                        args,
                        names,
                    };
                    let result = self.dispatch(host, &site, callee, env)?;
                    self.ostack.push(result);
                }
                Opcode::Promise => {
                    let offset = read_u32(bytes, &mut pc)?;
                    let index = code.child(offset)?;
                    if function.code(index).is_none() {
                        return Err(Fault::CodeOutOfRange(index).into());
                    }
                    let promise = Promise::new(function.clone(), index, env.clone());
                    self.ostack.push(Value::promise(promise));
                }
                Opcode::Close => {
                    let body = self.pop()?;
                    let formals = match self.pop()? {
                        Value::Null => Pairlist::new(),
                        Value::Pairlist(list) => (*list).clone(),
                        other => return Err(shape(op, "formals", &other)),
                    };
                    let closure = Closure::new(formals, body, env.clone());
                    self.ostack.push(Value::closure(closure));
                }
                Opcode::Ret => {
                    let value = self.pop()?;
                    self.check_balance(bp, ibp)?;
                    return Ok(value);
                }
                Opcode::Force => {
                    let value = match self.pop()? {
                        Value::Promise(p) => self.force(host, &p)?,
                        other => return Err(shape(op, "promise", &other)),
                    };
                    self.ostack.push(value);
                }
                Opcode::Pusharg => {
                    let n = read_u32(bytes, &mut pc)?;
                    let value = self.stack_arg(bp, num_args, n as i64)?;
                    self.ostack.push(value);
                }
                Opcode::Pushargi => {
                    let n = self.popi()?;
                    let value = self.stack_arg(bp, num_args, n as i64)?;
                    self.ostack.push(value);
                }
                Opcode::Asast => {
                    let ast = match self.pop()? {
                        Value::Promise(p) => p.expression().unwrap_or(Value::Null),
                        other => return Err(shape(op, "promise", &other)),
                    };
                    self.ostack.push(ast);
                }

                // Stack operations
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::Dup => {
                    let value = self.ostack.top().cloned().ok_or(Fault::StackUnderflow)?;
                    self.ostack.push(value);
                }

                // Control flow
                Opcode::Asbool => {
                    let value = self.pop()?;
                    let cond = self.as_condition(host, &value)?;
                    self.ostack.push(Value::logical(cond));
                }
                Opcode::Brtrue | Opcode::Brfalse => {
                    let offset = read_i32(bytes, &mut pc)?;
                    let cond = self.pop()?;
                    let taken = match op {
                        Opcode::Brtrue => cond.is_true(),
                        _ => cond.is_false(),
                    };
                    if taken {
                        pc = jump_target(bytes, start, pc, offset)?;
                        self.stats.branches_taken += 1;
                    } else {
                        self.stats.branches_not_taken += 1;
                    }
                }
                Opcode::Br => {
                    let offset = read_i32(bytes, &mut pc)?;
                    pc = jump_target(bytes, start, pc, offset)?;
                    self.stats.jumps += 1;
                }

                // Integer stack
                Opcode::Pushi => {
                    let n = read_i32(bytes, &mut pc)?;
                    self.istack.push(n);
                }
                Opcode::Dupi => {
                    let n = *self.istack.top().ok_or(Fault::IntStackUnderflow)?;
                    self.istack.push(n);
                }
                Opcode::Popi => {
                    self.popi()?;
                }
                Opcode::Inci => {
                    let n = self.popi()?;
                    self.istack.push(n.wrapping_add(1));
                }
                Opcode::Lti | Opcode::Eqi => {
                    let rhs = self.popi()?;
                    let lhs = self.popi()?;
                    let result = match op {
                        Opcode::Lti => lhs < rhs,
                        _ => lhs == rhs,
                    };
                    self.ostack.push(Value::logical(result));
                }

                // Arithmetic
                Opcode::Add | Opcode::Sub | Opcode::Lt => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let result = match scalar_fast_path(op, &lhs, &rhs) {
                        Some(result) => result,
                        None => self.arith_slow_path(host, op, lhs, rhs, env)?,
                    };
                    self.ostack.push(result);
                }

                // Guards
                Opcode::Isspecial => {
                    let sym = read_symbol(function, bytes, &mut pc, op)?;
                    match env.lookup(&sym) {
                        Lookup::Bound(Value::Builtin(_)) | Lookup::Bound(Value::Special(_)) => {}
                        _ => return Err(Fault::NotPrimitive(sym).into()),
                    }
                }
                Opcode::Isfun => {
                    let top = self.ostack.top().ok_or(Fault::StackUnderflow)?;
                    if !top.is_callable() {
                        return Err(ErrorKind::NotCallable(top.kind()).into());
                    }
                }
                Opcode::Invisible => {
                    self.visible = false;
                }
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    pub(crate) fn pop(&mut self) -> Result<Value, Fault> {
        self.ostack.pop().ok_or(Fault::StackUnderflow)
    }

    pub(crate) fn popi(&mut self) -> Result<i32, Fault> {
        self.istack.pop().ok_or(Fault::IntStackUnderflow)
    }

    fn check_balance(&self, bp: usize, ibp: usize) -> Result<(), Fault> {
        if self.ostack.len() != bp {
            return Err(Fault::StackImbalance {
                stack: "operand",
                expected: bp,
                found: self.ostack.len(),
            });
        }
        if self.istack.len() != ibp {
            return Err(Fault::StackImbalance {
                stack: "integer",
                expected: ibp,
                found: self.istack.len(),
            });
        }
        Ok(())
    }

    fn stack_arg(&self, bp: usize, num_args: usize, n: i64) -> Result<Value, Fault> {
        if n < 0 || n as usize >= num_args {
            return Err(Fault::ArgOutOfRange { index: n, num_args });
        }
        self.ostack
            .at(bp - num_args + n as usize)
            .cloned()
            .ok_or(Fault::StackUnderflow)
    }

    /// Report a non-fatal condition to the host. Without a call, the syntax
    /// of the current instruction is looked up.
    pub fn warn(&mut self, host: &mut dyn Host, call: Option<&Value>, message: &str) {
        match call {
            Some(call) if !matches!(call, Value::Null) => host.warning(Some(call), message),
            _ => host.warning(self.current_source().as_ref(), message),
        }
    }

    fn lookup_var(
        &mut self,
        host: &mut dyn Host,
        sym: &Symbol,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let value = match env.lookup(sym) {
            Lookup::Unbound => return Err(ErrorKind::UnboundVariable(sym.clone()).into()),
            Lookup::Bound(Value::Missing) => {
                return Err(ErrorKind::MissingArgument(sym.clone()).into());
            }
            Lookup::Bound(Value::Promise(p)) => self.force(host, &p)?,
            Lookup::Bound(value) => value,
        };
        value.mark_referenced();
        Ok(value)
    }

    fn lookup_ddvar(
        &mut self,
        host: &mut dyn Host,
        sym: &Symbol,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let n = sym.dd_index().ok_or(Fault::TypeShape {
            op: Opcode::Ldddvar,
            expected: "..N symbol",
            found: Kind::Symbol,
        })?;
        let element = match env.lookup(&Symbol::dots()) {
            Lookup::Bound(Value::Dots(list)) => match list.get(n - 1) {
                Some((_, value)) => value.clone(),
                None => return Err(ErrorKind::DotsIndex(n).into()),
            },
            Lookup::Bound(Value::Missing) => return Err(ErrorKind::DotsIndex(n).into()),
            _ => return Err(ErrorKind::NoDots(n).into()),
        };
        let value = match element {
            Value::Missing => return Err(ErrorKind::MissingArgument(sym.clone()).into()),
            Value::Promise(p) => self.force(host, &p)?,
            value => value,
        };
        value.mark_referenced();
        Ok(value)
    }

    /// Function lookup: walks the environment chain skipping bindings that
    /// are not callable, forcing promises on the way.
    pub fn find_fun(
        &mut self,
        host: &mut dyn Host,
        sym: &Symbol,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        for scope in env.ancestors() {
            let value = match scope.get_local(sym) {
                None => continue,
                Some(Value::Missing) => {
                    return Err(ErrorKind::MissingArgument(sym.clone()).into());
                }
                Some(Value::Promise(p)) => self.force(host, &p)?,
                Some(value) => value,
            };
            match &value {
                Value::Closure(closure) => {
                    if self.config.compile_on_demand {
                        ensure_compiled(host, closure)?;
                    }
                    return Ok(value);
                }
                Value::Builtin(_) | Value::Special(_) => return Ok(value),
                _ => continue,
            }
        }
        Err(ErrorKind::UnboundFunction(sym.clone()).into())
    }

    fn as_condition(&mut self, host: &mut dyn Host, value: &Value) -> Result<bool, RuntimeError> {
        let len = value.length();
        if len > 1 {
            self.warn(
                host,
                None,
                "the condition has length > 1 and only the first element will be used",
            );
        }

        let cond = if len > 0 { value.as_logical() } else { None };
        match cond {
            Some(b) => Ok(b),
            None => {
                let message = if len == 0 {
                    "argument is of length zero"
                } else if value.is_logical() {
                    "missing value where TRUE/FALSE needed"
                } else {
                    "argument is not interpretable as logical"
                };
                error_at(ErrorKind::InvalidCondition(message), self.current_source())
            }
        }
    }

    /// `add` / `sub` / `lt` on anything but plain scalars goes through the
    /// host's primitive of the same name. The primitive gets no call syntax;
    /// warnings and errors pick it up from the current instruction.
    fn arith_slow_path(
        &mut self,
        host: &mut dyn Host,
        op: Opcode,
        lhs: Value,
        rhs: Value,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let name = match op {
            Opcode::Add => "+",
            Opcode::Sub => "-",
            _ => "<",
        };
        let id = host
            .find_primitive(name)
            .ok_or_else(|| RuntimeError::new(ErrorKind::UnboundFunction(Symbol::new(name))))?;
        let mut args = Pairlist::new();
        args.push(None, lhs);
        args.push(None, rhs);
        self.call_primitive(host, id, &Value::Null, args, env)
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// One line per active frame, outermost first: the code's unit syntax and
    /// the names bound in its environment.
    pub fn backtrace(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .frames
            .iter()
            .map(|frame| {
                let src = frame
                    .function
                    .code(frame.code)
                    .and_then(|code| frame.function.sources.get(code.src))
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                let names: Vec<String> =
                    frame.env.names().iter().map(|s| s.to_string()).collect();
                format!("{}  [env: {}]", src, names.join(" "))
            })
            .collect();
        lines.reverse();
        lines
    }
}

// =============================================================================
// Free helpers
// =============================================================================

/// Source syntax of the instruction starting at `pc`.
pub fn source_at(function: &Function, code: &Code, pc: usize) -> Result<Value, Fault> {
    let slot = code.source_slot(pc)?;
    function.source(slot).cloned()
}

fn read_symbol(
    function: &Function,
    bytes: &[u8],
    pc: &mut usize,
    op: Opcode,
) -> Result<Symbol, Fault> {
    let k = read_u32(bytes, pc)?;
    match function.constant(k)? {
        Value::Symbol(sym) => Ok(sym.clone()),
        other => Err(Fault::TypeShape {
            op,
            expected: "symbol",
            found: other.kind(),
        }),
    }
}

fn shape(op: Opcode, expected: &'static str, found: &Value) -> RuntimeError {
    Fault::TypeShape {
        op,
        expected,
        found: found.kind(),
    }
    .into()
}

/// Jumps are relative to the end of the jump instruction.
fn jump_target(bytes: &[u8], start: usize, next: usize, offset: i32) -> Result<usize, Fault> {
    let target = next as i64 + offset as i64;
    if target < 0 || target as usize >= bytes.len() {
        return Err(Fault::JumpOutOfRange { pc: start, target });
    }
    Ok(target as usize)
}

fn scalar_fast_path(op: Opcode, lhs: &Value, rhs: &Value) -> Option<Value> {
    let (x, y) = match (lhs.as_int_scalar(), rhs.as_int_scalar()) {
        (Some(a), Some(b)) => {
            let result = match op {
                Opcode::Add => Value::int(a.checked_add(b)?),
                Opcode::Sub => Value::int(a.checked_sub(b)?),
                _ => return Some(Value::logical(a < b)),
            };
            result.mark_referenced();
            return Some(result);
        }
        _ => (scalar_real(lhs)?, scalar_real(rhs)?),
    };
    let result = match op {
        Opcode::Add => Value::real(x + y),
        Opcode::Sub => Value::real(x - y),
        _ if x.is_nan() || y.is_nan() => Value::na_logical(),
        _ => Value::logical(x < y),
    };
    result.mark_referenced();
    Some(result)
}

/// A length-one double or non-NA integer as `f64`, nothing else.
fn scalar_real(value: &Value) -> Option<f64> {
    value
        .as_real_scalar()
        .or_else(|| value.as_int_scalar().map(f64::from))
}

fn ensure_compiled(host: &mut dyn Host, closure: &Rc<Closure>) -> Result<(), RuntimeError> {
    if closure.compiled().is_some() {
        return Ok(());
    }
    if let Some(compiled) = host.compile(&closure.body()) {
        let function = compiled?;
        trace!("compiled closure on demand");
        closure.set_body(Value::Code(function));
    }
    Ok(())
}
