use crate::bytecode::Function;
use crate::lang::env::Env;
use crate::lang::promise::Promise;
use crate::lang::value::{Closure, Pairlist, PrimitiveId, Symbol, Value};
use crate::runtime::primitives;
use crate::runtime::runtime_error::{ErrorKind, RuntimeError};
use crate::runtime::vm_bc::Vm;
use std::collections::HashMap;
use std::rc::Rc;
use tracing::{debug, warn};

/// Native implementation of a primitive.
///
/// Receives the call syntax, the argument list (raw syntax for specials,
/// evaluated values for builtins) and the calling environment.
pub type PrimFn =
    fn(&mut Vm, &mut dyn Host, &Value, Pairlist, &Env) -> Result<Value, RuntimeError>;

/// How a primitive affects the visibility of its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Result is visible.
    On,
    /// Result is invisible, e.g. `invisible()`.
    Off,
    /// The primitive sets visibility itself.
    Decides,
}

#[derive(Clone, Copy)]
pub struct PrimitiveEntry {
    pub name: &'static str,
    /// Required argument count, -1 for any.
    pub arity: i32,
    pub visibility: Visibility,
    /// Specials receive unevaluated syntax.
    pub special: bool,
    pub fun: PrimFn,
}

impl std::fmt::Debug for PrimitiveEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveEntry")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("visibility", &self.visibility)
            .field("special", &self.special)
            .finish()
    }
}

/// Everything the interpreter needs from the surrounding object system.
pub trait Host {
    fn primitive(&self, id: PrimitiveId) -> Option<PrimitiveEntry>;

    fn find_primitive(&self, name: &str) -> Option<PrimitiveId>;

    /// Bind `args` to the closure's formals and run its body.
    fn apply_closure(
        &mut self,
        vm: &mut Vm,
        call: &Value,
        closure: &Rc<Closure>,
        args: Pairlist,
        env: &Env,
    ) -> Result<Value, RuntimeError>;

    /// Compile a closure body. `None` when no compiler is available.
    fn compile(&mut self, _body: &Value) -> Option<Result<Rc<Function>, RuntimeError>> {
        None
    }

    fn warning(&mut self, call: Option<&Value>, message: &str) {
        match call {
            Some(call) => warn!("warning in {}: {}", call, message),
            None => warn!("warning: {}", message),
        }
    }
}

pub type Compiler = Box<dyn FnMut(&Value) -> Result<Rc<Function>, RuntimeError>>;

/// Reference host: a primitive table, a base environment and R-style
/// argument matching.
pub struct StdHost {
    primitives: Vec<PrimitiveEntry>,
    by_name: HashMap<&'static str, PrimitiveId>,
    compiler: Option<Compiler>,
    warnings: Vec<String>,
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new()
    }
}

impl StdHost {
    /// A host with the base primitives registered.
    pub fn new() -> Self {
        let mut host = Self::empty();
        for entry in primitives::BASE {
            host.register(*entry);
        }
        host
    }

    pub fn empty() -> Self {
        Self {
            primitives: Vec::new(),
            by_name: HashMap::new(),
            compiler: None,
            warnings: Vec::new(),
        }
    }

    /// Add a primitive; a later entry with the same name shadows earlier ones.
    pub fn register(&mut self, entry: PrimitiveEntry) -> PrimitiveId {
        let id = PrimitiveId(self.primitives.len() as u16);
        self.primitives.push(entry);
        self.by_name.insert(entry.name, id);
        id
    }

    pub fn set_compiler(&mut self, compiler: Compiler) {
        self.compiler = Some(compiler);
    }

    /// A fresh top-level environment binding every primitive by name.
    pub fn base_env(&self) -> Env {
        let env = Env::new();
        for (name, id) in &self.by_name {
            let value = if self.primitives[id.0 as usize].special {
                Value::Special(*id)
            } else {
                Value::Builtin(*id)
            };
            env.define(Symbol::new(name), value);
        }
        env
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}

impl Host for StdHost {
    fn primitive(&self, id: PrimitiveId) -> Option<PrimitiveEntry> {
        self.primitives.get(id.0 as usize).copied()
    }

    fn find_primitive(&self, name: &str) -> Option<PrimitiveId> {
        self.by_name.get(name).copied()
    }

    fn apply_closure(
        &mut self,
        vm: &mut Vm,
        call: &Value,
        closure: &Rc<Closure>,
        args: Pairlist,
        _env: &Env,
    ) -> Result<Value, RuntimeError> {
        let function = match closure.compiled() {
            Some(function) => function,
            None => {
                let function = match self.compile(&closure.body()) {
                    Some(compiled) => compiled?,
                    None => return Err(RuntimeError::new(ErrorKind::NotCompiled).with_call(call.clone())),
                };
                closure.set_body(Value::Code(function.clone()));
                function
            }
        };

        let new_env = closure.env.child();
        match_args(&closure.formals, args, &new_env).map_err(|e| e.with_call(call.clone()))?;
        debug!("apply closure {}", call);
        vm.execute(self, &function, 0, &new_env, 0)
    }

    fn compile(&mut self, body: &Value) -> Option<Result<Rc<Function>, RuntimeError>> {
        self.compiler.as_mut().map(|compile| compile(body))
    }

    fn warning(&mut self, call: Option<&Value>, message: &str) {
        let text = match call {
            Some(call) => format!("In {} : {}", call, message),
            None => message.to_string(),
        };
        warn!("{}", text);
        self.warnings.push(text);
    }
}

// =============================================================================
// Argument matching
// =============================================================================

/// Bind supplied arguments to formals in `env`.
///
/// Exact names first, then positional for the formals before `...`, then
/// everything left into `...`. A formal left unbound gets its default
/// (compiled defaults become promises evaluated in `env`) or the missing
/// sentinel.
pub fn match_args(formals: &Pairlist, supplied: Pairlist, env: &Env) -> Result<(), RuntimeError> {
    let names: Vec<Option<&Symbol>> = formals.iter().map(|(n, _)| n.as_ref()).collect();
    let dots_at = names.iter().position(|n| n.is_some_and(Symbol::is_dots));

    let supplied: Vec<(Option<Symbol>, Value)> = supplied.into_iter().collect();
    let mut bound: Vec<Option<Value>> = vec![None; names.len()];
    let mut used = vec![false; supplied.len()];

    // exact names
    for (i, (tag, value)) in supplied.iter().enumerate() {
        let Some(tag) = tag else { continue };
        let slot = names
            .iter()
            .position(|n| *n == Some(tag) && !tag.is_dots());
        if let Some(slot) = slot {
            if bound[slot].is_some() {
                return Err(RuntimeError::primitive(format!(
                    "formal argument \"{}\" matched by multiple actual arguments",
                    tag
                )));
            }
            bound[slot] = Some(value.clone());
            used[i] = true;
        }
    }

    // positional, up to `...`
    let positional_end = dots_at.unwrap_or(names.len());
    let mut next = 0;
    for (i, (tag, value)) in supplied.iter().enumerate() {
        if used[i] || tag.is_some() {
            continue;
        }
        while next < positional_end && bound[next].is_some() {
            next += 1;
        }
        if next == positional_end {
            break;
        }
        bound[next] = Some(value.clone());
        used[i] = true;
    }

    let rest: Pairlist = supplied
        .iter()
        .zip(&used)
        .filter(|(_, used)| !**used)
        .map(|((tag, value), _)| (tag.clone(), value.clone()))
        .collect();

    match dots_at {
        Some(slot) => bound[slot] = Some(Value::Dots(Rc::new(rest))),
        None if !rest.is_empty() => {
            let listed: Vec<String> = rest.iter().map(|(tag, v)| describe_arg(tag, v)).collect();
            return Err(ErrorKind::UnusedArgument(listed.join(", ")).into());
        }
        None => {}
    }

    for ((name, default), value) in formals.iter().zip(bound) {
        let Some(name) = name else { continue };
        let value = match value {
            Some(Value::Missing) | None => default_value(default, env),
            Some(value) => value,
        };
        env.define(name.clone(), value);
    }
    Ok(())
}

fn default_value(default: &Value, env: &Env) -> Value {
    match default {
        Value::Code(function) => Value::promise(Promise::new(function.clone(), 0, env.clone())),
        other => other.clone(),
    }
}

fn describe_arg(tag: &Option<Symbol>, value: &Value) -> String {
    let text = match value {
        Value::Promise(p) => p.expression().map(|e| e.to_string()).unwrap_or_default(),
        other => other.to_string(),
    };
    match tag {
        Some(tag) => format!("{} = {}", tag, text),
        None => text,
    }
}
