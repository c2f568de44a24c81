use crate::bytecode::{Code, Function, MISSING_ARG, Opcode, PoolIndex};
use crate::lang::env::{Env, Lookup};
use crate::lang::promise::Promise;
use crate::lang::value::{Kind, Pairlist, PrimitiveId, Symbol, Value, Vector};
use crate::runtime::host::{Host, Visibility};
use crate::runtime::runtime_error::{ErrorKind, Fault, RuntimeError};
use crate::runtime::vm_bc::Vm;
use std::rc::Rc;
use tracing::trace;

/// Everything a `call` instruction knows about its call site.
pub struct CallSite<'a> {
    pub function: &'a Rc<Function>,
    pub code: &'a Code,
    /// Call syntax from the source pool.
    pub call: &'a Value,
    /// Constant: integer vector of child offsets.
    pub args: PoolIndex,
    /// Constant: string vector of names, or the `Null` sentinel.
    pub names: PoolIndex,
}

/// Decoded argument descriptors of a call site.
struct ArgSpec<'a> {
    offsets: &'a [Option<i32>],
    names: Option<&'a [Option<Rc<str>>]>,
}

impl<'a> ArgSpec<'a> {
    fn decode(site: &CallSite<'a>) -> Result<Self, Fault> {
        let offsets = match site.function.constant(site.args)? {
            Value::Data(d) => match d.vector() {
                Vector::Integer(offsets) => offsets.as_slice(),
                _ => return Err(call_shape("integer offsets", Kind::Data)),
            },
            other => return Err(call_shape("integer offsets", other.kind())),
        };
        let names = match site.function.constant(site.names)? {
            Value::Null => None,
            Value::Data(d) => match d.vector() {
                Vector::Str(names) => Some(names.as_slice()),
                _ => return Err(call_shape("argument names", Kind::Data)),
            },
            other => return Err(call_shape("argument names", other.kind())),
        };
        Ok(Self { offsets, names })
    }

    fn len(&self) -> usize {
        self.offsets.len()
    }

    fn offset(&self, i: usize) -> i32 {
        self.offsets[i].unwrap_or(MISSING_ARG)
    }

    /// Name of argument `i`; `""` and NA mean unnamed.
    fn name(&self, i: usize) -> Option<&'a str> {
        self.names?
            .get(i)?
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    fn is_dots(&self, i: usize) -> bool {
        self.name(i) == Some("...")
    }
}

fn call_shape(expected: &'static str, found: Kind) -> Fault {
    Fault::TypeShape {
        op: Opcode::Call,
        expected,
        found,
    }
}

/// Elements of the `...` binding visible from `env`, empty if there is none.
fn dots_elements(env: &Env) -> Option<Rc<Pairlist>> {
    match env.lookup(&Symbol::dots()) {
        Lookup::Bound(Value::Dots(list)) => Some(list),
        _ => None,
    }
}

impl Vm {
    /// Perform a call according to the callee's kind.
    ///
    /// Specials get the raw argument syntax, builtins evaluated arguments,
    /// closures promises. The operand and integer stacks have the same depth
    /// before and after.
    pub(crate) fn dispatch(
        &mut self,
        host: &mut dyn Host,
        site: &CallSite<'_>,
        callee: Value,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let depth = self.depth();
        self.stats.calls += 1;
        trace!(callee = %callee.kind(), "call {}", site.call);

        let result = match &callee {
            Value::Special(id) => {
                let syntax = match site.call {
                    Value::Lang(lang) => lang.args.clone(),
                    other => return Err(call_shape("call syntax", other.kind()).into()),
                };
                self.call_primitive(host, *id, site.call, syntax, env)?
            }
            Value::Builtin(id) => {
                let args = self.eager_args(host, site, env)?;
                self.call_primitive(host, *id, site.call, args, env)?
            }
            Value::Closure(closure) => {
                let args = self.lazy_args(site, env)?;
                self.visible = true;
                host.apply_closure(self, site.call, closure, args, env)?
            }
            other => {
                return Err(RuntimeError::new(ErrorKind::NotCallable(other.kind()))
                    .with_call(site.call.clone()));
            }
        };

        let (ostack, istack) = self.depth();
        if ostack != depth.0 {
            return Err(Fault::StackImbalance {
                stack: "operand",
                expected: depth.0,
                found: ostack,
            }
            .into());
        }
        if istack != depth.1 {
            return Err(Fault::StackImbalance {
                stack: "integer",
                expected: depth.1,
                found: istack,
            }
            .into());
        }
        Ok(result)
    }

    /// Invoke primitive `id`, checking its arity and applying its visibility
    /// flag before the call and, unless it decides itself, after.
    pub fn call_primitive(
        &mut self,
        host: &mut dyn Host,
        id: PrimitiveId,
        call: &Value,
        args: Pairlist,
        env: &Env,
    ) -> Result<Value, RuntimeError> {
        let entry = host.primitive(id).ok_or(Fault::UnknownPrimitive(id.0))?;
        if entry.arity >= 0 && args.len() != entry.arity as usize {
            return Err(RuntimeError::new(ErrorKind::Arity {
                name: entry.name,
                expected: entry.arity as usize,
                found: args.len(),
            })
            .with_call(call.clone()));
        }

        self.visible = entry.visibility != Visibility::Off;
        let result = (entry.fun)(self, host, call, args, env).map_err(|e| e.with_call(call.clone()))?;
        if entry.visibility != Visibility::Decides {
            self.visible = entry.visibility != Visibility::Off;
        }
        Ok(result)
    }

    /// Evaluate every argument now, left to right. `...` is flattened with
    /// each element forced and keeping its name.
    fn eager_args(
        &mut self,
        host: &mut dyn Host,
        site: &CallSite<'_>,
        env: &Env,
    ) -> Result<Pairlist, RuntimeError> {
        let spec = ArgSpec::decode(site)?;
        let mut args = Pairlist::new();

        for i in 0..spec.len() {
            if spec.is_dots(i) {
                let Some(dots) = dots_elements(env) else {
                    continue;
                };
                for (tag, element) in dots.iter() {
                    let value = match element {
                        Value::Promise(p) => self.force(host, p)?,
                        Value::Missing => {
                            return Err(RuntimeError::new(ErrorKind::EmptyArgument(args.len() + 1))
                                .with_call(site.call.clone()));
                        }
                        other => other.clone(),
                    };
                    args.push(tag.clone(), value);
                }
                continue;
            }

            let offset = spec.offset(i);
            if offset == MISSING_ARG {
                return Err(RuntimeError::new(ErrorKind::EmptyArgument(i + 1))
                    .with_call(site.call.clone()));
            }
            let index = site.code.child(offset as u32)?;
            let value = self.execute(host, site.function, index, env, 0)?;
            args.push(spec.name(i).map(Symbol::new), value);
        }
        Ok(args)
    }

    /// Wrap every argument in a promise. A call site without names passes
    /// its arguments positionally and does not forward `...`.
    ///
    /// Each `...` element becomes a fresh promise: a delegate for a promise,
    /// an already forced one for a plain value. Empty elements stay missing.
    fn lazy_args(&mut self, site: &CallSite<'_>, env: &Env) -> Result<Pairlist, RuntimeError> {
        let spec = ArgSpec::decode(site)?;
        let mut args = Pairlist::new();

        for i in 0..spec.len() {
            if spec.names.is_some() && spec.is_dots(i) {
                let Some(dots) = dots_elements(env) else {
                    continue;
                };
                for (tag, element) in dots.iter() {
                    let value = match element {
                        Value::Promise(p) => Value::promise(Promise::delegate(p.clone())),
                        Value::Missing => Value::Missing,
                        other => Value::promise(Promise::forced(other.clone())),
                    };
                    args.push(tag.clone(), value);
                }
                continue;
            }

            let offset = spec.offset(i);
            if offset == MISSING_ARG {
                args.push(None, Value::Missing);
                continue;
            }
            let index = site.code.child(offset as u32)?;
            if site.function.code(index).is_none() {
                return Err(Fault::CodeOutOfRange(index).into());
            }
            let promise = Promise::new(site.function.clone(), index, env.clone());
            args.push(spec.name(i).map(Symbol::new), Value::promise(promise));
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::stream::{CodeStream, FunctionBuilder};
    use crate::lang::value::Closure;
    use crate::runtime::host::{PrimitiveEntry, StdHost};
    use std::cell::RefCell;

    thread_local! {
        static SEEN: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// Builtin recording `name=value` for each argument it receives.
    fn record(
        _vm: &mut Vm,
        _host: &mut dyn Host,
        _call: &Value,
        args: Pairlist,
        _env: &Env,
    ) -> Result<Value, RuntimeError> {
        let items: Vec<String> = args
            .iter()
            .map(|(tag, v)| {
                let name = tag.as_ref().map(|t| t.to_string()).unwrap_or_default();
                format!("{}={}", name, v)
            })
            .collect();
        SEEN.with(|seen| seen.borrow_mut().extend(items));
        Ok(Value::Null)
    }

    fn host_with_record() -> StdHost {
        let mut host = StdHost::new();
        host.register(PrimitiveEntry {
            name: "record",
            arity: -1,
            visibility: Visibility::Decides,
            special: false,
            fun: record,
        });
        host
    }

    fn seen() -> Vec<String> {
        SEEN.with(|seen| std::mem::take(&mut *seen.borrow_mut()))
    }

    fn lang(fun: &str, args: &[(Option<&str>, Value)]) -> Value {
        let list = args
            .iter()
            .map(|(n, v)| (n.map(Symbol::new), v.clone()))
            .collect();
        Value::lang(Value::symbol(fun), list)
    }

    fn call_function(fun: &str, args: &[(Option<&str>, Value)]) -> Rc<Function> {
        call_site(fun, args).0
    }

    /// `fun(<args>)` where each argument is a constant child, plus the
    /// call's args and names constants.
    fn call_site(fun: &str, args: &[(Option<&str>, Value)]) -> (Rc<Function>, PoolIndex, PoolIndex) {
        let mut fb = FunctionBuilder::new();
        let call_src = fb.source(lang(fun, args));
        let mut offsets = Vec::new();
        let mut cs = CodeStream::new(call_src);

        for (name, value) in args {
            if *name == Some("...") {
                offsets.push((*name, MISSING_ARG));
                continue;
            }
            let src = fb.source(value.clone());
            let k = fb.constant(value.clone());
            let mut arg = CodeStream::new(src);
            arg.push(k).ret();
            let index = fb.add_code(arg.finish().unwrap());
            offsets.push((*name, cs.child(index) as i32));
        }

        let (args_k, names_k) = fb.call_consts(&offsets);
        let sym = fb.symbol(fun);
        cs.ldfun(sym).with_source(call_src).call(args_k, names_k).ret();
        fb.install(0, cs.finish().unwrap());
        (Rc::new(fb.finish().unwrap()), args_k, names_k)
    }

    #[test]
    fn test_builtin_evaluates_left_to_right_with_names() {
        let mut host = host_with_record();
        let env = host.base_env();
        let f = call_function(
            "record",
            &[(None, Value::real(1.0)), (Some("b"), Value::string("x"))],
        );
        let mut vm = Vm::new();
        vm.run(&mut host, &f, &env).unwrap();
        assert_eq!(seen(), vec!["=1".to_string(), "b=\"x\"".to_string()]);
        assert_eq!(vm.depth(), (0, 0));
    }

    #[test]
    fn test_special_receives_raw_syntax() {
        let mut host = StdHost::new();
        let env = host.base_env();
        let f = call_function("quote", &[(None, Value::symbol("undefined_thing"))]);
        let mut vm = Vm::new();
        let v = vm.run(&mut host, &f, &env).unwrap();
        assert_eq!(v, Value::symbol("undefined_thing"));
    }

    #[test]
    fn test_builtin_arity_is_checked() {
        let mut host = StdHost::new();
        let env = host.base_env();
        let f = call_function("length", &[(None, Value::real(1.0)), (None, Value::real(2.0))]);
        let mut vm = Vm::new();
        let err = vm.run(&mut host, &f, &env).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::Arity { name: "length", expected: 1, found: 2 }));
        assert_eq!(vm.depth(), (0, 0));
    }

    #[test]
    fn test_visibility_flags() {
        let mut host = StdHost::new();
        let env = host.base_env();
        let mut vm = Vm::new();

        let f = call_function("invisible", &[(None, Value::real(1.0))]);
        vm.run(&mut host, &f, &env).unwrap();
        assert!(!vm.visible());

        let f = call_function("identity", &[(None, Value::real(1.0))]);
        vm.run(&mut host, &f, &env).unwrap();
        assert!(vm.visible());
    }

    #[test]
    fn test_decides_keeps_primitive_choice() {
        fn hide(
            vm: &mut Vm,
            _host: &mut dyn Host,
            _call: &Value,
            _args: Pairlist,
            _env: &Env,
        ) -> Result<Value, RuntimeError> {
            vm.set_visible(false);
            Ok(Value::Null)
        }
        let mut host = StdHost::new();
        host.register(PrimitiveEntry {
            name: "hide",
            arity: 0,
            visibility: Visibility::Decides,
            special: false,
            fun: hide,
        });
        let env = host.base_env();
        let f = call_function("hide", &[]);
        let mut vm = Vm::new();
        vm.run(&mut host, &f, &env).unwrap();
        assert!(!vm.visible());
    }

    #[test]
    fn test_non_callable_callee() {
        let mut fb = FunctionBuilder::new();
        let src = fb.source(lang("x", &[]));
        let k = fb.constant(Value::real(3.0));
        let (args, names) = fb.call_consts(&[]);
        let mut cs = CodeStream::new(src);
        cs.push(k).call(args, names).ret();
        fb.install(0, cs.finish().unwrap());
        let f = Rc::new(fb.finish().unwrap());

        let mut host = StdHost::new();
        let mut vm = Vm::new();
        let err = vm.run(&mut host, &f, &Env::new()).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::NotCallable(Kind::Data)));
        assert_eq!(err.call, Some(lang("x", &[])));
        assert_eq!(vm.depth(), (0, 0));
    }

    #[test]
    fn test_closure_args_are_promises() {
        // g <- function(...) NULL; g(a = 1, 2): the closure sees two
        // unforced promises
        let mut host = StdHost::new();
        let env = host.base_env();

        let mut body = FunctionBuilder::new();
        let mut cs = CodeStream::new(0);
        cs.push(0).ret();
        body.install(0, cs.finish().unwrap());
        let mut formals = Pairlist::new();
        formals.push(Some(Symbol::dots()), Value::Missing);
        let closure = Rc::new(Closure::new(
            formals,
            Value::Code(Rc::new(body.finish().unwrap())),
            env.clone(),
        ));
        env.define(Symbol::new("g"), Value::Closure(closure.clone()));

        let (f, args_k, names_k) =
            call_site("g", &[(Some("a"), Value::real(1.0)), (None, Value::real(2.0))]);
        let mut vm = Vm::new();
        let call = lang("g", &[]);
        let site = CallSite {
            function: &f,
            code: &f.codes[0],
            call: &call,
            args: args_k,
            names: names_k,
        };
        let args = vm.lazy_args(&site, &env).unwrap();
        assert_eq!(args.names(), vec!["a", "", "b"]);
        for (_, v) in args.iter() {
            match v {
                Value::Promise(p) => assert!(!p.is_forced()),
                other => panic!("expected promise, got {:?}", other),
            }
        }
        assert_eq!(vm.run(&mut host, &f, &env).unwrap(), Value::Null);
    }

    #[test]
    fn test_dots_reach_builtin_in_order() {
        // f <- function(...) record(...); f(x = 1, 2, y = 3)
        let mut host = host_with_record();
        let env = host.base_env();
        let inner = call_function("record", &[(Some("..."), Value::symbol("..."))]);
        let mut formals = Pairlist::new();
        formals.push(Some(Symbol::dots()), Value::Missing);
        let f = Closure::new(formals, Value::Code(inner), env.clone());
        env.define(Symbol::new("f"), Value::closure(f));

        let outer = call_function(
            "f",
            &[
                (Some("x"), Value::real(1.0)),
                (None, Value::real(2.0)),
                (Some("y"), Value::real(3.0)),
            ],
        );
        let mut vm = Vm::new();
        vm.run(&mut host, &outer, &env).unwrap();
        assert_eq!(seen(), vec!["x=1", "=2", "y=3"]);
        assert_eq!(vm.stats().calls, 2);
        assert_eq!(vm.stats().promises_forced, 3);
    }

    #[test]
    fn test_dots_forwarded_to_closure_as_delegates() {
        let env = Env::new();
        let shared = Rc::new(Promise::forced(Value::int(1)));
        let mut dots = Pairlist::new();
        dots.push(Some(Symbol::new("a")), Value::Promise(shared.clone()));
        dots.push(None, Value::int(2));
        dots.push(Some(Symbol::new("b")), Value::Missing);
        env.define(Symbol::dots(), Value::Dots(Rc::new(dots)));

        let (f, args_k, names_k) = call_site("g", &[(Some("..."), Value::symbol("..."))]);
        let call = lang("g", &[]);
        let site = CallSite {
            function: &f,
            code: &f.codes[0],
            call: &call,
            args: args_k,
            names: names_k,
        };
        let mut vm = Vm::new();
        let args = vm.lazy_args(&site, &env).unwrap();
        assert_eq!(args.names(), vec!["a", ""]);
        match args.get(0) {
            Some((_, Value::Promise(p))) => match p.code() {
                crate::lang::promise::PromiseCode::Delegate(inner) => {
                    assert!(Rc::ptr_eq(inner, &shared))
                }
                other => panic!("expected delegate, got {:?}", other),
            },
            other => panic!("expected promise, got {:?}", other),
        }
        match args.get(1) {
            Some((_, Value::Promise(p))) => {
                assert_eq!(p.value(), Some(Value::int(2)));
                assert!(p.env().is_none());
            }
            other => panic!("expected promise, got {:?}", other),
        }
        assert!(matches!(args.get(2), Some((_, Value::Missing))));
    }

    #[test]
    fn test_empty_argument_to_builtin() {
        let mut fb = FunctionBuilder::new();
        let src = fb.source(lang("c", &[]));
        let (args, names) = fb.call_consts(&[(None, MISSING_ARG)]);
        let sym = fb.symbol("c");
        let mut cs = CodeStream::new(src);
        cs.ldfun(sym).call(args, names).ret();
        fb.install(0, cs.finish().unwrap());
        let f = Rc::new(fb.finish().unwrap());

        let mut host = StdHost::new();
        let env = host.base_env();
        let mut vm = Vm::new();
        let err = vm.run(&mut host, &f, &env).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::EmptyArgument(1)));
    }
}
