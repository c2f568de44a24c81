use crate::bytecode::Opcode;
use crate::lang::promise::{Promise, PromiseCode, PromiseState};
use crate::lang::value::{Kind, Value};
use crate::runtime::host::Host;
use crate::runtime::runtime_error::{ErrorKind, Fault, RuntimeError};
use crate::runtime::vm_bc::Vm;
use std::rc::Rc;
use tracing::debug;

impl Vm {
    /// Force `promise`, evaluating it at most once.
    ///
    /// A promise found mid-evaluation is a cycle and raises
    /// [`ErrorKind::RecursiveForce`]. If evaluation fails the promise goes
    /// back to unforced so a later force retries it.
    pub fn force(&mut self, host: &mut dyn Host, promise: &Rc<Promise>) -> Result<Value, RuntimeError> {
        match promise.state() {
            PromiseState::Forced(value) => {
                value.mark_shared();
                return Ok(value);
            }
            PromiseState::Forcing => {
                let mut err = RuntimeError::new(ErrorKind::RecursiveForce);
                err.call = promise.expression();
                return Err(err);
            }
            PromiseState::Unforced => {}
        }

        if !promise.begin() {
            return Err(ErrorKind::RecursiveForce.into());
        }
        self.stats.promises_forced += 1;

        match self.evaluate(host, promise) {
            Ok(value) => {
                value.mark_shared();
                Ok(promise.finish(value))
            }
            Err(err) => {
                promise.abandon();
                Err(err)
            }
        }
    }

    fn evaluate(&mut self, host: &mut dyn Host, promise: &Promise) -> Result<Value, RuntimeError> {
        match promise.code() {
            PromiseCode::Compiled { function, index } => {
                let env = promise.env().ok_or(Fault::TypeShape {
                    op: Opcode::Force,
                    expected: "promise environment",
                    found: Kind::Null,
                })?;
                debug!(code = *index, "force promise");
                self.execute(host, function, *index, &env, 0)
            }
            PromiseCode::Delegate(inner) => self.force(host, inner),
            PromiseCode::Eager(value) => Ok(value.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Function;
    use crate::bytecode::stream::{CodeStream, FunctionBuilder};
    use crate::lang::env::{Env, Lookup};
    use crate::lang::value::{Pairlist, Symbol};
    use crate::runtime::host::StdHost;

    fn lang(fun: &str, args: &[Value]) -> Value {
        let list: Pairlist = args.iter().map(|v| (None, v.clone())).collect();
        Value::lang(Value::symbol(fun), list)
    }

    /// Function whose code 1 is `count <- count + 1`.
    fn counter() -> Rc<Function> {
        let mut fb = FunctionBuilder::new();
        let incr = lang("+", &[Value::symbol("count"), Value::real(1.0)]);
        let src = fb.source(lang("<-", &[Value::symbol("count"), incr]));
        let count = fb.symbol("count");
        let one = fb.constant(Value::real(1.0));

        let mut cs = CodeStream::new(src);
        cs.push(count).ldvar(count).push(one).op(Opcode::Add).op(Opcode::Stvar).ret();
        let index = fb.add_code(cs.finish().unwrap());
        assert_eq!(index, 1);

        let mut body = CodeStream::new(0);
        body.push(0).ret();
        fb.install(0, body.finish().unwrap());
        Rc::new(fb.finish().unwrap())
    }

    fn count(env: &Env) -> Value {
        match env.lookup(&Symbol::new("count")) {
            Lookup::Bound(v) => v,
            Lookup::Unbound => panic!("count unbound"),
        }
    }

    #[test]
    fn test_force_evaluates_once() {
        let f = counter();
        let env = Env::new();
        env.define(Symbol::new("count"), Value::real(0.0));
        let p = Rc::new(Promise::new(f, 1, env.clone()));

        let mut host = StdHost::new();
        let mut vm = Vm::new();
        let first = vm.force(&mut host, &p).unwrap();
        let second = vm.force(&mut host, &p).unwrap();
        assert_eq!(first, Value::real(1.0));
        assert!(first.ptr_eq(&second));
        assert_eq!(count(&env), Value::real(1.0));
        assert!(p.env().is_none());
        assert_eq!(vm.stats().promises_forced, 1);
        assert_eq!(p.value().map(|v| v.named()), Some(2));
    }

    #[test]
    fn test_recursive_force_is_an_error() {
        // x is bound to a promise whose code reads x
        let mut fb = FunctionBuilder::new();
        let src = fb.source(Value::symbol("x"));
        let x = fb.symbol("x");
        let mut cs = CodeStream::new(src);
        cs.ldvar(x).ret();
        let index = fb.add_code(cs.finish().unwrap());
        let mut body = CodeStream::new(0);
        body.push(0).ret();
        fb.install(0, body.finish().unwrap());
        let f = Rc::new(fb.finish().unwrap());

        let env = Env::new();
        let p = Rc::new(Promise::new(f, index, env.clone()));
        env.define(Symbol::new("x"), Value::Promise(p.clone()));

        let mut host = StdHost::new();
        let mut vm = Vm::new();
        let err = vm.force(&mut host, &p).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RecursiveForce));
        assert_eq!(err.call, Some(Value::symbol("x")));
        assert!(matches!(p.state(), PromiseState::Unforced));
        assert_eq!(vm.depth(), (0, 0));
        assert_eq!(vm.frame_depth(), 0);
    }

    #[test]
    fn test_failed_force_can_be_retried() {
        let mut fb = FunctionBuilder::new();
        let src = fb.source(Value::symbol("y"));
        let y = fb.symbol("y");
        let mut cs = CodeStream::new(src);
        cs.ldvar(y).ret();
        let index = fb.add_code(cs.finish().unwrap());
        let mut body = CodeStream::new(0);
        body.push(0).ret();
        fb.install(0, body.finish().unwrap());
        let f = Rc::new(fb.finish().unwrap());

        let env = Env::new();
        let p = Rc::new(Promise::new(f, index, env.clone()));
        let mut host = StdHost::new();
        let mut vm = Vm::new();

        let err = vm.force(&mut host, &p).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::UnboundVariable(_)));
        assert!(!p.is_forced());

        env.define(Symbol::new("y"), Value::int(7));
        assert_eq!(vm.force(&mut host, &p).unwrap(), Value::int(7));
    }

    #[test]
    fn test_delegate_shares_inner_value() {
        let f = counter();
        let env = Env::new();
        env.define(Symbol::new("count"), Value::real(10.0));
        let inner = Rc::new(Promise::new(f, 1, env.clone()));
        let outer = Rc::new(Promise::delegate(inner.clone()));

        let mut host = StdHost::new();
        let mut vm = Vm::new();
        assert_eq!(vm.force(&mut host, &outer).unwrap(), Value::real(11.0));
        assert!(inner.is_forced());
        assert_eq!(vm.force(&mut host, &inner).unwrap(), Value::real(11.0));
        assert_eq!(count(&env), Value::real(11.0));
    }

    #[test]
    fn test_eager_promise_needs_no_evaluation() {
        let p = Rc::new(Promise::forced(Value::string("done")));
        let mut host = StdHost::new();
        let mut vm = Vm::new();
        assert_eq!(vm.force(&mut host, &p).unwrap(), Value::string("done"));
        assert_eq!(vm.stats().promises_forced, 0);
    }
}
