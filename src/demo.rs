//! Small hand-assembled programs, used by the command-line driver.

use crate::bytecode::stream::{AssembleError, CodeStream, FunctionBuilder};
use crate::bytecode::{Function, MISSING_ARG, Opcode};
use crate::lang::value::{Pairlist, Symbol, Value};
use std::rc::Rc;

pub struct Demo {
    pub name: &'static str,
    pub description: &'static str,
    build: fn() -> Result<Function, AssembleError>,
}

impl Demo {
    pub fn build(&self) -> Result<Function, AssembleError> {
        (self.build)()
    }
}

pub const DEMOS: &[Demo] = &[
    Demo {
        name: "sum",
        description: "sum 1 to 10 with a loop on the integer stack",
        build: sum_loop,
    },
    Demo {
        name: "lazy",
        description: "an argument that is never used is never evaluated",
        build: lazy_argument,
    },
    Demo {
        name: "dots",
        description: "forward `...` from a closure to a builtin",
        build: forward_dots,
    },
];

pub fn by_name(name: &str) -> Option<&'static Demo> {
    DEMOS.iter().find(|demo| demo.name == name)
}

pub fn names() -> impl Iterator<Item = &'static str> {
    DEMOS.iter().map(|demo| demo.name)
}

fn call_syntax(fun: &str, args: Vec<(Option<&str>, Value)>) -> Value {
    let args = args
        .into_iter()
        .map(|(name, value)| (name.map(Symbol::new), value))
        .collect();
    Value::lang(Value::symbol(fun), args)
}

fn formals(names: &[&str]) -> Value {
    let list: Pairlist = names
        .iter()
        .map(|name| (Some(Symbol::new(name)), Value::Missing))
        .collect();
    Value::pairlist(list)
}

/// `name <- function(<formals>) <body>` appended to `cs`, leaving nothing on
/// the stack.
fn define_closure(
    fb: &mut FunctionBuilder,
    cs: &mut CodeStream,
    name: &str,
    params: &[&str],
    body: Function,
) {
    let sym = fb.symbol(name);
    let formals = fb.constant(formals(params));
    let body = fb.constant(Value::Code(Rc::new(body)));
    cs.push(sym)
        .push(formals)
        .push(body)
        .op(Opcode::Close)
        .op(Opcode::Stvar)
        .op(Opcode::Pop);
}

/// A promise child returning constant `value`.
fn constant_child(fb: &mut FunctionBuilder, value: Value) -> Result<u32, AssembleError> {
    let src = fb.source(value.clone());
    let k = fb.constant(value);
    let mut cs = CodeStream::new(src);
    cs.push(k).ret();
    Ok(fb.add_code(cs.finish()?))
}

/// ```text
/// n <- 0
/// i <- 1
/// for (k in 1:10) { n <- n + i; i <- i + 1 }
/// n
/// ```
fn sum_loop() -> Result<Function, AssembleError> {
    let mut fb = FunctionBuilder::new();
    let src = fb.source(Value::symbol("n"));
    let sum_src = fb.source(call_syntax(
        "+",
        vec![(None, Value::symbol("n")), (None, Value::symbol("i"))],
    ));
    let incr_src = fb.source(call_syntax(
        "+",
        vec![(None, Value::symbol("i")), (None, Value::real(1.0))],
    ));
    let n = fb.symbol("n");
    let i = fb.symbol("i");
    let zero = fb.constant(Value::real(0.0));
    let one = fb.constant(Value::real(1.0));

    let mut cs = CodeStream::new(src);
    let top = cs.new_label();
    let exit = cs.new_label();

    cs.push(n).push(zero).op(Opcode::Stvar).op(Opcode::Pop);
    cs.push(i).push(one).op(Opcode::Stvar).op(Opcode::Pop);
    cs.pushi(0);
    cs.bind(top)?;
    cs.op(Opcode::Dupi).pushi(10).op(Opcode::Lti).brfalse(exit);
    cs.push(n).ldvar(n).ldvar(i).with_source(sum_src).op(Opcode::Add);
    cs.op(Opcode::Stvar).op(Opcode::Pop);
    cs.push(i).ldvar(i).push(one).with_source(incr_src).op(Opcode::Add);
    cs.op(Opcode::Stvar).op(Opcode::Pop);
    cs.op(Opcode::Inci).br(top);
    cs.bind(exit)?;
    cs.op(Opcode::Popi).ldvar(n).ret();

    fb.install(0, cs.finish()?);
    fb.finish()
}

/// ```text
/// first <- function(a, b) a
/// first(1, undefined_variable)
/// ```
fn lazy_argument() -> Result<Function, AssembleError> {
    let mut body = FunctionBuilder::new();
    let src = body.source(Value::symbol("a"));
    let a = body.symbol("a");
    let mut cs = CodeStream::new(src);
    cs.ldvar(a).ret();
    body.install(0, cs.finish()?);
    let body = body.finish()?;

    let mut fb = FunctionBuilder::new();
    let call = call_syntax(
        "first",
        vec![(None, Value::real(1.0)), (None, Value::symbol("undefined_variable"))],
    );
    let src = fb.source(call);
    let first = constant_child(&mut fb, Value::real(1.0))?;

    let unbound_src = fb.source(Value::symbol("undefined_variable"));
    let unbound = fb.symbol("undefined_variable");
    let mut arg = CodeStream::new(unbound_src);
    arg.ldvar(unbound).ret();
    let second = fb.add_code(arg.finish()?);

    let mut cs = CodeStream::new(src);
    define_closure(&mut fb, &mut cs, "first", &["a", "b"], body);
    let offsets = [(None, cs.child(first) as i32), (None, cs.child(second) as i32)];
    let (args, names) = fb.call_consts(&offsets);
    let sym = fb.symbol("first");
    cs.ldfun(sym).call(args, names).ret();

    fb.install(0, cs.finish()?);
    fb.finish()
}

/// ```text
/// collect <- function(...) c(...)
/// collect(x = 1, 2, y = 3)
/// ```
fn forward_dots() -> Result<Function, AssembleError> {
    let mut body = FunctionBuilder::new();
    let src = body.source(call_syntax("c", vec![(None, Value::symbol("..."))]));
    let (args, names) = body.call_consts(&[(Some("..."), MISSING_ARG)]);
    let c = body.symbol("c");
    let mut cs = CodeStream::new(src);
    cs.ldfun(c).call(args, names).ret();
    body.install(0, cs.finish()?);
    let body = body.finish()?;

    let mut fb = FunctionBuilder::new();
    let call = call_syntax(
        "collect",
        vec![
            (Some("x"), Value::real(1.0)),
            (None, Value::real(2.0)),
            (Some("y"), Value::real(3.0)),
        ],
    );
    let src = fb.source(call);
    let x = constant_child(&mut fb, Value::real(1.0))?;
    let two = constant_child(&mut fb, Value::real(2.0))?;
    let y = constant_child(&mut fb, Value::real(3.0))?;

    let mut cs = CodeStream::new(src);
    define_closure(&mut fb, &mut cs, "collect", &["..."], body);
    let offsets = [
        (Some("x"), cs.child(x) as i32),
        (None, cs.child(two) as i32),
        (Some("y"), cs.child(y) as i32),
    ];
    let (args, names) = fb.call_consts(&offsets);
    let sym = fb.symbol("collect");
    cs.ldfun(sym).call(args, names).ret();

    fb.install(0, cs.finish()?);
    fb.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::verify::verify_function;
    use crate::runtime::host::StdHost;
    use crate::runtime::runtime_error::RuntimeError;
    use crate::runtime::vm_bc::Vm;

    fn run(name: &str) -> Result<Value, RuntimeError> {
        let function = Rc::new(by_name(name).unwrap().build().unwrap());
        verify_function(&function).unwrap();
        let mut host = StdHost::new();
        let env = host.base_env();
        Vm::new().run(&mut host, &function, &env)
    }

    #[test]
    fn test_every_demo_builds_and_verifies() {
        for name in names() {
            let function = by_name(name).unwrap().build().unwrap();
            assert!(verify_function(&function).is_ok(), "{}", name);
        }
        assert!(by_name("nope").is_none());
    }

    #[test]
    fn test_sum_demo() {
        assert_eq!(run("sum").unwrap(), Value::real(55.0));
    }

    #[test]
    fn test_lazy_demo_skips_unused_argument() {
        assert_eq!(run("lazy").unwrap(), Value::real(1.0));
    }

    #[test]
    fn test_dots_demo_flattens_in_order() {
        assert_eq!(run("dots").unwrap(), Value::reals(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_demo_images_round_trip() {
        let function = by_name("dots").unwrap().build().unwrap();
        let bytes = function.to_bytes().unwrap();
        let decoded = Function::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.codes, function.codes);
        assert!(matches!(
            decoded.constants.iter().last().map(|(_, v)| v.clone()),
            Some(Value::Symbol(_))
        ));
    }
}
