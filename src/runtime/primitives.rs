//! Base primitives of the reference host.
//!
//! Numeric semantics are deliberately small: scalar and recycled vector
//! arithmetic over logical, integer and double vectors, plus string
//! comparison. Anything else is an error.

use crate::lang::env::Env;
use crate::lang::value::{Pairlist, Value, Vector};
use crate::runtime::host::{Host, PrimitiveEntry, Visibility};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::vm_bc::Vm;
use std::rc::Rc;

pub const BASE: &[PrimitiveEntry] = &[
    PrimitiveEntry {
        name: "c",
        arity: -1,
        visibility: Visibility::On,
        special: false,
        fun: prim_c,
    },
    PrimitiveEntry {
        name: "+",
        arity: -1,
        visibility: Visibility::On,
        special: false,
        fun: prim_add,
    },
    PrimitiveEntry {
        name: "-",
        arity: -1,
        visibility: Visibility::On,
        special: false,
        fun: prim_sub,
    },
    PrimitiveEntry {
        name: "<",
        arity: 2,
        visibility: Visibility::On,
        special: false,
        fun: prim_lt,
    },
    PrimitiveEntry {
        name: "length",
        arity: 1,
        visibility: Visibility::On,
        special: false,
        fun: prim_length,
    },
    PrimitiveEntry {
        name: "invisible",
        arity: -1,
        visibility: Visibility::Off,
        special: false,
        fun: prim_invisible,
    },
    PrimitiveEntry {
        name: "identity",
        arity: 1,
        visibility: Visibility::On,
        special: false,
        fun: prim_identity,
    },
    PrimitiveEntry {
        name: "quote",
        arity: 1,
        visibility: Visibility::On,
        special: true,
        fun: prim_quote,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

// =============================================================================
// Numeric helpers
// =============================================================================

/// Doubles view of a numeric vector; NA becomes NaN.
fn as_reals(v: &Vector) -> Option<Vec<f64>> {
    match v {
        Vector::Logical(xs) => Some(
            xs.iter()
                .map(|x| x.map_or(f64::NAN, |b| if b { 1.0 } else { 0.0 }))
                .collect(),
        ),
        Vector::Integer(xs) => Some(xs.iter().map(|x| x.map_or(f64::NAN, f64::from)).collect()),
        Vector::Real(xs) => Some(xs.clone()),
        Vector::Str(_) => None,
    }
}

fn as_ints(v: &Vector) -> Option<Vec<Option<i32>>> {
    match v {
        Vector::Logical(xs) => Some(xs.iter().map(|x| x.map(i32::from)).collect()),
        Vector::Integer(xs) => Some(xs.clone()),
        _ => None,
    }
}

fn recycled_len(a: usize, b: usize) -> usize {
    if a == 0 || b == 0 { 0 } else { a.max(b) }
}

fn numeric<'a>(value: &'a Value, what: &str) -> Result<&'a Vector, RuntimeError> {
    match value.as_vector() {
        Some(Vector::Str(_)) | None => Err(RuntimeError::primitive(format!(
            "non-numeric argument to {}",
            what
        ))),
        Some(v) => Ok(v),
    }
}

/// Elementwise `+` / `-` with recycling. Integer overflow yields NA and a
/// warning message.
pub fn arith(op: ArithOp, lhs: &Value, rhs: &Value) -> Result<(Value, Option<&'static str>), RuntimeError> {
    let a = numeric(lhs, "binary operator")?;
    let b = numeric(rhs, "binary operator")?;
    let n = recycled_len(a.len(), b.len());

    if let (Some(xs), Some(ys)) = (as_ints(a), as_ints(b)) {
        let mut overflow = false;
        let out = (0..n)
            .map(|i| {
                let (x, y) = (xs[i % xs.len()]?, ys[i % ys.len()]?);
                let r = match op {
                    ArithOp::Add => x.checked_add(y),
                    ArithOp::Sub => x.checked_sub(y),
                };
                overflow |= r.is_none();
                r
            })
            .collect();
        let warning = overflow.then_some("NAs produced by integer overflow");
        return Ok((Value::vector(Vector::Integer(out)), warning));
    }

    let (xs, ys) = match (as_reals(a), as_reals(b)) {
        (Some(xs), Some(ys)) => (xs, ys),
        _ => return Err(RuntimeError::primitive("non-numeric argument to binary operator")),
    };
    let out = (0..n)
        .map(|i| {
            let (x, y) = (xs[i % xs.len()], ys[i % ys.len()]);
            match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
            }
        })
        .collect();
    Ok((Value::vector(Vector::Real(out)), None))
}

/// Elementwise `<` with recycling.
pub fn less_than(lhs: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    let (a, b) = match (lhs.as_vector(), rhs.as_vector()) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(RuntimeError::primitive(format!(
                "comparison (<) is possible only for atomic types, not {} and {}",
                lhs.kind(),
                rhs.kind()
            )));
        }
    };
    let n = recycled_len(a.len(), b.len());

    let out = match (a, b) {
        (Vector::Str(xs), Vector::Str(ys)) => (0..n)
            .map(|i| match (&xs[i % xs.len()], &ys[i % ys.len()]) {
                (Some(x), Some(y)) => Some(x < y),
                _ => None,
            })
            .collect(),
        _ => {
            let (xs, ys) = match (as_reals(a), as_reals(b)) {
                (Some(xs), Some(ys)) => (xs, ys),
                _ => {
                    return Err(RuntimeError::primitive(
                        "comparison of strings and numbers is not supported",
                    ));
                }
            };
            (0..n)
                .map(|i| {
                    let (x, y) = (xs[i % xs.len()], ys[i % ys.len()]);
                    if x.is_nan() || y.is_nan() { None } else { Some(x < y) }
                })
                .collect()
        }
    };
    Ok(Value::vector(Vector::Logical(out)))
}

fn binary_or_unary(
    vm: &mut Vm,
    host: &mut dyn Host,
    call: &Value,
    args: Pairlist,
    op: ArithOp,
) -> Result<Value, RuntimeError> {
    let values: Vec<Value> = args.into_iter().map(|(_, v)| v).collect();
    let (result, warning) = match values.as_slice() {
        [x] => arith(op, &Value::int(0), x)?,
        [x, y] => arith(op, x, y)?,
        _ => {
            return Err(RuntimeError::primitive(format!(
                "operator needs one or two arguments, got {}",
                values.len()
            )));
        }
    };
    if let Some(message) = warning {
        vm.warn(host, Some(call), message);
    }
    Ok(result)
}

// =============================================================================
// Primitives
// =============================================================================

fn prim_add(
    vm: &mut Vm,
    host: &mut dyn Host,
    call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    binary_or_unary(vm, host, call, args, ArithOp::Add)
}

fn prim_sub(
    vm: &mut Vm,
    host: &mut dyn Host,
    call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    binary_or_unary(vm, host, call, args, ArithOp::Sub)
}

fn prim_lt(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    match (args.get(0), args.get(1)) {
        (Some((_, x)), Some((_, y))) => less_than(x, y),
        _ => Err(RuntimeError::primitive("'<' needs two arguments")),
    }
}

/// Concatenate vectors, promoting to the highest type present.
fn prim_c(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    let mut parts = Vec::new();
    for (i, (_, value)) in args.iter().enumerate() {
        match value {
            Value::Null => {}
            Value::Data(d) => parts.push(d.vector().clone()),
            other => {
                return Err(RuntimeError::primitive(format!(
                    "argument {} (type '{}') cannot be handled by 'c'",
                    i + 1,
                    other.kind()
                )));
            }
        }
    }
    if parts.is_empty() {
        return Ok(Value::Null);
    }

    let rank = |v: &Vector| match v {
        Vector::Logical(_) => 0,
        Vector::Integer(_) => 1,
        Vector::Real(_) => 2,
        Vector::Str(_) => 3,
    };
    let vector = match parts.iter().map(rank).max().unwrap_or(0) {
        0 => Vector::Logical(
            parts
                .iter()
                .flat_map(|p| match p {
                    Vector::Logical(xs) => xs.clone(),
                    _ => Vec::new(),
                })
                .collect(),
        ),
        1 => Vector::Integer(parts.iter().filter_map(as_ints).flatten().collect()),
        2 => Vector::Real(parts.iter().filter_map(as_reals).flatten().collect()),
        _ => Vector::Str(parts.iter().flat_map(as_strings).collect()),
    };
    Ok(Value::vector(vector))
}

fn as_strings(v: &Vector) -> Vec<Option<Rc<str>>> {
    match v {
        Vector::Str(xs) => xs.clone(),
        Vector::Logical(xs) => xs
            .iter()
            .map(|x| x.map(|b| Rc::from(if b { "TRUE" } else { "FALSE" })))
            .collect(),
        Vector::Integer(xs) => xs.iter().map(|x| x.map(|n| Rc::from(n.to_string()))).collect(),
        Vector::Real(xs) => xs
            .iter()
            .map(|x| (!x.is_nan()).then(|| Rc::from(x.to_string())))
            .collect(),
    }
}

fn prim_length(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    let n = args.get(0).map_or(0, |(_, v)| v.length());
    Ok(Value::int(n as i32))
}

fn prim_invisible(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    Ok(args.into_iter().next().map_or(Value::Null, |(_, v)| v))
}

fn prim_identity(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    Ok(args.into_iter().next().map_or(Value::Null, |(_, v)| v))
}

/// Special: returns its argument's syntax unevaluated.
fn prim_quote(
    _vm: &mut Vm,
    _host: &mut dyn Host,
    _call: &Value,
    args: Pairlist,
    _env: &Env,
) -> Result<Value, RuntimeError> {
    Ok(args.into_iter().next().map_or(Value::Null, |(_, v)| v))
}
