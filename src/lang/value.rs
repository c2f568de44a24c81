use crate::bytecode::Function;
use crate::lang::env::Env;
use crate::lang::promise::Promise;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

/// Interned-by-value identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(Rc<str>);

impl Symbol {
    pub fn new(name: &str) -> Self {
        Symbol(Rc::from(name))
    }

    /// The variadic binding, `...`.
    pub fn dots() -> Self {
        Symbol::new("...")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_dots(&self) -> bool {
        &*self.0 == "..."
    }

    /// For `..N` symbols, the 1-based position `N` inside `...`.
    pub fn dd_index(&self) -> Option<usize> {
        self.0
            .strip_prefix("..")
            .and_then(|rest| rest.parse::<usize>().ok())
            .filter(|n| *n > 0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime kind tag of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Null,
    Missing,
    Symbol,
    Data,
    Pairlist,
    Lang,
    Code,
    Builtin,
    Special,
    Promise,
    Closure,
    Env,
    Dots,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Null => "NULL",
            Kind::Missing => "missing argument",
            Kind::Symbol => "symbol",
            Kind::Data => "vector",
            Kind::Pairlist => "pairlist",
            Kind::Lang => "language",
            Kind::Code => "bytecode",
            Kind::Builtin => "builtin",
            Kind::Special => "special",
            Kind::Promise => "promise",
            Kind::Closure => "closure",
            Kind::Env => "environment",
            Kind::Dots => "...",
        };
        f.write_str(name)
    }
}

/// Index of a primitive in the host's primitive table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrimitiveId(pub u16);

/// Atomic vector payload. `None` elements are NA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vector {
    Logical(Vec<Option<bool>>),
    Integer(Vec<Option<i32>>),
    Real(Vec<f64>),
    Str(Vec<Option<Rc<str>>>),
}

impl Vector {
    pub fn len(&self) -> usize {
        match self {
            Vector::Logical(v) => v.len(),
            Vector::Integer(v) => v.len(),
            Vector::Real(v) => v.len(),
            Vector::Str(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Vector::Logical(_) => "logical",
            Vector::Integer(_) => "integer",
            Vector::Real(_) => "double",
            Vector::Str(_) => "character",
        }
    }
}

/// A vector plus its sharing marker.
///
/// `named` follows the host convention: 0 = fresh temporary, 1 = bound to
/// one name, 2 = possibly shared. Values materialized by the interpreter are
/// raised to at least 1 so the host's copy-on-write never mutates them in
/// place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    vector: Vector,
    #[serde(skip)]
    named: Cell<u8>,
}

impl Data {
    pub fn new(vector: Vector) -> Self {
        Self {
            vector,
            named: Cell::new(0),
        }
    }

    pub fn vector(&self) -> &Vector {
        &self.vector
    }

    pub fn named(&self) -> u8 {
        self.named.get()
    }
}

impl PartialEq for Data {
    fn eq(&self, other: &Self) -> bool {
        self.vector == other.vector
    }
}

/// Ordered `(name, value)` cells. Used for argument lists, formals and call
/// syntax arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pairlist {
    cells: Vec<(Option<Symbol>, Value)>,
}

impl Pairlist {
    pub fn new() -> Self {
        Self { cells: Vec::new() }
    }

    pub fn push(&mut self, name: Option<Symbol>, value: Value) {
        self.cells.push((name, value));
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&(Option<Symbol>, Value)> {
        self.cells.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, (Option<Symbol>, Value)> {
        self.cells.iter()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.cells.iter().map(|(_, v)| v)
    }

    /// Names as plain strings, `""` for untagged cells.
    pub fn names(&self) -> Vec<&str> {
        self.cells
            .iter()
            .map(|(n, _)| n.as_ref().map(Symbol::as_str).unwrap_or(""))
            .collect()
    }
}

impl FromIterator<(Option<Symbol>, Value)> for Pairlist {
    fn from_iter<I: IntoIterator<Item = (Option<Symbol>, Value)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Pairlist {
    type Item = (Option<Symbol>, Value);
    type IntoIter = std::vec::IntoIter<(Option<Symbol>, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.into_iter()
    }
}

/// Call syntax: `fun(args...)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lang {
    pub fun: Value,
    pub args: Pairlist,
}

/// A user-level function: formals, body and defining environment.
///
/// The body is either compiled code (`Value::Code`) or syntax waiting for
/// the compiler callback.
#[derive(Debug)]
pub struct Closure {
    pub formals: Pairlist,
    body: RefCell<Value>,
    pub env: Env,
}

impl Closure {
    pub fn new(formals: Pairlist, body: Value, env: Env) -> Self {
        Self {
            formals,
            body: RefCell::new(body),
            env,
        }
    }

    pub fn body(&self) -> Value {
        self.body.borrow().clone()
    }

    pub fn set_body(&self, body: Value) {
        *self.body.borrow_mut() = body;
    }

    pub fn compiled(&self) -> Option<Rc<Function>> {
        match &*self.body.borrow() {
            Value::Code(function) => Some(function.clone()),
            _ => None,
        }
    }
}

/// Runtime value.
///
/// Only the syntax-like variants can be written to a bytecode image; the
/// runtime-only ones (promises, closures, environments, `...` bindings) are
/// skipped by serde and fail to serialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    /// The missing-argument sentinel.
    Missing,
    Symbol(Symbol),
    Data(Rc<Data>),
    Pairlist(Rc<Pairlist>),
    Lang(Rc<Lang>),
    /// Compiled code, e.g. a closure body produced by the compiler.
    Code(Rc<Function>),
    Builtin(PrimitiveId),
    Special(PrimitiveId),
    #[serde(skip)]
    Promise(Rc<Promise>),
    #[serde(skip)]
    Closure(Rc<Closure>),
    #[serde(skip)]
    Env(Env),
    /// A captured variadic binding.
    #[serde(skip)]
    Dots(Rc<Pairlist>),
}

impl Value {
    // ───────────────────────────── Construction ─────────────────────────

    pub fn symbol(name: &str) -> Value {
        Value::Symbol(Symbol::new(name))
    }

    pub fn vector(vector: Vector) -> Value {
        Value::Data(Rc::new(Data::new(vector)))
    }

    pub fn real(x: f64) -> Value {
        Value::vector(Vector::Real(vec![x]))
    }

    pub fn reals(xs: Vec<f64>) -> Value {
        Value::vector(Vector::Real(xs))
    }

    pub fn int(n: i32) -> Value {
        Value::vector(Vector::Integer(vec![Some(n)]))
    }

    pub fn logical(b: bool) -> Value {
        Value::vector(Vector::Logical(vec![Some(b)]))
    }

    pub fn na_logical() -> Value {
        Value::vector(Vector::Logical(vec![None]))
    }

    pub fn string(s: &str) -> Value {
        Value::vector(Vector::Str(vec![Some(Rc::from(s))]))
    }

    pub fn lang(fun: Value, args: Pairlist) -> Value {
        Value::Lang(Rc::new(Lang { fun, args }))
    }

    pub fn pairlist(list: Pairlist) -> Value {
        Value::Pairlist(Rc::new(list))
    }

    pub fn promise(promise: Promise) -> Value {
        Value::Promise(Rc::new(promise))
    }

    pub fn closure(closure: Closure) -> Value {
        Value::Closure(Rc::new(closure))
    }

    // ───────────────────────────── Inspection ───────────────────────────

    pub fn kind(&self) -> Kind {
        match self {
            Value::Null => Kind::Null,
            Value::Missing => Kind::Missing,
            Value::Symbol(_) => Kind::Symbol,
            Value::Data(_) => Kind::Data,
            Value::Pairlist(_) => Kind::Pairlist,
            Value::Lang(_) => Kind::Lang,
            Value::Code(_) => Kind::Code,
            Value::Builtin(_) => Kind::Builtin,
            Value::Special(_) => Kind::Special,
            Value::Promise(_) => Kind::Promise,
            Value::Closure(_) => Kind::Closure,
            Value::Env(_) => Kind::Env,
            Value::Dots(_) => Kind::Dots,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Data(d) => d.vector.len(),
            Value::Pairlist(l) | Value::Dots(l) => l.len(),
            Value::Lang(l) => l.args.len() + 1,
            _ => 1,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(
            self,
            Value::Closure(_) | Value::Builtin(_) | Value::Special(_)
        )
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&Vector> {
        match self {
            Value::Data(d) => Some(&d.vector),
            _ => None,
        }
    }

    pub fn is_logical(&self) -> bool {
        matches!(self.as_vector(), Some(Vector::Logical(_)))
    }

    /// Scalar TRUE.
    pub fn is_true(&self) -> bool {
        matches!(self.as_vector(), Some(Vector::Logical(v)) if v.len() == 1 && v[0] == Some(true))
    }

    /// Scalar FALSE.
    pub fn is_false(&self) -> bool {
        matches!(self.as_vector(), Some(Vector::Logical(v)) if v.len() == 1 && v[0] == Some(false))
    }

    /// Coerce the first element to a logical. `None` means NA or not
    /// coercible; the caller is expected to have rejected length zero.
    pub fn as_logical(&self) -> Option<bool> {
        match self.as_vector()? {
            Vector::Logical(v) => v.first().copied().flatten(),
            Vector::Integer(v) => v.first().copied().flatten().map(|n| n != 0),
            Vector::Real(v) => v.first().copied().filter(|x| !x.is_nan()).map(|x| x != 0.0),
            Vector::Str(v) => match v.first()?.as_deref()? {
                "TRUE" | "true" | "T" | "True" => Some(true),
                "FALSE" | "false" | "F" | "False" => Some(false),
                _ => None,
            },
        }
    }

    /// Scalar double, if this is a length-one non-NA real.
    pub fn as_real_scalar(&self) -> Option<f64> {
        match self.as_vector()? {
            Vector::Real(v) if v.len() == 1 => Some(v[0]),
            _ => None,
        }
    }

    /// Scalar integer, if this is a length-one non-NA integer.
    pub fn as_int_scalar(&self) -> Option<i32> {
        match self.as_vector()? {
            Vector::Integer(v) if v.len() == 1 => v[0],
            _ => None,
        }
    }

    // ───────────────────────────── Sharing ──────────────────────────────

    pub fn named(&self) -> u8 {
        match self {
            Value::Data(d) => d.named.get(),
            _ => 0,
        }
    }

    /// Mark a value the interpreter hands out as referenced (named >= 1).
    pub fn mark_referenced(&self) {
        if let Value::Data(d) = self {
            if d.named.get() == 0 {
                d.named.set(1);
            }
        }
    }

    /// Mark a value as possibly shared (named = 2).
    pub fn mark_shared(&self) {
        if let Value::Data(d) = self {
            d.named.set(2);
        }
    }

    /// Identity comparison for reference kinds, equality for the rest.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Data(a), Value::Data(b)) => Rc::ptr_eq(a, b),
            (Value::Pairlist(a), Value::Pairlist(b)) => Rc::ptr_eq(a, b),
            (Value::Lang(a), Value::Lang(b)) => Rc::ptr_eq(a, b),
            _ => self == other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Missing, Value::Missing) => true,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Data(a), Value::Data(b)) => a == b,
            (Value::Pairlist(a), Value::Pairlist(b)) => a == b,
            (Value::Lang(a), Value::Lang(b)) => a == b,
            (Value::Code(a), Value::Code(b)) => Rc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            (Value::Special(a), Value::Special(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Env(a), Value::Env(b)) => a.ptr_eq(b),
            (Value::Dots(a), Value::Dots(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

// =============================================================================
// Deparsing
// =============================================================================

fn is_operator(name: &str) -> bool {
    matches!(
        name,
        "+" | "-" | "*" | "/" | "<" | ">" | "<=" | ">=" | "==" | "!=" | "<-" | "=" | "&&" | "||"
    )
}

fn write_cells(f: &mut fmt::Formatter<'_>, cells: &Pairlist) -> fmt::Result {
    for (i, (name, value)) in cells.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        match name {
            Some(n) => write!(f, "{} = {}", n, value)?,
            None => write!(f, "{}", value)?,
        }
    }
    Ok(())
}

fn write_vector(f: &mut fmt::Formatter<'_>, vector: &Vector) -> fmt::Result {
    let items: Vec<String> = match vector {
        Vector::Logical(v) => v
            .iter()
            .map(|x| match x {
                Some(true) => "TRUE".to_string(),
                Some(false) => "FALSE".to_string(),
                None => "NA".to_string(),
            })
            .collect(),
        Vector::Integer(v) => v
            .iter()
            .map(|x| match x {
                Some(n) => format!("{}L", n),
                None => "NA".to_string(),
            })
            .collect(),
        Vector::Real(v) => v.iter().map(|x| format!("{}", x)).collect(),
        Vector::Str(v) => v
            .iter()
            .map(|x| match x {
                Some(s) => format!("{:?}", s),
                None => "NA".to_string(),
            })
            .collect(),
    };
    match items.len() {
        1 => write!(f, "{}", items[0]),
        0 => write!(f, "{}(0)", vector.type_name()),
        _ => write!(f, "c({})", items.join(", ")),
    }
}

impl fmt::Display for Value {
    /// Format a value as source syntax, as far as it has one.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Missing => Ok(()),
            Value::Symbol(s) => write!(f, "{}", s),
            Value::Data(d) => write_vector(f, &d.vector),
            Value::Pairlist(l) => {
                write!(f, "pairlist(")?;
                write_cells(f, l)?;
                write!(f, ")")
            }
            Value::Lang(l) => {
                if let Value::Symbol(op) = &l.fun {
                    if is_operator(op.as_str())
                        && l.args.len() == 2
                        && l.args.iter().all(|(n, _)| n.is_none())
                    {
                        let lhs = &l.args.cells[0].1;
                        let rhs = &l.args.cells[1].1;
                        return write!(f, "{} {} {}", lhs, op, rhs);
                    }
                }
                write!(f, "{}(", l.fun)?;
                write_cells(f, &l.args)?;
                write!(f, ")")
            }
            Value::Code(_) => write!(f, "<bytecode>"),
            Value::Builtin(id) => write!(f, "<builtin #{}>", id.0),
            Value::Special(id) => write!(f, "<special #{}>", id.0),
            Value::Promise(_) => write!(f, "<promise>"),
            Value::Closure(c) => {
                write!(f, "function(")?;
                for (i, (name, default)) in c.formals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    if let Some(n) = name {
                        write!(f, "{}", n)?;
                    }
                    match default {
                        Value::Missing => {}
                        other => write!(f, " = {}", other)?,
                    }
                }
                write!(f, ") {}", c.body())
            }
            Value::Env(_) => write!(f, "<environment>"),
            Value::Dots(_) => write!(f, "<...>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dd_index() {
        assert_eq!(Symbol::new("..1").dd_index(), Some(1));
        assert_eq!(Symbol::new("..12").dd_index(), Some(12));
        assert_eq!(Symbol::new("..0").dd_index(), None);
        assert_eq!(Symbol::new("...").dd_index(), None);
        assert_eq!(Symbol::new("x").dd_index(), None);
        assert!(Symbol::dots().is_dots());
    }

    #[test]
    fn test_as_logical_coercions() {
        assert_eq!(Value::logical(true).as_logical(), Some(true));
        assert_eq!(Value::na_logical().as_logical(), None);
        assert_eq!(Value::int(0).as_logical(), Some(false));
        assert_eq!(Value::real(2.5).as_logical(), Some(true));
        assert_eq!(Value::real(f64::NAN).as_logical(), None);
        assert_eq!(Value::string("T").as_logical(), Some(true));
        assert_eq!(Value::string("no").as_logical(), None);
        assert_eq!(Value::symbol("x").as_logical(), None);
    }

    #[test]
    fn test_first_element_decides() {
        let v = Value::vector(Vector::Logical(vec![Some(false), Some(true)]));
        assert_eq!(v.length(), 2);
        assert_eq!(v.as_logical(), Some(false));
    }

    #[test]
    fn test_mark_referenced_never_lowers() {
        let v = Value::real(1.0);
        assert_eq!(v.named(), 0);
        v.mark_referenced();
        assert_eq!(v.named(), 1);
        v.mark_shared();
        v.mark_referenced();
        assert_eq!(v.named(), 2);
    }

    #[test]
    fn test_data_equality_ignores_named() {
        let a = Value::real(1.0);
        let b = Value::real(1.0);
        a.mark_shared();
        assert_eq!(a, b);
        assert!(!a.ptr_eq(&b));
        assert!(a.ptr_eq(&a.clone()));
    }

    #[test]
    fn test_display_deparses_calls() {
        let mut args = Pairlist::new();
        args.push(None, Value::symbol("a"));
        args.push(None, Value::real(1.0));
        let call = Value::lang(Value::symbol("+"), args);
        assert_eq!(call.to_string(), "a + 1");

        let mut args = Pairlist::new();
        args.push(Some(Symbol::new("x")), Value::int(1));
        args.push(None, Value::string("s"));
        let call = Value::lang(Value::symbol("f"), args);
        assert_eq!(call.to_string(), "f(x = 1L, \"s\")");
    }

    #[test]
    fn test_display_vectors() {
        assert_eq!(Value::reals(vec![1.0, 2.5]).to_string(), "c(1, 2.5)");
        assert_eq!(Value::na_logical().to_string(), "NA");
        assert_eq!(Value::reals(vec![]).to_string(), "double(0)");
    }

    #[test]
    fn test_kind_tags() {
        assert_eq!(Value::Null.kind(), Kind::Null);
        assert_eq!(Value::symbol("x").kind(), Kind::Symbol);
        assert_eq!(Value::Builtin(PrimitiveId(0)).kind(), Kind::Builtin);
        assert!(Value::Special(PrimitiveId(1)).is_callable());
        assert!(!Value::real(1.0).is_callable());
    }
}
