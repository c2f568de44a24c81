use crate::lang::value::{Symbol, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Result of a variable lookup. A binding to the missing-argument sentinel
/// is reported as `Bound(Value::Missing)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Bound(Value),
    Unbound,
}

struct EnvFrame {
    vars: RefCell<HashMap<Symbol, Value>>,
    parent: Option<Env>,
}

/// A lexical environment: one frame of bindings plus the enclosing
/// environment. Cloning is cheap and shares the frame.
#[derive(Clone)]
pub struct Env(Rc<EnvFrame>);

impl Env {
    /// A top-level environment with no parent.
    pub fn new() -> Self {
        Env(Rc::new(EnvFrame {
            vars: RefCell::new(HashMap::new()),
            parent: None,
        }))
    }

    /// A fresh environment enclosed by `self`.
    pub fn child(&self) -> Self {
        Env(Rc::new(EnvFrame {
            vars: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    pub fn parent(&self) -> Option<&Env> {
        self.0.parent.as_ref()
    }

    /// `self`, then each enclosing environment outwards.
    pub fn ancestors(&self) -> impl Iterator<Item = &Env> {
        std::iter::successors(Some(self), |env| env.parent())
    }

    /// Binding in this frame only.
    pub fn get_local(&self, sym: &Symbol) -> Option<Value> {
        self.0.vars.borrow().get(sym).cloned()
    }

    /// Lexical lookup through the parent chain.
    pub fn lookup(&self, sym: &Symbol) -> Lookup {
        self.ancestors()
            .find_map(|env| env.get_local(sym))
            .map_or(Lookup::Unbound, Lookup::Bound)
    }

    /// Bind (or rebind) `sym` in this frame.
    pub fn define(&self, sym: Symbol, value: Value) {
        self.0.vars.borrow_mut().insert(sym, value);
    }

    /// Names bound in this frame, sorted.
    pub fn names(&self) -> Vec<Symbol> {
        let mut names: Vec<Symbol> = self.0.vars.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Env {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<environment: {} bindings>", self.0.vars.borrow().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(name: &str) -> Symbol {
        Symbol::new(name)
    }

    #[test]
    fn test_lookup_walks_parents() {
        let global = Env::new();
        global.define(sym("x"), Value::real(1.0));
        let inner = global.child().child();

        assert_eq!(inner.lookup(&sym("x")), Lookup::Bound(Value::real(1.0)));
        assert_eq!(inner.lookup(&sym("y")), Lookup::Unbound);
        assert!(inner.get_local(&sym("x")).is_none());
    }

    #[test]
    fn test_define_shadows_outer_binding() {
        let global = Env::new();
        global.define(sym("x"), Value::real(1.0));
        let inner = global.child();
        inner.define(sym("x"), Value::real(2.0));

        assert_eq!(inner.lookup(&sym("x")), Lookup::Bound(Value::real(2.0)));
        assert_eq!(global.lookup(&sym("x")), Lookup::Bound(Value::real(1.0)));
    }

    #[test]
    fn test_missing_is_a_binding() {
        let env = Env::new();
        env.define(sym("a"), Value::Missing);
        assert_eq!(env.lookup(&sym("a")), Lookup::Bound(Value::Missing));
    }

    #[test]
    fn test_names_sorted_and_local() {
        let global = Env::new();
        global.define(sym("outer"), Value::Null);
        let env = global.child();
        env.define(sym("b"), Value::Null);
        env.define(sym("a"), Value::Null);
        assert_eq!(env.names(), vec![sym("a"), sym("b")]);
        assert_eq!(env.ancestors().count(), 2);
    }

    #[test]
    fn test_clone_shares_frame() {
        let env = Env::new();
        let alias = env.clone();
        alias.define(sym("z"), Value::int(3));
        assert!(env.ptr_eq(&alias));
        assert_eq!(env.lookup(&sym("z")), Lookup::Bound(Value::int(3)));
    }
}
