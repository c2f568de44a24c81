use crate::bytecode::{CodeIndex, Function};
use crate::lang::env::Env;
use crate::lang::value::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// What a promise evaluates when forced.
#[derive(Debug)]
pub enum PromiseCode {
    /// A code object of a compiled function.
    Compiled {
        function: Rc<Function>,
        index: CodeIndex,
    },
    /// Forcing defers to another promise, sharing its memoized value.
    /// Produced when a `...` element is forwarded to a closure.
    Delegate(Rc<Promise>),
    /// Created already forced around an existing value.
    Eager(Value),
}

/// Lifecycle of a promise: `Unforced -> Forcing -> Forced`.
#[derive(Debug, Clone)]
pub enum PromiseState {
    Unforced,
    /// Evaluation in progress; a second force at this point is a cycle.
    Forcing,
    Forced(Value),
}

/// A deferred, memoized computation.
///
/// Once forced the value is never replaced and the environment reference is
/// released.
pub struct Promise {
    code: PromiseCode,
    env: RefCell<Option<Env>>,
    state: RefCell<PromiseState>,
}

impl Promise {
    pub fn new(function: Rc<Function>, index: CodeIndex, env: Env) -> Self {
        Self {
            code: PromiseCode::Compiled { function, index },
            env: RefCell::new(Some(env)),
            state: RefCell::new(PromiseState::Unforced),
        }
    }

    pub fn delegate(inner: Rc<Promise>) -> Self {
        Self {
            code: PromiseCode::Delegate(inner),
            env: RefCell::new(None),
            state: RefCell::new(PromiseState::Unforced),
        }
    }

    pub fn forced(value: Value) -> Self {
        Self {
            code: PromiseCode::Eager(value.clone()),
            env: RefCell::new(None),
            state: RefCell::new(PromiseState::Forced(value)),
        }
    }

    pub fn code(&self) -> &PromiseCode {
        &self.code
    }

    /// The evaluation environment; `None` once forced.
    pub fn env(&self) -> Option<Env> {
        self.env.borrow().clone()
    }

    pub fn state(&self) -> PromiseState {
        self.state.borrow().clone()
    }

    /// The memoized value, if forced.
    pub fn value(&self) -> Option<Value> {
        match &*self.state.borrow() {
            PromiseState::Forced(v) => Some(v.clone()),
            _ => None,
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(*self.state.borrow(), PromiseState::Forced(_))
    }

    /// `Unforced -> Forcing`. Returns false if the promise was not unforced.
    pub(crate) fn begin(&self) -> bool {
        let mut state = self.state.borrow_mut();
        match *state {
            PromiseState::Unforced => {
                *state = PromiseState::Forcing;
                true
            }
            _ => false,
        }
    }

    /// `Forcing -> Forced`. The first stored value wins.
    pub(crate) fn finish(&self, value: Value) -> Value {
        let mut state = self.state.borrow_mut();
        if let PromiseState::Forced(existing) = &*state {
            return existing.clone();
        }
        *state = PromiseState::Forced(value.clone());
        self.env.borrow_mut().take();
        value
    }

    /// `Forcing -> Unforced`, after a failed evaluation.
    pub(crate) fn abandon(&self) {
        let mut state = self.state.borrow_mut();
        if matches!(*state, PromiseState::Forcing) {
            *state = PromiseState::Unforced;
        }
    }

    /// The syntax this promise was created from.
    pub fn expression(&self) -> Option<Value> {
        match &self.code {
            PromiseCode::Compiled { function, index } => {
                let code = function.code(*index)?;
                function.sources.get(code.src).cloned()
            }
            PromiseCode::Delegate(inner) => inner.expression(),
            PromiseCode::Eager(value) => Some(value.clone()),
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            PromiseState::Unforced => write!(f, "<promise: unforced>"),
            PromiseState::Forcing => write!(f, "<promise: forcing>"),
            PromiseState::Forced(v) => write!(f, "<promise: {}>", v),
        }
    }
}
