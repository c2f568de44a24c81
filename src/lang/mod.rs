//! # Value model
//!
//! The values the interpreter manipulates, the lexical environments that
//! bind them and the promises that defer their computation.
//!
//! ## Conventions
//!
//! - Reference kinds (promises, closures, environments) compare by identity.
//! - Data vectors compare by content; their `named` marker is bookkeeping
//!   only.
//! - The missing-argument sentinel is an ordinary value, `Value::Missing`.

pub mod env;
pub mod promise;
pub mod value;
