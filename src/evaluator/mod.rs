//! Map/reduce evaluation seam.
//!
//! View definitions arrive as source text. Everything that runs that text
//! sits behind [`Evaluator`], so the dialect can be swapped without
//! touching the sync engine or the storage backend. Compilation happens
//! once, at setup time: a source that does not compile is rejected with
//! a configuration error and never reaches sync.
//!
//! The bundled [`ScriptEvaluator`] interprets a small JavaScript-shaped
//! dialect over a closed AST: map functions may only observe the document
//! and call `emit`, reduce functions are builtin reducers. No host,
//! network or file access exists to leak.

mod script;

pub use script::ScriptEvaluator;

use std::fmt;

use serde_json::Value;

/// One `emit(key, value)` call produced by a map function.
#[derive(Debug, Clone, PartialEq)]
pub struct Emit {
    pub key: Value,
    pub value: Value,
}

/// A compiled map function: pure `(doc) -> emits`.
pub trait MapFn: Send + Sync {
    fn map(&self, doc: &Value) -> Result<Vec<Emit>, EvalError>;
}

/// A compiled reduce function: pure `(keys, values, rereduce) -> value`.
pub trait ReduceFn: Send + Sync {
    fn reduce(&self, keys: &[Value], values: &[Value], rereduce: bool)
        -> Result<Value, EvalError>;
}

/// Compiles user-supplied view sources.
pub trait Evaluator: Send + Sync {
    fn compile_map(&self, source: &str) -> Result<Box<dyn MapFn>, EvalError>;
    fn compile_reduce(&self, source: &str) -> Result<Box<dyn ReduceFn>, EvalError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    Parse(String),
    Eval(String),
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::Parse(detail) => write!(f, "source failed to parse: {}", detail),
            EvalError::Eval(detail) => write!(f, "evaluation failed: {}", detail),
        }
    }
}

impl std::error::Error for EvalError {}
