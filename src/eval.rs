//! Expression evaluation against a scoped variable environment.
//!
//! Composite blocks carry small expressions (a repeat count, an argument
//! reference) that are evaluated at run time against an [`EvalStack`] of
//! scoped frames: a `Repeat` binds `index` for each iteration, a shorthand
//! wrapper binds its named argument for the subtree it wraps.
//!
//! Evaluation failures are returned as structured [`Diagnostics`] in the
//! `Err` arm, never as an in-band placeholder value. The diagnostics travel
//! upward inside `Failure` events so authoring mistakes surface without
//! crashing the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Result alias for evaluation, carrying diagnostics on failure.
pub type EvalResult<T> = std::result::Result<T, Diagnostics>;

/// A single diagnostic message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Human-readable description of the problem.
    pub message: String,
}

impl Diagnostic {
    /// Create a diagnostic from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Structured errors and warnings produced by evaluation or preparation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Fatal problems; the evaluated result is unusable.
    pub errors: Vec<Diagnostic>,
    /// Non-fatal observations.
    pub warnings: Vec<Diagnostic>,
}

impl Diagnostics {
    /// Create diagnostics holding a single error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            errors: vec![Diagnostic::new(message)],
            warnings: Vec::new(),
        }
    }

    /// Whether no errors are present.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fold another set of diagnostics into this one.
    pub fn merge(&mut self, other: Diagnostics) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for diag in &self.errors {
            if !first {
                write!(f, "; ")?;
            }
            write!(f, "{}", diag.message)?;
            first = false;
        }
        if first {
            write!(f, "no errors")?;
        }
        Ok(())
    }
}

impl std::error::Error for Diagnostics {}

/// Stack of variable scopes, innermost last.
///
/// Cloning is cheap enough for protocol-sized trees; each composite that
/// introduces a binding derives a child stack with [`EvalStack::child_with`]
/// rather than mutating its parent.
#[derive(Clone, Debug, Default)]
pub struct EvalStack {
    frames: Vec<HashMap<String, Value>>,
}

impl EvalStack {
    /// Create an empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a child environment with one additional binding.
    pub fn child_with(&self, name: impl Into<String>, value: Value) -> Self {
        let mut frames = self.frames.clone();
        let mut frame = HashMap::new();
        frame.insert(name.into(), value);
        frames.push(frame);
        Self { frames }
    }

    /// Look a variable up, innermost scope first.
    pub fn lookup(&self, name: &str) -> Option<&Value> {
        self.frames.iter().rev().find_map(|frame| frame.get(name))
    }
}

/// A repeat count: either statically bounded or unbounded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Count {
    /// Run exactly this many iterations.
    Finite(u64),
    /// Run until halted.
    Forever,
}

/// A minimal expression: literal, `forever`, or variable reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    /// Integer literal.
    Int(u64),
    /// The unbounded sentinel.
    Forever,
    /// Reference into the evaluation environment.
    Var(String),
}

impl Expr {
    /// Evaluate to a repeat count against the given environment.
    pub fn evaluate(&self, stack: &EvalStack) -> EvalResult<Count> {
        match self {
            Expr::Int(n) => Ok(Count::Finite(*n)),
            Expr::Forever => Ok(Count::Forever),
            Expr::Var(name) => match stack.lookup(name) {
                Some(Value::Number(n)) => n.as_u64().map(Count::Finite).ok_or_else(|| {
                    Diagnostics::error(format!(
                        "variable '{name}' is not a non-negative integer: {n}"
                    ))
                }),
                Some(Value::String(s)) if s == "forever" => Ok(Count::Forever),
                Some(other) => Err(Diagnostics::error(format!(
                    "variable '{name}' cannot be used as a count: {other}"
                ))),
                None => Err(Diagnostics::error(format!("undefined variable '{name}'"))),
            },
        }
    }

    /// Count known without an environment, if any.
    ///
    /// Variable references cannot be resolved statically and yield `None`,
    /// which composites report as an unknown duration.
    pub fn static_count(&self) -> Option<Count> {
        match self {
            Expr::Int(n) => Some(Count::Finite(*n)),
            Expr::Forever => Some(Count::Forever),
            Expr::Var(_) => None,
        }
    }
}
