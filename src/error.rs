//! Error types surfaced by concretization.
//!
//! Subsystems that live outside a solve (recipe loading, configuration, the
//! installed database, layouts, builders) keep their own error enums next to
//! their code.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::unsat_core::CoreConstraint;

/// A spec or version string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at offset {offset} in `{input}`")]
pub struct ParseError {
    pub input: String,
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub(crate) fn new(input: &str, offset: usize, message: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            offset,
            message: message.into(),
        }
    }
}

/// Two constraints on the same spec field cannot both hold.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("conflicting {field} on {package}: `{left}` vs `{right}`")]
pub struct ConflictError {
    /// Package the field belongs to, or `anonymous spec`.
    pub package: String,
    /// Which field clashed (`version`, `variant 'shared'`, `compiler`, ...).
    pub field: String,
    /// The value coming from the left-hand operand.
    pub left: String,
    /// The value coming from the right-hand operand.
    pub right: String,
}

/// Why a variant assignment was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidVariantReason {
    /// The recipe declares no such variant.
    Undeclared,
    /// The value lies outside the declared domain.
    OutOfDomain { value: String, allowed: Vec<String> },
    /// A single-valued variant was given several values.
    MultipleValues,
    /// The variant only exists under a `when` condition that cannot hold.
    ConditionUnmet { when: String },
}

impl fmt::Display for InvalidVariantReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidVariantReason::Undeclared => write!(f, "no such variant"),
            InvalidVariantReason::OutOfDomain { value, allowed } => {
                write!(f, "value `{value}` not in {{{}}}", allowed.join(", "))
            }
            InvalidVariantReason::MultipleValues => {
                write!(f, "single-valued variant given several values")
            }
            InvalidVariantReason::ConditionUnmet { when } => {
                write!(f, "only available when `{when}`")
            }
        }
    }
}

/// A variant assignment violates its declaration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid variant `{variant}` for {package}: {reason}")]
pub struct InvalidVariantError {
    pub package: String,
    pub variant: String,
    pub reason: InvalidVariantReason,
}

/// No assignment satisfies the request.
///
/// `core` is a minimal set of constraints that cannot hold together:
/// dropping any single member makes the rest satisfiable.
#[derive(Debug, Clone, Error)]
pub struct UnsatisfiableError {
    pub core: Vec<CoreConstraint>,
    /// The solver's own account of the conflict.
    pub explanation: String,
}

impl fmt::Display for UnsatisfiableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no valid concretization exists")?;
        if self.core.is_empty() {
            writeln!(f, "the recipes are inconsistent on their own")?;
        } else {
            writeln!(f, "these constraints cannot be satisfied together:")?;
            for c in &self.core {
                writeln!(f, "  - {}", c.description)?;
            }
        }
        write!(f, "{}", self.explanation)
    }
}

/// Everything that can stop a single concretization request.
#[derive(Debug, Error)]
pub enum ConcretizeError {
    #[error("unknown package `{name}` required by {needed_by}")]
    UnknownPackage { name: String, needed_by: String },

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    InvalidVariant(#[from] InvalidVariantError),

    #[error(transparent)]
    Unsatisfiable(#[from] UnsatisfiableError),

    /// The solver produced a graph with a cycle. Internal invariant violation.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("solver exceeded its time budget of {budget:?}")]
    SolveTimeout { budget: Duration },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no compilers configured")]
    NoCompilers,

    /// The solver's model contradicts the recipes it was built from.
    #[error("inconsistent solver model: {0}")]
    Inconsistent(String),
}

pub type Result<T> = std::result::Result<T, ConcretizeError>;
