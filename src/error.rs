//! Crate-wide error taxonomy.
//!
//! One enum covers every failure kind the library can surface. The
//! `Calculation` variant is the single kind callers need to catch for
//! "evaluation failed": the engine wraps any lower-level cause (division by
//! zero, missing variable, a user callable's own error) into it at the node
//! where the failure happened, carrying the node name and period.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Bad or missing definitions: unknown calculation method, malformed
    /// formula string, mismatched variable lists.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Configuration error scoped to the metric registry.
    #[error("metric error: {0}")]
    Metric(String),

    /// Configuration error scoped to a calculation strategy.
    #[error("strategy error: {0}")]
    Strategy(String),

    /// A node failed to produce a value for a period. Always carries the
    /// failing node's name, the period, and the underlying cause's message.
    #[error("calculation failed for node '{node}' in period '{period}': {message}")]
    Calculation {
        node: String,
        period: String,
        message: String,
    },

    /// Referential integrity: a missing node, or the wrong node kind for a
    /// requested operation.
    #[error("node error: {0}")]
    Node(String),

    /// A dependency cycle detected during topological ordering. The path
    /// lists the nodes forming the loop, first name repeated at the end.
    #[error("circular dependency: {}", .path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    /// An unknown or invalid period was requested.
    #[error("period error: {0}")]
    Period(String),

    /// An import/export payload was malformed.
    #[error("data validation error: {0}")]
    DataValidation(String),

    /// Arithmetic: a divisor was exactly zero.
    #[error("division by zero")]
    DivisionByZero,

    /// A storage backend failed, or was asked to overwrite an existing id.
    #[error("storage error: {0}")]
    Storage(String),

    /// A persisted bundle's checksum did not match its graph payload.
    /// Integrity violations are hard failures, never silently repaired.
    #[error("checksum mismatch for template '{template_id}': expected {expected}, found {actual}")]
    ChecksumMismatch {
        template_id: String,
        expected: String,
        actual: String,
    },
}

impl ModelError {
    /// Wraps an underlying cause into the calculation-error kind at the
    /// node/period where it surfaced.
    pub(crate) fn calculation(
        node: impl Into<String>,
        period: impl Into<String>,
        cause: impl std::fmt::Display,
    ) -> Self {
        ModelError::Calculation {
            node: node.into(),
            period: period.into(),
            message: cause.to_string(),
        }
    }
}
