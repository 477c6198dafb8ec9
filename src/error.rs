//! Error types for duckflow.
//!
//! All errors that can occur within the library are represented by
//! [`DuckFlowError`]. Errors are propagated via `Result<T, DuckFlowError>`
//! throughout the codebase; there is no local recovery. A failure inside a
//! step's `execute` aborts the current run, leaves already-finished
//! predecessors marked as executed, and surfaces to the caller of `start`
//! wrapped in [`DuckFlowError::StepFailed`] so the offending step is named
//! in the message. Partial results stay in the engine for debugging;
//! recovery is an explicit `completed()` call.
//!
//! # Error Classification
//!
//! Errors fall into five categories, exposed through [`DuckFlowError::kind`]:
//! - **Configuration** — a required parameter is missing or invalid at
//!   construction time.
//! - **Resolution** — a primary key cannot be derived from any source.
//! - **Schema** — table creation without columns, mutation of a synonym.
//! - **Graph** — cycles or dangling step references in the dataflow.
//! - **Engine** — pass-through of adapter failures and unsupported
//!   operations.

use std::fmt;

/// Primary error type for the library.
#[derive(Debug, thiserror::Error)]
pub enum DuckFlowError {
    // ── Configuration errors ─────────────────────────────────────────────
    /// A required parameter is missing or invalid at construction time.
    #[error("configuration error: {0}")]
    Configuration(String),

    // ── Resolution errors ────────────────────────────────────────────────
    /// No primary key could be derived from the arguments or the catalog.
    #[error("no primary key: {0}")]
    NoPrimaryKey(String),

    // ── Schema errors ────────────────────────────────────────────────────
    /// A schema operation is invalid (empty table, synonym mutation, ...).
    #[error("schema error: {0}")]
    Schema(String),

    // ── Graph errors ─────────────────────────────────────────────────────
    /// Adding this edge would create a cycle in the dataflow graph.
    #[error("cycle detected in dataflow graph: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A step reference does not point at a node of this dataflow.
    #[error("unknown step: {0}")]
    UnknownStep(String),

    /// A step's execute failed; carries the step name for the caller.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<DuckFlowError>,
    },

    // ── Engine errors ────────────────────────────────────────────────────
    /// Pass-through of an engine adapter failure.
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine adapter does not provide this operation.
    #[error("unsupported engine operation: {0}")]
    Unsupported(String),
}

/// Classification of an error for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Resolution,
    Schema,
    Graph,
    Engine,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "CONFIGURATION"),
            ErrorKind::Resolution => write!(f, "RESOLUTION"),
            ErrorKind::Schema => write!(f, "SCHEMA"),
            ErrorKind::Graph => write!(f, "GRAPH"),
            ErrorKind::Engine => write!(f, "ENGINE"),
        }
    }
}

impl DuckFlowError {
    /// Classify the error.
    ///
    /// A [`DuckFlowError::StepFailed`] wrapper reports the kind of the
    /// underlying error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DuckFlowError::Configuration(_) => ErrorKind::Configuration,
            DuckFlowError::NoPrimaryKey(_) => ErrorKind::Resolution,
            DuckFlowError::Schema(_) => ErrorKind::Schema,
            DuckFlowError::CycleDetected(_) | DuckFlowError::UnknownStep(_) => ErrorKind::Graph,
            DuckFlowError::StepFailed { source, .. } => source.kind(),
            DuckFlowError::Engine(_) | DuckFlowError::Unsupported(_) => ErrorKind::Engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert_eq!(
            DuckFlowError::Configuration("x".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            DuckFlowError::NoPrimaryKey("x".into()).kind(),
            ErrorKind::Resolution
        );
        assert_eq!(DuckFlowError::Schema("x".into()).kind(), ErrorKind::Schema);
        assert_eq!(
            DuckFlowError::CycleDetected(vec![]).kind(),
            ErrorKind::Graph
        );
        assert_eq!(
            DuckFlowError::UnknownStep("x".into()).kind(),
            ErrorKind::Graph
        );
        assert_eq!(DuckFlowError::Engine("x".into()).kind(), ErrorKind::Engine);
        assert_eq!(
            DuckFlowError::Unsupported("x".into()).kind(),
            ErrorKind::Engine
        );
    }

    #[test]
    fn test_step_failed_reports_inner_kind() {
        let err = DuckFlowError::StepFailed {
            step: "compare customers".into(),
            source: Box::new(DuckFlowError::NoPrimaryKey("no pk".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Resolution);
        let msg = format!("{err}");
        assert!(msg.contains("compare customers"), "step name in message: {msg}");
        assert!(msg.contains("no pk"), "cause in message: {msg}");
    }

    #[test]
    fn test_cycle_error_message_joins_names() {
        let err = DuckFlowError::CycleDetected(vec!["a".into(), "b".into(), "a".into()]);
        assert_eq!(
            format!("{err}"),
            "cycle detected in dataflow graph: a -> b -> a"
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Configuration.to_string(), "CONFIGURATION");
        assert_eq!(ErrorKind::Resolution.to_string(), "RESOLUTION");
        assert_eq!(ErrorKind::Engine.to_string(), "ENGINE");
    }
}
