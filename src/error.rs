//! Error types for docql-core.
//!
//! Three disjoint failure kinds cross the crate boundary: a malformed wire
//! message blames the client library, a well-formed but ill-typed query
//! blames the user who wrote it, and everything discovered during
//! evaluation is a runtime error. The latter two carry the descent
//! backtrace so the caller can point at the offending subtree.

use std::fmt;

use crate::backtrace::Backtrace;

/// DocQL error type
#[derive(Debug, Clone, PartialEq)]
pub enum QlError {
    /// The wire message violates the schema. The fault is in the client
    /// library, not in the user's query, so no backtrace is attached.
    BadProtobuf(String),

    /// The query tree is well-formed but failed typechecking.
    BadQuery { message: String, backtrace: Backtrace },

    /// Evaluation failed: missing attribute, divide by zero, failed
    /// external script, unresolved table, failed write, cancellation.
    Runtime { message: String, backtrace: Backtrace },
}

impl fmt::Display for QlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QlError::BadProtobuf(message) => write!(f, "bad protocol buffer: {message}"),
            QlError::BadQuery { message, .. } => write!(f, "bad query: {message}"),
            QlError::Runtime { message, .. } => write!(f, "runtime error: {message}"),
        }
    }
}

impl std::error::Error for QlError {}

/// Result type for DocQL operations
pub type QlResult<T> = Result<T, QlError>;

impl QlError {
    pub fn bad_protobuf(message: impl Into<String>) -> Self {
        QlError::BadProtobuf(message.into())
    }

    pub fn bad_query(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        QlError::BadQuery {
            message: message.into(),
            backtrace: backtrace.clone(),
        }
    }

    pub fn runtime(message: impl Into<String>, backtrace: &Backtrace) -> Self {
        QlError::Runtime {
            message: message.into(),
            backtrace: backtrace.clone(),
        }
    }

    /// Runtime error raised by an external collaborator (table handle,
    /// script pool). Carries no position until the evaluator locates it
    /// with [`QlError::at`].
    pub fn source(message: impl Into<String>) -> Self {
        QlError::Runtime {
            message: message.into(),
            backtrace: Backtrace::new(),
        }
    }

    /// Attach a backtrace to an unlocated runtime error. Errors that
    /// already carry a position are passed through unchanged.
    pub fn at(self, bt: &Backtrace) -> Self {
        match self {
            QlError::Runtime { message, backtrace } if backtrace.is_empty() => QlError::Runtime {
                message,
                backtrace: bt.clone(),
            },
            other => other,
        }
    }

    /// The descent backtrace, if this error kind carries one.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            QlError::BadProtobuf(_) => None,
            QlError::BadQuery { backtrace, .. } | QlError::Runtime { backtrace, .. } => {
                Some(backtrace)
            }
        }
    }
}

impl serde::Serialize for QlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = QlError::bad_protobuf("READ query has no read subtree");
        assert_eq!(
            err.to_string(),
            "bad protocol buffer: READ query has no read subtree"
        );

        let bt = Backtrace::new().descend("argument:1");
        let err = QlError::bad_query("expected type json, got stream", &bt);
        assert_eq!(err.to_string(), "bad query: expected type json, got stream");

        let err = QlError::runtime("division by zero", &bt);
        assert_eq!(err.to_string(), "runtime error: division by zero");
    }

    #[test]
    fn test_at_locates_source_errors() {
        let bt = Backtrace::new().descend("key");
        let err = QlError::source("table gone").at(&bt);
        assert_eq!(err.backtrace(), Some(&bt));

        // An error that already has a position keeps it.
        let other = Backtrace::new().descend("predicate");
        let err = QlError::runtime("no attribute", &other).at(&bt);
        assert_eq!(err.backtrace(), Some(&other));
    }

    #[test]
    fn test_bad_protobuf_has_no_backtrace() {
        assert!(QlError::bad_protobuf("x").backtrace().is_none());
    }
}
