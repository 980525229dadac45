//! Error taxonomy for the Distributed Cluster Harness.
//!
//! Every failure a scenario can observe is one of the variants below, and
//! exactly one: a transport-level failure is never reported as a command
//! rejection, a command rejection is never reported as an assertion
//! mismatch. Callers pattern-match on the variant to pick a recovery path
//! (a stepdown call site tolerates `Transport`, nothing else does).
//!
//! | Variant              | Meaning                                        |
//! |----------------------|------------------------------------------------|
//! | Transport            | Connection reset/refused/timed out at the wire |
//! | CommandFailed        | Well-formed rejection with a server error code |
//! | UnexpectedSuccess    | Command succeeded where failure was required   |
//! | WrongErrorCode       | Command failed with the wrong server code      |
//! | ConvergenceTimeout   | A polled condition never became true in time   |
//! | AssertionFailed      | Expected/actual mismatch                       |
//! | TopologyInit         | Cluster bring-up failed                        |
//! | Internal             | Harness-internal fault (task panic, bad state) |

pub mod catalog;

pub use catalog::{ServerErrorCategory, ServerErrorCode};

use std::time::Duration;
use thiserror::Error;

/// Transport-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Peer closed the connection mid-exchange.
    ConnectionReset,
    /// Peer is not accepting connections.
    ConnectionRefused,
    /// No response within the socket-level deadline.
    Timeout,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionReset => write!(f, "connection reset"),
            Self::ConnectionRefused => write!(f, "connection refused"),
            Self::Timeout => write!(f, "timed out"),
        }
    }
}

/// Error type shared by every harness component.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The connection itself failed; no server response exists.
    #[error("transport failure ({kind}) against {endpoint}")]
    Transport { endpoint: String, kind: TransportKind },

    /// The server returned a well-formed error response.
    #[error("command {command} failed with code {code} ({}): {message}", catalog::code_name(*.code))]
    CommandFailed {
        command: String,
        code: i32,
        message: String,
    },

    /// A command expected to fail succeeded instead.
    #[error("command {command} unexpectedly succeeded (expected code {expected})")]
    UnexpectedSuccess {
        command: String,
        expected: ServerErrorCode,
    },

    /// A command failed, but with a different code than required.
    #[error(
        "command {command} failed with code {actual} ({}), expected {expected} ({}): {message}",
        catalog::code_name(*.actual),
        .expected.name()
    )]
    WrongErrorCode {
        command: String,
        expected: ServerErrorCode,
        actual: i32,
        message: String,
    },

    /// A polled predicate never became true within its bound.
    #[error("'{goal}' not satisfied within {timeout:?}; last observed: {last_context}")]
    ConvergenceTimeout {
        goal: String,
        timeout: Duration,
        last_context: String,
    },

    /// Expected/actual mismatch raised by the assertion engine.
    #[error("assertion failed: {context}\n  expected: {expected}\n  actual:   {actual}")]
    AssertionFailed {
        context: String,
        expected: String,
        actual: String,
    },

    /// Cluster bring-up failed; partially started members are torn down.
    #[error("topology bring-up failed: {0}")]
    TopologyInit(String),

    /// Harness-internal fault, e.g. a background task panicked.
    #[error("internal harness error: {0}")]
    Internal(String),
}

impl HarnessError {
    pub fn transport(endpoint: impl std::fmt::Display, kind: TransportKind) -> Self {
        Self::Transport {
            endpoint: endpoint.to_string(),
            kind,
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_command_failed(&self) -> bool {
        matches!(self, Self::CommandFailed { .. })
    }

    pub fn is_assertion(&self) -> bool {
        matches!(
            self,
            Self::AssertionFailed { .. } | Self::UnexpectedSuccess { .. } | Self::WrongErrorCode { .. }
        )
    }

    pub fn is_convergence_timeout(&self) -> bool {
        matches!(self, Self::ConvergenceTimeout { .. })
    }

    /// Numeric server error code, when this failure carries one.
    pub fn server_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } => Some(*code),
            Self::WrongErrorCode { actual, .. } => Some(*actual),
            _ => None,
        }
    }
}

/// Result type used throughout the harness.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_classification_is_exclusive() {
        let transport = HarnessError::transport("db0:27017", TransportKind::ConnectionReset);
        let failed = HarnessError::CommandFailed {
            command: "find".into(),
            code: 50,
            message: "operation exceeded time limit".into(),
        };
        assert!(transport.is_transport() && !transport.is_command_failed());
        assert!(failed.is_command_failed() && !failed.is_transport());
        assert!(!failed.is_assertion());
    }

    #[test]
    fn test_command_failed_display_names_the_code() {
        let err = HarnessError::CommandFailed {
            command: "count".into(),
            code: 50,
            message: "operation exceeded time limit".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("count"), "display missing command: {msg}");
        assert!(msg.contains("50"), "display missing code: {msg}");
        assert!(msg.contains("MaxTimeExpired"), "display missing name: {msg}");
    }

    #[test]
    fn test_wrong_error_code_carries_both_sides() {
        let err = HarnessError::WrongErrorCode {
            command: "insert".into(),
            expected: ServerErrorCode::DuplicateKey,
            actual: 26,
            message: "ns not found".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("26") && msg.contains("11000"), "{msg}");
        assert_eq!(err.server_code(), Some(26));
    }

    #[test]
    fn test_convergence_timeout_carries_last_context() {
        let err = HarnessError::ConvergenceTimeout {
            goal: "exactly one primary".into(),
            timeout: Duration::from_secs(5),
            last_context: "2 primaries visible".into(),
        };
        assert!(err.to_string().contains("2 primaries visible"));
        assert!(err.is_convergence_timeout());
    }
}
