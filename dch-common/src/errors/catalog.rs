//! Server error code catalog.
//!
//! Numeric error codes returned by the database server, as asserted on by
//! scenarios. The harness never interprets these beyond equality checks and
//! the caller-designated transient-retry sets; the catalog exists so that
//! failures print a name next to the number and so scenarios can spell
//! `ServerErrorCode::MaxTimeExpired` instead of a bare `50`.
//!
//! # Categories
//!
//! | Category    | Description                                   |
//! |-------------|-----------------------------------------------|
//! | Request     | Malformed or unsupported request              |
//! | Execution   | Command admitted but failed while running     |
//! | Replication | Replica-set state and election related        |
//! | Sharding    | Router, shard registry, and chunk migration   |
//! | WriteConflict | Duplicate keys and concurrent-write outcomes |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad grouping of server error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorCategory {
    Request,
    Execution,
    Replication,
    Sharding,
    WriteConflict,
}

/// Well-known numeric error codes the harness and its scenarios use.
///
/// The numeric values are the server's wire values; `from_code` returns
/// `None` for codes the catalog does not name, which is fine: comparisons
/// are numeric and unknown codes still flow through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[non_exhaustive]
pub enum ServerErrorCode {
    // -- Request (malformed / unsupported) --
    BadValue,
    FailedToParse,
    TypeMismatch,
    IllegalOperation,
    NamespaceNotFound,
    IndexNotFound,
    NamespaceExists,
    CommandNotFound,
    InvalidOptions,
    Unauthorized,

    // -- Execution --
    InternalError,
    HostUnreachable,
    MaxTimeExpired,
    OperationFailed,
    NetworkTimeout,
    ConflictingOperationInProgress,
    FailPointEnabled,
    Interrupted,
    CursorNotFound,

    // -- Replication --
    NotWritablePrimary,
    NotYetInitialized,
    NodeNotFound,
    NewReplicaSetConfigurationIncompatible,
    PrimarySteppedDown,
    InterruptedDueToReplStateChange,
    WriteConcernTimeout,
    ReadConcernMajorityNotAvailableYet,
    NotPrimaryOrSecondary,

    // -- Sharding --
    ShardNotFound,
    StaleConfig,
    ChunkRangeCleanupPending,

    // -- Write conflicts --
    DuplicateKey,
    NoSuchTransaction,
}

impl ServerErrorCode {
    /// The numeric wire value of this code.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadValue => 2,
            Self::FailedToParse => 9,
            Self::TypeMismatch => 14,
            Self::IllegalOperation => 20,
            Self::NamespaceNotFound => 26,
            Self::IndexNotFound => 27,
            Self::NamespaceExists => 48,
            Self::CommandNotFound => 59,
            Self::InvalidOptions => 72,
            Self::Unauthorized => 13,

            Self::InternalError => 1,
            Self::HostUnreachable => 6,
            Self::MaxTimeExpired => 50,
            Self::OperationFailed => 96,
            Self::NetworkTimeout => 89,
            Self::ConflictingOperationInProgress => 117,
            Self::FailPointEnabled => 197,
            Self::Interrupted => 11601,
            Self::CursorNotFound => 43,

            Self::NotWritablePrimary => 10107,
            Self::NotYetInitialized => 94,
            Self::NodeNotFound => 74,
            Self::NewReplicaSetConfigurationIncompatible => 103,
            Self::PrimarySteppedDown => 189,
            Self::InterruptedDueToReplStateChange => 11602,
            Self::WriteConcernTimeout => 64,
            Self::ReadConcernMajorityNotAvailableYet => 134,
            Self::NotPrimaryOrSecondary => 13436,

            Self::ShardNotFound => 70,
            Self::StaleConfig => 13388,
            Self::ChunkRangeCleanupPending => 302,

            Self::DuplicateKey => 11000,
            Self::NoSuchTransaction => 251,
        }
    }

    /// The symbolic name, as it appears in server responses and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BadValue => "BadValue",
            Self::FailedToParse => "FailedToParse",
            Self::TypeMismatch => "TypeMismatch",
            Self::IllegalOperation => "IllegalOperation",
            Self::NamespaceNotFound => "NamespaceNotFound",
            Self::IndexNotFound => "IndexNotFound",
            Self::NamespaceExists => "NamespaceExists",
            Self::CommandNotFound => "CommandNotFound",
            Self::InvalidOptions => "InvalidOptions",
            Self::Unauthorized => "Unauthorized",

            Self::InternalError => "InternalError",
            Self::HostUnreachable => "HostUnreachable",
            Self::MaxTimeExpired => "MaxTimeExpired",
            Self::OperationFailed => "OperationFailed",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::ConflictingOperationInProgress => "ConflictingOperationInProgress",
            Self::FailPointEnabled => "FailPointEnabled",
            Self::Interrupted => "Interrupted",
            Self::CursorNotFound => "CursorNotFound",

            Self::NotWritablePrimary => "NotWritablePrimary",
            Self::NotYetInitialized => "NotYetInitialized",
            Self::NodeNotFound => "NodeNotFound",
            Self::NewReplicaSetConfigurationIncompatible => {
                "NewReplicaSetConfigurationIncompatible"
            }
            Self::PrimarySteppedDown => "PrimarySteppedDown",
            Self::InterruptedDueToReplStateChange => "InterruptedDueToReplStateChange",
            Self::WriteConcernTimeout => "WriteConcernTimeout",
            Self::ReadConcernMajorityNotAvailableYet => "ReadConcernMajorityNotAvailableYet",
            Self::NotPrimaryOrSecondary => "NotPrimaryOrSecondary",

            Self::ShardNotFound => "ShardNotFound",
            Self::StaleConfig => "StaleConfig",
            Self::ChunkRangeCleanupPending => "ChunkRangeCleanupPending",

            Self::DuplicateKey => "DuplicateKey",
            Self::NoSuchTransaction => "NoSuchTransaction",
        }
    }

    /// Category this code belongs to.
    pub fn category(&self) -> ServerErrorCategory {
        match self {
            Self::BadValue
            | Self::FailedToParse
            | Self::TypeMismatch
            | Self::IllegalOperation
            | Self::NamespaceNotFound
            | Self::IndexNotFound
            | Self::NamespaceExists
            | Self::CommandNotFound
            | Self::InvalidOptions
            | Self::Unauthorized => ServerErrorCategory::Request,

            Self::InternalError
            | Self::HostUnreachable
            | Self::MaxTimeExpired
            | Self::OperationFailed
            | Self::NetworkTimeout
            | Self::ConflictingOperationInProgress
            | Self::FailPointEnabled
            | Self::Interrupted
            | Self::CursorNotFound => ServerErrorCategory::Execution,

            Self::NotWritablePrimary
            | Self::NotYetInitialized
            | Self::NodeNotFound
            | Self::NewReplicaSetConfigurationIncompatible
            | Self::PrimarySteppedDown
            | Self::InterruptedDueToReplStateChange
            | Self::WriteConcernTimeout
            | Self::ReadConcernMajorityNotAvailableYet
            | Self::NotPrimaryOrSecondary => ServerErrorCategory::Replication,

            Self::ShardNotFound | Self::StaleConfig | Self::ChunkRangeCleanupPending => {
                ServerErrorCategory::Sharding
            }

            Self::DuplicateKey | Self::NoSuchTransaction => ServerErrorCategory::WriteConflict,
        }
    }

    /// All cataloged codes, for reverse lookup.
    pub fn all() -> &'static [ServerErrorCode] {
        &[
            Self::BadValue,
            Self::FailedToParse,
            Self::TypeMismatch,
            Self::IllegalOperation,
            Self::NamespaceNotFound,
            Self::IndexNotFound,
            Self::NamespaceExists,
            Self::CommandNotFound,
            Self::InvalidOptions,
            Self::Unauthorized,
            Self::InternalError,
            Self::HostUnreachable,
            Self::MaxTimeExpired,
            Self::OperationFailed,
            Self::NetworkTimeout,
            Self::ConflictingOperationInProgress,
            Self::FailPointEnabled,
            Self::Interrupted,
            Self::CursorNotFound,
            Self::NotWritablePrimary,
            Self::NotYetInitialized,
            Self::NodeNotFound,
            Self::NewReplicaSetConfigurationIncompatible,
            Self::PrimarySteppedDown,
            Self::InterruptedDueToReplStateChange,
            Self::WriteConcernTimeout,
            Self::ReadConcernMajorityNotAvailableYet,
            Self::NotPrimaryOrSecondary,
            Self::ShardNotFound,
            Self::StaleConfig,
            Self::ChunkRangeCleanupPending,
            Self::DuplicateKey,
            Self::NoSuchTransaction,
        ]
    }

    /// Reverse lookup by numeric value.
    pub fn from_code(code: i32) -> Option<ServerErrorCode> {
        Self::all().iter().copied().find(|c| c.code() == code)
    }

    /// Codes a write legitimately surfaces while a replica set changes
    /// primaries; used as the caller-designated transient set in failover
    /// scenarios.
    pub fn repl_state_change_codes() -> &'static [ServerErrorCode] {
        &[
            Self::NotWritablePrimary,
            Self::PrimarySteppedDown,
            Self::InterruptedDueToReplStateChange,
        ]
    }
}

impl fmt::Display for ServerErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

/// Name for an arbitrary numeric code: the catalog name when known,
/// otherwise "unknown".
pub fn code_name(code: i32) -> &'static str {
    ServerErrorCode::from_code(code)
        .map(|c| c.name())
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_values_are_unique() {
        let all = ServerErrorCode::all();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "{} and {} share a code", a, b);
            }
        }
    }

    #[test]
    fn test_round_trip_through_numeric_code() {
        for code in ServerErrorCode::all() {
            assert_eq!(ServerErrorCode::from_code(code.code()), Some(*code));
        }
    }

    #[test]
    fn test_well_known_values() {
        assert_eq!(ServerErrorCode::MaxTimeExpired.code(), 50);
        assert_eq!(ServerErrorCode::DuplicateKey.code(), 11000);
        assert_eq!(ServerErrorCode::NotWritablePrimary.code(), 10107);
        assert_eq!(ServerErrorCode::WriteConcernTimeout.code(), 64);
    }

    #[test]
    fn test_unknown_code_has_no_name() {
        assert_eq!(ServerErrorCode::from_code(-1), None);
        assert_eq!(code_name(-1), "unknown");
        assert_eq!(code_name(50), "MaxTimeExpired");
    }

    #[test]
    fn test_transient_repl_set_codes_are_replication_category() {
        for code in ServerErrorCode::repl_state_change_codes() {
            assert_eq!(code.category(), ServerErrorCategory::Replication);
        }
    }
}
