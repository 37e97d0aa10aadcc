//! Pipeline error taxonomy.
//!
//! | Variant | Caller reaction |
//! |---------|-----------------|
//! | `Storage` | retry with backoff; never silently dropped |
//! | `Conflict` | reload the entry and retry |
//! | `Vault(Decryption)` | fail closed; surfaced to audit tooling only |
//! | `InvariantViolation` | fatal to the validator worker that raised it |
//! | `QuarantineLeak` | fatal; a quarantined entry reached a render path |
//!
//! Scanner timeouts are not errors: the scanner reports them as a `suspicious` verdict.

use crate::memory::{EntryId, TrustLevel};
use crate::security::scanner::Verdict;
use crate::security::vault::VaultError;

pub type Result<T> = std::result::Result<T, TrustError>;

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("version conflict on entry {entry_id}: expected v{expected}, found {found}")]
    Conflict {
        entry_id: EntryId,
        expected: u64,
        /// `Deleted` when the entry vanished underneath the caller.
        found: VersionSeen,
    },

    #[error("entry {0} not found")]
    NotFound(EntryId),

    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error("illegal trust transition {from:?} + {verdict:?}")]
    InvariantViolation { from: TrustLevel, verdict: Verdict },

    #[error("quarantined entry {0} reached a render path")]
    QuarantineLeak(EntryId),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("unsupported portfolio format: {0}")]
    UnsupportedFormat(String),
}

impl TrustError {
    /// True for errors a caller should answer by reloading and retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True for errors that must take the raising validator worker down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. } | Self::QuarantineLeak(_))
    }
}

/// What the store found when a version check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSeen {
    Version(u64),
    Deleted,
}

impl std::fmt::Display for VersionSeen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Version(v) => write!(f, "v{}", v),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}
