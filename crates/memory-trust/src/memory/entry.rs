//! Memory entry records and their trust metadata.

use crate::config::FlaggedPolicy;
use crate::security::scanner::Verdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifier assigned by the store on append.
pub type EntryId = Uuid;

/// How safe an entry's content is to place directly in model context.
///
/// Every entry starts `Untrusted`. `Quarantined` is terminal and invisible to normal reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Not yet scanned under the active ruleset (or content changed since).
    Untrusted,
    /// Passed the scan; rendered plainly.
    Validated,
    /// Ambiguous; surfaced only inside warning delimiters.
    Flagged,
    /// Confirmed dangerous; never surfaced through normal reads.
    Quarantined,
}

impl TrustLevel {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Untrusted => "untrusted",
            Self::Validated => "validated",
            Self::Flagged => "flagged",
            Self::Quarantined => "quarantined",
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Quarantined)
    }
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Who may see an entry outside the local installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyLevel {
    Public,
    #[default]
    Private,
    Sensitive,
}

/// Outcome of the last validation pass that touched an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationStamp {
    /// Ruleset version the scan ran under.
    pub ruleset_version: u32,
    /// Hash of the content as it was scanned (before redaction).
    pub scanned_hash: String,
    pub verdict: Verdict,
    pub validated_at: DateTime<Utc>,
}

/// A single memory record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: EntryId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub trust_level: TrustLevel,
    /// Where the write came from (tool name, import source, ...). Provenance only; never grants trust.
    pub source_context: String,
    /// Vault keys of fragments extracted from this entry.
    #[serde(default)]
    pub extracted_pattern_refs: Vec<String>,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
    /// Bumped on every write; the optimistic-concurrency token.
    pub content_version: u64,
    /// sha-256 hex of `content` as currently stored.
    pub content_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationStamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl MemoryEntry {
    /// True when the validator still owes this entry a pass under `ruleset_version`.
    ///
    /// Quarantined entries never qualify. Flagged entries re-qualify on a newer ruleset,
    /// or after `policy` lets their flag expire.
    pub fn needs_validation(&self, ruleset_version: u32, policy: &FlaggedPolicy, now: DateTime<Utc>) -> bool {
        match self.trust_level {
            TrustLevel::Quarantined => false,
            TrustLevel::Untrusted => true,
            TrustLevel::Validated => self.stamped_before(ruleset_version),
            TrustLevel::Flagged => {
                if self.stamped_before(ruleset_version) {
                    return true;
                }
                match (policy.expiry(), &self.validation) {
                    (Some(ttl), Some(stamp)) => now - stamp.validated_at >= ttl,
                    _ => false,
                }
            }
        }
    }

    fn stamped_before(&self, ruleset_version: u32) -> bool {
        self.validation
            .as_ref()
            .map_or(true, |s| s.ruleset_version < ruleset_version)
    }
}

/// Caller-supplied metadata for `MemoryStore::append`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppendMetadata {
    pub source_context: String,
    #[serde(default)]
    pub privacy_level: PrivacyLevel,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Accepted for API compatibility and ignored: trust is never inherited from the caller.
    #[serde(default)]
    pub trust_hint: Option<TrustLevel>,
}

impl AppendMetadata {
    pub fn from_source(source_context: impl Into<String>) -> Self {
        Self {
            source_context: source_context.into(),
            ..Default::default()
        }
    }

    pub fn with_privacy(mut self, privacy_level: PrivacyLevel) -> Self {
        self.privacy_level = privacy_level;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_trust_hint(mut self, hint: TrustLevel) -> Self {
        self.trust_hint = Some(hint);
        self
    }
}

/// sha-256 hex digest of `content`.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
