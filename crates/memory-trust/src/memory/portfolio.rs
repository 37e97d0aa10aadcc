//! Portfolio exchange document (`memory-portfolio/v1`).
//!
//! Export carries every record as stored, including redaction markers and vault references.
//! Import silently drops quarantined records; everything else is handed to
//! `MemoryStore::import`, which re-appends it as untrusted.

use super::entry::{MemoryEntry, TrustLevel};
use crate::error::{Result, TrustError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FORMAT: &str = "memory-portfolio/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortfolioDocument {
    format: String,
    exported_at: DateTime<Utc>,
    entries: Vec<MemoryEntry>,
}

pub fn serialize(entries: &[MemoryEntry]) -> Result<String> {
    let doc = PortfolioDocument {
        format: FORMAT.to_string(),
        exported_at: Utc::now(),
        entries: entries.to_vec(),
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

pub fn deserialize(text: &str) -> Result<Vec<MemoryEntry>> {
    let doc: PortfolioDocument = serde_json::from_str(text)?;
    if doc.format != FORMAT {
        return Err(TrustError::UnsupportedFormat(doc.format));
    }
    let total = doc.entries.len();
    let kept: Vec<MemoryEntry> = doc
        .entries
        .into_iter()
        .filter(|e| e.trust_level != TrustLevel::Quarantined)
        .collect();
    if kept.len() < total {
        tracing::debug!(
            target: "memtrust::store",
            dropped = total - kept.len(),
            "quarantined records dropped from portfolio"
        );
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_format() {
        let text = r#"{"format":"memory-portfolio/v0","exportedAt":"2026-01-01T00:00:00Z","entries":[]}"#;
        assert!(matches!(deserialize(text), Err(TrustError::UnsupportedFormat(f)) if f == "memory-portfolio/v0"));
    }

    #[test]
    fn empty_document() {
        let text = serialize(&[]).unwrap();
        assert!(text.contains(FORMAT));
        assert!(deserialize(&text).unwrap().is_empty());
    }
}
