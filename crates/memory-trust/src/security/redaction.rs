//! Span redaction: replaces extracted fragments with vault-reference markers.
//!
//! Overlapping or touching matches are merged first so each stored marker maps to exactly
//! one vault record. The merged span keeps the rule id of its worst match.

use super::scanner::{ScanReport, Verdict};
use std::ops::Range;

/// Prefix of every marker left in stored content.
pub const REDACTION_MARKER_PREFIX: &str = "[REDACTED_PATTERN";

/// A merged span scheduled for extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub span: Range<usize>,
    pub rule_id: String,
    pub verdict: Verdict,
}

/// Marker text for one extracted fragment.
pub fn marker(rule_id: &str, vault_key: &str) -> String {
    format!("{} rule={} ref={}]", REDACTION_MARKER_PREFIX, rule_id, vault_key)
}

/// Merges the report's located matches into non-overlapping extractions, ordered by position.
pub fn plan_extractions(report: &ScanReport, content: &str) -> Vec<Extraction> {
    let mut located: Vec<Extraction> = report
        .extractable()
        .filter_map(|m| {
            let span = m.span.clone()?;
            // Spans come from detectors; guard against anything not on a char boundary.
            (span.start < span.end && content.get(span.clone()).is_some()).then(|| Extraction {
                span,
                rule_id: m.rule_id.clone(),
                verdict: m.verdict,
            })
        })
        .collect();
    located.sort_by_key(|e| (e.span.start, std::cmp::Reverse(e.span.end)));

    let mut merged: Vec<Extraction> = Vec::with_capacity(located.len());
    for next in located {
        match merged.last_mut() {
            Some(cur) if next.span.start <= cur.span.end => {
                cur.span.end = cur.span.end.max(next.span.end);
                if next.verdict > cur.verdict {
                    cur.verdict = next.verdict;
                    cur.rule_id = next.rule_id;
                }
            }
            _ => merged.push(next),
        }
    }
    merged
}

/// Rebuilds `content` with each `(span, marker)` substituted. Spans must be sorted and disjoint.
pub fn apply(content: &str, replacements: &[(Range<usize>, String)]) -> String {
    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for (span, marker) in replacements {
        out.push_str(&content[cursor..span.start]);
        out.push_str(marker);
        cursor = span.end;
    }
    out.push_str(&content[cursor..]);
    out
}

/// Number of markers present in stored content.
pub fn count_markers(content: &str) -> usize {
    content.matches(REDACTION_MARKER_PREFIX).count()
}
