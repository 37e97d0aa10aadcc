//! Pattern scanner: runs a versioned detector table over content under a hard deadline.
//!
//! Detectors execute on a detached thread. The calling thread stops waiting once the
//! per-entry budget is spent; every detector that has not reported by then counts as a
//! `suspicious` finding under `scanner-timeout`. A hung detector can therefore cost
//! a thread, never a `clean` verdict.

use super::detectors;
use super::normalize::ScanText;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Rule id reported for detectors that missed the deadline.
pub const TIMEOUT_RULE_ID: &str = "scanner-timeout";

const EXCERPT_MAX_CHARS: usize = 80;

/// Classification of content. Ordered so that `max` is "worst verdict wins".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Suspicious,
    Malicious,
}

impl Verdict {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Suspicious => "suspicious",
            Self::Malicious => "malicious",
        }
    }
}

/// What a detector reports: a verdict and, when it can localize it, a raw-content span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub verdict: Verdict,
    /// Byte range in the raw content. `None` for whole-content findings (e.g. density).
    pub span: Option<Range<usize>>,
    pub note: Option<String>,
}

impl Finding {
    pub fn at(verdict: Verdict, span: Range<usize>) -> Self {
        Self {
            verdict,
            span: Some(span),
            note: None,
        }
    }

    pub fn whole(verdict: Verdict, note: impl Into<String>) -> Self {
        Self {
            verdict,
            span: None,
            note: Some(note.into()),
        }
    }
}

/// One row of the detector table: a rule id and a pure evaluation function.
#[derive(Clone, Copy)]
pub struct Detector {
    pub rule_id: &'static str,
    pub evaluate: fn(&ScanText) -> Vec<Finding>,
}

impl std::fmt::Debug for Detector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Detector").field("rule_id", &self.rule_id).finish()
    }
}

/// A versioned, closed set of detectors. Adding a rule is a table edit plus a version bump.
#[derive(Debug, Clone)]
pub struct Ruleset {
    version: u32,
    detectors: Vec<Detector>,
}

impl Ruleset {
    pub fn new(version: u32, detectors: Vec<Detector>) -> Self {
        Self { version, detectors }
    }

    /// The built-in detector table stamped with `version`.
    pub fn builtin(version: u32) -> Self {
        Self::new(version, detectors::BUILTIN.to_vec())
    }

    /// Returns a copy with `detector` appended.
    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detectors.push(detector);
        self
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn detectors(&self) -> &[Detector] {
        &self.detectors
    }

    pub fn rule_ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.detectors.iter().map(|d| d.rule_id)
    }
}

/// A located or whole-content match attributed to a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub rule_id: String,
    pub verdict: Verdict,
    pub span: Option<Range<usize>>,
    /// Short, truncated view of the matched text for audit reports. Never logged.
    pub excerpt: String,
}

/// Result of one `evaluate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub verdict: Verdict,
    pub matches: Vec<PatternMatch>,
    /// Per-rule outcome, one row per detector in the ruleset (timed-out rules are suspicious).
    pub rule_verdicts: Vec<(String, Verdict)>,
    pub ruleset_version: u32,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

impl ScanReport {
    /// Matches with a span, i.e. fragments that can be extracted.
    pub fn extractable(&self) -> impl Iterator<Item = &PatternMatch> {
        self.matches
            .iter()
            .filter(|m| m.verdict > Verdict::Clean && m.span.is_some())
    }
}

/// Stateless evaluator over a shared ruleset.
#[derive(Debug, Clone)]
pub struct PatternScanner {
    ruleset: Arc<Ruleset>,
    timeout: Duration,
}

impl PatternScanner {
    pub fn new(ruleset: Ruleset, timeout: Duration) -> Self {
        // Regex compilation must not eat into the first entry's scan budget.
        detectors::prime();
        Self {
            ruleset: Arc::new(ruleset),
            timeout,
        }
    }

    pub fn ruleset(&self) -> &Ruleset {
        &self.ruleset
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Classifies `content`. Blocks the caller for at most the configured timeout.
    pub fn evaluate(&self, content: &str) -> ScanReport {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let detector_count = self.ruleset.detectors.len();
        let (tx, rx) = mpsc::channel::<(usize, Vec<Finding>)>();

        let ruleset = Arc::clone(&self.ruleset);
        let owned = content.to_string();
        let spawned = std::thread::Builder::new()
            .name("memtrust-scan".into())
            .spawn(move || {
                let text = ScanText::new(owned);
                for (idx, detector) in ruleset.detectors.iter().enumerate() {
                    let findings = (detector.evaluate)(&text);
                    if tx.send((idx, findings)).is_err() {
                        // Caller gave up at the deadline.
                        return;
                    }
                }
            });

        let mut results: Vec<Option<Vec<Finding>>> = vec![None; detector_count];
        let mut received = 0;
        if spawned.is_ok() {
            while received < detector_count {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match rx.recv_timeout(remaining) {
                    Ok((idx, findings)) => {
                        results[idx] = Some(findings);
                        received += 1;
                    }
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        } else {
            warn!(target: "memtrust::scanner", "failed to spawn scan thread; treating content as suspicious");
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.assemble(content, results, elapsed_ms)
    }

    fn assemble(&self, content: &str, results: Vec<Option<Vec<Finding>>>, elapsed_ms: u64) -> ScanReport {
        let mut matches = Vec::new();
        let mut rule_verdicts = Vec::with_capacity(results.len());
        let mut timed_out_rules = Vec::new();

        for (detector, outcome) in self.ruleset.detectors.iter().zip(results) {
            match outcome {
                Some(findings) => {
                    let worst = findings.iter().map(|f| f.verdict).max().unwrap_or(Verdict::Clean);
                    rule_verdicts.push((detector.rule_id.to_string(), worst));
                    for f in findings.into_iter().filter(|f| f.verdict > Verdict::Clean) {
                        let excerpt = match (&f.span, &f.note) {
                            (Some(span), _) => excerpt_of(content, span.clone()),
                            (None, Some(note)) => note.clone(),
                            (None, None) => String::new(),
                        };
                        matches.push(PatternMatch {
                            rule_id: detector.rule_id.to_string(),
                            verdict: f.verdict,
                            span: f.span,
                            excerpt,
                        });
                    }
                }
                None => {
                    rule_verdicts.push((detector.rule_id.to_string(), Verdict::Suspicious));
                    timed_out_rules.push(detector.rule_id);
                }
            }
        }

        let timed_out = !timed_out_rules.is_empty();
        if timed_out {
            warn!(
                target: "memtrust::scanner",
                rules = ?timed_out_rules,
                elapsed_ms,
                budget_ms = self.timeout.as_millis() as u64,
                "scan deadline exceeded; unfinished detectors count as suspicious"
            );
            matches.push(PatternMatch {
                rule_id: TIMEOUT_RULE_ID.to_string(),
                verdict: Verdict::Suspicious,
                span: None,
                excerpt: format!("unfinished: {}", timed_out_rules.join(",")),
            });
        }

        let verdict = matches.iter().map(|m| m.verdict).max().unwrap_or(Verdict::Clean);
        ScanReport {
            verdict,
            matches,
            rule_verdicts,
            ruleset_version: self.ruleset.version,
            timed_out,
            elapsed_ms,
        }
    }
}

fn excerpt_of(content: &str, span: Range<usize>) -> String {
    let Some(slice) = content.get(span) else {
        return String::new();
    };
    let mut out: String = slice.chars().take(EXCERPT_MAX_CHARS).collect();
    if slice.chars().count() > EXCERPT_MAX_CHARS {
        out.push('…');
    }
    out
}
