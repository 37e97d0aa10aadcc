//! Security telemetry: rolling-window counters fed by the validator, sandbox and store events.
//!
//! Nothing here ever holds content. Events carry rule ids, verdicts, trust levels and
//! timestamps only, so snapshots and forwarded events are safe to ship off-box.

use crate::memory::{StoreEvent, TrustLevel};
use crate::security::scanner::{ScanReport, Verdict, TIMEOUT_RULE_ID};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Forwarding queue bound; oldest events are dropped first when nobody drains.
const OUTBOX_CAPACITY: usize = 10_000;

/// Normalized event for external forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Scan {
        rule_id: String,
        verdict: Verdict,
        at: DateTime<Utc>,
    },
    Transition {
        from: TrustLevel,
        to: TrustLevel,
        ruleset_version: u32,
        at: DateTime<Utc>,
    },
    RulesetDemotion {
        ruleset_version: u32,
        at: DateTime<Utc>,
    },
    SandboxRender {
        trust_level: TrustLevel,
        at: DateTime<Utc>,
    },
    Lifecycle {
        action: LifecycleAction,
        at: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Scan { at, .. }
            | Self::Transition { at, .. }
            | Self::RulesetDemotion { at, .. }
            | Self::SandboxRender { at, .. }
            | Self::Lifecycle { at, .. } => *at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleAction {
    Appended,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictCounts {
    pub clean: u64,
    pub suspicious: u64,
    pub malicious: u64,
}

impl VerdictCounts {
    fn bump(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Clean => self.clean += 1,
            Verdict::Suspicious => self.suspicious += 1,
            Verdict::Malicious => self.malicious += 1,
        }
    }
}

/// Local metrics export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub counts: BTreeMap<String, VerdictCounts>,
    #[serde(default)]
    pub sandbox_renders: BTreeMap<String, u64>,
    #[serde(default)]
    pub demotions: u64,
    #[serde(default)]
    pub transitions: BTreeMap<String, u64>,
    #[serde(default)]
    pub lifecycle: BTreeMap<String, u64>,
}

struct Inner {
    window: VecDeque<TelemetryEvent>,
    outbox: VecDeque<TelemetryEvent>,
}

impl Inner {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.window.front().map_or(false, |e| e.at() < cutoff) {
            self.window.pop_front();
        }
    }
}

pub struct SecurityTelemetry {
    span: Duration,
    inner: Mutex<Inner>,
}

impl SecurityTelemetry {
    pub fn new(span: Duration) -> Self {
        Self {
            span,
            inner: Mutex::new(Inner {
                window: VecDeque::new(),
                outbox: VecDeque::new(),
            }),
        }
    }

    /// 24-hour window.
    pub fn daily() -> Self {
        Self::new(Duration::hours(24))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, event: TelemetryEvent) {
        let mut inner = self.lock();
        if inner.outbox.len() >= OUTBOX_CAPACITY {
            inner.outbox.pop_front();
        }
        inner.outbox.push_back(event.clone());

        let cutoff = Utc::now() - self.span;
        inner.prune(cutoff);
        if event.at() >= cutoff {
            inner.window.push_back(event);
        }
    }

    /// One `Scan` event per rule in the report (timed-out rules count as suspicious).
    pub fn record_scan(&self, report: &ScanReport) {
        let at = Utc::now();
        for (rule_id, verdict) in &report.rule_verdicts {
            self.record(TelemetryEvent::Scan {
                rule_id: rule_id.clone(),
                verdict: *verdict,
                at,
            });
        }
        if report.timed_out {
            self.record(TelemetryEvent::Scan {
                rule_id: TIMEOUT_RULE_ID.to_string(),
                verdict: Verdict::Suspicious,
                at,
            });
        }
    }

    pub fn record_transition(&self, from: TrustLevel, to: TrustLevel, ruleset_version: u32) {
        self.record(TelemetryEvent::Transition {
            from,
            to,
            ruleset_version,
            at: Utc::now(),
        });
    }

    pub fn record_demotion(&self, ruleset_version: u32) {
        self.record(TelemetryEvent::RulesetDemotion {
            ruleset_version,
            at: Utc::now(),
        });
    }

    pub fn record_render(&self, trust_level: TrustLevel) {
        self.record(TelemetryEvent::SandboxRender {
            trust_level,
            at: Utc::now(),
        });
    }

    pub fn observe_store_event(&self, event: &StoreEvent) {
        let action = match event {
            StoreEvent::Appended { .. } => LifecycleAction::Appended,
            StoreEvent::Updated { .. } => LifecycleAction::Updated,
            StoreEvent::Deleted { .. } => LifecycleAction::Deleted,
        };
        self.record(TelemetryEvent::Lifecycle {
            action,
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_at(Utc::now())
    }

    /// Aggregates the events inside `[now - window, now]`, pruning anything older.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> TelemetrySnapshot {
        let window_start = now - self.span;
        let mut inner = self.lock();
        inner.prune(window_start);

        let mut snap = TelemetrySnapshot {
            window_start,
            window_end: now,
            counts: BTreeMap::new(),
            sandbox_renders: BTreeMap::new(),
            demotions: 0,
            transitions: BTreeMap::new(),
            lifecycle: BTreeMap::new(),
        };
        for event in inner.window.iter().filter(|e| e.at() <= now) {
            match event {
                TelemetryEvent::Scan { rule_id, verdict, .. } => {
                    snap.counts.entry(rule_id.clone()).or_default().bump(*verdict);
                }
                TelemetryEvent::Transition { from, to, .. } => {
                    *snap.transitions.entry(format!("{}->{}", from, to)).or_default() += 1;
                }
                TelemetryEvent::RulesetDemotion { .. } => snap.demotions += 1,
                TelemetryEvent::SandboxRender { trust_level, .. } => {
                    *snap.sandbox_renders.entry(trust_level.to_string()).or_default() += 1;
                }
                TelemetryEvent::Lifecycle { action, .. } => {
                    let key = match action {
                        LifecycleAction::Appended => "appended",
                        LifecycleAction::Updated => "updated",
                        LifecycleAction::Deleted => "deleted",
                    };
                    *snap.lifecycle.entry(key.to_string()).or_default() += 1;
                }
            }
        }
        snap
    }

    /// Hands queued events to an external forwarder.
    pub fn drain_events(&self) -> Vec<TelemetryEvent> {
        self.lock().outbox.drain(..).collect()
    }
}

impl Default for SecurityTelemetry {
    fn default() -> Self {
        Self::daily()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan(rule: &str, verdict: Verdict, at: DateTime<Utc>) -> TelemetryEvent {
        TelemetryEvent::Scan {
            rule_id: rule.into(),
            verdict,
            at,
        }
    }

    #[test]
    fn window_drops_old_samples() {
        let t = SecurityTelemetry::daily();
        let now = Utc::now();
        t.record(scan("instruction-override", Verdict::Malicious, now - Duration::hours(30)));
        t.record(scan("instruction-override", Verdict::Malicious, now - Duration::hours(2)));
        t.record(scan("instruction-override", Verdict::Clean, now - Duration::minutes(5)));

        let snap = t.snapshot_at(now);
        let c = snap.counts["instruction-override"];
        assert_eq!((c.clean, c.suspicious, c.malicious), (1, 0, 1));
        assert_eq!(snap.window_end - snap.window_start, Duration::hours(24));
    }

    #[test]
    fn window_stays_bounded_without_snapshots() {
        let t = SecurityTelemetry::daily();
        let stale = Utc::now() - Duration::days(10);
        for _ in 0..5_000 {
            t.record(scan("encoded-payload", Verdict::Suspicious, stale));
        }
        assert!(t.lock().window.is_empty());

        t.record(scan("encoded-payload", Verdict::Clean, Utc::now()));
        assert_eq!(t.lock().window.len(), 1);
        assert_eq!(t.drain_events().len(), 5_001, "forwarding still sees every event");
    }

    #[test]
    fn export_shape_uses_camel_case_keys() {
        let t = SecurityTelemetry::daily();
        t.record(scan("role-injection", Verdict::Suspicious, Utc::now()));
        let json = serde_json::to_value(t.snapshot()).unwrap();
        assert!(json.get("windowStart").is_some());
        assert!(json.get("windowEnd").is_some());
        assert_eq!(json["counts"]["role-injection"]["suspicious"], 1);
        assert_eq!(json["counts"]["role-injection"]["clean"], 0);
    }

    #[test]
    fn drain_empties_outbox_but_not_window() {
        let t = SecurityTelemetry::daily();
        t.record_render(TrustLevel::Flagged);
        t.record_demotion(2);
        let events = t.drain_events();
        assert_eq!(events.len(), 2);
        assert!(t.drain_events().is_empty());
        let snap = t.snapshot();
        assert_eq!(snap.demotions, 1);
        assert_eq!(snap.sandbox_renders["flagged"], 1);
    }

    #[test]
    fn forwarded_events_are_tagged() {
        let t = SecurityTelemetry::daily();
        t.record_transition(TrustLevel::Untrusted, TrustLevel::Quarantined, 1);
        let json = serde_json::to_value(&t.drain_events()[0]).unwrap();
        assert_eq!(json["kind"], "transition");
        assert_eq!(json["to"], "quarantined");
    }
}
