//! Background validator.
//!
//! [`BackgroundValidator`] is the synchronous core: it takes a batch of entry ids, scans
//! each entry, plans its trust transition, seals dangerous spans into the pattern vault and
//! writes the outcome back with a version-checked update. [`pool`] drives it from tokio
//! workers fed by store events.
//!
//! ## Per-batch flow
//!
//! 1. Load each entry; skip anything deleted, quarantined or already current.
//! 2. Scan (bounded by the scanner deadline) and plan the transition.
//! 3. Seal extracted spans and build the redacted content. Encryption happens here, outside
//!    any store write.
//! 4. Flush: all vault records in one sled batch, then one atomic store update per entry.
//!
//! Vault keys are derived from (entry, scanned content hash, rule, span), so a pass that
//! crashes between steps 4a and 4b re-derives the same keys on the next run and stores
//! nothing twice. Entries the pass never reached stay pending and come back through
//! [`BackgroundValidator::pending_work`].

pub mod pool;

use crate::config::{FlaggedPolicy, TrustConfig};
use crate::error::{Result, TrustError, VersionSeen};
use crate::memory::{EntryId, MemoryEntry, MemoryStore, TrustLevel, ValidationStamp, ValidationUpdate};
use crate::security::redaction;
use crate::security::scanner::{PatternScanner, Verdict};
use crate::security::vault::{fragment_key, PatternVault, PatternVaultRecord};
use crate::telemetry::SecurityTelemetry;
use crate::trust::{self, TrustDecision};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub use pool::{ValidatorHandle, ValidatorPool};

/// Counters for one drained batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Entries actually scanned.
    pub scanned: usize,
    /// Validation outcomes written to the store.
    pub committed: usize,
    /// Entries that were gone, quarantined or already current.
    pub skipped: usize,
    /// Entries left pending because the vault is locked.
    pub deferred: usize,
    /// Entries that failed with a non-fatal error; they stay pending.
    pub failed: usize,
    pub conflicts: usize,
    /// New vault records (re-runs that hit existing keys are not counted).
    pub vaulted: usize,
    pub demotions: usize,
}

impl BatchSummary {
    fn absorb(&mut self, other: BatchSummary) {
        self.scanned += other.scanned;
        self.committed += other.committed;
        self.skipped += other.skipped;
        self.deferred += other.deferred;
        self.failed += other.failed;
        self.conflicts += other.conflicts;
        self.vaulted += other.vaulted;
        self.demotions += other.demotions;
    }
}

impl std::fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned={} committed={} skipped={} deferred={} failed={} conflicts={} vaulted={} demotions={}",
            self.scanned,
            self.committed,
            self.skipped,
            self.deferred,
            self.failed,
            self.conflicts,
            self.vaulted,
            self.demotions
        )
    }
}

/// A validation outcome ready to flush.
struct PreparedWrite {
    entry_id: EntryId,
    expected_version: u64,
    decision: TrustDecision,
    records: Vec<PatternVaultRecord>,
    sanitized: Option<String>,
    refs: Vec<String>,
    stamp: ValidationStamp,
}

impl PreparedWrite {
    fn update(&self) -> ValidationUpdate {
        ValidationUpdate {
            entry_id: self.entry_id,
            expected_version: self.expected_version,
            trust_level: self.decision.to,
            sanitized_content: self.sanitized.clone(),
            pattern_refs: self.refs.clone(),
            stamp: self.stamp.clone(),
        }
    }
}

enum Prepared {
    Skip,
    Defer,
    Write(PreparedWrite),
}

pub struct BackgroundValidator {
    store: Arc<MemoryStore>,
    vault: Arc<PatternVault>,
    scanner: Arc<PatternScanner>,
    telemetry: Arc<SecurityTelemetry>,
    flagged_policy: FlaggedPolicy,
    conflict_retries: u32,
    vault_retention: chrono::Duration,
}

impl BackgroundValidator {
    pub fn new(
        store: Arc<MemoryStore>,
        vault: Arc<PatternVault>,
        scanner: Arc<PatternScanner>,
        telemetry: Arc<SecurityTelemetry>,
        config: &TrustConfig,
    ) -> Self {
        if !vault.is_unlocked() {
            warn!(
                target: "memtrust::validator",
                "pattern vault is locked; entries needing extraction will stay pending"
            );
        }
        Self {
            store,
            vault,
            scanner,
            telemetry,
            flagged_policy: config.flagged_policy.clone(),
            conflict_retries: config.conflict_retries,
            vault_retention: config.vault_retention(),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn telemetry(&self) -> &Arc<SecurityTelemetry> {
        &self.telemetry
    }

    /// Version of the ruleset this validator stamps entries with.
    pub fn ruleset_version(&self) -> u32 {
        self.scanner.ruleset().version()
    }

    /// The re-derivable work queue: `(id, content_hash)` of every entry still owed a pass.
    pub fn pending_work(&self) -> Result<Vec<(EntryId, String)>> {
        Ok(self
            .store
            .pending(self.ruleset_version(), &self.flagged_policy, Utc::now())?
            .into_iter()
            .map(|e| (e.id, e.content_hash))
            .collect())
    }

    /// Drains up to `limit` pending entries in one batch (oldest first).
    pub fn drain_pending(&self, limit: usize) -> Result<BatchSummary> {
        let ids: Vec<EntryId> = self
            .pending_work()?
            .into_iter()
            .take(limit)
            .map(|(id, _)| id)
            .collect();
        self.process_batch(&ids)
    }

    /// Drains everything pending, batch by batch. Each entry is attempted at most once per
    /// call; deferred and failed entries are left for a later sweep.
    pub fn drain_all(&self, batch_size: usize) -> Result<BatchSummary> {
        let mut total = BatchSummary::default();
        let mut attempted = HashSet::new();
        loop {
            let ids: Vec<EntryId> = self
                .pending_work()?
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| !attempted.contains(id))
                .take(batch_size.max(1))
                .collect();
            if ids.is_empty() {
                return Ok(total);
            }
            attempted.extend(ids.iter().copied());
            total.absorb(self.process_batch(&ids)?);
        }
    }

    /// Validates one batch. Only fatal errors (`is_fatal`) abort the batch; anything else
    /// is logged per entry and the entry stays pending.
    pub fn process_batch(&self, ids: &[EntryId]) -> Result<BatchSummary> {
        let now = Utc::now();
        let mut summary = BatchSummary::default();
        let mut writes = Vec::with_capacity(ids.len());

        for id in ids {
            let entry = match self.store.inspect(id) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(target: "memtrust::validator", id = %id, error = %e, "failed to load entry");
                    summary.failed += 1;
                    continue;
                }
            };
            match self.prepare(entry, now, &mut summary) {
                Ok(Prepared::Write(w)) => writes.push(w),
                Ok(Prepared::Skip) => summary.skipped += 1,
                Ok(Prepared::Defer) => summary.deferred += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!(target: "memtrust::validator", id = %id, error = %e, "validation pass failed");
                    summary.failed += 1;
                }
            }
        }

        let records: Vec<PatternVaultRecord> =
            writes.iter().flat_map(|w| w.records.iter().cloned()).collect();
        if !records.is_empty() {
            summary.vaulted += self.vault.store_batch(&records)?;
        }

        for write in writes {
            let id = write.entry_id;
            match self.commit(write, now, &mut summary) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(target: "memtrust::validator", id = %id, error = %e, "validation outcome not written");
                    summary.failed += 1;
                }
            }
        }

        if summary.scanned > 0 {
            debug!(target: "memtrust::validator", %summary, "batch drained");
        }
        Ok(summary)
    }

    fn prepare(&self, entry: MemoryEntry, now: DateTime<Utc>, summary: &mut BatchSummary) -> Result<Prepared> {
        let ruleset_version = self.ruleset_version();
        if entry.trust_level == TrustLevel::Quarantined
            || !entry.needs_validation(ruleset_version, &self.flagged_policy, now)
        {
            return Ok(Prepared::Skip);
        }

        let report = self.scanner.evaluate(&entry.content);
        summary.scanned += 1;
        self.telemetry.record_scan(&report);
        let decision = trust::plan(entry.trust_level, report.verdict)?;

        let extractions = if report.verdict > Verdict::Clean {
            redaction::plan_extractions(&report, &entry.content)
        } else {
            Vec::new()
        };

        let mut records = Vec::with_capacity(extractions.len());
        let mut replacements = Vec::with_capacity(extractions.len());
        let mut refs = Vec::with_capacity(extractions.len());
        if !extractions.is_empty() {
            if self.vault.is_unlocked() {
                for ex in &extractions {
                    let key = fragment_key(&entry.id, &entry.content_hash, &ex.rule_id, &ex.span);
                    let record = self.vault.seal_fragment(
                        key.clone(),
                        entry.id,
                        &ex.rule_id,
                        ruleset_version,
                        &entry.content[ex.span.clone()],
                    )?;
                    replacements.push((ex.span.clone(), redaction::marker(&ex.rule_id, &key)));
                    refs.push(key);
                    records.push(record);
                }
            } else if decision.to == TrustLevel::Quarantined {
                // Quarantined content never renders, so it can wait for the vault in place.
                warn!(
                    target: "memtrust::validator",
                    id = %entry.id,
                    spans = extractions.len(),
                    "vault locked; quarantining without extraction"
                );
            } else {
                error!(
                    target: "memtrust::validator",
                    id = %entry.id,
                    verdict = report.verdict.label(),
                    spans = extractions.len(),
                    "vault locked; entry left at its current trust level"
                );
                return Ok(Prepared::Defer);
            }
        }

        let sanitized = (!replacements.is_empty()).then(|| redaction::apply(&entry.content, &replacements));
        Ok(Prepared::Write(PreparedWrite {
            entry_id: entry.id,
            expected_version: entry.content_version,
            decision,
            records,
            sanitized,
            refs,
            stamp: ValidationStamp {
                ruleset_version,
                scanned_hash: entry.content_hash,
                verdict: report.verdict,
                validated_at: now,
            },
        }))
    }

    /// Writes one outcome, reloading and re-validating on version conflicts.
    fn commit(&self, mut write: PreparedWrite, now: DateTime<Utc>, summary: &mut BatchSummary) -> Result<()> {
        let mut attempts = 0;
        loop {
            match self.store.mark_validated(write.update()) {
                Ok(updated) => {
                    summary.committed += 1;
                    self.record_outcome(&write.decision, &updated, summary);
                    return Ok(());
                }
                Err(TrustError::Conflict {
                    found: VersionSeen::Deleted,
                    ..
                }) => {
                    self.release_orphaned(&write.entry_id, now)?;
                    summary.skipped += 1;
                    return Ok(());
                }
                Err(e) if e.is_conflict() && attempts < self.conflict_retries => {
                    attempts += 1;
                    summary.conflicts += 1;
                    debug!(
                        target: "memtrust::validator",
                        id = %write.entry_id,
                        attempt = attempts,
                        error = %e,
                        "conflict; reloading entry"
                    );
                    let Some(fresh) = self.store.inspect(&write.entry_id)? else {
                        self.release_orphaned(&write.entry_id, now)?;
                        summary.skipped += 1;
                        return Ok(());
                    };
                    match self.prepare(fresh, now, summary)? {
                        Prepared::Write(next) => {
                            if !next.records.is_empty() {
                                summary.vaulted += self.vault.store_batch(&next.records)?;
                            }
                            write = next;
                        }
                        Prepared::Skip => {
                            summary.skipped += 1;
                            return Ok(());
                        }
                        Prepared::Defer => {
                            summary.deferred += 1;
                            return Ok(());
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The owner was deleted mid-pass. Records sealed for it may have landed after
    /// `forget` scheduled cleanup, so start their retention clock here too.
    fn release_orphaned(&self, owner: &EntryId, now: DateTime<Utc>) -> Result<()> {
        let scheduled = self.vault.schedule_owner_cleanup(owner, self.vault_retention, now)?;
        if scheduled > 0 {
            info!(
                target: "memtrust::validator",
                id = %owner,
                scheduled,
                "owner deleted during validation; vault retention started"
            );
        }
        Ok(())
    }

    fn record_outcome(&self, decision: &TrustDecision, updated: &MemoryEntry, summary: &mut BatchSummary) {
        let ruleset_version = self.ruleset_version();
        if decision.is_change() {
            self.telemetry
                .record_transition(decision.from, decision.to, ruleset_version);
        }
        if decision.is_demotion() {
            summary.demotions += 1;
            self.telemetry.record_demotion(ruleset_version);
            warn!(
                target: "memtrust::validator",
                id = %updated.id,
                ruleset_version,
                verdict = decision.verdict.label(),
                "ruleset-triggered demotion: validated entry quarantined"
            );
        } else if decision.to == TrustLevel::Quarantined {
            info!(
                target: "memtrust::validator",
                id = %updated.id,
                source = %updated.source_context,
                refs = updated.extracted_pattern_refs.len(),
                "entry quarantined"
            );
        } else {
            debug!(
                target: "memtrust::validator",
                id = %updated.id,
                from = %decision.from,
                to = %decision.to,
                "entry validated"
            );
        }
    }
}

impl std::fmt::Debug for BackgroundValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundValidator")
            .field("ruleset_version", &self.ruleset_version())
            .field("vault_unlocked", &self.vault.is_unlocked())
            .field("flagged_policy", &self.flagged_policy)
            .finish()
    }
}
