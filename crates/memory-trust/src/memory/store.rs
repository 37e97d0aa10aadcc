//! Sled-backed memory store with optimistic concurrency.
//!
//! Entries live in the `memory_entries` tree, keyed by id, JSON-encoded. Every write goes
//! through sled compare-and-swap against the bytes the caller read, so a concurrent edit or
//! delete surfaces as [`TrustError::Conflict`] instead of a lost update.
//!
//! Writes are announced on a broadcast channel ([`StoreEvent`]). The validator subscribes
//! for intake and telemetry counts lifecycle events; when nobody listens, events are dropped
//! and the validator re-derives its work from [`MemoryStore::pending`].

use super::entry::{content_hash, AppendMetadata, EntryId, MemoryEntry, TrustLevel, ValidationStamp};
use crate::config::FlaggedPolicy;
use crate::error::{Result, TrustError, VersionSeen};
use chrono::{DateTime, Utc};
use sled::{CompareAndSwapError, Db, IVec};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

const TREE_NAME: &str = "memory_entries";
const EVENT_CAPACITY: usize = 1024;

/// Who produced an `Updated` event. Validator writes never re-enter intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Writer,
    Validator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Appended {
        id: EntryId,
        content_version: u64,
        content_hash: String,
    },
    Updated {
        id: EntryId,
        content_version: u64,
        content_hash: String,
        origin: UpdateOrigin,
    },
    Deleted {
        id: EntryId,
    },
}

impl StoreEvent {
    pub fn entry_id(&self) -> EntryId {
        match self {
            Self::Appended { id, .. } | Self::Updated { id, .. } | Self::Deleted { id } => *id,
        }
    }
}

/// Read filter for [`MemoryStore::load`]. The default never returns quarantined entries.
#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    /// Admin/audit flag.
    pub include_quarantined: bool,
    pub trust_levels: Option<Vec<TrustLevel>>,
    pub tag: Option<String>,
    pub source_context: Option<String>,
}

impl LoadFilter {
    /// Audit view: everything, quarantined included.
    pub fn audit() -> Self {
        Self {
            include_quarantined: true,
            ..Default::default()
        }
    }

    pub fn with_trust(mut self, level: TrustLevel) -> Self {
        self.trust_levels.get_or_insert_with(Vec::new).push(level);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_source(mut self, source_context: impl Into<String>) -> Self {
        self.source_context = Some(source_context.into());
        self
    }

    fn matches(&self, entry: &MemoryEntry) -> bool {
        if entry.trust_level == TrustLevel::Quarantined && !self.include_quarantined {
            return false;
        }
        if let Some(levels) = &self.trust_levels {
            if !levels.contains(&entry.trust_level) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !entry.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(source) = &self.source_context {
            if entry.source_context != *source {
                return false;
            }
        }
        true
    }
}

/// Outcome of one validation pass, applied atomically by [`MemoryStore::mark_validated`].
#[derive(Debug, Clone)]
pub struct ValidationUpdate {
    pub entry_id: EntryId,
    /// `content_version` the validator read; the write fails with `Conflict` otherwise.
    pub expected_version: u64,
    pub trust_level: TrustLevel,
    /// Redacted content; `None` keeps the stored content.
    pub sanitized_content: Option<String>,
    /// Vault keys to add to `extracted_pattern_refs`.
    pub pattern_refs: Vec<String>,
    pub stamp: ValidationStamp,
}

pub struct MemoryStore {
    db: Db,
    entries: sled::Tree,
    events: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    /// Opens or creates the sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Uses an already-open database (the pattern vault shares it).
    pub fn from_db(db: Db) -> Result<Self> {
        let entries = db.open_tree(TREE_NAME)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(target: "memtrust::store", entries = entries.len(), "memory store opened");
        Ok(Self { db, entries, events })
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is fine: pending() is the source of truth.
        let _ = self.events.send(event);
    }

    /// Stores new content as `Untrusted` and returns its id. Any trust hint is ignored.
    pub fn append(&self, content: impl Into<String>, metadata: AppendMetadata) -> Result<EntryId> {
        let content = content.into();
        if let Some(hint) = metadata.trust_hint {
            if hint != TrustLevel::Untrusted {
                debug!(
                    target: "memtrust::store",
                    hint = %hint,
                    source = %metadata.source_context,
                    "ignoring caller trust hint"
                );
            }
        }
        let now = Utc::now();
        let entry = MemoryEntry {
            id: Uuid::new_v4(),
            content_hash: content_hash(&content),
            content,
            created_at: now,
            updated_at: now,
            trust_level: TrustLevel::Untrusted,
            source_context: metadata.source_context,
            extracted_pattern_refs: Vec::new(),
            privacy_level: metadata.privacy_level,
            content_version: 1,
            validation: None,
            tags: metadata.tags,
        };
        self.insert_new(&entry)?;
        debug!(
            target: "memtrust::store",
            id = %entry.id,
            source = %entry.source_context,
            bytes = entry.content.len(),
            "entry appended"
        );
        self.emit(StoreEvent::Appended {
            id: entry.id,
            content_version: entry.content_version,
            content_hash: entry.content_hash.clone(),
        });
        Ok(entry.id)
    }

    fn insert_new(&self, entry: &MemoryEntry) -> Result<()> {
        let bytes = serde_json::to_vec(entry)?;
        match self
            .entries
            .compare_and_swap(entry.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(CompareAndSwapError { current, .. }) => Err(conflict(entry.id, 0, current.as_ref())),
        }
    }

    /// Normal read: quarantined entries are reported as absent.
    pub fn get(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        Ok(self.inspect(id)?.filter(|e| e.trust_level != TrustLevel::Quarantined))
    }

    /// Audit/validator read: returns the entry whatever its trust level.
    pub fn inspect(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        Ok(self.read_raw(id)?.map(|(_, entry)| entry))
    }

    fn read_raw(&self, id: &EntryId) -> Result<Option<(IVec, MemoryEntry)>> {
        match self.entries.get(id.as_bytes())? {
            Some(bytes) => {
                let entry = serde_json::from_slice(&bytes)?;
                Ok(Some((bytes, entry)))
            }
            None => Ok(None),
        }
    }

    fn scan(&self) -> Result<Vec<MemoryEntry>> {
        let mut out = Vec::with_capacity(self.entries.len());
        for item in self.entries.iter() {
            let (key, bytes) = item?;
            match serde_json::from_slice::<MemoryEntry>(&bytes) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    warn!(
                        target: "memtrust::store",
                        key = %hex::encode(&key),
                        error = %e,
                        "skipping undecodable entry"
                    );
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Entries matching `filter`, oldest first.
    pub fn load(&self, filter: &LoadFilter) -> Result<Vec<MemoryEntry>> {
        Ok(self.scan()?.into_iter().filter(|e| filter.matches(e)).collect())
    }

    /// Entries the validator still owes a pass, oldest first.
    pub fn pending(
        &self,
        ruleset_version: u32,
        policy: &FlaggedPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<MemoryEntry>> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|e| e.needs_validation(ruleset_version, policy, now))
            .collect())
    }

    /// Replaces `old` (the exact bytes read) with `new`, or reports what changed underneath.
    fn swap(&self, old: &IVec, new: &MemoryEntry) -> Result<()> {
        let bytes = serde_json::to_vec(new)?;
        match self
            .entries
            .compare_and_swap(new.id.as_bytes(), Some(old), Some(bytes))?
        {
            Ok(()) => Ok(()),
            Err(CompareAndSwapError { current, .. }) => Err(conflict(
                new.id,
                new.content_version.saturating_sub(1),
                current.as_ref(),
            )),
        }
    }

    /// Applies a validation outcome if the entry is still at `expected_version`.
    pub fn mark_validated(&self, update: ValidationUpdate) -> Result<MemoryEntry> {
        let Some((raw, current)) = self.read_raw(&update.entry_id)? else {
            return Err(TrustError::Conflict {
                entry_id: update.entry_id,
                expected: update.expected_version,
                found: VersionSeen::Deleted,
            });
        };
        if current.content_version != update.expected_version {
            return Err(TrustError::Conflict {
                entry_id: update.entry_id,
                expected: update.expected_version,
                found: VersionSeen::Version(current.content_version),
            });
        }
        // Quarantine is terminal, and a pass never hands an entry back as unscanned.
        if current.trust_level.is_terminal() || update.trust_level == TrustLevel::Untrusted {
            return Err(TrustError::InvariantViolation {
                from: current.trust_level,
                verdict: update.stamp.verdict,
            });
        }

        let mut next = current;
        if let Some(sanitized) = update.sanitized_content {
            next.content_hash = content_hash(&sanitized);
            next.content = sanitized;
        }
        for r in update.pattern_refs {
            if !next.extracted_pattern_refs.contains(&r) {
                next.extracted_pattern_refs.push(r);
            }
        }
        let from = next.trust_level;
        next.trust_level = update.trust_level;
        next.validation = Some(update.stamp);
        next.content_version += 1;
        next.updated_at = Utc::now();

        self.swap(&raw, &next)?;
        debug!(
            target: "memtrust::store",
            id = %next.id,
            from = %from,
            to = %next.trust_level,
            version = next.content_version,
            "validation applied"
        );
        self.emit(StoreEvent::Updated {
            id: next.id,
            content_version: next.content_version,
            content_hash: next.content_hash.clone(),
            origin: UpdateOrigin::Validator,
        });
        Ok(next)
    }

    /// Writer edit. New content is unscanned, so trust resets to `Untrusted`.
    /// Quarantined entries stay invisible and report `NotFound`.
    pub fn update_content(
        &self,
        id: &EntryId,
        expected_version: u64,
        content: impl Into<String>,
    ) -> Result<MemoryEntry> {
        let (raw, mut entry) = self.visible_raw(id)?;
        if entry.content_version != expected_version {
            return Err(TrustError::Conflict {
                entry_id: *id,
                expected: expected_version,
                found: VersionSeen::Version(entry.content_version),
            });
        }
        let content = content.into();
        entry.content_hash = content_hash(&content);
        entry.content = content;
        entry.trust_level = TrustLevel::Untrusted;
        entry.validation = None;
        entry.content_version += 1;
        entry.updated_at = Utc::now();

        self.swap(&raw, &entry)?;
        self.emit(StoreEvent::Updated {
            id: entry.id,
            content_version: entry.content_version,
            content_hash: entry.content_hash.clone(),
            origin: UpdateOrigin::Writer,
        });
        Ok(entry)
    }

    /// Manual re-trigger: clears the validation stamp so the entry re-enters `pending`
    /// without changing its trust level.
    pub fn request_revalidation(&self, id: &EntryId) -> Result<MemoryEntry> {
        let (raw, mut entry) = self.visible_raw(id)?;
        entry.validation = None;
        entry.content_version += 1;
        entry.updated_at = Utc::now();

        self.swap(&raw, &entry)?;
        info!(
            target: "memtrust::store",
            id = %entry.id,
            trust = %entry.trust_level,
            "re-validation requested"
        );
        self.emit(StoreEvent::Updated {
            id: entry.id,
            content_version: entry.content_version,
            content_hash: entry.content_hash.clone(),
            origin: UpdateOrigin::Writer,
        });
        Ok(entry)
    }

    fn visible_raw(&self, id: &EntryId) -> Result<(IVec, MemoryEntry)> {
        match self.read_raw(id)? {
            Some((_, entry)) if entry.trust_level == TrustLevel::Quarantined => {
                Err(TrustError::NotFound(*id))
            }
            Some(found) => Ok(found),
            None => Err(TrustError::NotFound(*id)),
        }
    }

    /// Removes an entry. Returns the removed record, if any.
    pub fn delete(&self, id: &EntryId) -> Result<Option<MemoryEntry>> {
        let Some(bytes) = self.entries.remove(id.as_bytes())? else {
            return Ok(None);
        };
        let entry: MemoryEntry = serde_json::from_slice(&bytes)?;
        info!(target: "memtrust::store", id = %id, trust = %entry.trust_level, "entry deleted");
        self.emit(StoreEvent::Deleted { id: *id });
        Ok(Some(entry))
    }

    /// Re-appends imported records as `Untrusted`. Quarantined records are refused.
    ///
    /// Ids are kept when free. Trust, validation stamps and vault references never carry
    /// over: the vault records they point at belong to another installation.
    pub fn import(&self, entries: Vec<MemoryEntry>) -> Result<Vec<EntryId>> {
        let mut ids = Vec::with_capacity(entries.len());
        for mut entry in entries {
            if entry.trust_level == TrustLevel::Quarantined {
                warn!(target: "memtrust::store", id = %entry.id, "refusing to import quarantined entry");
                continue;
            }
            if self.entries.contains_key(entry.id.as_bytes())? {
                entry.id = Uuid::new_v4();
            }
            entry.trust_level = TrustLevel::Untrusted;
            entry.validation = None;
            entry.extracted_pattern_refs.clear();
            entry.content_hash = content_hash(&entry.content);
            entry.content_version = 1;
            entry.updated_at = Utc::now();

            self.insert_new(&entry)?;
            self.emit(StoreEvent::Appended {
                id: entry.id,
                content_version: entry.content_version,
                content_hash: entry.content_hash.clone(),
            });
            ids.push(entry.id);
        }
        info!(target: "memtrust::store", imported = ids.len(), "entries imported as untrusted");
        Ok(ids)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flushes dirty buffers to disk. Returns bytes flushed.
    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}

fn conflict(entry_id: EntryId, expected: u64, current: Option<&IVec>) -> TrustError {
    let found = match current.and_then(|b| serde_json::from_slice::<MemoryEntry>(b).ok()) {
        Some(e) => VersionSeen::Version(e.content_version),
        None => VersionSeen::Deleted,
    };
    TrustError::Conflict {
        entry_id,
        expected,
        found,
    }
}
