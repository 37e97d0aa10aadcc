//! `MemoryPipeline`: the element-write and read surface.
//!
//! Writers call [`MemoryPipeline::remember`]; it returns as soon as the entry is durable.
//! Readers call [`MemoryPipeline::recall`], which only ever hands back sandboxed text.

use crate::config::TrustConfig;
use crate::error::Result;
use crate::memory::{portfolio, AppendMetadata, EntryId, LoadFilter, MemoryEntry, MemoryStore};
use crate::security::sandbox::{DisplaySandbox, RenderedMemory};
use crate::security::scanner::{PatternScanner, Ruleset};
use crate::security::vault::{KeyProvider, PatternVault};
use crate::telemetry::{SecurityTelemetry, TelemetrySnapshot};
use crate::validator::{BackgroundValidator, ValidatorHandle, ValidatorPool};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub struct MemoryPipeline {
    config: TrustConfig,
    store: Arc<MemoryStore>,
    vault: Arc<PatternVault>,
    telemetry: Arc<SecurityTelemetry>,
    sandbox: DisplaySandbox,
    validator: Arc<BackgroundValidator>,
}

impl MemoryPipeline {
    /// Opens the store at `config.storage_path` with the built-in ruleset at
    /// `config.ruleset_version`.
    pub fn open(config: TrustConfig, keys: &dyn KeyProvider) -> Result<Self> {
        let ruleset = Ruleset::builtin(config.ruleset_version);
        Self::open_with_ruleset(config, ruleset, keys)
    }

    pub fn open_with_ruleset(config: TrustConfig, ruleset: Ruleset, keys: &dyn KeyProvider) -> Result<Self> {
        let config = config.normalized();
        let store = Arc::new(MemoryStore::open(&config.storage_path)?);
        Self::assemble(config, store, ruleset, keys)
    }

    /// Builds a pipeline over an already-open store, e.g. to run a new ruleset against it.
    pub fn assemble(
        config: TrustConfig,
        store: Arc<MemoryStore>,
        ruleset: Ruleset,
        keys: &dyn KeyProvider,
    ) -> Result<Self> {
        let config = config.normalized();
        let vault = Arc::new(PatternVault::open(store.db(), keys)?);
        let telemetry = Arc::new(SecurityTelemetry::new(config.telemetry_window()));
        let scanner = Arc::new(PatternScanner::new(ruleset, config.scan_timeout()));
        let validator = Arc::new(BackgroundValidator::new(
            Arc::clone(&store),
            Arc::clone(&vault),
            scanner,
            Arc::clone(&telemetry),
            &config,
        ));
        info!(
            target: "memtrust::store",
            path = %config.storage_path.display(),
            ruleset_version = validator.ruleset_version(),
            vault_unlocked = vault.is_unlocked(),
            "memory pipeline ready"
        );
        Ok(Self {
            sandbox: DisplaySandbox::with_telemetry(Arc::clone(&telemetry)),
            config,
            store,
            vault,
            telemetry,
            validator,
        })
    }

    /// Stores `content` as untrusted and returns immediately.
    pub fn remember(&self, content: impl Into<String>, metadata: AppendMetadata) -> Result<EntryId> {
        self.store.append(content, metadata)
    }

    /// Loads matching entries and renders them for model context.
    /// Quarantined entries are never returned, whatever the filter says.
    pub fn recall(&self, filter: &LoadFilter) -> Result<Vec<RenderedMemory>> {
        let filter = LoadFilter {
            include_quarantined: false,
            ..filter.clone()
        };
        let entries = self.store.load(&filter)?;
        Ok(self.sandbox.render_many(&entries))
    }

    /// Renders a single entry; `None` when absent or quarantined.
    pub fn recall_one(&self, id: &EntryId) -> Result<Option<String>> {
        match self.store.get(id)? {
            Some(entry) => Ok(Some(self.sandbox.render(&entry)?)),
            None => Ok(None),
        }
    }

    /// Writer edit; the entry goes back to untrusted until re-validated.
    pub fn revise(&self, id: &EntryId, expected_version: u64, content: impl Into<String>) -> Result<MemoryEntry> {
        self.store.update_content(id, expected_version, content)
    }

    /// Deletes an entry and starts the retention clock on its vault records.
    pub fn forget(&self, id: &EntryId) -> Result<bool> {
        let Some(entry) = self.store.delete(id)? else {
            return Ok(false);
        };
        // Records can exist without refs when a pass crashed between vault and store writes.
        let scheduled = self
            .vault
            .schedule_owner_cleanup(id, self.config.vault_retention(), Utc::now())?;
        info!(
            target: "memtrust::vault",
            id = %id,
            refs = entry.extracted_pattern_refs.len(),
            scheduled,
            "owner deleted; vault retention started"
        );
        Ok(true)
    }

    /// Drops vault records whose retention has elapsed.
    pub fn purge_expired(&self) -> Result<usize> {
        Ok(self.vault.purge_expired(Utc::now())?)
    }

    /// Exports every record (quarantined included) as a portfolio document.
    pub fn export_portfolio(&self) -> Result<String> {
        portfolio::serialize(&self.store.load(&LoadFilter::audit())?)
    }

    /// Imports a portfolio document; everything lands untrusted, quarantined records are dropped.
    pub fn import_portfolio(&self, text: &str) -> Result<Vec<EntryId>> {
        self.store.import(portfolio::deserialize(text)?)
    }

    /// Spawns the background validator on the current tokio runtime.
    pub fn start_validator(&self) -> ValidatorHandle {
        ValidatorPool::new(Arc::clone(&self.validator), &self.config).start()
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn config(&self) -> &TrustConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn vault(&self) -> &Arc<PatternVault> {
        &self.vault
    }

    pub fn validator(&self) -> &Arc<BackgroundValidator> {
        &self.validator
    }

    pub fn telemetry(&self) -> &Arc<SecurityTelemetry> {
        &self.telemetry
    }

    pub fn sandbox(&self) -> &DisplaySandbox {
        &self.sandbox
    }
}
