//! memory-trust: trust pipeline for long-lived memory entries.
//!
//! Arbitrary text is accepted into memory as `untrusted`, scanned in the background,
//! promoted, flagged or quarantined, and only ever rendered for model context through the
//! display sandbox. Dangerous spans are moved into an AES-256-GCM pattern vault and replaced
//! by redaction markers.
//!
//! | Component | Module |
//! |-----------|--------|
//! | MemoryStore | [`memory`] |
//! | TrustStateMachine | [`trust`] |
//! | PatternScanner | [`security::scanner`], [`security::detectors`] |
//! | PatternVault | [`security::vault`] |
//! | BackgroundValidator | [`validator`] |
//! | DisplaySandbox | [`security::sandbox`] |
//! | SecurityTelemetry | [`telemetry`] |

pub mod config;
mod error;
pub mod memory;
mod pipeline;
mod secure_memory;
pub mod security;
pub mod telemetry;
pub mod trust;
pub mod validator;

pub use config::{FlaggedPolicy, TrustConfig};
pub use error::{Result, TrustError, VersionSeen};
pub use pipeline::MemoryPipeline;
pub use secure_memory::LockedBuf;

// Memory
pub use memory::{
    portfolio, AppendMetadata, EntryId, LoadFilter, MemoryEntry, MemoryStore, PrivacyLevel, StoreEvent,
    TrustLevel, UpdateOrigin, ValidationStamp, ValidationUpdate,
};

// Security
pub use security::{
    DisplaySandbox, EnvKeyProvider, KeyProvider, PatternMatch, PatternScanner, PatternVault,
    PatternVaultRecord, RenderedMemory, Ruleset, ScanReport, Sealed, StaticKeyProvider, VaultError,
    Verdict,
};

pub use telemetry::{SecurityTelemetry, TelemetryEvent, TelemetrySnapshot};
pub use trust::{plan, transition, TrustDecision};
pub use validator::{BackgroundValidator, BatchSummary, ValidatorHandle, ValidatorPool};
