//! Scanning, fragment vaulting and safe rendering.

pub mod detectors;
pub mod normalize;
pub mod redaction;
pub mod sandbox;
pub mod scanner;
pub mod vault;

pub use sandbox::{DisplaySandbox, RenderedMemory};
pub use scanner::{Detector, Finding, PatternMatch, PatternScanner, Ruleset, ScanReport, Verdict};
pub use vault::{
    EnvKeyProvider, KeyProvider, PatternVault, PatternVaultRecord, Sealed, StaticKeyProvider, VaultError,
};
