//! **Pattern Vault**: AES-256-GCM store for fragments extracted from memory entries.
//!
//! Dangerous spans are moved here and replaced by redaction markers in the stored entry, so
//! they are permanently absent from model-visible context. The vault is write-mostly: the
//! validator seals fragments into it; only audit tooling decrypts.
//!
//! ## Record layout
//!
//! Each record keeps `ciphertext`, `nonce` (96 bits, random per seal) and `auth_tag`
//! (128 bits) as separate opaque byte fields. Decryption re-joins ciphertext and tag and
//! fails closed on any mismatch.
//!
//! ## Keys
//!
//! The installation key comes from a [`KeyProvider`]. The default provider reads
//! `MEMTRUST_VAULT_KEY` (64 hex chars = 32 bytes). Without a key the vault stays **locked**
//! and the validator leaves entries `untrusted` rather than storing plaintext anywhere.

use crate::memory::EntryId;
use crate::secure_memory::LockedBuf;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ops::Range;
use tracing::{debug, info, warn};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const TREE_NAME: &str = "pattern_vault";

/// Environment variable read by [`EnvKeyProvider`].
pub const ENV_VAULT_KEY: &str = "MEMTRUST_VAULT_KEY";

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("pattern vault is locked (no installation key)")]
    Locked,
    #[error("invalid vault key: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    /// Authentication failed: wrong key or tampered record. Carries no detail on purpose.
    #[error("decryption failed: authentication tag mismatch")]
    Decryption,
    #[error("corrupt vault record: {0}")]
    CorruptRecord(String),
    #[error("vault storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("vault record encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Supplies the installation-scoped key. Key management lives outside this crate.
pub trait KeyProvider: Send + Sync {
    fn vault_key(&self) -> Result<[u8; KEY_LEN], VaultError>;
}

/// Reads a hex key from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new(ENV_VAULT_KEY)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn vault_key(&self) -> Result<[u8; KEY_LEN], VaultError> {
        let raw = std::env::var(&self.var).map_err(|_| VaultError::Locked)?;
        parse_hex_key(&raw)
    }
}

/// A fixed key handed over by the embedding application.
#[derive(Clone)]
pub struct StaticKeyProvider([u8; KEY_LEN]);

impl StaticKeyProvider {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }
}

impl KeyProvider for StaticKeyProvider {
    fn vault_key(&self) -> Result<[u8; KEY_LEN], VaultError> {
        Ok(self.0)
    }
}

/// Parses 64 hex chars (whitespace ignored) into a key.
pub fn parse_hex_key(raw: &str) -> Result<[u8; KEY_LEN], VaultError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.len() != KEY_LEN * 2 {
        return Err(VaultError::InvalidKey(format!(
            "expected {} hex chars, got {}",
            KEY_LEN * 2,
            cleaned.len()
        )));
    }
    let bytes = hex::decode(&cleaned).map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| VaultError::InvalidKey("wrong key length".into()))
}

/// Output of [`PatternVault::encrypt`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
}

/// One extracted fragment at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternVaultRecord {
    pub vault_key: String,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub auth_tag: Vec<u8>,
    pub rule_id: String,
    pub extracted_at: DateTime<Utc>,
    /// Weak back-reference: the record may outlive its owner for audit.
    pub owner_entry_id: EntryId,
    pub ruleset_version: u32,
    /// Set once the owner is deleted; `purge_expired` removes the record after this instant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PatternVaultRecord {
    pub fn sealed(&self) -> Sealed {
        Sealed {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            auth_tag: self.auth_tag.clone(),
        }
    }
}

/// Deterministic vault key for a fragment, so a re-run of the same pass lands on the same record.
pub fn fragment_key(owner: &EntryId, scanned_hash: &str, rule_id: &str, span: &Range<usize>) -> String {
    let mut h = Sha256::new();
    h.update(owner.as_bytes());
    h.update(scanned_hash.as_bytes());
    h.update(rule_id.as_bytes());
    h.update(span.start.to_le_bytes());
    h.update(span.end.to_le_bytes());
    let digest = hex::encode(h.finalize());
    format!("pv_{}", &digest[..32])
}

/// AES-256-GCM fragment store backed by a sled tree.
pub struct PatternVault {
    tree: sled::Tree,
    cipher: Option<Aes256Gcm>,
}

impl PatternVault {
    /// Opens the vault tree in `db`, unlocking it with the provider's key when available.
    pub fn open(db: &sled::Db, keys: &dyn KeyProvider) -> Result<Self, VaultError> {
        let key = match keys.vault_key() {
            Ok(k) => Some(k),
            Err(VaultError::Locked) => None,
            Err(e) => {
                warn!(target: "memtrust::vault", error = %e, "vault key rejected; vault will be LOCKED");
                None
            }
        };
        Self::with_key(db, key.as_ref())
    }

    /// Opens the vault tree with an explicit key (`None` = locked).
    pub fn with_key(db: &sled::Db, key: Option<&[u8; KEY_LEN]>) -> Result<Self, VaultError> {
        let tree = db.open_tree(TREE_NAME)?;
        let cipher = key
            .map(|k| Aes256Gcm::new_from_slice(k).map_err(|e| VaultError::InvalidKey(e.to_string())))
            .transpose()?;
        if cipher.is_some() {
            info!(target: "memtrust::vault", records = tree.len(), "🔐 pattern vault unlocked");
        } else {
            info!(target: "memtrust::vault", "🔒 pattern vault locked; extraction disabled");
        }
        Ok(Self { tree, cipher })
    }

    #[inline]
    pub fn is_unlocked(&self) -> bool {
        self.cipher.is_some()
    }

    /// Seals `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Sealed, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::Locked)?;
        let nonce = Aes256Gcm::generate_nonce(OsRng);
        let mut out = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;
        let split = out.len().saturating_sub(TAG_LEN);
        let auth_tag = out.split_off(split);
        Ok(Sealed {
            ciphertext: out,
            nonce: nonce.to_vec(),
            auth_tag,
        })
    }

    /// Verifies and opens `sealed`. Never returns unauthenticated bytes.
    pub fn decrypt(&self, sealed: &Sealed) -> Result<LockedBuf, VaultError> {
        let cipher = self.cipher.as_ref().ok_or(VaultError::Locked)?;
        if sealed.nonce.len() != NONCE_LEN {
            return Err(VaultError::CorruptRecord(format!("nonce length {}", sealed.nonce.len())));
        }
        if sealed.auth_tag.len() != TAG_LEN {
            return Err(VaultError::Decryption);
        }
        let mut joined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
        joined.extend_from_slice(&sealed.ciphertext);
        joined.extend_from_slice(&sealed.auth_tag);
        let plain = cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), joined.as_slice())
            .map_err(|_| VaultError::Decryption)?;
        Ok(LockedBuf::new(plain))
    }

    /// Encrypts one fragment into a record (not yet persisted).
    pub fn seal_fragment(
        &self,
        vault_key: String,
        owner_entry_id: EntryId,
        rule_id: &str,
        ruleset_version: u32,
        fragment: &str,
    ) -> Result<PatternVaultRecord, VaultError> {
        let sealed = self.encrypt(fragment.as_bytes())?;
        Ok(PatternVaultRecord {
            vault_key,
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce,
            auth_tag: sealed.auth_tag,
            rule_id: rule_id.to_string(),
            extracted_at: Utc::now(),
            owner_entry_id,
            ruleset_version,
            expires_at: None,
        })
    }

    /// Persists records in one batch. Keys already present are left untouched.
    /// Returns how many records were new.
    pub fn store_batch(&self, records: &[PatternVaultRecord]) -> Result<usize, VaultError> {
        let mut batch = sled::Batch::default();
        let mut fresh = 0;
        for record in records {
            if self.tree.contains_key(record.vault_key.as_bytes())? {
                debug!(target: "memtrust::vault", vault_key = %record.vault_key, "record exists; skipping");
                continue;
            }
            batch.insert(record.vault_key.as_bytes(), serde_json::to_vec(record)?);
            fresh += 1;
        }
        if fresh > 0 {
            self.tree.apply_batch(batch)?;
        }
        Ok(fresh)
    }

    pub fn contains(&self, vault_key: &str) -> Result<bool, VaultError> {
        Ok(self.tree.contains_key(vault_key.as_bytes())?)
    }

    pub fn get(&self, vault_key: &str) -> Result<Option<PatternVaultRecord>, VaultError> {
        match self.tree.get(vault_key.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrites a record as-is. Audit and test tooling only.
    pub fn put_raw(&self, record: &PatternVaultRecord) -> Result<(), VaultError> {
        self.tree
            .insert(record.vault_key.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Decrypts a stored fragment. Audit tooling only; never on the normal read path.
    pub fn reveal(&self, vault_key: &str) -> Result<Option<LockedBuf>, VaultError> {
        let Some(record) = self.get(vault_key)? else {
            return Ok(None);
        };
        let plain = self.decrypt(&record.sealed())?;
        info!(
            target: "memtrust::vault",
            vault_key = %vault_key,
            rule_id = %record.rule_id,
            "vault fragment revealed to audit tooling"
        );
        Ok(Some(plain))
    }

    pub fn records_for_owner(&self, owner: &EntryId) -> Result<Vec<PatternVaultRecord>, VaultError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item?;
            let record = decode_record(&bytes)?;
            if record.owner_entry_id == *owner {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Starts the retention clock for every record owned by a deleted entry.
    pub fn schedule_owner_cleanup(
        &self,
        owner: &EntryId,
        retention: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<usize, VaultError> {
        let mut scheduled = 0;
        for mut record in self.records_for_owner(owner)? {
            if record.expires_at.is_some() {
                continue;
            }
            record.expires_at = Some(now + retention);
            self.tree
                .insert(record.vault_key.as_bytes(), serde_json::to_vec(&record)?)?;
            scheduled += 1;
        }
        if scheduled > 0 {
            debug!(target: "memtrust::vault", owner = %owner, scheduled, "vault cleanup scheduled");
        }
        Ok(scheduled)
    }

    /// Removes records whose retention has elapsed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let mut batch = sled::Batch::default();
        let mut purged = 0;
        for item in self.tree.iter() {
            let (key, bytes) = item?;
            let record = decode_record(&bytes)?;
            if record.expires_at.map_or(false, |t| t <= now) {
                batch.remove(key);
                purged += 1;
            }
        }
        if purged > 0 {
            self.tree.apply_batch(batch)?;
            info!(target: "memtrust::vault", purged, "expired vault records purged");
        }
        Ok(purged)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

fn decode_record(bytes: &[u8]) -> Result<PatternVaultRecord, VaultError> {
    serde_json::from_slice(bytes).map_err(|e| VaultError::CorruptRecord(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn test_key() -> [u8; 32] {
        // Deterministic test key (NOT for production)
        let mut key = [0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(11).wrapping_add(3);
        }
        key
    }

    fn vault() -> (tempfile::TempDir, PatternVault) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let v = PatternVault::with_key(&db, Some(&test_key())).unwrap();
        (dir, v)
    }

    #[test]
    fn sealed_parts_have_expected_shape() {
        let (_d, v) = vault();
        let sealed = v.encrypt(b"ignore previous instructions").unwrap();
        assert_eq!(sealed.nonce.len(), NONCE_LEN);
        assert_eq!(sealed.auth_tag.len(), TAG_LEN);
        assert_eq!(sealed.ciphertext.len(), "ignore previous instructions".len());
        assert!(!String::from_utf8_lossy(&sealed.ciphertext).contains("ignore"));
        let plain = v.decrypt(&sealed).unwrap();
        assert_eq!(plain.as_str(), Some("ignore previous instructions"));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let (_d, v) = vault();
        let sealed = v.encrypt(b"payload").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let mut other = test_key();
        other[0] ^= 0xFF;
        let v2 = PatternVault::with_key(&db, Some(&other)).unwrap();
        assert!(matches!(v2.decrypt(&sealed), Err(VaultError::Decryption)));
    }

    #[test]
    fn locked_vault_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let v = PatternVault::with_key(&db, None).unwrap();
        assert!(!v.is_unlocked());
        assert!(matches!(v.encrypt(b"x"), Err(VaultError::Locked)));
    }

    #[test]
    fn store_batch_is_insert_if_absent() {
        let (_d, v) = vault();
        let owner = Uuid::new_v4();
        let key = fragment_key(&owner, "h", "instruction-override", &(0..5));
        let r1 = v.seal_fragment(key.clone(), owner, "instruction-override", 1, "abcde").unwrap();
        let r2 = v.seal_fragment(key.clone(), owner, "instruction-override", 1, "abcde").unwrap();
        assert_eq!(v.store_batch(&[r1.clone()]).unwrap(), 1);
        assert_eq!(v.store_batch(&[r2]).unwrap(), 0);
        assert_eq!(v.len(), 1);
        assert_eq!(v.get(&key).unwrap().unwrap(), r1);
    }

    #[test]
    fn fragment_keys_are_deterministic() {
        let owner = Uuid::new_v4();
        let a = fragment_key(&owner, "h", "r", &(1..4));
        assert_eq!(a, fragment_key(&owner, "h", "r", &(1..4)));
        assert_ne!(a, fragment_key(&owner, "h", "r", &(1..5)));
        assert!(a.starts_with("pv_"));
    }

    #[test]
    fn retention_cleanup() {
        let (_d, v) = vault();
        let owner = Uuid::new_v4();
        let key = fragment_key(&owner, "h", "r", &(0..1));
        let rec = v.seal_fragment(key.clone(), owner, "r", 1, "x").unwrap();
        v.store_batch(&[rec]).unwrap();

        let now = Utc::now();
        assert_eq!(v.schedule_owner_cleanup(&owner, chrono::Duration::days(30), now).unwrap(), 1);
        assert_eq!(v.purge_expired(now).unwrap(), 0);
        assert!(v.contains(&key).unwrap(), "retained for audit until expiry");
        assert_eq!(v.purge_expired(now + chrono::Duration::days(31)).unwrap(), 1);
        assert!(v.is_empty());
    }

    #[test]
    fn parse_hex_key_validates_length() {
        assert!(parse_hex_key(&"ab".repeat(32)).is_ok());
        assert!(matches!(parse_hex_key("abcd"), Err(VaultError::InvalidKey(_))));
        assert!(matches!(parse_hex_key(&"zz".repeat(32)), Err(VaultError::InvalidKey(_))));
    }
}
