//! On-disk storage layout for CA material, leaf certificates and the
//! issuance inventory.
//!
//! Everything under the storage root is written with the temp-then-rename
//! pattern so a crash can never leave a half-written file at a target
//! path. Private keys are written 0600, certificates 0644.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::{LocalTlsError, Result};

/// Environment variable overriding the storage root.
pub const HOME_ENV_VAR: &str = "LOCALTLS_HOME";

/// Directory name under the user's home when the env override is unset.
const DEFAULT_DIR_NAME: &str = ".localtls";

/// File mode for private key material.
pub const KEY_MODE: u32 = 0o600;

/// File mode for public certificate material.
pub const CERT_MODE: u32 = 0o644;

/// Well-known paths inside a storage root.
///
/// The root is explicit configuration passed at construction; multiple
/// instances against different roots are independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the storage root from `LOCALTLS_HOME`, falling back to
    /// `~/.localtls`.
    pub fn from_env() -> Result<Self> {
        if let Some(dir) = std::env::var_os(HOME_ENV_VAR) {
            return Ok(Self::new(PathBuf::from(dir)));
        }
        let home = dirs::home_dir().ok_or_else(|| {
            LocalTlsError::io(
                DEFAULT_DIR_NAME,
                std::io::Error::new(std::io::ErrorKind::NotFound, "home directory not found"),
            )
        })?;
        Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_cert(&self) -> PathBuf {
        self.root.join("root_ca.pem")
    }

    pub fn root_key(&self) -> PathBuf {
        self.root.join("root_ca.key")
    }

    pub fn intermediate_cert(&self) -> PathBuf {
        self.root.join("intermediate.pem")
    }

    pub fn intermediate_key(&self) -> PathBuf {
        self.root.join("intermediate.key")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn index(&self) -> PathBuf {
        self.root.join("index.json")
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Local trust anchor used by the fallback trust backend.
    pub fn local_trust_anchor(&self) -> PathBuf {
        self.root.join("trust").join("localtls-root-ca.pem")
    }

    /// Leaf certificate path for a (normalized) primary name.
    pub fn leaf_cert(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.pem", leaf_file_stem(name)))
    }

    /// Leaf key path for a (normalized) primary name.
    pub fn leaf_key(&self, name: &str) -> PathBuf {
        self.certs_dir().join(format!("{}.key", leaf_file_stem(name)))
    }

    /// Create the root and certs directories.
    pub fn ensure_layout(&self) -> Result<()> {
        let certs = self.certs_dir();
        fs::create_dir_all(&certs).map_err(|e| LocalTlsError::io(&certs, e))?;
        Ok(())
    }

    /// True when root CA material is present on disk.
    pub fn ca_exists(&self) -> bool {
        self.root_cert().exists() && self.root_key().exists()
    }
}

/// File-name stem for a leaf. `*.app.localhost` maps to
/// `_wildcard.app.localhost` so the asterisk never hits the filesystem.
pub fn leaf_file_stem(name: &str) -> String {
    match name.strip_prefix("*.") {
        Some(apex) => format!("_wildcard.{apex}"),
        None => name.to_string(),
    }
}

/// Atomically write `bytes` to `path` with the given Unix mode.
///
/// Writes a sibling temp file in the same directory, fsyncs, sets the
/// mode, then renames over the target. The temp file is unlinked on any
/// failure (on drop).
pub fn atomic_write(path: &Path, bytes: &[u8], mode: u32) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| {
            LocalTlsError::io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
            )
        })?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".localtls-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| LocalTlsError::io(path, e))?;

    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| LocalTlsError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| LocalTlsError::io(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tmp.persist(path)
        .map_err(|e| LocalTlsError::io(path, e.error))?;
    Ok(())
}

/// One issued leaf, as persisted in `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InventoryRecord {
    /// 128-bit serial, lowercase hex.
    pub serial: String,
    /// Subject CN (first DNS name; display only).
    pub subject: String,
    /// Normalized SAN entries, DNS names then IPs.
    pub sans: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub revoked: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
}

impl InventoryRecord {
    /// Live means: not revoked and not expired at `now`.
    pub fn is_live(&self, now: OffsetDateTime) -> bool {
        !self.revoked && self.not_after > now
    }
}

/// The full issuance inventory, rewritten atomically on every change.
///
/// The file is small (one record per issued leaf) so a full rewrite is
/// cheaper and simpler than journaling.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub records: Vec<InventoryRecord>,
}

impl Inventory {
    /// Load the inventory from `index.json`. A missing file is an empty
    /// inventory; a file that does not parse or violates invariants is
    /// `StoreCorrupt` and is never auto-repaired.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(LocalTlsError::io(path, e)),
        };

        let records: Vec<InventoryRecord> = serde_json::from_slice(&data)
            .map_err(|e| LocalTlsError::StoreCorrupt(format!("{}: {e}", path.display())))?;

        let inv = Self { records };
        inv.check_invariants()?;
        Ok(inv)
    }

    /// Persist the inventory as a deterministic JSON array.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.records)?;
        atomic_write(path, &json, CERT_MODE)?;
        debug!(records = self.records.len(), path = %path.display(), "inventory saved");
        Ok(())
    }

    /// Serial uniqueness across all records, revoked or not.
    fn check_invariants(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for record in &self.records {
            if !seen.insert(record.serial.as_str()) {
                return Err(LocalTlsError::StoreCorrupt(format!(
                    "duplicate serial {}",
                    record.serial
                )));
            }
        }
        Ok(())
    }

    pub fn find_by_serial(&self, serial: &str) -> Option<&InventoryRecord> {
        self.records.iter().find(|r| r.serial == serial)
    }

    pub fn find_by_serial_mut(&mut self, serial: &str) -> Option<&mut InventoryRecord> {
        self.records.iter_mut().find(|r| r.serial == serial)
    }

    /// Replace any live record with the same normalized SAN set, then
    /// append. Keeps the at-most-one-live-record-per-SAN-set invariant.
    pub fn upsert(&mut self, record: InventoryRecord, now: OffsetDateTime) {
        self.records
            .retain(|r| !(r.is_live(now) && r.sans == record.sans));
        self.records.push(record);
    }

    /// Non-revoked, unexpired records sorted by `not_after` ascending.
    pub fn live_records(&self, now: OffsetDateTime) -> Vec<&InventoryRecord> {
        let mut live: Vec<&InventoryRecord> =
            self.records.iter().filter(|r| r.is_live(now)).collect();
        live.sort_by_key(|r| r.not_after);
        live
    }
}
