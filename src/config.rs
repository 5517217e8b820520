//! The authority's configuration document (`config.json`).
//!
//! Written once at `init`; never silently mutated afterwards.

use std::fs;

use serde::{Deserialize, Serialize};
use time::Duration;

use crate::error::{LocalTlsError, Result};
use crate::store::{atomic_write, StorePaths, CERT_MODE};

/// Default leaf validity when a request does not ask for one.
pub const DEFAULT_LEAF_VALIDITY_HOURS: u64 = 24;

/// Authority name and issuance defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Human-readable authority name, used in certificate subjects.
    pub authority_name: String,
    /// Default leaf validity in hours.
    pub default_validity_hours: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            authority_name: "LocalTLS Development CA".to_string(),
            default_validity_hours: DEFAULT_LEAF_VALIDITY_HOURS,
        }
    }
}

impl AuthorityConfig {
    /// Load the config document; a missing file means the store was
    /// never initialized.
    pub fn load(paths: &StorePaths) -> Result<Self> {
        let path = paths.config();
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LocalTlsError::NotInitialized);
            }
            Err(e) => return Err(LocalTlsError::io(&path, e)),
        };
        let config: AuthorityConfig = serde_json::from_slice(&data)
            .map_err(|e| LocalTlsError::StoreCorrupt(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    /// Persist the config document atomically.
    pub fn save(&self, paths: &StorePaths) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(&paths.config(), &json, CERT_MODE)
    }

    /// Default validity as a duration.
    pub fn default_validity(&self) -> Duration {
        Duration::hours(self.default_validity_hours as i64)
    }
}
