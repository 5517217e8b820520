//! Leaf issuance: cache, single-flight coalescing and lazy renewal.
//!
//! The issuer owns the in-memory index over the on-disk inventory. Reads
//! (`get`, `list`, the `ensure` fast path) take a read lock; the write
//! lock is held only while publishing a finished issuance, a revocation
//! or a purge. Concurrent `ensure` calls for the same fingerprint
//! coalesce into a single signing operation.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};

use rcgen::{CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber};
use serde::Serialize;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::ca::{random_serial_bytes, Ca};
use crate::config::AuthorityConfig;
use crate::error::{LocalTlsError, PolicyError, Result};
use crate::policy;
use crate::store::{atomic_write, Inventory, InventoryRecord, StorePaths, CERT_MODE, KEY_MODE};

/// Renewal threshold never drops below one hour of remaining lifetime.
const RENEWAL_FLOOR: Duration = Duration::hours(1);

type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// A request for a leaf certificate.
#[derive(Debug, Clone, Default)]
pub struct IssueRequest {
    /// DNS names (plain or wildcard patterns).
    pub dns_names: Vec<String>,
    /// IP address SANs.
    pub ips: Vec<IpAddr>,
    /// Requested validity; `None` uses the configured default.
    pub validity: Option<Duration>,
}

impl IssueRequest {
    /// Request for a single DNS name with default validity.
    pub fn for_domain(domain: impl Into<String>) -> Self {
        Self {
            dns_names: vec![domain.into()],
            ..Self::default()
        }
    }
}

/// An issued certificate: materials plus the on-disk contract paths.
#[derive(Debug, Clone, Serialize)]
pub struct Certificate {
    /// 128-bit serial, lowercase hex.
    pub serial: String,
    /// Subject CN, display only.
    pub subject: String,
    /// DNS SAN entries, normalized.
    pub dns_names: Vec<String>,
    /// IP SAN entries in canonical form.
    pub ip_sans: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    /// Serving chain: leaf followed by the signing intermediate.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_pem: String,
    pub key_pem: String,
}

/// Normalized form of a request: what actually goes into the SAN
/// extension, plus the names the caller asked for (wildcard apexes the
/// issuer added are not part of `requested`).
struct NormalizedRequest {
    requested: Vec<String>,
    dns_names: Vec<String>,
    ips: Vec<IpAddr>,
    validity: Duration,
}

struct CacheEntry {
    cert: Certificate,
    requested: Vec<String>,
}

#[derive(Default)]
struct IssuerState {
    by_fingerprint: HashMap<String, CacheEntry>,
    by_domain: HashMap<String, String>,
    inventory: Inventory,
}

/// Completion handle for one in-flight issuance.
struct Inflight {
    slot: Mutex<Option<std::result::Result<Certificate, String>>>,
    done: Condvar,
}

/// The leaf issuer. Safe to share across threads behind an `Arc`.
pub struct Issuer {
    ca: Arc<Ca>,
    paths: StorePaths,
    default_validity: Duration,
    state: RwLock<IssuerState>,
    inflight: Mutex<HashMap<String, Arc<Inflight>>>,
    clock: Clock,
    seen_root_generation: AtomicU64,
}

impl Issuer {
    /// Open the issuer over an existing store, hydrating the cache from
    /// the inventory. A live record whose PEM files are missing is a
    /// corruption, not a silent miss.
    pub fn open(ca: Arc<Ca>, paths: StorePaths, config: &AuthorityConfig) -> Result<Issuer> {
        paths.ensure_layout()?;
        let inventory = Inventory::load(&paths.index())?;
        let now = OffsetDateTime::now_utc();

        let mut state = IssuerState {
            inventory,
            ..IssuerState::default()
        };

        for record in state.inventory.records.clone() {
            if !record.is_live(now) {
                continue;
            }
            let chain_pem = std::fs::read_to_string(&record.cert_path).map_err(|_| {
                LocalTlsError::StoreCorrupt(format!(
                    "record {} references missing file {}",
                    record.serial,
                    record.cert_path.display()
                ))
            })?;
            let key_pem = std::fs::read_to_string(&record.key_path).map_err(|_| {
                LocalTlsError::StoreCorrupt(format!(
                    "record {} references missing file {}",
                    record.serial,
                    record.key_path.display()
                ))
            })?;

            let (dns_names, ip_sans) = split_sans(&record.sans);
            let requested = requested_from_sans(&record.sans);
            let fingerprint = fingerprint(
                &dns_names,
                &ip_sans,
                record.not_after - record.not_before,
            );

            for name in &requested {
                state.by_domain.insert(name.clone(), fingerprint.clone());
            }
            state.by_fingerprint.insert(
                fingerprint,
                CacheEntry {
                    cert: Certificate {
                        serial: record.serial.clone(),
                        subject: record.subject.clone(),
                        dns_names,
                        ip_sans,
                        not_before: record.not_before,
                        not_after: record.not_after,
                        cert_path: record.cert_path.clone(),
                        key_path: record.key_path.clone(),
                        chain_pem,
                        key_pem,
                    },
                    requested,
                },
            );
        }

        debug!(
            cached = state.by_fingerprint.len(),
            records = state.inventory.records.len(),
            "issuer opened"
        );

        Ok(Issuer {
            seen_root_generation: AtomicU64::new(ca.root_generation()),
            ca,
            paths,
            default_validity: config.default_validity(),
            state: RwLock::new(state),
            inflight: Mutex::new(HashMap::new()),
            clock: Arc::new(OffsetDateTime::now_utc),
        })
    }

    /// Primary entry point: cached certificate if it is still fresh,
    /// otherwise a (coalesced) issuance.
    pub fn ensure(&self, domain: &str) -> Result<Certificate> {
        self.check_root_generation();
        let request = self.normalize(IssueRequest::for_domain(domain))?;
        let fp = fingerprint(&request.dns_names, &canonical_ips(&request.ips), request.validity);
        let now = (self.clock)();

        if let Some(cert) = self.fresh_from_cache(&fp, now) {
            return Ok(cert);
        }
        self.coalesced_issue(&fp, request)
    }

    /// Cached lookup by exact requested name. Never issues.
    pub fn get(&self, domain: &str) -> Result<Certificate> {
        self.check_root_generation();
        let name = policy::normalize(domain);
        let now = (self.clock)();

        let state = self.state.read().expect("issuer lock poisoned");
        let entry = state
            .by_domain
            .get(&name)
            .and_then(|fp| state.by_fingerprint.get(fp))
            .filter(|entry| entry.requested == [name.clone()])
            .filter(|entry| entry.cert.not_after > now)
            .ok_or_else(|| LocalTlsError::NotFound(name.clone()))?;
        Ok(entry.cert.clone())
    }

    /// Always produce a fresh certificate, bypassing the cache.
    pub fn issue(&self, request: IssueRequest) -> Result<Certificate> {
        self.check_root_generation();
        let request = self.normalize(request)?;
        self.issue_normalized(request)
    }

    /// Mark a serial revoked and drop it from the serving cache.
    /// Idempotent; unknown serials are `NotFound`.
    pub fn revoke(&self, serial: &str) -> Result<()> {
        let serial = serial.trim().to_ascii_lowercase();
        let now = (self.clock)();
        let mut state = self.state.write().expect("issuer lock poisoned");

        let newly_revoked = {
            let record = state
                .inventory
                .find_by_serial_mut(&serial)
                .ok_or_else(|| LocalTlsError::NotFound(serial.clone()))?;
            if record.revoked {
                false
            } else {
                record.revoked = true;
                record.revoked_at = Some(now);
                true
            }
        };
        if newly_revoked {
            state.inventory.save(&self.paths.index())?;
            info!(serial = %serial, "certificate revoked");
        }

        let fp = state
            .by_fingerprint
            .iter()
            .find(|(_, entry)| entry.cert.serial == serial)
            .map(|(fp, _)| fp.clone());
        if let Some(fp) = fp {
            state.by_fingerprint.remove(&fp);
            state.by_domain.retain(|_, v| *v != fp);
        }
        Ok(())
    }

    /// Snapshot of live inventory records, soonest expiry first.
    pub fn list(&self) -> Result<Vec<Certificate>> {
        self.check_root_generation();
        let now = (self.clock)();
        let state = self.state.read().expect("issuer lock poisoned");

        let mut out = Vec::new();
        for record in state.inventory.live_records(now) {
            if let Some(entry) = state
                .by_fingerprint
                .values()
                .find(|e| e.cert.serial == record.serial)
            {
                out.push(entry.cert.clone());
                continue;
            }
            // Cache purges (root rotation) can leave live records behind;
            // rebuild from disk.
            let chain_pem = std::fs::read_to_string(&record.cert_path)
                .map_err(|e| LocalTlsError::io(&record.cert_path, e))?;
            let key_pem = std::fs::read_to_string(&record.key_path)
                .map_err(|e| LocalTlsError::io(&record.key_path, e))?;
            let (dns_names, ip_sans) = split_sans(&record.sans);
            out.push(Certificate {
                serial: record.serial.clone(),
                subject: record.subject.clone(),
                dns_names,
                ip_sans,
                not_before: record.not_before,
                not_after: record.not_after,
                cert_path: record.cert_path.clone(),
                key_path: record.key_path.clone(),
                chain_pem,
                key_pem,
            });
        }
        Ok(out)
    }

    // ---- internals ------------------------------------------------------

    /// Validate and canonicalize a request: lowercase, dedup, expand
    /// wildcard apexes, resolve the validity.
    fn normalize(&self, request: IssueRequest) -> Result<NormalizedRequest> {
        if request.dns_names.is_empty() && request.ips.is_empty() {
            return Err(LocalTlsError::PolicyViolation {
                name: String::new(),
                reason: PolicyError::EmptyRequest,
            });
        }

        let mut requested = Vec::new();
        let mut dns_names = Vec::new();
        let mut seen = HashSet::new();
        for raw in &request.dns_names {
            let name = policy::normalize(raw);
            policy::validate_dns(&name).map_err(|reason| LocalTlsError::PolicyViolation {
                name: name.clone(),
                reason,
            })?;
            if seen.insert(name.clone()) {
                requested.push(name.clone());
                dns_names.push(name);
            }
        }

        // A wildcard covers the apex in browsers only via a second SAN;
        // sign both.
        for pattern in requested.clone() {
            if let Some(apex) = pattern.strip_prefix("*.") {
                if seen.insert(apex.to_string()) {
                    dns_names.push(apex.to_string());
                }
            }
        }

        let mut ips = Vec::new();
        let mut seen_ips = HashSet::new();
        for ip in &request.ips {
            policy::validate_ip(ip).map_err(|reason| LocalTlsError::PolicyViolation {
                name: ip.to_string(),
                reason,
            })?;
            if seen_ips.insert(*ip) {
                requested.push(ip.to_string());
                ips.push(*ip);
            }
        }

        Ok(NormalizedRequest {
            requested,
            dns_names,
            ips,
            validity: request.validity.unwrap_or(self.default_validity),
        })
    }

    /// Full issuance: key, template, signature, disk commit, publish.
    fn issue_normalized(&self, request: NormalizedRequest) -> Result<Certificate> {
        let now = (self.clock)();
        self.ca.maybe_rotate_intermediate(now)?;

        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let serial_bytes = random_serial_bytes();
        let serial = hex::encode(serial_bytes);

        let subject = request
            .dns_names
            .first()
            .cloned()
            .or_else(|| request.ips.first().map(|ip| ip.to_string()))
            .expect("normalized request is non-empty");

        let not_before = now;
        let not_after = now + request.validity;

        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, &subject);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        params.not_before = not_before;
        params.not_after = not_after;
        params.serial_number = Some(SerialNumber::from(serial_bytes.to_vec()));
        for name in &request.dns_names {
            params
                .subject_alt_names
                .push(SanType::DnsName(name.as_str().try_into()?));
        }
        for ip in &request.ips {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        let (leaf_pem, intermediate_pem) = self.ca.sign_leaf(params, &leaf_key)?;
        let chain_pem = format!("{leaf_pem}{intermediate_pem}");
        let key_pem = leaf_key.serialize_pem();

        let primary = request
            .requested
            .first()
            .expect("normalized request is non-empty");
        let cert_path = self.paths.leaf_cert(primary);
        let key_path = self.paths.leaf_key(primary);

        // Key first so a crash can never leave a served cert without its
        // key; certificate second; inventory last.
        atomic_write(&key_path, key_pem.as_bytes(), KEY_MODE)?;
        atomic_write(&cert_path, chain_pem.as_bytes(), CERT_MODE)?;

        let ip_sans = canonical_ips(&request.ips);
        let mut sans = request.dns_names.clone();
        sans.extend(ip_sans.iter().cloned());

        let record = InventoryRecord {
            serial: serial.clone(),
            subject: subject.clone(),
            sans: sans.clone(),
            not_before,
            not_after,
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            revoked: false,
            revoked_at: None,
        };

        let cert = Certificate {
            serial,
            subject,
            dns_names: request.dns_names.clone(),
            ip_sans: ip_sans.clone(),
            not_before,
            not_after,
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            chain_pem,
            key_pem,
        };

        let fp = fingerprint(&request.dns_names, &ip_sans, request.validity);
        {
            let mut state = self.state.write().expect("issuer lock poisoned");
            state.inventory.upsert(record, now);
            if let Err(e) = state.inventory.save(&self.paths.index()) {
                // Roll back the PEM files so no record-less material is
                // left behind.
                let _ = std::fs::remove_file(&cert_path);
                let _ = std::fs::remove_file(&key_path);
                return Err(e);
            }

            // Evict any older entry covering the same SAN set (e.g. a
            // different requested validity).
            let stale: Vec<String> = state
                .by_fingerprint
                .iter()
                .filter(|(candidate, entry)| {
                    **candidate != fp && {
                        let mut entry_sans = entry.cert.dns_names.clone();
                        entry_sans.extend(entry.cert.ip_sans.iter().cloned());
                        entry_sans == sans
                    }
                })
                .map(|(candidate, _)| candidate.clone())
                .collect();
            for candidate in stale {
                state.by_fingerprint.remove(&candidate);
                state.by_domain.retain(|_, v| *v != candidate);
            }

            for name in &request.requested {
                state.by_domain.insert(name.clone(), fp.clone());
            }
            state.by_fingerprint.insert(
                fp,
                CacheEntry {
                    cert: cert.clone(),
                    requested: request.requested.clone(),
                },
            );
        }

        info!(
            serial = %cert.serial,
            subject = %cert.subject,
            not_after = %cert.not_after,
            "certificate issued"
        );
        Ok(cert)
    }

    /// Cached certificate for a fingerprint, if its remaining lifetime
    /// exceeds the renewal threshold (half the original validity, with a
    /// one-hour floor).
    fn fresh_from_cache(&self, fp: &str, now: OffsetDateTime) -> Option<Certificate> {
        let state = self.state.read().expect("issuer lock poisoned");
        let entry = state.by_fingerprint.get(fp)?;
        let original = entry.cert.not_after - entry.cert.not_before;
        let threshold = std::cmp::max(original / 2, RENEWAL_FLOOR);
        if entry.cert.not_after - now > threshold {
            Some(entry.cert.clone())
        } else {
            None
        }
    }

    /// Single-flight issuance: the first caller for a fingerprint signs;
    /// the rest wait on its completion handle and share the result.
    fn coalesced_issue(&self, fp: &str, request: NormalizedRequest) -> Result<Certificate> {
        enum Role {
            Leader(Arc<Inflight>),
            Waiter(Arc<Inflight>),
        }

        let role = {
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            match inflight.get(fp) {
                Some(handle) => Role::Waiter(Arc::clone(handle)),
                None => {
                    let handle = Arc::new(Inflight {
                        slot: Mutex::new(None),
                        done: Condvar::new(),
                    });
                    inflight.insert(fp.to_string(), Arc::clone(&handle));
                    Role::Leader(handle)
                }
            }
        };

        match role {
            Role::Leader(handle) => {
                // Another leader may have published while we were racing
                // for the handle.
                let result = match self.fresh_from_cache(fp, (self.clock)()) {
                    Some(cert) => Ok(cert),
                    None => self.issue_normalized(request),
                };

                {
                    let mut slot = handle.slot.lock().expect("inflight slot poisoned");
                    *slot = Some(match &result {
                        Ok(cert) => Ok(cert.clone()),
                        Err(e) => Err(e.to_string()),
                    });
                }
                handle.done.notify_all();
                self.inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(fp);
                result
            }
            Role::Waiter(handle) => {
                debug!(fingerprint = %fp, "coalescing with in-flight issuance");
                let mut slot = handle.slot.lock().expect("inflight slot poisoned");
                while slot.is_none() {
                    slot = handle.done.wait(slot).expect("inflight slot poisoned");
                }
                match slot.as_ref().expect("slot is set") {
                    Ok(cert) => Ok(cert.clone()),
                    Err(message) => Err(LocalTlsError::Issuance(message.clone())),
                }
            }
        }
    }

    /// A root rotation invalidates every cached leaf.
    fn check_root_generation(&self) {
        let current = self.ca.root_generation();
        if self.seen_root_generation.swap(current, Ordering::SeqCst) != current {
            let mut state = self.state.write().expect("issuer lock poisoned");
            state.by_fingerprint.clear();
            state.by_domain.clear();
            info!("root rotated; issuer cache purged");
        }
    }
}

/// Canonical cache key: sorted-unique DNS names, sorted-unique IPs, and
/// the resolved validity in seconds.
fn fingerprint(dns_names: &[String], ip_sans: &[String], validity: Duration) -> String {
    let mut dns: Vec<&str> = dns_names.iter().map(String::as_str).collect();
    dns.sort_unstable();
    dns.dedup();
    let mut ips: Vec<&str> = ip_sans.iter().map(String::as_str).collect();
    ips.sort_unstable();
    ips.dedup();
    format!(
        "{}|{}|{}",
        dns.join(","),
        ips.join(","),
        validity.whole_seconds()
    )
}

fn canonical_ips(ips: &[IpAddr]) -> Vec<String> {
    ips.iter().map(|ip| ip.to_string()).collect()
}

/// Split a persisted SAN list back into DNS names and IP strings.
fn split_sans(sans: &[String]) -> (Vec<String>, Vec<String>) {
    let mut dns = Vec::new();
    let mut ips = Vec::new();
    for san in sans {
        if san.parse::<IpAddr>().is_ok() {
            ips.push(san.clone());
        } else {
            dns.push(san.clone());
        }
    }
    (dns, ips)
}

/// The names a caller originally asked for: every SAN except apexes that
/// exist solely because a wildcard pattern implied them.
fn requested_from_sans(sans: &[String]) -> Vec<String> {
    let apexes: HashSet<&str> = sans
        .iter()
        .filter_map(|s| s.strip_prefix("*."))
        .collect();
    sans.iter()
        .filter(|s| !apexes.contains(s.as_str()))
        .cloned()
        .collect()
}
