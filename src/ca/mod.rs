//! Two-tier certificate authority: Ed25519 root and intermediate.
//!
//! The root self-signs once and afterwards only signs intermediates. The
//! intermediate signs every leaf and is rotated automatically when fewer
//! than 30 days of validity remain; outstanding leaves keep chaining
//! through the old intermediate until they expire on their own.

use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};

use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose,
    SerialNumber,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::config::AuthorityConfig;
use crate::error::{LocalTlsError, Result};
use crate::store::{atomic_write, StorePaths, CERT_MODE, KEY_MODE};

/// Root certificate validity (10 years).
pub const ROOT_VALIDITY_DAYS: i64 = 3650;

/// Intermediate certificate validity (1 year).
pub const INTERMEDIATE_VALIDITY_DAYS: i64 = 365;

/// Rotate the intermediate when fewer than this many days remain.
pub const INTERMEDIATE_ROTATION_WINDOW_DAYS: i64 = 30;

/// Outcome of an intermediate rotation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Rotated,
    Unchanged,
}

/// A signing identity: certificate plus private key.
struct SignerMaterial {
    cert: Certificate,
    key: KeyPair,
    cert_pem: String,
    not_after: OffsetDateTime,
}

/// The certificate authority. Owns root and intermediate key material;
/// the only component that ever touches the CA private keys.
pub struct Ca {
    paths: StorePaths,
    authority_name: String,
    root: RwLock<SignerMaterial>,
    intermediate: Mutex<SignerMaterial>,
    /// Bumped on every root rotation so issuers can purge caches.
    root_generation: AtomicU64,
}

impl Ca {
    /// Create root and intermediate material if absent.
    ///
    /// With materials already on disk this fails with
    /// `AlreadyInitialized` unless both `force` and `rotate` are set, in
    /// which case the whole hierarchy is regenerated (invalidating every
    /// outstanding leaf).
    pub fn init(
        paths: &StorePaths,
        config: &AuthorityConfig,
        force: bool,
        rotate: bool,
    ) -> Result<Ca> {
        if paths.ca_exists() && !(force && rotate) {
            return Err(LocalTlsError::AlreadyInitialized);
        }
        paths.ensure_layout()?;

        let now = OffsetDateTime::now_utc();
        let root = generate_root(&config.authority_name, now)?;
        persist_signer(&root, &paths.root_cert(), &paths.root_key())?;

        let intermediate = generate_intermediate(
            &config.authority_name,
            &root,
            now,
            now + Duration::days(INTERMEDIATE_VALIDITY_DAYS),
        )?;
        persist_signer(
            &intermediate,
            &paths.intermediate_cert(),
            &paths.intermediate_key(),
        )?;

        info!(
            authority = %config.authority_name,
            root = %paths.root_cert().display(),
            "certificate authority initialized"
        );

        Ok(Ca {
            paths: paths.clone(),
            authority_name: config.authority_name.clone(),
            root: RwLock::new(root),
            intermediate: Mutex::new(intermediate),
            root_generation: AtomicU64::new(0),
        })
    }

    /// Load existing CA material from disk.
    pub fn open(paths: &StorePaths, config: &AuthorityConfig) -> Result<Ca> {
        let root = load_root(paths)?;
        let intermediate = load_intermediate(paths, &root)?;
        debug!(authority = %config.authority_name, "certificate authority loaded");

        Ok(Ca {
            paths: paths.clone(),
            authority_name: config.authority_name.clone(),
            root: RwLock::new(root),
            intermediate: Mutex::new(intermediate),
            root_generation: AtomicU64::new(0),
        })
    }

    /// Sign a leaf with the current intermediate key.
    ///
    /// Returns the leaf PEM plus the current intermediate PEM for chain
    /// construction. The intermediate is Ed25519, so the leaf's
    /// signatureAlgorithm is Ed25519 regardless of the leaf key type.
    pub fn sign_leaf(&self, params: CertificateParams, leaf_key: &KeyPair) -> Result<(String, String)> {
        let im = self.intermediate.lock().expect("intermediate lock poisoned");
        let cert = params.signed_by(leaf_key, &im.cert, &im.key)?;
        Ok((cert.pem(), im.cert_pem.clone()))
    }

    /// Rotate the intermediate when it is inside the rotation window.
    ///
    /// Called on every issuance; the common case is a single timestamp
    /// comparison under the intermediate mutex.
    pub fn maybe_rotate_intermediate(&self, now: OffsetDateTime) -> Result<RotationOutcome> {
        let mut im = self.intermediate.lock().expect("intermediate lock poisoned");
        if im.not_after - now > Duration::days(INTERMEDIATE_ROTATION_WINDOW_DAYS) {
            return Ok(RotationOutcome::Unchanged);
        }

        let root = self.root.read().expect("root lock poisoned");
        let fresh = generate_intermediate(
            &self.authority_name,
            &root,
            now,
            now + Duration::days(INTERMEDIATE_VALIDITY_DAYS),
        )?;
        persist_signer(
            &fresh,
            &self.paths.intermediate_cert(),
            &self.paths.intermediate_key(),
        )?;

        info!(
            expires = %fresh.not_after,
            "intermediate certificate rotated"
        );
        *im = fresh;
        Ok(RotationOutcome::Rotated)
    }

    /// Explicit operator action: regenerate root and intermediate.
    ///
    /// Every outstanding leaf stops validating; issuers observe the
    /// generation bump and purge their caches.
    pub fn rotate_root(&self) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let mut im = self.intermediate.lock().expect("intermediate lock poisoned");
        let mut root = self.root.write().expect("root lock poisoned");

        let new_root = generate_root(&self.authority_name, now)?;
        persist_signer(&new_root, &self.paths.root_cert(), &self.paths.root_key())?;

        let new_intermediate = generate_intermediate(
            &self.authority_name,
            &new_root,
            now,
            now + Duration::days(INTERMEDIATE_VALIDITY_DAYS),
        )?;
        persist_signer(
            &new_intermediate,
            &self.paths.intermediate_cert(),
            &self.paths.intermediate_key(),
        )?;

        *root = new_root;
        *im = new_intermediate;
        self.root_generation.fetch_add(1, Ordering::SeqCst);
        info!("root certificate rotated; all previously issued leaves are invalid");
        Ok(())
    }

    /// PEM of the root certificate, for the trust installer.
    pub fn root_pem(&self) -> String {
        self.root.read().expect("root lock poisoned").cert_pem.clone()
    }

    /// PEM of the current intermediate certificate.
    pub fn intermediate_pem(&self) -> String {
        self.intermediate
            .lock()
            .expect("intermediate lock poisoned")
            .cert_pem
            .clone()
    }

    /// Expiry of the current intermediate.
    pub fn intermediate_not_after(&self) -> OffsetDateTime {
        self.intermediate
            .lock()
            .expect("intermediate lock poisoned")
            .not_after
    }

    /// Monotonic counter bumped on root rotation.
    pub fn root_generation(&self) -> u64 {
        self.root_generation.load(Ordering::SeqCst)
    }

    pub fn authority_name(&self) -> &str {
        &self.authority_name
    }

    #[cfg(test)]
    fn install_short_lived_intermediate(&self, not_after: OffsetDateTime) {
        let now = OffsetDateTime::now_utc();
        let root = self.root.read().unwrap();
        let fresh =
            generate_intermediate(&self.authority_name, &root, now, not_after).unwrap();
        persist_signer(
            &fresh,
            &self.paths.intermediate_cert(),
            &self.paths.intermediate_key(),
        )
        .unwrap();
        drop(root);
        *self.intermediate.lock().unwrap() = fresh;
    }
}

/// 128 random bits with the high bit cleared, so the DER integer never
/// needs a leading zero octet and never reads as negative.
pub fn random_serial_bytes() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    bytes
}

fn generate_root(authority_name: &str, now: OffsetDateTime) -> Result<SignerMaterial> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;
    let not_after = now + Duration::days(ROOT_VALIDITY_DAYS);

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{authority_name} Root"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, authority_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(1));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.use_authority_key_identifier_extension = true;
    params.not_before = now;
    params.not_after = not_after;
    params.serial_number = Some(SerialNumber::from(random_serial_bytes().to_vec()));

    let cert = params.self_signed(&key)?;
    let cert_pem = cert.pem();
    Ok(SignerMaterial {
        cert,
        key,
        cert_pem,
        not_after,
    })
}

fn generate_intermediate(
    authority_name: &str,
    root: &SignerMaterial,
    now: OffsetDateTime,
    not_after: OffsetDateTime,
) -> Result<SignerMaterial> {
    let key = KeyPair::generate_for(&rcgen::PKCS_ED25519)?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{authority_name} Intermediate"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, authority_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    params.use_authority_key_identifier_extension = true;
    params.not_before = now;
    params.not_after = not_after;
    params.serial_number = Some(SerialNumber::from(random_serial_bytes().to_vec()));

    let cert = params.signed_by(&key, &root.cert, &root.key)?;
    let cert_pem = cert.pem();
    Ok(SignerMaterial {
        cert,
        key,
        cert_pem,
        not_after,
    })
}

/// Key first (0600), then certificate (0644); both temp-then-rename.
fn persist_signer(
    material: &SignerMaterial,
    cert_path: &std::path::Path,
    key_path: &std::path::Path,
) -> Result<()> {
    atomic_write(key_path, material.key.serialize_pem().as_bytes(), KEY_MODE)?;
    atomic_write(cert_path, material.cert_pem.as_bytes(), CERT_MODE)?;
    Ok(())
}

fn read_pem(path: &std::path::Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(pem) => Ok(pem),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(LocalTlsError::NotInitialized),
        Err(e) => Err(LocalTlsError::io(path, e)),
    }
}

fn load_root(paths: &StorePaths) -> Result<SignerMaterial> {
    let cert_pem = read_pem(&paths.root_cert())?;
    let key_pem = read_pem(&paths.root_key())?;

    let key = KeyPair::from_pem(&key_pem)?;
    // rcgen cannot deserialize a Certificate directly; recover the
    // parameters from the stored PEM and re-sign with the stored key.
    // Ed25519 signatures are deterministic, so the result matches disk.
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
    let not_after = pem_not_after(&cert_pem, &paths.root_cert())?;
    let cert = params.self_signed(&key)?;

    Ok(SignerMaterial {
        cert,
        key,
        cert_pem,
        not_after,
    })
}

fn load_intermediate(paths: &StorePaths, root: &SignerMaterial) -> Result<SignerMaterial> {
    let cert_pem = read_pem(&paths.intermediate_cert())?;
    let key_pem = read_pem(&paths.intermediate_key())?;

    let key = KeyPair::from_pem(&key_pem)?;
    let params = CertificateParams::from_ca_cert_pem(&cert_pem)?;
    let not_after = pem_not_after(&cert_pem, &paths.intermediate_cert())?;
    let cert = params.signed_by(&key, &root.cert, &root.key)?;

    Ok(SignerMaterial {
        cert,
        key,
        cert_pem,
        not_after,
    })
}

/// Read `notAfter` out of a certificate PEM.
fn pem_not_after(pem: &str, path: &std::path::Path) -> Result<OffsetDateTime> {
    let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| LocalTlsError::StoreCorrupt(format!("{}: {e}", path.display())))?;
    let cert = doc
        .parse_x509()
        .map_err(|e| LocalTlsError::StoreCorrupt(format!("{}: {e}", path.display())))?;
    OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
        .map_err(|e| LocalTlsError::StoreCorrupt(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

    fn test_config() -> AuthorityConfig {
        AuthorityConfig {
            authority_name: "Test Dev CA".to_string(),
            ..AuthorityConfig::default()
        }
    }

    fn parse_pem(pem: &str) -> Vec<u8> {
        let (_, doc) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).unwrap();
        doc.contents.clone()
    }

    fn ski(der: &[u8]) -> Vec<u8> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        cert.extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(ki) => Some(ki.0.to_vec()),
                _ => None,
            })
            .expect("certificate has an SKI")
    }

    fn aki(der: &[u8]) -> Vec<u8> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        cert.extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::AuthorityKeyIdentifier(aki) => {
                    aki.key_identifier.as_ref().map(|ki| ki.0.to_vec())
                }
                _ => None,
            })
            .expect("certificate has an AKI")
    }

    #[test]
    fn test_init_creates_material_with_modes() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        Ca::init(&paths, &test_config(), false, false).unwrap();

        assert!(paths.root_cert().exists());
        assert!(paths.root_key().exists());
        assert!(paths.intermediate_cert().exists());
        assert!(paths.intermediate_key().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let key_mode = fs::metadata(paths.root_key()).unwrap().permissions().mode();
            assert_eq!(key_mode & 0o777, KEY_MODE);
            let cert_mode = fs::metadata(paths.root_cert()).unwrap().permissions().mode();
            assert_eq!(cert_mode & 0o777, CERT_MODE);
        }
    }

    #[test]
    fn test_init_twice_is_already_initialized() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        Ca::init(&paths, &test_config(), false, false).unwrap();

        assert!(matches!(
            Ca::init(&paths, &test_config(), false, false),
            Err(LocalTlsError::AlreadyInitialized)
        ));
        // force alone is not enough; rotation must be explicit.
        assert!(matches!(
            Ca::init(&paths, &test_config(), true, false),
            Err(LocalTlsError::AlreadyInitialized)
        ));
        assert!(Ca::init(&paths, &test_config(), true, true).is_ok());
    }

    #[test]
    fn test_root_is_self_signed_ca_with_pathlen_one() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let der = parse_pem(&ca.root_pem());
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        assert_eq!(cert.subject(), cert.issuer());

        let (is_ca, path_len) = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => Some((bc.ca, bc.path_len_constraint)),
                _ => None,
            })
            .unwrap();
        assert!(is_ca);
        assert_eq!(path_len, Some(1));

        // Self-signed: SKI and AKI identify the same key.
        assert_eq!(ski(&der), aki(&der));
    }

    #[test]
    fn test_intermediate_chains_to_root() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let root_der = parse_pem(&ca.root_pem());
        let int_der = parse_pem(&ca.intermediate_pem());

        let (_, root) = X509Certificate::from_der(&root_der).unwrap();
        let (_, intermediate) = X509Certificate::from_der(&int_der).unwrap();
        assert_eq!(intermediate.issuer(), root.subject());
        assert_eq!(aki(&int_der), ski(&root_der));

        let (is_ca, path_len) = intermediate
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::BasicConstraints(bc) => Some((bc.ca, bc.path_len_constraint)),
                _ => None,
            })
            .unwrap();
        assert!(is_ca);
        assert_eq!(path_len, Some(0));
    }

    #[test]
    fn test_open_round_trips_material() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let created = Ca::init(&paths, &test_config(), false, false).unwrap();
        let opened = Ca::open(&paths, &test_config()).unwrap();

        assert_eq!(created.root_pem(), opened.root_pem());
        assert_eq!(created.intermediate_pem(), opened.intermediate_pem());
    }

    #[test]
    fn test_open_missing_material_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        assert!(matches!(
            Ca::open(&paths, &test_config()),
            Err(LocalTlsError::NotInitialized)
        ));
    }

    #[test]
    fn test_rotation_outside_window_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let now = OffsetDateTime::now_utc();
        assert_eq!(
            ca.maybe_rotate_intermediate(now).unwrap(),
            RotationOutcome::Unchanged
        );
    }

    #[test]
    fn test_rotation_inside_window_swaps_intermediate() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let now = OffsetDateTime::now_utc();
        ca.install_short_lived_intermediate(now + Duration::days(1));
        let old_pem = ca.intermediate_pem();

        assert_eq!(
            ca.maybe_rotate_intermediate(now).unwrap(),
            RotationOutcome::Rotated
        );
        let new_pem = ca.intermediate_pem();
        assert_ne!(old_pem, new_pem);

        // The fresh intermediate chains to the unchanged root and is
        // valid starting now.
        let root_der = parse_pem(&ca.root_pem());
        let int_der = parse_pem(&new_pem);
        assert_eq!(aki(&int_der), ski(&root_der));

        let (_, cert) = X509Certificate::from_der(&int_der).unwrap();
        assert!(cert.validity().not_before.timestamp() <= now.unix_timestamp());
        assert!(
            ca.intermediate_not_after() - now
                > Duration::days(INTERMEDIATE_ROTATION_WINDOW_DAYS)
        );

        // The swap was persisted.
        let on_disk = fs::read_to_string(paths.intermediate_cert()).unwrap();
        assert_eq!(on_disk, new_pem);
    }

    #[test]
    fn test_rotate_root_bumps_generation() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let old_root = ca.root_pem();
        assert_eq!(ca.root_generation(), 0);
        ca.rotate_root().unwrap();
        assert_eq!(ca.root_generation(), 1);
        assert_ne!(ca.root_pem(), old_root);

        // The new intermediate chains to the new root.
        let root_der = parse_pem(&ca.root_pem());
        let int_der = parse_pem(&ca.intermediate_pem());
        assert_eq!(aki(&int_der), ski(&root_der));
    }

    #[test]
    fn test_serials_are_positive_and_unique() {
        for _ in 0..64 {
            let serial = random_serial_bytes();
            assert_eq!(serial[0] & 0x80, 0);
        }
        let a = random_serial_bytes();
        let b = random_serial_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_root_signature_algorithm_is_ed25519() {
        let dir = TempDir::new().unwrap();
        let paths = StorePaths::new(dir.path());
        let ca = Ca::init(&paths, &test_config(), false, false).unwrap();

        let der = parse_pem(&ca.root_pem());
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        // id-Ed25519 = 1.3.101.112
        assert_eq!(
            cert.signature_algorithm.algorithm.to_id_string(),
            "1.3.101.112"
        );
    }
}
