//! Trust-store installation for the root certificate.
//!
//! Backends are chosen by capability detection (which helper binaries
//! actually exist), never by parsing an OS name. Identity matching for
//! idempotence and uninstall is always Subject plus Subject Key
//! Identifier, never a filename. External helpers run with a hard 10
//! second budget.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use x509_parser::prelude::{FromDer, ParsedExtension, X509Certificate};

use crate::error::TrustError;
use crate::store::{atomic_write, StorePaths, CERT_MODE};

/// Budget for any external trust-store helper.
const HELPER_TIMEOUT: Duration = Duration::from_secs(10);

const DEBIAN_ANCHORS: &str = "/usr/local/share/ca-certificates";
const CA_TRUST_ANCHOR_DIRS: &[&str] = &[
    "/etc/pki/ca-trust/source/anchors",
    "/etc/ca-certificates/trust-source/anchors",
];
const ANCHOR_FILE_NAME: &str = "localtls-root-ca.crt";
const MAC_SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";

/// Best-effort answer to "is the root trusted here?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustStatus {
    Installed,
    NotInstalled,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed,
    AlreadyTrusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UninstallOutcome {
    Removed,
    NotTrusted,
}

/// What identifies "our" root inside a store: Subject and SKI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaIdentity {
    pub subject: String,
    pub common_name: String,
    pub ski: Option<Vec<u8>>,
}

impl CaIdentity {
    pub fn from_pem(pem: &[u8]) -> Result<CaIdentity, TrustError> {
        let ders = parse_pem_bundle(pem);
        let der = ders
            .first()
            .ok_or_else(|| TrustError::CommandFailed("no certificate in PEM input".into()))?;
        Self::from_der(der)
    }

    fn from_der(der: &[u8]) -> Result<CaIdentity, TrustError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| TrustError::CommandFailed(format!("certificate parse: {e}")))?;
        let subject = cert.subject().to_string();
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default()
            .to_string();
        let ski = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(ki) => Some(ki.0.to_vec()),
                _ => None,
            });
        Ok(CaIdentity {
            subject,
            common_name,
            ski,
        })
    }

    fn matches(&self, other: &CaIdentity) -> bool {
        self.subject == other.subject && self.ski == other.ski
    }

    /// True when any certificate in `bundle` carries this identity.
    fn found_in_bundle(&self, bundle: &[u8]) -> bool {
        parse_pem_bundle(bundle)
            .iter()
            .filter_map(|der| CaIdentity::from_der(der).ok())
            .any(|candidate| self.matches(&candidate))
    }
}

/// One way of making a root certificate trusted.
pub trait TrustBackend: Send + Sync {
    fn name(&self) -> &'static str;
    fn install(&self, root_pem: &str, identity: &CaIdentity) -> Result<InstallOutcome, TrustError>;
    fn uninstall(&self, identity: &CaIdentity) -> Result<UninstallOutcome, TrustError>;
    fn status(&self, identity: &CaIdentity) -> TrustStatus;
}

/// Installs and removes the root certificate in the most capable store
/// available on this machine.
pub struct TrustInstaller {
    backend: Box<dyn TrustBackend>,
}

impl TrustInstaller {
    /// Pick a backend by capability, in priority order: the macOS
    /// `security` tool, the Debian/Ubuntu updater, the Fedora/Arch
    /// updater, then a local trust file with manual instructions.
    pub fn detect(paths: &StorePaths) -> TrustInstaller {
        let backend: Box<dyn TrustBackend> = if let Some(tool) = find_in_path("security") {
            Box::new(SecurityToolBackend { tool })
        } else if let Some(updater) = find_in_path("update-ca-certificates") {
            Box::new(AnchorDirBackend {
                name: "ca-certificates",
                updater,
                anchors: PathBuf::from(DEBIAN_ANCHORS),
            })
        } else if let Some(updater) = find_in_path("update-ca-trust") {
            let anchors = CA_TRUST_ANCHOR_DIRS
                .iter()
                .map(PathBuf::from)
                .find(|dir| dir.is_dir())
                .unwrap_or_else(|| PathBuf::from(CA_TRUST_ANCHOR_DIRS[0]));
            Box::new(AnchorDirBackend {
                name: "ca-trust",
                updater,
                anchors,
            })
        } else {
            Box::new(LocalFileBackend {
                anchor: paths.local_trust_anchor(),
            })
        };

        debug!(backend = backend.name(), "trust backend selected");
        TrustInstaller { backend }
    }

    /// Use a specific backend (tests, unusual setups).
    pub fn with_backend(backend: Box<dyn TrustBackend>) -> TrustInstaller {
        TrustInstaller { backend }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Idempotent install of the root certificate.
    pub fn install(&self, root_pem: &str) -> Result<InstallOutcome, TrustError> {
        let identity = CaIdentity::from_pem(root_pem.as_bytes())?;
        self.backend.install(root_pem, &identity)
    }

    /// Remove the root by identity match.
    pub fn uninstall(&self, root_pem: &str) -> Result<UninstallOutcome, TrustError> {
        let identity = CaIdentity::from_pem(root_pem.as_bytes())?;
        self.backend.uninstall(&identity)
    }

    /// Best-effort trust query.
    pub fn status(&self, root_pem: &str) -> TrustStatus {
        match CaIdentity::from_pem(root_pem.as_bytes()) {
            Ok(identity) => self.backend.status(&identity),
            Err(_) => TrustStatus::Unknown,
        }
    }
}

// ---- macOS security tool ------------------------------------------------

struct SecurityToolBackend {
    tool: PathBuf,
}

impl TrustBackend for SecurityToolBackend {
    fn name(&self) -> &'static str {
        "security"
    }

    fn install(&self, root_pem: &str, identity: &CaIdentity) -> Result<InstallOutcome, TrustError> {
        if self.status(identity) == TrustStatus::Installed {
            return Ok(InstallOutcome::AlreadyTrusted);
        }

        let scratch = write_scratch_pem(root_pem)?;

        eprintln!(
            "Adding \"{}\" to the system keychain with Always Trust; \
             administrator privileges are required.",
            identity.common_name
        );

        let mut cmd = Command::new("sudo");
        cmd.arg(&self.tool)
            .args(["add-trusted-cert", "-d", "-r", "trustRoot", "-k", MAC_SYSTEM_KEYCHAIN])
            .arg(scratch.path());
        let output = run_with_timeout(cmd)?;
        if !output.status.success() {
            return Err(classify_failure(&output));
        }

        info!(keychain = MAC_SYSTEM_KEYCHAIN, "root certificate trusted");
        Ok(InstallOutcome::Installed)
    }

    fn uninstall(&self, identity: &CaIdentity) -> Result<UninstallOutcome, TrustError> {
        if self.status(identity) != TrustStatus::Installed {
            return Ok(UninstallOutcome::NotTrusted);
        }

        eprintln!(
            "Removing \"{}\" from the system keychain; administrator \
             privileges are required.",
            identity.common_name
        );

        let mut cmd = Command::new("sudo");
        cmd.arg(&self.tool)
            .args(["delete-certificate", "-c", &identity.common_name, MAC_SYSTEM_KEYCHAIN]);
        let output = run_with_timeout(cmd)?;
        if !output.status.success() {
            return Err(classify_failure(&output));
        }
        Ok(UninstallOutcome::Removed)
    }

    fn status(&self, identity: &CaIdentity) -> TrustStatus {
        let mut cmd = Command::new(&self.tool);
        cmd.args(["find-certificate", "-a", "-c", &identity.common_name, "-p", MAC_SYSTEM_KEYCHAIN]);
        match run_with_timeout(cmd) {
            Ok(output) if output.status.success() => {
                if identity.found_in_bundle(&output.stdout) {
                    TrustStatus::Installed
                } else {
                    TrustStatus::NotInstalled
                }
            }
            // find-certificate exits non-zero when nothing matches.
            Ok(_) => TrustStatus::NotInstalled,
            Err(_) => TrustStatus::Unknown,
        }
    }
}

// ---- Linux anchor-directory stores --------------------------------------

/// Debian-style and Fedora/Arch-style stores share the same shape: copy
/// the PEM into an anchors directory and invoke an updater.
struct AnchorDirBackend {
    name: &'static str,
    updater: PathBuf,
    anchors: PathBuf,
}

impl AnchorDirBackend {
    fn anchor_path(&self) -> PathBuf {
        self.anchors.join(ANCHOR_FILE_NAME)
    }

    /// The anchor carrying our identity, whatever it is named.
    fn find_anchor(&self, identity: &CaIdentity) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.anchors).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("crt") {
                continue;
            }
            if let Ok(bundle) = fs::read(&path) {
                if identity.found_in_bundle(&bundle) {
                    return Some(path);
                }
            }
        }
        None
    }

    fn run_updater(&self) -> Result<(), TrustError> {
        let direct = run_with_timeout(Command::new(&self.updater))?;
        if direct.status.success() {
            return Ok(());
        }
        eprintln!(
            "Running {} requires administrator privileges.",
            self.updater.display()
        );
        let mut cmd = Command::new("sudo");
        cmd.arg(&self.updater);
        let output = run_with_timeout(cmd)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(&output))
        }
    }
}

impl TrustBackend for AnchorDirBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn install(&self, root_pem: &str, identity: &CaIdentity) -> Result<InstallOutcome, TrustError> {
        if self.find_anchor(identity).is_some() {
            return Ok(InstallOutcome::AlreadyTrusted);
        }

        let dest = self.anchor_path();
        match fs::write(&dest, root_pem) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                let scratch = write_scratch_pem(root_pem)?;
                eprintln!(
                    "Copying the root certificate to {} requires administrator privileges.",
                    dest.display()
                );
                let mut cmd = Command::new("sudo");
                cmd.arg("cp").arg(scratch.path()).arg(&dest);
                let output = run_with_timeout(cmd)?;
                if !output.status.success() {
                    return Err(classify_failure(&output));
                }
            }
            Err(e) => return Err(TrustError::Io(e)),
        }

        self.run_updater()?;
        info!(anchor = %dest.display(), "root certificate installed system-wide");
        Ok(InstallOutcome::Installed)
    }

    fn uninstall(&self, identity: &CaIdentity) -> Result<UninstallOutcome, TrustError> {
        let Some(anchor) = self.find_anchor(identity) else {
            return Ok(UninstallOutcome::NotTrusted);
        };

        match fs::remove_file(&anchor) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                eprintln!(
                    "Removing {} requires administrator privileges.",
                    anchor.display()
                );
                let mut cmd = Command::new("sudo");
                cmd.arg("rm").arg(&anchor);
                let output = run_with_timeout(cmd)?;
                if !output.status.success() {
                    return Err(classify_failure(&output));
                }
            }
            Err(e) => return Err(TrustError::Io(e)),
        }

        self.run_updater()?;
        Ok(UninstallOutcome::Removed)
    }

    fn status(&self, identity: &CaIdentity) -> TrustStatus {
        if !self.anchors.is_dir() {
            return TrustStatus::NotInstalled;
        }
        match fs::read_dir(&self.anchors) {
            Ok(_) => match self.find_anchor(identity) {
                Some(_) => TrustStatus::Installed,
                None => TrustStatus::NotInstalled,
            },
            Err(_) => TrustStatus::Unknown,
        }
    }
}

// ---- fallback: local trust file -----------------------------------------

/// No system helper available: record the anchor under the storage root
/// and tell the operator exactly what to do.
pub struct LocalFileBackend {
    pub anchor: PathBuf,
}

impl TrustBackend for LocalFileBackend {
    fn name(&self) -> &'static str {
        "local-file"
    }

    fn install(&self, root_pem: &str, identity: &CaIdentity) -> Result<InstallOutcome, TrustError> {
        if self.status(identity) == TrustStatus::Installed {
            return Ok(InstallOutcome::AlreadyTrusted);
        }

        if let Some(parent) = self.anchor.parent() {
            fs::create_dir_all(parent)?;
        }
        atomic_write(&self.anchor, root_pem.as_bytes(), CERT_MODE)
            .map_err(|e| TrustError::CommandFailed(e.to_string()))?;

        warn!("no system trust helper found; wrote local anchor only");
        print_manual_instructions(&self.anchor);
        Ok(InstallOutcome::Installed)
    }

    fn uninstall(&self, identity: &CaIdentity) -> Result<UninstallOutcome, TrustError> {
        if self.status(identity) != TrustStatus::Installed {
            return Ok(UninstallOutcome::NotTrusted);
        }
        fs::remove_file(&self.anchor)?;
        Ok(UninstallOutcome::Removed)
    }

    fn status(&self, identity: &CaIdentity) -> TrustStatus {
        match fs::read(&self.anchor) {
            Ok(bundle) if identity.found_in_bundle(&bundle) => TrustStatus::Installed,
            Ok(_) => TrustStatus::NotInstalled,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => TrustStatus::NotInstalled,
            Err(_) => TrustStatus::Unknown,
        }
    }
}

/// Precise manual steps for the operator, with the real anchor path.
fn print_manual_instructions(anchor: &Path) {
    let path = anchor.display();
    eprintln!();
    eprintln!("Install the root certificate manually with one of:");
    eprintln!();
    eprintln!("  # Debian/Ubuntu:");
    eprintln!("  sudo cp {path} /usr/local/share/ca-certificates/localtls-root-ca.crt");
    eprintln!("  sudo update-ca-certificates");
    eprintln!();
    eprintln!("  # Fedora/RHEL/Arch:");
    eprintln!("  sudo cp {path} /etc/pki/ca-trust/source/anchors/localtls-root-ca.crt");
    eprintln!("  sudo update-ca-trust");
    eprintln!();
    eprintln!("  # Firefox/Chromium (NSS user database):");
    eprintln!("  certutil -d sql:$HOME/.pki/nssdb -A -t \"C,,\" -n \"localtls root\" -i {path}");
    eprintln!();
}

// ---- helpers -------------------------------------------------------------

/// Look a binary up on PATH; the existence of the helper is what decides
/// backend capability.
fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Drop PEM bytes at a scratch path that outlives the helper invocation.
fn write_scratch_pem(root_pem: &str) -> Result<tempfile::NamedTempFile, TrustError> {
    let mut scratch = tempfile::Builder::new()
        .prefix("localtls-root-")
        .suffix(".pem")
        .tempfile()?;
    scratch.write_all(root_pem.as_bytes())?;
    scratch.flush()?;
    Ok(scratch)
}

/// Run a helper with the 10-second budget; kill and report on expiry.
fn run_with_timeout(cmd: Command) -> Result<Output, TrustError> {
    run_bounded(cmd, HELPER_TIMEOUT)
}

fn run_bounded(mut cmd: Command, budget: Duration) -> Result<Output, TrustError> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TrustError::BackendUnavailable(format!("{program} not found"))
            } else {
                TrustError::Io(e)
            }
        })?;

    let deadline = Instant::now() + budget;
    loop {
        match child.try_wait()? {
            Some(_) => {
                return Ok(child.wait_with_output()?);
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(TrustError::Timeout(HELPER_TIMEOUT.as_secs()));
            }
            None => std::thread::sleep(Duration::from_millis(50)),
        }
    }
}

/// Sort a failed helper run into escalation-denied vs. plain failure.
fn classify_failure(output: &Output) -> TrustError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("password is required")
        || lowered.contains("not in the sudoers")
        || lowered.contains("permission denied")
        || lowered.contains("authorization denied")
        || lowered.contains("a terminal is required")
    {
        TrustError::EscalationDenied(stderr.trim().to_string())
    } else {
        TrustError::CommandFailed(stderr.trim().to_string())
    }
}

/// Split a PEM bundle into DER blobs, tolerating leading whitespace.
fn parse_pem_bundle(bundle: &[u8]) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = bundle;
    loop {
        while rest.first().is_some_and(|b| b.is_ascii_whitespace()) {
            rest = &rest[1..];
        }
        if rest.is_empty() {
            break;
        }
        match x509_parser::pem::parse_x509_pem(rest) {
            Ok((next, pem)) => {
                out.push(pem.contents);
                if next.len() >= rest.len() {
                    break;
                }
                rest = next;
            }
            Err(_) => break,
        }
    }
    out
}
