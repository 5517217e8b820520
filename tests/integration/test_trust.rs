//! Trust bootstrap flow against the local-file fallback backend.

use localtls::trust::{InstallOutcome, LocalFileBackend, TrustStatus, UninstallOutcome};
use localtls::{AuthorityConfig, Ca, StorePaths, TrustInstaller};
use tempfile::TempDir;

#[test]
fn trust_roundtrip_with_local_backend() {
    let dir = TempDir::new().unwrap();
    let paths = StorePaths::new(dir.path());
    let config = AuthorityConfig::default();
    let ca = Ca::init(&paths, &config, false, false).unwrap();
    let root_pem = ca.root_pem();

    let installer = TrustInstaller::with_backend(Box::new(LocalFileBackend {
        anchor: paths.local_trust_anchor(),
    }));

    assert_eq!(installer.status(&root_pem), TrustStatus::NotInstalled);
    assert_eq!(
        installer.install(&root_pem).unwrap(),
        InstallOutcome::Installed
    );
    assert!(paths.local_trust_anchor().exists());
    assert_eq!(installer.status(&root_pem), TrustStatus::Installed);
    assert_eq!(
        installer.install(&root_pem).unwrap(),
        InstallOutcome::AlreadyTrusted
    );

    assert_eq!(
        installer.uninstall(&root_pem).unwrap(),
        UninstallOutcome::Removed
    );
    assert_eq!(
        installer.uninstall(&root_pem).unwrap(),
        UninstallOutcome::NotTrusted
    );
}

#[test]
fn rotated_root_reads_as_not_installed() {
    let dir = TempDir::new().unwrap();
    let paths = StorePaths::new(dir.path());
    let config = AuthorityConfig::default();
    let ca = Ca::init(&paths, &config, false, false).unwrap();

    let installer = TrustInstaller::with_backend(Box::new(LocalFileBackend {
        anchor: paths.local_trust_anchor(),
    }));
    installer.install(&ca.root_pem()).unwrap();

    // After a root rotation the anchored certificate no longer matches
    // the current identity, so the new root must be installed anew.
    ca.rotate_root().unwrap();
    assert_eq!(installer.status(&ca.root_pem()), TrustStatus::NotInstalled);
    assert_eq!(
        installer.install(&ca.root_pem()).unwrap(),
        InstallOutcome::Installed
    );
}
