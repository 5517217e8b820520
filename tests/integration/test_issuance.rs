//! End-to-end issuance flow over a temporary storage root.

use std::sync::Arc;

use localtls::{
    AuthorityConfig, Ca, Certificate, IssueRequest, Issuer, LocalTlsError, PolicyError,
    StorePaths,
};
use tempfile::TempDir;
use time::OffsetDateTime;

struct Store {
    paths: StorePaths,
    config: AuthorityConfig,
    _dir: TempDir,
}

fn init_store() -> Store {
    let dir = TempDir::new().unwrap();
    let paths = StorePaths::new(dir.path());
    let config = AuthorityConfig::default();
    Ca::init(&paths, &config, false, false).unwrap();
    config.save(&paths).unwrap();
    Store {
        paths,
        config,
        _dir: dir,
    }
}

fn open_issuer(store: &Store) -> Issuer {
    let ca = Arc::new(Ca::open(&store.paths, &store.config).unwrap());
    Issuer::open(ca, store.paths.clone(), &store.config).unwrap()
}

fn assert_contract_paths(store: &Store, cert: &Certificate, stem: &str) {
    assert_eq!(
        cert.cert_path,
        store.paths.certs_dir().join(format!("{stem}.pem"))
    );
    assert_eq!(
        cert.key_path,
        store.paths.certs_dir().join(format!("{stem}.key"))
    );
    assert!(cert.cert_path.exists());
    assert!(cert.key_path.exists());
}

#[test]
fn ensure_issues_and_persists_across_reopen() {
    let store = init_store();

    let serial = {
        let issuer = open_issuer(&store);
        let cert = issuer.ensure("myapp.localhost").unwrap();
        assert_contract_paths(&store, &cert, "myapp.localhost");

        let lifetime = cert.not_after - cert.not_before;
        assert!((lifetime - time::Duration::hours(24)).abs() < time::Duration::minutes(1));
        cert.serial
    };

    // A new process over the same root serves the same certificate.
    let issuer = open_issuer(&store);
    assert_eq!(issuer.ensure("myapp.localhost").unwrap().serial, serial);
    assert_eq!(issuer.get("myapp.localhost").unwrap().serial, serial);
}

#[test]
fn wildcard_names_sign_the_apex_too() {
    let store = init_store();
    let issuer = open_issuer(&store);

    let cert = issuer.ensure("*.app.localhost").unwrap();
    assert_eq!(cert.dns_names, vec!["*.app.localhost", "app.localhost"]);
    assert_contract_paths(&store, &cert, "_wildcard.app.localhost");
}

#[test]
fn policy_violations_leave_no_trace() {
    let store = init_store();
    let issuer = open_issuer(&store);

    let err = issuer.ensure("*.localhost").unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(matches!(
        err,
        LocalTlsError::PolicyViolation {
            reason: PolicyError::WildcardTooShallow,
            ..
        }
    ));

    let err = issuer.ensure("evil.com").unwrap_err();
    assert!(matches!(
        err,
        LocalTlsError::PolicyViolation {
            reason: PolicyError::TldNotAllowed,
            ..
        }
    ));

    assert!(std::fs::read_dir(store.paths.certs_dir())
        .unwrap()
        .next()
        .is_none());
}

#[test]
fn revoked_serial_disappears_from_listing() {
    let store = init_store();
    let issuer = open_issuer(&store);

    let keep = issuer.ensure("keep.localhost").unwrap();
    let drop = issuer.ensure("drop.localhost").unwrap();

    issuer.revoke(&drop.serial).unwrap();
    let listed = issuer.list().unwrap();
    let serials: Vec<&str> = listed.iter().map(|c| c.serial.as_str()).collect();
    assert_eq!(serials, vec![keep.serial.as_str()]);

    assert!(matches!(
        issuer.revoke("0000000000000000"),
        Err(LocalTlsError::NotFound(_))
    ));
    assert_eq!(
        issuer.revoke("0000000000000000").unwrap_err().exit_code(),
        3
    );

    // Revocation survives a reopen.
    let issuer = open_issuer(&store);
    assert!(matches!(
        issuer.get("drop.localhost"),
        Err(LocalTlsError::NotFound(_))
    ));
}

#[test]
fn multi_san_requests_are_deduplicated() {
    let store = init_store();
    let issuer = open_issuer(&store);

    let cert = issuer
        .issue(IssueRequest {
            dns_names: vec![
                "API.svc.localhost".into(),
                "api.svc.localhost".into(),
                "web.svc.localhost".into(),
            ],
            ips: vec!["127.0.0.1".parse().unwrap()],
            validity: None,
        })
        .unwrap();

    assert_eq!(cert.dns_names, vec!["api.svc.localhost", "web.svc.localhost"]);
    assert_eq!(cert.ip_sans, vec!["127.0.0.1"]);
    assert!(cert.not_after > OffsetDateTime::now_utc());
}

#[test]
fn concurrent_ensure_yields_one_record() {
    let store = init_store();
    let issuer = open_issuer(&store);

    let serials: Vec<String> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| scope.spawn(|| issuer.ensure("racy.localhost").unwrap().serial))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(serials.windows(2).all(|pair| pair[0] == pair[1]));

    let inventory = localtls::Inventory::load(&store.paths.index()).unwrap();
    assert_eq!(inventory.records.len(), 1);
}

#[test]
fn init_refuses_to_clobber_existing_authority() {
    let store = init_store();
    assert!(matches!(
        Ca::init(&store.paths, &store.config, false, false),
        Err(LocalTlsError::AlreadyInitialized)
    ));
    assert!(matches!(
        Ca::init(&store.paths, &store.config, true, false),
        Err(LocalTlsError::AlreadyInitialized)
    ));
}
