//! Output formatting for CLI commands.
//!
//! Human-readable text by default; `--json` prints the full record.

use localtls::issuer::Certificate;
use localtls::trust::{InstallOutcome, UninstallOutcome};

/// The reverse-proxy contract: exactly two lines, parseable by scripts.
pub fn print_cert_paths(cert: &Certificate, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(cert).unwrap());
    } else {
        println!("CERT={}", cert.cert_path.display());
        println!("KEY={}", cert.key_path.display());
    }
}

pub fn print_cert_details(cert: &Certificate, json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(cert).unwrap());
    } else {
        println!("Serial:    {}", cert.serial);
        println!("Subject:   {}", cert.subject);
        let mut sans = cert.dns_names.clone();
        sans.extend(cert.ip_sans.iter().cloned());
        println!("SANs:      {}", sans.join(", "));
        println!("Not after: {}", cert.not_after);
        println!("Cert:      {}", cert.cert_path.display());
        println!("Key:       {}", cert.key_path.display());
    }
}

pub fn print_cert_list(certs: &[Certificate], json: bool) {
    if json {
        println!("{}", serde_json::to_string_pretty(certs).unwrap());
        return;
    }
    if certs.is_empty() {
        println!("No live certificates.");
        return;
    }
    for cert in certs {
        let mut sans = cert.dns_names.clone();
        sans.extend(cert.ip_sans.iter().cloned());
        println!(
            "{}  {}  expires {}",
            cert.serial,
            sans.join(","),
            cert.not_after
        );
    }
}

pub fn print_install_outcome(outcome: InstallOutcome, backend: &str, json: bool) {
    if json {
        let status = match outcome {
            InstallOutcome::Installed => "installed",
            InstallOutcome::AlreadyTrusted => "already-trusted",
        };
        println!("{}", serde_json::json!({ "status": status, "backend": backend }));
        return;
    }
    match outcome {
        InstallOutcome::Installed => {
            println!("Root certificate installed ({backend}).");
        }
        InstallOutcome::AlreadyTrusted => {
            println!("Root certificate is already trusted ({backend}).");
        }
    }
}

pub fn print_uninstall_outcome(outcome: UninstallOutcome, backend: &str, json: bool) {
    if json {
        let status = match outcome {
            UninstallOutcome::Removed => "removed",
            UninstallOutcome::NotTrusted => "not-trusted",
        };
        println!("{}", serde_json::json!({ "status": status, "backend": backend }));
        return;
    }
    match outcome {
        UninstallOutcome::Removed => {
            println!("Root certificate removed ({backend}).");
        }
        UninstallOutcome::NotTrusted => {
            println!("Root certificate was not present ({backend}).");
        }
    }
}
