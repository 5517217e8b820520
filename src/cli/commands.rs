//! CLI command handlers.
//!
//! Each handler opens the store explicitly from the resolved storage
//! root, runs one core operation and prints its result. Exit-code
//! mapping happens in `main`.

use std::sync::Arc;

use clap::ValueEnum;
use localtls::ca::Ca;
use localtls::config::AuthorityConfig;
use localtls::error::Result;
use localtls::issuer::{Certificate, Issuer};
use localtls::store::StorePaths;
use localtls::trust::TrustInstaller;

use super::output;

/// Reverse-proxy snippet formats for `tls export`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Nginx,
    Caddy,
    Traefik,
}

/// Open the CA and issuer over an initialized store.
fn open_issuer(paths: &StorePaths) -> Result<Issuer> {
    let config = AuthorityConfig::load(paths)?;
    let ca = Arc::new(Ca::open(paths, &config)?);
    Issuer::open(ca, paths.clone(), &config)
}

/// `tls init` — create root and intermediate material.
pub fn run_init(
    paths: &StorePaths,
    name: Option<String>,
    force: bool,
    rotate_root: bool,
    json: bool,
) -> Result<()> {
    let config = match AuthorityConfig::load(paths) {
        Ok(existing) => existing,
        Err(localtls::error::LocalTlsError::NotInitialized) => {
            let mut fresh = AuthorityConfig::default();
            if let Some(name) = name {
                fresh.authority_name = name;
            }
            fresh
        }
        Err(e) => return Err(e),
    };

    let ca = Ca::init(paths, &config, force, rotate_root)?;
    config.save(paths)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "authority": config.authority_name,
                "root": paths.root_cert(),
                "intermediate": paths.intermediate_cert(),
            })
        );
    } else {
        println!("Initialized \"{}\"", ca.authority_name());
        println!("Root:         {}", paths.root_cert().display());
        println!("Intermediate: {}", paths.intermediate_cert().display());
        println!("Run `tls trust` to install the root into your trust store.");
    }
    Ok(())
}

/// `tls trust` — install the root certificate.
pub fn run_trust(paths: &StorePaths, json: bool) -> Result<()> {
    let config = AuthorityConfig::load(paths)?;
    let ca = Ca::open(paths, &config)?;
    let installer = TrustInstaller::detect(paths);
    let outcome = installer.install(&ca.root_pem())?;
    output::print_install_outcome(outcome, installer.backend_name(), json);
    Ok(())
}

/// `tls untrust` — remove the root certificate by identity.
pub fn run_untrust(paths: &StorePaths, json: bool) -> Result<()> {
    let config = AuthorityConfig::load(paths)?;
    let ca = Ca::open(paths, &config)?;
    let installer = TrustInstaller::detect(paths);
    let outcome = installer.uninstall(&ca.root_pem())?;
    output::print_uninstall_outcome(outcome, installer.backend_name(), json);
    Ok(())
}

/// `tls ensure <name>` — cached-or-issued certificate for one name.
pub fn run_ensure(paths: &StorePaths, name: &str, json: bool) -> Result<()> {
    let issuer = open_issuer(paths)?;
    let cert = issuer.ensure(name)?;
    output::print_cert_paths(&cert, json);
    Ok(())
}

/// `tls get <name>` — cached lookup, never issues.
pub fn run_get(paths: &StorePaths, name: &str, json: bool) -> Result<()> {
    let issuer = open_issuer(paths)?;
    let cert = issuer.get(name)?;
    output::print_cert_details(&cert, json);
    Ok(())
}

/// `tls list` — live inventory, soonest expiry first.
pub fn run_list(paths: &StorePaths, json: bool) -> Result<()> {
    let issuer = open_issuer(paths)?;
    let certs = issuer.list()?;
    output::print_cert_list(&certs, json);
    Ok(())
}

/// `tls revoke <serial>` — revoke by serial.
pub fn run_revoke(paths: &StorePaths, serial: &str, json: bool) -> Result<()> {
    let issuer = open_issuer(paths)?;
    issuer.revoke(serial)?;
    if json {
        println!("{}", serde_json::json!({ "revoked": serial }));
    } else {
        println!("Revoked {serial}");
    }
    Ok(())
}

/// `tls export <format> <name>` — reverse-proxy snippet for a name,
/// issuing the certificate first when needed.
pub fn run_export(paths: &StorePaths, format: ExportFormat, name: &str) -> Result<()> {
    let issuer = open_issuer(paths)?;
    let cert = issuer.ensure(name)?;
    print!("{}", render_snippet(format, &cert));
    Ok(())
}

fn render_snippet(format: ExportFormat, cert: &Certificate) -> String {
    let cert_path = cert.cert_path.display();
    let key_path = cert.key_path.display();
    match format {
        ExportFormat::Nginx => format!(
            "server {{\n    listen 443 ssl;\n    server_name {};\n\n    \
             ssl_certificate     {cert_path};\n    \
             ssl_certificate_key {key_path};\n}}\n",
            cert.dns_names.join(" ")
        ),
        ExportFormat::Caddy => format!(
            "{} {{\n    tls {cert_path} {key_path}\n}}\n",
            cert.dns_names.join(", ")
        ),
        ExportFormat::Traefik => format!(
            "tls:\n  certificates:\n    - certFile: {cert_path}\n      keyFile: {key_path}\n"
        ),
    }
}
