//! localtls entry point: the `tls` verb group.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use localtls::store::StorePaths;

mod cli;

/// localtls: a local development certificate authority
#[derive(Parser, Debug)]
#[command(name = "localtls")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Certificate authority operations
    Tls {
        #[command(subcommand)]
        action: TlsCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
enum TlsCommand {
    /// Create the root and intermediate CA
    Init {
        /// Authority name recorded in certificate subjects
        #[arg(long)]
        name: Option<String>,
        /// Allow re-initialization of a populated store
        #[arg(long)]
        force: bool,
        /// Rotate the root (invalidates every issued certificate)
        #[arg(long)]
        rotate_root: bool,
    },
    /// Install the root certificate into the OS trust store
    Trust,
    /// Remove the root certificate from the OS trust store
    Untrust,
    /// Return a valid certificate for a name, issuing or renewing as needed
    Ensure {
        /// DNS name or wildcard pattern (e.g. myapp.localhost, *.app.localhost)
        name: String,
    },
    /// Look up a cached certificate without issuing
    Get {
        /// DNS name or wildcard pattern
        name: String,
    },
    /// List live certificates
    List,
    /// Revoke a certificate by serial
    Revoke {
        /// Serial number (hex) as shown by list
        serial: String,
    },
    /// Print a reverse-proxy snippet for a name
    Export {
        /// Target proxy
        #[arg(value_enum)]
        format: cli::ExportFormat,
        /// DNS name or wildcard pattern
        name: String,
    },
}

fn main() {
    // Quiet by default for command runs; RUST_LOG overrides.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let result = run(&args);

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

fn run(args: &Args) -> localtls::error::Result<()> {
    let paths = StorePaths::from_env()?;

    let Command::Tls { action } = &args.command;
    match action {
        TlsCommand::Init {
            name,
            force,
            rotate_root,
        } => cli::run_init(&paths, name.clone(), *force, *rotate_root, args.json),
        TlsCommand::Trust => cli::run_trust(&paths, args.json),
        TlsCommand::Untrust => cli::run_untrust(&paths, args.json),
        TlsCommand::Ensure { name } => cli::run_ensure(&paths, name, args.json),
        TlsCommand::Get { name } => cli::run_get(&paths, name, args.json),
        TlsCommand::List => cli::run_list(&paths, args.json),
        TlsCommand::Revoke { serial } => cli::run_revoke(&paths, serial, args.json),
        TlsCommand::Export { format, name } => cli::run_export(&paths, *format, name),
    }
}
