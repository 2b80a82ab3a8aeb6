//! oath-sockd - HOTP bind/compare validation listener
//!
//! Attaches to a directory server's slapd-sock delegation socket and
//! validates combined password+OTP credentials against directory-stored
//! token state.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use oath_sockd::{
    cli::Cli,
    config::Config,
    directory::ldap::LdapDirectory,
    keyring::Decryptor,
    setup_tracing,
    sock::Listener,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Load configuration with CLI overrides
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(ref path) = cli.socket_path {
                config.listener.socket_path = path.clone();
            }
            if let Some(workers) = cli.workers {
                config.listener.workers = workers;
            }
            if cli.verbose_responses {
                config.response.verbose = true;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Load the decryption keyring once; it is immutable afterwards.
    let decryptor = match Decryptor::from_config(&config.keyring) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to load decryption keyring: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.listener.socket_path,
        workers = config.listener.workers,
        keys = decryptor.key_count(),
        verbose = config.response.verbose,
        "Starting oath-sockd"
    );

    let directory = Arc::new(LdapDirectory::new(config.directory.clone()));

    let listener = match Listener::new(config, directory, decryptor) {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to create listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = listener.run().await {
        error!("Listener error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
