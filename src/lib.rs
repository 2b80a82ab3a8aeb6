//! oath-sockd Library
//!
//! HOTP bind/compare validation listener for `slapd-sock` delegation sockets.
//!
//! A directory server delegates `BIND` and `COMPARE` operations to this
//! daemon over a Unix-domain socket. Requests targeting an OTP-capable
//! principal are validated against a combined password+OTP credential:
//! the stored (possibly encrypted) shared secret, a monotonically advancing
//! HOTP counter, and per-token policy limits. Everything else is answered
//! with a `CONTINUE` sentinel so the directory server applies its own
//! default handling.
//!
//! # Guarantees
//!
//! - The token counter only moves forward; concurrent validators racing on
//!   the same token have exactly one winner (assertion-guarded writes).
//! - Rejections are indistinguishable on the wire regardless of which
//!   check failed, unless verbose diagnostics are explicitly enabled.
//! - A request never reports success without the counter advance having
//!   been durably applied first.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod directory;
pub mod error;
pub mod hotp;
pub mod keyring;
pub mod password;
pub mod resolver;
pub mod sock;
pub mod updater;
pub mod validate;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
