//! Unix-domain socket listener
//!
//! Owns the socket lifecycle (stale file cleanup, permissions, unlink on
//! shutdown), gates connections on peer credentials, and runs one
//! sequential request loop per connection; the protocol framing forbids
//! pipelining, so a connection never has more than one request in flight.
//! A semaphore bounds how many requests are handled concurrently across
//! all connections.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::protocol::Request;
use crate::config::Config;
use crate::directory::Directory;
use crate::keyring::Decryptor;
use crate::validate::Validator;
use crate::{Error, Result};

/// Shared per-connection context.
struct ConnContext {
    validator: Arc<Validator>,
    workers: Arc<Semaphore>,
    read_timeout: Duration,
    write_timeout: Duration,
    compare_attr: String,
    verbose: bool,
}

/// The slapd-sock protocol listener.
pub struct Listener {
    config: Config,
    validator: Arc<Validator>,
}

impl Listener {
    /// Create a listener; the socket is bound by [`run`](Self::run).
    pub fn new(
        config: Config,
        directory: Arc<dyn Directory>,
        decryptor: Decryptor,
    ) -> Result<Self> {
        let validator = Arc::new(Validator::new(
            directory,
            config.schema.clone(),
            config.policy_cache.clone(),
            decryptor,
        ));
        Ok(Self { config, validator })
    }

    /// The validator, for inspection in tests and tooling.
    #[must_use]
    pub fn validator(&self) -> Arc<Validator> {
        Arc::clone(&self.validator)
    }

    /// Bind the socket and serve until SIGINT/SIGTERM.
    pub async fn run(self) -> Result<()> {
        let path = self.config.listener.socket_path.clone();

        // A previous instance may have left its socket file behind.
        if Path::new(&path).exists() {
            fs::remove_file(&path)?;
            debug!(path = %path, "Removed stale socket file");
        }
        if let Some(parent) = Path::new(&path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| Error::Config(format!("Cannot bind {path}: {e}")))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o660))?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let context = Arc::new(ConnContext {
            validator: Arc::clone(&self.validator),
            workers: Arc::new(Semaphore::new(self.config.listener.workers)),
            read_timeout: self.config.listener.read_timeout,
            write_timeout: self.config.listener.write_timeout,
            compare_attr: self.config.schema.compare_attr.clone(),
            verbose: self.config.response.verbose,
        });

        info!(
            socket = %path,
            workers = self.config.listener.workers,
            "Listening for delegated operations"
        );
        if self.config.listener.allowed_uids.is_empty()
            && self.config.listener.allowed_gids.is_empty()
        {
            warn!("No peer UID/GID restrictions configured - any local user may connect");
        }

        let mut shutdown_rx = shutdown_tx.subscribe();
        let shutdown = shutdown_signal(shutdown_tx.clone());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            if !self.peer_allowed(&stream) {
                                continue;
                            }
                            let context = Arc::clone(&context);
                            let shutdown_rx = shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                handle_connection(stream, context, shutdown_rx).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "Accept failed"),
                    }
                }
                () = &mut shutdown => break,
                _ = shutdown_rx.recv() => break,
            }
        }

        let stats = self.validator.stats();
        info!(
            attempts = stats.attempts,
            successes = stats.successes,
            rejections = stats.rejections,
            engine_invocations = stats.engine_invocations,
            drift_high_water = stats.drift_high_water,
            "Listener stopping"
        );

        if let Err(e) = fs::remove_file(&path) {
            debug!(path = %path, error = %e, "Socket unlink failed");
        }
        Ok(())
    }

    /// Check `SO_PEERCRED` against the configured allow lists. Empty lists
    /// admit everyone; otherwise a matching UID or GID admits the peer.
    fn peer_allowed(&self, stream: &UnixStream) -> bool {
        let listener = &self.config.listener;
        if listener.allowed_uids.is_empty() && listener.allowed_gids.is_empty() {
            return true;
        }
        match stream.peer_cred() {
            Ok(cred) => {
                let allowed = listener.allowed_uids.contains(&cred.uid())
                    || listener.allowed_gids.contains(&cred.gid());
                if !allowed {
                    warn!(uid = cred.uid(), gid = cred.gid(), "Rejected peer");
                }
                allowed
            }
            Err(e) => {
                warn!(error = %e, "Cannot read peer credentials, rejecting");
                false
            }
        }
    }
}

/// Sequential request loop for one accepted connection.
async fn handle_connection(
    stream: UnixStream,
    context: Arc<ConnContext>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            read = timeout(context.read_timeout, reader.read_line(&mut line)) => read,
            _ = shutdown_rx.recv() => break,
        };

        match read {
            Ok(Ok(0)) => break, // peer closed
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Read failed, closing connection");
                break;
            }
            Err(_) => {
                debug!("Connection idle past read timeout, closing");
                break;
            }
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let request = match Request::parse(trimmed) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "Malformed request, closing connection");
                break;
            }
        };

        // Bounded worker pool: block here until a slot frees up. The
        // semaphore is never closed, so acquire cannot fail.
        let Ok(_permit) = context.workers.acquire().await else {
            break;
        };
        let response = super::dispatch(
            &context.validator,
            &context.compare_attr,
            context.verbose,
            request,
        )
        .await;

        let mut payload = response.serialize();
        payload.push('\n');
        let written = timeout(context.write_timeout, async {
            write_half.write_all(payload.as_bytes()).await?;
            write_half.flush().await
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(error = %e, "Write failed, closing connection");
                break;
            }
            Err(_) => {
                debug!("Write timed out, closing connection");
                break;
            }
        }
    }
}

/// Resolve on SIGINT or SIGTERM and fan the shutdown out.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
