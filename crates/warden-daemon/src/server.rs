//! Accept loop and connection limits.
//!
//! The server binds one TCP listener and drives every accepted
//! connection as an independent session task. A semaphore caps
//! concurrent sessions; the permit travels with the task and frees
//! itself when the session ends.
//!
//! All shared state handed to sessions is immutable: the keyring and
//! policy are read-only snapshots behind reference counts, so sessions
//! never contend on locks.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use warden_core::policy::Policy;
use warden_core::secure::Keyring;

use crate::executor::CommandExecutor;
use crate::session::{Session, SessionShared};

/// Default listening port.
pub const DEFAULT_PORT: u16 = 4373;

/// Default cap on concurrent sessions.
const MAX_CONNECTIONS: usize = 100;

/// Default per-connection idle timeout.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen: SocketAddr,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Idle timeout applied to every session read.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

impl ServerConfig {
    /// Creates a config listening on the given address.
    #[must_use]
    pub fn new(listen: SocketAddr) -> Self {
        Self {
            listen,
            ..Default::default()
        }
    }

    /// Sets the concurrent session cap.
    #[must_use]
    pub const fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the idle timeout.
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// The warden server: a bound listener plus shared session state.
pub struct WardenServer {
    listener: TcpListener,
    permits: Arc<Semaphore>,
    shared: Arc<SessionShared>,
}

impl WardenServer {
    /// Binds the listener and prepares shared session state.
    ///
    /// # Errors
    ///
    /// Returns the bind error; the caller turns this into a nonzero
    /// process exit.
    pub async fn bind(
        config: ServerConfig,
        keyring: Keyring,
        policy: Policy,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        info!(listen = %config.listen, rules = policy.rules().len(), "listening");
        Ok(Self {
            listener,
            permits: Arc::new(Semaphore::new(config.max_connections)),
            shared: Arc::new(SessionShared {
                keyring: Arc::new(keyring),
                policy: Arc::new(policy),
                executor: CommandExecutor::new(),
                idle_timeout: config.idle_timeout,
            }),
        })
    }

    /// Returns the bound local address (useful with port 0).
    ///
    /// # Errors
    ///
    /// Returns the underlying socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts and serves connections until the task is cancelled.
    ///
    /// # Errors
    ///
    /// Returns only on a fatal accept-loop failure; per-connection
    /// errors are logged and absorbed.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                // The semaphore is never closed while the server runs.
                Err(_closed) => return Ok(()),
            };
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "accept failed");
                    continue;
                },
            };
            let _ = stream.set_nodelay(true);
            debug!(peer = %peer_addr, "connection accepted");

            let session = Session::new(stream, peer_addr, Arc::clone(&self.shared));
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(error) = session.run().await {
                    debug!(peer = %peer_addr, %error, "session terminated");
                }
            });
        }
    }
}
