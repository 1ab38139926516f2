//! TCP accept loop.

use crate::facade::ScooterService;
use crate::session::Session;
use crate::telemetry::increment_protocol_errors;
use crate::{Error, Result};
use scoot_core::{Registry, TaggedConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// Back-off after a failed `accept`, e.g. when the process is out of file
/// descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    service: Arc<ScooterService>,
    registry: Arc<Registry>,
    shutdown: CancellationToken,
}

/// Stops a running [`Server`] from another task.
#[derive(Clone, Debug)]
pub struct ServerHandle {
    shutdown: CancellationToken,
}

impl ServerHandle {
    /// Stops accepting connections. Sessions already running are unaffected.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Server {
    pub async fn bind(
        addr: &str,
        service: Arc<ScooterService>,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Bind {
            addr: addr.to_owned(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            listener,
            service,
            registry,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accepts connections until [`ServerHandle::stop`] is called, running
    /// each one as its own [`Session`] task.
    pub async fn serve(self) -> Result<()> {
        if let Ok(addr) = self.local_addr() {
            tracing::info!(%addr, "accepting connections");
        }
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => self.spawn_session(stream, peer),
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
        tracing::info!("stopped accepting connections");
        Ok(())
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        tracing::info!(%peer, "client connected");
        let connection = TaggedConnection::new(stream, Arc::clone(&self.registry));
        let session = Session::new(Arc::clone(&self.service), connection, peer);
        tokio::spawn(async move {
            match session.run().await {
                Ok(()) => tracing::info!(%peer, "client disconnected"),
                Err(e) => {
                    increment_protocol_errors();
                    tracing::warn!(%peer, error = %e, "connection dropped");
                }
            }
        });
    }
}
