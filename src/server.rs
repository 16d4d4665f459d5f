//! TCP accept loop with mutual TLS.
//!
//! Each accepted socket goes through the TLS handshake, has its peer
//! identity extracted from the verified client certificate, and is then
//! handed to the service. The loop runs until the shutdown signal fires,
//! which the service triggers after serving a `Shutdown` request.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::service::JobService;
use crate::tls;
use crate::tracker::Tracker;

/// The jobd network server.
pub struct Server {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<JobService>,
    shutdown: CancellationToken,
}

impl Server {
    /// Binds the listener and wires the service up.
    pub async fn bind(
        addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
        tracker: Arc<Tracker>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "listening");
        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls_config),
            service: Arc::new(JobService::new(tracker, shutdown.clone())),
            shutdown,
        })
    }

    /// Accepts connections until shutdown.
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let acceptor = self.acceptor.clone();
                        let service = Arc::clone(&self.service);
                        tokio::spawn(serve_socket(acceptor, service, socket, peer));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        }
    }
}

async fn serve_socket(
    acceptor: TlsAcceptor,
    service: Arc<JobService>,
    socket: TcpStream,
    peer: SocketAddr,
) {
    let stream = match acceptor.accept(socket).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(%peer, error = %e, "TLS handshake failed");
            return;
        }
    };

    let identity = match tls::peer_identity(stream.get_ref().1) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%peer, error = %e, "rejecting connection");
            return;
        }
    };

    debug!(%peer, user = %identity, "connection authenticated");
    service.serve_connection(stream, identity).await;
}
