use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::session::{RelayContext, Session, SessionId, SessionIds};

/// Accepts client connections and pairs each with a fresh connection to the
/// fixed upstream address.
pub struct Acceptor {
    listener: TcpListener,
    upstream: SocketAddr,
    ctx: Arc<RelayContext>,
    ids: SessionIds,
}

impl Acceptor {
    /// Binds the listening socket. Failure here is a startup error.
    pub async fn bind(listen: SocketAddr, upstream: SocketAddr, ctx: RelayContext) -> Result<Self> {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("Failed to bind to address {listen}"))?;
        Ok(Self::from_listener(listener, upstream, ctx))
    }

    #[must_use]
    pub fn from_listener(listener: TcpListener, upstream: SocketAddr, ctx: RelayContext) -> Self {
        Self {
            listener,
            upstream,
            ctx: Arc::new(ctx),
            ids: SessionIds::default(),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to get listener local address")
    }

    /// Runs the accept loop forever. Per-connection failures never end it.
    pub async fn serve(mut self) -> Result<()> {
        info!(
            listen_addr = %self.local_addr()?,
            upstream_addr = %self.upstream,
            "Relay listening"
        );

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let id = self.ids.next_id();
            debug!(session = %id, client_addr = %peer, "Accepted connection");

            let upstream = self.upstream;
            let ctx = Arc::clone(&self.ctx);
            tokio::spawn(async move {
                if let Some(session) = open_session(id, stream, peer, upstream, &ctx).await {
                    session.run().await;
                }
            });
        }
    }
}

/// Connects to `upstream` on behalf of `client`. On failure the client socket
/// is dropped and no session is created.
async fn open_session(
    id: SessionId,
    client: TcpStream,
    peer: SocketAddr,
    upstream: SocketAddr,
    ctx: &RelayContext,
) -> Option<Session> {
    match TcpStream::connect(upstream).await {
        Ok(server) => {
            info!(session = %id, client_addr = %peer, upstream_addr = %upstream, "Connected to upstream");
            Some(Session::new(id, client, server, ctx))
        }
        Err(e) => {
            error!(session = %id, client_addr = %peer, upstream_addr = %upstream, error = %e, "Failed to connect to upstream");
            None
        }
    }
}
