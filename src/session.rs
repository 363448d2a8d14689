use std::{fmt, io, sync::Arc};

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::endpoint::Side;
use crate::inspect::InspectorChain;
use crate::relay::{Relay, Watermarks};

pub const DEFAULT_READ_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on unread input thrown away when a socket is released.
const MAX_DISCARD_ON_RELEASE: usize = 1024 * 1024;

/// Opaque session identity, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Hands out session ids in increasing order, starting at 1.
#[derive(Debug)]
pub struct SessionIds {
    next: u64,
}

impl Default for SessionIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SessionIds {
    pub fn next_id(&mut self) -> SessionId {
        let id = SessionId(self.next);
        self.next += 1;
        id
    }
}

/// Shared, immutable settings every session is built from.
pub struct RelayContext {
    pub watermarks: Watermarks,
    pub read_chunk_size: usize,
    pub inspectors: Arc<InspectorChain>,
}

impl RelayContext {
    #[must_use]
    pub fn new(inspectors: InspectorChain) -> Self {
        Self {
            watermarks: Watermarks::default(),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            inspectors: Arc::new(inspectors),
        }
    }
}

enum Ready {
    Read(io::Result<()>),
    Write(io::Result<()>),
}

async fn readable(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(stream) => stream.readable().await,
        None => std::future::pending().await,
    }
}

async fn writable(stream: Option<&TcpStream>) -> io::Result<()> {
    match stream {
        Some(stream) => stream.writable().await,
        None => std::future::pending().await,
    }
}

/// Reads whatever is already buffered on `stream`, up to `limit` bytes,
/// without waiting.
fn read_remaining(stream: &TcpStream, limit: usize) -> Vec<u8> {
    let mut trailing = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        match stream.try_read(&mut trailing[filled..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    trailing.truncate(filled);
    trailing
}

/// Closes a socket whose endpoint is done. Unread input is discarded first
/// and FIN is sent before the descriptor goes away: closing with unread input
/// resets the connection, and a reset can destroy bytes the peer has not read
/// yet. Input arriving after the discard still triggers a reset.
async fn release(mut stream: TcpStream, side: Side) {
    let mut scratch = [0u8; 4096];
    let mut discarded = 0;
    while discarded < MAX_DISCARD_ON_RELEASE {
        match stream.try_read(&mut scratch) {
            Ok(0) | Err(_) => break,
            Ok(n) => discarded += n,
        }
    }
    if let Err(e) = stream.shutdown().await {
        debug!(%side, error = %e, "Shutdown before release failed");
    }
    debug!(%side, discarded, "Released socket");
}

/// A proxied connection: the client socket, the upstream socket and the
/// relay engine that moves bytes between them.
pub struct Session {
    relay: Relay,
    client: Option<TcpStream>,
    server: Option<TcpStream>,
    read_chunk_size: usize,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, client: TcpStream, server: TcpStream, ctx: &RelayContext) -> Self {
        Self {
            relay: Relay::new(id, ctx.watermarks, Arc::clone(&ctx.inspectors)),
            client: Some(client),
            server: Some(server),
            read_chunk_size: ctx.read_chunk_size.max(1),
        }
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.relay.session()
    }

    fn stream(&self, side: Side) -> Option<&TcpStream> {
        match side {
            Side::Client => self.client.as_ref(),
            Side::Server => self.server.as_ref(),
        }
    }

    /// Drives the session until both endpoints are closed.
    #[tracing::instrument(skip(self), fields(session = %self.id()))]
    pub async fn run(mut self) {
        info!("Session started");
        let mut buffer = vec![0u8; self.read_chunk_size];

        while !self.relay.is_finished() {
            let read_client = self.relay.wants_read(Side::Client);
            let read_server = self.relay.wants_read(Side::Server);
            let write_client = self.relay.wants_write(Side::Client);
            let write_server = self.relay.wants_write(Side::Server);

            let (side, ready) = tokio::select! {
                r = readable(self.client.as_ref()), if read_client => (Side::Client, Ready::Read(r)),
                r = readable(self.server.as_ref()), if read_server => (Side::Server, Ready::Read(r)),
                r = writable(self.client.as_ref()), if write_client => (Side::Client, Ready::Write(r)),
                r = writable(self.server.as_ref()), if write_server => (Side::Server, Ready::Write(r)),
                else => {
                    warn!("No pending interest on an unfinished session, closing");
                    break;
                }
            };

            match ready {
                Ready::Read(Ok(())) => self.on_read_ready(side, &mut buffer),
                Ready::Write(Ok(())) => self.on_write_ready(side),
                Ready::Read(Err(e)) | Ready::Write(Err(e)) => self.fail(side, &e),
            }
            self.release_closed().await;
        }

        info!(packets = self.relay.packet_counter(), "Session closed");
    }

    fn on_read_ready(&mut self, side: Side, buffer: &mut [u8]) {
        let Some(stream) = self.stream(side) else {
            return;
        };
        match stream.try_read(buffer) {
            Ok(0) => {
                debug!(%side, "Peer closed connection");
                self.relay.on_closed(side, &[]);
            }
            Ok(n) => self.relay.on_readable(side, &buffer[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.fail(side, &e),
        }
    }

    fn on_write_ready(&mut self, side: Side) {
        let Some(stream) = self.stream(side) else {
            return;
        };
        match stream.try_write(self.relay.pending_output(side)) {
            Ok(n) => self.relay.on_written(side, n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.fail(side, &e),
        }
    }

    /// Routes a socket error into the close path after salvaging any input
    /// that was already buffered on that socket.
    fn fail(&mut self, side: Side, error: &io::Error) {
        match error.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                debug!(%side, error = %error, "Connection dropped");
            }
            _ => warn!(%side, error = %error, "Connection error"),
        }
        let trailing = self
            .stream(side)
            .map(|stream| read_remaining(stream, self.read_chunk_size))
            .unwrap_or_default();
        self.relay.on_closed(side, &trailing);
    }

    async fn release_closed(&mut self) {
        let client_closed = self.relay.is_closed(Side::Client);
        if let Some(stream) = self.client.take_if(|_| client_closed) {
            release(stream, Side::Client).await;
        }
        let server_closed = self.relay.is_closed(Side::Server);
        if let Some(stream) = self.server.take_if(|_| server_closed) {
            release(stream, Side::Server).await;
        }
    }
}
