//! Per-chunk inspection hooks: packet logging and pattern filtering.

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    sync::{Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use tracing::warn;

use crate::endpoint::Direction;
use crate::filter::FilterChain;
use crate::session::SessionId;

/// A read-only view of one relayed chunk, handed to inspectors before the
/// bytes are queued for the partner.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub session: SessionId,
    pub counter: u64,
    pub direction: Direction,
    pub payload: &'a [u8],
}

/// Observes chunks as they cross the relay. Inspectors cannot alter or block
/// traffic and must not fail the session.
pub trait Inspector: Send + Sync {
    fn inspect(&self, packet: &Packet<'_>);
}

/// Inspectors run in insertion order for every chunk.
#[derive(Default)]
pub struct InspectorChain {
    inspectors: Vec<Box<dyn Inspector>>,
}

impl InspectorChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, inspector: impl Inspector + 'static) -> Self {
        self.inspectors.push(Box::new(inspector));
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inspectors.is_empty()
    }

    pub fn inspect(&self, packet: &Packet<'_>) {
        for inspector in &self.inspectors {
            inspector.inspect(packet);
        }
    }
}

fn lock<W>(sink: &Mutex<W>) -> MutexGuard<'_, W> {
    sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Appends one record per chunk to a sink and flushes after each record.
///
/// Payloads are written at their full length; embedded NUL bytes are data.
pub struct PacketLogger<W> {
    sink: Mutex<W>,
}

impl PacketLogger<BufWriter<File>> {
    /// Creates (or truncates) the log file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> PacketLogger<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Writes one record in the on-disk format.
    fn write_record(sink: &mut W, packet: &Packet<'_>) -> io::Result<()> {
        write!(
            sink,
            "\nSession: {}\nPacket: {}\nPacket type: {}\nData: ",
            packet.session, packet.counter, packet.direction
        )?;
        sink.write_all(packet.payload)?;
        sink.flush()
    }

    pub fn into_inner(self) -> W {
        self.sink
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<W: Write + Send> Inspector for PacketLogger<W> {
    fn inspect(&self, packet: &Packet<'_>) {
        let mut sink = lock(&self.sink);
        if let Err(e) = Self::write_record(&mut *sink, packet) {
            warn!(session = %packet.session, packet = packet.counter, error = %e, "Failed to write packet log record");
        }
    }
}

/// How matches are rendered by [`PatternFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchFormat {
    /// Only the matched bytes, one match per line.
    Raw,
    /// Pattern source and offset alongside the matched bytes.
    Verbose,
}

impl Default for MatchFormat {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Verbose
        } else {
            Self::Raw
        }
    }
}

/// Emits every filter-chain match found in a chunk to a sink.
pub struct PatternFilter<W> {
    chain: FilterChain,
    format: MatchFormat,
    sink: Mutex<W>,
}

impl<W: Write> PatternFilter<W> {
    pub fn new(chain: FilterChain, sink: W) -> Self {
        Self {
            chain,
            format: MatchFormat::default(),
            sink: Mutex::new(sink),
        }
    }

    #[must_use]
    pub fn format(mut self, format: MatchFormat) -> Self {
        self.format = format;
        self
    }

    pub fn into_inner(self) -> W {
        self.sink
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn emit(&self, packet: &Packet<'_>, sink: &mut W) -> io::Result<()> {
        for scan in self.chain.scan(packet.payload) {
            for m in &scan.matches {
                match self.format {
                    MatchFormat::Raw => {}
                    MatchFormat::Verbose => write!(
                        sink,
                        "pattern={} offset={} match=",
                        scan.pattern.source(),
                        m.start
                    )?,
                }
                sink.write_all(m.bytes)?;
                sink.write_all(b"\n")?;
            }
            if scan.truncated {
                warn!(
                    session = %packet.session,
                    packet = packet.counter,
                    pattern = scan.pattern.source(),
                    limit = crate::filter::MAX_MATCHES_PER_SCAN,
                    "Match limit reached, remaining matches in chunk not reported"
                );
            }
        }
        sink.flush()
    }
}

impl<W: Write + Send> Inspector for PatternFilter<W> {
    fn inspect(&self, packet: &Packet<'_>) {
        let mut sink = lock(&self.sink);
        if let Err(e) = self.emit(packet, &mut *sink) {
            warn!(session = %packet.session, error = %e, "Failed to write filter match");
        }
    }
}
