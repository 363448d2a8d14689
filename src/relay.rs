//! The per-session relay engine.
//!
//! `Relay` owns both endpoints of a session and decides, for every I/O event,
//! what gets forwarded, when a producer is throttled and when each side is
//! torn down. It performs no I/O itself: the session task feeds it chunks and
//! write completions, and polls sockets only for the interests it reports.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::endpoint::{Direction, Endpoint, EndpointState, Side, Transition};
use crate::inspect::{InspectorChain, Packet};
use crate::session::SessionId;

pub const DEFAULT_HIGH_WATERMARK: usize = 1024 * 1024;

/// Output-queue thresholds. Reaching `high` on one endpoint's queue pauses
/// reads on its partner until the queue is back down to `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    #[must_use]
    pub const fn with_high(high: usize) -> Self {
        Self {
            high,
            low: high / 2,
        }
    }
}

impl Default for Watermarks {
    fn default() -> Self {
        Self::with_high(DEFAULT_HIGH_WATERMARK)
    }
}

pub struct Relay {
    session: SessionId,
    packet_counter: u64,
    watermarks: Watermarks,
    inspectors: Arc<InspectorChain>,
    client: Endpoint,
    server: Endpoint,
}

impl Relay {
    /// Pairs two freshly connected endpoints with reads enabled on both.
    #[must_use]
    pub fn new(
        session: SessionId,
        watermarks: Watermarks,
        inspectors: Arc<InspectorChain>,
    ) -> Self {
        let mut client = Endpoint::new(Side::Client);
        let mut server = Endpoint::new(Side::Server);
        client.apply(Transition::Connect);
        server.apply(Transition::Connect);
        Self {
            session,
            packet_counter: 0,
            watermarks,
            inspectors,
            client,
            server,
        }
    }

    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub const fn packet_counter(&self) -> u64 {
        self.packet_counter
    }

    const fn endpoint(&self, side: Side) -> &Endpoint {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    /// Returns `(side, partner)`.
    const fn pair_mut(&mut self, side: Side) -> (&mut Endpoint, &mut Endpoint) {
        match side {
            Side::Client => (&mut self.client, &mut self.server),
            Side::Server => (&mut self.server, &mut self.client),
        }
    }

    #[must_use]
    pub const fn state(&self, side: Side) -> EndpointState {
        self.endpoint(side).state()
    }

    #[must_use]
    pub fn wants_read(&self, side: Side) -> bool {
        self.endpoint(side).reads_enabled()
    }

    #[must_use]
    pub fn wants_write(&self, side: Side) -> bool {
        let endpoint = self.endpoint(side);
        !endpoint.is_closed() && endpoint.queued() > 0
    }

    /// Bytes queued for delivery to `side`.
    #[must_use]
    pub fn queued(&self, side: Side) -> usize {
        self.endpoint(side).queued()
    }

    /// The next contiguous run of bytes to write to `side`.
    #[must_use]
    pub fn pending_output(&self, side: Side) -> &[u8] {
        self.endpoint(side).pending()
    }

    #[must_use]
    pub fn is_closed(&self, side: Side) -> bool {
        self.endpoint(side).is_closed()
    }

    /// Both endpoints are closed; the session can be dropped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.client.is_closed() && self.server.is_closed()
    }

    /// Read/forward path: `chunk` was read from `side`.
    pub fn on_readable(&mut self, side: Side, chunk: &[u8]) {
        if chunk.is_empty() || self.endpoint(side).is_closed() {
            return;
        }
        if self.endpoint(side.partner()).is_closed() {
            trace!(session = %self.session, %side, bytes = chunk.len(), "Discarding data for closed partner");
            return;
        }

        self.inspectors.inspect(&Packet {
            session: self.session,
            counter: self.packet_counter,
            direction: Direction::from(side),
            payload: chunk,
        });
        self.packet_counter += 1;

        let high = self.watermarks.high;
        let session = self.session;
        let (source, partner) = self.pair_mut(side);
        partner.enqueue(chunk);
        trace!(%session, from = %side, bytes = chunk.len(), queued = partner.queued(), "Forwarded chunk");

        if partner.queued() >= high && source.apply(Transition::PauseRead) {
            partner.set_drain_watch(true);
            debug!(%session, paused = %side, queued = partner.queued(), high, "High watermark reached, pausing reads");
        }
    }

    /// `n` bytes from [`Self::pending_output`] were written to `side`.
    pub fn on_written(&mut self, side: Side, n: usize) {
        let low = self.watermarks.low;
        let session = self.session;
        let (endpoint, partner) = self.pair_mut(side);
        if endpoint.is_closed() {
            return;
        }
        endpoint.consume(n);

        if endpoint.drain_watch() && endpoint.queued() <= low {
            endpoint.set_drain_watch(false);
            if partner.apply(Transition::ResumeRead) {
                debug!(%session, resumed = %partner.side(), queued = endpoint.queued(), low, "Low watermark reached, resuming reads");
            }
        }

        if endpoint.is_draining() && endpoint.queued() == 0 {
            endpoint.apply(Transition::Drained);
            debug!(%session, %side, "Drained pending output, closing");
        }
    }

    /// Close/error path: `side` hit EOF or failed. `trailing` holds any bytes
    /// read alongside the close signal; they are forwarded first.
    pub fn on_closed(&mut self, side: Side, trailing: &[u8]) {
        if self.endpoint(side).is_closed() {
            return;
        }
        self.on_readable(side, trailing);

        let session = self.session;
        let (endpoint, partner) = self.pair_mut(side);
        if !partner.is_closed() {
            if partner.queued() > 0 {
                partner.set_drain_watch(false);
                partner.apply(Transition::Drain);
                debug!(%session, draining = %partner.side(), queued = partner.queued(), "Partner closed, draining");
            } else {
                partner.apply(Transition::Close);
            }
        }
        endpoint.apply(Transition::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{ReadInterest, WriteMode};
    use crate::inspect::Inspector;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<(u64, Direction, Vec<u8>)>>>);

    impl Inspector for Recorder {
        fn inspect(&self, packet: &Packet<'_>) {
            self.0.lock().unwrap().push((
                packet.counter,
                packet.direction,
                packet.payload.to_vec(),
            ));
        }
    }

    fn relay(high: usize) -> Relay {
        Relay::new(
            SessionId::new(1),
            Watermarks::with_high(high),
            Arc::new(InspectorChain::new()),
        )
    }

    fn recording_relay(high: usize) -> (Relay, Recorder) {
        let recorder = Recorder::default();
        let chain = InspectorChain::new().with(recorder.clone());
        let relay = Relay::new(SessionId::new(1), Watermarks::with_high(high), Arc::new(chain));
        (relay, recorder)
    }

    /// Writes everything queued for `side`, up to `limit` bytes per call.
    fn flush(relay: &mut Relay, side: Side, limit: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while relay.wants_write(side) {
            let pending = relay.pending_output(side);
            let n = pending.len().min(limit);
            out.extend_from_slice(&pending[..n]);
            relay.on_written(side, n);
        }
        out
    }

    mod forwarding {
        use super::*;

        #[test]
        fn starts_connected_with_reads_enabled() {
            let relay = relay(1024);
            for side in [Side::Client, Side::Server] {
                assert_eq!(
                    relay.state(side),
                    EndpointState::Connected {
                        read: ReadInterest::Enabled,
                        write: WriteMode::Active,
                    }
                );
                assert!(relay.wants_read(side));
                assert!(!relay.wants_write(side));
            }
        }

        #[test]
        fn preserves_order_across_chunk_boundaries() {
            let mut relay = relay(1 << 20);
            let chunks: [&[u8]; 4] = [b"GET /", b" HTTP/1.1\r", b"\nHost: x\r\n", b"\r\n"];
            for chunk in chunks {
                relay.on_readable(Side::Client, chunk);
            }
            assert_eq!(
                flush(&mut relay, Side::Server, 3),
                b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"
            );
        }

        #[test]
        fn directions_do_not_mix() {
            let mut relay = relay(1 << 20);
            relay.on_readable(Side::Client, b"ping");
            relay.on_readable(Side::Server, b"pong");
            relay.on_readable(Side::Client, b"!");
            assert_eq!(flush(&mut relay, Side::Server, usize::MAX), b"ping!");
            assert_eq!(flush(&mut relay, Side::Client, usize::MAX), b"pong");
        }

        #[test]
        fn counter_increments_once_per_chunk_in_either_direction() {
            let (mut relay, recorder) = recording_relay(1 << 20);
            relay.on_readable(Side::Client, b"a");
            relay.on_readable(Side::Server, b"b");
            relay.on_readable(Side::Server, b"c");
            relay.on_readable(Side::Client, b"");
            relay.on_readable(Side::Client, b"d");
            assert_eq!(relay.packet_counter(), 4);

            let seen = recorder.0.lock().unwrap().clone();
            let counters: Vec<_> = seen.iter().map(|(c, _, _)| *c).collect();
            assert_eq!(counters, vec![0, 1, 2, 3]);
            let directions: Vec<_> = seen.iter().map(|(_, d, _)| *d).collect();
            assert_eq!(
                directions,
                vec![
                    Direction::Request,
                    Direction::Response,
                    Direction::Response,
                    Direction::Request
                ]
            );
        }

        #[test]
        fn inspectors_see_the_chunk_before_it_is_queued() {
            let (mut relay, recorder) = recording_relay(1 << 20);
            relay.on_readable(Side::Server, b"payload");
            assert_eq!(recorder.0.lock().unwrap()[0].2, b"payload");
            assert_eq!(relay.queued(Side::Client), 7);
        }

        struct FullDisk;

        impl std::io::Write for FullDisk {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("disk full"))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Err(std::io::Error::other("disk full"))
            }
        }

        #[test]
        fn failing_sinks_do_not_stall_forwarding() {
            use crate::filter::FilterChain;
            use crate::inspect::{MatchFormat, PacketLogger, PatternFilter};

            let filter = PatternFilter::new(FilterChain::compile(["x"]).unwrap(), FullDisk)
                .format(MatchFormat::Raw);
            let chain = InspectorChain::new()
                .with(PacketLogger::new(FullDisk))
                .with(filter);
            let mut relay =
                Relay::new(SessionId::new(1), Watermarks::with_high(1024), Arc::new(chain));

            relay.on_readable(Side::Client, b"xyz");
            relay.on_readable(Side::Client, b"xyz");

            assert_eq!(relay.packet_counter(), 2);
            assert_eq!(relay.queued(Side::Server), 6);
            assert!(relay.wants_read(Side::Client));
            assert_eq!(flush(&mut relay, Side::Server, usize::MAX), b"xyzxyz");
        }
    }

    mod backpressure {
        use super::*;

        #[test]
        fn pauses_producer_at_high_and_resumes_at_low() {
            assert_eq!(Watermarks::with_high(1024).low, 512);
            let mut relay = relay(1024);

            let mut sent = 0;
            while relay.wants_read(Side::Client) && sent < 10_000 {
                relay.on_readable(Side::Client, &[b'x'; 100]);
                sent += 100;
            }
            assert_eq!(sent, 1100);
            assert_eq!(relay.queued(Side::Server), 1100);
            assert!(!relay.wants_read(Side::Client));
            assert!(relay.wants_read(Side::Server));

            relay.on_written(Side::Server, 500);
            assert_eq!(relay.queued(Side::Server), 600);
            assert!(!relay.wants_read(Side::Client));

            relay.on_written(Side::Server, 88);
            assert_eq!(relay.queued(Side::Server), 512);
            assert!(relay.wants_read(Side::Client));
        }

        #[test]
        fn queue_stays_within_one_chunk_of_high() {
            let mut relay = relay(1024);
            let chunk = [7u8; 300];
            let mut delivered = Vec::new();
            let mut produced = 0usize;

            while produced < 10_000 {
                if relay.wants_read(Side::Client) {
                    relay.on_readable(Side::Client, &chunk);
                    produced += chunk.len();
                    assert!(relay.queued(Side::Server) < 1024 + chunk.len());
                } else {
                    let pending = relay.pending_output(Side::Server);
                    let n = pending.len().min(64);
                    delivered.extend_from_slice(&pending[..n]);
                    relay.on_written(Side::Server, n);
                }
            }
            delivered.extend(flush(&mut relay, Side::Server, 64));
            assert_eq!(delivered.len(), produced);
        }

        #[test]
        fn throttle_is_per_direction() {
            let mut relay = relay(16);
            relay.on_readable(Side::Server, &[0; 20]);
            assert!(!relay.wants_read(Side::Server));
            assert!(relay.wants_read(Side::Client));
            relay.on_readable(Side::Client, b"still flowing");
            assert_eq!(relay.queued(Side::Server), 13);
        }
    }

    mod shutdown {
        use super::*;

        #[test]
        fn partner_with_empty_queue_closes_immediately() {
            let mut relay = relay(1024);
            relay.on_closed(Side::Client, b"");
            assert!(relay.is_closed(Side::Client));
            assert!(relay.is_closed(Side::Server));
            assert!(relay.is_finished());
        }

        #[test]
        fn partner_with_pending_output_drains_then_closes() {
            let mut relay = relay(1024);
            relay.on_readable(Side::Server, &[b'r'; 400]);
            relay.on_closed(Side::Server, &[b'r'; 100]);

            assert!(relay.is_closed(Side::Server));
            assert_eq!(
                relay.state(Side::Client),
                EndpointState::Connected {
                    read: ReadInterest::Disabled,
                    write: WriteMode::Draining,
                }
            );
            assert!(!relay.wants_read(Side::Client));
            assert!(!relay.is_finished());

            let delivered = flush(&mut relay, Side::Client, 128);
            assert_eq!(delivered, vec![b'r'; 500]);
            assert!(relay.is_closed(Side::Client));
            assert!(relay.is_finished());
        }

        #[test]
        fn server_close_while_client_side_is_throttled_delivers_everything() {
            let mut relay = relay(1024);
            relay.on_readable(Side::Server, &[1; 1024]);
            assert!(!relay.wants_read(Side::Server));

            relay.on_written(Side::Client, 600);
            assert!(relay.wants_read(Side::Server));
            relay.on_closed(Side::Server, &[2; 500]);

            assert!(!relay.is_closed(Side::Client));
            let delivered = flush(&mut relay, Side::Client, 100);
            assert_eq!(delivered.len(), 424 + 500);
            assert!(delivered[424..].iter().all(|&b| b == 2));
            assert!(relay.is_finished());
        }

        #[test]
        fn trailing_bytes_are_inspected_and_counted() {
            let (mut relay, recorder) = recording_relay(1024);
            relay.on_closed(Side::Client, b"bye");
            assert_eq!(relay.packet_counter(), 1);
            assert_eq!(recorder.0.lock().unwrap()[0].2, b"bye");
            assert_eq!(flush(&mut relay, Side::Server, usize::MAX), b"bye");
            assert!(relay.is_finished());
        }

        #[test]
        fn data_for_a_closed_partner_is_discarded() {
            let (mut relay, recorder) = recording_relay(1024);
            relay.on_readable(Side::Client, b"queued");
            relay.on_closed(Side::Client, b"");
            relay.on_readable(Side::Server, b"orphaned");

            assert_eq!(relay.packet_counter(), 1);
            assert_eq!(recorder.0.lock().unwrap().len(), 1);
            assert_eq!(relay.queued(Side::Client), 0);
        }

        #[test]
        fn closing_twice_is_a_no_op() {
            let mut relay = relay(1024);
            relay.on_readable(Side::Client, b"x");
            relay.on_closed(Side::Server, b"");
            relay.on_closed(Side::Server, b"late");
            assert_eq!(relay.packet_counter(), 1);
            assert!(relay.is_finished());
        }

        #[test]
        fn draining_endpoint_failure_releases_it() {
            let mut relay = relay(1024);
            relay.on_readable(Side::Client, b"unsent");
            relay.on_closed(Side::Client, b"");
            assert!(relay.wants_write(Side::Server));

            relay.on_closed(Side::Server, b"");
            assert!(relay.is_finished());
            assert!(!relay.wants_write(Side::Server));
        }
    }
}
