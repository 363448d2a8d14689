use std::{collections::VecDeque, fmt};

use tracing::debug;

/// Which socket of a session an endpoint wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted, client-facing socket.
    Client,
    /// The outbound, upstream-facing socket.
    Server,
}

impl Side {
    #[must_use]
    pub const fn partner(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Direction tag of a chunk, derived from the side it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl From<Side> for Direction {
    fn from(side: Side) -> Self {
        match side {
            Side::Client => Self::Request,
            Side::Server => Self::Response,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("REQUEST"),
            Self::Response => f.write_str("RESPONSE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadInterest {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Normal two-way operation.
    Active,
    /// The partner is gone; flush the output queue, then close.
    Draining,
}

/// Lifecycle of one endpoint. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    New,
    Connected {
        read: ReadInterest,
        write: WriteMode,
    },
    Closed,
}

/// Inputs to the endpoint state table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The socket is established.
    Connect,
    /// High watermark tripped on the partner's output queue.
    PauseRead,
    /// Partner's output queue fell back to the low watermark.
    ResumeRead,
    /// Partner hung up while this endpoint still has output queued.
    Drain,
    /// Output queue emptied while draining.
    Drained,
    /// Own EOF or error, or partner hung up with nothing left to send.
    Close,
}

impl EndpointState {
    /// The full transition table. Pairs not listed leave the state as is.
    #[must_use]
    pub const fn next(self, transition: Transition) -> Option<Self> {
        use EndpointState::{Closed, Connected, New};
        use ReadInterest::{Disabled, Enabled};
        use WriteMode::{Active, Draining};

        match (self, transition) {
            (Closed, _) => None,
            (New, Transition::Connect) => Some(Connected {
                read: Enabled,
                write: Active,
            }),
            (
                Connected {
                    read: Enabled,
                    write: Active,
                },
                Transition::PauseRead,
            ) => Some(Connected {
                read: Disabled,
                write: Active,
            }),
            (
                Connected {
                    read: Disabled,
                    write: Active,
                },
                Transition::ResumeRead,
            ) => Some(Connected {
                read: Enabled,
                write: Active,
            }),
            (Connected { write: Active, .. }, Transition::Drain) => Some(Connected {
                read: Disabled,
                write: Draining,
            }),
            (
                Connected {
                    write: Draining, ..
                },
                Transition::Drained,
            )
            | (New | Connected { .. }, Transition::Close) => Some(Closed),
            _ => None,
        }
    }
}

/// One half of a relayed connection: its lifecycle plus the bytes queued for
/// delivery to the socket it wraps.
#[derive(Debug)]
pub struct Endpoint {
    side: Side,
    state: EndpointState,
    output: VecDeque<u8>,
    drain_watch: bool,
}

impl Endpoint {
    #[must_use]
    pub fn new(side: Side) -> Self {
        Self {
            side,
            state: EndpointState::New,
            output: VecDeque::new(),
            drain_watch: false,
        }
    }

    #[must_use]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[must_use]
    pub const fn state(&self) -> EndpointState {
        self.state
    }

    /// Applies `transition`, returning whether the state changed.
    pub fn apply(&mut self, transition: Transition) -> bool {
        match self.state.next(transition) {
            Some(next) => {
                debug!(side = %self.side, from = ?self.state, to = ?next, "Endpoint transition");
                self.state = next;
                if next == EndpointState::Closed {
                    self.output = VecDeque::new();
                    self.drain_watch = false;
                }
                true
            }
            None => {
                debug!(side = %self.side, state = ?self.state, ?transition, "Ignored endpoint transition");
                false
            }
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, EndpointState::Closed)
    }

    #[must_use]
    pub const fn is_draining(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Connected {
                write: WriteMode::Draining,
                ..
            }
        )
    }

    #[must_use]
    pub const fn reads_enabled(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Connected {
                read: ReadInterest::Enabled,
                ..
            }
        )
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.output.len()
    }

    /// The oldest contiguous run of queued bytes.
    #[must_use]
    pub fn pending(&self) -> &[u8] {
        self.output.as_slices().0
    }

    pub(crate) fn enqueue(&mut self, chunk: &[u8]) {
        self.output.extend(chunk);
    }

    /// Removes `n` sent bytes from the front of the queue.
    pub(crate) fn consume(&mut self, n: usize) {
        let n = n.min(self.output.len());
        self.output.drain(..n);
    }

    pub(crate) const fn drain_watch(&self) -> bool {
        self.drain_watch
    }

    pub(crate) fn set_drain_watch(&mut self, armed: bool) {
        self.drain_watch = armed;
    }
}
