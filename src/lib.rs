//! TCP Tap
//!
//! A transparent TCP relay that forwards bytes between clients and a fixed upstream,
//! optionally logging every relayed chunk and scanning it against an ordered regex chain.

pub mod acceptor;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod filter;
pub mod inspect;
pub mod relay;
pub mod session;

// Re-export commonly used types and functions
pub use acceptor::Acceptor;
pub use cli::Cli;
pub use config::{Config, RelaySettings, load_settings, parse_host_port, parse_listen_addr};
pub use endpoint::{Direction, EndpointState, Side};
pub use filter::{FilterChain, MAX_MATCHES_PER_SCAN, Pattern};
pub use inspect::{Inspector, InspectorChain, MatchFormat, Packet, PacketLogger, PatternFilter};
pub use relay::{Relay, Watermarks};
pub use session::{RelayContext, Session, SessionId};
