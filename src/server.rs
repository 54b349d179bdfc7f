//! The streaming server: a reliable control connection per client for the textual command
//!  protocol, and one packaged UDP sender per subscribed stream for the data path.
//!
//! A client connects, negotiates its UDP receiver port, selects a channel, and starts the
//!  stream; from then on every payload the producer hands to [StreamingServer::stream] is
//!  fanned out, best-effort, to all streaming subscribers of that channel.

pub mod channel;
pub mod connection;
pub mod control;
pub mod streaming;

pub use channel::{Channel, ChannelId, ChannelState, Stream, StreamId};
pub use connection::Connection;
pub use control::{ControlHandler, ControlTransport, TcpControlTransport};
pub use streaming::{ServerConfig, StreamingServer};
