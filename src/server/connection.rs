use std::net::IpAddr;

use crate::server::channel::{ChannelId, StreamId};
use crate::server::control::ConnectionId;

/// Per-control-connection negotiation state. Created when the control transport accepts the
///  connection, destroyed on disconnect.
///
/// The negotiated fields are settable at most once; a second set fails instead of overwriting,
///  so a client cannot silently re-bind a live stream to a different endpoint.
#[derive(Debug)]
pub struct Connection {
    connection_id: ConnectionId,
    /// the client's address as seen by the control transport; the stream data port is
    ///  negotiated separately via the `clientPort` command
    receiver_addr: IpAddr,
    receiver_port: Option<u16>,
    channel_id: ChannelId,
    stream_id: StreamId,
}

impl Connection {
    pub fn new(connection_id: ConnectionId, receiver_addr: IpAddr) -> Connection {
        Connection {
            connection_id,
            receiver_addr,
            receiver_port: None,
            channel_id: ChannelId::INVALID,
            stream_id: StreamId::INVALID,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn receiver_addr(&self) -> IpAddr {
        self.receiver_addr
    }

    pub fn receiver_port(&self) -> Option<u16> {
        self.receiver_port
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn set_receiver_port(&mut self, port: u16) -> bool {
        if self.receiver_port.is_some() || port == 0 {
            return false;
        }
        self.receiver_port = Some(port);
        true
    }

    pub fn set_channel_id(&mut self, channel_id: ChannelId) -> bool {
        if self.channel_id.is_valid() || !channel_id.is_valid() {
            return false;
        }
        self.channel_id = channel_id;
        true
    }

    pub fn set_stream_id(&mut self, stream_id: StreamId) -> bool {
        if self.stream_id.is_valid() || !stream_id.is_valid() {
            return false;
        }
        self.stream_id = stream_id;
        true
    }

    /// Server-side reset after the stream was removed (`stop` or unregistration). The channel
    ///  selection and receiver port survive, so a later `start` can open a fresh stream.
    pub fn clear_stream_id(&mut self) {
        self.stream_id = StreamId::INVALID;
    }
}
