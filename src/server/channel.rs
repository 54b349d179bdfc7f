use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::server::control::ConnectionId;
use crate::transport::PackagedUdpSender;

/// Server-assigned channel handle, unique for the server's lifetime.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChannelId(pub u32);
impl ChannelId {
    pub const INVALID: ChannelId = ChannelId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}
impl Debug for ChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel/{}", self.0)
    }
}

/// Per-channel stream handle.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u32);
impl StreamId {
    pub const INVALID: StreamId = StreamId(u32::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}
impl Debug for StreamId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream/{}", self.0)
    }
}

/// Aggregate state changes of a channel, delivered to the producer that registered it so it can
///  lazily start / stop generating data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChannelState {
    /// the first stream started streaming
    Start,
    /// the last streaming stream was paused or removed
    Pause,
    /// the last stream was removed
    Stop,
    /// the channel's data type label changed
    TypeChanged,
}

/// One subscriber's binding to a channel: the negotiated receiver endpoint, the owning control
///  connection, and a dedicated packaged UDP sender.
///
/// A stream owns its bound socket, so it is not clonable; the sender is held behind an `Arc`
///  only so fan-out can happen after the registry lock is released.
pub struct Stream {
    connection_id: ConnectionId,
    receiver: SocketAddr,
    sender: Arc<PackagedUdpSender>,
    is_streaming: bool,
}

impl Stream {
    /// Binds a fresh wildcard UDP socket for this subscriber. A bind failure is fatal to the
    ///  stream's creation and propagates to the caller.
    pub async fn open(connection_id: ConnectionId, receiver: SocketAddr) -> anyhow::Result<Stream> {
        let local_addr = if receiver.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(SocketAddr::from_str(local_addr)?).await?);
        let sender = Arc::new(PackagedUdpSender::new(Arc::new(socket))?);

        Ok(Stream {
            connection_id,
            receiver,
            sender,
            is_streaming: false,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn receiver(&self) -> SocketAddr {
        self.receiver
    }

    pub fn sender_port(&self) -> u16 {
        self.sender.local_addr().port()
    }

    pub fn is_streaming(&self) -> bool {
        self.is_streaming
    }
}

/// One delivery target of a fan-out, snapshotted under the registry lock so the actual sends
///  happen outside it.
#[derive(Clone)]
pub struct StreamTarget {
    pub sender: Arc<PackagedUdpSender>,
    pub receiver: SocketAddr,
}

/// A named, registered data source with one data-type label and one [Stream] per subscribing
///  client.
pub struct Channel {
    name: String,
    data_type: String,
    streams: FxHashMap<StreamId, Stream>,
    num_active_streams: u32,
    stream_id_counter: u32,
    events: mpsc::Sender<ChannelState>,
}

impl Channel {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, events: mpsc::Sender<ChannelState>) -> Channel {
        Channel {
            name: name.into(),
            data_type: data_type.into(),
            streams: FxHashMap::default(),
            num_active_streams: 0,
            stream_id_counter: 0,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn num_active_streams(&self) -> u32 {
        self.num_active_streams
    }

    /// Adds a stream in `Stopped` state, returning its fresh id (unique within this channel,
    ///  never reused).
    pub fn add_stream(&mut self, stream: Stream) -> StreamId {
        let stream_id = StreamId(self.stream_id_counter);
        self.stream_id_counter += 1;

        debug_assert!(!self.streams.contains_key(&stream_id));
        self.streams.insert(stream_id, stream);
        stream_id
    }

    /// `Stopped|Streaming -> Streaming`; idempotent. Fails only for an unknown stream id.
    pub fn start_stream(&mut self, stream_id: StreamId) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if stream.is_streaming {
            return true;
        }

        stream.is_streaming = true;
        self.num_active_streams += 1;
        if self.num_active_streams == 1 {
            self.emit(ChannelState::Start);
        }
        true
    }

    /// `Streaming -> Stopped`; a paused stream stays registered but receives no payloads.
    ///  Idempotent for a stream that never started. Fails only for an unknown stream id.
    pub fn pause_stream(&mut self, stream_id: StreamId) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if !stream.is_streaming {
            return true;
        }

        stream.is_streaming = false;
        self.num_active_streams -= 1;
        if self.num_active_streams == 0 {
            self.emit(ChannelState::Pause);
        }
        true
    }

    /// Transitions to `Stopped` and removes the stream from the channel, releasing its bound
    ///  socket. Fails only for an unknown stream id.
    pub fn stop_stream(&mut self, stream_id: StreamId) -> bool {
        self.remove_stream(stream_id)
    }

    /// Forced removal regardless of state - used on client disconnect.
    pub fn remove_stream(&mut self, stream_id: StreamId) -> bool {
        let Some(stream) = self.streams.remove(&stream_id) else {
            return false;
        };

        if stream.is_streaming {
            self.num_active_streams -= 1;
        }

        if self.streams.is_empty() {
            self.emit(ChannelState::Stop);
        }
        else if self.num_active_streams == 0 {
            self.emit(ChannelState::Pause);
        }
        true
    }

    /// Updates the data-type label; returns false if the label is unchanged (no event, no
    ///  client notification needed).
    pub fn set_data_type(&mut self, data_type: &str) -> bool {
        if self.data_type == data_type {
            return false;
        }
        self.data_type = data_type.to_string();
        self.emit(ChannelState::TypeChanged);
        true
    }

    pub fn sender_port(&self, stream_id: StreamId) -> Option<u16> {
        self.streams.get(&stream_id)
            .map(|s| s.sender_port())
    }

    pub fn stream_id_for_connection(&self, connection_id: ConnectionId) -> Option<StreamId> {
        self.streams.iter()
            .find(|(_, s)| s.connection_id == connection_id)
            .map(|(&id, _)| id)
    }

    /// Control connections of all subscribers, streaming or paused.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.streams.values()
            .map(|s| s.connection_id)
            .collect()
    }

    /// Snapshot of all currently streaming targets. Taken under the registry lock; the sends
    ///  themselves must happen after it is released.
    pub fn stream_targets(&self) -> Vec<StreamTarget> {
        self.streams.values()
            .filter(|s| s.is_streaming)
            .map(|s| StreamTarget {
                sender: s.sender.clone(),
                receiver: s.receiver,
            })
            .collect()
    }

    fn emit(&self, state: ChannelState) {
        debug!("channel {:?}: state event {:?}", self.name, state);
        if let Err(e) = self.events.try_send(state) {
            // a slow producer must never block the registry
            warn!("could not deliver state event for channel {:?}: {}", self.name, e);
        }
    }
}

/// Best-effort fan-out of one payload to a snapshot of streaming targets. A failure to send to
///  one subscriber does not prevent delivery attempts to the others; the result is false only
///  if there was at least one target and every send failed.
pub async fn fan_out(targets: &[StreamTarget], payload: &[u8]) -> bool {
    let mut num_failed = 0usize;
    for target in targets {
        if !target.sender.send(target.receiver, payload).await {
            warn!("failed to stream payload to subscriber at {:?}", target.receiver);
            num_failed += 1;
        }
    }
    num_failed < targets.len() || targets.is_empty()
}
