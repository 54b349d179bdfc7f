use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::frame::{build_command, build_response, Frame};
use crate::protocol::tokens::{Command, CHANNEL_LIST_SEPARATOR};
use crate::server::channel::{fan_out, Channel, ChannelId, ChannelState, Stream};
use crate::server::connection::Connection;
use crate::server::control::{ConnectionId, ControlHandler, ControlTransport};
use crate::session::queue::{MessageQueue, DEFAULT_MAX_AGE};

/// capacity of the per-channel state event channel handed to the producer
const CHANNEL_EVENT_CAPACITY: usize = 16;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// how long the server waits for a client's response after pushing a command to it
    pub response_timeout: Duration,
    /// retention age of the response correlation queue, see [MessageQueue]
    pub message_retention_age: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            response_timeout: Duration::from_secs(2),
            message_retention_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Default)]
struct ServerState {
    channels: FxHashMap<ChannelId, Channel>,
    connections: FxHashMap<ConnectionId, Connection>,
    channel_id_counter: u32,
}

/// The streaming server core: owns the channel registry and the per-connection negotiation
///  state, dispatches incoming control commands, and fans payloads out to subscribers.
///
/// It is wired to a [ControlTransport] for frames it sends, and registered with that transport
///  as the [ControlHandler] for everything arriving. All registry state lives behind one async
///  mutex; frames are only ever sent after the lock is released, and payload fan-out works on a
///  snapshot of send targets for the same reason.
pub struct StreamingServer {
    name: String,
    config: ServerConfig,
    control: Arc<dyn ControlTransport>,
    message_queue: MessageQueue,
    state: Mutex<ServerState>,
}

impl StreamingServer {
    pub fn new(name: impl Into<String>, config: ServerConfig, control: Arc<dyn ControlTransport>) -> StreamingServer {
        let message_queue = MessageQueue::new(config.message_retention_age);

        StreamingServer {
            name: name.into(),
            config,
            control,
            message_queue,
            state: Mutex::new(ServerState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new named channel, returning its id and the receiver on which the producer
    ///  is told to start / pause / stop generating data. Fails if the name is empty or taken.
    pub async fn register_channel(&self, name: &str, data_type: &str) -> anyhow::Result<(ChannelId, mpsc::Receiver<ChannelState>)> {
        if name.is_empty() {
            bail!("channel name must not be empty");
        }

        let mut state = self.state.lock().await;
        if state.channels.values().any(|c| c.name() == name) {
            bail!("channel {:?} is already registered", name);
        }

        let channel_id = ChannelId(state.channel_id_counter);
        state.channel_id_counter += 1;

        let (events, event_receiver) = mpsc::channel(CHANNEL_EVENT_CAPACITY);
        state.channels.insert(channel_id, Channel::new(name, data_type, events));

        info!("registered channel {:?} as {:?}", name, channel_id);
        Ok((channel_id, event_receiver))
    }

    /// Removes a channel. Every subscriber is sent a `disconnect` command, given
    ///  `response_timeout` to acknowledge it, and then has its control connection closed either
    ///  way.
    pub async fn unregister_channel(&self, channel_id: ChannelId) -> bool {
        let channel = self.state.lock().await
            .channels.remove(&channel_id);
        let Some(channel) = channel else {
            return false;
        };
        info!("unregistering channel {:?} with {} subscriber(s)", channel.name(), channel.num_streams());

        for connection_id in channel.connection_ids() {
            let session_id = self.message_queue.unique_id();
            match build_command(Command::Disconnect.as_str(), "", session_id) {
                Ok(frame) => {
                    if self.control.send(connection_id, &frame).await {
                        let response = self.message_queue.pop_message_within(session_id, self.config.response_timeout).await;
                        if response != Command::Disconnect.positive_response() {
                            warn!("subscriber on connection {} did not acknowledge the disconnect", connection_id);
                        }
                    }
                }
                Err(e) => error!("error building disconnect command: {}", e),
            }

            self.control.close(connection_id).await;
            self.state.lock().await
                .connections.remove(&connection_id);
        }
        true
    }

    pub async fn has_channel(&self, name: &str) -> bool {
        self.state.lock().await
            .channels.values()
            .any(|c| c.name() == name)
    }

    /// A channel name derived from `base` that is not currently registered.
    pub async fn generate_unique_channel_name(&self, base: &str) -> String {
        let state = self.state.lock().await;
        if !state.channels.values().any(|c| c.name() == base) {
            return base.to_string();
        }

        let mut n = 0u64;
        loop {
            let candidate = format!("{}{}", base, n);
            if !state.channels.values().any(|c| c.name() == candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// Changes a channel's data-type label and pushes a `changeddatatype` command to every
    ///  subscriber, awaiting each client's acknowledgement. Returns true if the channel exists
    ///  and all subscribers (if any) accepted the change; an unchanged label is a silent
    ///  success.
    pub async fn change_data_type(&self, channel_id: ChannelId, data_type: &str) -> bool {
        let connection_ids = {
            let mut state = self.state.lock().await;
            let Some(channel) = state.channels.get_mut(&channel_id) else {
                return false;
            };
            if !channel.set_data_type(data_type) {
                return true;
            }
            channel.connection_ids()
        };

        let mut all_accepted = true;
        for connection_id in connection_ids {
            let session_id = self.message_queue.unique_id();
            let frame = match build_command(Command::ChangedDataType.as_str(), data_type, session_id) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("error building changeddatatype command: {}", e);
                    all_accepted = false;
                    continue;
                }
            };

            if !self.control.send(connection_id, &frame).await {
                all_accepted = false;
                continue;
            }
            let response = self.message_queue.pop_message_within(session_id, self.config.response_timeout).await;
            if response != Command::ChangedDataType.positive_response() {
                warn!("subscriber on connection {} did not accept the data type change", connection_id);
                all_accepted = false;
            }
        }
        all_accepted
    }

    /// Fans one payload out to all currently streaming subscribers of the channel,
    ///  best-effort. False if the channel is unknown, or there were targets and every send
    ///  failed.
    pub async fn stream(&self, channel_id: ChannelId, payload: &[u8]) -> bool {
        let targets = {
            let state = self.state.lock().await;
            match state.channels.get(&channel_id) {
                Some(channel) => channel.stream_targets(),
                None => {
                    warn!("attempt to stream on unknown channel {:?}", channel_id);
                    return false;
                }
            }
        };
        fan_out(&targets, payload).await
    }

    /// Drops all channels, closes all control connections and clears the correlation queue.
    pub async fn release(&self) {
        let connection_ids: Vec<ConnectionId> = {
            let mut state = self.state.lock().await;
            state.channels.clear();
            state.connections.drain().map(|(id, _)| id).collect()
        };

        for connection_id in connection_ids {
            self.control.close(connection_id).await;
        }
        self.message_queue.clear();
        info!("streaming server {:?} released", self.name);
    }

    async fn on_command(&self, connection_id: ConnectionId, frame: Frame) {
        let Some(command) = Command::lookup(&frame.message) else {
            warn!("unknown command {:?} on connection {}", frame.message, connection_id);
            return;
        };
        trace!("command {:?} from connection {}", command, connection_id);

        let (positive, value) = match command {
            Command::Connect => self.on_connect(connection_id).await,
            Command::Disconnect => self.on_disconnect(connection_id).await,
            Command::Select => self.on_select(connection_id, &frame.value).await,
            Command::Start => self.on_start(connection_id).await,
            Command::Pause => self.on_pause(connection_id).await,
            Command::Stop => self.on_stop(connection_id).await,
            Command::ClientPort => self.on_client_port(connection_id, &frame.value).await,
            Command::ServerPort => self.on_server_port(connection_id).await,
            Command::Channels => self.on_channels().await,
            Command::DataType => self.on_data_type(connection_id).await,
            Command::ChangedDataType => {
                // server -> client push only, a client must not send it
                warn!("connection {} sent a changeddatatype command", connection_id);
                return;
            }
        };

        let message = if positive { command.positive_response() } else { command.negative_response() };
        match build_response(message, &value, frame.session_id) {
            Ok(response) => {
                if !self.control.send(connection_id, &response).await {
                    warn!("could not send response to connection {}", connection_id);
                }
            }
            Err(e) => error!("error building response for {:?}: {}", command, e),
        }
    }

    async fn on_connect(&self, connection_id: ConnectionId) -> (bool, String) {
        let state = self.state.lock().await;
        (state.connections.contains_key(&connection_id), String::new())
    }

    /// An orderly goodbye: the subscriber's stream is removed, but the connection stays open
    ///  with fresh negotiation state.
    async fn on_disconnect(&self, connection_id: ConnectionId) -> (bool, String) {
        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };
        let receiver_addr = conn.receiver_addr();
        let channel_id = conn.channel_id();
        let stream_id = conn.stream_id();

        if stream_id.is_valid() {
            if let Some(channel) = state.channels.get_mut(&channel_id) {
                channel.remove_stream(stream_id);
            }
        }
        state.connections.insert(connection_id, Connection::new(connection_id, receiver_addr));
        (true, String::new())
    }

    async fn on_select(&self, connection_id: ConnectionId, value: &str) -> (bool, String) {
        let mut state = self.state.lock().await;

        // an empty value means "whatever you have": the first registered channel
        let target = if value.is_empty() {
            state.channels.keys().min().copied()
        }
        else {
            state.channels.iter()
                .find(|(_, c)| c.name() == value)
                .map(|(&id, _)| id)
        };
        let Some(target) = target else {
            return (false, "Channel unknown".to_string());
        };

        let Some(conn) = state.connections.get_mut(&connection_id) else {
            return (false, String::new());
        };
        if conn.channel_id().is_valid() {
            return if conn.channel_id() == target {
                (true, String::new())
            }
            else {
                (false, "The client selected a different channel before".to_string())
            };
        }
        conn.set_channel_id(target);

        (Self::ensure_stream(&mut state, connection_id).await, String::new())
    }

    async fn on_start(&self, connection_id: ConnectionId) -> (bool, String) {
        let mut state = self.state.lock().await;
        // re-opens the stream if a previous `stop` removed it
        if !Self::ensure_stream(&mut state, connection_id).await {
            return (false, String::new());
        }

        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };
        let channel_id = conn.channel_id();
        let stream_id = conn.stream_id();
        if !stream_id.is_valid() {
            return (false, String::new());
        }

        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return (false, String::new());
        };
        if channel.start_stream(stream_id) {
            (true, channel.data_type().to_string())
        }
        else {
            (false, String::new())
        }
    }

    async fn on_pause(&self, connection_id: ConnectionId) -> (bool, String) {
        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };
        let channel_id = conn.channel_id();
        let stream_id = conn.stream_id();
        if !stream_id.is_valid() {
            return (false, String::new());
        }

        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return (false, String::new());
        };
        (channel.pause_stream(stream_id), String::new())
    }

    async fn on_stop(&self, connection_id: ConnectionId) -> (bool, String) {
        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };
        let channel_id = conn.channel_id();
        let stream_id = conn.stream_id();
        if !stream_id.is_valid() {
            return (false, String::new());
        }

        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return (false, String::new());
        };
        if !channel.stop_stream(stream_id) {
            return (false, String::new());
        }
        if let Some(conn) = state.connections.get_mut(&connection_id) {
            conn.clear_stream_id();
        }
        (true, String::new())
    }

    async fn on_client_port(&self, connection_id: ConnectionId, value: &str) -> (bool, String) {
        if value.len() > 5 {
            return (false, String::new());
        }
        let Ok(port) = value.parse::<u16>() else {
            return (false, String::new());
        };
        if port == 0 || port == u16::MAX {
            return (false, String::new());
        }

        let mut state = self.state.lock().await;
        let Some(conn) = state.connections.get_mut(&connection_id) else {
            return (false, String::new());
        };
        if !conn.set_receiver_port(port) {
            return (false, String::new());
        }

        (Self::ensure_stream(&mut state, connection_id).await, String::new())
    }

    /// The port the server's UDP sender for this subscriber is bound to - useful for clients
    ///  that filter datagrams by source.
    async fn on_server_port(&self, connection_id: ConnectionId) -> (bool, String) {
        let state = self.state.lock().await;
        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };

        let port = state.channels.get(&conn.channel_id())
            .and_then(|c| c.sender_port(conn.stream_id()));
        match port {
            Some(port) => (true, port.to_string()),
            None => (false, String::new()),
        }
    }

    async fn on_channels(&self) -> (bool, String) {
        let state = self.state.lock().await;
        let mut channels: Vec<(ChannelId, &str)> = state.channels.iter()
            .map(|(&id, c)| (id, c.name()))
            .collect();
        channels.sort_by_key(|&(id, _)| id);

        let names = channels.iter()
            .map(|&(_, name)| name)
            .collect::<Vec<_>>()
            .join(CHANNEL_LIST_SEPARATOR);
        (true, names)
    }

    async fn on_data_type(&self, connection_id: ConnectionId) -> (bool, String) {
        let state = self.state.lock().await;
        let Some(conn) = state.connections.get(&connection_id) else {
            return (false, String::new());
        };

        match state.channels.get(&conn.channel_id()) {
            Some(channel) => (true, channel.data_type().to_string()),
            None => (false, String::new()),
        }
    }

    /// Opens this connection's stream if the preconditions are complete (receiver port
    ///  negotiated, channel selected) and it does not exist yet. True unless the UDP bind or
    ///  the registry lookup failed - incomplete preconditions are not an error.
    async fn ensure_stream(state: &mut ServerState, connection_id: ConnectionId) -> bool {
        let Some(conn) = state.connections.get(&connection_id) else {
            return false;
        };
        if conn.stream_id().is_valid() {
            return true;
        }
        let channel_id = conn.channel_id();
        let Some(port) = conn.receiver_port() else {
            return true;
        };
        if !channel_id.is_valid() {
            return true;
        }
        let receiver = SocketAddr::new(conn.receiver_addr(), port);

        let stream = match Stream::open(connection_id, receiver).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("could not open a stream to {:?}: {}", receiver, e);
                return false;
            }
        };

        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return false;
        };
        let stream_id = channel.add_stream(stream);
        debug!("opened {:?} on {:?} for connection {}", stream_id, channel_id, connection_id);

        if let Some(conn) = state.connections.get_mut(&connection_id) {
            conn.set_stream_id(stream_id);
        }
        true
    }
}

#[async_trait]
impl ControlHandler for StreamingServer {
    async fn on_connection_accepted(&self, peer_addr: SocketAddr, connection_id: ConnectionId) {
        debug!("client connected from {:?} as connection {}", peer_addr, connection_id);
        self.state.lock().await
            .connections.insert(connection_id, Connection::new(connection_id, peer_addr.ip()));
    }

    async fn on_frame_received(&self, connection_id: ConnectionId, frame: &[u8]) {
        let frame = match Frame::parse(frame) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed frame from connection {}: {}", connection_id, e);
                return;
            }
        };

        if frame.is_response {
            // a reply to a command this server pushed - hand it to whoever is waiting
            self.message_queue.push(frame.session_id, frame.message, frame.value);
        }
        else {
            self.on_command(connection_id, frame).await;
        }
    }

    async fn on_connection_closed(&self, connection_id: ConnectionId) {
        debug!("connection {} closed", connection_id);

        let mut state = self.state.lock().await;
        if let Some(conn) = state.connections.remove(&connection_id) {
            if conn.stream_id().is_valid() {
                if let Some(channel) = state.channels.get_mut(&conn.channel_id()) {
                    channel.remove_stream(conn.stream_id());
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use tokio::net::UdpSocket;
    use tokio::runtime::Builder;
    use tokio::sync::mpsc::Receiver;

    use crate::server::control::MockControlTransport;
    use crate::session::SessionId;
    use crate::transport::fragment::FragmentHeader;

    use super::*;

    const CONN: ConnectionId = 1;

    fn addr() -> SocketAddr {
        "127.0.0.1:5555".parse().unwrap()
    }

    /// a transport mock that accepts any number of sends without asserting their content
    fn lenient_transport() -> MockControlTransport {
        let mut mock = MockControlTransport::new();
        mock.expect_send().returning(|_, _| true);
        mock.expect_close().returning(|_| ());
        mock
    }

    /// a transport mock that expects exactly the given frames on connection `CONN`, in order
    fn strict_transport(expected: &[&str]) -> MockControlTransport {
        let mut mock = MockControlTransport::new();
        let mut seq = mockall::Sequence::new();
        for frame in expected {
            let frame = frame.to_string();
            mock.expect_send()
                .withf(move |&conn, sent| conn == CONN && sent == frame)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| true);
        }
        mock
    }

    async fn subscribed_server(mock: MockControlTransport) -> (StreamingServer, ChannelId, Receiver<ChannelState>) {
        let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
        let (channel_id, events) = server.register_channel("cameraFeed", "image/raw").await.unwrap();

        server.on_connection_accepted(addr(), CONN).await;
        server.on_frame_received(CONN, b"command:connect,id:1").await;
        server.on_frame_received(CONN, b"command:clientPort-6000,id:2").await;
        server.on_frame_received(CONN, b"command:select-cameraFeed,id:3").await;
        (server, channel_id, events)
    }

    fn drain(receiver: &mut Receiver<ChannelState>) -> Vec<ChannelState> {
        let mut result = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            result.push(event);
        }
        result
    }

    #[rstest]
    fn test_connect_select_start_flow() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:connected,id:1",
                "response:accepted,id:2",
                "response:selected,id:3",
                "response:started-image/raw,id:4",
            ]);
            let (server, _, mut events) = subscribed_server(mock).await;

            server.on_frame_received(CONN, b"command:start,id:4").await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start]);
        });
    }

    #[rstest]
    fn test_select_unknown_channel() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:connected,id:1",
                "response:notselected-Channel unknown,id:2",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:connect,id:1").await;
            server.on_frame_received(CONN, b"command:select-noSuchChannel,id:2").await;
        });
    }

    #[rstest]
    fn test_select_empty_value_picks_first_channel() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:selected,id:1",
                "response:datatype-image/raw,id:2",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();
            let _ = server.register_channel("audioFeed", "audio/pcm").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:select,id:1").await;
            server.on_frame_received(CONN, b"command:datatype,id:2").await;
        });
    }

    #[rstest]
    fn test_select_different_channel_rejected() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:selected,id:1",
                "response:selected,id:2",
                "response:notselected-The client selected a different channel before,id:3",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();
            let _ = server.register_channel("audioFeed", "audio/pcm").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:select-cameraFeed,id:1").await;
            // re-selecting the same channel is fine
            server.on_frame_received(CONN, b"command:select-cameraFeed,id:2").await;
            server.on_frame_received(CONN, b"command:select-audioFeed,id:3").await;
        });
    }

    #[rstest]
    #[case::zero("0")]
    #[case::too_large("65535")]
    #[case::too_long("123456")]
    #[case::not_a_number("abc")]
    #[case::empty("")]
    fn test_client_port_rejected(#[case] port: &str) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&["response:notaccepted,id:1"]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            let frame = format!("command:clientPort-{},id:1", port);
            server.on_frame_received(CONN, frame.as_bytes()).await;
        });
    }

    #[rstest]
    fn test_client_port_set_once() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:accepted,id:1",
                "response:notaccepted,id:2",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:clientPort-6000,id:1").await;
            server.on_frame_received(CONN, b"command:clientPort-6001,id:2").await;
        });
    }

    #[rstest]
    fn test_start_without_port_fails() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:selected,id:1",
                "response:notstarted,id:2",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:select-cameraFeed,id:1").await;
            server.on_frame_received(CONN, b"command:start,id:2").await;
        });
    }

    #[rstest]
    fn test_pause_and_restart() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, _, mut events) = subscribed_server(lenient_transport()).await;

            server.on_frame_received(CONN, b"command:start,id:4").await;
            server.on_frame_received(CONN, b"command:pause,id:5").await;
            server.on_frame_received(CONN, b"command:start,id:6").await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start, ChannelState::Pause, ChannelState::Start]);
        });
    }

    #[rstest]
    fn test_stop_removes_stream_and_start_reopens() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, _, mut events) = subscribed_server(lenient_transport()).await;

            server.on_frame_received(CONN, b"command:start,id:4").await;
            server.on_frame_received(CONN, b"command:stop,id:5").await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start, ChannelState::Stop]);

            // a fresh stream is opened on the next start
            server.on_frame_received(CONN, b"command:start,id:6").await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start]);
        });
    }

    #[rstest]
    fn test_server_port_query() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut mock = MockControlTransport::new();
            mock.expect_send()
                .withf(|&conn, frame| {
                    if conn != CONN || !frame.ends_with(",id:4") {
                        return true;
                    }
                    // the sender port is dynamic, but it must be a port
                    frame.strip_prefix("response:accepted-")
                        .and_then(|rest| rest.strip_suffix(",id:4"))
                        .map(|port| port.parse::<u16>().is_ok())
                        .unwrap_or(false)
                })
                .returning(|_, _| true);
            let (server, _, _events) = subscribed_server(mock).await;

            server.on_frame_received(CONN, b"command:serverPort,id:4").await;
        });
    }

    #[rstest]
    fn test_server_port_without_stream() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&["response:notaccepted,id:1"]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:serverPort,id:1").await;
        });
    }

    #[rstest]
    fn test_channels_listing() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&[
                "response:channels,id:1",
                "response:channels-cameraFeed;audioFeed,id:2",
            ]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:channels,id:1").await;

            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();
            let _ = server.register_channel("audioFeed", "audio/pcm").await.unwrap();
            server.on_frame_received(CONN, b"command:channels,id:2").await;
        });
    }

    #[rstest]
    fn test_datatype_without_selection() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = strict_transport(&["response:nodatatype,id:1"]);
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));
            let _ = server.register_channel("cameraFeed", "image/raw").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:datatype,id:1").await;
        });
    }

    #[rstest]
    fn test_malformed_frames_are_ignored() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            // no expectations: any send would panic
            let mock = MockControlTransport::new();
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"garbage").await;
            server.on_frame_received(CONN, b"command:connect").await;
            server.on_frame_received(CONN, b"command:connect,id:0").await;
            server.on_frame_received(CONN, b"command:frobnicate,id:1").await;
            server.on_frame_received(CONN, b"command:changeddatatype-x,id:1").await;
        });
    }

    #[rstest]
    fn test_response_frame_is_queued() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mock = MockControlTransport::new();
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(mock));

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"response:accepted-ok,id:5").await;
            assert_eq!(server.message_queue.front(SessionId(5)), Some(("accepted".to_string(), "ok".to_string())));
        });
    }

    #[rstest]
    fn test_disconnect_removes_stream_and_resets_negotiation() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, _, mut events) = subscribed_server(lenient_transport()).await;
            server.on_frame_received(CONN, b"command:start,id:4").await;

            server.on_frame_received(CONN, b"command:disconnect,id:5").await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start, ChannelState::Stop]);

            // negotiation state is fresh: the port can be set again
            server.on_frame_received(CONN, b"command:clientPort-6001,id:6").await;
        });
    }

    #[rstest]
    fn test_connection_closed_removes_stream() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let (server, _, mut events) = subscribed_server(lenient_transport()).await;
            server.on_frame_received(CONN, b"command:start,id:4").await;

            server.on_connection_closed(CONN).await;
            assert_eq!(drain(&mut events), vec![ChannelState::Start, ChannelState::Stop]);
        });
    }

    #[rstest]
    fn test_register_channel_rejects_duplicates_and_empty_names() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(MockControlTransport::new()));

            assert!(server.register_channel("", "image/raw").await.is_err());
            assert!(server.register_channel("cameraFeed", "image/raw").await.is_ok());
            assert!(server.register_channel("cameraFeed", "audio/pcm").await.is_err());
            assert!(server.has_channel("cameraFeed").await);
            assert!(!server.has_channel("audioFeed").await);
        });
    }

    #[rstest]
    fn test_generate_unique_channel_name() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(MockControlTransport::new()));

            assert_eq!(server.generate_unique_channel_name("feed").await, "feed");
            let _ = server.register_channel("feed", "image/raw").await.unwrap();
            let _ = server.register_channel("feed0", "image/raw").await.unwrap();
            assert_eq!(server.generate_unique_channel_name("feed").await, "feed1");
        });
    }

    #[rstest]
    fn test_change_data_type_notifies_subscribers() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut mock = MockControlTransport::new();
            mock.expect_send()
                .withf(|&conn, frame| conn == CONN && frame == "command:changeddatatype-image/h264,id:1")
                .times(1)
                .returning(|_, _| true);
            mock.expect_send().returning(|_, _| true);

            let (server, channel_id, mut events) = subscribed_server(mock).await;
            // the client's acknowledgement, delivered ahead of time so the push finds it
            server.message_queue.push(SessionId(1), "accepted", "");

            assert!(server.change_data_type(channel_id, "image/h264").await);
            assert_eq!(drain(&mut events), vec![ChannelState::TypeChanged]);

            // unchanged label: no pushes, silent success
            assert!(server.change_data_type(channel_id, "image/h264").await);
            assert!(!server.change_data_type(ChannelId(99), "image/h264").await);
        });
    }

    #[rstest]
    fn test_unregister_channel_disconnects_subscribers() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let mut mock = MockControlTransport::new();
            mock.expect_send()
                .withf(|&conn, frame| conn == CONN && frame == "command:disconnect,id:1")
                .times(1)
                .returning(|_, _| true);
            mock.expect_send().returning(|_, _| true);
            mock.expect_close()
                .withf(|&conn| conn == CONN)
                .times(1)
                .returning(|_| ());

            let (server, channel_id, _events) = subscribed_server(mock).await;
            server.message_queue.push(SessionId(1), "disconnected", "");

            assert!(server.unregister_channel(channel_id).await);
            assert!(!server.has_channel("cameraFeed").await);
            assert!(!server.unregister_channel(channel_id).await);
        });
    }

    #[rstest]
    fn test_stream_fans_out_to_subscriber() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let port = receiver.local_addr().unwrap().port();

            let server = StreamingServer::new("testServer", ServerConfig::default(), Arc::new(lenient_transport()));
            let (channel_id, _events) = server.register_channel("cameraFeed", "image/raw").await.unwrap();

            server.on_connection_accepted(addr(), CONN).await;
            server.on_frame_received(CONN, b"command:connect,id:1").await;
            let frame = format!("command:clientPort-{},id:2", port);
            server.on_frame_received(CONN, frame.as_bytes()).await;
            server.on_frame_received(CONN, b"command:select-cameraFeed,id:3").await;
            server.on_frame_received(CONN, b"command:start,id:4").await;

            let payload = b"frame data";
            assert!(server.stream(channel_id, payload).await);

            let mut buf = vec![0u8; 1500];
            let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, FragmentHeader::SERIALIZED_LEN + payload.len());
            assert_eq!(&buf[FragmentHeader::SERIALIZED_LEN..n], payload);

            // a paused subscriber receives nothing, and the fan-out has no targets
            server.on_frame_received(CONN, b"command:pause,id:5").await;
            assert!(server.stream(channel_id, payload).await);
            assert!(!server.stream(ChannelId(99), payload).await);
        });
    }
}
