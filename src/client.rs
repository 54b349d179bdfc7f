//! The client counterpart of the streaming server: one control connection for the command
//!  protocol, one packaged UDP endpoint receiving the stream payloads.
//!
//! The client is request/response driven; each command gets a fresh session id and the caller
//!  is blocked until the correlated response arrives or the response timeout strikes. Pushes
//!  from the server (`changeddatatype`, `disconnect`) are acknowledged by the background read
//!  task without caller involvement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::frame::{build_command, build_response, Frame};
use crate::protocol::tokens::{Command, CHANNEL_LIST_SEPARATOR};
use crate::session::queue::{MessageQueue, DEFAULT_MAX_AGE};
use crate::transport::packaged::DEFAULT_REASSEMBLY_TIMEOUT;
use crate::transport::{PackagedMessageHandler, PackagedUdpTransport};

/// capacity of the channel buffering reassembled payloads for the consumer
const PAYLOAD_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// how long a request waits for the server's response
    pub response_timeout: Duration,
    /// how long incomplete fragmented payloads are kept before being discarded
    pub reassembly_timeout: Duration,
    /// retention age of the response correlation queue, see [MessageQueue]
    pub message_retention_age: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            response_timeout: Duration::from_secs(2),
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            message_retention_age: DEFAULT_MAX_AGE,
        }
    }
}

/// state shared between the caller-facing API and the background read task
struct ClientShared {
    queue: MessageQueue,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    /// the data-type label of the selected channel, kept current by `changeddatatype` pushes
    data_type: std::sync::Mutex<String>,
}

impl ClientShared {
    async fn send_frame(&self, frame: &str) -> anyhow::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(&[0u8]).await?;
        Ok(())
    }

    async fn acknowledge(&self, command: Command, frame: &Frame) {
        match build_response(command.positive_response(), "", frame.session_id) {
            Ok(response) => {
                if let Err(e) = self.send_frame(&response).await {
                    error!("error acknowledging {:?} push: {}", command, e);
                }
            }
            Err(e) => error!("error building acknowledgement for {:?}: {}", command, e),
        }
    }
}

struct PayloadForwarder {
    sender: mpsc::Sender<Vec<u8>>,
}
#[async_trait]
impl PackagedMessageHandler for PayloadForwarder {
    async fn handle_message(&self, payload: &[u8], _sender: SocketAddr) {
        if self.sender.send(payload.to_vec()).await.is_err() {
            debug!("dropping payload: the client was closed");
        }
    }
}

/// A connected streaming client. Commands are issued through the methods here; received stream
///  payloads are consumed via [StreamingClient::next_payload].
pub struct StreamingClient {
    config: ClientConfig,
    shared: Arc<ClientShared>,
    data_transport: Arc<PackagedUdpTransport>,
    payload_receiver: mpsc::Receiver<Vec<u8>>,
}

impl StreamingClient {
    /// Opens the control connection to the server and binds the UDP endpoint for stream data.
    ///  No protocol command is sent yet, that is what [StreamingClient::connect] is for.
    pub async fn open(server_addr: SocketAddr, config: ClientConfig) -> anyhow::Result<StreamingClient> {
        let control = TcpStream::connect(server_addr).await?;
        let (read_half, write_half) = control.into_split();

        let shared = Arc::new(ClientShared {
            queue: MessageQueue::new(config.message_retention_age),
            writer: tokio::sync::Mutex::new(write_half),
            data_type: std::sync::Mutex::new(String::new()),
        });

        let reader_shared = shared.clone();
        tokio::spawn(async move {
            Self::read_loop(reader_shared, read_half).await;
        });

        let local_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let data_transport = Arc::new(
            PackagedUdpTransport::bind(local_addr.parse()?).await?
                .with_reassembly_timeout(config.reassembly_timeout)
        );

        let (payload_sender, payload_receiver) = mpsc::channel(PAYLOAD_CHANNEL_CAPACITY);
        let recv_transport = data_transport.clone();
        tokio::spawn(async move {
            if let Err(e) = recv_transport.recv_loop(Arc::new(PayloadForwarder { sender: payload_sender })).await {
                warn!("stream data receive loop terminated: {}", e);
            }
        });

        info!("streaming client connected to {:?}, data endpoint {:?}", server_addr, data_transport.local_addr());
        Ok(StreamingClient {
            config,
            shared,
            data_transport,
            payload_receiver,
        })
    }

    async fn read_loop(shared: Arc<ClientShared>, mut read_half: OwnedReadHalf) {
        let mut pending = BytesMut::new();
        let mut chunk = [0u8; 4096];

        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == 0) {
                        let raw = pending.split_to(pos + 1);
                        Self::on_frame(&shared, &raw[..pos]).await;
                    }
                }
                Err(e) => {
                    debug!("read error on the control connection: {}", e);
                    break;
                }
            }
        }
        debug!("control connection to the server closed");
    }

    async fn on_frame(shared: &Arc<ClientShared>, raw: &[u8]) {
        let frame = match Frame::parse(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("dropping malformed frame from the server: {}", e);
                return;
            }
        };

        if frame.is_response {
            shared.queue.push(frame.session_id, frame.message, frame.value);
            return;
        }

        match Command::lookup(&frame.message) {
            Some(Command::ChangedDataType) => {
                info!("the selected channel's data type changed to {:?}", frame.value);
                *shared.data_type.lock().unwrap() = frame.value.clone();
                shared.acknowledge(Command::ChangedDataType, &frame).await;
            }
            Some(Command::Disconnect) => {
                info!("the server disconnected this client");
                shared.acknowledge(Command::Disconnect, &frame).await;
            }
            _ => warn!("unexpected command {:?} from the server", frame.message),
        }
    }

    /// Sends one command and waits for the correlated response, returning its
    ///  `(message, value)`.
    async fn request(&self, command: Command, value: &str) -> anyhow::Result<(String, String)> {
        let session_id = self.shared.queue.unique_id();
        let frame = build_command(command.as_str(), value, session_id)?;
        self.shared.send_frame(&frame).await?;

        self.shared.queue.pop_within(session_id, self.config.response_timeout).await
            .ok_or_else(|| anyhow!("timeout waiting for the server's response to {:?}", command))
    }

    /// [StreamingClient::request], failing unless the server answered positively. Returns the
    ///  response value.
    async fn request_expect(&self, command: Command, value: &str) -> anyhow::Result<String> {
        let (message, response_value) = self.request(command, value).await?;
        if message != command.positive_response() {
            if response_value.is_empty() {
                bail!("server rejected {:?} with {:?}", command, message);
            }
            bail!("server rejected {:?} with {:?}: {}", command, message, response_value);
        }
        Ok(response_value)
    }

    /// The protocol handshake; must succeed before anything else is negotiated.
    pub async fn connect(&self) -> anyhow::Result<()> {
        self.request_expect(Command::Connect, "").await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.request_expect(Command::Disconnect, "").await?;
        Ok(())
    }

    /// Tells the server the UDP port this client receives stream data on - the port of the
    ///  endpoint bound in [StreamingClient::open].
    pub async fn announce_client_port(&self) -> anyhow::Result<()> {
        let port = self.data_transport.local_addr().port();
        self.request_expect(Command::ClientPort, &port.to_string()).await?;
        Ok(())
    }

    /// Selects the channel to subscribe to; an empty name lets the server pick its first
    ///  registered channel.
    pub async fn select_channel(&self, name: &str) -> anyhow::Result<()> {
        self.request_expect(Command::Select, name).await?;
        Ok(())
    }

    /// Starts streaming; returns the channel's data type.
    pub async fn start(&self) -> anyhow::Result<String> {
        let data_type = self.request_expect(Command::Start, "").await?;
        *self.shared.data_type.lock().unwrap() = data_type.clone();
        Ok(data_type)
    }

    pub async fn pause(&self) -> anyhow::Result<()> {
        self.request_expect(Command::Pause, "").await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.request_expect(Command::Stop, "").await?;
        Ok(())
    }

    /// The names of all channels the server currently offers.
    pub async fn channels(&self) -> anyhow::Result<Vec<String>> {
        let value = self.request_expect(Command::Channels, "").await?;
        if value.is_empty() {
            return Ok(Vec::new());
        }
        Ok(value.split(CHANNEL_LIST_SEPARATOR).map(str::to_string).collect())
    }

    /// Queries the data type of the selected channel.
    pub async fn data_type(&self) -> anyhow::Result<String> {
        self.request_expect(Command::DataType, "").await
    }

    /// Queries the UDP port the server streams to this client from.
    pub async fn server_port(&self) -> anyhow::Result<u16> {
        let value = self.request_expect(Command::ServerPort, "").await?;
        Ok(value.parse()?)
    }

    /// The locally cached data-type label: set by [StreamingClient::start] and kept current by
    ///  the server's `changeddatatype` pushes. Empty before the first start.
    pub fn current_data_type(&self) -> String {
        self.shared.data_type.lock().unwrap().clone()
    }

    /// The local UDP port stream data arrives on.
    pub fn data_port(&self) -> u16 {
        self.data_transport.local_addr().port()
    }

    /// The next fully reassembled stream payload; None once the client is closed.
    pub async fn next_payload(&mut self) -> Option<Vec<u8>> {
        self.payload_receiver.recv().await
    }

    /// Stops the data receive loop and shuts the control connection down.
    pub async fn close(&self) {
        self.data_transport.cancel_recv_loop();
        if let Err(e) = self.shared.writer.lock().await.shutdown().await {
            debug!("error shutting down the control connection: {}", e);
        }
    }
}
