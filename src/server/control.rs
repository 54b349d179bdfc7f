use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, trace, warn};

/// Transport-assigned id of one control connection.
pub type ConnectionId = u64;

/// The reliable control-connection boundary. The server core only ever sends whole frames to a
///  connection or closes it; accepting connections and reading data flow back through a
///  [ControlHandler].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlTransport: Send + Sync + 'static {
    /// Writes one frame on the given connection. Returns false if the connection is unknown or
    ///  the write failed.
    async fn send(&self, connection_id: ConnectionId, frame: &str) -> bool;

    async fn close(&self, connection_id: ConnectionId);
}

/// Decouples the control transport from what happens with accepted connections and received
///  frames. Passed around as an `Arc<dyn ...>`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlHandler: Send + Sync + 'static {
    async fn on_connection_accepted(&self, peer_addr: SocketAddr, connection_id: ConnectionId);

    /// One complete frame, without its NUL delimiter.
    async fn on_frame_received(&self, connection_id: ConnectionId, frame: &[u8]);

    /// The peer (or the transport) closed the connection. Fired exactly once per accepted
    ///  connection, after the last frame.
    async fn on_connection_closed(&self, connection_id: ConnectionId);
}

/// TCP implementation of the control transport: one listener, one read task per accepted
///  connection, frames delimited by a NUL byte on the wire.
pub struct TcpControlTransport {
    connections: Mutex<FxHashMap<ConnectionId, Arc<tokio::sync::Mutex<OwnedWriteHalf>>>>,
    connection_id_counter: AtomicU64,
    cancel_sender: broadcast::Sender<()>,
}

impl TcpControlTransport {
    pub fn new() -> TcpControlTransport {
        let (cancel_sender, _) = broadcast::channel(1);

        TcpControlTransport {
            connections: Mutex::new(FxHashMap::default()),
            connection_id_counter: AtomicU64::new(0),
            cancel_sender,
        }
    }

    /// Binds the listener and spawns the accept loop; returns the actual local address (useful
    ///  with a wildcard port).
    pub async fn listen(self: &Arc<Self>, local_addr: SocketAddr, handler: Arc<dyn ControlHandler>) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(local_addr).await?;
        let actual_addr = listener.local_addr()?;

        let this = self.clone();
        tokio::spawn(async move {
            this.accept_loop(listener, handler).await;
        });

        Ok(actual_addr)
    }

    pub fn shut_down(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error shutting down control listener");
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, handler: Arc<dyn ControlHandler>) {
        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("accepting control connections on {:?}", listener.local_addr());

        loop {
            tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, peer_addr)) => {
                            let connection_id = self.connection_id_counter.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!("accepted control connection {} from {:?}", connection_id, peer_addr);

                            let (read_half, write_half) = stream.into_split();
                            self.connections.lock().unwrap()
                                .insert(connection_id, Arc::new(tokio::sync::Mutex::new(write_half)));

                            handler.on_connection_accepted(peer_addr, connection_id).await;

                            let this = self.clone();
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                this.read_loop(read_half, connection_id, handler).await;
                            });
                        }
                        Err(e) => {
                            error!("error accepting control connection: {}", e);
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut read_half: OwnedReadHalf, connection_id: ConnectionId, handler: Arc<dyn ControlHandler>) {
        let mut pending = BytesMut::new();
        let mut chunk = [0u8; 4096];

        loop {
            match read_half.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == 0) {
                        let frame = pending.split_to(pos + 1);
                        handler.on_frame_received(connection_id, &frame[..pos]).await;
                    }
                }
                Err(e) => {
                    debug!("read error on control connection {}: {}", connection_id, e);
                    break;
                }
            }
        }

        self.connections.lock().unwrap()
            .remove(&connection_id);
        handler.on_connection_closed(connection_id).await;
    }
}

impl Default for TcpControlTransport {
    fn default() -> Self {
        TcpControlTransport::new()
    }
}

#[async_trait]
impl ControlTransport for TcpControlTransport {
    async fn send(&self, connection_id: ConnectionId, frame: &str) -> bool {
        let writer = self.connections.lock().unwrap()
            .get(&connection_id)
            .cloned();
        let Some(writer) = writer else {
            warn!("attempt to send a frame on unknown control connection {}", connection_id);
            return false;
        };

        let mut buf = BytesMut::with_capacity(frame.len() + 1);
        buf.put_slice(frame.as_bytes());
        buf.put_u8(0);

        let mut writer = writer.lock().await;
        match writer.write_all(&buf).await {
            Ok(()) => true,
            Err(e) => {
                error!("error sending frame on control connection {}: {}", connection_id, e);
                false
            }
        }
    }

    async fn close(&self, connection_id: ConnectionId) {
        let writer = self.connections.lock().unwrap()
            .remove(&connection_id);
        if let Some(writer) = writer {
            if let Err(e) = writer.lock().await.shutdown().await {
                debug!("error shutting down control connection {}: {}", connection_id, e);
            }
        }
    }
}
