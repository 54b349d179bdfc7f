use std::cmp::min;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rand::RngCore;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::transport::fragment::{fragment_count, FragmentHeader};
use crate::transport::{DatagramSocket, MAX_PACKAGE_SIZE_CEILING};

pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Send half of the packaged transport: splits payloads into fragments and fires them at a
///  receiver, best-effort, without retries.
pub struct PackagedUdpSender {
    socket: Arc<dyn DatagramSocket>,
    max_package_size: usize,
    message_id_counter: AtomicU64,
    send_errors: AtomicU64,
}

impl PackagedUdpSender {
    pub fn new(socket: Arc<dyn DatagramSocket>) -> anyhow::Result<PackagedUdpSender> {
        let max_package_size = min(socket.max_datagram_size(), MAX_PACKAGE_SIZE_CEILING);
        if max_package_size <= FragmentHeader::SERIALIZED_LEN {
            return Err(anyhow!(
                "maximal package size of {} bytes does not exceed the fragment header of {} bytes",
                max_package_size, FragmentHeader::SERIALIZED_LEN,
            ));
        }

        // the message-id counter is seeded randomly so ids from a restarted sender do not
        //  collide with partials the receiver may still be holding
        Ok(PackagedUdpSender {
            socket,
            max_package_size,
            message_id_counter: AtomicU64::new(rand::thread_rng().next_u64()),
            send_errors: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn max_package_size(&self) -> usize {
        self.max_package_size
    }

    /// Payload bytes that fit one fragment.
    pub fn payload_capacity(&self) -> usize {
        self.max_package_size - FragmentHeader::SERIALIZED_LEN
    }

    /// Number of fragment sends that failed so far.
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Sends `payload` to `to` as one fragment if it fits, otherwise as a back-to-back sequence
    ///  of fragments sharing a freshly allocated message id. Per-fragment failures are logged
    ///  and counted; the result is false only if every fragment send failed.
    pub async fn send(&self, to: SocketAddr, payload: &[u8]) -> bool {
        let capacity = self.payload_capacity();
        let count = fragment_count(payload.len(), capacity);
        let message_id = self.message_id_counter.fetch_add(1, Ordering::Relaxed);

        trace!("sending {} bytes to {:?} as {} fragment(s), message id {}", payload.len(), to, count, message_id);

        let mut any_sent = false;
        for index in 0..count {
            let offset = index as usize * capacity;
            let chunk = &payload[offset..min(offset + capacity, payload.len())];

            let mut buf = BytesMut::with_capacity(FragmentHeader::SERIALIZED_LEN + chunk.len());
            FragmentHeader {
                message_id,
                index,
                count,
            }.ser(&mut buf);
            buf.put_slice(chunk);

            if self.socket.send_datagram(to, &buf).await {
                any_sent = true;
            }
            else {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("dropped fragment {}/{} of message {} to {:?}", index, count, message_id, to);
            }
        }

        any_sent
    }
}

struct Partial {
    fragments: Vec<Option<Vec<u8>>>,
    num_received: u32,
    deadline: Instant,
}

/// Receive-side reassembly buffer. Fragments are keyed by `(sender, message id)`; a message is
///  delivered exactly once when all its fragments have arrived, in whatever order. Partials that
///  do not complete within the reassembly timeout are discarded without notice - consistent with
///  the connectionless transport underneath.
pub struct Reassembler {
    timeout: Duration,
    partials: FxHashMap<(SocketAddr, u64), Partial>,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Reassembler {
        Reassembler {
            timeout,
            partials: FxHashMap::default(),
        }
    }

    /// Feeds one received datagram into the buffer, returning the reassembled payload if this
    ///  fragment completed a message. Unparsable fragments, duplicates and fragments whose count
    ///  disagrees with the partial on record are dropped.
    pub fn on_fragment(&mut self, from: SocketAddr, datagram: &[u8]) -> Option<Vec<u8>> {
        let mut buf = datagram;
        let header = match FragmentHeader::try_deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                warn!("received an unparsable fragment from {:?} - dropping: {}", from, e);
                return None;
            }
        };

        self.evict_expired();

        if header.count == 1 {
            return Some(buf.to_vec());
        }

        let key = (from, header.message_id);
        let partial = self.partials.entry(key)
            .or_insert_with(|| Partial {
                fragments: vec![None; header.count as usize],
                num_received: 0,
                deadline: Instant::now() + self.timeout,
            });

        if partial.fragments.len() != header.count as usize {
            warn!("fragment count mismatch for message {} from {:?} - dropping fragment", header.message_id, from);
            return None;
        }
        let slot = &mut partial.fragments[header.index as usize];
        if slot.is_some() {
            debug!("duplicate fragment {} of message {} from {:?} - dropping", header.index, header.message_id, from);
            return None;
        }

        *slot = Some(buf.to_vec());
        partial.num_received += 1;

        if partial.num_received < header.count {
            return None;
        }

        let partial = self.partials.remove(&key)
            .expect("completed partial is on record");

        let mut payload = Vec::new();
        for fragment in partial.fragments {
            payload.extend_from_slice(&fragment.expect("all fragments of a completed message are present"));
        }
        trace!("reassembled message {} of {} bytes from {:?}", header.message_id, payload.len(), from);
        Some(payload)
    }

    /// Number of incomplete messages currently buffered.
    pub fn num_partials(&self) -> usize {
        self.partials.len()
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        self.partials.retain(|(from, message_id), partial| {
            let keep = partial.deadline > now;
            if !keep {
                debug!("discarding incomplete message {} from {:?} after reassembly timeout", message_id, from);
            }
            keep
        });
    }
}

/// Gets handed every fully reassembled payload from [PackagedUdpTransport::recv_loop].
///
/// It is passed around as an `Arc<dyn ...>` to decouple payload handling from the transport.
#[async_trait]
pub trait PackagedMessageHandler: Sync + Send {
    async fn handle_message(&self, payload: &[u8], sender: SocketAddr);
}

/// One bound UDP socket with the fragmentation layer on top: arbitrary-size payloads out via
///  [PackagedUdpSender], reassembled payloads in via [PackagedUdpTransport::recv_loop].
pub struct PackagedUdpTransport {
    socket: Arc<UdpSocket>,
    sender: PackagedUdpSender,
    reassembly_timeout: Duration,
    cancel_sender: broadcast::Sender<()>,
}

impl PackagedUdpTransport {
    pub async fn bind(local_addr: SocketAddr) -> anyhow::Result<PackagedUdpTransport> {
        let (cancel_sender, _) = broadcast::channel(1);

        let socket = Arc::new(UdpSocket::bind(local_addr).await?);
        let sender = PackagedUdpSender::new(Arc::new(socket.clone()))?;

        Ok(PackagedUdpTransport {
            socket,
            sender,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            cancel_sender,
        })
    }

    pub fn with_reassembly_timeout(mut self, timeout: Duration) -> PackagedUdpTransport {
        self.reassembly_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sender.local_addr()
    }

    pub fn sender(&self) -> &PackagedUdpSender {
        &self.sender
    }

    pub async fn send(&self, to: SocketAddr, payload: &[u8]) -> bool {
        self.sender.send(to, payload).await
    }

    /// Receives datagrams until cancelled, reassembling fragments and handing every completed
    ///  payload to `handler`.
    pub async fn recv_loop(&self, handler: Arc<dyn PackagedMessageHandler>) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.sender.max_package_size()];
        let mut reassembler = Reassembler::new(self.reassembly_timeout);

        let mut cancel_receiver = self.cancel_sender.subscribe();

        trace!("starting packaged UDP receive loop on {:?}", self.local_addr());

        loop {
            tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok((len, from)) => {
                            if let Some(payload) = reassembler.on_fragment(from, &buf[..len]) {
                                handler.handle_message(&payload, from).await;
                            }
                        }
                        Err(e) => {
                            error!(error = ?e, "error receiving from datagram socket");
                            return Err(e.into());
                        }
                    }
                }
                _ = cancel_receiver.recv() => break,
            }
        }

        Ok(())
    }

    pub fn cancel_recv_loop(&self) {
        if let Err(err) = self.cancel_sender.send(()) {
            warn!(?err, "error cancelling receive loop");
        }
    }
}
