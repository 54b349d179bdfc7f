//! "Packaged" UDP: a fragmentation layer that lets a single logical message exceed one
//!  datagram's practical size limit. The sender splits a payload into a numbered sequence of
//!  fragments sharing a message id; the receiver reassembles them, in any arrival order, back
//!  into the original payload.
//!
//! This layer provides at-most-once, best-effort delivery of whole messages. It guarantees
//!  neither ordering between distinct messages nor delivery at all - those properties belong to
//!  a higher layer if anyone needs them.

pub mod fragment;
pub mod packaged;

pub use packaged::{PackagedMessageHandler, PackagedUdpSender, PackagedUdpTransport, Reassembler};

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Implementation ceiling for one packaged datagram, including the fragment header.
pub const MAX_PACKAGE_SIZE_CEILING: usize = 256 * 1024;

/// Largest UDP payload that fits a single IPv4 datagram.
const MAX_UDP_PAYLOAD: usize = 65507;

/// Abstraction for one bound, unreliable datagram socket, introduced to facilitate mocking the
///  I/O part away for testing.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatagramSocket: Send + Sync + 'static {
    /// Fire-and-forget send of one datagram; a failure is logged and reported, never retried.
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> bool;

    fn local_addr(&self) -> SocketAddr;

    /// The largest datagram payload this socket can carry.
    fn max_datagram_size(&self) -> usize;
}

#[async_trait]
impl DatagramSocket for Arc<UdpSocket> {
    async fn send_datagram(&self, to: SocketAddr, buf: &[u8]) -> bool {
        trace!("UDP socket: sending datagram of {} bytes to {:?}", buf.len(), to);

        match self.send_to(buf, to).await {
            Ok(_) => true,
            Err(e) => {
                error!("error sending UDP datagram to {:?}: {}", to, e);
                false
            }
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref().local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    fn max_datagram_size(&self) -> usize {
        MAX_UDP_PAYLOAD
    }
}
