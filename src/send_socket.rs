use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// Abstraction for sending a serialized segment on a datagram socket,
/// introduced to facilitate mocking the I/O part away for testing.
///
/// A server and all its child connections share one underlying socket;
/// `UdpSocket::send_to` takes `&self`, so sends need no extra serialization.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn do_send_segment(&self, to: SocketAddr, segment_buf: &[u8]);

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn do_send_segment(&self, to: SocketAddr, segment_buf: &[u8]) {
        trace!("UDP socket: sending segment to {:?}", to);

        if let Err(e) = self.send_to(segment_buf, to).await {
            error!("error sending UDP datagram to {:?}: {}", to, e);
        }
        //NB: a failed send is treated like a lost datagram - the
        //    retransmission discipline recovers or reports the failure
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }
}
