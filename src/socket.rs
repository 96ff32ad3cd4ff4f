use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};

use crate::connection::Connection;
use crate::error::{Result, RudpError};
use crate::events::StateListener;
use crate::profile::RudpProfile;
use crate::segment::Segment;
use crate::stream::{RudpReader, RudpWriter};
use crate::timer::AbortOnDrop;

/// A reliable, connection-oriented socket over UDP.
///
/// Obtained either by [`RudpSocket::connect`] (client side) or from
/// [`crate::server::RudpListener::accept`] (server side). Reading and writing
/// go through the buffered stream adapters, directly via [`read`](Self::read)
/// / [`write`](Self::write) or as owned halves via
/// [`into_split`](Self::into_split).
pub struct RudpSocket {
    connection: Arc<Connection>,
    reader: Option<RudpReader>,
    writer: Option<RudpWriter>,
    local_addr: SocketAddr,
    profile: RudpProfile,
}

impl RudpSocket {
    /// Connects to `peer` with the default profile, blocking until the
    /// handshake completes or fails.
    pub async fn connect(peer: SocketAddr) -> Result<RudpSocket> {
        Self::connect_with(peer, RudpProfile::default()).await
    }

    /// Connects to `peer`, offering the parameters of `profile` in the SYN.
    pub async fn connect_with(peer: SocketAddr, profile: RudpProfile) -> Result<RudpSocket> {
        Self::connect_with_listeners(peer, profile, Vec::new()).await
    }

    /// Like [`connect_with`](Self::connect_with), with listeners registered
    /// before the handshake starts so they observe the open notification.
    pub async fn connect_with_listeners(
        peer: SocketAddr,
        profile: RudpProfile,
        listeners: Vec<Arc<dyn StateListener>>,
    ) -> Result<RudpSocket> {
        let bind_addr: SocketAddr = if peer.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound client socket to {:?}, connecting to {:?}", local_addr, peer);

        let (connection, segment_tx) = Connection::new(profile, peer, Arc::new(socket.clone()), None);
        for listener in listeners {
            connection.add_state_listener(listener).await;
        }
        let recv_task = Arc::new(AbortOnDrop::new(tokio::spawn(recv_loop(
            socket, peer, segment_tx,
        ))));

        connection.connect().await?;
        Self::from_connection(connection, local_addr, Some(recv_task)).await
    }

    /// Wraps an established engine in the user-facing socket. Used by the
    /// client path above and by the listener's `accept`.
    pub(crate) async fn from_connection(
        connection: Arc<Connection>,
        local_addr: SocketAddr,
        io_task: Option<Arc<AbortOnDrop>>,
    ) -> Result<RudpSocket> {
        let profile = connection.profile_snapshot().await;
        let delivery_rx = connection.take_delivery_rx().ok_or(RudpError::Closed)?;

        let reader = RudpReader::new(connection.clone(), delivery_rx, io_task.clone());
        let writer = RudpWriter::new(
            connection.clone(),
            profile.max_payload_len() * profile.max_send_queue_size() as usize,
            profile.max_payload_len(),
            io_task,
        );

        Ok(RudpSocket {
            connection,
            reader: Some(reader),
            writer: Some(writer),
            local_addr,
            profile,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The size of the write adapter's buffer in bytes.
    pub fn send_buffer_size(&self) -> usize {
        self.profile.max_payload_len() * self.profile.max_send_queue_size() as usize
    }

    /// The size of the reassembly buffer in bytes.
    pub fn receive_buffer_size(&self) -> usize {
        self.profile.max_payload_len() * self.profile.max_recv_queue_size() as usize
    }

    /// The profile negotiated during the handshake.
    pub fn profile(&self) -> &RudpProfile {
        &self.profile
    }

    pub async fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.connection.add_state_listener(listener).await;
    }

    /// Splits the socket into its owned read and write halves.
    pub fn into_split(mut self) -> (RudpReader, RudpWriter) {
        let reader = self.reader.take().expect("reader half already taken");
        let writer = self.writer.take().expect("writer half already taken");
        (reader, writer)
    }

    /// See [`RudpReader::read`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.reader.as_mut().ok_or(RudpError::Closed)?.read(buf).await
    }

    /// See [`RudpWriter::write`].
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.writer.as_mut().ok_or(RudpError::Closed)?.write(data).await
    }

    /// See [`RudpWriter::flush`].
    pub async fn flush(&mut self) -> Result<()> {
        self.writer.as_mut().ok_or(RudpError::Closed)?.flush().await
    }

    /// Shuts down the input direction only.
    pub async fn shutdown_input(&self) {
        self.connection.shutdown_input().await;
    }

    /// Flushes pending writes and shuts down the output direction only.
    pub async fn shutdown_output(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        self.connection.shutdown_output().await
    }

    /// Orderly close of the connection. Pending writes are flushed first.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            // best effort: the connection may already be past writing
            if let Err(e) = writer.flush().await {
                trace!("flush during close failed: {}", e);
            }
        }
        self.connection.close().await
    }
}

/// The client's receive task: the sole reader of the client socket, feeding
/// the connection's inbound segment queue.
async fn recv_loop(socket: Arc<UdpSocket>, peer: SocketAddr, tx: mpsc::Sender<Segment>) {
    let mut buf = [0u8; 65536];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };
        if from != peer {
            trace!("datagram from unexpected peer {:?} - dropping", from);
            continue;
        }
        let segment = match Segment::parse(&buf, 0, len) {
            Ok(segment) => segment,
            Err(_) => {
                warn!("received unparsable segment from {:?}, dropping", from);
                continue;
            }
        };
        if tx.send(segment).await.is_err() {
            // engine gone: the socket was dropped
            break;
        }
    }
}
