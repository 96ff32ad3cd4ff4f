use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{Result, RudpError};
use crate::events::StateListener;
use crate::profile::RudpProfile;
use crate::segment::Segment;
use crate::socket::RudpSocket;
use crate::timer::AbortOnDrop;

/// The backlog used when `bind` is given a backlog of zero or less.
const DEFAULT_BACKLOG_SIZE: usize = 50;

/// A listening RUDP endpoint: one datagram socket shared by all connections,
/// a receive task demultiplexing inbound segments by peer address, and a
/// bounded backlog of established connections awaiting [`accept`](Self::accept).
pub struct RudpListener {
    socket: Arc<UdpSocket>,
    shared: Arc<ListenerShared>,
    accept_rx: Mutex<mpsc::Receiver<Arc<Connection>>>,
    closed_tx: watch::Sender<bool>,
    recv_task: AbortOnDrop,
}

struct ListenerShared {
    /// inbound routing: peer address -> that connection's segment queue
    peer_table: StdMutex<FxHashMap<SocketAddr, mpsc::Sender<Segment>>>,
    /// accept timeout in ms; 0 means wait forever
    accept_timeout_ms: AtomicU64,
    closed_rx: watch::Receiver<bool>,
    profile: RudpProfile,
    /// user listeners attached to every new connection before its handshake
    user_listeners: StdMutex<Vec<Arc<dyn StateListener>>>,
}

impl ListenerShared {
    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }
}

/// Removes closed and failed connections from the routing table. Dropping the
/// table entry also drops the engine's inbound sender, letting the engine
/// task finish.
struct DeregisterListener {
    shared: Weak<ListenerShared>,
}

impl DeregisterListener {
    fn deregister(&self, peer: SocketAddr) {
        if let Some(shared) = self.shared.upgrade() {
            debug!("deregistering connection to {:?}", peer);
            shared.peer_table.lock().expect("peer table lock poisoned").remove(&peer);
        }
    }
}

impl StateListener for DeregisterListener {
    fn connection_closed(&self, peer: SocketAddr) {
        self.deregister(peer);
    }

    fn connection_failure(&self, peer: SocketAddr) {
        self.deregister(peer);
    }
}

impl RudpListener {
    /// Binds a listening endpoint on `addr` with the default backlog and
    /// profile.
    pub async fn bind(addr: SocketAddr) -> Result<RudpListener> {
        Self::bind_with(addr, 0, RudpProfile::default()).await
    }

    /// Binds a listening endpoint. A `backlog` of zero or less selects the
    /// default of 50. The backlog is a strict cap: once it is full, further
    /// connections finish their handshake but their engine task blocks until
    /// `accept` makes room.
    pub async fn bind_with(addr: SocketAddr, backlog: i32, profile: RudpProfile) -> Result<RudpListener> {
        let backlog = if backlog <= 0 { DEFAULT_BACKLOG_SIZE } else { backlog as usize };

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("listening on {:?} (backlog {})", socket.local_addr()?, backlog);

        let (accept_tx, accept_rx) = mpsc::channel(backlog);
        let (closed_tx, closed_rx) = watch::channel(false);
        let shared = Arc::new(ListenerShared {
            peer_table: StdMutex::new(FxHashMap::default()),
            accept_timeout_ms: AtomicU64::new(0),
            closed_rx,
            profile,
            user_listeners: StdMutex::new(Vec::new()),
        });

        let recv_task = AbortOnDrop::new(tokio::spawn(Self::recv_loop(
            socket.clone(),
            shared.clone(),
            accept_tx,
        )));

        Ok(RudpListener {
            socket,
            shared,
            accept_rx: Mutex::new(accept_rx),
            closed_tx,
            recv_task,
        })
    }

    /// The endpoint's receive task: the sole reader of the listening socket.
    /// Routes segments to their engine by source address; a SYN from an
    /// unknown peer creates a new engine.
    async fn recv_loop(
        socket: Arc<UdpSocket>,
        shared: Arc<ListenerShared>,
        accept_tx: mpsc::Sender<Arc<Connection>>,
    ) {
        info!("starting receive loop");

        let mut buf = [0u8; 65536];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    if shared.is_closed() {
                        break;
                    }
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id);

            let segment = match span.in_scope(|| Segment::parse(&buf, 0, len)) {
                Ok(segment) => segment,
                Err(_) => {
                    warn!("received unparsable segment from {:?}, dropping", from);
                    continue;
                }
            };

            Self::route_segment(&socket, &shared, &accept_tx, from, segment)
                .instrument(span)
                .await;
        }

        info!("receive loop finished");
    }

    async fn route_segment(
        socket: &Arc<UdpSocket>,
        shared: &Arc<ListenerShared>,
        accept_tx: &mpsc::Sender<Arc<Connection>>,
        from: SocketAddr,
        segment: Segment,
    ) {
        let known = shared
            .peer_table
            .lock()
            .expect("peer table lock poisoned")
            .get(&from)
            .cloned();

        let sender = match known {
            Some(sender) => sender,
            None => {
                if !matches!(segment, Segment::Syn { ack: None, .. }) || shared.is_closed() {
                    trace!("segment from unknown peer {:?} - dropping", from);
                    return;
                }

                debug!("initializing connection for {:?}", from);
                let (connection, sender) = Connection::new(
                    shared.profile.clone(),
                    from,
                    Arc::new(socket.clone()),
                    Some(accept_tx.clone()),
                );
                connection
                    .add_state_listener(Arc::new(DeregisterListener {
                        shared: Arc::downgrade(shared),
                    }))
                    .await;
                let user_listeners = shared
                    .user_listeners
                    .lock()
                    .expect("listener list lock poisoned")
                    .clone();
                for listener in user_listeners {
                    connection.add_state_listener(listener).await;
                }

                shared
                    .peer_table
                    .lock()
                    .expect("peer table lock poisoned")
                    .insert(from, sender.clone());
                sender
            }
        };

        // a full engine queue applies backpressure onto the receive task
        let _ = sender.send(segment).await;
    }

    /// Waits for an established connection. Honors the configured timeout
    /// (see [`set_timeout`](Self::set_timeout)); fails with
    /// [`RudpError::Closed`] once the listener is closed.
    pub async fn accept(&self) -> Result<RudpSocket> {
        if self.shared.is_closed() {
            return Err(RudpError::Closed);
        }
        let timeout_ms = self.shared.accept_timeout_ms.load(Ordering::Relaxed);
        let mut closed_rx = self.shared.closed_rx.clone();

        let mut accept_rx = self.accept_rx.lock().await;
        let recv = async {
            if timeout_ms == 0 {
                accept_rx.recv().await.ok_or(RudpError::Closed)
            } else {
                let timeout = Duration::from_millis(timeout_ms);
                match time::timeout(timeout, accept_rx.recv()).await {
                    Ok(Some(connection)) => Ok(connection),
                    Ok(None) => Err(RudpError::Closed),
                    Err(_) => Err(RudpError::Timeout(timeout)),
                }
            }
        };

        let connection = tokio::select! {
            _ = closed_rx.changed() => return Err(RudpError::Closed),
            result = recv => result?,
        };
        drop(accept_rx);

        RudpSocket::from_connection(connection, self.socket.local_addr()?, None).await
    }

    /// Registers a listener that is attached to every connection this
    /// listener creates, before the connection's handshake completes.
    pub fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.shared
            .user_listeners
            .lock()
            .expect("listener list lock poisoned")
            .push(listener);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn local_port(&self) -> Result<u16> {
        Ok(self.socket.local_addr()?.port())
    }

    /// Sets the accept timeout in ms; 0 means wait forever.
    pub fn set_timeout(&self, timeout_ms: u64) {
        self.shared.accept_timeout_ms.store(timeout_ms, Ordering::Relaxed);
    }

    pub fn get_timeout(&self) -> u64 {
        self.shared.accept_timeout_ms.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Closes the listener: ends the receive task, fails blocked and future
    /// `accept` calls, and closes connections still waiting in the backlog.
    /// Established connections already accepted are unaffected; the endpoint
    /// itself is released once the last of them deregisters.
    pub async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return; // already closed
        }
        self.recv_task.abort();

        let mut accept_rx = self.accept_rx.lock().await;
        while let Ok(connection) = accept_rx.try_recv() {
            debug!("closing backlogged connection to {:?}", connection.peer_addr());
            let _ = connection.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_backlog_default_applies() {
        let listener = RudpListener::bind_with(
            ([127, 0, 0, 1], 0).into(),
            -1,
            RudpProfile::default(),
        )
        .await
        .unwrap();
        assert!(listener.local_port().unwrap() > 0);
        listener.close().await;
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let listener = RudpListener::bind(([127, 0, 0, 1], 0).into()).await.unwrap();
        listener.set_timeout(50);
        assert_eq!(listener.get_timeout(), 50);

        match listener.accept().await {
            Err(RudpError::Timeout(d)) => assert_eq!(d, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
        listener.close().await;
    }

    #[tokio::test]
    async fn test_accept_fails_after_close() {
        let listener = RudpListener::bind(([127, 0, 0, 1], 0).into()).await.unwrap();
        listener.close().await;
        assert!(matches!(listener.accept().await, Err(RudpError::Closed)));
        assert!(listener.is_closed());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_accept() {
        let listener = Arc::new(RudpListener::bind(([127, 0, 0, 1], 0).into()).await.unwrap());

        let accepting = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.accept().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.close().await;
        let result = time::timeout(Duration::from_secs(1), accepting)
            .await
            .expect("close must wake the blocked accept")
            .unwrap();
        assert!(matches!(result, Err(RudpError::Closed)));
    }
}
