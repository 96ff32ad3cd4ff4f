use std::net::SocketAddr;

#[cfg(test)]
use mockall::automock;

/// Observer hooks for connection lifecycle events.
///
/// Listeners are invoked outside all engine locks. Close and failure
/// notifications run on the process-wide closing pool (see [`crate::closer`])
/// so a slow listener cannot stall the engine task.
#[cfg_attr(test, automock)]
pub trait StateListener: Send + Sync + 'static {
    /// Invoked when the connection is opened.
    fn connection_opened(&self, _peer: SocketAddr) {}

    /// Invoked when the connection is closed.
    fn connection_closed(&self, _peer: SocketAddr) {}

    /// Invoked when the (established) connection fails.
    fn connection_failure(&self, _peer: SocketAddr) {}
}
