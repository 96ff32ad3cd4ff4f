//! A reliable, connection-oriented byte-stream transport (RUDP) on top of
//!  UDP, providing TCP-like semantics - ordered, reliable, full-duplex
//!  streams - over a best-effort datagram service.
//!
//! ## Design goals
//!
//! * Connection oriented: an explicit three-way handshake (SYN / SYN+ACK /
//!   ACK) establishes per-peer state on both sides, and an orderly FIN
//!   exchange tears it down
//! * The abstraction is a *byte stream*: user writes are chunked into
//!   MSS-sized data segments, re-assembled in order on the receiver, and
//!   presented through buffered reader/writer facades
//! * Reliability through a sliding send window with per-segment
//!   retransmission timers, bounded by a fixed outstanding-segment cap -
//!   there is no congestion control beyond that cap
//! * Cumulative acknowledgement of in-order receipt, delayed by a
//!   configurable timeout or forced after a configurable number of
//!   unacknowledged receipts
//! * Extended (selective) acknowledgement: out-of-order receipts are
//!   buffered and advertised in EAK segments so the sender can close the
//!   holes early instead of waiting for timeouts
//! * Keepalive through NUL segments that consume a sequence number, so a
//!   dead peer surfaces through the ordinary retransmission discipline
//! * One listening UDP socket per server, shared by all of its connections;
//!   a receive task demultiplexes inbound segments by peer address
//! * Connection parameters are negotiated by offer-and-accept: the client's
//!   SYN carries its profile, the server adopts it and echoes it back
//!
//! ## Header
//!
//! Segment header (inside a UDP datagram) - all numbers in network byte
//! order (BE):
//!
//! ```ascii
//!  0 1 2 3 4 5 6 7 8            15
//! +-+-+-+-+-+-+-+-+---------------+
//! |S|A|E|R|N|C| | |    Header     |
//! |Y|C|A|S|U|H|0|0|    Length     |
//! |N|K|K|T|L|K| | |               |
//! +-+-+-+-+-+-+-+-+---------------+
//! |  Sequence #   +   Ack Number  |
//! +---------------+---------------+
//! |            Checksum           |
//! +---------------+---------------+
//! ```
//!
//! Sequence and ack numbers are 8 bits with modulo-256 wrap-around; all
//! ordering uses the half-window convention (see [`seq::SequenceNumber`]).
//! The checksum field is reserved: written as zero, ignored on receipt.
//!
//! Segment kinds, dispatched by the flag byte:
//! * `SYN` - initiates a connection; carries the offered parameters in a
//!   16-byte block counted as part of the header
//! * `ACK` - header-only cumulative acknowledgement
//! * `EAK` - extended acknowledgement; lists out-of-order receipts after the
//!   header
//! * `RST` - abortive reset
//! * `NUL` - keepalive; consumes a sequence number
//! * `FIN` - orderly close; consumes a sequence number
//! * `DAT` - user payload after the header; always carries a cumulative ack
//!
//! ## Concurrency model
//!
//! Parallel tasks coordinating through bounded queues:
//! * one receive task per endpoint (the listening socket on the server, the
//!   connected socket on the client) - the sole reader of that socket,
//!   producing into per-connection inbound segment queues
//! * one engine task per connection consuming that queue and driving the
//!   state machine; all engine state sits behind a single per-connection
//!   async lock
//! * timer tasks (retransmission, keepalive, delayed ack) take the engine
//!   lock directly; lifecycle listeners are always invoked outside it
//! * user-facing `accept` / `read` / `write` / `close` may be called from
//!   arbitrary tasks and block on bounded queues - producers on full,
//!   consumers on empty - with cancellation via close

pub mod error;
pub mod events;
pub mod profile;
pub mod segment;
pub mod seq;
pub mod server;
pub mod socket;
pub mod stream;

mod closer;
mod connection;
mod send_socket;
mod timer;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
