use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::closer;
use crate::error::{Result, RudpError};
use crate::events::StateListener;
use crate::profile::RudpProfile;
use crate::segment::{Segment, SynParams};
use crate::seq::SequenceNumber;
use crate::send_socket::SendSocket;
use crate::timer::{self, TimerHandle, TimerTick};

/// Capacity of the inbound segment queue between the receive task and the
/// engine task.
const INBOUND_SEGMENT_QUEUE: usize = 64;

/// The connection state machine's states.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum State {
    Closed,
    SynSent,
    SynRcvd,
    Established,
    CloseWait,
}

/// Why delivery to the reader ended.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum CloseReason {
    Orderly,
    Failure,
}

/// How the reader should report the end of the stream.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum EndOfStream {
    Orderly,
    Error,
}

/// Lifecycle notifications produced by the engine, fired outside its lock.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum ConnectionEvent {
    Opened,
    Closed,
    Failure,
}

/// Invokes the listeners for `event`. Open notifications run on the caller;
/// close and failure notifications are handed to the closing pool so a slow
/// listener cannot stall the engine or a timer task.
pub(crate) fn fire_lifecycle_event(
    listeners: &[Arc<dyn StateListener>],
    peer: SocketAddr,
    event: ConnectionEvent,
) {
    for listener in listeners {
        let listener = listener.clone();
        match event {
            ConnectionEvent::Opened => listener.connection_opened(peer),
            ConnectionEvent::Closed => closer::execute(move || listener.connection_closed(peer)),
            ConnectionEvent::Failure => closer::execute(move || listener.connection_failure(peer)),
        }
    }
}

/// A sent, sequenced segment awaiting acknowledgement.
struct Outstanding {
    segment: Segment,
    retransmit_counter: u8,
    /// aborted when the entry is dropped
    _timer: TimerHandle,
}

enum DeliveryOutcome {
    Delivered,
    BufferFull(Vec<u8>),
}

enum CloseProgress {
    Done(Vec<ConnectionEvent>),
    WaitForWindow,
}

enum RetransmitOutcome {
    Continue,
    Done,
    Failed,
}

pub(crate) struct ConnectionInner {
    me: Weak<Mutex<ConnectionInner>>,
    profile: RudpProfile,
    state: State,
    state_tx: watch::Sender<State>,
    close_reason: Option<CloseReason>,
    /// open/close/failure has been delivered to the listeners
    lifecycle_notified: bool,
    peer_addr: SocketAddr,
    send_socket: Arc<dyn SendSocket>,
    listeners: Vec<Arc<dyn StateListener>>,

    // send side
    send_next: SequenceNumber,
    unacked_sent: VecDeque<Outstanding>,
    window_notify: Arc<Notify>,
    last_sequenced_send: Instant,
    fin_sent: bool,
    output_shutdown: bool,

    // receive side
    recv_next: SequenceNumber,
    out_of_seq: Vec<(SequenceNumber, Vec<u8>)>,
    pending_fin: Option<SequenceNumber>,
    out_of_seq_counter: u8,
    unacked_recv_counter: u8,
    delivery_tx: Option<mpsc::Sender<Vec<u8>>>,
    input_shutdown: bool,

    null_timer: Option<TimerHandle>,
    cum_ack_timer: Option<TimerHandle>,
    linger_timer: Option<TimerHandle>,
}

impl ConnectionInner {
    fn next_seq(&mut self) -> SequenceNumber {
        let seq = self.send_next;
        self.send_next = seq.next();
        seq
    }

    fn cumulative_ack(&self) -> SequenceNumber {
        self.recv_next.prev()
    }

    fn set_state(&mut self, state: State) {
        trace!("connection to {:?}: {:?} -> {:?}", self.peer_addr, self.state, state);
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Sends a sequenced segment and places it on the outstanding queue with
    /// its retransmission timer armed. The caller must have checked the
    /// outstanding-segment cap.
    async fn transmit_sequenced(&mut self, segment: Segment) {
        debug_assert!(self.unacked_sent.len() < self.profile.max_outstanding_segs() as usize);

        trace!("sending {} to {:?}", segment, self.peer_addr);
        let buf = segment.to_bytes();
        self.send_socket.do_send_segment(self.peer_addr, &buf).await;
        self.last_sequenced_send = Instant::now();

        if segment.ack().is_some() {
            self.on_ack_piggybacked();
        }

        let timer = spawn_retransmit_timer(
            self.me.clone(),
            segment.seq(),
            Duration::from_millis(self.profile.retransmission_timeout() as u64),
        );
        self.unacked_sent.push_back(Outstanding {
            segment,
            retransmit_counter: 0,
            _timer: timer,
        });
    }

    /// Sends a segment that does not consume a sequence number (ACK, EAK,
    /// RST). A carried ack satisfies the pending cumulative-ack obligation.
    async fn send_unsequenced(&mut self, segment: Segment) {
        trace!("sending {} to {:?}", segment, self.peer_addr);
        let buf = segment.to_bytes();
        self.send_socket.do_send_segment(self.peer_addr, &buf).await;

        if segment.ack().is_some() {
            self.on_ack_piggybacked();
        }
    }

    fn on_ack_piggybacked(&mut self) {
        self.unacked_recv_counter = 0;
        if let Some(timer) = self.cum_ack_timer.take() {
            timer.cancel();
        }
    }

    async fn send_ack(&mut self) {
        let ack = Segment::Ack {
            seq: self.send_next,
            ack: self.cumulative_ack(),
        };
        self.send_unsequenced(ack).await;
    }

    async fn send_eak(&mut self) {
        let mut listed: Vec<SequenceNumber> =
            self.out_of_seq.iter().map(|(seq, _)| *seq).collect();
        if let Some(fin_seq) = self.pending_fin {
            listed.push(fin_seq);
        }
        listed.sort_by_key(|seq| seq.distance_from(self.recv_next));

        let eak = Segment::Eak {
            seq: self.send_next,
            ack: self.cumulative_ack(),
            out_of_seq: listed,
        };
        self.send_unsequenced(eak).await;
        self.out_of_seq_counter = 0;
    }

    fn arm_cumulative_ack_timer(&mut self) {
        if self.cum_ack_timer.is_some() {
            return;
        }
        let me = self.me.clone();
        let delay = Duration::from_millis(self.profile.cumulative_ack_timeout() as u64);
        self.cum_ack_timer = Some(timer::schedule_once(delay, async move {
            if let Some(inner) = me.upgrade() {
                inner.lock().await.on_cumulative_ack_timeout().await;
            }
        }));
    }

    async fn on_cumulative_ack_timeout(&mut self) {
        self.cum_ack_timer = None;
        if !matches!(self.state, State::Established | State::CloseWait) {
            return;
        }
        if !self.out_of_seq.is_empty() || self.pending_fin.is_some() {
            self.send_eak().await;
        } else if self.unacked_recv_counter > 0 {
            self.send_ack().await;
        }
    }

    fn arm_null_timer(&mut self) {
        let timeout = self.profile.null_segment_timeout();
        if timeout == 0 {
            return; // keepalive disabled
        }
        let period = Duration::from_millis(timeout as u64);
        let me = self.me.clone();
        self.null_timer = Some(timer::schedule_repeating(period, move || {
            let me = me.clone();
            async move {
                let Some(inner) = me.upgrade() else {
                    return TimerTick::Stop;
                };
                let result = inner.lock().await.on_null_timeout(period).await;
                result
            }
        }));
    }

    async fn on_null_timeout(&mut self, period: Duration) -> TimerTick {
        if self.state != State::Established {
            return TimerTick::Stop;
        }
        let idle = self.unacked_sent.is_empty()
            && self.last_sequenced_send.elapsed() >= period
            && !self.output_shutdown;
        if idle {
            debug!("idle for {:?} - sending keepalive to {:?}", period, self.peer_addr);
            let seq = self.next_seq();
            let nul = Segment::Nul {
                seq,
                ack: Some(self.cumulative_ack()),
            };
            self.transmit_sequenced(nul).await;
        }
        TimerTick::Continue
    }

    fn arm_linger_timer(&mut self) {
        if self.linger_timer.is_some() {
            return;
        }
        // the close linger: one keepalive interval, or one retransmission
        // interval when the keepalive is disabled
        let ms = if self.profile.null_segment_timeout() > 0 {
            self.profile.null_segment_timeout()
        } else {
            self.profile.retransmission_timeout()
        };
        let me = self.me.clone();
        self.linger_timer = Some(timer::schedule_once(Duration::from_millis(ms as u64), async move {
            let Some(inner) = me.upgrade() else {
                return;
            };
            let (event, listeners, peer) = {
                let mut inner = inner.lock().await;
                let event = if inner.state == State::CloseWait {
                    debug!("close linger expired for {:?}", inner.peer_addr);
                    inner.finalize_close()
                } else {
                    None
                };
                (event, inner.listeners.clone(), inner.peer_addr)
            };
            if let Some(event) = event {
                fire_lifecycle_event(&listeners, peer, event);
            }
        }));
    }

    fn cancel_timers(&mut self) {
        for timer in [
            self.null_timer.take(),
            self.cum_ack_timer.take(),
            self.linger_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            timer.cancel();
        }
    }

    /// Tears the connection down after an orderly close. Returns the Closed
    /// event unless the lifecycle end was already announced.
    fn finalize_close(&mut self) -> Option<ConnectionEvent> {
        if self.state == State::Closed {
            return None;
        }
        self.set_state(State::Closed);
        self.close_reason.get_or_insert(CloseReason::Orderly);
        self.delivery_tx = None;
        self.unacked_sent.clear();
        self.cancel_timers();
        self.window_notify.notify_waiters();

        if self.lifecycle_notified {
            None
        } else {
            self.lifecycle_notified = true;
            Some(ConnectionEvent::Closed)
        }
    }

    /// Tears the connection down after a protocol failure (reset received or
    /// retransmission discipline exhausted). The failure is announced at most
    /// once.
    fn begin_failure(&mut self) -> Option<ConnectionEvent> {
        if self.state == State::Closed {
            return None;
        }
        self.set_state(State::Closed);
        self.close_reason = Some(CloseReason::Failure);
        self.delivery_tx = None;
        self.unacked_sent.clear();
        self.cancel_timers();
        self.window_notify.notify_waiters();

        if self.lifecycle_notified {
            None
        } else {
            self.lifecycle_notified = true;
            Some(ConnectionEvent::Failure)
        }
    }

    fn enter_established(&mut self) -> ConnectionEvent {
        self.set_state(State::Established);
        self.arm_null_timer();
        ConnectionEvent::Opened
    }

    /// Client side: send the SYN and start waiting for the counterpart.
    async fn start_connect(&mut self) {
        debug_assert_eq!(self.state, State::Closed);
        let seq = self.next_seq();
        let syn = Segment::Syn {
            seq,
            ack: None,
            params: SynParams::from_profile(&self.profile),
        };
        self.transmit_sequenced(syn).await;
        self.set_state(State::SynSent);
    }

    /// Removes every outstanding segment covered by the cumulative ack and
    /// wakes producers blocked on the window. May complete a pending close.
    fn process_ack(&mut self, ack: SequenceNumber) -> Vec<ConnectionEvent> {
        let before = self.unacked_sent.len();
        self.unacked_sent
            .retain(|outstanding| !outstanding.segment.seq().is_at_or_before(ack));
        if self.unacked_sent.len() != before {
            trace!("ack {} cleared {} outstanding segment(s)", ack, before - self.unacked_sent.len());
            self.window_notify.notify_waiters();
        }

        if self.state == State::CloseWait && self.fin_sent && self.unacked_sent.is_empty() {
            return self.finalize_close().into_iter().collect();
        }
        vec![]
    }

    /// Extended-ack handling beyond the cumulative part: drop the listed
    /// segments, then eagerly retransmit the surviving holes below the newest
    /// listed sequence.
    async fn process_eak(&mut self, ack: SequenceNumber, listed: &[SequenceNumber]) {
        let before = self.unacked_sent.len();
        self.unacked_sent
            .retain(|outstanding| !listed.contains(&outstanding.segment.seq()));
        if self.unacked_sent.len() != before {
            self.window_notify.notify_waiters();
        }

        let Some(&newest) = listed.iter().max_by_key(|seq| seq.distance_from(ack)) else {
            return;
        };
        let resend: Vec<_> = self
            .unacked_sent
            .iter()
            .filter(|outstanding| outstanding.segment.seq().is_before(newest))
            .map(|outstanding| outstanding.segment.to_bytes())
            .collect();
        for buf in resend {
            debug!("retransmitting hole below {} to {:?}", newest, self.peer_addr);
            self.send_socket.do_send_segment(self.peer_addr, &buf).await;
        }
    }

    fn try_deliver(&mut self, payload: Vec<u8>) -> DeliveryOutcome {
        let Some(tx) = &self.delivery_tx else {
            // input direction shut down: consume and discard
            return DeliveryOutcome::Delivered;
        };
        match tx.try_send(payload) {
            Ok(()) => DeliveryOutcome::Delivered,
            Err(TrySendError::Full(payload)) => DeliveryOutcome::BufferFull(payload),
            Err(TrySendError::Closed(_)) => {
                self.delivery_tx = None;
                DeliveryOutcome::Delivered
            }
        }
    }

    /// Advances `recv_next` past a consumed in-order segment, then drains
    /// contiguous successors from the out-of-sequence set. Stops at a gap, a
    /// full reassembly buffer, or a pending FIN that has become in-order.
    async fn advance_and_drain(&mut self) -> Vec<ConnectionEvent> {
        self.recv_next = self.recv_next.next();
        loop {
            if self.pending_fin == Some(self.recv_next) {
                self.pending_fin = None;
                return self.process_in_order_fin().await;
            }
            let Some(idx) = self
                .out_of_seq
                .iter()
                .position(|(seq, _)| *seq == self.recv_next)
            else {
                return vec![];
            };
            let (_, payload) = self.out_of_seq.remove(idx);
            match self.try_deliver(payload) {
                DeliveryOutcome::Delivered => {
                    self.recv_next = self.recv_next.next();
                }
                DeliveryOutcome::BufferFull(payload) => {
                    self.out_of_seq.push((self.recv_next, payload));
                    return vec![];
                }
            }
        }
    }

    /// Cumulative-ack bookkeeping after an in-order receipt: force an ACK
    /// once enough receipts pile up, otherwise leave it to the delayed-ack
    /// timer.
    async fn register_in_order_receipt(&mut self) {
        self.unacked_recv_counter = self.unacked_recv_counter.saturating_add(1);
        if self.unacked_recv_counter >= self.profile.max_cumulative_acks() {
            self.send_ack().await;
        } else {
            self.arm_cumulative_ack_timer();
        }
    }

    /// Out-of-sequence bookkeeping: force an EAK once enough out-of-order
    /// segments pile up.
    async fn register_out_of_order_receipt(&mut self) {
        self.out_of_seq_counter = self.out_of_seq_counter.saturating_add(1);
        if self.out_of_seq_counter >= self.profile.max_out_of_sequence() {
            self.send_eak().await;
        } else {
            self.arm_cumulative_ack_timer();
        }
    }

    async fn handle_dat(&mut self, seq: SequenceNumber, payload: Vec<u8>) -> Vec<ConnectionEvent> {
        if seq == self.recv_next {
            match self.try_deliver(payload) {
                DeliveryOutcome::Delivered => {
                    let events = self.advance_and_drain().await;
                    self.register_in_order_receipt().await;
                    events
                }
                DeliveryOutcome::BufferFull(_) => {
                    // no ack advance: the peer retransmits once the reader
                    // has drained the backlog
                    debug!("reassembly buffer full - dropping segment #{} from {:?}", seq, self.peer_addr);
                    vec![]
                }
            }
        } else if self.recv_next.is_before(seq) {
            trace!("out-of-sequence segment #{} (expecting #{})", seq, self.recv_next);
            if !self.out_of_seq.iter().any(|(s, _)| *s == seq) {
                if self.out_of_seq.len() < self.profile.max_recv_queue_size() as usize {
                    self.out_of_seq.push((seq, payload));
                } else {
                    debug!("out-of-sequence buffer full - dropping segment #{}", seq);
                }
            }
            self.register_out_of_order_receipt().await;
            vec![]
        } else {
            debug!("duplicate segment #{} from {:?} - discarding, forcing an ack", seq, self.peer_addr);
            self.send_ack().await;
            vec![]
        }
    }

    async fn handle_nul(&mut self, seq: SequenceNumber) -> Vec<ConnectionEvent> {
        if seq == self.recv_next {
            let events = self.advance_and_drain().await;
            self.send_ack().await;
            events
        } else if self.recv_next.is_before(seq) {
            // a keepalive ahead of a gap still consumes its sequence number
            if !self.out_of_seq.iter().any(|(s, _)| *s == seq) {
                self.out_of_seq.push((seq, Vec::new()));
            }
            self.register_out_of_order_receipt().await;
            vec![]
        } else {
            self.send_ack().await;
            vec![]
        }
    }

    async fn process_in_order_fin(&mut self) -> Vec<ConnectionEvent> {
        self.recv_next = self.recv_next.next();
        self.send_ack().await;

        // EOF towards the reader
        self.delivery_tx = None;
        self.close_reason.get_or_insert(CloseReason::Orderly);

        let mut events = vec![];
        if !self.lifecycle_notified {
            self.lifecycle_notified = true;
            events.push(ConnectionEvent::Closed);
        }
        if self.state == State::Established {
            self.set_state(State::CloseWait);
        }
        self.arm_linger_timer();

        if self.state == State::CloseWait && self.fin_sent && self.unacked_sent.is_empty() {
            events.extend(self.finalize_close());
        }
        events
    }

    async fn handle_fin(&mut self, seq: SequenceNumber) -> Vec<ConnectionEvent> {
        if seq == self.recv_next {
            self.process_in_order_fin().await
        } else if self.recv_next.is_before(seq) {
            trace!("FIN #{} ahead of sequence (expecting #{})", seq, self.recv_next);
            self.pending_fin = Some(seq);
            self.register_out_of_order_receipt().await;
            vec![]
        } else {
            self.send_ack().await;
            vec![]
        }
    }

    /// Server side: first SYN for a fresh connection.
    async fn handle_initial_syn(
        &mut self,
        seq: SequenceNumber,
        params: &SynParams,
    ) -> Vec<ConnectionEvent> {
        match params.into_profile(&self.profile) {
            Ok(adopted) => {
                debug!("accepting connection offer from {:?}", self.peer_addr);
                self.profile = adopted;
            }
            Err(e) => {
                warn!("rejecting SYN from {:?}: {}", self.peer_addr, e);
                let rst = Segment::Rst { seq: self.send_next, ack: None };
                self.send_unsequenced(rst).await;
                return self.begin_failure().into_iter().collect();
            }
        }

        self.recv_next = seq.next();
        let own_seq = self.next_seq();
        let syn_ack = Segment::Syn {
            seq: own_seq,
            ack: Some(self.cumulative_ack()),
            params: SynParams::from_profile(&self.profile),
        };
        self.transmit_sequenced(syn_ack).await;
        self.set_state(State::SynRcvd);
        vec![]
    }

    /// Client side: the peer's SYN+ACK answering our SYN.
    async fn handle_syn_ack(
        &mut self,
        seq: SequenceNumber,
        ack: SequenceNumber,
        params: &SynParams,
    ) -> Vec<ConnectionEvent> {
        let mut events = self.process_ack(ack);
        if !self.unacked_sent.is_empty() {
            // does not cover our SYN: stray
            debug!("SYN+ACK from {:?} does not acknowledge our SYN - ignoring", self.peer_addr);
            return events;
        }

        match params.into_profile(&self.profile) {
            Ok(adopted) => self.profile = adopted,
            Err(e) => {
                warn!("unusable parameters in SYN+ACK from {:?}: {}", self.peer_addr, e);
                let rst = Segment::Rst { seq: self.send_next, ack: None };
                self.send_unsequenced(rst).await;
                events.extend(self.begin_failure());
                return events;
            }
        }

        self.recv_next = seq.next();
        self.send_ack().await;
        events.push(self.enter_established());
        events
    }

    /// The engine's segment dispatch. Returns the lifecycle events to fire
    /// once the lock is released.
    pub(crate) async fn process_segment(&mut self, segment: Segment) -> Vec<ConnectionEvent> {
        trace!("received {} from {:?} in state {:?}", segment, self.peer_addr, self.state);

        match self.state {
            State::Closed => {
                // only a first SYN creates state; everything else is stray
                if let Segment::Syn { seq, ack: None, ref params } = segment {
                    self.handle_initial_syn(seq, params).await
                } else {
                    trace!("dropping {} in CLOSED state", segment);
                    vec![]
                }
            }

            State::SynSent => match segment {
                Segment::Syn { seq, ack: Some(ack), ref params } => {
                    self.handle_syn_ack(seq, ack, params).await
                }
                Segment::Rst { .. } => self.begin_failure().into_iter().collect(),
                other => {
                    trace!("dropping {} in SYN-SENT state", other);
                    vec![]
                }
            },

            State::SynRcvd => match segment {
                Segment::Syn { .. } => {
                    // duplicate SYN: discard, reply with an ack
                    self.send_ack().await;
                    vec![]
                }
                Segment::Rst { .. } => self.begin_failure().into_iter().collect(),
                other => {
                    let mut events = vec![];
                    if let Some(ack) = other.ack() {
                        events.extend(self.process_ack(ack));
                        if self.state == State::SynRcvd && self.unacked_sent.is_empty() {
                            events.push(self.enter_established());
                        }
                    }
                    // data may ride on the segment that completes the handshake
                    if self.state == State::Established {
                        events.extend(self.dispatch_established(other).await);
                    }
                    events
                }
            },

            State::Established | State::CloseWait => match segment {
                Segment::Syn { .. } => {
                    self.send_ack().await;
                    vec![]
                }
                Segment::Rst { .. } => {
                    if self.state == State::CloseWait {
                        self.finalize_close().into_iter().collect()
                    } else {
                        self.begin_failure().into_iter().collect()
                    }
                }
                other => self.dispatch_established(other).await,
            },
        }
    }

    async fn dispatch_established(&mut self, segment: Segment) -> Vec<ConnectionEvent> {
        let mut events = vec![];
        if let Some(ack) = segment.ack() {
            events.extend(self.process_ack(ack));
        }
        match segment {
            Segment::Ack { .. } => {}
            Segment::Eak { ack, ref out_of_seq, .. } => self.process_eak(ack, out_of_seq).await,
            Segment::Dat { seq, payload, .. } => events.extend(self.handle_dat(seq, payload).await),
            Segment::Nul { seq, .. } => events.extend(self.handle_nul(seq).await),
            Segment::Fin { seq, .. } => events.extend(self.handle_fin(seq).await),
            Segment::Syn { .. } | Segment::Rst { .. } => unreachable!("handled by the state dispatch"),
        }
        events
    }

    /// Per-segment retransmission timer tick.
    async fn on_retransmission_timeout(&mut self, seq: SequenceNumber) -> RetransmitOutcome {
        if self.state == State::Closed {
            return RetransmitOutcome::Done;
        }
        let max_retrans = self.profile.max_retrans();
        let Some(outstanding) = self
            .unacked_sent
            .iter_mut()
            .find(|outstanding| outstanding.segment.seq() == seq)
        else {
            return RetransmitOutcome::Done;
        };

        outstanding.retransmit_counter = outstanding.retransmit_counter.saturating_add(1);
        if max_retrans > 0 && outstanding.retransmit_counter > max_retrans {
            warn!("segment #{} to {:?} exceeded the retransmission limit of {}", seq, self.peer_addr, max_retrans);
            return RetransmitOutcome::Failed;
        }

        debug!("retransmitting {} to {:?} (attempt {})", outstanding.segment, self.peer_addr, outstanding.retransmit_counter);
        let buf = outstanding.segment.to_bytes();
        self.send_socket.do_send_segment(self.peer_addr, &buf).await;
        RetransmitOutcome::Continue
    }

    /// One step of the close protocol; `WaitForWindow` means the FIN needs a
    /// free window slot first.
    async fn try_initiate_close(&mut self) -> CloseProgress {
        match self.state {
            State::Closed => CloseProgress::Done(vec![]),

            State::SynSent | State::SynRcvd => {
                // abortive: the handshake never completed
                let rst = Segment::Rst { seq: self.send_next, ack: None };
                self.send_unsequenced(rst).await;
                CloseProgress::Done(self.finalize_close().into_iter().collect())
            }

            State::Established => {
                if self.unacked_sent.len() >= self.profile.max_outstanding_segs() as usize {
                    return CloseProgress::WaitForWindow;
                }
                self.send_fin().await;
                self.set_state(State::CloseWait);
                CloseProgress::Done(vec![])
            }

            State::CloseWait => {
                if self.fin_sent {
                    return CloseProgress::Done(vec![]);
                }
                if self.unacked_sent.len() >= self.profile.max_outstanding_segs() as usize {
                    return CloseProgress::WaitForWindow;
                }
                self.send_fin().await;
                CloseProgress::Done(vec![])
            }
        }
    }

    async fn send_fin(&mut self) {
        let seq = self.next_seq();
        let fin = Segment::Fin {
            seq,
            ack: Some(self.cumulative_ack()),
        };
        self.transmit_sequenced(fin).await;
        self.fin_sent = true;
        self.output_shutdown = true;
        self.arm_linger_timer();
    }
}

fn spawn_retransmit_timer(
    me: Weak<Mutex<ConnectionInner>>,
    seq: SequenceNumber,
    period: Duration,
) -> TimerHandle {
    timer::schedule_repeating(period, move || {
        let me = me.clone();
        async move {
            let Some(inner) = me.upgrade() else {
                return TimerTick::Stop;
            };
            let (outcome, event, listeners, peer) = {
                let mut inner = inner.lock().await;
                let outcome = inner.on_retransmission_timeout(seq).await;
                let event = match outcome {
                    RetransmitOutcome::Failed => inner.begin_failure(),
                    _ => None,
                };
                (outcome, event, inner.listeners.clone(), inner.peer_addr)
            };
            if let Some(event) = event {
                fire_lifecycle_event(&listeners, peer, event);
            }
            match outcome {
                RetransmitOutcome::Continue => TimerTick::Continue,
                RetransmitOutcome::Done | RetransmitOutcome::Failed => TimerTick::Stop,
            }
        }
    })
}

/// One reliable connection to a peer: the engine owning all protocol state.
///
/// The engine task consumes inbound segments from a bounded queue (fed by the
/// endpoint's receive task), timers take the engine lock directly, and
/// user-facing calls block on the window or the delivery queue.
pub(crate) struct Connection {
    peer_addr: SocketAddr,
    inner: Arc<Mutex<ConnectionInner>>,
    state_rx: watch::Receiver<State>,
    window_notify: Arc<Notify>,
    delivery_rx: std::sync::Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    backlog_tx: Option<mpsc::Sender<Arc<Connection>>>,
}

impl Connection {
    /// Creates the engine and spawns its task. `backlog_tx` is set on
    /// server-side connections and receives the connection once established.
    ///
    /// The returned sender feeds the engine's inbound segment queue; the
    /// engine task finishes once every sender is gone, so the connection
    /// must not hold one itself.
    pub(crate) fn new(
        profile: RudpProfile,
        peer_addr: SocketAddr,
        send_socket: Arc<dyn SendSocket>,
        backlog_tx: Option<mpsc::Sender<Arc<Connection>>>,
    ) -> (Arc<Connection>, mpsc::Sender<Segment>) {
        let (state_tx, state_rx) = watch::channel(State::Closed);
        let (delivery_tx, delivery_rx) = mpsc::channel(profile.max_recv_queue_size() as usize);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_SEGMENT_QUEUE);
        let window_notify = Arc::new(Notify::new());

        let inner = Arc::new_cyclic(|me| {
            Mutex::new(ConnectionInner {
                me: me.clone(),
                profile,
                state: State::Closed,
                state_tx,
                close_reason: None,
                lifecycle_notified: false,
                peer_addr,
                send_socket,
                listeners: Vec::new(),
                send_next: SequenceNumber::ZERO,
                unacked_sent: VecDeque::new(),
                window_notify: window_notify.clone(),
                last_sequenced_send: Instant::now(),
                fin_sent: false,
                output_shutdown: false,
                recv_next: SequenceNumber::ZERO,
                out_of_seq: Vec::new(),
                pending_fin: None,
                out_of_seq_counter: 0,
                unacked_recv_counter: 0,
                delivery_tx: Some(delivery_tx),
                input_shutdown: false,
                null_timer: None,
                cum_ack_timer: None,
                linger_timer: None,
            })
        });

        let connection = Arc::new(Connection {
            peer_addr,
            inner,
            state_rx,
            window_notify,
            delivery_rx: std::sync::Mutex::new(Some(delivery_rx)),
            backlog_tx,
        });

        tokio::spawn(Connection::run(connection.clone(), inbound_rx));
        (connection, inbound_tx)
    }

    /// The engine task: consumes inbound segments until all producers are
    /// gone, firing lifecycle events outside the lock.
    async fn run(connection: Arc<Connection>, mut inbound_rx: mpsc::Receiver<Segment>) {
        while let Some(segment) = inbound_rx.recv().await {
            let (events, listeners) = {
                let mut inner = connection.inner.lock().await;
                let events = inner.process_segment(segment).await;
                (events, inner.listeners.clone())
            };
            for event in events {
                if event == ConnectionEvent::Opened {
                    if let Some(backlog_tx) = &connection.backlog_tx {
                        // strict backlog cap: block until accept() makes room
                        let _ = backlog_tx.send(connection.clone()).await;
                    }
                }
                fire_lifecycle_event(&listeners, connection.peer_addr, event);
            }
        }
        trace!("engine task for {:?} finished", connection.peer_addr);
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub(crate) async fn add_state_listener(&self, listener: Arc<dyn StateListener>) {
        self.inner.lock().await.listeners.push(listener);
    }

    pub(crate) async fn profile_snapshot(&self) -> RudpProfile {
        self.inner.lock().await.profile.clone()
    }

    pub(crate) async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    /// Takes the reader's end of the delivery queue; available exactly once.
    pub(crate) fn take_delivery_rx(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.delivery_rx.lock().expect("delivery_rx lock poisoned").take()
    }

    /// How the reader should report the closed delivery queue.
    pub(crate) async fn end_of_stream(&self) -> EndOfStream {
        let inner = self.inner.lock().await;
        if inner.input_shutdown {
            return EndOfStream::Error;
        }
        match inner.close_reason {
            Some(CloseReason::Failure) => EndOfStream::Error,
            _ => EndOfStream::Orderly,
        }
    }

    /// Client side: sends the SYN and waits until the connection is
    /// established or has failed.
    pub(crate) async fn connect(&self) -> Result<()> {
        self.inner.lock().await.start_connect().await;

        let mut state_rx = self.state_rx.clone();
        loop {
            match *state_rx.borrow_and_update() {
                State::Established | State::CloseWait => return Ok(()),
                State::Closed => return Err(RudpError::Closed),
                State::SynSent | State::SynRcvd => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(RudpError::Closed);
            }
        }
    }

    /// Sends one DAT payload, blocking while the send window is full.
    pub(crate) async fn send_data(&self, payload: &[u8]) -> Result<()> {
        loop {
            let mut inner = self.inner.lock().await;
            if inner.state != State::Established || inner.output_shutdown {
                return Err(RudpError::Closed);
            }
            if inner.unacked_sent.len() < inner.profile.max_outstanding_segs() as usize {
                let seq = inner.next_seq();
                let segment = Segment::Dat {
                    seq,
                    ack: inner.cumulative_ack(),
                    payload: payload.to_vec(),
                };
                inner.transmit_sequenced(segment).await;
                return Ok(());
            }

            trace!("send window to {:?} is full - waiting", self.peer_addr);
            let notified = self.window_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(inner);
            notified.await;
        }
    }

    /// Orderly close: FIN when established, abortive RST mid-handshake.
    pub(crate) async fn close(&self) -> Result<()> {
        loop {
            let mut inner = self.inner.lock().await;
            match inner.try_initiate_close().await {
                CloseProgress::Done(events) => {
                    let listeners = inner.listeners.clone();
                    drop(inner);
                    for event in events {
                        fire_lifecycle_event(&listeners, self.peer_addr, event);
                    }
                    return Ok(());
                }
                CloseProgress::WaitForWindow => {
                    let notified = self.window_notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(inner);
                    notified.await;
                }
            }
        }
    }

    /// Shuts down the output direction only: sends the FIN, leaves inbound
    /// data flowing until the close completes.
    pub(crate) async fn shutdown_output(&self) -> Result<()> {
        self.close().await
    }

    /// Shuts down the input direction: later segments are still acknowledged
    /// but their payload is discarded, and reads fail.
    pub(crate) async fn shutdown_input(&self) {
        let mut inner = self.inner.lock().await;
        inner.input_shutdown = true;
        inner.delivery_tx = None;
    }
}
