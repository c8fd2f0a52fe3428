//! Reliable, ordered record delivery over an unreliable per-peer channel.
//!
//! [`ReliableConnection`] is a sans-IO state machine in the spirit of TCP:
//! the owner feeds it inbound [`Segment`]s and the current time, and drains
//! outbound segments, events and received records. It never sleeps or
//! touches a socket, so one task can own it without locks.
//!
//! ```text
//!  write(record) ──► unsent ──window──► in flight ──ACK──► freed
//!                                          │
//!                                       RTO expiry ──► retransmit (Karn, backoff)
//!
//!  segment ──► in order? ──yes──► assembling ──PSH──► records ──► read()
//!                 │
//!                 no ──► out of order (until the gap fills)
//! ```
//!
//! Exactly one side opens actively: the peer with the lower address. The
//! passive side waits in [`ConnectionState::Listen`]; if it has data first,
//! it sends an open request (`REQ`) so the active side starts the handshake.

mod config;
mod segment;
mod state;

pub use config::ConnectionConfig;
pub use segment::{
    Control, SEGMENT_HEADER_LEN, SEGMENT_MAGIC, Segment, seq_ge, seq_gt, seq_le, seq_lt,
};
pub use state::ConnectionState;

use crate::error::{Error, Result};
use crate::timer::{RtoEstimator, Timer, earliest};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use strand_crypto::PeerAddress;

/// Handle for a record passed to [`ReliableConnection::write`]
pub type RecordId = u64;

/// Which side opens the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the SYN
    Active,
    /// Waits for the SYN
    Passive,
}

impl Role {
    /// Role of `local` towards `remote`: the lower address opens.
    #[must_use]
    pub fn for_pair(local: &PeerAddress, remote: &PeerAddress) -> Self {
        if local < remote {
            Self::Active
        } else {
            Self::Passive
        }
    }
}

/// Notifications for the owning channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Handshake completed
    Established,
    /// Last segment of a record went out for the first time
    Sent(RecordId),
    /// Closing started
    Closing {
        /// True if the peer sent the first FIN
        initiated_by_remote: bool,
    },
    /// Both directions closed cleanly
    Closed,
    /// Connection failed; nothing more will be sent or delivered
    Failed(Error),
}

/// Connection counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Segments handed out by `poll_transmit`
    pub segments_sent: u64,
    /// Segments passed to `handle_segment`
    pub segments_received: u64,
    /// Retransmitted segments
    pub retransmissions: u64,
    /// Payload bytes sent for the first time
    pub bytes_sent: u64,
    /// Payload bytes delivered in order
    pub bytes_received: u64,
}

#[derive(Debug)]
struct Unsent {
    payload: Vec<u8>,
    record_end: Option<RecordId>,
}

#[derive(Debug)]
struct InFlight {
    segment: Segment,
    first_sent: Instant,
    transmissions: u32,
}

/// TCP-like connection state machine
#[derive(Debug)]
pub struct ReliableConnection {
    config: ConnectionConfig,
    role: Role,
    state: ConnectionState,
    opened: bool,

    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    snd_wnd: u32,
    unsent: VecDeque<Unsent>,
    in_flight: VecDeque<InFlight>,
    stalled_since: Option<Instant>,
    fin_queued: bool,
    fin_seq: Option<u32>,
    next_record: RecordId,

    rcv_nxt: u32,
    out_of_order: HashMap<u32, Segment>,
    out_of_order_bytes: usize,
    assembling: Vec<u8>,
    records: VecDeque<Vec<u8>>,
    records_bytes: usize,
    last_advertised: u16,

    rto: RtoEstimator,
    rtx_timer: Timer,
    idle_timer: Timer,
    linger_timer: Timer,
    req_attempts: u32,
    probes: u32,

    outbox: VecDeque<Segment>,
    events: VecDeque<ConnectionEvent>,
    stats: ConnectionStats,
}

impl ReliableConnection {
    /// Create a closed connection with a random initial sequence number
    #[must_use]
    pub fn new(role: Role, config: ConnectionConfig) -> Self {
        let rto = RtoEstimator::new(config.initial_rto, config.min_rto, config.max_rto)
            .with_gains(config.alpha, config.beta, config.k);
        let iss = rand::random::<u32>();
        Self {
            role,
            state: ConnectionState::Closed,
            opened: false,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: u32::from(config.receive_window),
            unsent: VecDeque::new(),
            in_flight: VecDeque::new(),
            stalled_since: None,
            fin_queued: false,
            fin_seq: None,
            next_record: 0,
            rcv_nxt: 0,
            out_of_order: HashMap::new(),
            out_of_order_bytes: 0,
            assembling: Vec::new(),
            records: VecDeque::new(),
            records_bytes: 0,
            last_advertised: config.receive_window,
            rto,
            rtx_timer: Timer::new(),
            idle_timer: Timer::new(),
            linger_timer: Timer::new(),
            req_attempts: 0,
            probes: 0,
            outbox: VecDeque::new(),
            events: VecDeque::new(),
            stats: ConnectionStats::default(),
            config,
        }
    }

    /// Connection from `local` to `remote`, role chosen by address order
    #[must_use]
    pub fn for_peers(local: &PeerAddress, remote: &PeerAddress, config: ConnectionConfig) -> Self {
        Self::new(Role::for_pair(local, remote), config)
    }

    /// Use a fixed initial sequence number. Only meaningful before `open`.
    #[must_use]
    pub fn with_isn(mut self, isn: u32) -> Self {
        if !self.opened {
            self.iss = isn;
            self.snd_una = isn;
            self.snd_nxt = isn;
        }
        self
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Opening role
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Next sequence number to send
    #[must_use]
    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt
    }

    /// Oldest unacknowledged sequence number
    #[must_use]
    pub fn snd_una(&self) -> u32 {
        self.snd_una
    }

    /// Next sequence number expected from the peer
    #[must_use]
    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt
    }

    /// Current retransmission timeout
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.rto.rto()
    }

    /// Smoothed round-trip time, once measured
    #[must_use]
    pub fn srtt(&self) -> Option<Duration> {
        self.rto.srtt()
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        self.stats
    }

    /// True once opened and back in `Closed`
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.opened && self.state == ConnectionState::Closed
    }

    /// True while written data is unsent or unacknowledged
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        !self.unsent.is_empty() || !self.in_flight.is_empty()
    }

    /// Earliest timer deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        earliest(
            earliest(self.rtx_timer.deadline(), self.idle_timer.deadline()),
            self.linger_timer.deadline(),
        )
    }

    /// Next segment to put on the wire
    pub fn poll_transmit(&mut self) -> Option<Segment> {
        let segment = self.outbox.pop_front()?;
        self.stats.segments_sent += 1;
        Some(segment)
    }

    /// Next notification
    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    /// Next complete record received from the peer
    pub fn read(&mut self) -> Option<Vec<u8>> {
        let record = self.records.pop_front()?;
        self.records_bytes -= record.len();
        if self.state.is_synchronized()
            && usize::from(self.last_advertised) < self.config.mss
            && usize::from(self.window()) >= self.config.mss
        {
            self.send_ack();
        }
        Some(record)
    }

    /// Start the connection: the active side sends a SYN, the passive side listens.
    pub fn open(&mut self, now: Instant) {
        if self.opened {
            return;
        }
        self.opened = true;
        match self.role {
            Role::Active => {
                self.state = ConnectionState::SynSent;
                tracing::trace!("Active open, ISS {}", self.iss);
                let syn = Segment::control(self.iss, 0, Control::SYN, self.window());
                self.transmit(syn, now);
            }
            Role::Passive => {
                self.state = ConnectionState::Listen;
                tracing::trace!("Passive open");
                self.pump(now);
            }
        }
    }

    /// Queue one record. Records arrive at the peer whole and in order.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosing`] once closing started
    /// - [`Error::InvalidState`] for an empty record or a closed connection
    pub fn write(&mut self, record: Vec<u8>, now: Instant) -> Result<RecordId> {
        if record.is_empty() {
            return Err(Error::InvalidState("empty record"));
        }
        if self.state == ConnectionState::Closed {
            return Err(Error::InvalidState("connection is closed"));
        }
        if !self.state.accepts_writes() || self.fin_queued {
            return Err(Error::ConnectionClosing);
        }

        let id = self.next_record;
        self.next_record += 1;
        let pieces = record.len().div_ceil(self.config.mss);
        for (i, piece) in record.chunks(self.config.mss).enumerate() {
            self.unsent.push_back(Unsent {
                payload: piece.to_vec(),
                record_end: (i + 1 == pieces).then_some(id),
            });
        }
        self.pump(now);
        Ok(id)
    }

    /// Close gracefully. Queued data is still delivered before the FIN.
    pub fn close(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Listen | ConnectionState::SynSent => {
                tracing::debug!("Closing connection in {} before handshake", self.state);
                self.terminate();
                self.events.push_back(ConnectionEvent::Closed);
            }
            ConnectionState::SynReceived | ConnectionState::Established => {
                self.state = ConnectionState::FinWait1;
                self.fin_queued = true;
                self.events.push_back(ConnectionEvent::Closing {
                    initiated_by_remote: false,
                });
                self.pump(now);
            }
            _ => {}
        }
    }

    /// Reset the connection. Pending writes are dropped.
    pub fn abort(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let reset = (self.state != ConnectionState::Listen && self.state != ConnectionState::SynSent)
            .then(|| Segment::control(self.snd_nxt, self.rcv_nxt, Control::RST | Control::ACK, 0));
        self.fail(Error::ConnectionReset);
        if let Some(reset) = reset {
            self.outbox.push_back(reset);
        }
    }

    /// Process one inbound segment
    pub fn handle_segment(&mut self, segment: Segment, now: Instant) {
        self.stats.segments_received += 1;
        tracing::trace!("{} received {:?}", self.state, segment);
        match self.state {
            ConnectionState::Closed => {
                tracing::trace!("Dropping segment for closed connection");
                return;
            }
            ConnectionState::Listen => self.on_listen(segment, now),
            ConnectionState::SynSent => self.on_syn_sent(segment, now),
            _ => self.on_synchronized(segment, now),
        }
        self.pump(now);
    }

    /// Fire expired timers
    pub fn poll_timeout(&mut self, now: Instant) {
        if self.linger_timer.poll_expired(now) {
            match self.state {
                ConnectionState::TimeWait => {
                    self.terminate();
                    self.events.push_back(ConnectionEvent::Closed);
                    return;
                }
                ConnectionState::FinWait2 => {
                    tracing::debug!("Peer never sent FIN, closing");
                    self.terminate();
                    self.events.push_back(ConnectionEvent::Closed);
                    return;
                }
                _ => {}
            }
        }
        if self.rtx_timer.poll_expired(now) {
            self.on_retransmission_timeout(now);
            if self.state == ConnectionState::Closed {
                return;
            }
        }
        if self.idle_timer.poll_expired(now) {
            self.on_idle_timeout(now);
            if self.state == ConnectionState::Closed {
                return;
            }
        }
        self.pump(now);
    }

    fn window(&self) -> u16 {
        let used = self.assembling.len() + self.records_bytes + self.out_of_order_bytes;
        let free = usize::from(self.config.receive_window).saturating_sub(used);
        u16::try_from(free).unwrap_or(u16::MAX)
    }

    fn send_ack(&mut self) {
        let window = self.window();
        self.last_advertised = window;
        self.outbox
            .push_back(Segment::control(self.snd_nxt, self.rcv_nxt, Control::ACK, window));
    }

    fn send_req(&mut self, now: Instant) {
        self.req_attempts += 1;
        tracing::trace!("Sending open request (attempt {})", self.req_attempts);
        self.outbox
            .push_back(Segment::control(0, 0, Control::REQ, self.window()));
        self.rtx_timer.arm(now, self.rto.rto());
    }

    /// Put a sequence-consuming segment in flight
    fn transmit(&mut self, segment: Segment, now: Instant) {
        if !segment.is_empty() {
            self.snd_nxt = segment.end();
            self.stats.bytes_sent += segment.payload.len() as u64;
            if self.in_flight.is_empty() {
                self.stalled_since = Some(now);
            }
            self.in_flight.push_back(InFlight {
                segment: segment.clone(),
                first_sent: now,
                transmissions: 1,
            });
            self.rtx_timer.arm_if_idle(now, self.rto.rto());
        }
        self.outbox.push_back(segment);
    }

    /// Move queued data (and a queued FIN) onto the wire as the window allows
    fn pump(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Listen => {
                if !self.unsent.is_empty() && !self.rtx_timer.is_armed() {
                    self.send_req(now);
                }
                return;
            }
            ConnectionState::Established
            | ConnectionState::CloseWait
            | ConnectionState::FinWait1 => {}
            _ => return,
        }

        while let Some(front) = self.unsent.front() {
            let len = u32::try_from(front.payload.len()).unwrap_or(u32::MAX);
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una);
            if in_flight > 0 && in_flight.saturating_add(len) > self.snd_wnd {
                break;
            }
            let Some(Unsent {
                payload,
                record_end,
            }) = self.unsent.pop_front()
            else {
                break;
            };
            let mut ctl = Control::ACK;
            if record_end.is_some() {
                ctl |= Control::PSH;
            }
            let window = self.window();
            self.last_advertised = window;
            let segment = Segment {
                seq: self.snd_nxt,
                ack: self.rcv_nxt,
                ctl,
                window,
                payload,
            };
            self.transmit(segment, now);
            if let Some(id) = record_end {
                self.events.push_back(ConnectionEvent::Sent(id));
            }
        }

        if self.fin_queued && self.fin_seq.is_none() && self.unsent.is_empty() {
            self.fin_seq = Some(self.snd_nxt);
            let fin = Segment::control(
                self.snd_nxt,
                self.rcv_nxt,
                Control::FIN | Control::ACK,
                self.window(),
            );
            self.transmit(fin, now);
            if self.state == ConnectionState::CloseWait {
                self.state = ConnectionState::LastAck;
            }
        }
    }

    fn on_listen(&mut self, segment: Segment, now: Instant) {
        if segment.ctl.contains(Control::RST) {
            return;
        }
        if segment.ctl.contains(Control::SYN) && !segment.ctl.contains(Control::ACK) {
            self.rcv_nxt = segment.seq.wrapping_add(1);
            self.snd_wnd = u32::from(segment.window);
            self.state = ConnectionState::SynReceived;
            self.rtx_timer.cancel();
            self.req_attempts = 0;
            let syn_ack = Segment::control(
                self.iss,
                self.rcv_nxt,
                Control::SYN | Control::ACK,
                self.window(),
            );
            self.transmit(syn_ack, now);
            return;
        }
        tracing::debug!("Dropping {:?} while listening", segment);
    }

    fn on_syn_sent(&mut self, segment: Segment, now: Instant) {
        let expected_ack = self.iss.wrapping_add(1);
        let ack_ok = !segment.ctl.contains(Control::ACK) || segment.ack == expected_ack;

        if segment.ctl.contains(Control::RST) {
            if ack_ok {
                tracing::debug!("Handshake reset by peer");
                self.fail(Error::HandshakeRejected);
            }
            return;
        }
        if !ack_ok {
            tracing::debug!("Dropping {:?} with unexpected ACK during handshake", segment);
            return;
        }
        if segment.ctl.contains(Control::REQ) {
            // Peer has data waiting; the SYN may have been lost.
            let syn = Segment::control(self.iss, 0, Control::SYN, self.window());
            self.outbox.push_back(syn);
            return;
        }
        if segment.ctl.contains(Control::SYN) && segment.ctl.contains(Control::ACK) {
            self.rcv_nxt = segment.seq.wrapping_add(1);
            self.snd_wnd = u32::from(segment.window);
            self.on_ack(segment.ack, now);
            self.establish(now);
            self.send_ack();
        }
    }

    fn on_synchronized(&mut self, segment: Segment, now: Instant) {
        if segment.ctl.contains(Control::RST) {
            if self.in_receive_window(segment.seq) {
                match self.state {
                    ConnectionState::SynReceived => self.fail(Error::HandshakeRejected),
                    ConnectionState::TimeWait => {
                        self.terminate();
                        self.events.push_back(ConnectionEvent::Closed);
                    }
                    _ => self.fail(Error::ConnectionReset),
                }
            }
            return;
        }
        if segment.ctl.contains(Control::SYN) {
            if self.state == ConnectionState::SynReceived {
                let syn_ack = Segment::control(
                    self.iss,
                    self.rcv_nxt,
                    Control::SYN | Control::ACK,
                    self.window(),
                );
                self.outbox.push_back(syn_ack);
            } else {
                self.send_ack();
            }
            return;
        }
        if segment.ctl.contains(Control::REQ) || !segment.ctl.contains(Control::ACK) {
            return;
        }

        if self.state == ConnectionState::SynReceived {
            if segment.ack != self.iss.wrapping_add(1) {
                tracing::debug!("Dropping {:?} with unexpected ACK during handshake", segment);
                return;
            }
            self.on_ack(segment.ack, now);
            self.establish(now);
        }

        if self.state != ConnectionState::TimeWait {
            self.probes = 0;
            self.idle_timer.arm(now, self.config.probe_interval);
        }

        if seq_gt(segment.ack, self.snd_nxt) {
            self.send_ack();
            return;
        }
        if seq_gt(segment.ack, self.snd_una) {
            self.on_ack(segment.ack, now);
        }
        if seq_ge(segment.ack, self.snd_una) {
            self.snd_wnd = u32::from(segment.window);
        }

        if let Some(fin) = self.fin_seq {
            if seq_gt(self.snd_una, fin) {
                match self.state {
                    ConnectionState::FinWait1 => {
                        self.state = ConnectionState::FinWait2;
                        self.linger_timer.arm(now, self.config.user_timeout);
                    }
                    ConnectionState::Closing => self.enter_time_wait(now),
                    ConnectionState::LastAck => {
                        self.terminate();
                        self.events.push_back(ConnectionEvent::Closed);
                        return;
                    }
                    _ => {}
                }
            }
        }

        if segment.ctl.contains(Control::PRB) {
            self.send_ack();
        }
        if segment.payload.is_empty() && !segment.ctl.contains(Control::FIN) {
            return;
        }

        match self.state {
            ConnectionState::TimeWait => {
                if segment.ctl.contains(Control::FIN) {
                    self.send_ack();
                    self.linger_timer.arm(now, self.config.msl * 2);
                }
            }
            state if state.accepts_data() => self.on_data(segment, now),
            _ => self.send_ack(),
        }
    }

    fn on_data(&mut self, segment: Segment, now: Instant) {
        if seq_lt(segment.seq, self.rcv_nxt) {
            self.send_ack();
            return;
        }
        let len = segment.payload.len();
        if len > usize::from(self.window()) {
            tracing::trace!("Dropping segment beyond receive window");
            self.send_ack();
            return;
        }
        if segment.seq != self.rcv_nxt {
            if let std::collections::hash_map::Entry::Vacant(slot) =
                self.out_of_order.entry(segment.seq)
            {
                self.out_of_order_bytes += len;
                slot.insert(segment);
            }
            self.send_ack();
            return;
        }

        self.accept_in_order(segment, now);
        while let Some(next) = self.out_of_order.remove(&self.rcv_nxt) {
            self.out_of_order_bytes -= next.payload.len();
            self.accept_in_order(next, now);
        }
        self.out_of_order
            .retain(|seq, _| seq_ge(*seq, self.rcv_nxt));
        self.out_of_order_bytes = self.out_of_order.values().map(|s| s.payload.len()).sum();
        if self.state != ConnectionState::Closed {
            self.send_ack();
        }
    }

    fn accept_in_order(&mut self, segment: Segment, now: Instant) {
        let Segment { ctl, payload, .. } = segment;
        self.rcv_nxt = self
            .rcv_nxt
            .wrapping_add(u32::try_from(payload.len()).unwrap_or(u32::MAX));
        self.stats.bytes_received += payload.len() as u64;
        self.assembling.extend_from_slice(&payload);
        if ctl.contains(Control::PSH) {
            let record = std::mem::take(&mut self.assembling);
            self.records_bytes += record.len();
            self.records.push_back(record);
        }
        if ctl.contains(Control::FIN) {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.on_remote_fin(now);
        }
    }

    fn on_remote_fin(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Established => {
                tracing::debug!("Peer closed the connection, closing in turn");
                self.state = ConnectionState::CloseWait;
                self.fin_queued = true;
                self.events.push_back(ConnectionEvent::Closing {
                    initiated_by_remote: true,
                });
            }
            ConnectionState::FinWait1 => self.state = ConnectionState::Closing,
            ConnectionState::FinWait2 => self.enter_time_wait(now),
            _ => {}
        }
    }

    fn on_ack(&mut self, ack: u32, now: Instant) {
        // Karn's rule, widened: segments released by a retransmitted hole
        // waited behind it, so their ack time says nothing about the path.
        let mut clean = true;
        let mut newest = None;
        while let Some(front) = self.in_flight.front() {
            if !seq_le(front.segment.end(), ack) {
                break;
            }
            clean &= front.transmissions == 1;
            newest = Some(front.first_sent);
            self.in_flight.pop_front();
        }
        if let (true, Some(sent)) = (clean, newest) {
            self.rto.sample(now.saturating_duration_since(sent));
        }
        self.snd_una = ack;
        self.rto.reset_backoff();
        if self.in_flight.is_empty() {
            self.rtx_timer.cancel();
            self.stalled_since = None;
        } else {
            self.rtx_timer.arm(now, self.rto.rto());
            self.stalled_since = Some(now);
        }
    }

    fn on_retransmission_timeout(&mut self, now: Instant) {
        if self.state == ConnectionState::Listen {
            if self.req_attempts > self.config.syn_retries {
                self.fail(Error::HandshakeTimeout {
                    attempts: self.req_attempts,
                });
                return;
            }
            self.rto.backoff();
            self.send_req(now);
            return;
        }

        let rcv_nxt = self.rcv_nxt;
        let window = self.window();
        let Some(front) = self.in_flight.front_mut() else {
            return;
        };
        let handshake = front.segment.ctl.contains(Control::SYN);
        let limit = if handshake {
            self.config.syn_retries
        } else {
            self.config.data_retries
        };
        // The user timeout bounds time without progress, never a first transmission.
        let expired = !handshake
            && front.transmissions > 1
            && self
                .stalled_since
                .is_some_and(|since| now.saturating_duration_since(since) >= self.config.user_timeout);
        if front.transmissions > limit || expired {
            let attempts = front.transmissions;
            self.fail(if handshake {
                Error::HandshakeTimeout { attempts }
            } else {
                Error::RetransmissionExhausted { attempts }
            });
            return;
        }

        front.transmissions += 1;
        let mut segment = front.segment.clone();
        if segment.ctl.contains(Control::ACK) {
            segment.ack = rcv_nxt;
        }
        segment.window = window;
        tracing::trace!(
            "Retransmitting {:?} (transmission {})",
            segment,
            front.transmissions
        );
        self.outbox.push_back(segment);
        self.stats.retransmissions += 1;
        self.rto.backoff();
        self.rtx_timer.arm(now, self.rto.rto());
    }

    fn on_idle_timeout(&mut self, now: Instant) {
        if !self.state.is_synchronized() || self.state == ConnectionState::TimeWait {
            return;
        }
        if self.probes >= self.config.probe_limit {
            self.fail(Error::PeerUnreachable {
                probes: self.probes,
            });
            return;
        }
        self.probes += 1;
        tracing::trace!("Idle probe {}/{}", self.probes, self.config.probe_limit);
        self.outbox.push_back(Segment::control(
            self.snd_nxt,
            self.rcv_nxt,
            Control::ACK | Control::PRB,
            self.window(),
        ));
        self.idle_timer.arm(now, self.rto.rto());
    }

    fn establish(&mut self, now: Instant) {
        self.state = ConnectionState::Established;
        self.idle_timer.arm(now, self.config.probe_interval);
        tracing::debug!("Connection established");
        self.events.push_back(ConnectionEvent::Established);
    }

    fn enter_time_wait(&mut self, now: Instant) {
        self.state = ConnectionState::TimeWait;
        self.rtx_timer.cancel();
        self.idle_timer.cancel();
        self.linger_timer.arm(now, self.config.msl * 2);
    }

    fn in_receive_window(&self, seq: u32) -> bool {
        let window = u32::from(self.window()).max(1);
        seq_ge(seq, self.rcv_nxt) && seq_lt(seq, self.rcv_nxt.wrapping_add(window))
    }

    /// Release send-side and partial receive state; completed records stay readable.
    fn terminate(&mut self) {
        self.state = ConnectionState::Closed;
        self.rtx_timer.cancel();
        self.idle_timer.cancel();
        self.linger_timer.cancel();
        self.unsent.clear();
        self.in_flight.clear();
        self.stalled_since = None;
        self.out_of_order.clear();
        self.out_of_order_bytes = 0;
        self.assembling.clear();
    }

    fn fail(&mut self, error: Error) {
        tracing::debug!("Connection failed in {}: {}", self.state, error);
        self.terminate();
        self.outbox.clear();
        self.events.push_back(ConnectionEvent::Failed(error));
    }
}
