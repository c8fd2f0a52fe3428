//! Per-peer channel: an explicit pipeline run by one task.
//!
//! ```text
//!  outbound: payload ─► chunk split ─► reliable write ─► segment ─► armor ─► envelope
//!  inbound:  envelope ─► unarmor ─► segment ─► reliable read ─► chunk reassembly ─► message
//! ```
//!
//! Stages are plain fields of [`Pipeline`] called in a fixed order. The
//! reliability stage is optional; without it each chunk record travels as
//! one datagram. One tokio task owns the pipeline, so per-channel state needs
//! no locking. The task sleeps until the earliest timer of its stages.

use crate::chunk::{ChunkCodec, ChunkReassemblyBuffer, ChunkSplitter, Decoded, assemble};
use crate::connection::{
    ConnectionConfig, ConnectionEvent, RecordId, ReliableConnection, Role, Segment,
};
use crate::error::{Error, Result};
use crate::node::NodeConfig;
use crate::node::error::NodeError;
use crate::node::event::NodeEvent;
use crate::node::node::Node;
use crate::timer::earliest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use strand_crypto::{CryptoService, PeerAddress};
use tokio::sync::{mpsc, oneshot, watch};

/// Completion of one `Node::send`
pub(crate) type SendCompletion = oneshot::Sender<std::result::Result<(), NodeError>>;

/// Work for a channel task
#[derive(Debug)]
pub(crate) enum ChannelCommand {
    /// Send an application payload
    Send {
        payload: Vec<u8>,
        done: SendCompletion,
    },
    /// Envelope body received from the peer
    Inbound(Vec<u8>),
    /// Close the reliable connection gracefully
    Close,
    /// The peer lost its last path: close, then stop once idle
    Retire,
}

/// What one pipeline step produced
#[derive(Debug, Default)]
pub(crate) struct Output {
    /// Envelope bodies to put on the wire, in order
    pub datagrams: Vec<Vec<u8>>,
    /// Reassembled application messages
    pub messages: Vec<Vec<u8>>,
    /// Reliable connection notifications
    pub events: Vec<ConnectionEvent>,
}

/// Ordered transform stages for one peer
pub(crate) struct Pipeline {
    local: PeerAddress,
    peer: PeerAddress,
    armor: Option<Arc<dyn CryptoService>>,
    splitter: ChunkSplitter,
    codec: ChunkCodec,
    reassembly: ChunkReassemblyBuffer,
    reliability: Option<ConnectionConfig>,
    connection: Option<ReliableConnection>,
}

impl Pipeline {
    pub(crate) fn new(config: &NodeConfig, crypto: Arc<dyn CryptoService>, peer: PeerAddress) -> Self {
        let splitter = ChunkSplitter::new(&config.chunking);
        Self {
            local: crypto.local_address(),
            peer,
            armor: config.arming_enabled.then_some(crypto),
            codec: splitter.codec(),
            splitter,
            reassembly: ChunkReassemblyBuffer::new(&config.chunking),
            reliability: config.reliability.clone(),
            connection: None,
        }
    }

    /// Earliest timer of any stage
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        earliest(
            self.reassembly.next_deadline(),
            self.connection.as_ref().and_then(ReliableConnection::next_deadline),
        )
    }

    /// Push one payload through the outbound stages.
    ///
    /// Returns the record whose transmission completes the send when the
    /// reliability stage is active.
    pub(crate) fn send(
        &mut self,
        payload: &[u8],
        now: Instant,
        out: &mut Output,
    ) -> Result<Option<RecordId>> {
        let records = self.splitter.split(payload)?;
        let Some(connection) = self.ensure_connection(now) else {
            for record in records {
                out.datagrams.push(self.seal(&record)?);
            }
            return Ok(None);
        };

        let mut last = None;
        for record in records {
            last = Some(connection.write(record, now)?);
        }
        self.drain(now, out);
        Ok(last)
    }

    /// Push one received envelope body through the inbound stages.
    pub(crate) fn receive(&mut self, body: Vec<u8>, now: Instant, out: &mut Output) -> Result<()> {
        let body = self.open(body)?;
        if self.reliability.is_some() && Segment::is_segment(&body) {
            let Some(segment) = Segment::decode(&body) else {
                tracing::debug!("Dropping malformed segment from {}", self.peer.short());
                return Ok(());
            };
            self.on_segment(segment, now, out);
            return Ok(());
        }
        self.deliver(body, now, out);
        Ok(())
    }

    /// Fire expired timers
    pub(crate) fn poll_timeout(&mut self, now: Instant, out: &mut Output) {
        self.reassembly.poll_timeout(now);
        if let Some(connection) = &mut self.connection {
            connection.poll_timeout(now);
        }
        self.drain(now, out);
    }

    /// True once no connection is open and no message is half reassembled
    pub(crate) fn is_idle(&self) -> bool {
        self.connection.is_none() && self.reassembly.is_empty()
    }

    /// Close the reliable connection, if any
    pub(crate) fn close(&mut self, now: Instant, out: &mut Output) {
        if let Some(connection) = &mut self.connection {
            connection.close(now);
        }
        self.drain(now, out);
    }

    /// Reset the reliable connection and drop buffered chunks
    pub(crate) fn abort(&mut self, now: Instant, out: &mut Output) {
        if let Some(connection) = &mut self.connection {
            connection.abort();
        }
        self.reassembly.discard();
        self.drain(now, out);
    }

    fn ensure_connection(&mut self, now: Instant) -> Option<&mut ReliableConnection> {
        let config = self.reliability.as_ref()?;
        if self.connection.is_none() {
            let mut connection = ReliableConnection::for_peers(&self.local, &self.peer, config.clone());
            connection.open(now);
            tracing::debug!(
                "Opening {:?} connection to {}",
                connection.role(),
                self.peer.short()
            );
            self.connection = Some(connection);
        }
        self.connection.as_mut()
    }

    fn on_segment(&mut self, segment: Segment, now: Instant, out: &mut Output) {
        use crate::connection::Control;

        if self.connection.is_none() {
            let opening = segment.ctl.contains(Control::SYN) && !segment.ctl.contains(Control::ACK);
            let requested = segment.ctl.contains(Control::REQ);
            if requested {
                // The peer has data; open so our SYN goes out.
                self.ensure_connection(now);
                self.drain(now, out);
                return;
            }
            if !opening {
                if !segment.ctl.contains(Control::RST) {
                    let reset = Segment::control(
                        segment.ack,
                        segment.end(),
                        Control::RST | Control::ACK,
                        0,
                    );
                    tracing::debug!(
                        "No connection to {}, answering {:?} with reset",
                        self.peer.short(),
                        segment
                    );
                    self.push_segment(&reset, out);
                }
                return;
            }
            if Role::for_pair(&self.local, &self.peer) == Role::Active {
                tracing::debug!("Ignoring SYN from {}: we open actively", self.peer.short());
                self.ensure_connection(now);
                self.drain(now, out);
                return;
            }
            self.ensure_connection(now);
        }

        if let Some(connection) = &mut self.connection {
            connection.handle_segment(segment, now);
        }
        self.drain(now, out);
    }

    /// Collect segments, records and events from the connection
    fn drain(&mut self, now: Instant, out: &mut Output) {
        let Some(connection) = &mut self.connection else {
            return;
        };
        let mut segments = Vec::new();
        while let Some(segment) = connection.poll_transmit() {
            segments.push(segment);
        }
        let mut records = Vec::new();
        while let Some(record) = connection.read() {
            records.push(record);
        }
        while let Some(event) = connection.poll_event() {
            out.events.push(event);
        }
        if connection.is_closed() {
            self.connection = None;
        }

        for segment in &segments {
            self.push_segment(segment, out);
        }
        for record in records {
            self.deliver(record, now, out);
        }
    }

    fn push_segment(&self, segment: &Segment, out: &mut Output) {
        match self.seal(&segment.encode()) {
            Ok(body) => out.datagrams.push(body),
            Err(e) => tracing::warn!("Dropping segment to {}: {}", self.peer.short(), e),
        }
    }

    /// Chunk stage, inbound
    fn deliver(&mut self, record: Vec<u8>, now: Instant, out: &mut Output) {
        match self.codec.decode(record) {
            Decoded::PassThrough(bytes) => out.messages.push(bytes),
            Decoded::Chunk(chunk) => match self.reassembly.push(chunk, now) {
                Ok(Some(chunks)) => out.messages.push(assemble(chunks)),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    "Discarded chunked message from {}: {}",
                    self.peer.short(),
                    e
                ),
            },
        }
    }

    fn seal(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match &self.armor {
            Some(crypto) => Ok(crypto.encrypt(&self.peer, bytes)?),
            None => Ok(bytes.to_vec()),
        }
    }

    fn open(&self, bytes: Vec<u8>) -> Result<Vec<u8>> {
        match &self.armor {
            Some(crypto) => crypto
                .decrypt(&self.peer, &bytes)
                .map_err(Error::AuthenticationFailed),
            None => Ok(bytes),
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Current time on the tokio clock, so paused test time drives the timers
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Channel task body
pub(crate) async fn run_channel(
    node: Node,
    peer: PeerAddress,
    mut pipeline: Pipeline,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<RecordId, SendCompletion> = HashMap::new();
    let mut retiring = false;

    loop {
        let mut out = Output::default();
        let mut unreliable_send = None;
        let mut stop = false;

        tokio::select! {
            command = commands.recv() => {
                let now = now();
                match command {
                    Some(ChannelCommand::Send { payload, done }) => {
                        retiring = false;
                        match pipeline.send(&payload, now, &mut out) {
                            Ok(Some(record)) => {
                                pending.insert(record, done);
                            }
                            Ok(None) => unreliable_send = Some(done),
                            Err(e) => {
                                tracing::warn!("Send to {} failed: {}", peer.short(), e);
                                let _ = done.send(Err(e.into()));
                            }
                        }
                    }
                    Some(ChannelCommand::Inbound(body)) => {
                        if let Err(e) = pipeline.receive(body, now, &mut out) {
                            tracing::warn!("Dropping datagram from {}: {}", peer.short(), e);
                        }
                    }
                    Some(ChannelCommand::Close) => pipeline.close(now, &mut out),
                    Some(ChannelCommand::Retire) if !node.registry().contains(&peer) => {
                        retiring = true;
                        pipeline.close(now, &mut out);
                    }
                    Some(ChannelCommand::Retire) => {
                        tracing::trace!("Peer {} is back, keeping its channel", peer.short());
                    }
                    None => stop = true,
                }
            }
            () = sleep_until(pipeline.next_deadline()) => pipeline.poll_timeout(now(), &mut out),
            () = stopped(&mut shutdown) => {
                pipeline.abort(now(), &mut out);
                stop = true;
            }
        }

        let sent = node.transmit_all(peer, out.datagrams).await;
        if let Some(done) = unreliable_send {
            let _ = done.send(sent);
        }

        for event in out.events {
            match event {
                ConnectionEvent::Established => {
                    tracing::info!("Connection to {} established", peer.short());
                    node.emit(NodeEvent::ConnectionEstablished { peer });
                }
                ConnectionEvent::Sent(record) => {
                    if let Some(done) = pending.remove(&record) {
                        let _ = done.send(Ok(()));
                    }
                }
                ConnectionEvent::Closing {
                    initiated_by_remote,
                } => {
                    tracing::debug!(
                        "Connection to {} closing (remote: {})",
                        peer.short(),
                        initiated_by_remote
                    );
                    node.emit(NodeEvent::ConnectionClosing {
                        peer,
                        initiated_by_remote,
                    });
                }
                ConnectionEvent::Closed => {
                    tracing::debug!("Connection to {} closed", peer.short());
                    fail_pending(&mut pending, &Error::ConnectionClosing);
                }
                ConnectionEvent::Failed(error) => {
                    tracing::warn!("Connection to {} failed: {}", peer.short(), error);
                    fail_pending(&mut pending, &error);
                    node.emit(NodeEvent::ConnectionFailed { peer, error });
                }
            }
        }

        for payload in out.messages {
            node.emit(NodeEvent::MessageReceived {
                sender: peer,
                payload,
            });
        }

        if stop {
            fail_pending(&mut pending, &Error::ConnectionReset);
            tracing::trace!("Channel to {} stopped", peer.short());
            return;
        }

        if retiring
            && pending.is_empty()
            && pipeline.is_idle()
            && !node.registry().contains(&peer)
        {
            node.retire_channel(peer, commands);
            return;
        }
    }
}

fn fail_pending(pending: &mut HashMap<RecordId, SendCompletion>, error: &Error) {
    for (_, done) in pending.drain() {
        let _ = done.send(Err(NodeError::Core(error.clone())));
    }
}
