use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use bytes::BytesMut;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::config::RelSegConfig;
use crate::connection::{ConnectionState, InFlightSegment};
use crate::segment::{
    build_segment, verify_checksum, SegmentFlags, SegmentHeader, SegmentKind, PAYLOAD_LEN,
    SEGMENT_LEN,
};
use crate::send_pipeline::{SegmentSocket, SendPipeline};
use crate::seq_num::SeqNum;

/// The sending endpoint of a connection. All protocol work happens on a
///  spawned driver task that has sole ownership of the wire and all counters;
///  this handle talks to it through channels, so none of the methods contend
///  on protocol state.
pub struct ClientSocket {
    command_tx: mpsc::Sender<ClientCommand>,
    send_backlog_tx: mpsc::Sender<Vec<u8>>,
    state_rx: watch::Receiver<ConnectionState>,
    driver_handle: JoinHandle<()>,
}

enum ClientCommand {
    Connect { done: oneshot::Sender<bool> },
    Shutdown { done: oneshot::Sender<bool> },
}

impl ClientSocket {
    pub fn new(socket: Arc<dyn SegmentSocket>, config: RelSegConfig) -> anyhow::Result<ClientSocket> {
        config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(16);
        let (send_backlog_tx, send_backlog_rx) = mpsc::channel(config.send_backlog_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);

        let driver = ClientDriver::new(socket, config, command_rx, send_backlog_rx, state_tx);
        let driver_handle = tokio::spawn(driver.run());

        Ok(ClientSocket {
            command_tx,
            send_backlog_tx,
            state_rx,
            driver_handle,
        })
    }

    /// Performs the three-way handshake, returning once the connection is
    ///  established or the retry budget is exhausted.
    pub async fn connect(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(ClientCommand::Connect { done: done_tx }).await.is_err() {
            bail!("connection driver is gone");
        }
        match done_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => bail!("handshake failed: no matching SYN+ACK within the retry budget"),
            Err(_) => bail!("connection driver is gone"),
        }
    }

    /// Hands data to the send backlog without blocking. Returns the number of
    ///  bytes accepted, which is less than `data.len()` if the backlog fills
    ///  up; callers are expected to retry the remainder later.
    pub fn send(&self, data: &[u8]) -> usize {
        let mut accepted = 0;
        for chunk in data.chunks(PAYLOAD_LEN) {
            if self.send_backlog_tx.try_send(chunk.to_vec()).is_err() {
                break;
            }
            accepted += chunk.len();
        }
        accepted
    }

    /// Drains the send backlog, then runs the FIN handshake. Returns Ok once
    ///  the peer acknowledged the FIN; an error means the drain deadline or
    ///  the FIN retry budget ran out and the connection was torn down anyway.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.command_tx.send(ClientCommand::Shutdown { done: done_tx }).await.is_err() {
            bail!("connection driver is gone");
        }
        match done_rx.await {
            Ok(true) => Ok(()),
            Ok(false) => bail!("teardown incomplete: peer did not acknowledge the FIN"),
            Err(_) => bail!("connection driver is gone"),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Stops the driver task and releases the transport. Idempotent, and
    ///  invoked from `Drop` as well.
    pub fn close(&self) {
        self.driver_handle.abort();
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// A control segment that must be answered by the peer: the SYN during the
///  handshake, the FIN during teardown. Retransmitted with a fixed delay a
///  bounded number of times.
struct PendingExchange {
    segment: BytesMut,
    resend_at: Instant,
    retries_left: u32,
    done: Option<oneshot::Sender<bool>>,
}

/// Teardown intent recorded by `shutdown()`: the FIN is held back until the
///  send backlog and the in-flight list are drained, or the deadline passes.
struct ShutdownDrain {
    deadline: Instant,
    done: oneshot::Sender<bool>,
}

struct ClientDriver {
    config: RelSegConfig,
    socket: Arc<dyn SegmentSocket>,
    pipeline: SendPipeline,
    command_rx: mpsc::Receiver<ClientCommand>,
    send_backlog_rx: mpsc::Receiver<Vec<u8>>,
    state_tx: watch::Sender<ConnectionState>,
    state: ConnectionState,
    /// seqnum the next outbound segment will carry
    next_seq: SeqNum,
    /// highest cumulative ack received from the peer (the next seqnum it
    ///  expects)
    peer_ack: SeqNum,
    peer_window: u8,
    in_flight: VecDeque<InFlightSegment>,
    pending: Option<PendingExchange>,
    /// final handshake ACK, kept for re-sending on duplicate SYN+ACKs
    handshake_ack: Option<BytesMut>,
    shutdown_drain: Option<ShutdownDrain>,
    finished: bool,
}

impl ClientDriver {
    fn new(
        socket: Arc<dyn SegmentSocket>,
        config: RelSegConfig,
        command_rx: mpsc::Receiver<ClientCommand>,
        send_backlog_rx: mpsc::Receiver<Vec<u8>>,
        state_tx: watch::Sender<ConnectionState>,
    ) -> ClientDriver {
        ClientDriver {
            config,
            pipeline: SendPipeline::new(socket.clone()),
            socket,
            command_rx,
            send_backlog_rx,
            state_tx,
            state: ConnectionState::Closed,
            next_seq: SeqNum::ZERO,
            peer_ack: SeqNum::ZERO,
            peer_window: 0,
            in_flight: VecDeque::new(),
            pending: None,
            handshake_ack: None,
            shutdown_drain: None,
            finished: false,
        }
    }

    async fn run(mut self) {
        let mut buf = [0u8; SEGMENT_LEN];
        loop {
            // the sleep is recreated every iteration, so the tick fires only
            //  after a full quiescent interval without segments or commands
            select! {
                res = self.socket.recv_segment(&mut buf) => match res {
                    Ok(len) => self.on_segment_received(&buf[..len]).await,
                    Err(e) => {
                        error!("segment transport failed: {}", e);
                        break;
                    }
                },
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                _ = sleep(self.config.tick_interval) => self.on_tick().await,
            }

            if self.finished {
                debug!("client connection closed, stopping driver");
                break;
            }
        }
    }

    async fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect { done } => {
                if self.state != ConnectionState::Closed || self.finished {
                    let _ = done.send(false);
                    return;
                }

                let initial = SeqNum::random();
                self.next_seq = initial.next();

                let header = SegmentHeader::control(initial, SeqNum::ZERO, SegmentFlags::SYN, 0);
                let mut segment = build_segment(&header, &[]);
                self.pipeline.finalize_and_send(&mut segment).await;
                debug!("sent SYN with initial seqnum {}", initial);

                self.pending = Some(PendingExchange {
                    segment,
                    resend_at: Instant::now() + self.config.retransmission_timeout,
                    retries_left: self.config.retry_count - 1,
                    done: Some(done),
                });
                self.set_state(ConnectionState::SynSent);
            }
            ClientCommand::Shutdown { done } => {
                if self.state != ConnectionState::Established || self.shutdown_drain.is_some() {
                    let _ = done.send(false);
                    return;
                }

                let drain_budget = self.config.retransmission_timeout * self.config.retry_count;
                self.shutdown_drain = Some(ShutdownDrain {
                    deadline: Instant::now() + drain_budget,
                    done,
                });
                self.maybe_send_fin().await;
            }
        }
    }

    async fn on_segment_received(&mut self, data: &[u8]) {
        self.dispatch_segment(data).await;
        // a steady arrival stream suppresses the quiescence tick, so the
        //  timer-driven work piggybacks on every arrival as well
        self.drive().await;
    }

    async fn dispatch_segment(&mut self, data: &[u8]) {
        if data.len() != SEGMENT_LEN || !verify_checksum(data) {
            debug!("dropping segment that failed checksum verification ({} bytes)", data.len());
            return;
        }
        let header = match SegmentHeader::deser(&mut &data[..]) {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping undecodable segment: {}", e);
                return;
            }
        };
        trace!("received {:?} segment, acknum {}", header.flags.kind(), header.ack_num);

        match self.state {
            ConnectionState::SynSent => self.on_segment_syn_sent(&header).await,
            ConnectionState::Established => self.on_segment_established(&header).await,
            ConnectionState::FinSent => self.on_segment_fin_sent(&header).await,
            _ => trace!("ignoring segment in state {}", self.state),
        }
    }

    async fn on_segment_syn_sent(&mut self, header: &SegmentHeader) {
        // only the SYN+ACK that acknowledges our SYN moves the handshake
        //  forward, everything else is noise from an earlier incarnation
        if header.flags.kind() != SegmentKind::SynAck || header.ack_num != self.next_seq {
            debug!("ignoring non-matching segment in SYN_SENT");
            return;
        }

        self.peer_window = header.window;

        let ack_header = SegmentHeader::control(
            self.next_seq,
            header.seq_num.next(),
            SegmentFlags::ACK,
            0,
        );
        let mut ack = build_segment(&ack_header, &[]);
        self.pipeline.finalize_and_send(&mut ack).await;

        self.next_seq = self.next_seq.next();
        self.peer_ack = self.next_seq;
        self.handshake_ack = Some(ack);

        if let Some(mut pending) = self.pending.take() {
            if let Some(done) = pending.done.take() {
                let _ = done.send(true);
            }
        }
        self.set_state(ConnectionState::Established);
    }

    async fn on_segment_established(&mut self, header: &SegmentHeader) {
        match header.flags.kind() {
            SegmentKind::Ack => self.on_ack(header),
            SegmentKind::SynAck => {
                // our handshake ACK was lost, the server is still in SYN_RCVD
                debug!("duplicate SYN+ACK, re-sending the handshake ACK");
                if let Some(ack) = &self.handshake_ack {
                    self.pipeline.do_send(ack).await;
                }
            }
            kind => trace!("ignoring {:?} segment in ESTABLISHED", kind),
        }
    }

    async fn on_segment_fin_sent(&mut self, header: &SegmentHeader) {
        match header.flags.kind() {
            SegmentKind::FinAck if header.ack_num == self.next_seq => {
                let ack_header = SegmentHeader::control(
                    self.next_seq,
                    header.seq_num.next(),
                    SegmentFlags::ACK,
                    0,
                );
                let mut ack = build_segment(&ack_header, &[]);
                self.pipeline.finalize_and_send(&mut ack).await;

                if let Some(mut pending) = self.pending.take() {
                    if let Some(done) = pending.done.take() {
                        let _ = done.send(true);
                    }
                }
                self.set_state(ConnectionState::Closed);
                self.finished = true;
            }
            SegmentKind::Ack => self.on_ack(header),
            kind => trace!("ignoring {:?} segment in FIN_SENT", kind),
        }
    }

    /// Cumulative acknowledgement: every in-flight segment with a seqnum
    ///  strictly below the acknum is delivered and leaves the in-flight list.
    fn on_ack(&mut self, header: &SegmentHeader) {
        // nothing beyond next_seq was ever sent, so such an acknum can only
        //  be spoofed or corrupted-yet-checksum-valid
        if header.ack_num > self.next_seq {
            debug!("ignoring ACK beyond the send horizon ({} > {})", header.ack_num, self.next_seq);
            return;
        }

        if header.ack_num > self.peer_ack {
            self.peer_ack = header.ack_num;
        }
        self.peer_window = header.window;

        while let Some(front) = self.in_flight.front() {
            if front.seq_num < header.ack_num {
                trace!("segment {} acknowledged", front.seq_num);
                self.in_flight.pop_front();
            } else {
                break;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.drive().await;
    }

    async fn drive(&mut self) {
        self.check_pending_exchange().await;
        self.retransmit_expired().await;
        self.pump_backlog().await;
        self.maybe_send_fin().await;
    }

    async fn check_pending_exchange(&mut self) {
        let Some(pending) = &mut self.pending else {
            return;
        };
        if Instant::now() < pending.resend_at {
            return;
        }

        if pending.retries_left == 0 {
            warn!("retry budget exhausted in state {}, giving up", self.state);
            let mut pending = self.pending.take().expect("pending exchange was checked above");
            if let Some(done) = pending.done.take() {
                let _ = done.send(false);
            }
            self.set_state(ConnectionState::Closed);
            self.finished = true;
            return;
        }

        pending.retries_left -= 1;
        pending.resend_at = Instant::now() + self.config.retransmission_timeout;
        trace!("retransmitting pending exchange segment, {} retries left", pending.retries_left);
        let segment = pending.segment.clone();
        self.pipeline.do_send(&segment).await;
    }

    /// Go-back-N retransmission: every in-flight segment whose timeout
    ///  expired goes out again, oldest first.
    async fn retransmit_expired(&mut self) {
        let now = Instant::now();
        for i in 0..self.in_flight.len() {
            if now.duration_since(self.in_flight[i].sent_at) < self.config.retransmission_timeout {
                continue;
            }
            self.in_flight[i].sent_at = now;
            trace!("retransmitting data segment {}", self.in_flight[i].seq_num);
            let segment = self.in_flight[i].segment.clone();
            self.pipeline.do_send(&segment).await;
        }
    }

    /// Moves backlog chunks onto the wire while the peer's advertised window
    ///  has room for more un-acked segments.
    async fn pump_backlog(&mut self) {
        if self.state != ConnectionState::Established {
            return;
        }

        while self.next_seq.distance_from(self.peer_ack) < self.peer_window as u16 {
            let chunk = match self.send_backlog_rx.try_recv() {
                Ok(chunk) => chunk,
                Err(_) => break,
            };

            let header = SegmentHeader::data(
                self.next_seq,
                SeqNum::ZERO,
                0,
                chunk.len() as u16,
            );
            let mut segment = build_segment(&header, &chunk);
            self.pipeline.finalize_and_send(&mut segment).await;
            trace!("sent data segment {} ({} bytes)", self.next_seq, chunk.len());

            self.in_flight.push_back(InFlightSegment {
                seq_num: self.next_seq,
                sent_at: Instant::now(),
                segment,
            });
            self.next_seq = self.next_seq.next();
        }
    }

    /// Sends the FIN once everything handed to `send()` before the shutdown
    ///  was delivered, or the drain deadline passed.
    async fn maybe_send_fin(&mut self) {
        if self.state != ConnectionState::Established || self.shutdown_drain.is_none() {
            return;
        }

        let drained = self.in_flight.is_empty() && self.send_backlog_rx.is_empty();
        let deadline_passed = Instant::now()
            >= self.shutdown_drain.as_ref().expect("shutdown drain was checked above").deadline;
        if !drained && !deadline_passed {
            return;
        }
        if !drained {
            warn!("drain deadline passed with undelivered data, tearing down anyway");
        }

        let drain = self.shutdown_drain.take().expect("shutdown drain was checked above");

        let header = SegmentHeader::control(self.next_seq, SeqNum::ZERO, SegmentFlags::FIN, 0);
        let mut segment = build_segment(&header, &[]);
        self.pipeline.finalize_and_send(&mut segment).await;
        debug!("sent FIN with seqnum {}", self.next_seq);
        self.next_seq = self.next_seq.next();

        self.pending = Some(PendingExchange {
            segment,
            resend_at: Instant::now() + self.config.retransmission_timeout,
            retries_left: self.config.retry_count - 1,
            done: Some(drain.done),
        });
        self.set_state(ConnectionState::FinSent);
    }

    fn set_state(&mut self, new_state: ConnectionState) {
        debug!("client state transition {} -> {}", self.state, new_state);
        self.state = new_state;
        self.state_tx.send_replace(new_state);
    }
}
