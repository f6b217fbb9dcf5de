use super::{SendPhase, TransferReport, TransferError};
use super::ledger::{AckLedger};

use crate::config::{TransferConfig};
use crate::packet::{Acknowledge, Chunk, Header, Packet};
use crate::transport::{Transport, Destination};
use crate::util::thread::{NamespacedThread};

use crossbeam_channel::{self, Sender, Receiver, select};
use crossbeam_utils::atomic::{AtomicCell};

use std::collections::{VecDeque};
use std::net::{Ipv4Addr};
use std::sync::{Arc};
use std::time::{Duration, Instant};

/// Cancels a send that is still waiting for the consent of the receiver.
/// Clones cancel the same send.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Sender<()>,
    receiver: Receiver<()>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        Self { sender, receiver }
    }

    /// Has no effect once the receiver accepted the file.
    pub fn cancel(&self) {
        // A full channel means it was already cancelled.
        let _ = self.sender.try_send(());
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Send side of a transfer, shared between the thread sending the file
/// and the dispatcher that receives the answers of the peer.
pub struct OutboundTransfer {
    peer: Ipv4Addr,
    filename: String,
    ledger: AckLedger,
    consent_sender: Sender<()>,
    consent_receiver: Receiver<()>,
    phase: AtomicCell<SendPhase>,
}

impl OutboundTransfer {
    pub fn new(peer: Ipv4Addr, filename: &str) -> Self {
        let (consent_sender, consent_receiver) = crossbeam_channel::bounded(1);
        Self {
            peer,
            filename: filename.into(),
            ledger: AckLedger::new(),
            consent_sender,
            consent_receiver,
            phase: AtomicCell::new(SendPhase::Idle),
        }
    }

    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn phase(&self) -> SendPhase {
        self.phase.load()
    }

    /// The peer accepted the file.
    pub fn grant_consent(&self) {
        // Repeated consents are the same consent.
        let _ = self.consent_sender.try_send(());
    }

    pub fn acknowledge(&self, ack: Acknowledge) {
        log::trace!("Ack {} from {} (window {})", ack.serial, self.peer, ack.window);
        self.ledger.record(ack);
    }

    fn set_phase(&self, phase: SendPhase) {
        log::debug!("Transfer of '{}' to {}: {:?}", self.filename, self.peer, phase);
        self.phase.store(phase);
    }
}

/// Sends `Allow` for the file and blocks until the peer accepts it or `cancel` is used.
pub fn request_consent(
    transfer: &OutboundTransfer,
    header: &Header,
    transport: &dyn Transport,
    cancel: &CancelHandle,
) -> Result<(), TransferError> {
    transfer.set_phase(SendPhase::AwaitingConsent);
    let allow = Packet::Allow(header.clone(), transfer.filename.clone());
    if !transport.send_packet(transfer.peer.into(), &allow).is_sent() {
        transfer.set_phase(SendPhase::Failed);
        return Err(TransferError::ConsentUnreachable(transfer.peer))
    }

    select! {
        recv(transfer.consent_receiver) -> _ => {
            log::info!("{} accepted '{}'", transfer.peer, transfer.filename);
            Ok(())
        }
        recv(cancel.receiver) -> _ => {
            transfer.set_phase(SendPhase::Cancelled);
            Err(TransferError::Cancelled)
        }
    }
}

/// Sends every chunk until all of them are acknowledged,
/// then tells the peer the outcome with `TransferSucceeded` or `TransferFailed`.
pub fn send_chunks(
    transfer: &Arc<OutboundTransfer>,
    chunks: Vec<Chunk>,
    header: &Header,
    transport: &dyn Transport,
    config: &TransferConfig,
) -> Result<TransferReport, TransferError> {
    let total = chunks.len();
    transfer.set_phase(SendPhase::Transferring);
    log::info!("Sending '{}' to {} in {} chunks", transfer.filename, transfer.peer, total);

    let mut send_loop = SendLoop {
        transfer: transfer.as_ref(),
        header,
        transport,
        config,
        report: TransferReport { total_chunks: total, ..Default::default() },
    };

    let result = {
        let watcher = AckWatcher::spawn(transfer.clone());
        send_loop.run(chunks, &watcher)
    };

    let destination = Destination::Unicast(transfer.peer);
    match result {
        Ok(()) => {
            let status = transport.send_packet(destination, &Packet::TransferSucceeded(header.clone(), total));
            if !status.is_sent() {
                log::warn!("{} did not receive the end of '{}'", transfer.peer, transfer.filename);
            }
            transfer.set_phase(SendPhase::Completed);
            log::info!("'{}' sent to {}: {:?}", transfer.filename, transfer.peer, send_loop.report);
            Ok(send_loop.report)
        }
        Err(err) => {
            transport.send_packet(destination, &Packet::TransferFailed(header.clone(), Some(total)));
            transfer.set_phase(SendPhase::Failed);
            log::warn!("Transfer of '{}' to {} failed: {}", transfer.filename, transfer.peer, err);
            Err(err)
        }
    }
}

enum Watched {
    Acked { serial: i64, window: i64 },
    Expired(Chunk),
}

/// Waits for the acknowledgment of every sent chunk, in send order,
/// reporting each one as acknowledged or expired.
struct AckWatcher {
    // Field order matters: the thread is joined once both channels are closed.
    watches: Sender<(Chunk, Instant)>,
    outcomes: Receiver<Watched>,
    _thread: NamespacedThread<()>,
}

impl AckWatcher {
    fn spawn(transfer: Arc<OutboundTransfer>) -> Self {
        let (watches, watch_receiver) = crossbeam_channel::unbounded::<(Chunk, Instant)>();
        let (outcome_sender, outcomes) = crossbeam_channel::unbounded();

        let thread = NamespacedThread::spawn("ack-watcher", move || {
            for (chunk, deadline) in watch_receiver.iter() {
                let timeout = deadline.saturating_duration_since(Instant::now());
                let outcome = match transfer.ledger.wait_for(chunk.serial, timeout) {
                    Some(window) => Watched::Acked { serial: chunk.serial, window },
                    None => Watched::Expired(chunk),
                };
                if outcome_sender.send(outcome).is_err() {
                    break
                }
            }
        });

        Self { watches, outcomes, _thread: thread }
    }

    fn watch(&self, chunk: Chunk, deadline: Instant) {
        // The thread only ends when this sender is dropped.
        let _ = self.watches.send((chunk, deadline));
    }

    /// Outcomes available. With `wait`, blocks up to that time for the first one.
    fn collect(&self, wait: Option<Duration>) -> Vec<Watched> {
        let mut outcomes = Vec::new();
        if let Some(timeout) = wait {
            match self.outcomes.recv_timeout(timeout) {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => return outcomes,
            }
        }
        outcomes.extend(self.outcomes.try_iter());
        outcomes
    }
}

struct SendLoop<'a> {
    transfer: &'a OutboundTransfer,
    header: &'a Header,
    transport: &'a dyn Transport,
    config: &'a TransferConfig,
    report: TransferReport,
}

impl<'a> SendLoop<'a> {
    fn run(&mut self, chunks: Vec<Chunk>, watcher: &AckWatcher) -> Result<(), TransferError> {
        let total = chunks.len();
        let mut pending = VecDeque::from(chunks);
        let mut expired = VecDeque::new();
        let mut suspended = false;

        loop {
            let nothing_to_send = pending.is_empty() && expired.is_empty() && !suspended;
            let wait = if nothing_to_send { Some(self.config.ack_timeout) } else { None };
            for outcome in watcher.collect(wait) {
                match outcome {
                    Watched::Acked { serial, window } => {
                        log::trace!("Chunk {} confirmed, window {}", serial, window);
                        suspended |= self.is_low(window);
                    }
                    Watched::Expired(chunk) => {
                        log::debug!("Chunk {} not acknowledged in time", chunk.serial);
                        expired.push_back(chunk);
                    }
                }
            }

            if self.transfer.ledger.acknowledged(total) == total {
                break Ok(())
            }

            if suspended {
                suspended = self.suspend()?;
                continue
            }

            if let Some(chunk) = pending.pop_front() {
                self.send_chunk(&chunk);
                watcher.watch(chunk, Instant::now() + self.config.ack_timeout);
            }

            let mut low_window = false;
            while let Some(chunk) = expired.pop_front() {
                let window = self.resend(&chunk)?;
                low_window |= self.is_low(window);
            }
            suspended = low_window;
        }
    }

    fn is_low(&self, window: i64) -> bool {
        window < self.config.low_window as i64
    }

    fn send_chunk(&self, chunk: &Chunk) {
        let packet = Packet::FileChunk(self.header.clone(), chunk.clone());
        let status = self.transport.send_packet(Destination::Unicast(self.transfer.peer), &packet);
        if !status.is_sent() {
            log::trace!("Chunk {} to {}: {:?}", chunk.serial, self.transfer.peer, status);
        }
    }

    /// Resends the chunk until acknowledged, returning the reported window.
    fn resend(&mut self, chunk: &Chunk) -> Result<i64, TransferError> {
        // The acknowledgment may have arrived after the watcher gave up.
        if let Some(window) = self.transfer.ledger.window_of(chunk.serial) {
            return Ok(window)
        }

        for attempt in 1..=self.config.max_attempts {
            self.report.resent += 1;
            self.send_chunk(chunk);
            if let Some(window) = self.transfer.ledger.wait_for(chunk.serial, self.config.ack_timeout) {
                return Ok(window)
            }
            log::debug!("Chunk {} resent ({}/{}), no ack", chunk.serial, attempt, self.config.max_attempts);
        }
        Err(TransferError::PacketLoss { serial: chunk.serial })
    }

    /// Waits the cooldown and probes the receiver window.
    /// Returns `true` if the window is still low.
    fn suspend(&mut self) -> Result<bool, TransferError> {
        let peer = self.transfer.peer;
        self.report.suspensions += 1;
        self.transfer.set_phase(SendPhase::Suspended);
        log::warn!("Low window in {}, sending suspended for {:?}", peer, self.config.suspend_cooldown);
        std::thread::sleep(self.config.suspend_cooldown);

        for attempt in 1..=self.config.probe_attempts {
            self.transfer.ledger.forget(Chunk::PROBE_SERIAL);
            self.send_chunk(&Chunk::probe());
            match self.transfer.ledger.take(Chunk::PROBE_SERIAL, self.config.ack_timeout) {
                Some(window) if window > self.config.recovery_window as i64 => {
                    log::info!("Window of {} recovered ({}), sending resumed", peer, window);
                    self.transfer.set_phase(SendPhase::Transferring);
                    return Ok(false)
                }
                Some(window) => {
                    log::debug!("Window of {} still low: {}", peer, window);
                    return Ok(true)
                }
                None => {
                    log::debug!("Probe {}/{} to {} not acknowledged", attempt, self.config.probe_attempts, peer);
                }
            }
        }
        Err(TransferError::PacketLoss { serial: Chunk::PROBE_SERIAL })
    }
}
