use super::{ReceiveError};
use super::chunk::{self};

use crate::config::{TransferConfig};
use crate::packet::{Acknowledge, Chunk, Packet};
use crate::transport::{Transport, Destination};
use crate::util::thread::{NamespacedThread, OTHER_THREAD_ERR};
use crate::util::{SAMPLING_TIMEOUT};

use crossbeam_channel::{self, Sender, Receiver, RecvTimeoutError};

use std::collections::{BTreeMap};
use std::net::{Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};

/// A peer asks to send a file. It waits for [`crate::node::Node::accept()`]
/// or [`crate::node::Node::decline()`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct FileOffer {
    pub source: Ipv4Addr,
    pub alias: String,
    pub filename: String,
}

/// Receive side of a transfer: chunks queued by the dispatcher
/// and payloads already stored by the drain worker.
pub struct InboundTransfer {
    source: Ipv4Addr,
    filename: String,
    received: Mutex<BTreeMap<i64, String>>,
    queue_sender: Sender<Chunk>,
    queue_receiver: Receiver<Chunk>,
    active: AtomicBool,
}

impl InboundTransfer {
    pub fn new(source: Ipv4Addr, filename: &str) -> Self {
        let (queue_sender, queue_receiver) = crossbeam_channel::unbounded();
        Self {
            source,
            filename: filename.into(),
            received: Mutex::new(BTreeMap::new()),
            queue_sender,
            queue_receiver,
            active: AtomicBool::new(true),
        }
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn enqueue(&self, chunk: Chunk) {
        // Never fails: the receiver lives in this same struct.
        let _ = self.queue_sender.send(chunk);
    }

    pub fn queue_len(&self) -> usize {
        self.queue_receiver.len()
    }

    /// Window advertised to the sender: the buffer not taken by queued chunks.
    /// It is negative when the queue exceeds the buffer.
    pub fn window(&self, config: &TransferConfig) -> i64 {
        config.receive_window as i64 - (self.queue_len() * config.max_packet_len) as i64
    }

    /// Stores the payload under its serial. A repeated serial overwrites the previous payload.
    /// Probes carry no content and are not stored.
    pub fn store(&self, chunk: Chunk) {
        if chunk.is_probe() {
            return
        }
        self.received.lock().expect(OTHER_THREAD_ERR).insert(chunk.serial, chunk.payload);
    }

    pub fn received_serials(&self) -> Vec<i64> {
        self.received.lock().expect(OTHER_THREAD_ERR).keys().copied().collect()
    }

    pub fn reassemble(&self, total: usize) -> Result<Vec<u8>, ReceiveError> {
        chunk::reassemble(&self.received.lock().expect(OTHER_THREAD_ERR), total)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Stops the drain worker. Queued chunks are left unacknowledged.
    pub fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
    }
}

/// Worker that drains the queue of an inbound transfer:
/// each chunk is stored and then acknowledged with the current window.
/// Dropping it closes the transfer and waits for the worker to finish.
pub struct DrainWorker {
    transfer: Arc<InboundTransfer>,
    _thread: NamespacedThread<()>,
}

impl DrainWorker {
    pub fn spawn(
        transfer: Arc<InboundTransfer>,
        transport: Arc<dyn Transport>,
        config: TransferConfig,
    ) -> Self {
        let thread = {
            let transfer = transfer.clone();
            NamespacedThread::spawn("inbound-drain", move || {
                while transfer.is_active() {
                    match transfer.queue_receiver.recv_timeout(*SAMPLING_TIMEOUT) {
                        Ok(chunk) => {
                            let window = transfer.window(&config);
                            let serial = chunk.serial;
                            transfer.store(chunk);
                            let ack = Packet::Acknowledge(Acknowledge { serial, window });
                            transport.send_packet(Destination::Unicast(transfer.source), &ack);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::trace!("Drain of '{}' from {} finished", transfer.filename, transfer.source);
            })
        };
        Self { transfer, _thread: thread }
    }

    pub fn transfer(&self) -> &Arc<InboundTransfer> {
        &self.transfer
    }
}

impl Drop for DrainWorker {
    fn drop(&mut self) {
        self.transfer.close();
    }
}

/// Reassembles the file and writes it in `dir`, which is created if missing.
/// An existing file with the same name is replaced.
/// Returns the written path and its size.
pub fn save(transfer: &InboundTransfer, total: usize, dir: &Path) -> Result<(PathBuf, usize), ReceiveError> {
    let content = transfer.reassemble(total)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(local_filename(&transfer.filename));
    std::fs::write(&path, &content)?;
    Ok((path, content.len()))
}

/// The name chosen by the peer without any directory.
fn local_filename(filename: &str) -> &str {
    match filename.rsplit(|c: char| c == '/' || c == '\\').next() {
        None | Some("") | Some(".") | Some("..") => "download",
        Some(name) => name,
    }
}
