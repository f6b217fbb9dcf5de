use lanchat::adapters::memory::{MemoryNetwork, Delivery};
use lanchat::config::{Config, TransferConfig};
use lanchat::events::{EventQueue};
use lanchat::node::{Node, NodeEvent};
use lanchat::packet::{Packet};
use lanchat::transfer::{CancelHandle, SendPhase, TransferError, TransferReport, ReceiveError};
use lanchat::transport::{SendStatus};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tempfile::{TempDir};
use test_case::test_case;

use std::net::{Ipv4Addr};
use std::path::{PathBuf};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const ALICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const BOB: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CAROL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 3);

const TIMEOUT_EVENT_RECV_ERR: &str = "Timeout, but an event was expected.";

lazy_static::lazy_static! {
    static ref TIMEOUT: Duration = Duration::from_secs(10);
    static ref QUIET: Duration = Duration::from_millis(300);
}

mod util {
    use std::sync::{Once};

    // Used to init the log only one time for all tests;
    static INIT: Once = Once::new();

    #[allow(dead_code)]
    pub enum LogThread {
        Enabled,
        Disabled,
    }

    #[allow(dead_code)]
    pub fn init_logger(log_thread: LogThread) {
        INIT.call_once(|| configure_logger(log_thread).unwrap());
    }

    fn configure_logger(log_thread: LogThread) -> Result<(), fern::InitError> {
        fern::Dispatch::new()
            .filter(|metadata| metadata.target().starts_with("lanchat"))
            .format(move |out, message, record| {
                let thread_name = format!("[{}]", std::thread::current().name().unwrap());
                out.finish(format_args!(
                    "[{}][{}][{}]{} {}",
                    chrono::Local::now().format("%M:%S:%f"), // min:sec:nano
                    record.level(),
                    record.target().strip_prefix("lanchat::").unwrap_or(record.target()),
                    if let LogThread::Enabled = log_thread { thread_name } else { String::new() },
                    message,
                ))
            })
            .chain(std::io::stdout())
            .apply()?;
        Ok(())
    }
}

#[allow(unused_imports)]
use util::{LogThread};

/// A node of the memory network with its own downloads directory.
struct Peer {
    node: Arc<Node>,
    events: EventQueue<NodeEvent>,
    downloads: TempDir,
}

impl Peer {
    fn join(network: &MemoryNetwork, alias: &str, address: Ipv4Addr, transfer: TransferConfig) -> Peer {
        let downloads = tempfile::tempdir().unwrap();
        let config = Config::new(alias, address)
            .with_downloads_dir(downloads.path())
            .with_transfer(transfer);
        let (node, events) = Node::with_transport(config, Arc::new(network.transport(address)));
        network.attach(address, node.dispatcher());
        Peer { node: Arc::new(node), events, downloads }
    }

    /// Waits for the first event accepted by `select`, discarding the previous ones.
    fn wait<T>(&mut self, mut select: impl FnMut(NodeEvent) -> Option<T>) -> T {
        let start = Instant::now();
        while start.elapsed() < *TIMEOUT {
            if let Some(event) = self.events.receive_timeout(*TIMEOUT) {
                if let Some(selected) = select(event) {
                    return selected
                }
            }
        }
        panic!("{}", TIMEOUT_EVENT_RECV_ERR);
    }

    fn accept_next_offer(&mut self) {
        let offer = self.wait(|event| match event {
            NodeEvent::FileOffered(offer) => Some(offer),
            _ => None,
        });
        self.node.accept(&offer).unwrap();
    }

    fn wait_download(&mut self) -> Result<(PathBuf, usize), ReceiveError> {
        self.wait(|event| match event {
            NodeEvent::DownloadSaved { path, size, .. } => Some(Ok((path, size))),
            NodeEvent::DownloadFailed { reason, .. } => Some(Err(reason)),
            _ => None,
        })
    }
}

/// Short timings so the failures are detected quickly.
fn fast_transfer() -> TransferConfig {
    TransferConfig::default()
        .with_ack_timeout(Duration::from_millis(100))
        .with_suspend_cooldown(Duration::from_millis(50))
}

fn random_file(dir: &TempDir, name: &str, size: usize) -> (PathBuf, Vec<u8>) {
    let mut content = vec![0u8; size];
    StdRng::seed_from_u64(size as u64).fill(&mut content[..]);
    let path = dir.path().join(name);
    std::fs::write(&path, &content).unwrap();
    (path, content)
}

fn send_in_background(
    node: &Arc<Node>,
    to: Ipv4Addr,
    path: PathBuf,
    cancel: CancelHandle,
) -> JoinHandle<Result<TransferReport, TransferError>> {
    let node = node.clone();
    thread::Builder::new()
        .name("test-sender".into())
        .spawn(move || node.send_file(to, path, &cancel))
        .unwrap()
}

fn wait_until(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < *TIMEOUT, "Condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn is_data_chunk(delivery: &Delivery, serial: Option<i64>) -> bool {
    match delivery.packet() {
        Some(Packet::FileChunk(_, chunk)) => {
            !chunk.is_probe() && serial.map_or(true, |serial| chunk.serial == serial)
        }
        _ => false,
    }
}

/// Gives the receiver time to acknowledge the first chunk before the second one is sent.
fn slow_second_chunk(delivery: &Delivery) {
    if is_data_chunk(delivery, Some(1)) {
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn discovery_is_symmetric() {
    //util::init_logger(LogThread::Enabled); // Enable it for better debugging

    let network = MemoryNetwork::new();
    let mut alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    alice.node.discover();

    let joined = bob.wait(|event| match event {
        NodeEvent::PeerJoined(entry) => Some(entry),
        _ => None,
    });
    assert_eq!((joined.address, joined.alias.as_str()), (ALICE, "alice"));

    let joined = alice.wait(|event| match event {
        NodeEvent::PeerJoined(entry) => Some(entry),
        _ => None,
    });
    assert_eq!((joined.address, joined.alias.as_str()), (BOB, "bob"));

    assert_eq!(alice.node.presence().alias_of(BOB).as_deref(), Some("bob"));
    assert_eq!(bob.node.presence().alias_of(ALICE).as_deref(), Some("alice"));
    assert_eq!(alice.node.peers().len(), 1);

    // The last reference stops the node, which says goodbye.
    drop(bob.node);
    let left = alice.wait(|event| match event {
        NodeEvent::PeerLeft(entry) => Some(entry),
        _ => None,
    });
    assert_eq!(left.address, BOB);
    assert!(alice.node.peers().is_empty());
}

#[test]
fn message_delivery() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    assert_eq!(alice.node.send_message(BOB, "selam bob"), SendStatus::Sent);
    let (header, text) = bob.wait(|event| match event {
        NodeEvent::MessageReceived(header, text) => Some((header, text)),
        _ => None,
    });
    assert_eq!(header.address, ALICE);
    assert_eq!(header.alias, "alice");
    assert_eq!(text, "selam bob");

    let nobody = Ipv4Addr::new(10, 0, 0, 99);
    assert_eq!(alice.node.send_message(nobody, "hello?"), SendStatus::Unreachable);
}

#[test]
fn messages_flow_again_once_the_filter_is_cleared() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    network.set_filter(|_| false);
    assert_eq!(alice.node.send_message(BOB, "lost"), SendStatus::Unreachable);

    network.clear_filter();
    assert_eq!(alice.node.send_message(BOB, "delivered"), SendStatus::Sent);
    let text = bob.wait(|event| match event {
        NodeEvent::MessageReceived(_, text) => Some(text),
        _ => None,
    });
    assert_eq!(text, "delivered");
}

#[test_case(0 ; "empty")]
#[test_case(1 ; "one byte")]
#[test_case(4000 ; "a few chunks")]
#[test_case(300_000 ; "hundreds of chunks")]
fn file_is_received_byte_identical(size: usize) {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let (path, content) = random_file(&alice.downloads, "random.bin", size);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());

    bob.accept_next_offer();
    let (saved, saved_size) = bob.wait_download().unwrap();

    let report = sender.join().unwrap().unwrap();
    assert_eq!(saved, bob.downloads.path().join("random.bin"));
    assert_eq!(saved_size, size);
    assert_eq!(std::fs::read(saved).unwrap(), content);
    assert_eq!(report.total_chunks == 0, size == 0);
    assert_eq!(report.suspensions, 0);
    assert!(alice.node.send_phase().is_none());
    assert!(!bob.node.is_receiving());
}

#[test]
fn four_thousand_bytes_in_three_chunks() {
    // Envelope of a FILE from alice at 10.0.0.1 plus a payload budget of 1800.
    let budget = 1800;
    let header = lanchat::packet::Header::new("alice", ALICE);
    let overhead = 1500 - lanchat::packet::Chunk::payload_budget(&header, 1500);
    let transfer = fast_transfer().with_max_packet_len(overhead + budget);

    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, transfer.clone());
    let mut bob = Peer::join(&network, "bob", BOB, transfer);

    let serials = Arc::new(std::sync::Mutex::new(Vec::new()));
    let recorded = serials.clone();
    network.set_filter(move |delivery| {
        if let Some(Packet::FileChunk(_, chunk)) = delivery.packet() {
            recorded.lock().unwrap().push(chunk.serial);
        }
        true
    });

    let (path, content) = random_file(&alice.downloads, "four.bin", 4000);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());
    bob.accept_next_offer();
    let (saved, _) = bob.wait_download().unwrap();

    assert_eq!(sender.join().unwrap().unwrap().total_chunks, 3);
    assert_eq!(*serials.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(std::fs::read(saved).unwrap(), content);
}

#[test]
fn duplicated_chunk_is_stored_once_and_acknowledged_twice() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let bob_dispatcher = Arc::downgrade(bob.node.dispatcher());
    let duplicated = Arc::new(AtomicBool::new(false));
    let first_acks = Arc::new(AtomicUsize::new(0));
    let counter = first_acks.clone();
    network.set_filter(move |delivery| {
        match delivery.packet() {
            Some(Packet::FileChunk(_, chunk)) if chunk.serial == 0 => {
                if !duplicated.swap(true, Ordering::SeqCst) {
                    if let Some(dispatcher) = bob_dispatcher.upgrade() {
                        dispatcher.dispatch(delivery.channel, delivery.data);
                    }
                }
            }
            Some(Packet::Acknowledge(ack)) if ack.serial == 0 => {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            _ => (),
        }
        true
    });

    let (path, content) = random_file(&alice.downloads, "twice.bin", 10_000);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());
    bob.accept_next_offer();
    let (saved, _) = bob.wait_download().unwrap();

    let report = sender.join().unwrap().unwrap();
    assert_eq!(report.resent, 0);
    assert_eq!(first_acks.load(Ordering::SeqCst), 2);
    assert_eq!(std::fs::read(saved).unwrap(), content);
}

#[test]
fn lost_acknowledgment_fails_the_transfer_once() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();
    network.set_filter(move |delivery| match delivery.packet() {
        Some(Packet::Acknowledge(ack)) => ack.serial != 1,
        Some(Packet::TransferFailed(..)) => {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        }
        _ => true,
    });

    let (path, _) = random_file(&alice.downloads, "lossy.bin", 20_000);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());
    bob.accept_next_offer();

    let reason = bob.wait_download().unwrap_err();
    assert!(matches!(reason, ReceiveError::Aborted));

    let result = sender.join().unwrap();
    assert!(matches!(result, Err(TransferError::PacketLoss { serial: 1 })));
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert!(!bob.downloads.path().join("lossy.bin").exists());
    assert!(!bob.node.is_receiving());
}

#[test]
fn low_window_suspends_until_a_probe_reports_recovery() {
    let network = MemoryNetwork::new();
    let sender_config = fast_transfer().with_low_window(1500).with_recovery_window(500);
    let alice = Peer::join(&network, "alice", ALICE, sender_config);
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer().with_receive_window(1000));

    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    network.set_filter(move |delivery| {
        slow_second_chunk(delivery);
        if let Some(Packet::FileChunk(_, chunk)) = delivery.packet() {
            if chunk.is_probe() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }
        true
    });

    let (path, content) = random_file(&alice.downloads, "window.bin", 20_000);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());
    bob.accept_next_offer();
    let (saved, _) = bob.wait_download().unwrap();

    let report = sender.join().unwrap().unwrap();
    assert!(report.suspensions >= 1);
    assert!(probes.load(Ordering::SeqCst) >= report.suspensions);
    assert_eq!(std::fs::read(saved).unwrap(), content);
}

#[test]
fn suspended_sender_sends_no_chunks() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer().with_receive_window(1000));

    let data_chunks = Arc::new(AtomicUsize::new(0));
    let probes = Arc::new(AtomicUsize::new(0));
    let (data_counter, probe_counter) = (data_chunks.clone(), probes.clone());
    network.set_filter(move |delivery| {
        slow_second_chunk(delivery);
        if let Some(Packet::FileChunk(_, chunk)) = delivery.packet() {
            match chunk.is_probe() {
                true => probe_counter.fetch_add(1, Ordering::SeqCst),
                false => data_counter.fetch_add(1, Ordering::SeqCst),
            };
        }
        true
    });

    let (path, _) = random_file(&alice.downloads, "stuck.bin", 20_000);
    let sender = send_in_background(&alice.node, BOB, path, CancelHandle::new());
    bob.accept_next_offer();

    // Probes keep reporting a window under the recovery threshold.
    wait_until(|| probes.load(Ordering::SeqCst) >= 2);
    assert_eq!(alice.node.send_phase(), Some(SendPhase::Suspended));
    let sent = data_chunks.load(Ordering::SeqCst);
    thread::sleep(*QUIET);
    assert_eq!(data_chunks.load(Ordering::SeqCst), sent);

    // Without answers to the probes the receiver is considered lost.
    network.set_filter(|delivery| delivery.from != BOB);
    let result = sender.join().unwrap();
    assert!(matches!(result, Err(TransferError::PacketLoss { serial: -1 })));
    assert!(matches!(bob.wait_download(), Err(ReceiveError::Aborted)));
}

#[test]
fn cancel_while_awaiting_consent() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let (path, _) = random_file(&alice.downloads, "unwanted.bin", 100);
    let cancel = CancelHandle::new();
    let sender = send_in_background(&alice.node, BOB, path, cancel.clone());

    let offer = bob.wait(|event| match event {
        NodeEvent::FileOffered(offer) => Some(offer),
        _ => None,
    });
    assert_eq!(offer.filename, "unwanted.bin");
    assert_eq!(alice.node.send_phase(), Some(SendPhase::AwaitingConsent));

    cancel.cancel();
    assert!(matches!(sender.join().unwrap(), Err(TransferError::Cancelled)));
    assert!(alice.node.send_phase().is_none());

    // The answer arrives too late: nothing is sent.
    bob.node.accept(&offer).unwrap();
    thread::sleep(*QUIET);
    assert!(bob.node.is_receiving());
}

#[test]
fn declined_offer_leaves_the_sender_waiting() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let (path, _) = random_file(&alice.downloads, "declined.bin", 100);
    let cancel = CancelHandle::new();
    let sender = send_in_background(&alice.node, BOB, path, cancel.clone());

    let offer = bob.wait(|event| match event {
        NodeEvent::FileOffered(offer) => Some(offer),
        _ => None,
    });
    bob.node.decline(&offer).unwrap();
    assert!(bob.node.pending_offers().is_empty());

    thread::sleep(*QUIET);
    assert_eq!(alice.node.send_phase(), Some(SendPhase::AwaitingConsent));

    cancel.cancel();
    assert!(matches!(sender.join().unwrap(), Err(TransferError::Cancelled)));
}

#[test]
fn second_offer_waits_for_the_running_download() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let carol = Peer::join(&network, "carol", CAROL, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    // Every chunk of alice is lost: her transfer keeps bob busy until it fails.
    network.set_filter(|delivery| !(delivery.from == ALICE && is_data_chunk(delivery, None)));

    let (alice_path, _) = random_file(&alice.downloads, "first.bin", 5000);
    let alice_sender = send_in_background(&alice.node, BOB, alice_path, CancelHandle::new());
    bob.accept_next_offer();
    assert!(bob.node.is_receiving());

    let (carol_path, carol_content) = random_file(&carol.downloads, "second.bin", 5000);
    let carol_sender = send_in_background(&carol.node, BOB, carol_path, CancelHandle::new());
    let offer = bob.wait(|event| match event {
        NodeEvent::FileOffered(offer) => Some(offer),
        _ => None,
    });
    assert_eq!(offer.source, CAROL);
    assert!(matches!(bob.node.accept(&offer), Err(TransferError::ReceiverBusy)));
    assert_eq!(bob.node.pending_offers(), vec![offer.clone()]);

    assert!(matches!(bob.wait_download(), Err(ReceiveError::Aborted)));
    assert!(matches!(alice_sender.join().unwrap(), Err(TransferError::PacketLoss { serial: 0 })));

    bob.node.accept(&offer).unwrap();
    let (saved, _) = bob.wait_download().unwrap();
    assert!(carol_sender.join().unwrap().is_ok());
    assert_eq!(std::fs::read(saved).unwrap(), carol_content);
}

#[test]
fn one_send_at_a_time() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());
    let mut bob = Peer::join(&network, "bob", BOB, fast_transfer());

    let (path, _) = random_file(&alice.downloads, "once.bin", 100);
    let cancel = CancelHandle::new();
    let sender = send_in_background(&alice.node, BOB, path.clone(), cancel.clone());
    bob.wait(|event| match event {
        NodeEvent::FileOffered(offer) => Some(offer),
        _ => None,
    });

    let result = alice.node.send_file(BOB, &path, &CancelHandle::new());
    assert!(matches!(result, Err(TransferError::SenderBusy)));

    cancel.cancel();
    assert!(matches!(sender.join().unwrap(), Err(TransferError::Cancelled)));
}

#[test]
fn offer_to_an_offline_peer() {
    let network = MemoryNetwork::new();
    let alice = Peer::join(&network, "alice", ALICE, fast_transfer());

    let (path, _) = random_file(&alice.downloads, "nobody.bin", 100);
    let result = alice.node.send_file(BOB, &path, &CancelHandle::new());
    assert!(matches!(result, Err(TransferError::ConsentUnreachable(peer)) if peer == BOB));

    let missing = alice.downloads.path().join("missing.bin");
    let result = alice.node.send_file(BOB, &missing, &CancelHandle::new());
    assert!(matches!(result, Err(TransferError::Io(_))));
    assert!(alice.node.send_phase().is_none());
}
