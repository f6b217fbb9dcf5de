use crate::adapters::lan::{LanTransport};
use crate::config::{Config, TransferConfig};
use crate::events::{EventQueue, EventSender};
use crate::listener::{ListenerPair};
use crate::packet::{Channel, Header, Packet};
use crate::presence::{PresenceDirectory, PresenceEntry, Upsert};
use crate::transfer::{
    CancelHandle, FileOffer, InboundTransfer, OutboundTransfer, ReceiveError, SendPhase,
    TransferError, TransferReport,
};
use crate::transfer::chunk::{self};
use crate::transfer::receiver::{self, DrainWorker};
use crate::transfer::sender::{self};
use crate::transport::{Transport, Destination, SendStatus};
use crate::util::thread::{NamespacedThread, OTHER_THREAD_ERR};

use std::collections::{HashMap};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::io::{self, ErrorKind};

/// What happens to a node, received through its [`EventQueue`].
#[derive(Debug)]
pub enum NodeEvent {
    PeerJoined(PresenceEntry),
    PeerRenamed { address: Ipv4Addr, previous: String, alias: String },
    PeerLeft(PresenceEntry),
    MessageReceived(Header, String),

    /// A peer wants to send a file. Answer it with [`Node::accept()`] or [`Node::decline()`].
    /// This event is sent with priority.
    FileOffered(FileOffer),

    DownloadSaved { source: Ipv4Addr, path: PathBuf, size: usize },
    DownloadFailed { source: Ipv4Addr, filename: String, reason: ReceiveError },
}

/// Returned by [`Dispatcher::dispatch()`]: whether the listener must keep running.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Flow {
    Continue,
    /// The own node sent `Quit`.
    Stop,
}

/// Routes each received packet to the presence directory, the transfers or the event queue.
pub struct Dispatcher {
    header: Header,
    downloads_dir: PathBuf,
    transfer_config: TransferConfig,
    presence: PresenceDirectory,
    transport: Arc<dyn Transport>,
    events: EventSender<NodeEvent>,
    offers: Mutex<HashMap<Ipv4Addr, FileOffer>>,
    outbound: Mutex<Option<Arc<OutboundTransfer>>>,
    inbound: Mutex<Option<DrainWorker>>,
    saving: Mutex<Vec<NamespacedThread<()>>>,
}

impl Dispatcher {
    fn new(config: &Config, transport: Arc<dyn Transport>, events: EventSender<NodeEvent>) -> Self {
        Self {
            header: Header::new(&config.alias, config.address),
            downloads_dir: config.downloads_dir.clone(),
            transfer_config: config.transfer.clone(),
            presence: PresenceDirectory::new(config.address),
            transport,
            events,
            offers: Mutex::new(HashMap::new()),
            outbound: Mutex::new(None),
            inbound: Mutex::new(None),
            saving: Mutex::new(Vec::new()),
        }
    }

    /// Processes one unit received by `channel`.
    /// Invalid units, packets that arrive by the wrong channel
    /// and packets sent by this same node are dropped.
    pub fn dispatch(&self, channel: Channel, data: &str) -> Flow {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(err) => {
                log::trace!("Dropped {:?} unit: {}", channel, err);
                return Flow::Continue
            }
        };

        if packet.channel() != channel {
            log::trace!("Dropped {}: received by {:?}", packet.kind(), channel);
            return Flow::Continue
        }

        if let Some(header) = packet.header() {
            if header.address == self.header.address {
                return match packet {
                    Packet::Quit(_) => Flow::Stop,
                    _ => Flow::Continue,
                }
            }
        }

        log::trace!("Received {}", packet.kind());
        self.process(packet);
        Flow::Continue
    }

    fn process(&self, packet: Packet) {
        match packet {
            Packet::Discover(header) => {
                self.register(&header);
                let respond = Packet::Respond(self.header.clone());
                self.transport.send_packet(header.address.into(), &respond);
            }
            Packet::Respond(header) => self.register(&header),
            Packet::Goodbye(header) => {
                if let Some(alias) = self.presence.remove(header.address) {
                    let entry = PresenceEntry { address: header.address, alias };
                    self.events.send(NodeEvent::PeerLeft(entry));
                }
            }
            Packet::Message(header, text) => {
                log::debug!("Message from {}", header.address);
                self.events.send(NodeEvent::MessageReceived(header, text));
            }
            Packet::Allow(header, filename) => {
                let offer = FileOffer { source: header.address, alias: header.alias, filename };
                log::info!("{} offers '{}'", offer.source, offer.filename);
                self.offers.lock().expect(OTHER_THREAD_ERR).insert(offer.source, offer.clone());
                self.events.send_with_priority(NodeEvent::FileOffered(offer));
            }
            Packet::ConsentGranted(header) => match self.outbound_with(header.address) {
                Some(transfer) => transfer.grant_consent(),
                None => log::debug!("Consent of {} without request", header.address),
            },
            Packet::FileChunk(header, chunk) => match self.inbound_from(header.address) {
                Some(transfer) => transfer.enqueue(chunk),
                None => log::trace!("Chunk {} of {} dropped", chunk.serial, header.address),
            },
            Packet::TransferSucceeded(header, total) => {
                self.finish_download(header.address, Some(total))
            }
            Packet::TransferFailed(header, _) => self.finish_download(header.address, None),
            Packet::Quit(header) => log::debug!("Quit of {} ignored", header.address),
            Packet::Acknowledge(ack) => {
                // Acknowledgments are anonymous: they belong to the running send.
                let transfer = self.outbound.lock().expect(OTHER_THREAD_ERR).clone();
                match transfer {
                    Some(transfer) => transfer.acknowledge(ack),
                    None => log::trace!("Ack {} dropped", ack.serial),
                }
            }
        }
    }

    fn register(&self, header: &Header) {
        match self.presence.upsert(header.address, &header.alias) {
            Upsert::Added => {
                let entry = PresenceEntry { address: header.address, alias: header.alias.clone() };
                self.events.send(NodeEvent::PeerJoined(entry));
            }
            Upsert::Renamed { previous } => self.events.send(NodeEvent::PeerRenamed {
                address: header.address,
                previous,
                alias: header.alias.clone(),
            }),
            Upsert::Unchanged | Upsert::Ignored => (),
        }
    }

    fn outbound_with(&self, peer: Ipv4Addr) -> Option<Arc<OutboundTransfer>> {
        let outbound = self.outbound.lock().expect(OTHER_THREAD_ERR);
        outbound.as_ref().filter(|transfer| transfer.peer() == peer).cloned()
    }

    fn inbound_from(&self, source: Ipv4Addr) -> Option<Arc<InboundTransfer>> {
        let inbound = self.inbound.lock().expect(OTHER_THREAD_ERR);
        inbound
            .as_ref()
            .map(DrainWorker::transfer)
            .filter(|transfer| transfer.source() == source)
            .cloned()
    }

    /// Ends the download of `source`: saved if `total` is known, discarded otherwise.
    /// The file is written by its own worker, so the listener keeps dispatching meanwhile.
    fn finish_download(&self, source: Ipv4Addr, total: Option<usize>) {
        let worker = {
            let mut inbound = self.inbound.lock().expect(OTHER_THREAD_ERR);
            let from_source = inbound.as_ref().map_or(false, |w| w.transfer().source() == source);
            if from_source { inbound.take() } else { None }
        };

        let worker = match worker {
            Some(worker) => worker,
            None => return log::debug!("End of transfer of {} without transfer", source),
        };

        let downloads_dir = self.downloads_dir.clone();
        let events = self.events.clone();
        let thread = NamespacedThread::spawn("download-save", move || {
            let transfer = worker.transfer().clone();
            drop(worker);
            // The drain worker is stopped: nothing else is stored from now on.

            let result = match total {
                Some(total) => receiver::save(&transfer, total, &downloads_dir),
                None => Err(ReceiveError::Aborted),
            };

            let filename = transfer.filename().to_string();
            match result {
                Ok((path, size)) => {
                    log::info!("'{}' of {} saved in {} ({} bytes)", filename, source, path.display(), size);
                    events.send(NodeEvent::DownloadSaved { source, path, size });
                }
                Err(reason) => {
                    log::warn!("'{}' of {} not saved: {}", filename, source, reason);
                    events.send(NodeEvent::DownloadFailed { source, filename, reason });
                }
            }
        });

        let mut saving = self.saving.lock().expect(OTHER_THREAD_ERR);
        saving.retain(|thread| !thread.is_finished());
        saving.push(thread);
    }

    /// Waits for every download still being written.
    fn wait_saves(&self) {
        let saving = std::mem::take(&mut *self.saving.lock().expect(OTHER_THREAD_ERR));
        drop(saving);
    }

    fn accept(&self, offer: &FileOffer) -> Result<(), TransferError> {
        let pending = self.offers.lock().expect(OTHER_THREAD_ERR).get(&offer.source) == Some(offer);
        if !pending {
            return Err(TransferError::NoSuchOffer)
        }

        {
            let mut inbound = self.inbound.lock().expect(OTHER_THREAD_ERR);
            if let Some(worker) = inbound.as_ref() {
                let current = worker.transfer();
                log::warn!(
                    "'{}' of {} rejected: receiving '{}' of {}",
                    offer.filename,
                    offer.source,
                    current.filename(),
                    current.source()
                );
                return Err(TransferError::ReceiverBusy)
            }
            let transfer = Arc::new(InboundTransfer::new(offer.source, &offer.filename));
            let config = self.transfer_config.clone();
            *inbound = Some(DrainWorker::spawn(transfer, self.transport.clone(), config));
        }
        self.offers.lock().expect(OTHER_THREAD_ERR).remove(&offer.source);

        let consent = Packet::ConsentGranted(self.header.clone());
        if !self.transport.send_packet(offer.source.into(), &consent).is_sent() {
            let worker = self.inbound.lock().expect(OTHER_THREAD_ERR).take();
            drop(worker);
            return Err(TransferError::ConsentUnreachable(offer.source))
        }

        log::info!("Receiving '{}' from {}", offer.filename, offer.source);
        Ok(())
    }

    fn decline(&self, offer: &FileOffer) -> Result<(), TransferError> {
        let mut offers = self.offers.lock().expect(OTHER_THREAD_ERR);
        match offers.get(&offer.source) {
            Some(pending) if pending == offer => {
                offers.remove(&offer.source);
                log::info!("'{}' of {} declined", offer.filename, offer.source);
                Ok(())
            }
            _ => Err(TransferError::NoSuchOffer),
        }
    }

    fn send_file(
        &self,
        peer: Ipv4Addr,
        path: &Path,
        cancel: &CancelHandle,
    ) -> Result<TransferReport, TransferError> {
        let filename = path.file_name().and_then(|name| name.to_str()).ok_or_else(|| {
            io::Error::new(ErrorKind::InvalidInput, format!("{} is not a file", path.display()))
        })?;
        let chunks = chunk::chunk_file(path, &self.header, self.transfer_config.max_packet_len)?;

        let transfer = Arc::new(OutboundTransfer::new(peer, filename));
        {
            let mut outbound = self.outbound.lock().expect(OTHER_THREAD_ERR);
            if outbound.is_some() {
                return Err(TransferError::SenderBusy)
            }
            *outbound = Some(transfer.clone());
        }

        let transport = self.transport.as_ref();
        let result = sender::request_consent(&transfer, &self.header, transport, cancel)
            .and_then(|()| {
                sender::send_chunks(&transfer, chunks, &self.header, transport, &self.transfer_config)
            });

        *self.outbound.lock().expect(OTHER_THREAD_ERR) = None;
        result
    }
}

/// A chat peer of the local network.
///
/// It is created already working: it answers discovery, receives messages and offers
/// and sends what it is asked to. What it receives is published in the [`EventQueue`]
/// returned with it.
///
/// # Examples
/// ```no_run
/// use lanchat::config::{Config};
/// use lanchat::node::{Node, NodeEvent};
///
/// let config = Config::new("burak", "192.168.1.20".parse().unwrap());
/// let (node, mut events) = Node::start(config).unwrap();
///
/// loop {
///     match events.receive() {
///         NodeEvent::PeerJoined(peer) => {
///             node.send_message(peer.address, "hello");
///         }
///         NodeEvent::FileOffered(offer) => {
///             node.accept(&offer).unwrap();
///         }
///         _ => (),
///     }
/// }
/// ```
pub struct Node {
    dispatcher: Arc<Dispatcher>,
    listeners: Option<ListenerPair>,
    announce_repeats: usize,
    running: bool,
}

impl Node {
    /// Starts a node in the local network: binds the listeners in the port of the
    /// configuration and announces the node with `Discover`.
    pub fn start(config: Config) -> io::Result<(Node, EventQueue<NodeEvent>)> {
        let transport = Arc::new(LanTransport::new(&config)?);
        let queue = EventQueue::new();
        let dispatcher = Arc::new(Dispatcher::new(&config, transport, queue.sender().clone()));

        let listen_addr = SocketAddrV4::new(config.listen_address, config.port);
        let listeners = ListenerPair::spawn(listen_addr, dispatcher.clone())?;

        let node = Node {
            dispatcher,
            listeners: Some(listeners),
            announce_repeats: config.announce_repeats,
            running: true,
        };
        node.discover();
        Ok((node, queue))
    }

    /// Creates a node without listeners that sends by `transport`.
    /// The received data must be passed to [`Node::dispatcher()`] by the owner of the transport
    /// (e.g. [`crate::adapters::memory::MemoryNetwork::attach()`]).
    /// Nothing is announced until [`Node::discover()`] is called.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> (Node, EventQueue<NodeEvent>) {
        let queue = EventQueue::new();
        let dispatcher = Arc::new(Dispatcher::new(&config, transport, queue.sender().clone()));
        let node = Node {
            dispatcher,
            listeners: None,
            announce_repeats: config.announce_repeats,
            running: true,
        };
        (node, queue)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn header(&self) -> &Header {
        &self.dispatcher.header
    }

    pub fn address(&self) -> Ipv4Addr {
        self.dispatcher.header.address
    }

    pub fn listeners(&self) -> Option<&ListenerPair> {
        self.listeners.as_ref()
    }

    /// Known peers ordered by address.
    pub fn peers(&self) -> Vec<PresenceEntry> {
        self.dispatcher.presence.snapshot()
    }

    pub fn presence(&self) -> &PresenceDirectory {
        &self.dispatcher.presence
    }

    /// Broadcasts `Discover`. Every peer answers with `Respond`.
    pub fn discover(&self) {
        let discover = Packet::Discover(self.dispatcher.header.clone());
        for _ in 0..self.announce_repeats {
            self.dispatcher.transport.send_packet(Destination::Broadcast, &discover);
        }
    }

    /// Sends one line of text. A status other than [`SendStatus::Sent`] means the peer is offline.
    pub fn send_message(&self, peer: Ipv4Addr, text: &str) -> SendStatus {
        let message = Packet::Message(self.dispatcher.header.clone(), text.into());
        self.dispatcher.transport.send_packet(peer.into(), &message)
    }

    /// Sends the file at `path` to `peer`, blocking until the transfer ends.
    /// The peer is asked first: `cancel` stops the wait for its answer.
    /// Only one file is sent at a time.
    pub fn send_file(
        &self,
        peer: Ipv4Addr,
        path: impl AsRef<Path>,
        cancel: &CancelHandle,
    ) -> Result<TransferReport, TransferError> {
        self.dispatcher.send_file(peer, path.as_ref(), cancel)
    }

    /// Phase of the running send, if any.
    pub fn send_phase(&self) -> Option<SendPhase> {
        let outbound = self.dispatcher.outbound.lock().expect(OTHER_THREAD_ERR);
        outbound.as_ref().map(|transfer| transfer.phase())
    }

    /// Offers not answered yet.
    pub fn pending_offers(&self) -> Vec<FileOffer> {
        self.dispatcher.offers.lock().expect(OTHER_THREAD_ERR).values().cloned().collect()
    }

    /// Accepts the offer and starts receiving it.
    /// Only one file is received at a time: an offer accepted while receiving another one
    /// is rejected with [`TransferError::ReceiverBusy`] and stays pending.
    pub fn accept(&self, offer: &FileOffer) -> Result<(), TransferError> {
        self.dispatcher.accept(offer)
    }

    /// Forgets the offer. The peer is not notified.
    pub fn decline(&self, offer: &FileOffer) -> Result<(), TransferError> {
        self.dispatcher.decline(offer)
    }

    pub fn is_receiving(&self) -> bool {
        self.dispatcher.inbound.lock().expect(OTHER_THREAD_ERR).is_some()
    }

    /// Says goodbye to the network and stops the listeners.
    /// A file being received is discarded, a file already complete is written before returning.
    pub fn stop(&mut self) {
        if !self.running {
            return
        }
        self.running = false;

        let transport = &self.dispatcher.transport;
        let header = &self.dispatcher.header;
        if let Some(mut listeners) = self.listeners.take() {
            transport.send_packet(header.address.into(), &Packet::Quit(header.clone()));
            listeners.stop();
        }

        let goodbye = Packet::Goodbye(header.clone());
        for _ in 0..self.announce_repeats {
            transport.send_packet(Destination::Broadcast, &goodbye);
        }

        let worker = self.dispatcher.inbound.lock().expect(OTHER_THREAD_ERR).take();
        drop(worker);
        self.dispatcher.wait_saves();
        log::debug!("Node {} stopped", header.address);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::packet::{Acknowledge, Chunk};

    use std::time::{Duration};

    const OWN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    /// Records what is sent instead of sending it.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(Destination, Packet)>>,
    }

    impl Recorder {
        fn packets(&self) -> Vec<(Destination, Packet)> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Transport for Recorder {
        fn send_datagram(&self, destination: Destination, data: &str) -> SendStatus {
            self.sent.lock().unwrap().push((destination, Packet::decode(data).unwrap()));
            SendStatus::Sent
        }

        fn send_stream(&self, address: Ipv4Addr, data: &str) -> SendStatus {
            self.sent.lock().unwrap().push((address.into(), Packet::decode(data).unwrap()));
            SendStatus::Sent
        }
    }

    fn node() -> (Node, EventQueue<NodeEvent>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let config = Config::new("own", OWN).with_announce_repeats(2);
        let (node, events) = Node::with_transport(config, recorder.clone());
        (node, events, recorder)
    }

    fn peer() -> Header {
        Header::new("peer", PEER)
    }

    fn dispatch(node: &Node, packet: Packet) -> Flow {
        node.dispatcher().dispatch(packet.channel(), &packet.encode())
    }

    fn next_event(events: &mut EventQueue<NodeEvent>) -> NodeEvent {
        events.receive_timeout(Duration::from_secs(1)).expect("No event")
    }

    #[test]
    fn discover_is_answered() {
        let (node, mut events, recorder) = node();
        dispatch(&node, Packet::Discover(peer()));

        assert_eq!(
            recorder.packets(),
            vec![(Destination::Unicast(PEER), Packet::Respond(Header::new("own", OWN)))]
        );
        match next_event(&mut events) {
            NodeEvent::PeerJoined(entry) => assert_eq!(entry.address, PEER),
            event => panic!("Unexpected {:?}", event),
        }
        assert_eq!(node.presence().alias_of(PEER).as_deref(), Some("peer"));
    }

    #[test]
    fn rename_and_goodbye() {
        let (node, mut events, _) = node();
        dispatch(&node, Packet::Respond(peer()));
        dispatch(&node, Packet::Respond(Header::new("peer2", PEER)));
        dispatch(&node, Packet::Goodbye(peer()));

        assert!(matches!(next_event(&mut events), NodeEvent::PeerJoined(_)));
        match next_event(&mut events) {
            NodeEvent::PeerRenamed { previous, alias, .. } => {
                assert_eq!(previous, "peer");
                assert_eq!(alias, "peer2");
            }
            event => panic!("Unexpected {:?}", event),
        }
        match next_event(&mut events) {
            NodeEvent::PeerLeft(entry) => assert_eq!(entry.alias, "peer2"),
            event => panic!("Unexpected {:?}", event),
        }
        assert!(node.peers().is_empty());
    }

    #[test]
    fn own_packets_are_ignored() {
        let (node, mut events, recorder) = node();
        let own = Header::new("own", OWN);
        assert_eq!(dispatch(&node, Packet::Discover(own.clone())), Flow::Continue);
        assert_eq!(dispatch(&node, Packet::Quit(own)), Flow::Stop);
        assert_eq!(dispatch(&node, Packet::Quit(peer())), Flow::Continue);
        assert!(recorder.packets().is_empty());
        assert!(events.try_receive().is_none());
    }

    #[test]
    fn invalid_units_are_dropped() {
        let (node, mut events, _) = node();
        assert_eq!(node.dispatcher().dispatch(Channel::Stream, "QUIT"), Flow::Continue);
        // A Discover must arrive as a datagram.
        let discover = Packet::Discover(peer()).encode();
        node.dispatcher().dispatch(Channel::Stream, &discover);
        assert!(events.try_receive().is_none());
    }

    #[test]
    fn offer_is_published_with_priority() {
        let (node, mut events, _) = node();
        dispatch(&node, Packet::Message(peer(), "selam".into()));
        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));

        match next_event(&mut events) {
            NodeEvent::FileOffered(offer) => {
                assert_eq!(offer, FileOffer {
                    source: PEER,
                    alias: "peer".into(),
                    filename: "notes.txt".into()
                });
            }
            event => panic!("Unexpected {:?}", event),
        }
        match next_event(&mut events) {
            NodeEvent::MessageReceived(header, text) => {
                assert_eq!(header, peer());
                assert_eq!(text, "selam");
            }
            event => panic!("Unexpected {:?}", event),
        }
        assert_eq!(node.pending_offers().len(), 1);
    }

    #[test]
    fn accept_answers_with_consent() {
        let (node, _events, recorder) = node();
        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);

        node.accept(&offer).unwrap();
        assert!(node.is_receiving());
        assert!(node.pending_offers().is_empty());
        assert!(recorder
            .packets()
            .contains(&(Destination::Unicast(PEER), Packet::ConsentGranted(Header::new("own", OWN)))));
        assert!(matches!(node.accept(&offer), Err(TransferError::NoSuchOffer)));
    }

    #[test]
    fn second_offer_while_receiving() {
        let (node, _events, _) = node();
        let other = Header::new("other", Ipv4Addr::new(10, 0, 0, 3));
        dispatch(&node, Packet::Allow(peer(), "a.txt".into()));
        dispatch(&node, Packet::Allow(other.clone(), "b.txt".into()));

        let offers = node.pending_offers();
        let first = offers.iter().find(|offer| offer.source == PEER).unwrap();
        let second = offers.iter().find(|offer| offer.source == other.address).unwrap();

        node.accept(first).unwrap();
        assert!(matches!(node.accept(second), Err(TransferError::ReceiverBusy)));
        node.decline(second).unwrap();
        assert!(matches!(node.decline(second), Err(TransferError::NoSuchOffer)));
    }

    #[test]
    fn duplicated_chunk_is_acknowledged_twice_and_stored_once() {
        let root = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = Config::new("own", OWN).with_downloads_dir(root.path());
        let (node, mut events) = Node::with_transport(config, recorder.clone());

        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);
        node.accept(&offer).unwrap();

        // "QUJD" is "ABC"
        dispatch(&node, Packet::FileChunk(peer(), Chunk::new(0, "QUJD".into())));
        dispatch(&node, Packet::FileChunk(peer(), Chunk::new(0, "QUJD".into())));

        let start = std::time::Instant::now();
        let acks = loop {
            let acks: Vec<Acknowledge> = recorder
                .packets()
                .into_iter()
                .filter_map(|(_, packet)| match packet {
                    Packet::Acknowledge(ack) => Some(ack),
                    _ => None,
                })
                .collect();
            if acks.len() == 2 || start.elapsed() > Duration::from_secs(5) {
                break acks
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(acks.iter().map(|ack| ack.serial).collect::<Vec<_>>(), vec![0, 0]);

        dispatch(&node, Packet::TransferSucceeded(peer(), 1));
        loop {
            match next_event(&mut events) {
                NodeEvent::DownloadSaved { source, path, size } => {
                    assert_eq!(source, PEER);
                    assert_eq!(size, 3);
                    assert_eq!(std::fs::read(path).unwrap(), b"ABC");
                    break
                }
                NodeEvent::FileOffered(_) => continue,
                event => panic!("Unexpected {:?}", event),
            }
        }
        assert!(!node.is_receiving());
    }

    #[test]
    fn chunks_of_other_sources_are_dropped() {
        let (node, mut events, _) = node();
        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);
        node.accept(&offer).unwrap();
        assert!(matches!(next_event(&mut events), NodeEvent::FileOffered(_)));

        let intruder = Header::new("intruder", Ipv4Addr::new(10, 0, 0, 66));
        dispatch(&node, Packet::FileChunk(intruder.clone(), Chunk::new(0, "QUJD".into())));
        dispatch(&node, Packet::TransferSucceeded(intruder, 1));
        assert!(node.is_receiving());

        dispatch(&node, Packet::TransferFailed(peer(), None));
        match next_event(&mut events) {
            NodeEvent::DownloadFailed { source, reason, .. } => {
                assert_eq!(source, PEER);
                assert!(matches!(reason, ReceiveError::Aborted));
            }
            event => panic!("Unexpected {:?}", event),
        }
        assert!(!node.is_receiving());
    }

    #[test]
    fn incomplete_download_is_not_saved() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::new("own", OWN).with_downloads_dir(root.path());
        let (node, mut events) = Node::with_transport(config, Arc::new(Recorder::default()));

        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);
        node.accept(&offer).unwrap();
        assert!(matches!(next_event(&mut events), NodeEvent::FileOffered(_)));

        dispatch(&node, Packet::TransferSucceeded(peer(), 3));
        match next_event(&mut events) {
            NodeEvent::DownloadFailed { reason, .. } => {
                assert!(matches!(reason, ReceiveError::Incomplete { missing: 3, total: 3 }));
            }
            event => panic!("Unexpected {:?}", event),
        }
        assert!(!root.path().join("notes.txt").exists());
    }

    #[test]
    fn total_beyond_the_received_chunks_is_not_saved() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::new("own", OWN).with_downloads_dir(root.path());
        let (node, mut events) = Node::with_transport(config, Arc::new(Recorder::default()));

        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);
        node.accept(&offer).unwrap();
        assert!(matches!(next_event(&mut events), NodeEvent::FileOffered(_)));

        dispatch(&node, Packet::FileChunk(peer(), Chunk::new(0, "QUJD".into())));
        std::thread::sleep(Duration::from_millis(100));

        // Sent as "18446744073709551615" in the wire.
        let end = format!(
            "{{\"NAME\":\"peer\",\"MY_IP\":\"{}\",\"TYPE\":\"DOWNLOAD_SUCCESS\",\"PAYLOAD\":\"{}\"}}\n",
            PEER,
            usize::MAX
        );
        node.dispatcher().dispatch(Channel::Stream, &end);
        match next_event(&mut events) {
            NodeEvent::DownloadFailed { reason, .. } => {
                assert!(matches!(
                    reason,
                    ReceiveError::Incomplete { missing, total } if total == usize::MAX && missing == usize::MAX - 1
                ));
            }
            event => panic!("Unexpected {:?}", event),
        }
        assert!(!root.path().join("notes.txt").exists());
    }

    #[test]
    fn stop_waits_for_the_download_being_saved() {
        let root = tempfile::tempdir().unwrap();
        let config = Config::new("own", OWN).with_downloads_dir(root.path().join("later"));
        let (mut node, mut events) = Node::with_transport(config, Arc::new(Recorder::default()));

        dispatch(&node, Packet::Allow(peer(), "notes.txt".into()));
        let offer = node.pending_offers().remove(0);
        node.accept(&offer).unwrap();
        dispatch(&node, Packet::FileChunk(peer(), Chunk::new(0, "QUJD".into())));
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(dispatch(&node, Packet::TransferSucceeded(peer(), 1)), Flow::Continue);
        assert!(!node.is_receiving());
        node.stop();

        assert_eq!(std::fs::read(root.path().join("later").join("notes.txt")).unwrap(), b"ABC");
        let saved = std::iter::from_fn(|| events.try_receive())
            .any(|event| matches!(event, NodeEvent::DownloadSaved { size: 3, .. }));
        assert!(saved);
    }

    #[test]
    fn announce_and_goodbye() {
        let (mut node, _events, recorder) = node();
        node.discover();
        node.stop();
        node.stop();

        let packets = recorder.packets();
        let own = Header::new("own", OWN);
        let discovers = packets.iter().filter(|(_, p)| *p == Packet::Discover(own.clone())).count();
        let goodbyes = packets.iter().filter(|(_, p)| *p == Packet::Goodbye(own.clone())).count();
        assert_eq!(discovers, 2);
        assert_eq!(goodbyes, 2);
        assert!(packets.iter().all(|(destination, _)| *destination == Destination::Broadcast));
    }

    #[test]
    fn acknowledgments_without_send_are_dropped() {
        let (node, mut events, _) = node();
        dispatch(&node, Packet::Acknowledge(Acknowledge { serial: 0, window: 10 }));
        dispatch(&node, Packet::ConsentGranted(peer()));
        assert!(events.try_receive().is_none());
        assert!(node.send_phase().is_none());
    }
}
