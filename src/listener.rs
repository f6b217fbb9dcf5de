use crate::adapters::udp::{self, MAX_LOCAL_PAYLOAD_LEN};
use crate::adapters::tcp::{self, Connection, ReadStatus};
use crate::node::{Dispatcher, Flow};
use crate::packet::{Channel};
use crate::util::thread::{NamespacedThread};
use crate::util::{SAMPLING_TIMEOUT};

use mio::{Events, Interest, Poll, Token};
use mio::net::{TcpListener, UdpSocket};

use std::collections::{HashMap};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::{Duration, Instant};
use std::io::{self, ErrorKind};

const EVENTS_SIZE: usize = 1024;
const LISTENER: Token = Token(0);

/// A connection that does not finish in this time is discarded.
const STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// The two perpetual workers of a node: one reading datagrams and one accepting streams.
/// Both pass every received unit to the dispatcher until the node stops.
pub struct ListenerPair {
    running: Arc<AtomicBool>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    udp_thread: NamespacedThread<()>,
    tcp_thread: NamespacedThread<()>,
}

impl ListenerPair {
    /// Binds both sockets in `addr` and starts the workers.
    /// A bind error is returned before any worker runs.
    pub fn spawn(addr: SocketAddrV4, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let udp_socket = udp::bind_listener(addr)?;
        let tcp_listener = tcp::bind_listener(addr)?;
        let udp_addr = udp_socket.local_addr()?;
        let tcp_addr = tcp_listener.local_addr()?;

        let running = Arc::new(AtomicBool::new(true));

        let udp_thread = {
            let running = running.clone();
            let dispatcher = dispatcher.clone();
            NamespacedThread::spawn("udp-listener", move || {
                if let Err(err) = run_udp(udp_socket, &dispatcher, &running) {
                    log::error!("UDP listener stopped: {}", err);
                }
            })
        };

        let tcp_thread = {
            let running = running.clone();
            NamespacedThread::spawn("tcp-listener", move || {
                if let Err(err) = run_tcp(tcp_listener, &dispatcher, &running) {
                    log::error!("TCP listener stopped: {}", err);
                }
            })
        };

        log::debug!("Listening datagrams in {} and streams in {}", udp_addr, tcp_addr);
        Ok(Self { running, udp_addr, tcp_addr, udp_thread, tcp_thread })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Whether both workers are still running.
    pub fn is_running(&self) -> bool {
        !self.udp_thread.is_finished() && !self.tcp_thread.is_finished()
    }

    /// Stops both workers and waits for them.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        self.udp_thread.try_join();
        self.tcp_thread.try_join();
    }
}

impl Drop for ListenerPair {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_events(poll: &mut Poll, events: &mut Events) -> io::Result<()> {
    match poll.poll(events, Some(*SAMPLING_TIMEOUT)) {
        Err(ref err) if err.kind() == ErrorKind::Interrupted => {
            events.clear();
            Ok(())
        }
        other => other,
    }
}

fn run_udp(mut socket: UdpSocket, dispatcher: &Dispatcher, running: &AtomicBool) -> io::Result<()> {
    let mut poll = Poll::new()?;
    poll.registry().register(&mut socket, LISTENER, Interest::READABLE)?;
    let mut events = Events::with_capacity(EVENTS_SIZE);
    let mut input_buffer = vec![0; MAX_LOCAL_PAYLOAD_LEN];

    while running.load(Ordering::Relaxed) {
        poll_events(&mut poll, &mut events)?;
        if events.is_empty() {
            continue
        }
        udp::receive(&socket, &mut input_buffer, |addr, data| {
            log::trace!("Datagram of {} bytes from {}", data.len(), addr);
            dispatcher.dispatch(Channel::Datagram, data);
        });
    }
    Ok(())
}

fn run_tcp(
    mut listener: TcpListener,
    dispatcher: &Dispatcher,
    running: &AtomicBool,
) -> io::Result<()> {
    let mut poll = Poll::new()?;
    poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
    let mut events = Events::with_capacity(EVENTS_SIZE);
    let mut connections: HashMap<Token, (Connection, Instant)> = HashMap::new();
    let mut next_token = LISTENER.0 + 1;

    while running.load(Ordering::Relaxed) {
        poll_events(&mut poll, &mut events)?;

        for event in events.iter() {
            if event.token() == LISTENER {
                loop {
                    match listener.accept() {
                        Ok((mut stream, addr)) => {
                            let token = Token(next_token);
                            next_token += 1;
                            poll.registry().register(&mut stream, token, Interest::READABLE)?;
                            connections.insert(token, (Connection::new(stream, addr), Instant::now()));
                        }
                        Err(ref err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(ref err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => break log::error!("TCP accept error: {}", err),
                    }
                }
                continue
            }

            let status = match connections.get_mut(&event.token()) {
                Some((connection, _)) => connection.read(),
                None => continue,
            };

            if status == ReadStatus::WaitNextEvent {
                continue
            }

            if let Some((mut connection, _)) = connections.remove(&event.token()) {
                poll.registry().deregister(connection.stream_mut())?;
                if status == ReadStatus::Finished {
                    for line in connection.lines() {
                        log::trace!("Stream of {} bytes from {}", line.len(), connection.peer_addr());
                        if dispatcher.dispatch(Channel::Stream, line) == Flow::Stop {
                            log::debug!("Stop requested by the own node");
                            running.store(false, Ordering::Relaxed);
                        }
                    }
                }
            }
        }

        connections.retain(|_, (connection, opened)| {
            let alive = opened.elapsed() < STREAM_TIMEOUT;
            if !alive {
                log::debug!("Stream from {} discarded: timeout", connection.peer_addr());
            }
            alive
        });
    }
    Ok(())
}
