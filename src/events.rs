use crossbeam_channel::{self, Sender, Receiver, select};

use std::time::{Duration};

/// Where a node publishes what happens to it.
/// Priority events overtake every standard event still pending.
pub struct EventQueue<E> {
    // Dropped before the receivers.
    event_sender: EventSender<E>,
    receiver: Receiver<E>,
    priority_receiver: Receiver<E>,
}

impl<E> EventQueue<E>
where E: Send + 'static
{
    pub fn new() -> EventQueue<E> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let (priority_sender, priority_receiver) = crossbeam_channel::unbounded();
        EventQueue {
            event_sender: EventSender { sender, priority_sender },
            receiver,
            priority_receiver,
        }
    }

    /// Handle to publish into this queue. Clone it to publish from other threads.
    pub fn sender(&self) -> &EventSender<E> {
        &self.event_sender
    }

    /// Waits until an event is available.
    pub fn receive(&mut self) -> E {
        loop {
            if let Some(event) = self.receive_timeout(Duration::from_secs(3600)) {
                break event
            }
        }
    }

    /// Waits up to `timeout` for an event. `None` if nothing arrived.
    pub fn receive_timeout(&mut self, timeout: Duration) -> Option<E> {
        if let Some(event) = self.try_priority() {
            return Some(event)
        }
        // The queue holds a sender of both channels: they never disconnect here.
        select! {
            recv(self.priority_receiver) -> event => event.ok(),
            recv(self.receiver) -> event => event.ok(),
            default(timeout) => None,
        }
    }

    /// Takes the next event if there is one.
    pub fn try_receive(&mut self) -> Option<E> {
        self.try_priority().or_else(|| self.receiver.try_recv().ok())
    }

    fn try_priority(&self) -> Option<E> {
        self.priority_receiver.try_recv().ok()
    }
}

impl<E> Default for EventQueue<E>
where E: Send + 'static
{
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes events into an [`EventQueue`] without blocking.
/// Events published after the queue is gone are discarded.
pub struct EventSender<E> {
    sender: Sender<E>,
    priority_sender: Sender<E>,
}

impl<E> EventSender<E>
where E: Send + 'static
{
    pub fn send(&self, event: E) {
        publish(&self.sender, event);
    }

    /// The event is received before any standard one.
    /// Priority events keep their order among them.
    pub fn send_with_priority(&self, event: E) {
        publish(&self.priority_sender, event);
    }
}

fn publish<E>(sender: &Sender<E>, event: E) {
    if sender.send(event).is_err() {
        log::trace!("Event discarded: the queue no longer exists");
    }
}

impl<E> Clone for EventSender<E> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), priority_sender: self.priority_sender.clone() }
    }
}
