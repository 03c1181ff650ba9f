use std::{
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll},
};

use futures::{
    Stream,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
};
use parking_lot::Mutex;

struct Subscribers<T> {
    next_id: u64,
    senders: Vec<(u64, UnboundedSender<T>)>,
}

/// Fan-out of ordered events to any number of subscribers.
pub struct Broadcaster<T> {
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T: Clone> Broadcaster<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next_id: 0,
                senders: Vec::new(),
            })),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (sender, receiver) = unbounded();
        let mut subscribers = self.subscribers.lock();
        let id = subscribers.next_id;
        subscribers.next_id += 1;
        subscribers.senders.push((id, sender));

        Subscription {
            id,
            receiver,
            subscribers: Arc::downgrade(&self.subscribers),
        }
    }

    pub fn publish(&self, event: T) {
        let mut subscribers = self.subscribers.lock();
        subscribers
            .senders
            .retain(|(_, sender)| sender.unbounded_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().senders.len()
    }
}

impl<T: Clone> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`Broadcaster`]. Yields events in publish order until
/// the broadcaster is dropped or the subscription is cancelled.
pub struct Subscription<T> {
    id: u64,
    receiver: UnboundedReceiver<T>,
    subscribers: Weak<Mutex<Subscribers<T>>>,
}

impl<T> Subscription<T> {
    pub fn unsubscribe(self) {}

    fn detach(&mut self) {
        if let Some(subscribers) = self.subscribers.upgrade() {
            subscribers
                .lock()
                .senders
                .retain(|(id, _)| *id != self.id);
        }
        self.receiver.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.detach();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.receiver).poll_next(context)
    }
}
