use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

pub(crate) type EventSender<T> = mpsc::UnboundedSender<T>;

pub(crate) fn channel<T>() -> (EventSender<T>, EventStream<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, EventStream { rx })
}

/// Ordered, unbounded sequence of events from a single producer. Ends when the
/// producer goes away.
#[derive(Debug)]
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> EventStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Current value plus fan-out to every subscriber. A new subscriber first
/// receives the current value, then every later publication in order.
#[derive(Debug)]
pub struct StateHub<T> {
    inner: Mutex<HubInner<T>>,
}

#[derive(Debug)]
struct HubInner<T> {
    current: T,
    subscribers: Vec<EventSender<T>>,
    closed: bool,
}

impl<T: Clone> StateHub<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                current: initial,
                subscribers: Vec::new(),
                closed: false,
            }),
        }
    }

    pub fn current(&self) -> T {
        self.lock().current.clone()
    }

    pub fn subscribe(&self) -> EventStream<T> {
        let mut inner = self.lock();
        let (tx, stream) = channel();
        let _ = tx.send(inner.current.clone());
        if !inner.closed {
            inner.subscribers.push(tx);
        }
        stream
    }

    /// Records `value` as current and delivers it to live subscribers. Ignored once closed.
    pub fn publish(&self, value: T) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner
            .subscribers
            .retain(|subscriber| subscriber.send(value.clone()).is_ok());
        inner.current = value;
    }

    /// Ends every subscriber's sequence.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
