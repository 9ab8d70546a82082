use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::warn;

use super::wrapper::{handler, MessageBus};
use crate::error::BusError;
use crate::ipc::BroadcastEvent;

/// Fire-and-forget events on `{prefix}/broadcast/{event}`.
pub struct BroadcastHelper<E: BroadcastEvent> {
    bus: Arc<MessageBus>,
    queue: Arc<EventQueue<E>>,
}

impl<E: BroadcastEvent> BroadcastHelper<E> {
    /// Helper that can only send.
    pub fn sender(bus: Arc<MessageBus>) -> Self {
        Self {
            bus,
            queue: Arc::new(EventQueue::default()),
        }
    }

    /// Helper that also queues received events, lowest priority first.
    pub async fn subscribe(bus: Arc<MessageBus>) -> Result<Self, BusError> {
        let queue = Arc::new(EventQueue::default());
        let sink = Arc::clone(&queue);
        bus.subscribe(
            &format!("broadcast/{}", E::NAME),
            handler(move |_, payload| {
                let sink = Arc::clone(&sink);
                async move {
                    match serde_json::from_str::<E>(&payload) {
                        Ok(event) => sink.push(event),
                        Err(e) => warn!("Received bad {} broadcast: {}", E::NAME, e),
                    }
                }
            }),
        )
        .await?;
        Ok(Self { bus, queue })
    }

    pub async fn send(&self, event: &E) -> Result<(), BusError> {
        self.bus
            .publish(&format!("broadcast/{}", E::NAME), event, false, false)
            .await
    }

    /// Wait for the next queued event.
    pub async fn recv(&self) -> E {
        self.queue.pop().await
    }
}

struct Queued<E> {
    priority: i64,
    seq: u64,
    event: E,
}

impl<E> PartialEq for Queued<E> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<E> Eq for Queued<E> {}

impl<E> PartialOrd for Queued<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<E> Ord for Queued<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

struct EventQueue<E> {
    heap: Mutex<(BinaryHeap<Reverse<Queued<E>>>, u64)>,
    notify: Notify,
}

impl<E> Default for EventQueue<E> {
    fn default() -> Self {
        Self {
            heap: Mutex::new((BinaryHeap::new(), 0)),
            notify: Notify::new(),
        }
    }
}

impl<E: BroadcastEvent> EventQueue<E> {
    fn push(&self, event: E) {
        {
            let mut guard = self.heap.lock().unwrap_or_else(|e| e.into_inner());
            let (heap, seq) = &mut *guard;
            *seq += 1;
            heap.push(Reverse(Queued {
                priority: event.header().priority,
                seq: *seq,
                event,
            }));
        }
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<E> {
        let mut guard = self.heap.lock().unwrap_or_else(|e| e.into_inner());
        guard.0.pop().map(|Reverse(q)| q.event)
    }

    async fn pop(&self) -> E {
        loop {
            if let Some(event) = self.try_pop() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}
