use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use rfdeck_ipc::{SpectrumSample, SweepStatus};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
pub enum SweepEvent {
    Sample(Arc<SpectrumSample>),
    Status(SweepStatus),
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<SweepEvent>,
    dropped: u64,
    closed: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Queue {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fan-out to any number of subscribers, each with its own bounded queue.
///
/// A full queue drops its oldest event, so a slow subscriber only ever loses
/// its own backlog and the publisher never waits.
pub struct SubscriberHub {
    capacity: usize,
    queues: Mutex<Vec<Weak<Queue>>>,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(Vec::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(Queue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        self.lock().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish(&self, event: SweepEvent) {
        let mut queues = self.lock();
        queues.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                {
                    let mut state = queue.lock();
                    if state.items.len() >= self.capacity {
                        state.items.pop_front();
                        state.dropped += 1;
                    }
                    state.items.push_back(event.clone());
                }
                queue.notify.notify_one();
                true
            }
            None => false,
        });
    }

    /// Empties every subscriber's backlog without detaching anyone.
    pub fn clear_backlog(&self) -> usize {
        let mut cleared = 0;
        for queue in self.live() {
            let mut state = queue.lock();
            cleared += state.items.len();
            state.items.clear();
        }
        cleared
    }

    /// Wakes every subscriber with end-of-stream.
    pub fn close(&self) {
        for queue in self.live() {
            queue.lock().closed = true;
            queue.notify.notify_one();
        }
        self.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut queues = self.lock();
        queues.retain(|weak| weak.strong_count() > 0);
        queues.len()
    }

    fn live(&self) -> Vec<Arc<Queue>> {
        self.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Weak<Queue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    /// Next event in publish order, or `None` once the hub is closed and drained.
    pub async fn recv(&mut self) -> Option<SweepEvent> {
        loop {
            {
                let mut state = self.queue.lock();
                if let Some(event) = state.items.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<SweepEvent> {
        self.queue.lock().items.pop_front()
    }

    /// Events lost to overflow since the last call.
    pub fn take_dropped(&mut self) -> u64 {
        std::mem::take(&mut self.queue.lock().dropped)
    }

    pub fn backlog(&self) -> usize {
        self.queue.lock().items.len()
    }
}
