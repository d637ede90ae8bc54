//! Bounded per-class Stream Queues.
//!
//! Producers never block: a full queue drops the newest item and counts it. The single
//! consumer of each queue collects batches bounded by size and a wall-clock window.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::utils::StopSignal;

/// Upper bound on a single blocking wait, so the stop signal is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Dropped,
}

/// Producer half, cloned into the router.
#[derive(Debug)]
pub struct QueueSender<T> {
    name: &'static str,
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        QueueSender {
            name: self.name,
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

/// Consumer half, owned by exactly one worker.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    name: &'static str,
    rx: Receiver<T>,
    dropped: Arc<AtomicU64>,
}

pub fn stream_queue<T>(name: &'static str, capacity: usize) -> (QueueSender<T>, QueueReceiver<T>) {
    let (tx, rx) = channel::bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        QueueSender {
            name,
            tx,
            dropped: Arc::clone(&dropped),
        },
        QueueReceiver { name, rx, dropped },
    )
}

impl<T> QueueSender<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue without blocking; on overload the item is discarded.
    pub fn offer(&self, item: T) -> Offer {
        match self.tx.try_send(item) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Queue {} full; message dropped (dropped so far: {})", self.name, total);
                Offer::Dropped
            }
            Err(TrySendError::Disconnected(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!("Queue {} has no consumer; message dropped (dropped so far: {})", self.name, total);
                Offer::Dropped
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<T> QueueReceiver<T> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Wait up to `timeout` for a single item.
    pub fn pop(&self, timeout: Duration, stop: &StopSignal) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if stop.is_stopped() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            match self.rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(item) => return Some(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Collect up to `max` items, returning when full, when `window` has elapsed since
    /// the call, or when stop is requested. Items come out in FIFO order.
    pub fn collect_batch(&self, max: usize, window: Duration, stop: &StopSignal) -> Vec<T> {
        let mut batch = Vec::new();
        let deadline = Instant::now() + window;
        while batch.len() < max && !stop.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.rx.recv_timeout((deadline - now).min(POLL_INTERVAL)) {
                Ok(item) => batch.push(item),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        batch
    }
}
