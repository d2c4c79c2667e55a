// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Priority task queue with bounded concurrency.
//!
//! Every network operation of the orchestrator goes through a [`SyncQueue`].
//! At most `max_concurrency` tasks run at once; when a slot frees up the
//! highest-priority waiter starts next, ties going to the earliest enqueued.
//! Running tasks are never preempted or cancelled.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

/// Error type for queue operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue shut down before the task started.
    #[error("sync queue is shutting down")]
    ShuttingDown,

    /// The task ended without producing a result (it panicked or its
    /// runtime went away).
    #[error("queued task aborted before completing")]
    Aborted,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub max_concurrency: usize,
    pub active: usize,
    pub pending: usize,
    /// Highest `active` value seen since creation.
    pub peak_active: usize,
    pub completed: u64,
}

struct Waiter {
    priority: i64,
    seq: u64,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence (FIFO)
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    waiting: BinaryHeap<Waiter>,
    active: usize,
    peak_active: usize,
    completed: u64,
    next_seq: u64,
    closed: bool,
}

struct Inner {
    max_concurrency: usize,
    state: Mutex<State>,
    idle: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        state.completed += 1;

        // Hand the slot to the best waiter still listening
        while let Some(waiter) = state.waiting.pop() {
            if waiter.grant.send(()).is_ok() {
                state.active += 1;
                state.peak_active = state.peak_active.max(state.active);
                break;
            }
        }

        if state.active == 0 && state.waiting.is_empty() {
            drop(state);
            self.idle.notify_waiters();
        }
    }
}

/// Holds a concurrency slot for the lifetime of a running task.
struct Slot {
    inner: Arc<Inner>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Handle to a queued task's outcome.
///
/// Resolves to the task's own output, or a [`QueueError`] if the task never
/// ran to completion. Dropping the handle does not cancel the task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, QueueError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|r| r.unwrap_or(Err(QueueError::Aborted)))
    }
}

/// Priority, concurrency-bounded task queue.
///
/// Cloning is cheap; clones share slots and waiters.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<Inner>,
}

impl SyncQueue {
    /// Create a queue running at most `max_concurrency` tasks at once.
    ///
    /// A concurrency of 0 is treated as 1.
    pub fn new(max_concurrency: usize) -> Self {
        SyncQueue {
            inner: Arc::new(Inner {
                max_concurrency: max_concurrency.max(1),
                state: Mutex::new(State {
                    waiting: BinaryHeap::new(),
                    active: 0,
                    peak_active: 0,
                    completed: 0,
                    next_seq: 0,
                    closed: false,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Schedule `task` at `priority` (higher runs first).
    ///
    /// The task is registered before this returns, so tasks enqueued in
    /// sequence keep their FIFO order within a priority. Must be called from
    /// inside a tokio runtime.
    pub fn enqueue<F, Fut, T>(&self, priority: i64, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (grant_tx, grant_rx) = oneshot::channel();

        {
            let mut state = self.inner.lock();
            if state.closed {
                let _ = result_tx.send(Err(QueueError::ShuttingDown));
                return TaskHandle { rx: result_rx };
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            if state.active < self.inner.max_concurrency && state.waiting.is_empty() {
                state.active += 1;
                state.peak_active = state.peak_active.max(state.active);
                let _ = grant_tx.send(());
            } else {
                debug!(priority, seq, pending = state.waiting.len() + 1, "task queued");
                state.waiting.push(Waiter { priority, seq, grant: grant_tx });
            }
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if grant_rx.await.is_err() {
                // Waiter dropped by shutdown
                let _ = result_tx.send(Err(QueueError::ShuttingDown));
                return;
            }
            let _slot = Slot { inner };
            let output = task().await;
            let _ = result_tx.send(Ok(output));
        });

        TaskHandle { rx: result_rx }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        QueueStats {
            max_concurrency: self.inner.max_concurrency,
            active: state.active,
            pending: state.waiting.len(),
            peak_active: state.peak_active,
            completed: state.completed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Wait until no task is running or waiting.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.inner.lock();
                if state.active == 0 && state.waiting.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Stop admitting tasks and reject every task that has not started.
    ///
    /// Running tasks finish normally. Returns the number of rejected tasks.
    pub fn shutdown(&self) -> usize {
        let rejected = {
            let mut state = self.inner.lock();
            state.closed = true;
            let rejected = state.waiting.len();
            // Dropping the grant senders rejects the waiters
            state.waiting.clear();
            rejected
        };

        info!(rejected, "sync queue shut down");
        if self.stats().active == 0 {
            self.inner.idle.notify_waiters();
        }
        rejected
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
