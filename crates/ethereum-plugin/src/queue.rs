use crate::error::PluginError;

use futures::future::BoxFuture;
use log::trace;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// An asynchronous state transition over the queue's cell.
pub type Reducer<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, Result<T, PluginError>> + Send>;

struct Job<T> {
    priority: i32,
    seq: u64,
    reducer: Reducer<T>,
    done: oneshot::Sender<Result<T, PluginError>>,
}

impl<T> PartialEq for Job<T> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<T> Eq for Job<T> {}

impl<T> PartialOrd for Job<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Job<T> {
    // Max-heap: higher priority first, then FIFO by sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner<T> {
    state: T,
    pending: BinaryHeap<Job<T>>,
    running: bool,
    next_seq: u64,
    listeners: Vec<mpsc::UnboundedSender<T>>,
}

/// A priority FIFO of asynchronous reducers over a single state cell.
///
/// At most one reducer runs at a time per queue, so every reducer observes
/// the state left behind by the previous one. Among pending reducers, higher
/// priority runs first; equal priorities run in submission order. A reducer
/// that fails leaves the cell untouched and its error is reported only
/// through the handle returned by [`ReducerQueue::add`].
///
/// Every successful reduction is broadcast to subscribers, which is how
/// account snapshots reach the store.
pub struct ReducerQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for ReducerQueue<T> {
    fn clone(&self) -> Self {
        ReducerQueue {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ReducerQueue<T> {
    pub fn new(initial: T) -> Self {
        ReducerQueue {
            inner: Arc::new(Mutex::new(Inner {
                state: initial,
                pending: BinaryHeap::new(),
                running: false,
                next_seq: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Enqueues a reducer and returns a handle resolving to the state it
    /// produced. Dropping the handle does not cancel the reduction.
    pub fn add<F, Fut>(
        &self,
        reducer: F,
        priority: i32,
    ) -> impl Future<Output = Result<T, PluginError>>
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, PluginError>> + Send + 'static,
    {
        self.add_boxed(Box::new(move |state| Box::pin(reducer(state))), priority)
    }

    pub fn add_boxed(
        &self,
        reducer: Reducer<T>,
        priority: i32,
    ) -> impl Future<Output = Result<T, PluginError>> {
        let (done, handle) = oneshot::channel();
        let spawn_drain = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push(Job {
                priority,
                seq,
                reducer,
                done,
            });
            if inner.running {
                false
            } else {
                inner.running = true;
                true
            }
        };
        if spawn_drain {
            let queue = self.clone();
            tokio::spawn(async move { queue.drain().await });
        }
        async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => Err(PluginError::Cancelled),
            }
        }
    }

    /// Latest state. Possibly stale the moment it is read; authoritative
    /// reads happen inside reducers.
    pub fn state(&self) -> T {
        self.inner.lock().state.clone()
    }

    /// Subscribes to the state produced by every successful reduction.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().listeners.push(tx);
        rx
    }

    /// Drops all pending reducers; their handles resolve with an error. The
    /// in-flight reducer, if any, runs to completion.
    pub fn clear(&self) {
        self.inner.lock().pending.clear();
    }

    pub fn remove_all_listeners(&self) {
        self.inner.lock().listeners.clear();
    }

    async fn drain(&self) {
        loop {
            let (job, snapshot) = {
                let mut inner = self.inner.lock();
                match inner.pending.pop() {
                    Some(job) => {
                        let snapshot = inner.state.clone();
                        (job, snapshot)
                    }
                    None => {
                        inner.running = false;
                        return;
                    }
                }
            };

            match (job.reducer)(snapshot).await {
                Ok(new_state) => {
                    {
                        let mut inner = self.inner.lock();
                        inner.state = new_state.clone();
                        inner
                            .listeners
                            .retain(|listener| listener.send(new_state.clone()).is_ok());
                    }
                    let _ = job.done.send(Ok(new_state));
                }
                Err(err) => {
                    trace!("Reducer failed, keeping prior state: {}", err);
                    let _ = job.done.send(Err(err));
                }
            }
        }
    }
}
