//! Disk backends run their index operations on a small pool of worker
//! threads, and hand callers a [`Pending`] result.
//!
//! Keyed operations go to the worker [`RouteHash`] picks for the key,
//! so operations on one key complete in submission order.  Operations
//! that span the whole cache (dooming many entries, enumeration,
//! flushes) are *fences*: every worker stops at the fence, one of them
//! runs the operation, and all resume afterwards.  Everything
//! submitted before a fence completes before it, and everything
//! submitted after it completes after it.
//!
//! Shutting the queue down cancels whatever has not started yet.  A
//! cancelled operation drops its result sender, so its [`Pending`]
//! resolves to [`Error::Cancelled`].
use std::future::Future;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Barrier;
use std::task::Context;
use std::task::Poll;
use std::thread::JoinHandle;

use crossbeam::channel;
use crossbeam::channel::Receiver;
use crossbeam::channel::Sender;
use futures::channel::oneshot;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::Error;
use crate::error::Result;
use crate::hash::RouteHash;

type Job = Box<dyn FnOnce() + Send>;

/// Workers stop at the barrier twice: once to agree that everything
/// before the fence is done, and once to release everything after it.
struct Fence {
    barrier: Barrier,
    job: Mutex<Option<Job>>,
}

enum Task {
    Run(Job),
    Fence(Arc<Fence>),
}

/// The result of a backend operation, available now or later.
///
/// `Pending` is a [`Future`]; synchronous callers can [`Pending::wait`]
/// instead.
#[must_use = "a pending operation does nothing unless awaited or waited for"]
pub struct Pending<T> {
    state: PendingState<T>,
}

enum PendingState<T> {
    /// Completed inline.  `None` once taken.
    Ready(Option<Result<T>>),
    Waiting(oneshot::Receiver<Result<T>>),
}

impl<T> Pending<T> {
    pub(crate) fn ready(result: Result<T>) -> Pending<T> {
        Pending {
            state: PendingState::Ready(Some(result)),
        }
    }

    fn waiting(receiver: oneshot::Receiver<Result<T>>) -> Pending<T> {
        Pending {
            state: PendingState::Waiting(receiver),
        }
    }

    /// Whether the operation was queued rather than completed inline.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, PendingState::Waiting(_))
    }

    /// Blocks the current thread until the operation completes.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }

    /// Returns the result if the operation has completed, without
    /// blocking.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        match &mut self.state {
            PendingState::Ready(result) => result.take(),
            PendingState::Waiting(receiver) => match receiver.try_recv() {
                Ok(Some(result)) => Some(result),
                Ok(None) => None,
                Err(oneshot::Canceled) => Some(Err(Error::Cancelled)),
            },
        }
    }
}

impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<T>> {
        match &mut self.state {
            // Polling again after completion reports a cancellation.
            PendingState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(Error::Cancelled)))
            }
            PendingState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl<T> std::fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("is_pending", &self.is_pending())
            .finish()
    }
}

pub(crate) struct OperationQueue {
    // `None` once shut down.  Submissions hold the lock while they
    // send, so every worker sees fences in the same order.
    senders: Mutex<Option<Vec<Sender<Task>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    route: RouteHash,
}

/// Runs `job` unless the queue was cancelled.  A panicking job drops
/// its result sender, so its caller sees `Cancelled`; the worker
/// itself survives, or later fences would wait for it forever.
fn run_job(index: usize, job: Job, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        return;
    }

    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!(worker = index, "cache operation panicked");
    }
}

fn work(index: usize, tasks: Receiver<Task>, cancel: CancellationToken) {
    for task in tasks.iter() {
        match task {
            Task::Run(job) => run_job(index, job, &cancel),
            Task::Fence(fence) => {
                if fence.barrier.wait().is_leader() {
                    let job = fence.job.lock().take();
                    if let Some(job) = job {
                        run_job(index, job, &cancel);
                    }
                }

                fence.barrier.wait();
            }
        }
    }

    debug!(worker = index, "cache worker exiting");
}

impl OperationQueue {
    /// Spawns `workers` threads named after `name`.
    pub fn new(name: &str, workers: usize) -> Result<OperationQueue> {
        let workers = workers.max(1);
        let cancel = CancellationToken::new();
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for index in 0..workers {
            let (sender, receiver) = channel::unbounded();
            let token = cancel.clone();
            let handle = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || work(index, receiver, token))?;

            senders.push(sender);
            handles.push(handle);
        }

        Ok(OperationQueue {
            senders: Mutex::new(Some(senders)),
            workers: Mutex::new(handles),
            cancel,
            route: RouteHash::new_keyed(b"disk-cache-backend/operation-queue"),
        })
    }

    /// Wraps `op` so that its result goes to a fresh [`Pending`].
    fn package<T, F>(op: F) -> (Job, Pending<T>)
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job: Job = Box::new(move || {
            // The caller may have given up on the result.
            let _ = sender.send(op());
        });

        (job, Pending::waiting(receiver))
    }

    /// Runs `op` on the worker for `key_hash`.
    pub fn run<T, F>(&self, key_hash: u64, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let senders = self.senders.lock();
        let senders = match senders.as_ref() {
            Some(senders) => senders,
            None => return Pending::ready(Err(Error::BackendGone)),
        };

        let (job, pending) = OperationQueue::package(op);
        let worker = self.route.route(key_hash, senders.len());
        if senders[worker].send(Task::Run(job)).is_err() {
            return Pending::ready(Err(Error::BackendGone));
        }

        pending
    }

    /// Runs `op` once everything submitted so far has completed, and
    /// before anything submitted later starts.
    pub fn fence<T, F>(&self, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let senders = self.senders.lock();
        let senders = match senders.as_ref() {
            Some(senders) => senders,
            None => return Pending::ready(Err(Error::BackendGone)),
        };

        let (job, pending) = OperationQueue::package(op);
        let fence = Arc::new(Fence {
            barrier: Barrier::new(senders.len()),
            job: Mutex::new(Some(job)),
        });

        for sender in senders.iter() {
            // Workers only exit once their sender is gone, and we
            // hold every sender.
            if sender.send(Task::Fence(fence.clone())).is_err() {
                warn!("cache worker exited early");
                return Pending::ready(Err(Error::BackendGone));
            }
        }

        pending
    }

    /// Cancels queued operations and waits for the workers to exit.
    /// Idempotent.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.senders.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                warn!("cache worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("workers", &self.workers.lock().len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
