//! Worker-pool plumbing for directory-parallel matching.
//!
//! Matching work is handed to an [`Executor`] as boxed tasks and results come
//! back through [`Promise`]/[`PromiseHandle`] pairs, so the algorithms never
//! know (or care) whether they run inline on the calling thread or on a
//! fixed-size thread pool.

use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crossbeam::channel::Sender;

/// Creates a connected pair of [`Promise`] and [`PromiseHandle`].
pub fn promise<T>() -> (Promise<T>, PromiseHandle<T>) {
    // Capacity of 1 means that `Promise::fulfill` will never block, which is the property we want.
    let (sender, recv) = crossbeam::channel::bounded(1);
    (Promise { inner: sender }, PromiseHandle { recv })
}

/// An empty slot that can be filled with a `T`, fulfilling the promise.
///
/// Fulfilling a [`Promise`] lets the connected [`PromiseHandle`] retrieve the
/// value.
pub struct Promise<T> {
    inner: crossbeam::channel::Sender<T>,
}

impl<T> Promise<T> {
    /// Fulfills the promise with a value, consuming it.
    ///
    /// If a thread is currently waiting at [`PromiseHandle::block`], it will
    /// be woken up.
    ///
    /// This method does not block or fail. If the connected [`PromiseHandle`]
    /// was dropped, `value` will be dropped and nothing happens.
    pub fn fulfill(self, value: T) {
        self.inner.send(value).ok();
    }
}

/// A handle connected to a [`Promise`] that will eventually resolve to a value
/// of type `T`.
pub struct PromiseHandle<T> {
    recv: crossbeam::channel::Receiver<T>,
}

impl<T> PromiseHandle<T> {
    /// Blocks the calling thread until the [`Promise`] is fulfilled.
    ///
    /// An error means the promise was dropped unfulfilled, which in practice
    /// means the worker holding it has panicked. We have no access to the
    /// panic payload here, so the caller is expected to drop the executor,
    /// which joins the pool and resumes the panic with its real payload.
    pub fn block(self) -> Result<T, PromiseDropped> {
        self.recv.recv().map_err(|_| PromiseDropped { _priv: () })
    }
}

/// An error returned by [`PromiseHandle::block`] indicating that the connected
/// [`Promise`] object was dropped without being fulfilled.
#[derive(Debug, Clone, Copy)]
pub struct PromiseDropped {
    _priv: (),
}

/// A unit of work for an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can run submitted tasks.
///
/// The two implementations are interchangeable as far as callers are
/// concerned; results must be identical regardless of which one is active.
pub trait Executor {
    /// Submits a task for execution.
    ///
    /// May block until a worker is available. Completion is observed through
    /// whatever [`Promise`] the task carries, not through this call.
    fn submit(&mut self, task: Task);
}

/// Runs every task on the calling thread, at submission time.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn submit(&mut self, task: Task) {
        task();
    }
}

/// A fixed-size pool of worker threads consuming tasks from a shared channel.
///
/// When dropped, the channel to the threads will be closed and the threads
/// will be joined. If a thread has panicked, the panic will be forwarded to
/// the thread dropping the pool.
pub struct ThreadPool {
    sender: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `workers` named worker threads.
    pub fn new(workers: usize) -> io::Result<Self> {
        assert!(workers > 0, "thread pool needs at least one worker");

        let (sender, recv) = crossbeam::channel::bounded::<Task>(0);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let recv = recv.clone();
            let handle = thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    log::trace!("worker starting");
                    for task in recv {
                        task();
                    }
                    log::trace!("worker exiting");
                })?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    fn join_workers(&mut self) {
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(()) => {}
                Err(payload) => {
                    if !thread::panicking() {
                        resume_unwind(payload);
                    }
                }
            }
        }
    }
}

impl Executor for ThreadPool {
    fn submit(&mut self, task: Task) {
        match self.sender.as_ref().unwrap().send(task) {
            Ok(()) => {}
            Err(_) => {
                // All workers are gone; join them to propagate the panic.
                self.join_workers();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Close the channel to signal the threads to exit.
        drop(self.sender.take());

        self.join_workers();
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;

    fn silent_panic(payload: String) {
        resume_unwind(Box::new(payload));
    }

    #[test]
    fn pool_runs_tasks() {
        let mut pool = ThreadPool::new(2).unwrap();
        let handles = (0..8)
            .map(|i| {
                let (promise, handle) = promise();
                pool.submit(Box::new(move || promise.fulfill(i * 2)));
                handle
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|handle| handle.block().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(results, vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }

    #[test]
    fn inline_executor_runs_at_submission() {
        let (promise, handle) = promise();
        InlineExecutor.submit(Box::new(move || promise.fulfill(123)));
        assert_eq!(handle.block().unwrap(), 123);
    }

    #[test]
    fn pool_propagates_panic_on_drop() {
        let mut pool = ThreadPool::new(1).unwrap();
        pool.submit(Box::new(|| silent_panic("worker panic".into())));
        catch_unwind(AssertUnwindSafe(|| drop(pool))).unwrap_err();
    }

    #[test]
    fn dropped_promise_is_reported() {
        let mut pool = ThreadPool::new(1).unwrap();
        let (promise, handle) = promise::<()>();
        pool.submit(Box::new(move || drop(promise)));
        handle.block().unwrap_err();
    }
}
