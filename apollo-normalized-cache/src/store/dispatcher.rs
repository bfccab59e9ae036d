//! Where enqueued store operations run.

use std::sync::Arc;

use crate::error::StoreError;

/// A unit of work handed to a [`Dispatcher`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs enqueued store operations.
///
/// A dispatcher that cannot run a job drops it, and the operation then reports a dispatch
/// failure to its caller. Failures known while dispatching are also returned.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, job: Job) -> Result<(), StoreError>;
}

/// Runs jobs on tokio's blocking thread pool.
#[derive(Clone, Debug)]
pub struct TokioDispatcher {
    handle: tokio::runtime::Handle,
}

impl TokioDispatcher {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// A dispatcher for the runtime of the caller, if there is one.
    pub fn current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, job: Job) -> Result<(), StoreError> {
        // the job reports its own outcome, the join handle is not needed. A runtime that shut
        // down drops the job unrun.
        let _ = self.handle.spawn_blocking(job);
        Ok(())
    }
}

/// Runs each job on a new thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadDispatcher;

impl Dispatcher for ThreadDispatcher {
    fn dispatch(&self, job: Job) -> Result<(), StoreError> {
        std::thread::Builder::new()
            .name("apollo-store".to_string())
            .spawn(job)
            .map(|_| ())
            .map_err(|e| StoreError::Dispatch {
                reason: format!("could not spawn a store thread: {e}"),
            })
    }
}

/// Runs jobs on the calling thread, before `dispatch` returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn dispatch(&self, job: Job) -> Result<(), StoreError> {
        job();
        Ok(())
    }
}

/// The tokio dispatcher when called from a runtime, a thread per job otherwise.
pub(crate) fn default_dispatcher() -> Arc<dyn Dispatcher> {
    match TokioDispatcher::current() {
        Some(dispatcher) => Arc::new(dispatcher),
        None => Arc::new(ThreadDispatcher),
    }
}
