use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::dispatcher::Dispatcher;
use crate::error::StoreError;

type Perform<T> = Box<dyn FnOnce() -> Result<T, StoreError> + Send + 'static>;

/// A deferred unit of store work.
///
/// It runs exactly once: either synchronously with [`StoreOperation::execute`], or on the store's
/// dispatcher with [`StoreOperation::enqueue`] or [`StoreOperation::execute_async`]. Any further
/// attempt fails with [`StoreError::OperationAlreadyExecuted`].
#[must_use = "store operations do nothing until executed or enqueued"]
pub struct StoreOperation<T> {
    perform: Mutex<Option<Perform<T>>>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl<T> fmt::Debug for StoreOperation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOperation")
            .field("executed", &self.perform.lock().is_none())
            .finish()
    }
}

impl<T> StoreOperation<T>
where
    T: Send + 'static,
{
    pub(crate) fn new(
        dispatcher: Arc<dyn Dispatcher>,
        perform: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
    ) -> Self {
        Self {
            perform: Mutex::new(Some(Box::new(perform))),
            dispatcher,
        }
    }

    fn take(&self) -> Result<Perform<T>, StoreError> {
        self.perform
            .lock()
            .take()
            .ok_or(StoreError::OperationAlreadyExecuted)
    }

    /// Runs the operation on the calling thread.
    pub fn execute(&self) -> Result<T, StoreError> {
        let perform = self.take()?;
        run(perform)
    }

    /// Hands the operation to the dispatcher and returns immediately.
    ///
    /// `callback` is invoked exactly once with the outcome, usually on the dispatcher's thread.
    /// When the dispatcher drops the operation without running it, the outcome is
    /// [`StoreError::Dispatch`].
    pub fn enqueue(
        &self,
        callback: impl FnOnce(Result<T, StoreError>) + Send + 'static,
    ) -> Result<(), StoreError> {
        let perform = self.take()?;
        let mut callback = scopeguard::guard(Some(callback), |callback| {
            if let Some(callback) = callback {
                callback(Err(StoreError::Dispatch {
                    reason: "the dispatcher dropped the operation".to_string(),
                }));
            }
        });
        let job = move || {
            if let Some(callback) = callback.take() {
                callback(run(perform));
            }
        };
        if let Err(e) = self.dispatcher.dispatch(Box::new(job)) {
            tracing::error!("{e}");
        }
        Ok(())
    }

    /// Runs the operation on the dispatcher and waits for its outcome.
    pub async fn execute_async(&self) -> Result<T, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(move |result| {
            // the caller may have stopped waiting
            let _ = tx.send(result);
        })?;
        rx.await.map_err(|_| StoreError::Dispatch {
            reason: "the dispatcher dropped the operation".to_string(),
        })?
    }
}

fn run<T>(perform: Perform<T>) -> Result<T, StoreError> {
    match std::panic::catch_unwind(AssertUnwindSafe(perform)) {
        Ok(result) => result,
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            tracing::error!("store operation panicked: {reason}");
            Err(StoreError::OperationPanicked { reason })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
