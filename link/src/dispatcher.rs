use crate::common::DispatchError;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A unit of work that mutates transport state.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Serializing executor for everything that touches a transport link.
///
/// Implementations guarantee that accepted work items run one at a time,
/// in submission order, on a single logical I/O context. Rejection is an
/// ordinary return value so callers can branch on it.
pub trait Dispatcher: Send + Sync {
    fn invoke(&self, work: Work) -> Result<(), DispatchError>;
}

/// Dispatcher backed by a bounded work queue drained by one tokio task.
pub struct ReactorDispatcher {
    queue: flume::Sender<Work>,
    cancel_token: CancellationToken,
    worker: JoinHandle<()>,
}

impl ReactorDispatcher {
    /// Spawn the worker task on the current tokio runtime.
    pub fn new(capacity: usize) -> Self {
        let (queue, work_rx) = flume::bounded::<Work>(capacity.max(1));
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();

        let worker = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    work = work_rx.recv_async() => {
                        let Ok(work) = work else {
                            break;
                        };
                        if catch_unwind(AssertUnwindSafe(work)).is_err() {
                            log::error!("Dispatcher work item panicked; continuing with next item");
                        }
                    }
                }
            }

            let dropped = work_rx.drain().count();
            if dropped > 0 {
                log::debug!("Dispatcher stopped with {dropped} queued work items dropped");
            }
            log::debug!("Dispatcher worker exited");
        });

        Self {
            queue,
            cancel_token,
            worker,
        }
    }

    /// Stop accepting work. Items still queued are dropped.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Number of work items waiting to run
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

impl Dispatcher for ReactorDispatcher {
    fn invoke(&self, work: Work) -> Result<(), DispatchError> {
        if self.cancel_token.is_cancelled() {
            return Err(DispatchError::Closed);
        }

        self.queue.try_send(work).map_err(|e| match e {
            flume::TrySendError::Full(_) => DispatchError::QueueFull,
            flume::TrySendError::Disconnected(_) => DispatchError::Closed,
        })
    }
}

impl Drop for ReactorDispatcher {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.worker.abort();
    }
}
