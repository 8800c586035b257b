//! Worker substrate: fire-and-forget units of work on tokio
//!
//! Every submitted unit is counted as in flight from submission until it
//! finishes or is aborted, so [`Worker::wait_idle`] observes work that is
//! queued behind the concurrency limit or sleeping on a timer.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::WorkerConfig;

struct WorkerInner {
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Bounded task submitter
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

/// Decrements the in-flight count when a unit of work ends, however it ends
struct InFlight {
    inner: Arc<WorkerInner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    fn track(&self) -> InFlight {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight {
            inner: self.inner.clone(),
        }
    }

    /// Run `task` once a permit is free. Submission order is not execution order.
    pub fn submit<F>(&self, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_after(Duration::ZERO, label, task)
    }

    /// Run `task` after `delay`. No permit is held while sleeping.
    pub fn submit_after<F>(&self, delay: Duration, label: &'static str, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.track();
        let permits = self.inner.permits.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::warn!(task = label, "Worker closed; dropping task");
                    return;
                }
            };
            tracing::trace!(task = label, "Running task");
            task.await;
        })
    }

    /// Units of work submitted and not yet finished
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Resolve once no submitted work is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop handing out permits. Tasks already running finish; waiting ones are dropped.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}
