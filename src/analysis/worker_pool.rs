//! Bounded pool running background plugin invocations off the frame loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, error};

use crate::analysis::crop::Crop;
use crate::analysis::plugin::{Plugin, invoke_isolated};
use crate::config::SchedulerConfig;
use crate::error::PluginError;
use crate::identity::IdentitySnapshot;

/// A background invocation waiting for a worker.
pub(crate) struct Job {
    pub identity: IdentitySnapshot,
    pub plugin: Arc<dyn Plugin>,
    pub crop: Arc<Crop>,
    pub dispatched_at: DateTime<Utc>,
}

/// A finished background invocation.
#[derive(Debug)]
pub(crate) struct Completion {
    pub identity: u64,
    pub plugin: String,
    pub dispatched_at: DateTime<Utc>,
    pub result: Result<Value, PluginError>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs jobs on blocking threads of a private tokio runtime.
///
/// At most `worker_threads` jobs run at once; a dispatch with no free slot is
/// refused rather than queued. A job past its deadline is reported as timed out
/// right away, but keeps its slot until the plugin call actually returns. The
/// runtime is only started on first dispatch.
pub(crate) struct WorkerPool {
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    workers: usize,
    deadline: Duration,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: mpsc::UnboundedReceiver<Completion>,
}

impl WorkerPool {
    pub(crate) fn new(config: &SchedulerConfig) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            runtime: None,
            permits: Arc::new(Semaphore::new(config.worker_threads)),
            workers: config.worker_threads,
            deadline: config.plugin_deadline,
            completion_tx,
            completion_rx,
        }
    }

    /// Start `job` if a worker is free. Returns `false` when it was not
    /// started; the caller should try again on a later tick.
    pub(crate) fn try_dispatch(&mut self, job: Job) -> bool {
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            return false;
        };
        let tx = self.completion_tx.clone();
        let deadline = self.deadline;
        let Some(runtime) = self.runtime() else {
            return false;
        };

        runtime.spawn(async move {
            let Job {
                identity,
                plugin,
                crop,
                dispatched_at,
            } = job;
            let id = identity.id;
            let name = plugin.name().to_string();

            let work = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                invoke_isolated(plugin.as_ref(), &crop, &identity)
            });
            let result = match tokio::time::timeout(deadline, work).await {
                Ok(Ok(result)) => result,
                Ok(Err(err)) => Err(PluginError::Panicked(err.to_string())),
                Err(_) => Err(PluginError::Timeout(deadline)),
            };

            let completion = Completion {
                identity: id,
                plugin: name,
                dispatched_at,
                result,
            };
            if tx.send(completion).is_err() {
                debug!(id, "Worker pool dropped before completion was delivered");
            }
        });
        true
    }

    /// Next finished job, without waiting.
    pub(crate) fn try_recv(&mut self) -> Option<Completion> {
        self.completion_rx.try_recv().ok()
    }

    /// Next finished job, waiting at most `timeout`.
    ///
    /// Called from inside another tokio runtime, this polls the channel
    /// instead of blocking on the pool's own runtime.
    pub(crate) fn recv_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        if let Some(completion) = self.try_recv() {
            return Some(completion);
        }
        if Handle::try_current().is_ok() {
            return self.poll_until(Instant::now() + timeout);
        }
        let Self {
            runtime,
            completion_rx,
            ..
        } = self;
        let runtime = runtime.as_ref()?;
        runtime
            .block_on(async { tokio::time::timeout(timeout, completion_rx.recv()).await })
            .ok()
            .flatten()
    }

    fn poll_until(&mut self, deadline: Instant) -> Option<Completion> {
        loop {
            if let Some(completion) = self.try_recv() {
                return Some(completion);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            std::thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }

    fn runtime(&mut self) -> Option<&Runtime> {
        if self.runtime.is_none() {
            let built = Builder::new_multi_thread()
                .worker_threads(1)
                .max_blocking_threads(self.workers)
                .thread_name("persona-track-analysis")
                .enable_time()
                .build();
            match built {
                Ok(runtime) => self.runtime = Some(runtime),
                Err(err) => {
                    error!(error = %err, "Failed to start analysis worker runtime");
                    return None;
                }
            }
        }
        self.runtime.as_ref()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}
