//! # Callback Queue
//!
//! Serial executor on which subscriber callbacks run. Keeping user code off
//! the frame-routing tasks means a slow callback delays only its own queue,
//! never frame ingestion or reconnection.

use std::thread;

use tokio::sync::mpsc;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A cloneable handle to a serial job queue. Jobs run in submission order.
///
/// The worker stops once every handle is dropped and the backlog is drained.
#[derive(Clone)]
pub struct CallbackQueue {
    label: String,
    jobs: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Runs jobs on a dedicated OS thread. Use for blocking or slow callbacks.
    pub fn new(label: &str) -> std::io::Result<Self> {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        thread::Builder::new()
            .name(format!("stomp-cb-{}", label))
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
            })?;

        Ok(Self {
            label: label.to_string(),
            jobs,
        })
    }

    /// Runs jobs on a task of the current tokio runtime.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    pub fn on_runtime(label: &str) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job();
            }
        });

        Self {
            label: label.to_string(),
            jobs,
        }
    }

    /// Queues `job`. Returns `false` if the worker is gone.
    pub fn execute<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.jobs.send(Box::new(job)).is_err() {
            log::warn!("Callback queue '{}' is closed, dropping job", self.label);
            return false;
        }
        true
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

impl std::fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue").field("label", &self.label).finish()
    }
}
