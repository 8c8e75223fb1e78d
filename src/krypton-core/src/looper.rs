//! Per-component cooperative executor.
//!
//! Each component (Session, Provision, Auth, EgressManager, the embedder's
//! notification sink) owns a [`Looper`]: a single tokio task draining a
//! FIFO queue of closures. Everything that mutates a component's state is
//! posted onto its looper, which is how the components serialize their own
//! work without holding locks across suspension points.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run(Job),
    Stop,
}

/// A single-threaded FIFO executor for one component.
pub struct Looper {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Looper {
    /// Spawns the worker task. Must be called within a tokio runtime.
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let worker_name = name.to_string();
        let handle = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Run(job) => job(),
                    Command::Stop => break,
                }
            }
            trace!(looper = %worker_name, "looper exiting");
        });
        Self {
            name: name.to_string(),
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues a closure; it runs after everything already queued.
    ///
    /// Posting to a stopped looper is a no-op.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Command::Run(Box::new(job))).is_err() {
            debug!(looper = %self.name, "post after stop, dropping job");
        }
    }

    /// Stops dispatch. Jobs queued before the stop still run; jobs posted
    /// after it are dropped.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    /// Waits for the worker to drain and exit. Implies [`Looper::stop`].
    pub async fn join(&self) {
        self.stop();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.stop();
    }
}
