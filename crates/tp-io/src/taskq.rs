//! Fixed-size worker pool driving pipeline stage execution.
//!
//! Stage handlers never block a worker: anything that must wait registers
//! itself and returns, so a small fixed pool is enough to saturate the
//! devices. Jobs arrive over a channel; workers run until the pool drops.

use crossbeam_channel::{unbounded, Sender};
use std::thread::JoinHandle;
use tracing::debug;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct TaskPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawn `workers` threads (at least one).
    #[must_use]
    pub fn new(name: &str, workers: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..workers.max(1))
            .map(|idx| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || {
                        while let Ok(job) = receiver.recv() {
                            job();
                        }
                    })
                    .expect("spawn worker thread")
            })
            .collect();
        Self {
            sender: Some(sender),
            workers,
        }
    }

    /// Queue a job. Jobs submitted after shutdown are dropped silently;
    /// that only happens while the engine itself is being torn down.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Box::new(job));
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        // Closing the channel ends the worker loops once drained.
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                debug!("task worker panicked during shutdown");
            }
        }
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}
