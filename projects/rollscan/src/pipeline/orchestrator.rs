// Pipeline scheduler: runs each worker as an independent polling loop
//
// Workers never call each other. Every hand-off goes through the session
// directories, so a worker only needs to advance one unit of work per tick.

use anyhow::Result;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A unit of the pipeline that is polled on a fixed interval.
pub trait PollWorker: Send {
    fn name(&self) -> &'static str;

    /// Advance by at most one unit of work. An error ends only the current cycle.
    fn poll(&mut self) -> Result<()>;
}

pub struct PipelineScheduler {
    interval: Duration,
    shutdown_tx: Option<Sender<()>>,
    shutdown_rx: Receiver<()>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineScheduler {
    pub fn new(interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        Self {
            interval,
            shutdown_tx: Some(shutdown_tx),
            shutdown_rx,
            workers: Vec::new(),
        }
    }

    /// Start polling `worker` on its own thread.
    pub fn spawn<W: PollWorker + 'static>(&mut self, worker: W) {
        let name = worker.name();
        let interval = self.interval;
        let shutdown_rx = self.shutdown_rx.clone();
        let handle = thread::spawn(move || run_worker(worker, interval, shutdown_rx));
        tracing::info!("Spawned {} worker, polling every {:?}", name, interval);
        self.workers.push((name, handle));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Signal every worker to stop and wait for them. A worker in the middle of
    /// a cycle finishes that cycle first.
    pub fn shutdown(mut self) {
        // Dropping the only sender disconnects every worker's receiver.
        self.shutdown_tx.take();
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("{} worker panicked", name);
            } else {
                tracing::info!("{} worker stopped", name);
            }
        }
    }
}

fn run_worker<W: PollWorker>(mut worker: W, interval: Duration, shutdown_rx: Receiver<()>) {
    loop {
        if let Err(e) = worker.poll() {
            tracing::error!("{} worker cycle failed: {:#}", worker.name(), e);
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
