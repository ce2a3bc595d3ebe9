//! Worker Pool
//!
//! Fixed set of named threads draining a FIFO job channel. A pool with a
//! single thread doubles as a serial lane: jobs submitted to it run one at a
//! time, in submission order.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

/// Owner of the worker threads
pub struct WorkerPool {
    name: String,
    handle: PoolHandle,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable submission handle
///
/// Jobs capture handles, never the pool itself, so the last reference to a
/// pool is never dropped on one of its own threads.
#[derive(Clone)]
pub struct PoolHandle {
    sender: Sender<Message>,
    queued: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{n}`
    pub fn new(name: &str, threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = channel::unbounded();
        let queued = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(threads);
        for n in 0..threads {
            let receiver: Receiver<Message> = receiver.clone();
            let queued = Arc::clone(&queued);
            let worker = thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || run_worker(receiver, queued))?;
            workers.push(worker);
        }

        tracing::debug!(pool = name, threads, "worker pool started");

        Ok(Self {
            name: name.to_string(),
            handle: PoolHandle { sender, queued },
            workers: Mutex::new(workers),
        })
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop accepting work once everything already queued has run, then join
    ///
    /// Jobs submitted after this call are dropped without running.
    pub fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for _ in 0..workers.len() {
            // Receivers live as long as the workers, so this cannot fail
            let _ = self.handle.sender.send(Message::Shutdown);
        }

        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!(pool = %self.name, "worker thread panicked");
            }
        }
        tracing::debug!(pool = %self.name, "worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolHandle {
    /// Queue a job; returns the queue depth including this job
    pub fn execute<F>(&self, job: F) -> usize
    where
        F: FnOnce() + Send + 'static,
    {
        let depth = self.queued.fetch_add(1, Ordering::AcqRel) + 1;
        if self.sender.send(Message::Run(Box::new(job))).is_err() {
            self.queued.fetch_sub(1, Ordering::AcqRel);
            tracing::warn!("job submitted to a stopped pool was dropped");
        }
        depth
    }

    /// Jobs queued but not yet started
    pub fn queue_depth(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

fn run_worker(receiver: Receiver<Message>, queued: Arc<AtomicUsize>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => {
                queued.fetch_sub(1, Ordering::AcqRel);
                job();
            }
            Message::Shutdown => break,
        }
    }
}

/// Thread count matching the machine's available parallelism
pub fn default_threads() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
