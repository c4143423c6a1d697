//! Fixed-worker task pool.
//!
//! A small number of OS threads (set at construction, not adaptive) pull
//! jobs from a shared work-stealing queue: [`crossbeam_deque::Injector`]
//! feeds each worker's local [`crossbeam_deque::Worker`] deque, and workers
//! steal from each other's deques and the injector when their own is empty
//! (the standard crossbeam-deque recipe). [`crossbeam_channel`] carries the
//! shutdown signal, since a deque alone has no "stop" primitive.
//!
//! [`crate::pipeline`] builds on top of this: it decides *when* to submit
//! work (its adaptive throttling), this module only decides *how* submitted
//! work gets run across a fixed set of threads.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};
use crossbeam_deque::{Injector, Steal, Stealer, Worker};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of worker threads sharing one work-stealing queue.
pub struct TaskPool {
    injector: Arc<Injector<Job>>,
    shutdown_tx: Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Spawns `workers` threads, each looping: try its local deque, then the
    /// shared injector, then every sibling's deque, in that order, per
    /// crossbeam-deque's documented stealing pattern.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let injector = Arc::new(Injector::new());
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let locals: Vec<Worker<Job>> = (0..workers).map(|_| Worker::new_fifo()).collect();
        let stealers: Vec<Stealer<Job>> = locals.iter().map(Worker::stealer).collect();

        let handles = locals
            .into_iter()
            .enumerate()
            .map(|(id, local)| {
                let injector = Arc::clone(&injector);
                let stealers = stealers.clone();
                let shutdown_rx = shutdown_rx.clone();
                std::thread::Builder::new()
                    .name(format!("kmerust-worker-{id}"))
                    .spawn(move || worker_loop(&local, &injector, &stealers, &shutdown_rx))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { injector, shutdown_tx, handles }
    }

    /// Enqueues `job` onto the shared injector; any idle worker may pick it
    /// up.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.injector.push(Box::new(job));
    }

    /// A cloneable handle that can submit further jobs from inside a running
    /// job -- e.g. a completion callback that enqueues follow-up work once
    /// its own task finishes, without needing to borrow the pool itself.
    #[must_use]
    pub fn handle(&self) -> TaskHandle {
        TaskHandle { injector: Arc::clone(&self.injector) }
    }

    /// Signals every worker to exit once its queues are empty, then joins
    /// all threads. Jobs submitted by other jobs (via [`TaskHandle`]) while
    /// shutdown is pending are still drained: a worker only exits once the
    /// injector and its own local deque are both empty.
    pub fn shutdown(self) {
        drop(self.shutdown_tx);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

/// A cheap, `Clone`-able submission endpoint for a [`TaskPool`], usable from
/// inside a job running on that same pool.
#[derive(Clone)]
pub struct TaskHandle {
    injector: Arc<Injector<Job>>,
}

impl TaskHandle {
    /// Enqueues `job` onto the pool's shared injector.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        self.injector.push(Box::new(job));
    }
}

fn worker_loop(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>], shutdown_rx: &Receiver<()>) {
    loop {
        if let Some(job) = find_task(local, injector, stealers) {
            job();
            continue;
        }
        // No work anywhere right now. Block briefly on the shutdown channel
        // so we don't spin; a real send never happens, only the channel
        // closing (on pool drop) wakes us with an error.
        match shutdown_rx.recv_timeout(std::time::Duration::from_millis(10)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                if injector.is_empty() && local.is_empty() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
    }
}

fn find_task(local: &Worker<Job>, injector: &Injector<Job>, stealers: &[Stealer<Job>]) -> Option<Job> {
    local.pop().or_else(|| loop {
        match injector.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Empty => break None,
            Steal::Retry => continue,
        }
    }).or_else(|| {
        for stealer in stealers {
            loop {
                match stealer.steal() {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    })
}
