//! Pipeline scheduling: phase ordering and adaptive concurrency.
//!
//! Merging partition `p` needs every sample's count file for `p` to exist,
//! so counting across all samples must finish before a merge starts --
//! [`Scheduler::run_phase`] is the barrier for that kind of all-or-nothing
//! transition: it fans work out across threads bounded by `max_running`,
//! and only returns once every job in the phase has completed.
//!
//! Within one sample, though, binning and counting don't need that barrier
//! -- a sample's P counting tasks only depend on *that sample's* binning
//! having finished, not every other sample's. The counting stage keeps
//! sample-level memory bounded by throttling how many samples are binning
//! (the larger, memory-hungrier phase) at once: [`Scheduler::max_running`]
//! and [`Scheduler::throttle`] expose that cap directly, for a caller
//! interleaving binning-then-counting per sample across many samples at
//! once rather than running a phase as one barrier.
//!
//! `max_running` starts at `floor(total_workers * focus)` and halves (down
//! to a floor of 1) every time [`Scheduler::throttle`] is called --
//! intended for a caller who detects memory pressure mid-run and wants to
//! shed concurrency without stopping the pipeline outright.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

/// Computes and adapts the concurrency cap for pipeline phases.
pub struct Scheduler {
    total_workers: usize,
    focus: f64,
    max_running: AtomicUsize,
}

impl Scheduler {
    #[must_use]
    pub fn new(total_workers: usize, focus: f64) -> Self {
        let max_running = Self::compute_max_running(total_workers, focus);
        Self { total_workers, focus, max_running: AtomicUsize::new(max_running) }
    }

    fn compute_max_running(total_workers: usize, focus: f64) -> usize {
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let computed = (total_workers as f64 * focus).floor() as usize;
        computed.max(1)
    }

    #[must_use]
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// Halves `max_running`, floored at 1.
    pub fn throttle(&self) {
        let _ = self
            .max_running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |cur| Some((cur / 2).max(1)));
    }

    /// Restores `max_running` to `floor(total_workers * focus)`.
    pub fn reset(&self) {
        self.max_running
            .store(Self::compute_max_running(self.total_workers, self.focus), Ordering::SeqCst);
    }

    /// Runs every job in `jobs` to completion, never more than
    /// `max_running` concurrently, and returns their results once every job
    /// has finished. A full barrier: the right and only primitive for
    /// moving between pipeline phases.
    ///
    /// # Panics
    /// Propagates a panic from any job after every other job has finished
    /// (the scoped threads are joined unconditionally first).
    pub fn run_phase<T: Send>(&self, jobs: Vec<impl FnOnce() -> T + Send>) -> Vec<T> {
        let limit = self.max_running();
        let gate: Arc<(Mutex<usize>, Condvar)> = Arc::new((Mutex::new(limit), Condvar::new()));
        std::thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .into_iter()
                .map(|job| {
                    let gate = Arc::clone(&gate);
                    scope.spawn(move || {
                        acquire(&gate);
                        let result = job();
                        release(&gate);
                        result
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("pipeline phase job panicked")).collect()
        })
    }
}

fn acquire(gate: &(Mutex<usize>, Condvar)) {
    let (lock, cvar) = gate;
    let mut slots = lock.lock().expect("scheduler gate mutex poisoned");
    while *slots == 0 {
        slots = cvar.wait(slots).expect("scheduler gate mutex poisoned");
    }
    *slots -= 1;
}

fn release(gate: &(Mutex<usize>, Condvar)) {
    let (lock, cvar) = gate;
    let mut slots = lock.lock().expect("scheduler gate mutex poisoned");
    *slots += 1;
    cvar.notify_one();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as A, Ordering as O};

    #[test]
    fn max_running_is_floor_of_workers_times_focus() {
        let scheduler = Scheduler::new(10, 0.5);
        assert_eq!(scheduler.max_running(), 5);
    }

    #[test]
    fn max_running_never_drops_below_one() {
        let scheduler = Scheduler::new(4, 0.1);
        assert_eq!(scheduler.max_running(), 1);
    }

    #[test]
    fn throttle_halves_and_floors_at_one() {
        let scheduler = Scheduler::new(16, 1.0);
        assert_eq!(scheduler.max_running(), 16);
        scheduler.throttle();
        assert_eq!(scheduler.max_running(), 8);
        scheduler.throttle();
        scheduler.throttle();
        scheduler.throttle();
        assert_eq!(scheduler.max_running(), 1);
    }

    #[test]
    fn reset_restores_original_cap() {
        let scheduler = Scheduler::new(8, 0.5);
        scheduler.throttle();
        assert_eq!(scheduler.max_running(), 2);
        scheduler.reset();
        assert_eq!(scheduler.max_running(), 4);
    }

    #[test]
    fn run_phase_completes_every_job_and_respects_the_cap() {
        let scheduler = Scheduler::new(2, 1.0);
        let concurrent = Arc::new(A::new(0));
        let max_seen = Arc::new(A::new(0));
        let jobs: Vec<_> = (0..20)
            .map(|i| {
                let concurrent = Arc::clone(&concurrent);
                let max_seen = Arc::clone(&max_seen);
                move || {
                    let now = concurrent.fetch_add(1, O::SeqCst) + 1;
                    max_seen.fetch_max(now, O::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(1));
                    concurrent.fetch_sub(1, O::SeqCst);
                    i
                }
            })
            .collect();
        let results = scheduler.run_phase(jobs);
        assert_eq!(results.len(), 20);
        assert!(max_seen.load(O::SeqCst) <= 2);
    }
}
