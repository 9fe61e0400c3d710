// src/core/scheduler.rs

//! A small priority-queue job scheduler, in the spirit of the reference
//! implementation's own `scheduler` module: jobs are kept in a list sorted
//! by next-run time, `run_all` does an immediate staggered first pass, and
//! [`Scheduler::due`] re-enqueues each job at `previous_scheduled +
//! interval` rather than `now + interval`, so a slow tick does not
//! permanently shift a job's cadence.

use std::time::{Duration, Instant};

struct Job<K> {
    kind: K,
    next_run: Instant,
    interval: Duration,
}

/// Generic over the job identifier `K` so the scheduler itself carries no
/// knowledge of what a job actually does; the caller dispatches on `K` and
/// performs the work.
pub struct Scheduler<K> {
    jobs: Vec<Job<K>>,
}

impl<K: Clone> Scheduler<K> {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Registers a job at the given interval. The job is immediately due;
    /// call [`Scheduler::run_all`] once at startup to give every job a
    /// staggered first run before switching to [`Scheduler::due`] polling.
    pub fn add(&mut self, kind: K, interval: Duration) {
        self.insert_sorted(Job { kind, next_run: Instant::now(), interval });
    }

    fn insert_sorted(&mut self, job: Job<K>) {
        let pos = self.jobs.partition_point(|j| j.next_run <= job.next_run);
        self.jobs.insert(pos, job);
    }

    /// Drains every registered job regardless of its current due time,
    /// returning them in next-run order. Each job is rescheduled to
    /// `now + interval`, which avoids a stampede of simultaneous re-runs the
    /// next time `due` is polled. The caller should pace its own execution
    /// of the returned jobs (e.g. sleeping `delay` between each) rather than
    /// run them all in the same instant.
    pub fn run_all(&mut self) -> Vec<K> {
        let now = Instant::now();
        let drained = std::mem::take(&mut self.jobs);
        let kinds = drained.iter().map(|j| j.kind.clone()).collect();
        for mut job in drained {
            job.next_run = now + job.interval;
            self.insert_sorted(job);
        }
        kinds
    }

    /// Pops every job whose `next_run` has passed, returning their kinds in
    /// due order, and re-enqueues each at `previous next_run + interval` so
    /// cadence is preserved even if this call happened late.
    pub fn due(&mut self) -> Vec<K> {
        let now = Instant::now();
        let split = self.jobs.partition_point(|j| j.next_run <= now);
        let due: Vec<Job<K>> = self.jobs.drain(..split).collect();
        let kinds = due.iter().map(|j| j.kind.clone()).collect();
        for mut job in due {
            job.next_run += job.interval;
            self.insert_sorted(job);
        }
        kinds
    }

    /// How long until the next job becomes due, for sizing a poll sleep.
    pub fn next_wake(&self) -> Option<Duration> {
        self.jobs.first().map(|j| j.next_run.saturating_duration_since(Instant::now()))
    }
}

impl<K: Clone> Default for Scheduler<K> {
    fn default() -> Self {
        Self::new()
    }
}
