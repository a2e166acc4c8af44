//! Decode executor: an unbounded FIFO work queue drained by a fixed set of
//! named OS threads.
//!
//! Workers park while the queue is empty and at least one [`WorkGuard`] is
//! alive. With no guard and nothing queued they exit, so the executor is
//! born holding one guard and the service keeps it until shutdown.
//!
//! ```text
//! DecodeQueue::submit ──► VecDeque<Job> ──► decode-0 .. decode-N
//!                          (Mutex+Condvar)     (catch_unwind per job)
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use metrics::{counter, gauge};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

/// A unit of work for the decode pool.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executor failures.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The executor is shutting down (or every worker has exited).
    #[error("decode executor is shutting down")]
    ShutdownRejected,
    /// A worker thread could not be started.
    #[error("failed to spawn decode worker: {0}")]
    Spawn(String),
}

/// Outcome of [`DecodeExecutor::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Queued jobs dropped without running.
    pub discarded: usize,
    /// Worker threads joined by this call.
    pub workers_joined: usize,
}

struct QueueState {
    jobs: VecDeque<Job>,
    guards: usize,
    accepting: bool,
    live_workers: usize,
}

struct Shared {
    state: Mutex<QueueState>,
    work: Condvar,
}

#[allow(clippy::cast_precision_loss)]
fn record_depth(depth: usize) {
    gauge!("decode_queue_depth").set(depth as f64);
}

impl Shared {
    fn next_job(&self, worker: usize) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                record_depth(state.jobs.len());
                return Some(job);
            }
            if !state.accepting || state.guards == 0 {
                state.live_workers -= 1;
                debug!(worker, live = state.live_workers, "decode worker exiting");
                return None;
            }
            self.work.wait(&mut state);
        }
    }
}

fn worker_loop(shared: &Shared, worker: usize) {
    debug!(worker, "decode worker started");
    while let Some(job) = shared.next_job(worker) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            warn!(worker, panic = %panic_message(panic.as_ref()), "decode job panicked");
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Cloneable submit handle onto the executor's queue.
#[derive(Clone)]
pub struct DecodeQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DecodeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeQueue").finish_non_exhaustive()
    }
}

impl DecodeQueue {
    /// Enqueue `job`. Never blocks.
    ///
    /// On rejection the job is dropped without running.
    pub fn submit(&self, job: Job) -> Result<(), ExecutorError> {
        let mut state = self.shared.state.lock();
        if !state.accepting || state.live_workers == 0 {
            drop(state);
            drop(job);
            return Err(ExecutorError::ShutdownRejected);
        }
        state.jobs.push_back(job);
        record_depth(state.jobs.len());
        drop(state);
        let _ = self.shared.work.notify_one();
        Ok(())
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

/// Keeps idle workers parked instead of exiting. Released on drop.
pub struct WorkGuard {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WorkGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkGuard").finish_non_exhaustive()
    }
}

impl WorkGuard {
    fn acquire(shared: &Arc<Shared>) -> Self {
        shared.state.lock().guards += 1;
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        let released = {
            let mut state = self.shared.state.lock();
            state.guards -= 1;
            state.guards == 0
        };
        if released {
            let _ = self.shared.work.notify_all();
        }
    }
}

/// The decode pool.
pub struct DecodeExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for DecodeExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeExecutor")
            .field("worker_count", &self.worker_count)
            .field("live_workers", &self.live_workers())
            .finish_non_exhaustive()
    }
}

impl DecodeExecutor {
    /// Spawn `worker_count` threads named `decode-<n>`.
    ///
    /// Returns the executor together with its initial [`WorkGuard`].
    pub fn start(worker_count: usize) -> Result<(Self, WorkGuard), ExecutorError> {
        if worker_count == 0 {
            return Err(ExecutorError::Spawn(
                "decoder_thread_num must be at least 1".into(),
            ));
        }
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                guards: 0,
                accepting: true,
                live_workers: worker_count,
            }),
            work: Condvar::new(),
        });
        let guard = WorkGuard::acquire(&shared);
        let executor = Self {
            shared,
            workers: Mutex::new(Vec::with_capacity(worker_count)),
            worker_count,
        };

        for worker in 0..worker_count {
            let shared = Arc::clone(&executor.shared);
            let spawned = thread::Builder::new()
                .name(format!("decode-{worker}"))
                .spawn(move || worker_loop(&shared, worker));
            match spawned {
                Ok(handle) => executor.workers.lock().push(handle),
                Err(e) => {
                    // Workers never started must not be counted as live.
                    executor.shared.state.lock().live_workers -= worker_count - worker;
                    let _ = executor.shutdown();
                    return Err(ExecutorError::Spawn(e.to_string()));
                }
            }
        }
        info!(workers = worker_count, "decode executor started");
        Ok((executor, guard))
    }

    /// Submit handle for producers.
    pub fn queue(&self) -> DecodeQueue {
        DecodeQueue {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Take an additional keep-alive guard.
    pub fn work_guard(&self) -> WorkGuard {
        WorkGuard::acquire(&self.shared)
    }

    /// Configured number of workers.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Workers that have not exited.
    pub fn live_workers(&self) -> usize {
        self.shared.state.lock().live_workers
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }

    /// Refuse new work, discard queued jobs, and join every worker.
    ///
    /// Jobs already running finish first. Idempotent: later calls report
    /// nothing discarded and nothing joined.
    pub fn shutdown(&self) -> ShutdownReport {
        let dropped: Vec<Job> = {
            let mut state = self.shared.state.lock();
            state.accepting = false;
            record_depth(0);
            state.jobs.drain(..).collect()
        };
        let _ = self.shared.work.notify_all();

        let discarded = dropped.len();
        // Dropped outside the lock: a job's destructor may touch its session.
        drop(dropped);
        if discarded > 0 {
            counter!("tasks_discarded_total").increment(discarded as u64);
        }

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        let mut workers_joined = 0;
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_ok() {
                workers_joined += 1;
            }
        }

        if discarded > 0 || workers_joined > 0 {
            info!(discarded, workers_joined, "decode executor shut down");
        }
        ShutdownReport {
            discarded,
            workers_joined,
        }
    }
}

impl Drop for DecodeExecutor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use assert_matches::assert_matches;

    use super::*;

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn zero_workers_rejected() {
        assert_matches!(DecodeExecutor::start(0), Err(ExecutorError::Spawn(_)));
    }

    #[test]
    fn runs_submitted_jobs() {
        let (executor, _guard) = DecodeExecutor::start(2).unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            executor
                .queue()
                .submit(Box::new(move || tx.send(i).unwrap()))
                .unwrap();
        }
        let mut got: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_unstable();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn exactly_worker_count_threads_run_jobs() {
        let (executor, _guard) = DecodeExecutor::start(3).unwrap();
        let names = Arc::new(Mutex::new(HashSet::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..30 {
            let names = Arc::clone(&names);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let tx = tx.clone();
            executor
                .queue()
                .submit(Box::new(move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    let _ = peak.fetch_max(now, Ordering::SeqCst);
                    let _ = names
                        .lock()
                        .insert(thread::current().name().unwrap_or_default().to_string());
                    thread::sleep(Duration::from_millis(5));
                    let _ = in_flight.fetch_sub(1, Ordering::SeqCst);
                    tx.send(()).unwrap();
                }))
                .unwrap();
        }
        for _ in 0..30 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let names = names.lock();
        assert!(names.len() <= 3);
        assert!(names.iter().all(|n| n.starts_with("decode-")));
        assert_eq!(executor.live_workers(), 3);
    }

    #[test]
    fn fifo_order_with_single_worker() {
        let (executor, _guard) = DecodeExecutor::start(1).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::channel();
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            let tx = tx.clone();
            executor
                .queue()
                .submit(Box::new(move || {
                    seen.lock().push(i);
                    tx.send(()).unwrap();
                }))
                .unwrap();
        }
        for _ in 0..20 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*seen.lock(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn workers_exit_without_guard() {
        let (executor, guard) = DecodeExecutor::start(2).unwrap();
        assert_eq!(executor.live_workers(), 2);
        drop(guard);
        assert!(wait_until(|| executor.live_workers() == 0));
        assert_matches!(
            executor.queue().submit(Box::new(|| {})),
            Err(ExecutorError::ShutdownRejected)
        );
    }

    #[test]
    fn extra_guard_keeps_workers_alive() {
        let (executor, guard) = DecodeExecutor::start(2).unwrap();
        let extra = executor.work_guard();
        drop(guard);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(executor.live_workers(), 2);
        drop(extra);
        assert!(wait_until(|| executor.live_workers() == 0));
    }

    #[test]
    fn queued_work_finishes_before_guardless_exit() {
        let (executor, guard) = DecodeExecutor::start(1).unwrap();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));
        let queue = executor.queue();
        queue
            .submit(Box::new(move || {
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
            }))
            .unwrap();
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            queue
                .submit(Box::new(move || {
                    let _ = ran.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        drop(guard);
        gate_tx.send(()).unwrap();
        assert!(wait_until(|| executor.live_workers() == 0));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn shutdown_discards_queue_and_joins() {
        let (executor, _guard) = DecodeExecutor::start(1).unwrap();
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let finished = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&finished);
        executor
            .queue()
            .submit(Box::new(move || {
                started_tx.send(()).unwrap();
                let _ = gate_rx.recv_timeout(Duration::from_secs(5));
                let _ = f.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        for _ in 0..4 {
            let f = Arc::clone(&finished);
            executor
                .queue()
                .submit(Box::new(move || {
                    let _ = f.fetch_add(100, Ordering::SeqCst);
                }))
                .unwrap();
        }
        assert_eq!(executor.queued(), 4);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            gate_tx.send(()).unwrap();
        });
        let report = executor.shutdown();
        releaser.join().unwrap();

        assert_eq!(report.discarded, 4);
        assert_eq!(report.workers_joined, 1);
        // The running job completed; the queued ones never ran.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(executor.live_workers(), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_submit() {
        let (executor, _guard) = DecodeExecutor::start(2).unwrap();
        let first = executor.shutdown();
        assert_eq!(first.workers_joined, 2);
        assert_eq!(executor.shutdown(), ShutdownReport::default());
        assert_matches!(
            executor.queue().submit(Box::new(|| {})),
            Err(ExecutorError::ShutdownRejected)
        );
    }

    #[test]
    fn discarded_jobs_are_dropped() {
        struct Flag(Arc<AtomicUsize>);
        impl Drop for Flag {
            fn drop(&mut self) {
                let _ = self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (executor, _guard) = DecodeExecutor::start(1).unwrap();
        let dropped = Arc::new(AtomicUsize::new(0));
        let _ = executor.shutdown();
        let flag = Flag(Arc::clone(&dropped));
        let result = executor.queue().submit(Box::new(move || drop(flag)));
        assert!(result.is_err());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        let (executor, _guard) = DecodeExecutor::start(1).unwrap();
        executor
            .queue()
            .submit(Box::new(|| panic!("bad chunk")))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        executor
            .queue()
            .submit(Box::new(move || tx.send(7).unwrap()))
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        assert_eq!(executor.live_workers(), 1);
    }

    #[test]
    fn panic_message_extracts_text() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(5_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}
