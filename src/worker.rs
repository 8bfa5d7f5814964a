//! Periodic background workers.
//!
//! Each [`Worker`] owns one thread that sleeps in small ticks until its
//! period has accumulated, then runs its task. The running flag is checked
//! on every tick, so `stop` returns within about one tick no matter how long
//! the period is. The period is read at the start of each accumulation
//! cycle; `set_period` never cuts a wait short.
//!
//! A task that returns an error or panics is logged and scheduled again.
//!
//! ```
//! use std::time::Duration;
//! use kpa_gateway::worker::Scheduler;
//!
//! let scheduler = Scheduler::new();
//! let worker = scheduler.add_worker("heartbeat", Duration::from_millis(100), || Ok(()));
//! worker.start().unwrap();
//! assert!(worker.is_running());
//! scheduler.stop_all();
//! assert!(!worker.is_running());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::sync::{join_bounded, lock};

/// Error type a task may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one task run.
pub type TaskResult = std::result::Result<(), BoxError>;

/// Default sleep increment.
pub const DEFAULT_TICK: Duration = Duration::from_millis(5);

/// Default wait in `stop` before the thread is detached.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_millis(200);

type Task = Box<dyn FnMut() -> TaskResult + Send>;

struct Inner {
    name: String,
    period: Mutex<Duration>,
    tick: Duration,
    running: AtomicBool,
    /// Bumped on every start; a detached thread from an older run exits
    /// instead of running the task again.
    generation: AtomicU64,
    runs: AtomicU64,
    /// Held while the task runs, so a worker never overlaps with itself.
    task: Mutex<Task>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    fn execute(&self) {
        let mut guard = lock(&self.task);
        let task = &mut *guard;

        match panic::catch_unwind(AssertUnwindSafe(|| task())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("worker {} task failed: {}", self.name, e),
            Err(_) => tracing::error!("worker {} task panicked", self.name),
        }
        self.runs.fetch_add(1, Ordering::Relaxed);
    }

    fn run(&self, generation: u64) {
        tracing::debug!("worker {} started", self.name);

        'cycle: while self.is_current(generation) {
            // A zero period still waits one tick so the loop cannot spin.
            let period = (*lock(&self.period)).max(self.tick);
            let mut waited = Duration::ZERO;

            while waited < period {
                if !self.is_current(generation) {
                    break 'cycle;
                }
                let step = self.tick.min(period - waited);
                thread::sleep(step);
                waited += step;
            }

            if !self.is_current(generation) {
                break;
            }
            self.execute();
        }

        tracing::debug!("worker {} stopped", self.name);
    }
}

/// A named task run on its own thread every `period`.
pub struct Worker {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    join_timeout: Duration,
}

impl Worker {
    /// Create a stopped worker with the default tick.
    pub fn new<F>(name: impl Into<String>, period: Duration, task: F) -> Self
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        Self::with_tick(name, period, DEFAULT_TICK, task)
    }

    /// Create a stopped worker that sleeps in increments of `tick`.
    pub fn with_tick<F>(name: impl Into<String>, period: Duration, tick: Duration, task: F) -> Self
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                period: Mutex::new(period),
                tick: tick.max(Duration::from_millis(1)),
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                runs: AtomicU64::new(0),
                task: Mutex::new(Box::new(task)),
            }),
            thread: Mutex::new(None),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }

    /// How long `stop` waits for a task in progress before detaching the
    /// thread.
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn period(&self) -> Duration {
        *lock(&self.inner.period)
    }

    /// Change the period. Takes effect from the next accumulation cycle.
    pub fn set_period(&self, period: Duration) {
        *lock(&self.inner.period) = period;
        tracing::debug!("worker {} period set to {:?}", self.inner.name, period);
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Number of completed task runs, including failed ones.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Spawn the worker thread. No-op if already running.
    pub fn start(&self) -> Result<()> {
        let mut thread_slot = lock(&self.thread);
        if self.is_running() {
            tracing::debug!("worker {} already running", self.inner.name);
            return Ok(());
        }

        if let Some(previous) = thread_slot.take() {
            if previous.is_finished() && previous.join().is_err() {
                tracing::error!("worker {} thread panicked", self.inner.name);
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.running.store(true, Ordering::Release);

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("worker-{}", self.inner.name))
            .spawn(move || inner.run(generation));

        match spawned {
            Ok(handle) => {
                *thread_slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::Release);
                tracing::error!("failed to spawn worker {}: {}", self.inner.name, e);
                Err(e.into())
            }
        }
    }

    /// Stop the worker and wait briefly for its thread. No-op if stopped.
    ///
    /// May be called from inside the task; the thread then exits after the
    /// current run instead of being joined.
    pub fn stop(&self) {
        let handle = {
            let mut thread_slot = lock(&self.thread);
            if !self.inner.running.swap(false, Ordering::AcqRel) {
                return;
            }
            thread_slot.take()
        };

        if let Some(handle) = handle {
            join_bounded(handle, self.join_timeout);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.inner.name)
            .field("period", &self.period())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// Named collection of workers.
pub struct Scheduler {
    workers: Mutex<BTreeMap<String, Arc<Worker>>>,
    tick: Duration,
    join_timeout: Duration,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_tick(DEFAULT_TICK)
    }

    /// Workers created through this scheduler sleep in increments of `tick`.
    pub fn with_tick(tick: Duration) -> Self {
        Self::with_timing(tick, DEFAULT_JOIN_TIMEOUT)
    }

    /// Like [`with_tick`](Self::with_tick), and `stop` waits up to
    /// `join_timeout` for each worker created here.
    pub fn with_timing(tick: Duration, join_timeout: Duration) -> Self {
        Self {
            workers: Mutex::new(BTreeMap::new()),
            tick,
            join_timeout,
        }
    }

    /// Create and register a stopped worker.
    ///
    /// A worker already registered under `name` is stopped and replaced.
    pub fn add_worker<F>(&self, name: impl Into<String>, period: Duration, task: F) -> Arc<Worker>
    where
        F: FnMut() -> TaskResult + Send + 'static,
    {
        self.insert(Worker::with_tick(name, period, self.tick, task).with_join_timeout(self.join_timeout))
    }

    /// Register an existing worker, replacing one with the same name.
    pub fn insert(&self, worker: Worker) -> Arc<Worker> {
        let worker = Arc::new(worker);
        let previous = lock(&self.workers).insert(worker.name().to_owned(), Arc::clone(&worker));
        if let Some(previous) = previous {
            tracing::warn!("worker {} replaced", previous.name());
            previous.stop();
        }
        worker
    }

    pub fn get_worker(&self, name: &str) -> Option<Arc<Worker>> {
        lock(&self.workers).get(name).cloned()
    }

    /// Unregister and stop a worker.
    pub fn remove_worker(&self, name: &str) -> Option<Arc<Worker>> {
        let worker = lock(&self.workers).remove(name)?;
        worker.stop();
        Some(worker)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        lock(&self.workers).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.workers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start every registered worker. Stops at the first spawn failure.
    pub fn start_all(&self) -> Result<()> {
        for worker in self.snapshot() {
            worker.start()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for worker in self.snapshot() {
            worker.stop();
        }
    }

    // Workers are started and stopped outside the map lock so a task may
    // look up other workers.
    fn snapshot(&self) -> Vec<Arc<Worker>> {
        lock(&self.workers).values().cloned().collect()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn counting(period: Duration) -> (Worker, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let worker = Worker::new("counter", period, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (worker, calls)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_period_accuracy() {
        let (worker, calls) = counting(Duration::from_millis(100));

        worker.start().unwrap();
        thread::sleep(Duration::from_millis(350));
        worker.stop();

        let n = calls.load(Ordering::SeqCst);
        assert!((2..=4).contains(&n), "expected 3±1 calls, got {}", n);
    }

    #[test]
    fn test_stop_is_prompt() {
        let (worker, calls) = counting(Duration::from_secs(60));
        worker.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        worker.stop();

        assert!(started.elapsed() < Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_start_stop_idempotent() {
        let (worker, calls) = counting(Duration::from_millis(20));

        worker.start().unwrap();
        worker.start().unwrap();
        assert!(worker.is_running());
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 2));

        worker.stop();
        worker.stop();
        assert!(!worker.is_running());

        let after = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(calls.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_restart() {
        let (worker, calls) = counting(Duration::from_millis(10));
        worker.start().unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 1));
        worker.stop();

        let before = calls.load(Ordering::SeqCst);
        worker.start().unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) > before));
        worker.stop();
    }

    #[test]
    fn test_set_period_applies_next_cycle() {
        let (worker, calls) = counting(Duration::from_millis(30));
        worker.start().unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 1));

        worker.set_period(Duration::from_secs(60));
        assert_eq!(worker.period(), Duration::from_secs(60));
        let at_change = calls.load(Ordering::SeqCst);

        // The cycle in progress still uses 30ms, then the long period holds.
        thread::sleep(Duration::from_millis(200));
        assert!(calls.load(Ordering::SeqCst) <= at_change + 1);
        worker.stop();
    }

    #[test]
    fn test_failing_task_keeps_running() {
        let worker = Worker::new("failing", Duration::from_millis(5), || {
            Err("device offline".into())
        });

        worker.start().unwrap();
        assert!(wait_for(|| worker.runs() >= 3));
        assert!(worker.is_running());
        worker.stop();
    }

    #[test]
    fn test_panicking_task_keeps_running() {
        let worker = Worker::new("panicking", Duration::from_millis(5), || panic!("bad sensor"));

        worker.start().unwrap();
        assert!(wait_for(|| worker.runs() >= 3));
        worker.stop();
    }

    #[test]
    fn test_stop_from_inside_task() {
        let slot: Arc<Mutex<Option<Arc<Worker>>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let worker = Arc::new(Worker::new("once", Duration::from_millis(5), move || {
            if let Some(me) = inner_slot.lock().unwrap().as_ref() {
                me.stop();
            }
            Ok(())
        }));
        *slot.lock().unwrap() = Some(Arc::clone(&worker));

        worker.start().unwrap();
        assert!(wait_for(|| !worker.is_running()));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(worker.runs(), 1);

        slot.lock().unwrap().take();
    }

    #[test]
    fn test_stop_waits_only_join_timeout() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let scheduler = Scheduler::with_timing(DEFAULT_TICK, Duration::from_millis(30));
        let worker = scheduler.add_worker("slow", Duration::from_millis(1), move || {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(600));
            Ok(())
        });
        assert_eq!(worker.join_timeout(), Duration::from_millis(30));

        worker.start().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let started = Instant::now();
        worker.stop();
        assert!(started.elapsed() < Duration::from_millis(400));
        assert!(!worker.is_running());
    }

    #[test]
    fn test_scheduler_registry() {
        let scheduler = Scheduler::new();
        scheduler.add_worker("b", Duration::from_millis(10), || Ok(()));
        scheduler.add_worker("a", Duration::from_millis(10), || Ok(()));

        assert_eq!(scheduler.names(), vec!["a", "b"]);
        assert_eq!(scheduler.get_worker("a").unwrap().name(), "a");
        assert!(scheduler.get_worker("c").is_none());

        scheduler.start_all().unwrap();
        assert!(scheduler.get_worker("a").unwrap().is_running());
        assert!(scheduler.get_worker("b").unwrap().is_running());

        scheduler.stop_all();
        assert!(!scheduler.get_worker("a").unwrap().is_running());
        assert!(!scheduler.get_worker("b").unwrap().is_running());
    }

    #[test]
    fn test_scheduler_replace_stops_previous() {
        let scheduler = Scheduler::new();
        let first = scheduler.add_worker("telemetry", Duration::from_millis(10), || Ok(()));
        first.start().unwrap();

        let second = scheduler.add_worker("telemetry", Duration::from_millis(20), || Ok(()));

        assert!(!first.is_running());
        assert!(!second.is_running());
        assert_eq!(scheduler.len(), 1);
        assert_eq!(
            scheduler.get_worker("telemetry").unwrap().period(),
            Duration::from_millis(20)
        );
    }

    #[test]
    fn test_scheduler_remove() {
        let scheduler = Scheduler::new();
        let worker = scheduler.add_worker("w", Duration::from_millis(10), || Ok(()));
        worker.start().unwrap();

        let removed = scheduler.remove_worker("w").unwrap();
        assert!(!removed.is_running());
        assert!(scheduler.is_empty());
        assert!(scheduler.remove_worker("w").is_none());
    }
}
