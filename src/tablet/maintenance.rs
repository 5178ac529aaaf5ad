// Copyright 2024 Rutile Project Authors. Licensed under Apache-2.0.

//! Background maintenance.
//!
//! The tablet registers cost/benefit-scored operations (MemRowSet flush,
//! rowset compaction, delta maintenance) with a [`MaintenanceManager`],
//! which polls their stats from a background thread and performs the most
//! valuable runnable one. Each op carries a monitored task state with
//! optional start and completion times.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::{TabletError, TabletResult};

/// Observable state of one maintenance task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Preparing,
    Running,
    Complete,
    Failed,
    Aborted,
}

/// Cost/benefit stats one op reports to the scheduler.
#[derive(Clone, Copy, Debug, Default)]
pub struct MaintenanceOpStats {
    pub mem_bytes_recovered: u64,
    pub disk_space_recovered: u64,
    pub io_performed: u64,
    pub runnable: bool,
}

/// A schedulable background operation.
pub trait MaintenanceOp: Send + Sync {
    fn name(&self) -> String;

    fn update_stats(&self, stats: &mut MaintenanceOpStats);

    fn perform(&self) -> TabletResult<()>;

    fn state(&self) -> TaskState;

    /// May be unset if the op never ran.
    fn start_timestamp(&self) -> Option<SystemTime>;

    /// May be unset while the op is running.
    fn completion_timestamp(&self) -> Option<SystemTime>;
}

/// State-tracking helper embedded by op implementations.
#[derive(Default)]
pub struct TaskTracker {
    state: Mutex<TrackerInner>,
}

struct TrackerInner {
    state: TaskState,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
}

impl Default for TrackerInner {
    fn default() -> Self {
        Self {
            state: TaskState::Preparing,
            started_at: None,
            completed_at: None,
        }
    }
}

impl TaskTracker {
    pub fn run(&self, f: impl FnOnce() -> TabletResult<()>) -> TabletResult<()> {
        {
            let mut inner = self.state.lock();
            inner.state = TaskState::Running;
            inner.started_at = Some(SystemTime::now());
            inner.completed_at = None;
        }
        let result = f();
        let mut inner = self.state.lock();
        inner.state = match &result {
            Ok(()) => TaskState::Complete,
            Err(e) if matches!(e.error(), TabletError::Aborted(_)) => TaskState::Aborted,
            Err(_) => TaskState::Failed,
        };
        inner.completed_at = Some(SystemTime::now());
        result
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().state
    }

    pub fn start_timestamp(&self) -> Option<SystemTime> {
        self.state.lock().started_at
    }

    pub fn completion_timestamp(&self) -> Option<SystemTime> {
        self.state.lock().completed_at
    }
}

/// Polls registered ops from a background thread and performs the most
/// valuable runnable one per tick.
pub struct MaintenanceManager {
    ops: Mutex<Vec<Arc<dyn MaintenanceOp>>>,
    poll_interval: Duration,
    stop: Mutex<Option<(Sender<()>, std::thread::JoinHandle<()>)>>,
}

impl MaintenanceManager {
    pub fn new(poll_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            ops: Mutex::new(Vec::new()),
            poll_interval,
            stop: Mutex::new(None),
        })
    }

    pub fn register_op(&self, op: Arc<dyn MaintenanceOp>) {
        debug!("registering maintenance op {}", op.name());
        self.ops.lock().push(op);
    }

    pub fn unregister_ops(&self, ops: &[Arc<dyn MaintenanceOp>]) {
        self.ops
            .lock()
            .retain(|existing| !ops.iter().any(|op| Arc::ptr_eq(op, existing)));
    }

    pub fn num_ops(&self) -> usize {
        self.ops.lock().len()
    }

    /// Run one scheduling pass: score every registered op and perform the
    /// best runnable one.
    pub fn tick(&self) {
        let ops = self.ops.lock().clone();
        let mut best: Option<(u64, Arc<dyn MaintenanceOp>)> = None;
        for op in ops {
            let mut stats = MaintenanceOpStats::default();
            op.update_stats(&mut stats);
            if !stats.runnable {
                continue;
            }
            let score = stats.mem_bytes_recovered + stats.disk_space_recovered;
            if best.as_ref().is_none_or(|(b, _)| score > *b) {
                best = Some((score, op));
            }
        }
        if let Some((score, op)) = best {
            info!("maintenance: running {} (score {})", op.name(), score);
            if let Err(e) = op.perform() {
                warn!("maintenance op {} failed: {}", op.name(), e);
            }
        }
    }

    pub fn start(self: &Arc<Self>) {
        let (tx, rx): (Sender<()>, Receiver<()>) = bounded(1);
        let manager = self.clone();
        let handle = std::thread::Builder::new()
            .name("maintenance".into())
            .spawn(move || loop {
                match rx.recv_timeout(manager.poll_interval) {
                    Err(RecvTimeoutError::Timeout) => manager.tick(),
                    _ => break,
                }
            })
            .expect("failed to spawn maintenance thread");
        *self.stop.lock() = Some((tx, handle));
    }

    pub fn shutdown(&self) {
        if let Some((tx, handle)) = self.stop.lock().take() {
            info!("shutting down maintenance manager");
            let _ = tx.send(());
            let _ = handle.join();
        }
    }
}

impl Drop for MaintenanceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingOp {
        score: u64,
        performed: AtomicUsize,
        tracker: TaskTracker,
    }

    impl CountingOp {
        fn new(score: u64) -> Arc<Self> {
            Arc::new(Self {
                score,
                performed: AtomicUsize::new(0),
                tracker: TaskTracker::default(),
            })
        }
    }

    impl MaintenanceOp for CountingOp {
        fn name(&self) -> String {
            format!("CountingOp({})", self.score)
        }
        fn update_stats(&self, stats: &mut MaintenanceOpStats) {
            stats.runnable = true;
            stats.mem_bytes_recovered = self.score;
        }
        fn perform(&self) -> TabletResult<()> {
            self.tracker.run(|| {
                self.performed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        }
        fn state(&self) -> TaskState {
            self.tracker.state()
        }
        fn start_timestamp(&self) -> Option<SystemTime> {
            self.tracker.start_timestamp()
        }
        fn completion_timestamp(&self) -> Option<SystemTime> {
            self.tracker.completion_timestamp()
        }
    }

    #[test]
    fn test_tick_runs_best_op() {
        let manager = MaintenanceManager::new(Duration::from_secs(60));
        let small = CountingOp::new(10);
        let big = CountingOp::new(100);
        manager.register_op(small.clone());
        manager.register_op(big.clone());
        manager.tick();
        assert_eq!(small.performed.load(Ordering::SeqCst), 0);
        assert_eq!(big.performed.load(Ordering::SeqCst), 1);
        assert_eq!(big.state(), TaskState::Complete);
        assert!(big.start_timestamp().is_some());
        assert!(big.completion_timestamp().is_some());
        assert_eq!(small.state(), TaskState::Preparing);
        assert!(small.start_timestamp().is_none());

        manager.unregister_ops(&[big as Arc<dyn MaintenanceOp>]);
        assert_eq!(manager.num_ops(), 1);
    }
}
