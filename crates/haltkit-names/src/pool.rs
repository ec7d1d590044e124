use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use haltkit_contracts::{HandleRecord, NameResolver, ResolveError};
use tracing::{debug, trace};

use crate::worker::{HelperProcessWorker, WorkerOptions, WorkerState};

pub const DEFAULT_POOL_SIZE: usize = 2;
pub const DEFAULT_RESCAN_INTERVAL: Duration = Duration::from_millis(200);

/// Signalled whenever a worker finishes a request, starts or stops.
pub(crate) struct Availability {
    epoch: Mutex<u64>,
    cond: Condvar,
}

impl Availability {
    fn new() -> Self {
        Availability {
            epoch: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        *epoch = epoch.wrapping_add(1);
        self.cond.notify_all();
    }

    fn epoch(&self) -> u64 {
        *self.epoch.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Waits until something changed since `seen`, or `timeout` passed.
    fn wait_since(&self, seen: u64, timeout: Duration) {
        let epoch = self.epoch.lock().unwrap_or_else(|e| e.into_inner());
        let _ = self
            .cond
            .wait_timeout_while(epoch, timeout, |epoch| *epoch == seen);
    }
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub worker: WorkerOptions,
    /// Upper bound between scans while every worker is busy.
    pub rescan_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            worker: WorkerOptions::default(),
            rescan_interval: DEFAULT_RESCAN_INTERVAL,
        }
    }
}

/// Fixed set of helper workers; each request goes to the first free one.
///
/// There is no queue and no fairness: callers that find every worker busy
/// wait for the next availability signal and scan again, until the lookup's
/// own deadline runs out. Stopped workers are restarted in the background,
/// at most once per rescan interval each.
pub struct WorkerPool {
    workers: Vec<HelperProcessWorker>,
    availability: Arc<Availability>,
    rescan_interval: Duration,
    waits: AtomicU64,
}

impl WorkerPool {
    pub fn new(helper: impl Into<PathBuf>, size: usize, options: PoolOptions) -> Self {
        let helper = helper.into();
        let availability = Arc::new(Availability::new());
        let workers = (0..size.max(1))
            .map(|id| {
                HelperProcessWorker::pooled(
                    id,
                    helper.clone(),
                    options.worker.clone(),
                    Arc::clone(&availability),
                )
            })
            .collect();
        WorkerPool {
            workers,
            availability,
            rescan_interval: options.rescan_interval,
            waits: AtomicU64::new(0),
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> &[HelperProcessWorker] {
        &self.workers
    }

    /// How many times a caller found no free worker and had to wait.
    pub fn availability_waits(&self) -> u64 {
        self.waits.load(Ordering::Relaxed)
    }

    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

impl NameResolver for WorkerPool {
    /// Stops every worker, then starts them all in parallel and waits for
    /// every handshake. The first failure is returned.
    fn start(&self) -> Result<(), ResolveError> {
        self.stop();
        let results: Vec<Result<(), ResolveError>> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .workers
                .iter()
                .map(|worker| scope.spawn(move || worker.start()))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join().unwrap_or_else(|_| {
                        Err(ResolveError::TransportFailure(
                            "worker start panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });
        debug!(workers = self.workers.len(), "worker pool started");
        results.into_iter().collect()
    }

    fn get_name(
        &self,
        record: &HandleRecord,
        timeout: Duration,
    ) -> Result<Option<String>, ResolveError> {
        // Time spent waiting for a free worker counts against the lookup.
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.availability.epoch();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                trace!("no helper worker freed up before the deadline");
                return Ok(None);
            }
            for worker in &self.workers {
                if worker.state() == WorkerState::Stopped {
                    worker.restart_in_background(self.rescan_interval);
                }
            }
            for worker in &self.workers {
                let Some(claim) = worker.try_claim() else {
                    continue;
                };
                let result = worker.request(claim, record, remaining);
                if worker.state() == WorkerState::Stopped {
                    worker.restart_in_background(self.rescan_interval);
                }
                return result;
            }

            if self
                .workers
                .iter()
                .all(|w| w.state() == WorkerState::Stopped)
            {
                trace!("no live helper worker, giving up on lookup");
                return Ok(None);
            }
            self.waits.fetch_add(1, Ordering::Relaxed);
            self.availability
                .wait_since(seen, self.rescan_interval.min(remaining));
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_wakes_a_waiter() {
        let availability = Arc::new(Availability::new());
        let seen = availability.epoch();
        let signal = Arc::clone(&availability);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signal.notify();
        });
        let started = Instant::now();
        availability.wait_since(seen, Duration::from_secs(5));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_ne!(availability.epoch(), seen);
        t.join().unwrap();
    }

    #[test]
    fn pool_without_live_workers_answers_none() {
        let pool = WorkerPool::new("/nonexistent/helper", 3, PoolOptions::default());
        assert_eq!(pool.size(), 3);
        let started = Instant::now();
        let got = pool
            .get_name(&HandleRecord::new(1, 4), Duration::from_millis(50))
            .unwrap();
        assert_eq!(got, None);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(pool
            .workers()
            .iter()
            .all(|w| w.state() != WorkerState::Ready));
    }

    #[test]
    fn start_reports_spawn_failure() {
        let pool = WorkerPool::new("/nonexistent/helper", 2, PoolOptions::default());
        let err = pool.start().unwrap_err();
        assert!(matches!(err, ResolveError::TransportFailure(_)), "{err}");
        assert!(pool
            .workers()
            .iter()
            .all(|w| w.state() == WorkerState::Stopped));
    }
}
