//! Fixed-size worker pool.
//!
//! Workers are OS threads pulling jobs from a bounded channel. Stopping the
//! pool drops the shutdown sender, which wakes every idle worker at once;
//! jobs already running are allowed to finish.

use crate::error::ServerError;
use crate::lifecycle::{Lifecycle, LifecycleState};
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// A unit of work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    size: usize,
    capacity: usize,
    jobs_tx: Sender<Job>,
    jobs_rx: Receiver<Job>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    busy: Arc<AtomicUsize>,
    state: LifecycleState,
}

impl WorkerPool {
    /// Creates a stopped pool with `size` workers and room for `capacity`
    /// queued jobs.
    pub fn new(size: usize, capacity: usize) -> Self {
        let (jobs_tx, jobs_rx) = bounded(capacity.max(1));
        Self {
            size: size.max(1),
            capacity: capacity.max(1),
            jobs_tx,
            jobs_rx,
            shutdown_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
            busy: Arc::new(AtomicUsize::new(0)),
            state: LifecycleState::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.jobs_rx.len()
    }

    /// Workers currently running a job.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::Acquire)
    }

    /// Queues a job without blocking.
    pub fn submit(&self, job: Job) -> Result<(), ServerError> {
        if !self.state.started() {
            return Err(ServerError::ShuttingDown);
        }
        match self.jobs_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ServerError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(ServerError::ShuttingDown),
        }
    }

    fn spawn_worker(
        &self,
        index: usize,
        shutdown_rx: Receiver<()>,
    ) -> Result<JoinHandle<()>, ServerError> {
        let jobs = self.jobs_rx.clone();
        let busy = Arc::clone(&self.busy);

        let handle = std::thread::Builder::new()
            .name(format!("gamewire-worker-{index}"))
            .spawn(move || {
                loop {
                    select! {
                        recv(jobs) -> job => match job {
                            Ok(job) => {
                                busy.fetch_add(1, Ordering::AcqRel);
                                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                    error!("worker {} recovered from a panicking job", index);
                                }
                                busy.fetch_sub(1, Ordering::AcqRel);
                            }
                            Err(_) => break,
                        },
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                debug!("worker {} exiting", index);
            })?;
        Ok(handle)
    }
}

impl Lifecycle for WorkerPool {
    fn name(&self) -> &str {
        "worker pool"
    }

    fn initialize(&self) -> Result<(), ServerError> {
        self.state.mark_initialized();
        Ok(())
    }

    fn start(&self) -> Result<(), ServerError> {
        if self.state.started() {
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let mut handles = self.handles.lock();
        for index in 0..self.size {
            handles.push(self.spawn_worker(index, shutdown_rx.clone())?);
        }
        *self.shutdown_tx.lock() = Some(shutdown_tx);
        self.state.mark_started();

        info!(
            "worker pool started: {} workers, queue capacity {}",
            self.size, self.capacity
        );
        Ok(())
    }

    fn stop(&self) -> Result<(), ServerError> {
        if !self.state.mark_stopped() {
            return Ok(());
        }

        // Dropping the sender disconnects the shutdown channel for every worker
        self.shutdown_tx.lock().take();

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked during shutdown");
            }
        }

        let abandoned = self.jobs_rx.try_iter().count();
        if abandoned > 0 {
            debug!("dropped {} queued jobs on shutdown", abandoned);
        }
        Ok(())
    }

    fn initialized(&self) -> bool {
        self.state.initialized()
    }

    fn started(&self) -> bool {
        self.state.started()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let _ = Lifecycle::stop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new(2, 16);
        pool.start().unwrap();

        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            pool.submit(Box::new(move || tx.send(i).unwrap())).unwrap();
        }

        let mut seen: Vec<i32> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());

        pool.stop().unwrap();
    }

    #[test]
    fn test_submit_before_start_and_after_stop() {
        let pool = WorkerPool::new(1, 4);
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(ServerError::ShuttingDown)
        ));

        pool.start().unwrap();
        pool.stop().unwrap();
        assert!(!pool.started());
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(ServerError::ShuttingDown)
        ));
    }

    #[test]
    fn test_queue_full() {
        let pool = WorkerPool::new(1, 1);
        pool.start().unwrap();

        // Park the only worker
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        }))
        .unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        pool.submit(Box::new(|| {})).unwrap();
        assert!(matches!(
            pool.submit(Box::new(|| {})),
            Err(ServerError::QueueFull)
        ));

        release_tx.send(()).unwrap();
        pool.stop().unwrap();
    }

    #[test]
    fn test_stop_wakes_idle_workers() {
        let pool = WorkerPool::new(4, 8);
        pool.start().unwrap();
        assert_eq!(pool.handles.lock().len(), 4);

        // Returns only if every idle worker observed the shutdown
        pool.stop().unwrap();
        assert!(pool.handles.lock().is_empty());
    }

    #[test]
    fn test_stop_lets_running_job_finish() {
        let pool = WorkerPool::new(1, 4);
        pool.start().unwrap();

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        pool.submit(Box::new(move || {
            started_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(50));
            done_tx.send(()).unwrap();
        }))
        .unwrap();

        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.stop().unwrap();
        assert!(done_rx.try_recv().is_ok());
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let pool = WorkerPool::new(1, 4);
        pool.start().unwrap();

        pool.submit(Box::new(|| panic!("handler bug"))).unwrap();

        let (tx, rx) = mpsc::channel();
        pool.submit(Box::new(move || tx.send(()).unwrap())).unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());

        pool.stop().unwrap();
    }
}
