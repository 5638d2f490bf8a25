use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info};

use crate::config::schema::WorkerSettings;
use crate::error::WorkerError;

use super::executor::{Executor, JobRun};

/// Worker threads that lease from the job queue until shut down.
pub struct WorkerPool {
    result_receiver: Receiver<JobRun>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn start(executor: Arc<Executor>, settings: &WorkerSettings) -> Result<Self, WorkerError> {
        if settings.count == 0 {
            return Err(WorkerError::SpawnFailed("worker count must be > 0".to_string()));
        }
        if executor.job_types().is_empty() {
            return Err(WorkerError::NoHandlers);
        }

        let (result_sender, result_receiver) = bounded::<JobRun>(settings.count * 64);
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll_interval = settings.poll_interval();
        // Reap about once per lease period, and never less than once a minute.
        let reap_interval = (settings.lease_timeout() / 2).min(Duration::from_secs(60));

        let mut workers = Vec::with_capacity(settings.count);
        for index in 0..settings.count {
            let worker = Worker {
                id: format!("worker-{}-{}", std::process::id(), index),
                reaps: index == 0,
                executor: Arc::clone(&executor),
                results: result_sender.clone(),
                shutdown: Arc::clone(&shutdown),
                poll_interval,
                reap_interval,
            };
            let handle = thread::Builder::new()
                .name(format!("contractflow-worker-{}", index))
                .spawn(move || worker.run())
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", settings.count);

        Ok(Self {
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn try_recv_result(&self) -> Option<JobRun> {
        self.result_receiver.try_recv().ok()
    }

    pub fn recv_result_timeout(&self, timeout: Duration) -> Option<JobRun> {
        self.result_receiver.recv_timeout(timeout).ok()
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signals shutdown and waits for every worker to finish its current job.
    pub fn wait(self) {
        self.shutdown();
        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
        info!("All workers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

struct Worker {
    id: String,
    /// One worker also returns expired leases to the queue.
    reaps: bool,
    executor: Arc<Executor>,
    results: Sender<JobRun>,
    shutdown: Arc<AtomicBool>,
    poll_interval: Duration,
    reap_interval: Duration,
}

impl Worker {
    fn run(self) {
        debug!("Worker {} started", self.id);
        let mut last_reap = Instant::now();

        while !self.shutdown.load(Ordering::Relaxed) {
            if self.reaps && last_reap.elapsed() >= self.reap_interval {
                last_reap = Instant::now();
                match self.executor.queue().reap_expired_leases() {
                    Ok(ids) if !ids.is_empty() => {
                        info!("Returned {} jobs with expired leases", ids.len())
                    }
                    Ok(_) => {}
                    Err(e) => error!("Lease reaping failed: {}", e),
                }
            }

            match self.executor.run_next(&self.id) {
                Ok(Some(run)) => self.report(run),
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    error!("Worker {} could not lease: {}", self.id, e);
                    thread::sleep(self.poll_interval);
                }
            }
        }

        debug!("Worker {} stopped", self.id);
    }

    fn report(&self, run: JobRun) {
        match self.results.try_send(run) {
            Ok(()) => {}
            Err(TrySendError::Full(run)) => {
                debug!("Result of job {} dropped, nobody is reading", run.job_id)
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
