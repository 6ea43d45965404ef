//! Bounded worker pool.
//!
//! ```text
//!   tasks ──validate──► [Poll(0), Poll(1), ..., Poll(n), Stop × threads]
//!                                   │  shared queue
//!                     ┌─────────────┼─────────────┐
//!                 poller-0      poller-1   ...  poller-k      (k = min(threads, n))
//!                     └─────────────┼─────────────┘
//!                                   ▼
//!                        reports (in task order)
//! ```
//!
//! Every task is validated before the first thread starts. A pool thread takes
//! one job at a time and exits when it meets a `Stop` sentinel, so at most
//! `threads` sessions are open at once. A continuous task keeps its thread
//! until cancelled; queued tasks wait for a free slot.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use tracing::{debug, error, info};

use crate::worker::{PollContext, PollWorker, WorkerReport, WorkerState};
use crate::task::{DeviceTask, TaskError};

enum Job {
    Poll(usize, Box<PollWorker>),
    Stop,
}

/// Runs one [`PollWorker`] per task on a fixed number of threads.
#[derive(Debug)]
pub struct WorkerPool {
    context: PollContext,
    threads: usize,
}

impl WorkerPool {
    pub fn new(context: PollContext, threads: usize) -> Self {
        Self {
            context,
            threads: threads.max(1),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Validates all tasks, then runs them to completion.
    ///
    /// Returns one report per task, in task order. Device failures show up in
    /// the reports; only invalid tasks produce an error, and then nothing runs.
    pub fn run(&self, tasks: Vec<DeviceTask>) -> Result<Vec<WorkerReport>, TaskError> {
        let workers = tasks
            .into_iter()
            .map(|task| self.context.worker(task))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.run_workers(workers))
    }

    fn run_workers(&self, workers: Vec<PollWorker>) -> Vec<WorkerReport> {
        if workers.is_empty() {
            return Vec::new();
        }

        let hostnames: Vec<String> = workers
            .iter()
            .map(|w| w.task().hostname().to_string())
            .collect();
        let threads = self.threads.min(workers.len());
        info!("Polling {} devices on {} threads", workers.len(), threads);

        let (job_tx, job_rx) = mpsc::channel();
        for (idx, worker) in workers.into_iter().enumerate() {
            let _ = job_tx.send(Job::Poll(idx, Box::new(worker)));
        }
        for _ in 0..threads {
            let _ = job_tx.send(Job::Stop);
        }
        drop(job_tx);

        let jobs = Arc::new(Mutex::new(job_rx));
        let (report_tx, report_rx) = mpsc::channel();

        let mut handles = Vec::with_capacity(threads);
        for n in 0..threads {
            let jobs = Arc::clone(&jobs);
            let reports = report_tx.clone();
            match thread::Builder::new()
                .name(format!("poller-{}", n))
                .spawn(move || pool_thread(jobs, reports))
            {
                Ok(handle) => handles.push(handle),
                Err(e) => error!("Failed to spawn pool thread {}: {}", n, e),
            }
        }
        drop(report_tx);

        let mut slots: Vec<Option<WorkerReport>> = vec![None; hostnames.len()];
        for (idx, report) in report_rx {
            slots[idx] = Some(report);
        }

        for handle in handles {
            if handle.join().is_err() {
                error!("Pool thread panicked");
            }
        }

        slots
            .into_iter()
            .zip(hostnames)
            .map(|(slot, hostname)| {
                slot.unwrap_or_else(|| WorkerReport {
                    hostname,
                    state: WorkerState::Failed,
                    cycles: 0,
                    points: 0,
                    last_error: Some("worker did not report".to_string()),
                })
            })
            .collect()
    }
}

fn pool_thread(jobs: Arc<Mutex<Receiver<Job>>>, reports: Sender<(usize, WorkerReport)>) {
    loop {
        let job = jobs.lock().unwrap_or_else(PoisonError::into_inner).recv();
        match job {
            Ok(Job::Poll(idx, worker)) => {
                let report = worker.run();
                if reports.send((idx, report)).is_err() {
                    break;
                }
            }
            Ok(Job::Stop) | Err(_) => {
                debug!("Pool thread stopping");
                break;
            }
        }
    }
}
