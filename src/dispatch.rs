//! Dispatch worker pool
//!
//! This module provides functionality for:
//! 1. Running conversion jobs on a fixed set of worker threads, off the watch loop
//! 2. Bounding the job queue, rejecting or blocking submissions once it is full
//! 3. Installing each job's conversion context on the worker and clearing it afterwards
//! 4. Catching every job failure (errors and panics) at the job boundary
//! 5. Publishing one report per job for whoever monitors outcomes

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use flume::{Receiver, Sender, TrySendError};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{AppConfig, SubmitPolicy};
use crate::context::{self, ContextResult, ContextScope, ContextTemplate, ConversionContext};
use crate::engine::ConversionLauncher;
use crate::logger::{log_job, OperationStatus};

/// Error types for job submission
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Job queue is full ({0} jobs waiting)")]
    QueueFull(usize),

    #[error("Dispatch pool is shut down")]
    Closed,

    #[error("Failed to start worker thread: {0}")]
    Spawn(String),
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Convert one newly detected file.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id: Uuid,
    pub source: PathBuf,
    pub context: ConversionContext,
    pub detected_at: DateTime<Utc>,
}

impl ConversionJob {
    pub fn new(source: impl Into<PathBuf>, context: ConversionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            context,
            detected_at: Utc::now(),
        }
    }

    pub fn destination_format(&self) -> ContextResult<&str> {
        self.context.destination_format()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Completed(Vec<PathBuf>),
    Failed(String),
    Rejected(String),
}

/// Outcome of one dispatched job
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub source: PathBuf,
    pub status: JobStatus,
    pub worker: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        matches!(self.status, JobStatus::Completed(_))
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub submit_policy: SubmitPolicy,
    pub report_capacity: usize,
}

impl PoolSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            workers: config.worker_count(),
            queue_capacity: config.queue_capacity,
            submit_policy: config.submit_policy,
            report_capacity: config.queue_capacity.max(256),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    completed: AtomicUsize,
    failed: AtomicUsize,
    rejected: AtomicUsize,
}

/// Snapshot of the pool's activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub workers: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub rejected: usize,
}

/// Fixed-size pool of conversion workers fed by a bounded queue
pub struct DispatchPool {
    job_tx: Sender<ConversionJob>,
    report_tx: Sender<JobReport>,
    report_rx: Receiver<JobReport>,
    workers: Vec<JoinHandle<()>>,
    policy: SubmitPolicy,
    counters: Arc<Counters>,
}

impl DispatchPool {
    /// Start `settings.workers` threads. Each binds `template` as its
    /// thread's context template before taking jobs.
    pub fn new(
        settings: PoolSettings,
        launcher: Arc<dyn ConversionLauncher>,
        template: Arc<ContextTemplate>,
    ) -> DispatchResult<Self> {
        let (job_tx, job_rx) = flume::bounded(settings.queue_capacity.max(1));
        let (report_tx, report_rx) = flume::bounded(settings.report_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker_count = settings.workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker = Worker {
                name: format!("convert-worker-{}", index),
                jobs: job_rx.clone(),
                reports: report_tx.clone(),
                launcher: launcher.clone(),
                template: template.clone(),
                counters: counters.clone(),
            };
            let handle = thread::Builder::new()
                .name(worker.name.clone())
                .spawn(move || worker.run())
                .map_err(|e| DispatchError::Spawn(e.to_string()))?;
            workers.push(handle);
        }

        info!(
            workers = worker_count,
            queue_capacity = settings.queue_capacity,
            policy = ?settings.submit_policy,
            "Dispatch pool started"
        );

        Ok(Self {
            job_tx,
            report_tx,
            report_rx,
            workers,
            policy: settings.submit_policy,
            counters,
        })
    }

    /// Queue a job. Never blocks under [`SubmitPolicy::Reject`].
    pub fn submit(&self, job: ConversionJob) -> DispatchResult<()> {
        match self.policy {
            SubmitPolicy::Reject => match self.job_tx.try_send(job) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(job)) => {
                    let waiting = self.job_tx.len();
                    self.reject(job, format!("queue full with {} jobs waiting", waiting));
                    Err(DispatchError::QueueFull(waiting))
                }
                Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
            },
            SubmitPolicy::Block => self.job_tx.send(job).map_err(|_| DispatchError::Closed),
        }
    }

    fn reject(&self, job: ConversionJob, reason: String) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        log_job(job.id, &job.source, OperationStatus::Rejected, Some(&reason));
        let now = Utc::now();
        publish(
            &self.report_tx,
            JobReport {
                job_id: job.id,
                source: job.source,
                status: JobStatus::Rejected(reason),
                worker: None,
                started_at: now,
                finished_at: now,
            },
        );
    }

    /// Receiver of job reports. Reports are dropped while nobody drains it.
    pub fn reports(&self) -> Receiver<JobReport> {
        self.report_rx.clone()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            workers: self.workers.len(),
            queued: self.job_tx.len(),
            active: self.counters.active.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs. Queued and running jobs still finish; this does
    /// not wait for them.
    pub fn shutdown(self) -> PoolShutdown {
        let queued = self.job_tx.len();
        info!(queued, "Dispatch pool shutting down");
        drop(self.job_tx);
        PoolShutdown {
            workers: self.workers,
            reports: self.report_rx,
        }
    }
}

/// A closed pool whose workers may still be finishing jobs
pub struct PoolShutdown {
    workers: Vec<JoinHandle<()>>,
    reports: Receiver<JobReport>,
}

impl PoolShutdown {
    pub fn reports(&self) -> Receiver<JobReport> {
        self.reports.clone()
    }

    /// Wait for every worker to drain the queue and exit.
    pub fn join(self) {
        for handle in self.workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!(worker = %name, "Worker thread terminated abnormally");
            }
        }
        debug!("All dispatch workers stopped");
    }
}

struct Worker {
    name: String,
    jobs: Receiver<ConversionJob>,
    reports: Sender<JobReport>,
    launcher: Arc<dyn ConversionLauncher>,
    template: Arc<ContextTemplate>,
    counters: Arc<Counters>,
}

impl Worker {
    fn run(self) {
        context::bind_template(self.template.clone());
        debug!(worker = %self.name, "Worker started");

        while let Ok(job) = self.jobs.recv() {
            self.counters.active.fetch_add(1, Ordering::Relaxed);
            let report = self.execute(job);
            self.counters.active.fetch_sub(1, Ordering::Relaxed);
            if report.is_success() {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            publish(&self.reports, report);
        }

        debug!(worker = %self.name, "Worker stopped");
    }

    fn execute(&self, job: ConversionJob) -> JobReport {
        let span = info_span!("conversion_job", job_id = %job.id, worker = %self.name);
        let _enter = span.enter();

        let started_at = Utc::now();
        log_job(job.id, &job.source, OperationStatus::Started, None);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let _scope = ContextScope::enter(job.context.clone());
            self.launcher.launch(&job)
        }));

        let status = match outcome {
            Ok(Ok(outputs)) => {
                let details = describe_outputs(&outputs);
                log_job(job.id, &job.source, OperationStatus::Completed, Some(&details));
                JobStatus::Completed(outputs)
            }
            Ok(Err(e)) => {
                let message = e.to_string();
                log_job(job.id, &job.source, OperationStatus::Failed, Some(&message));
                JobStatus::Failed(message)
            }
            Err(payload) => {
                let message = format!("conversion panicked: {}", panic_message(payload.as_ref()));
                log_job(job.id, &job.source, OperationStatus::Failed, Some(&message));
                JobStatus::Failed(message)
            }
        };

        JobReport {
            job_id: job.id,
            source: job.source,
            status,
            worker: Some(self.name.clone()),
            started_at,
            finished_at: Utc::now(),
        }
    }
}

fn publish(reports: &Sender<JobReport>, report: JobReport) {
    if let Err(e) = reports.try_send(report) {
        let report = e.into_inner();
        debug!(job_id = %report.job_id, "Report channel full, dropping job report");
    }
}

fn describe_outputs(outputs: &[PathBuf]) -> String {
    outputs
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A job source as shown in logs and the CLI
pub fn display_source(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
