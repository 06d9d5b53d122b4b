//! The polling worker: work threads running jobs, and one thread running
//! scheduled tasks while it holds the tasks role.
//!
//! Every thread is a real OS thread. Async I/O inside a job tick is driven by
//! blocking on a shared runtime handle, so one slow delivery never holds up
//! another thread.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use courier_delivery::{
    DeliveryError, Job, ProcessQueuedMessages, ProcessWebhookRequests, WorkerContext,
    tasks::{self, ScheduledTask, TASKS_ROLE},
};
use tokio::{runtime::Handle, sync::watch};
use tracing::{debug, error, info, info_span, warn};

use crate::config::WorkerConfig;

/// Receives every error caught by the per-job and per-task guards.
pub trait ErrorReporter: Send + Sync {
    /// `source` names the job or task that failed.
    fn report(&self, source: &str, error: &anyhow::Error);
}

/// Reports errors to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, source: &str, error: &anyhow::Error) {
        error!(source, "{error:#}");
    }
}

/// Builds the jobs a work thread owns. Called once per thread with the
/// thread's name.
pub type JobFactory = Arc<dyn Fn(&WorkerContext, &str) -> Vec<Box<dyn Job>> + Send + Sync>;

/// Builds the scheduled tasks the task thread runs.
pub type TaskFactory = Arc<dyn Fn(&WorkerContext) -> Vec<Box<dyn ScheduledTask>> + Send + Sync>;

/// The jobs every work thread runs, in order. Queued messages are only
/// processed when a message store is attached.
#[must_use]
pub fn default_jobs(context: &WorkerContext, thread: &str) -> Vec<Box<dyn Job>> {
    let mut jobs: Vec<Box<dyn Job>> = Vec::new();
    if context.has_store() {
        jobs.push(Box::new(ProcessQueuedMessages::new(context.clone(), thread)));
    }
    jobs.push(Box::new(ProcessWebhookRequests::new(context.clone(), thread)));
    jobs
}

/// Sends the shutdown flag to every worker thread.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    #[must_use]
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (sender, receiver) = watch::channel(false);
        (Self(Arc::new(sender)), receiver)
    }

    /// Wakes every sleeping thread. Running ticks finish first.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

pub struct Worker {
    context: WorkerContext,
    config: WorkerConfig,
    reporter: Arc<dyn ErrorReporter>,
    jobs: JobFactory,
    tasks: TaskFactory,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("identity", &self.context.identity().to_string())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub fn new(context: WorkerContext, config: WorkerConfig) -> Self {
        Self {
            context,
            config,
            reporter: Arc::new(LogReporter),
            jobs: Arc::new(default_jobs),
            tasks: Arc::new(tasks::builtin),
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub fn with_jobs(mut self, jobs: JobFactory) -> Self {
        self.jobs = jobs;
        self
    }

    #[must_use]
    pub fn with_tasks(mut self, tasks: TaskFactory) -> Self {
        self.tasks = tasks;
        self
    }

    /// Starts the work threads (`work0`, `work1`, ...) and the `tasks`
    /// thread. They run until `shutdown` turns true.
    ///
    /// # Errors
    ///
    /// Returns an error if a thread cannot be spawned. Threads already
    /// started keep running until `shutdown` is sent.
    pub fn spawn(
        &self,
        runtime: &Handle,
        shutdown: &watch::Receiver<bool>,
    ) -> std::io::Result<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for index in 0..self.config.threads {
            let name = format!("work{index}");
            let work = WorkThread {
                jobs: (self.jobs)(&self.context, &name),
                name: name.clone(),
                runtime: runtime.clone(),
                shutdown: shutdown.clone(),
                reporter: Arc::clone(&self.reporter),
                sleep: self.config.work_sleep(),
            };
            handles.push(thread::Builder::new().name(name).spawn(move || work.run())?);
        }

        let task_thread = TaskThread {
            holder: self.context.identity().for_thread(TASKS_ROLE),
            tasks: (self.tasks)(&self.context),
            context: self.context.clone(),
            runtime: runtime.clone(),
            shutdown: shutdown.clone(),
            reporter: Arc::clone(&self.reporter),
            sleep: self.config.task_sleep(),
        };
        handles.push(
            thread::Builder::new()
                .name(TASKS_ROLE.to_string())
                .spawn(move || task_thread.run())?,
        );

        info!(threads = self.config.threads, "Worker started");
        Ok(handles)
    }
}

/// Sleeps for `duration` unless shutdown arrives first. Returns whether the
/// worker is shutting down.
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    let woken = tokio::select! {
        () = tokio::time::sleep(duration) => false,
        // A dropped sender also means shutdown.
        _ = shutdown.wait_for(|stop| *stop) => true,
    };
    woken || *shutdown.borrow()
}

fn report(reporter: &dyn ErrorReporter, source: &str, err: DeliveryError) {
    if let Some(metrics) = courier_metrics::metrics() {
        metrics.worker.record_error(err.kind());
    }
    reporter.report(source, &anyhow::Error::from(err));
}

struct WorkThread {
    name: String,
    jobs: Vec<Box<dyn Job>>,
    runtime: Handle,
    shutdown: watch::Receiver<bool>,
    reporter: Arc<dyn ErrorReporter>,
    sleep: Duration,
}

impl WorkThread {
    fn run(mut self) {
        let span = info_span!("work_thread", thread = %self.name);
        let _enter = span.enter();
        debug!("Work thread running");

        while !*self.shutdown.borrow() {
            if self.tick() {
                continue;
            }

            if self
                .runtime
                .block_on(sleep_or_shutdown(&mut self.shutdown, self.sleep))
            {
                break;
            }
        }

        debug!("Work thread stopped");
    }

    /// Runs every job once. Returns whether any job did work.
    fn tick(&mut self) -> bool {
        let mut worked = false;

        for job in &mut self.jobs {
            let started = Instant::now();
            let outcome = self.runtime.block_on(job.call());
            let elapsed = started.elapsed();

            if let Some(metrics) = courier_metrics::metrics() {
                metrics.worker.record_job_execution(&self.name, job.name());
                metrics.worker.record_job_runtime(job.name(), elapsed);
            }

            match outcome {
                Ok(did_work) => worked |= did_work,
                Err(err) => report(self.reporter.as_ref(), job.name(), err),
            }
        }

        worked
    }
}

struct TaskThread {
    holder: String,
    tasks: Vec<Box<dyn ScheduledTask>>,
    context: WorkerContext,
    runtime: Handle,
    shutdown: watch::Receiver<bool>,
    reporter: Arc<dyn ErrorReporter>,
    sleep: Duration,
}

impl TaskThread {
    fn run(mut self) {
        let span = info_span!("task_thread", holder = %self.holder);
        let _enter = span.enter();
        debug!("Task thread running");

        while !*self.shutdown.borrow() {
            self.tick();

            if self
                .runtime
                .block_on(sleep_or_shutdown(&mut self.shutdown, self.sleep))
            {
                break;
            }
        }

        match self.runtime.block_on(
            self.context
                .database()
                .worker_roles()
                .release(TASKS_ROLE, &self.holder),
        ) {
            Ok(true) => info!("Released the tasks role"),
            Ok(false) => {}
            Err(err) => warn!("Cannot release the tasks role: {err}"),
        }
        debug!("Task thread stopped");
    }

    fn tick(&self) {
        let roles = self.context.database().worker_roles();
        match self.runtime.block_on(roles.acquire(TASKS_ROLE, &self.holder)) {
            Ok(acquisition) if acquisition.is_acquired() => {
                debug!(?acquisition, "Holding the tasks role");
            }
            Ok(_) => {
                debug!("Another worker holds the tasks role");
                return;
            }
            Err(err) => {
                report(self.reporter.as_ref(), TASKS_ROLE, err.into());
                return;
            }
        }

        for task in &self.tasks {
            match self
                .runtime
                .block_on(tasks::run_if_due(self.context.database(), task.as_ref()))
            {
                Ok(Some(run)) => {
                    if let Some(metrics) = courier_metrics::metrics() {
                        metrics.worker.record_task_runtime(task.name(), run.elapsed);
                    }
                    if let Err(err) = run.outcome {
                        report(self.reporter.as_ref(), task.name(), err);
                    }
                }
                Ok(None) => {}
                Err(err) => report(self.reporter.as_ref(), task.name(), err),
            }
        }
    }
}
