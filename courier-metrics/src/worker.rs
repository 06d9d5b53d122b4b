//! Worker process metrics
//!
//! Tracks the polling loop:
//! - Job executions by thread and job
//! - Job and scheduled task runtimes
//! - Errors caught by the per-job guard
//! - Time messages spent queued before being picked up

use std::time::Duration;

use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram},
};

use crate::meter;

#[derive(Debug)]
pub struct WorkerMetrics {
    job_executions: Counter<u64>,
    job_runtime: Histogram<f64>,
    task_runtime: Histogram<f64>,
    errors: Counter<u64>,
    queue_latency: Histogram<f64>,
}

impl WorkerMetrics {
    pub(crate) fn new() -> Self {
        let meter = meter();

        Self {
            job_executions: meter
                .u64_counter("courier.worker.job.executions.total")
                .with_description("Number of job executions by thread and job")
                .build(),
            job_runtime: meter
                .f64_histogram("courier.worker.job.runtime.seconds")
                .with_description("Time spent running a job once")
                .with_unit("s")
                .build(),
            task_runtime: meter
                .f64_histogram("courier.worker.task.runtime.seconds")
                .with_description("Time spent running a scheduled task")
                .with_unit("s")
                .build(),
            errors: meter
                .u64_counter("courier.worker.errors.total")
                .with_description("Errors caught while running jobs and tasks")
                .build(),
            queue_latency: meter
                .f64_histogram("courier.queue.latency.seconds")
                .with_description("Time between a message being queued and being dequeued")
                .with_unit("s")
                .build(),
        }
    }

    pub fn record_job_execution(&self, thread: &str, job: &str) {
        self.job_executions.add(
            1,
            &[
                KeyValue::new("thread", thread.to_string()),
                KeyValue::new("job", job.to_string()),
            ],
        );
    }

    pub fn record_job_runtime(&self, job: &str, elapsed: Duration) {
        self.job_runtime
            .record(elapsed.as_secs_f64(), &[KeyValue::new("job", job.to_string())]);
    }

    pub fn record_task_runtime(&self, task: &str, elapsed: Duration) {
        self.task_runtime
            .record(elapsed.as_secs_f64(), &[KeyValue::new("task", task.to_string())]);
    }

    pub fn record_error(&self, error: &str) {
        self.errors
            .add(1, &[KeyValue::new("error", error.to_string())]);
    }

    pub fn record_queue_latency(&self, latency: Duration) {
        self.queue_latency.record(latency.as_secs_f64(), &[]);
    }
}
