use std::sync::Arc;

use courier_common::{identity::ProcessIdentity, internal, logging};
use courier_delivery::{Database, DnsResolver, MessageStore, WorkerContext};
use tokio::runtime::Handle;

use crate::{
    config::CourierConfig,
    worker::{ErrorReporter, LogReporter, ShutdownHandle, Worker},
};

/// Owns the configuration and runs the worker until shutdown.
pub struct Controller {
    config: CourierConfig,
    reporter: Arc<dyn ErrorReporter>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            internal!(level = INFO, "CTRL+C entered, finishing current work");
        }
        _ = terminate.recv() => {
            internal!(level = INFO, "Terminate signal received, finishing current work");
        }
    }

    Ok(())
}

impl Controller {
    #[must_use]
    pub fn new(config: CourierConfig) -> Self {
        Self {
            config,
            reporter: Arc::new(LogReporter),
        }
    }

    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Builds the context every job and task shares.
    ///
    /// # Errors
    ///
    /// Fails if the resolver has no usable configuration, the database
    /// cannot be opened or migrated, or the delivery settings are invalid.
    pub async fn context(
        &self,
        store: Option<Arc<dyn MessageStore>>,
    ) -> anyhow::Result<WorkerContext> {
        let settings = self.config.delivery_settings()?;
        let resolver = Arc::new(DnsResolver::local(&self.config.dns)?);
        let database = Database::connect(&self.config.database, self.config.worker.threads).await?;
        let identity = ProcessIdentity::current();

        Ok(match store {
            Some(store) => WorkerContext::new(identity, database, store, resolver, settings),
            None => WorkerContext::without_store(identity, database, resolver, settings),
        })
    }

    /// Runs the worker against `store` until the process is signalled, then
    /// waits for every thread to finish its current tick.
    ///
    /// Without a store, queued messages are left in the queue for a worker
    /// that has one; webhook requests and scheduled tasks still run.
    ///
    /// Must be called from within a multi-threaded tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if startup fails or a worker thread panicked.
    pub async fn run(self, store: Option<Arc<dyn MessageStore>>) -> anyhow::Result<()> {
        logging::init();
        courier_metrics::init_metrics(&self.config.metrics)?;

        let context = self.context(store).await?;
        internal!(level = INFO, "Worker {} starting", context.identity());
        if !context.has_store() {
            internal!(
                level = WARN,
                "No message store attached, queued messages will not be processed"
            );
        }

        let worker = Worker::new(context, self.config.worker.clone())
            .with_reporter(Arc::clone(&self.reporter));
        let (shutdown, receiver) = ShutdownHandle::new();
        let handles = match worker.spawn(&Handle::current(), &receiver) {
            Ok(handles) => handles,
            Err(err) => {
                shutdown.shutdown();
                return Err(err.into());
            }
        };

        let signalled = shutdown_signal().await;
        shutdown.shutdown();
        internal!(level = INFO, "Shutting down...");

        let panicked = tokio::task::spawn_blocking(move || {
            handles
                .into_iter()
                .map(std::thread::JoinHandle::join)
                .filter(Result::is_err)
                .count()
        })
        .await?;

        signalled?;
        if panicked > 0 {
            anyhow::bail!("{panicked} worker thread(s) panicked");
        }

        internal!(level = INFO, "Worker stopped");
        Ok(())
    }
}
