//! Worker pool running concurrent reservation loops.
//!
//! Each worker is an independent [`ReservationLoop`] with its own broker
//! connection. All workers share one read-only subscription table, so a job
//! is handled by whichever worker reserved it and by no other.
//!
//! ```text
//!                 ┌───────────────┐
//!                 │  WorkerPool   │ subscriptions + config
//!                 └───────┬───────┘
//!                         │ run(cancel)
//!         ┌───────────────┼───────────────┐
//!         ▼               ▼               ▼
//!   ┌──────────┐    ┌──────────┐    ┌──────────┐
//!   │ worker-0 │    │ worker-1 │    │ worker-N │  one connection each
//!   └────┬─────┘    └────┬─────┘    └────┬─────┘
//!        └───────────────┼───────────────┘
//!                        ▼
//!                   Dispatcher ──▶ handlers
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tubeworker::{Job, JobManager, TcpBroker, WorkerPool};
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(serde::Deserialize)]
//! struct Email { to: String }
//!
//! let mut pool = WorkerPool::new(TcpBroker::new("127.0.0.1:11300"));
//! pool.set_num_workers(4);
//! pool.subscribe("emails", |job: Job, email: Email| async move {
//!     job.log_info(format_args!("sending to {}", email.to));
//!     job.delete().await;
//! })?;
//!
//! pool.run(CancellationToken::new()).await?;
//! ```

pub mod config;
pub mod stats;

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};

use crate::broker::Broker;
use crate::dispatch::{
    json_decoder, CommandRouter, Decoder, Dispatcher, Handler, Subscription, Subscriptions,
    TypedSubscription,
};
use crate::error::{ConfigError, WorkerError};
use crate::logging::{default_logger, Logger};
use crate::policy::ErrorAction;
use crate::reservation::{LoopTimings, ReservationLoop};

pub use config::WorkerPoolConfig;
pub use stats::PoolStats;
use stats::SharedPoolStats;

/// Pool of reservation loops sharing one subscription table.
pub struct WorkerPool {
    broker: Arc<dyn Broker>,
    config: WorkerPoolConfig,
    subscriptions: Subscriptions,
    logger: Arc<dyn Logger>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    /// Creates a pool with the default configuration. Nothing connects until
    /// [`run`](Self::run).
    pub fn new(broker: impl Broker + 'static) -> Self {
        Self::with_config(broker, WorkerPoolConfig::default())
    }

    /// Creates a pool with an explicit configuration.
    pub fn with_config(broker: impl Broker + 'static, config: WorkerPoolConfig) -> Self {
        Self {
            broker: Arc::new(broker),
            config,
            subscriptions: Subscriptions::new(),
            logger: default_logger(),
            stats: Arc::new(SharedPoolStats::new()),
        }
    }

    /// Sets the number of concurrent workers. Zero runs one worker.
    pub fn set_num_workers(&mut self, num_workers: usize) {
        self.config.num_workers = num_workers;
    }

    /// Sets the logger shared by the loops, dispatcher and jobs.
    pub fn set_logger(&mut self, logger: Arc<dyn Logger>) {
        self.logger = logger;
    }

    /// Sets the action for payloads that fail to decode.
    pub fn set_unmarshal_error_action(&mut self, action: ErrorAction) {
        self.config.unmarshal_error_action = action;
    }

    /// Sets the error action by name. Unknown names fall back to release,
    /// which is logged.
    pub fn set_unmarshal_error_action_named(&mut self, name: &str) {
        self.config.unmarshal_error_action = ErrorAction::from_name_lossy(name, &*self.logger);
    }

    /// Subscribes `handler` to `tube`, decoding payloads as JSON into `T`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an invalid tube name or a tube that already
    /// has a handler.
    pub fn subscribe<T, H>(
        &mut self,
        tube: impl Into<String>,
        handler: H,
    ) -> Result<&mut Self, ConfigError>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe_with(tube, json_decoder::<T>(), handler)
    }

    /// Subscribes `handler` to `tube` with a custom payload decoder.
    pub fn subscribe_with<T, H>(
        &mut self,
        tube: impl Into<String>,
        decoder: Decoder<T>,
        handler: H,
    ) -> Result<&mut Self, ConfigError>
    where
        T: Send + 'static,
        H: Handler<T>,
    {
        self.subscribe_subscription(tube, Arc::new(TypedSubscription::new(decoder, handler)))
    }

    /// Routes jobs on `tube` through a command router.
    pub fn subscribe_commands(
        &mut self,
        tube: impl Into<String>,
        router: CommandRouter,
    ) -> Result<&mut Self, ConfigError> {
        self.subscribe_subscription(tube, Arc::new(router))
    }

    /// Binds any [`Subscription`] to `tube`.
    pub fn subscribe_subscription(
        &mut self,
        tube: impl Into<String>,
        subscription: Arc<dyn Subscription>,
    ) -> Result<&mut Self, ConfigError> {
        self.subscriptions.insert(tube, subscription)?;
        Ok(self)
    }

    /// Subscribed tubes, sorted.
    pub fn tubes(&self) -> Vec<String> {
        self.subscriptions.tubes()
    }

    /// Number of workers a run starts.
    pub fn num_workers(&self) -> usize {
        self.config.effective_num_workers()
    }

    /// Current configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.num_workers())
    }

    /// Runs the workers until `cancel` fires or one of them fails.
    ///
    /// Returns only after every worker has exited. A fatal error or panic in
    /// one worker cancels the others, and the first such error is returned.
    ///
    /// # Errors
    ///
    /// - `WorkerError::Config` if nothing is subscribed or the configuration
    ///   does not validate; no worker is started
    /// - `WorkerError::UnhandledTube` if a job arrived from a tube with no
    ///   handler
    /// - `WorkerError::LoopPanicked` if a handler panicked
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        if self.subscriptions.is_empty() {
            let err = ConfigError::NoSubscriptions;
            self.logger.error(format_args!("{err}"));
            return Err(err.into());
        }
        self.config.validate()?;

        let subscriptions = Arc::new(self.subscriptions.clone());
        let tubes = subscriptions.tubes();
        let dispatcher = Dispatcher::new(
            subscriptions,
            self.config.unmarshal_error_action,
            Arc::clone(&self.logger),
        );
        let timings = LoopTimings::from(&self.config);
        let num_workers = self.num_workers();
        let run_token = cancel.child_token();

        self.logger.info(format_args!(
            "Starting {num_workers} worker(s) for {}, watching [{}]",
            self.broker.address(),
            tubes.join(", ")
        ));

        let mut workers = FuturesUnordered::new();
        for i in 0..num_workers {
            let id = format!("worker-{i}");
            let worker = ReservationLoop::new(
                id.clone(),
                Arc::clone(&self.broker),
                dispatcher.clone(),
                tubes.clone(),
                timings,
                Arc::clone(&self.logger),
                Arc::clone(&self.stats),
            );

            let span = info_span!("reservation_loop", worker_id = %id);
            let handle = tokio::spawn(worker.run(run_token.clone()).instrument(span));
            workers.push(async move { (id, handle.await) });
        }

        let mut first_error = None;
        while let Some((id, joined)) = workers.next().await {
            let err = match joined {
                Ok(Ok(())) => continue,
                // Already logged by the dispatcher.
                Ok(Err(err)) => err,
                Err(join_err) => {
                    let err = WorkerError::LoopPanicked {
                        worker_id: id,
                        message: join_err.to_string(),
                    };
                    self.logger.error(format_args!("{err}"));
                    err
                }
            };
            run_token.cancel();
            first_error.get_or_insert(err);
        }

        self.logger.info(format_args!("All workers stopped"));
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
