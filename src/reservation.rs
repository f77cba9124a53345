//! The connection/reservation state machine run by each worker.
//!
//! ```text
//!            dial + watch ok
//!  Disconnected ───────────────▶ Connected ◀──┐ timeout / deadline-soon
//!       ▲  │ dial failed:                │     │ (after cooldown) / job
//!       │  └─ sleep reconnect_delay      │     │ dispatched
//!       │                                ├─────┘
//!       └──── reserve or stats failed ───┘
//! ```
//!
//! Cancellation is checked before every step and raced against every wait
//! (dial, backoff, reserve, cooldown). It never interrupts a handler: once a
//! job is dispatched the loop waits for the handler to return.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Connection};
use crate::dispatch::Dispatcher;
use crate::error::{BrokerError, ReserveError, StatsError, WorkerError};
use crate::job::{Job, JobStats};
use crate::logging::Logger;
use crate::pool::stats::SharedPoolStats;
use crate::pool::WorkerPoolConfig;

/// Waits used by a reservation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopTimings {
    pub reserve_timeout: Duration,
    pub reconnect_delay: Duration,
    pub deadline_soon_cooldown: Duration,
    pub release_delay_fallback: Duration,
}

impl From<&WorkerPoolConfig> for LoopTimings {
    fn from(config: &WorkerPoolConfig) -> Self {
        Self {
            reserve_timeout: config.reserve_timeout,
            reconnect_delay: config.reconnect_delay,
            deadline_soon_cooldown: config.deadline_soon_cooldown,
            release_delay_fallback: config.release_delay_fallback,
        }
    }
}

impl Default for LoopTimings {
    fn default() -> Self {
        Self::from(&WorkerPoolConfig::default())
    }
}

/// Result of one reservation attempt.
#[derive(Debug)]
pub enum ReservationOutcome {
    Reserved(Job),
    /// Nothing became ready within the reserve timeout.
    TimedOut,
    /// A job reserved on this connection is close to its time-to-run.
    DeadlineSoon,
    /// The connection can no longer be trusted.
    Failed(ReserveError),
}

/// Reserves one job on `conn` and snapshots its stats.
///
/// A stats failure is reported as [`ReservationOutcome::Failed`]; the job
/// stays reserved until the connection is dropped.
pub async fn reserve_next(
    conn: &Arc<dyn Connection>,
    timeout: Duration,
    delay_fallback: Duration,
    logger: &Arc<dyn Logger>,
) -> ReservationOutcome {
    let reserved = match conn.reserve(timeout).await {
        Ok(reserved) => reserved,
        Err(err) if err.is_timeout() => return ReservationOutcome::TimedOut,
        Err(err) if err.is_deadline_soon() => return ReservationOutcome::DeadlineSoon,
        Err(err) => return ReservationOutcome::Failed(ReserveError::Reserve(err)),
    };

    let stats = conn
        .stats_job(reserved.id)
        .await
        .map_err(StatsError::from)
        .and_then(|stats| JobStats::from_map(&stats));

    match stats {
        Ok(stats) => ReservationOutcome::Reserved(Job::new(
            reserved.id,
            reserved.body,
            stats,
            Arc::clone(conn),
            Arc::clone(logger),
            delay_fallback,
        )),
        Err(source) => ReservationOutcome::Failed(ReserveError::Stats {
            job_id: reserved.id,
            source,
        }),
    }
}

enum LoopState {
    Disconnected,
    Connected(Arc<dyn Connection>),
}

enum Step {
    Continue,
    Reconnect,
}

/// One worker: a broker connection and the loop that drains it.
pub struct ReservationLoop {
    id: String,
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    tubes: Vec<String>,
    timings: LoopTimings,
    logger: Arc<dyn Logger>,
    stats: Arc<SharedPoolStats>,
}

impl ReservationLoop {
    pub(crate) fn new(
        id: String,
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        tubes: Vec<String>,
        timings: LoopTimings,
        logger: Arc<dyn Logger>,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            broker,
            dispatcher,
            tubes,
            timings,
            logger,
            stats,
        }
    }

    /// Worker id used in log spans.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Runs until `cancel` fires or dispatch hits a fatal error.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), WorkerError> {
        self.stats.increment_active();

        let mut state = LoopState::Disconnected;
        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            state = match state {
                LoopState::Disconnected => match self.connect(&cancel).await {
                    Some(conn) => LoopState::Connected(conn),
                    None => LoopState::Disconnected,
                },
                LoopState::Connected(conn) => match self.step(&conn, &cancel).await {
                    Ok(Step::Continue) => LoopState::Connected(conn),
                    Ok(Step::Reconnect) => {
                        // Redials are immediate; yield between them.
                        tokio::task::yield_now().await;
                        LoopState::Disconnected
                    }
                    Err(err) => break Err(err),
                },
            };
        };

        self.stats.decrement_active();
        result
    }

    /// Dials and watches the tube set. On failure, logs and waits out the
    /// reconnect delay before returning `None`.
    async fn connect(&self, cancel: &CancellationToken) -> Option<Arc<dyn Connection>> {
        let attempt = async {
            let conn = self.broker.dial().await?;
            conn.watch(&self.tubes).await?;
            Ok::<_, BrokerError>(conn)
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = attempt => result,
        };

        match result {
            Ok(conn) => {
                self.stats.record_connect();
                self.logger.info(format_args!(
                    "Connected to {}, watching [{}] for new jobs",
                    self.broker.address(),
                    self.tubes.join(", ")
                ));
                Some(conn)
            }
            Err(err) => {
                self.stats.record_connection_error();
                self.logger.error(format_args!(
                    "Error connecting to beanstalkd: {err}, retrying in {}s",
                    self.timings.reconnect_delay.as_secs()
                ));
                pause(self.timings.reconnect_delay, cancel).await;
                None
            }
        }
    }

    async fn step(
        &self,
        conn: &Arc<dyn Connection>,
        cancel: &CancellationToken,
    ) -> Result<Step, WorkerError> {
        let reserve = reserve_next(
            conn,
            self.timings.reserve_timeout,
            self.timings.release_delay_fallback,
            &self.logger,
        );

        // Dropping the reserve on cancellation discards whatever it would
        // have returned.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Continue),
            outcome = reserve => outcome,
        };

        match outcome {
            ReservationOutcome::TimedOut => {
                self.stats.record_timeout();
                Ok(Step::Continue)
            }
            ReservationOutcome::DeadlineSoon => {
                self.stats.record_deadline_soon();
                pause(self.timings.deadline_soon_cooldown, cancel).await;
                Ok(Step::Continue)
            }
            ReservationOutcome::Failed(err) => {
                self.stats.record_connection_error();
                self.logger.error(format_args!("{err}, reconnecting"));
                Ok(Step::Reconnect)
            }
            ReservationOutcome::Reserved(job) => {
                self.stats.record_reserved();
                let outcome = self.dispatcher.dispatch(job).await?;
                self.stats.record_outcome(outcome);
                Ok(Step::Continue)
            }
        }
    }
}

/// Sleeps for `duration` unless `cancel` fires first.
async fn pause(duration: Duration, cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}
