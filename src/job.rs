//! Reserved job snapshot and the lifecycle contract handlers use.
//!
//! A [`Job`] freezes what the broker reported at reservation time. Only the
//! return state (the priority and delay used by `release`/`bury`) can change
//! afterwards.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::Connection;
use crate::error::StatsError;
use crate::logging::Logger;

/// Release delay used when the job was reserved with no delay of its own.
pub const DEFAULT_RELEASE_DELAY_FALLBACK: Duration = Duration::from_secs(60);

/// Job metadata taken from a `stats-job` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStats {
    pub tube: String,
    pub priority: u32,
    pub age: Duration,
    pub delay: Duration,
    pub releases: u32,
    pub reserves: u32,
    pub timeouts: u32,
}

impl JobStats {
    /// Parses the fields the harness needs. Any missing or non-numeric field
    /// is an error.
    pub fn from_map(stats: &HashMap<String, String>) -> Result<Self, StatsError> {
        Ok(Self {
            tube: stats
                .get("tube")
                .cloned()
                .ok_or(StatsError::MissingField("tube"))?,
            priority: parse_field(stats, "pri")?,
            age: Duration::from_secs(parse_field(stats, "age")?),
            delay: Duration::from_secs(parse_field(stats, "delay")?),
            releases: parse_field(stats, "releases")?,
            reserves: parse_field(stats, "reserves")?,
            timeouts: parse_field(stats, "timeouts")?,
        })
    }
}

fn parse_field<T>(stats: &HashMap<String, String>, field: &'static str) -> Result<T, StatsError>
where
    T: FromStr<Err = std::num::ParseIntError>,
{
    let value = stats.get(field).ok_or(StatsError::MissingField(field))?;
    value
        .trim()
        .parse()
        .map_err(|source| StatsError::InvalidField {
            field,
            value: value.clone(),
            source,
        })
}

/// Lifecycle operations available to a handler.
///
/// Finishing calls are fire-and-log: a broker failure is written to the
/// logger and otherwise ignored. A handler should call exactly one of
/// `delete`, `release` or `bury`.
#[async_trait]
pub trait JobManager: Send + Sync {
    async fn delete(&self);

    /// Returns the job to the ready queue with the current return priority
    /// and delay.
    async fn release(&self);

    /// Buries the job with the current return priority.
    async fn bury(&self);

    /// Extends the reservation.
    async fn touch(&self);

    fn set_return_priority(&mut self, priority: u32);
    fn set_return_delay(&mut self, delay: Duration);

    fn id(&self) -> u64;
    fn tube(&self) -> &str;
    fn age(&self) -> Duration;
    fn priority(&self) -> u32;
    fn delay(&self) -> Duration;
    fn releases(&self) -> u32;
    fn reserves(&self) -> u32;
    fn timeouts(&self) -> u32;

    /// Info log line prefixed with the tube and job id.
    fn log_info(&self, args: fmt::Arguments<'_>);

    /// Error log line prefixed with the tube and job id.
    fn log_error(&self, args: fmt::Arguments<'_>);
}

/// A reserved job.
pub struct Job {
    id: u64,
    body: Vec<u8>,
    stats: JobStats,
    return_priority: u32,
    return_delay: Duration,
    conn: Arc<dyn Connection>,
    logger: Arc<dyn Logger>,
}

impl Job {
    /// Builds the snapshot. The return priority starts at the job's priority
    /// and the return delay at its delay, or `delay_fallback` when that is
    /// zero.
    pub fn new(
        id: u64,
        body: Vec<u8>,
        stats: JobStats,
        conn: Arc<dyn Connection>,
        logger: Arc<dyn Logger>,
        delay_fallback: Duration,
    ) -> Self {
        let return_delay = if stats.delay.is_zero() {
            delay_fallback
        } else {
            stats.delay
        };

        Self {
            id,
            body,
            return_priority: stats.priority,
            return_delay,
            stats,
            conn,
            logger,
        }
    }

    /// Raw payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Payload as text, with invalid UTF-8 replaced.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Metadata captured at reservation time.
    pub fn stats(&self) -> &JobStats {
        &self.stats
    }

    /// Priority used by release and bury.
    pub fn return_priority(&self) -> u32 {
        self.return_priority
    }

    /// Delay used by release.
    pub fn return_delay(&self) -> Duration {
        self.return_delay
    }

    /// The connection the job was reserved on.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Logger behind `log_info` and `log_error`.
    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("tube", &self.stats.tube)
            .field("body_len", &self.body.len())
            .field("return_priority", &self.return_priority)
            .field("return_delay", &self.return_delay)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl JobManager for Job {
    async fn delete(&self) {
        if let Err(err) = self.conn.delete(self.id).await {
            self.log_error(format_args!("Could not delete job: {err}"));
        }
    }

    async fn release(&self) {
        if let Err(err) = self
            .conn
            .release(self.id, self.return_priority, self.return_delay)
            .await
        {
            self.log_error(format_args!("Could not release job: {err}"));
        }
    }

    async fn bury(&self) {
        if let Err(err) = self.conn.bury(self.id, self.return_priority).await {
            self.log_error(format_args!("Could not bury job: {err}"));
        }
    }

    async fn touch(&self) {
        if let Err(err) = self.conn.touch(self.id).await {
            self.log_error(format_args!("Could not touch job: {err}"));
        }
    }

    fn set_return_priority(&mut self, priority: u32) {
        self.return_priority = priority;
    }

    fn set_return_delay(&mut self, delay: Duration) {
        self.return_delay = delay;
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn tube(&self) -> &str {
        &self.stats.tube
    }

    fn age(&self) -> Duration {
        self.stats.age
    }

    fn priority(&self) -> u32 {
        self.stats.priority
    }

    fn delay(&self) -> Duration {
        self.stats.delay
    }

    fn releases(&self) -> u32 {
        self.stats.releases
    }

    fn reserves(&self) -> u32 {
        self.stats.reserves
    }

    fn timeouts(&self) -> u32 {
        self.stats.timeouts
    }

    fn log_info(&self, args: fmt::Arguments<'_>) {
        self.logger.info(format_args!(
            "Tube: {}, Job: {}: {}",
            self.stats.tube, self.id, args
        ));
    }

    fn log_error(&self, args: fmt::Arguments<'_>) {
        self.logger.error(format_args!(
            "Tube: {}, Job: {}: Error: {}",
            self.stats.tube, self.id, args
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerCall, InMemoryBroker, JobState};
    use crate::logging::RecordingLogger;

    fn stats_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_stats() -> HashMap<String, String> {
        stats_map(&[
            ("tube", "emails"),
            ("pri", "1024"),
            ("age", "12"),
            ("delay", "0"),
            ("releases", "2"),
            ("reserves", "3"),
            ("timeouts", "1"),
        ])
    }

    /// Reserves the only job in `tube` and wraps it as a `Job`.
    async fn reserve_job(
        broker: &InMemoryBroker,
        tube: &str,
        logger: Arc<RecordingLogger>,
    ) -> Job {
        let conn = broker.dial().await.expect("dial");
        conn.watch(&[tube.to_string()]).await.expect("watch");
        let reserved = conn
            .reserve(Duration::from_secs(1))
            .await
            .expect("reserve");
        let stats = JobStats::from_map(&conn.stats_job(reserved.id).await.expect("stats"))
            .expect("parse stats");
        Job::new(
            reserved.id,
            reserved.body,
            stats,
            conn,
            logger,
            DEFAULT_RELEASE_DELAY_FALLBACK,
        )
    }

    #[test]
    fn test_job_stats_from_map() {
        let stats = JobStats::from_map(&full_stats()).expect("valid stats");
        assert_eq!(stats.tube, "emails");
        assert_eq!(stats.priority, 1024);
        assert_eq!(stats.age, Duration::from_secs(12));
        assert_eq!(stats.delay, Duration::ZERO);
        assert_eq!(stats.releases, 2);
        assert_eq!(stats.reserves, 3);
        assert_eq!(stats.timeouts, 1);
    }

    #[test]
    fn test_job_stats_missing_and_invalid_fields() {
        let mut stats = full_stats();
        stats.remove("timeouts");
        assert!(matches!(
            JobStats::from_map(&stats),
            Err(StatsError::MissingField("timeouts"))
        ));

        let mut stats = full_stats();
        stats.insert("age".to_string(), "soon".to_string());
        match JobStats::from_map(&stats) {
            Err(StatsError::InvalidField { field, value, .. }) => {
                assert_eq!(field, "age");
                assert_eq!(value, "soon");
            }
            other => panic!("expected invalid field, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_return_state_defaults() {
        let broker = InMemoryBroker::new();
        broker.put("emails", 77, Duration::ZERO, "{}");
        broker.put("delayed", 5, Duration::from_secs(30), "{}");
        let logger = Arc::new(RecordingLogger::new());

        let job = reserve_job(&broker, "emails", logger.clone()).await;
        assert_eq!(job.return_priority(), 77);
        assert_eq!(job.return_delay(), DEFAULT_RELEASE_DELAY_FALLBACK);
        assert_eq!(job.tube(), "emails");
        assert_eq!(job.reserves(), 1);

        let conn = broker.dial().await.expect("dial");
        let stats = JobStats::from_map(&conn.stats_job(2).await.expect("stats"))
            .expect("parse stats");
        let delayed = Job::new(
            2,
            Vec::new(),
            stats,
            conn,
            logger,
            DEFAULT_RELEASE_DELAY_FALLBACK,
        );
        assert_eq!(delayed.return_delay(), Duration::from_secs(30));
        assert_eq!(delayed.return_priority(), 5);
    }

    #[tokio::test]
    async fn test_set_return_priority_then_release() {
        let broker = InMemoryBroker::new();
        let id = broker.put("emails", 100, Duration::ZERO, "{}");
        let logger = Arc::new(RecordingLogger::new());

        let mut job = reserve_job(&broker, "emails", logger.clone()).await;
        job.set_return_priority(5);
        job.release().await;

        assert_eq!(
            broker.calls(),
            vec![BrokerCall::Release {
                id,
                priority: 5,
                delay: DEFAULT_RELEASE_DELAY_FALLBACK,
            }]
        );
        // The snapshot keeps what was reserved.
        assert_eq!(job.priority(), 100);
        assert!(logger.errors().is_empty());
    }

    #[tokio::test]
    async fn test_bury_uses_return_priority() {
        let broker = InMemoryBroker::new();
        let id = broker.put("emails", 100, Duration::ZERO, "{}");

        let mut job = reserve_job(&broker, "emails", Arc::new(RecordingLogger::new())).await;
        job.set_return_priority(9);
        job.set_return_delay(Duration::from_secs(3));
        job.bury().await;

        assert_eq!(broker.calls(), vec![BrokerCall::Bury { id, priority: 9 }]);
        assert_eq!(broker.job_state(id), Some(JobState::Buried));
    }

    #[tokio::test]
    async fn test_touch_after_delete_logs_error() {
        let broker = InMemoryBroker::new();
        let id = broker.put("emails", 1, Duration::ZERO, "{}");
        let logger = Arc::new(RecordingLogger::new());

        let job = reserve_job(&broker, "emails", logger.clone()).await;
        job.delete().await;
        job.touch().await;

        assert!(broker.job_state(id).is_none());
        let errors = logger.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with(&format!("Tube: emails, Job: {id}: Error: ")));
        assert!(errors[0].contains("Could not touch job"));
    }

    #[tokio::test]
    async fn test_log_helpers_prefix_tube_and_id() {
        let broker = InMemoryBroker::new();
        let id = broker.put("imports", 1, Duration::ZERO, "{}");
        let logger = Arc::new(RecordingLogger::new());

        let job = reserve_job(&broker, "imports", logger.clone()).await;
        job.log_info(format_args!("processing {} rows", 3));

        assert_eq!(
            logger.infos(),
            vec![format!("Tube: imports, Job: {id}: processing 3 rows")]
        );
    }
}
