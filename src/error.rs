//! Error types for tubeworker operations.
//!
//! Defines the error types for each subsystem:
//! - Broker connections and protocol replies
//! - Job statistics parsing
//! - Reservation failures
//! - Payload decoding
//! - Pool configuration
//! - Worker runs

use std::num::ParseIntError;

use thiserror::Error;

/// Errors returned by a broker connection.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No job became ready within the reserve timeout.
    #[error("reserve-with-timeout: timeout")]
    TimedOut,

    /// A job reserved by this client is about to exceed its time-to-run.
    #[error("reserve-with-timeout: deadline soon")]
    DeadlineSoon,

    #[error("Job {0} not found")]
    NotFound(u64),

    /// The server buried the job instead of releasing it (out of memory).
    #[error("Job {0} was buried by the server")]
    Buried(u64),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Unexpected reply to '{command}': {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Connection closed by server")]
    Closed,

    #[error("Invalid dictionary reply: {0}")]
    InvalidDict(#[from] serde_yaml::Error),
}

impl BrokerError {
    /// Whether this is the expected "no job within the timeout" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BrokerError::TimedOut)
    }

    /// Whether this is the deadline-soon signal.
    pub fn is_deadline_soon(&self) -> bool {
        matches!(self, BrokerError::DeadlineSoon)
    }
}

/// Errors raised while turning a `stats-job` reply into job metadata.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("Could not fetch job stats: {0}")]
    Broker(#[from] BrokerError),

    #[error("Job stats missing field '{0}'")]
    MissingField(&'static str),

    #[error("Job stats field '{field}' has invalid value '{value}': {source}")]
    InvalidField {
        field: &'static str,
        value: String,
        #[source]
        source: ParseIntError,
    },
}

/// Errors that make a reservation loop drop its connection and redial.
#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("Error getting job from tube: {0}")]
    Reserve(#[source] BrokerError),

    #[error("Error getting stats for job {job_id}: {source}")]
    Stats {
        job_id: u64,
        #[source]
        source: StatsError,
    },
}

/// Errors produced by a payload decoder.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("JSON decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Invalid(String),
}

/// Configuration mistakes, surfaced at subscribe time or when a run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No tube subscriptions registered, nothing to do")]
    NoSubscriptions,

    #[error("Tube '{0}' already has a subscribed handler")]
    DuplicateSubscription(String),

    #[error("Command '{0}' already has a subscribed handler")]
    DuplicateCommand(String),

    #[error("Invalid tube name '{name}': {reason}")]
    InvalidTubeName { name: String, reason: String },

    #[error("Unknown unmarshal error action '{0}' (expected delete, release or bury)")]
    UnknownErrorAction(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Errors that end a worker run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A job arrived from a tube with no handler. The watch set and the
    /// subscription table have diverged, which is a wiring bug.
    #[error("Job {job_id} reserved from tube '{tube}' which has no subscribed handler")]
    UnhandledTube { tube: String, job_id: u64 },

    #[error("Reservation loop {worker_id} panicked: {message}")]
    LoopPanicked { worker_id: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_error_classification() {
        assert!(BrokerError::TimedOut.is_timeout());
        assert!(!BrokerError::TimedOut.is_deadline_soon());
        assert!(BrokerError::DeadlineSoon.is_deadline_soon());
        assert!(!BrokerError::Closed.is_timeout());
        assert!(!BrokerError::NotFound(7).is_deadline_soon());
    }

    #[test]
    fn test_broker_error_display() {
        assert_eq!(
            BrokerError::TimedOut.to_string(),
            "reserve-with-timeout: timeout"
        );
        assert!(BrokerError::NotFound(42).to_string().contains("42"));

        let err = BrokerError::UnexpectedReply {
            command: "delete 1".to_string(),
            reply: "WAT".to_string(),
        };
        assert!(err.to_string().contains("delete 1"));
        assert!(err.to_string().contains("WAT"));
    }

    #[test]
    fn test_stats_error_display() {
        let err = StatsError::MissingField("pri");
        assert!(err.to_string().contains("pri"));

        let source = "x".parse::<u32>().unwrap_err();
        let err = StatsError::InvalidField {
            field: "age",
            value: "x".to_string(),
            source,
        };
        assert!(err.to_string().contains("age"));
        assert!(err.to_string().contains("'x'"));
    }

    #[test]
    fn test_worker_error_from_config() {
        let err: WorkerError = ConfigError::NoSubscriptions.into();
        assert!(matches!(err, WorkerError::Config(ConfigError::NoSubscriptions)));
        assert!(err.to_string().contains("nothing to do"));

        let err = WorkerError::UnhandledTube {
            tube: "emails".to_string(),
            job_id: 9,
        };
        assert!(err.to_string().contains("emails"));
        assert!(err.to_string().contains('9'));
    }
}
