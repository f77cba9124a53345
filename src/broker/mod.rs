//! Broker client abstraction.
//!
//! The harness talks to the queue through two traits:
//!
//! - **Broker**: knows where the queue lives and dials fresh connections
//! - **Connection**: one client session; watches tubes, reserves jobs and
//!   finishes them
//!
//! Two implementations ship with the crate:
//!
//! - [`TcpBroker`]: beanstalkd text protocol over TCP
//! - [`InMemoryBroker`]: in-process queue with fault injection, for tests
//!
//! # Connection ownership
//!
//! ```text
//!   WorkerPool ──dial──▶ Connection (one per reservation loop)
//!                           │
//!                 reserve ──┤──▶ Job ──▶ handler ──▶ delete/release/bury
//!                           │                         (same connection)
//! ```
//!
//! Reserved jobs can only be finished on the connection that reserved them,
//! so every [`Job`](crate::Job) keeps a handle to its connection.

pub mod memory;
pub mod tcp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerError;

pub use memory::{BrokerCall, InMemoryBroker, JobRecord, JobState};
pub use tcp::{TcpBroker, TcpConnection};

/// A job handed out by `reserve`, before its stats are known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reserved {
    pub id: u64,
    pub body: Vec<u8>,
}

/// Dials connections to one broker address.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Address used for dialing, for log messages.
    fn address(&self) -> &str;

    /// Opens a new, independent connection.
    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// One client session with the broker.
///
/// Methods take `&self`; implementations serialize access internally so a
/// connection can be shared between its reservation loop and the job being
/// handled.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Watches exactly `tubes`. The implicit `default` tube is ignored unless
    /// it is listed.
    async fn watch(&self, tubes: &[String]) -> Result<(), BrokerError>;

    /// Blocks until a job is reserved from a watched tube or `timeout`
    /// elapses ([`BrokerError::TimedOut`]). May also fail with
    /// [`BrokerError::DeadlineSoon`].
    async fn reserve(&self, timeout: Duration) -> Result<Reserved, BrokerError>;

    /// Per-job statistics as reported by the server (`tube`, `pri`, `age`,
    /// `delay`, `releases`, `reserves`, `timeouts`, ...).
    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>, BrokerError>;

    /// Server-wide statistics.
    async fn stats(&self) -> Result<HashMap<String, String>, BrokerError>;

    async fn delete(&self, id: u64) -> Result<(), BrokerError>;

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError>;

    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError>;

    /// Extends the reservation lease of a job reserved on this connection.
    async fn touch(&self, id: u64) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B: Broker + ?Sized> Broker for Arc<B> {
    fn address(&self) -> &str {
        (**self).address()
    }

    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        (**self).dial().await
    }
}
