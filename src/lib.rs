//! tubeworker: concurrent consumer harness for beanstalkd work queues.
//!
//! A [`WorkerPool`] runs one or more reservation loops, each with its own
//! broker connection. Loops reserve jobs from the subscribed tubes, snapshot
//! their metadata into a [`Job`], decode the payload and hand both to the
//! handler subscribed on the job's tube. Handlers finish jobs through the
//! [`JobManager`] contract (delete, release, bury, touch).

pub mod broker;
pub mod cli;
pub mod dispatch;
pub mod error;
pub mod job;
pub mod logging;
pub mod policy;
pub mod pool;
pub mod reservation;

pub use broker::{Broker, Connection, InMemoryBroker, TcpBroker};
pub use dispatch::{CommandJob, CommandRouter, Dispatcher, DispatchOutcome, Handler};
pub use error::{BrokerError, ConfigError, DecodeError, ReserveError, StatsError, WorkerError};
pub use job::{Job, JobManager, JobStats};
pub use logging::{Logger, RecordingLogger, TracingLogger};
pub use policy::ErrorAction;
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig};
pub use reservation::{ReservationLoop, ReservationOutcome};
