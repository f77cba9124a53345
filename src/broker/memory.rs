//! In-process broker for tests and local development.
//!
//! Models the parts of beanstalkd the harness depends on:
//!
//! - Jobs are reserved lowest priority value first, then oldest first
//! - A reserved job can only be released, buried or touched by the
//!   connection that reserved it
//! - Dropping a connection returns its reserved jobs to the ready queue
//!
//! Delayed jobs stay in [`JobState::Delayed`]; there is no timer promoting
//! them back to ready.
//!
//! Faults can be injected (failed dials, reserve errors, stats errors,
//! overridden stats fields) and every lifecycle call is journaled as a
//! [`BrokerCall`] so tests can assert on what the harness asked for.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{Broker, Connection, Reserved};
use crate::error::BrokerError;

/// Time-to-run reported for every job.
const DEFAULT_TTR_SECS: u64 = 60;

/// Broker-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Delayed => "delayed",
            JobState::Reserved => "reserved",
            JobState::Buried => "buried",
        }
    }
}

/// A lifecycle request received by the broker, successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Delete { id: u64 },
    Release { id: u64, priority: u32, delay: Duration },
    Bury { id: u64, priority: u32 },
    Touch { id: u64 },
}

impl BrokerCall {
    /// The job the call targeted.
    pub fn job_id(&self) -> u64 {
        match self {
            BrokerCall::Delete { id }
            | BrokerCall::Release { id, .. }
            | BrokerCall::Bury { id, .. }
            | BrokerCall::Touch { id } => *id,
        }
    }

    /// Whether the call finishes the job (delete, release or bury).
    pub fn is_finish(&self) -> bool {
        !matches!(self, BrokerCall::Touch { .. })
    }
}

/// A job as stored by the broker.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: u64,
    pub tube: String,
    pub priority: u32,
    pub delay: Duration,
    pub body: Vec<u8>,
    pub state: JobState,
    pub releases: u32,
    pub reserves: u32,
    pub timeouts: u32,
    pub buries: u32,
    reserved_by: Option<u64>,
    created: Instant,
}

#[derive(Default)]
struct Faults {
    dial_failures: u32,
    reserve_errors: VecDeque<BrokerError>,
    stats_errors: VecDeque<BrokerError>,
    stats_overrides: HashMap<u64, HashMap<String, String>>,
}

#[derive(Default)]
struct State {
    next_job_id: u64,
    jobs: BTreeMap<u64, JobRecord>,
    calls: Vec<BrokerCall>,
    faults: Faults,
}

struct Shared {
    state: Mutex<State>,
    ready: Notify,
    next_conn_id: AtomicU64,
    dials: AtomicU64,
    open_connections: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// In-process broker. Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryBroker {
    addr: String,
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            addr: "in-memory".to_string(),
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_job_id: 1,
                    ..Default::default()
                }),
                ready: Notify::new(),
                next_conn_id: AtomicU64::new(1),
                dials: AtomicU64::new(0),
                open_connections: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues a job and returns its id. A non-zero `delay` parks the job in
    /// [`JobState::Delayed`].
    pub fn put(
        &self,
        tube: impl Into<String>,
        priority: u32,
        delay: Duration,
        body: impl Into<Vec<u8>>,
    ) -> u64 {
        let mut state = self.shared.lock();
        let id = state.next_job_id;
        state.next_job_id += 1;
        state.jobs.insert(
            id,
            JobRecord {
                id,
                tube: tube.into(),
                priority,
                delay,
                body: body.into(),
                state: if delay.is_zero() {
                    JobState::Ready
                } else {
                    JobState::Delayed
                },
                releases: 0,
                reserves: 0,
                timeouts: 0,
                buries: 0,
                reserved_by: None,
                created: Instant::now(),
            },
        );
        drop(state);
        self.shared.ready.notify_waiters();
        id
    }

    /// Makes the next `count` dials fail with a connection error.
    pub fn fail_next_dials(&self, count: u32) {
        self.shared.lock().faults.dial_failures += count;
    }

    /// Queues an error returned by the next `reserve` call on any connection.
    pub fn push_reserve_error(&self, error: BrokerError) {
        self.shared.lock().faults.reserve_errors.push_back(error);
    }

    /// Queues an error returned by the next `stats-job` call.
    pub fn push_stats_error(&self, error: BrokerError) {
        self.shared.lock().faults.stats_errors.push_back(error);
    }

    /// Replaces one field of the `stats-job` reply for job `id`.
    pub fn override_stat(&self, id: u64, key: impl Into<String>, value: impl Into<String>) {
        self.shared
            .lock()
            .faults
            .stats_overrides
            .entry(id)
            .or_default()
            .insert(key.into(), value.into());
    }

    /// Every lifecycle call received so far, in order.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.shared.lock().calls.clone()
    }

    /// Lifecycle calls that targeted job `id`.
    pub fn calls_for(&self, id: u64) -> Vec<BrokerCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.job_id() == id)
            .collect()
    }

    /// Snapshot of a job, if it still exists.
    pub fn job(&self, id: u64) -> Option<JobRecord> {
        self.shared.lock().jobs.get(&id).cloned()
    }

    /// State of job `id`, or `None` once it has been deleted.
    pub fn job_state(&self, id: u64) -> Option<JobState> {
        self.shared.lock().jobs.get(&id).map(|job| job.state)
    }

    /// Number of jobs in `state` across all tubes.
    pub fn count(&self, state: JobState) -> usize {
        self.shared
            .lock()
            .jobs
            .values()
            .filter(|job| job.state == state)
            .count()
    }

    /// Number of jobs the broker still holds in any state.
    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total dial attempts, failed ones included.
    pub fn dial_count(&self) -> u64 {
        self.shared.dials.load(Ordering::SeqCst)
    }

    /// Connections dialed and not yet dropped.
    pub fn open_connections(&self) -> u64 {
        self.shared.open_connections.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn address(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<Arc<dyn Connection>, BrokerError> {
        self.shared.dials.fetch_add(1, Ordering::SeqCst);

        let refused = {
            let mut state = self.shared.lock();
            let refused = state.faults.dial_failures > 0;
            if refused {
                state.faults.dial_failures -= 1;
            }
            refused
        };
        if refused {
            return Err(BrokerError::Connect {
                addr: self.addr.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ),
            });
        }

        self.shared.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            id: self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst),
            shared: Arc::clone(&self.shared),
            watched: Mutex::new(HashSet::from(["default".to_string()])),
        }))
    }
}

/// Connection to an [`InMemoryBroker`].
struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    watched: Mutex<HashSet<String>>,
}

impl MemoryConnection {
    fn watched(&self) -> HashSet<String> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn try_reserve(&self) -> Option<Reserved> {
        let watched = self.watched();
        let mut state = self.shared.lock();

        let id = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Ready && watched.contains(&job.tube))
            .min_by_key(|job| (job.priority, job.id))
            .map(|job| job.id)?;

        let job = state.jobs.get_mut(&id)?;
        job.state = JobState::Reserved;
        job.reserved_by = Some(self.id);
        job.reserves += 1;

        Some(Reserved {
            id,
            body: job.body.clone(),
        })
    }

    /// Applies `f` to job `id` if this connection holds its reservation.
    fn with_reserved<T>(
        &self,
        id: u64,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, BrokerError> {
        let mut state = self.shared.lock();
        match state.jobs.get_mut(&id) {
            Some(job) if job.state == JobState::Reserved && job.reserved_by == Some(self.id) => {
                Ok(f(job))
            }
            _ => Err(BrokerError::NotFound(id)),
        }
    }

    fn record(&self, call: BrokerCall) {
        self.shared.lock().calls.push(call);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn watch(&self, tubes: &[String]) -> Result<(), BrokerError> {
        let mut watched = self
            .watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        watched.clear();
        watched.extend(tubes.iter().cloned());
        if watched.is_empty() {
            watched.insert("default".to_string());
        }
        Ok(())
    }

    async fn reserve(&self, timeout: Duration) -> Result<Reserved, BrokerError> {
        let injected = self.shared.lock().faults.reserve_errors.pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let deadline = Instant::now() + timeout;
        loop {
            // Registered before checking so a put between the check and the
            // wait still wakes us.
            let notified = self.shared.ready.notified();
            if let Some(reserved) = self.try_reserve() {
                return Ok(reserved);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BrokerError::TimedOut);
            }
        }
    }

    async fn stats_job(&self, id: u64) -> Result<HashMap<String, String>, BrokerError> {
        let mut state = self.shared.lock();
        if let Some(error) = state.faults.stats_errors.pop_front() {
            return Err(error);
        }

        let job = state.jobs.get(&id).ok_or(BrokerError::NotFound(id))?;
        let mut stats: HashMap<String, String> = [
            ("id", id.to_string()),
            ("tube", job.tube.clone()),
            ("state", job.state.as_str().to_string()),
            ("pri", job.priority.to_string()),
            ("age", job.created.elapsed().as_secs().to_string()),
            ("delay", job.delay.as_secs().to_string()),
            ("ttr", DEFAULT_TTR_SECS.to_string()),
            ("reserves", job.reserves.to_string()),
            ("timeouts", job.timeouts.to_string()),
            ("releases", job.releases.to_string()),
            ("buries", job.buries.to_string()),
            ("kicks", "0".to_string()),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value))
        .collect();

        if let Some(overrides) = state.faults.stats_overrides.get(&id) {
            stats.extend(overrides.clone());
        }
        Ok(stats)
    }

    async fn stats(&self) -> Result<HashMap<String, String>, BrokerError> {
        let state = self.shared.lock();
        let count = |wanted: JobState| {
            state
                .jobs
                .values()
                .filter(|job| job.state == wanted)
                .count()
                .to_string()
        };

        Ok(HashMap::from([
            ("hostname".to_string(), "in-memory".to_string()),
            ("current-jobs-ready".to_string(), count(JobState::Ready)),
            ("current-jobs-reserved".to_string(), count(JobState::Reserved)),
            ("current-jobs-delayed".to_string(), count(JobState::Delayed)),
            ("current-jobs-buried".to_string(), count(JobState::Buried)),
            (
                "current-connections".to_string(),
                self.shared.open_connections.load(Ordering::SeqCst).to_string(),
            ),
            (
                "total-jobs".to_string(),
                (state.next_job_id - 1).to_string(),
            ),
        ]))
    }

    async fn delete(&self, id: u64) -> Result<(), BrokerError> {
        self.record(BrokerCall::Delete { id });

        let mut state = self.shared.lock();
        let deletable = state.jobs.get(&id).is_some_and(|job| {
            job.state != JobState::Reserved || job.reserved_by == Some(self.id)
        });
        if !deletable {
            return Err(BrokerError::NotFound(id));
        }
        state.jobs.remove(&id);
        Ok(())
    }

    async fn release(&self, id: u64, priority: u32, delay: Duration) -> Result<(), BrokerError> {
        self.record(BrokerCall::Release {
            id,
            priority,
            delay,
        });

        self.with_reserved(id, |job| {
            job.priority = priority;
            job.delay = delay;
            job.releases += 1;
            job.reserved_by = None;
            job.state = if delay.is_zero() {
                JobState::Ready
            } else {
                JobState::Delayed
            };
        })?;
        self.shared.ready.notify_waiters();
        Ok(())
    }

    async fn bury(&self, id: u64, priority: u32) -> Result<(), BrokerError> {
        self.record(BrokerCall::Bury { id, priority });

        self.with_reserved(id, |job| {
            job.priority = priority;
            job.buries += 1;
            job.reserved_by = None;
            job.state = JobState::Buried;
        })
    }

    async fn touch(&self, id: u64) -> Result<(), BrokerError> {
        self.record(BrokerCall::Touch { id });
        self.with_reserved(id, |_| ())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut returned = false;
        {
            let mut state = self.shared.lock();
            for job in state.jobs.values_mut() {
                if job.reserved_by == Some(self.id) {
                    job.reserved_by = None;
                    job.state = JobState::Ready;
                    returned = true;
                }
            }
        }
        self.shared.open_connections.fetch_sub(1, Ordering::SeqCst);
        if returned {
            self.shared.ready.notify_waiters();
        }
    }
}
