//! Counters shared by the reservation loops of one pool.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::dispatch::DispatchOutcome;

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of loops the pool starts.
    pub num_workers: usize,
    /// Loops currently running.
    pub active_workers: usize,
    /// Successful dials.
    pub connects: u64,
    /// Failed dials and dropped connections.
    pub connection_errors: u64,
    /// Reserves that returned no job within the timeout.
    pub reserve_timeouts: u64,
    /// Deadline-soon signals received.
    pub deadline_soon: u64,
    /// Jobs reserved and handed to the dispatcher.
    pub jobs_reserved: u64,
    /// Jobs that reached a handler.
    pub jobs_handled: u64,
    /// Jobs finished by the error action after a decode failure.
    pub decode_failures: u64,
    /// Command jobs deleted because no handler matched.
    pub unknown_commands: u64,
}

impl PoolStats {
    /// Jobs the dispatcher finished one way or another.
    pub fn total_dispatched(&self) -> u64 {
        self.jobs_handled + self.decode_failures + self.unknown_commands
    }
}

/// Shared state for tracking pool statistics.
#[derive(Debug, Default)]
pub(crate) struct SharedPoolStats {
    active_workers: AtomicU64,
    connects: AtomicU64,
    connection_errors: AtomicU64,
    reserve_timeouts: AtomicU64,
    deadline_soon: AtomicU64,
    jobs_reserved: AtomicU64,
    jobs_handled: AtomicU64,
    decode_failures: AtomicU64,
    unknown_commands: AtomicU64,
}

impl SharedPoolStats {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_timeout(&self) {
        self.reserve_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_deadline_soon(&self) {
        self.deadline_soon.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_reserved(&self) {
        self.jobs_reserved.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_outcome(&self, outcome: DispatchOutcome) {
        let counter = match outcome {
            DispatchOutcome::Handled => &self.jobs_handled,
            DispatchOutcome::DecodeFailed => &self.decode_failures,
            DispatchOutcome::UnknownCommand => &self.unknown_commands,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            active_workers: self.active_workers.load(Ordering::SeqCst) as usize,
            connects: self.connects.load(Ordering::SeqCst),
            connection_errors: self.connection_errors.load(Ordering::SeqCst),
            reserve_timeouts: self.reserve_timeouts.load(Ordering::SeqCst),
            deadline_soon: self.deadline_soon.load(Ordering::SeqCst),
            jobs_reserved: self.jobs_reserved.load(Ordering::SeqCst),
            jobs_handled: self.jobs_handled.load(Ordering::SeqCst),
            decode_failures: self.decode_failures.load(Ordering::SeqCst),
            unknown_commands: self.unknown_commands.load(Ordering::SeqCst),
        }
    }
}
