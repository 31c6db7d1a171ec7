//! Synchronization of the caches with the remote source.
//!
//! A sync worker runs one fetch-validate-apply cycle per call; a [`PollScheduler`] drives a worker
//! on a background thread.
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, TimeDelta, Utc};

use crate::Error;

mod flag_sync;
mod poll_scheduler;
mod segment_sync;
#[cfg(test)]
pub(crate) mod testing;

pub use flag_sync::FlagSyncWorker;
pub use poll_scheduler::{PollScheduler, SchedulerConfig};
pub use segment_sync::SegmentSyncWorker;

/// Upper bound on fetches per cycle while catching up with the remote version.
pub const MAX_FETCH_ITERATIONS: usize = 10;

/// Result of one sync cycle.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// Changes were applied and the cache is now at `till`.
    Updated {
        /// Version the cache now holds.
        till: i64,
    },
    /// The remote source had nothing newer.
    UpToDate,
    /// Another cycle for the same resource was already running.
    Skipped,
    /// The response was discarded: stale, or carrying an invalid definition.
    Rejected(Error),
    /// The remote source could not be queried.
    Failed(Error),
}

impl SyncOutcome {
    /// Whether the cache holds the latest known version after this cycle.
    pub fn is_synced(&self) -> bool {
        matches!(self, SyncOutcome::Updated { .. } | SyncOutcome::UpToDate)
    }

    /// Errors after which retrying cannot help.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            SyncOutcome::Failed(Error::Unauthorized | Error::InvalidBaseUrl(_))
        )
    }
}

/// A resource that can be synchronized by a [`PollScheduler`].
pub trait SyncTask: Send + Sync {
    /// Short resource name used for the thread name and logs.
    fn resource(&self) -> &str;

    /// Run one cycle.
    fn sync(&self) -> SyncOutcome;

    /// Make the next cycle a full resync.
    fn force_refresh(&self);
}

/// Single-flight guard. Held for the duration of a cycle.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    /// Returns `None` if another cycle holds the guard.
    fn acquire(flag: &'a AtomicBool) -> Option<InFlight<'a>> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Whether a cache last updated at `updated_at` is older than `ttl`.
fn is_expired(updated_at: Option<DateTime<Utc>>, ttl: Option<TimeDelta>) -> bool {
    match (updated_at, ttl) {
        (Some(updated_at), Some(ttl)) => Utc::now() - updated_at > ttl,
        _ => false,
    }
}
