use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::TimeDelta;

use crate::{
    fetcher::{ChangeFetcher, FetchOptions},
    flag_cache::UNKNOWN_VERSION,
    models::SegmentsDelta,
    segment_cache::SegmentCache,
    Error,
};

use super::{is_expired, InFlight, SyncOutcome, SyncTask};

/// Keeps the segment memberships of one key in sync with a [`ChangeFetcher`].
///
/// Memberships are served as full state, so a cycle is a single fetch.
pub struct SegmentSyncWorker {
    fetcher: Arc<dyn ChangeFetcher>,
    cache: Arc<SegmentCache>,
    key: String,
    cache_expiration: Option<TimeDelta>,
    in_flight: AtomicBool,
    force_full: AtomicBool,
}

impl SegmentSyncWorker {
    /// A worker for the memberships of `key`.
    pub fn new(
        fetcher: Arc<dyn ChangeFetcher>,
        cache: Arc<SegmentCache>,
        key: impl Into<String>,
    ) -> SegmentSyncWorker {
        SegmentSyncWorker {
            fetcher,
            cache,
            key: key.into(),
            cache_expiration: None,
            in_flight: AtomicBool::new(false),
            force_full: AtomicBool::new(false),
        }
    }

    /// Run a full resync when the membership was last updated longer than `ttl` ago.
    pub fn with_cache_expiration(mut self, ttl: Duration) -> SegmentSyncWorker {
        self.cache_expiration = TimeDelta::from_std(ttl).ok();
        self
    }

    /// Key whose memberships this worker fetches.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Run one cycle, unless one is already running.
    pub fn sync(&self) -> SyncOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            log::debug!(target: "split", key = self.key; "segment sync already in progress, skipping");
            return SyncOutcome::Skipped;
        };
        self.run_cycle()
    }

    /// Make the next cycle fetch from scratch, bypassing intermediary caches.
    pub fn force_refresh(&self) {
        self.force_full.store(true, Ordering::Release);
    }

    fn run_cycle(&self) -> SyncOutcome {
        let key = self.key.as_str();
        let mut full = self.force_full.swap(false, Ordering::AcqRel);
        if !full && is_expired(self.cache.updated_at(key), self.cache_expiration) {
            log::debug!(target: "split", key; "segment memberships expired, running a full resync");
            full = true;
        }

        let since = if full {
            UNKNOWN_VERSION
        } else {
            self.cache.current_version(key)
        };

        let delta = match self
            .fetcher
            .fetch_segments_since(key, since, FetchOptions { no_cache: full })
        {
            Ok(delta) => delta,
            Err(err) => {
                log::warn!(target: "split", key, since; "failed to fetch segment memberships: {err}");
                return self.abort(full, SyncOutcome::Failed(err));
            }
        };
        let till = delta.till;

        if till < since {
            log::warn!(target: "split", key, since, till; "discarding stale segment memberships");
            let err = Error::StaleResponse { since, till };
            return self.abort(full, SyncOutcome::Rejected(err));
        }

        let current = self.cache.get(key);
        let Some((added, removed)) = changes(&current, delta, since, full) else {
            return SyncOutcome::UpToDate;
        };

        self.cache.apply_delta(key, &added, &removed, till);
        log::debug!(target: "split", key, since, till; "applied segment memberships");
        SyncOutcome::Updated { till }
    }

    fn abort(&self, full: bool, outcome: SyncOutcome) -> SyncOutcome {
        if full {
            self.force_full.store(true, Ordering::Release);
        }
        outcome
    }
}

/// Segments to add and remove, or `None` when `delta` changes nothing.
fn changes(
    current: &BTreeSet<String>,
    delta: SegmentsDelta,
    since: i64,
    full: bool,
) -> Option<(Vec<String>, Vec<String>)> {
    let advanced = delta.till > since;

    if delta.replace_all {
        let target: BTreeSet<String> = delta.added.into_iter().collect();
        if !full && !advanced && &target == current {
            return None;
        }
        let removed = current.difference(&target).cloned().collect();
        let added = target.into_iter().collect();
        return Some((added, removed));
    }

    if !full && !advanced && delta.added.is_empty() && delta.removed.is_empty() {
        return None;
    }
    Some((delta.added, delta.removed))
}

impl SyncTask for SegmentSyncWorker {
    fn resource(&self) -> &str {
        "segments"
    }

    fn sync(&self) -> SyncOutcome {
        SegmentSyncWorker::sync(self)
    }

    fn force_refresh(&self) {
        SegmentSyncWorker::force_refresh(self)
    }
}
