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
    flag_cache::{FlagCache, UNKNOWN_VERSION},
    models::{FlagDefinition, TryParse},
    Error, Result,
};

use super::{is_expired, InFlight, SyncOutcome, SyncTask, MAX_FETCH_ITERATIONS};

/// Keeps a [`FlagCache`] in sync with a [`ChangeFetcher`].
pub struct FlagSyncWorker {
    fetcher: Arc<dyn ChangeFetcher>,
    cache: Arc<FlagCache>,
    /// Only flags in one of these sets are kept. Empty keeps every flag.
    flag_sets_filter: BTreeSet<String>,
    cache_expiration: Option<TimeDelta>,
    in_flight: AtomicBool,
    force_full: AtomicBool,
}

impl FlagSyncWorker {
    /// A worker with no flag sets filter and no cache expiration.
    pub fn new(fetcher: Arc<dyn ChangeFetcher>, cache: Arc<FlagCache>) -> FlagSyncWorker {
        FlagSyncWorker {
            fetcher,
            cache,
            flag_sets_filter: BTreeSet::new(),
            cache_expiration: None,
            in_flight: AtomicBool::new(false),
            force_full: AtomicBool::new(false),
        }
    }

    /// Keep only flags belonging to one of `flag_sets`.
    pub fn with_flag_sets_filter(mut self, flag_sets: BTreeSet<String>) -> FlagSyncWorker {
        self.flag_sets_filter = flag_sets;
        self
    }

    /// Run a full resync when the cache was last updated longer than `ttl` ago.
    pub fn with_cache_expiration(mut self, ttl: Duration) -> FlagSyncWorker {
        self.cache_expiration = TimeDelta::from_std(ttl).ok();
        self
    }

    /// Run one cycle, unless one is already running.
    pub fn sync(&self) -> SyncOutcome {
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            log::debug!(target: "split", "flag sync already in progress, skipping");
            return SyncOutcome::Skipped;
        };
        self.run_cycle()
    }

    /// Make the next cycle fetch everything from scratch.
    pub fn force_refresh(&self) {
        self.force_full.store(true, Ordering::Release);
    }

    fn run_cycle(&self) -> SyncOutcome {
        let mut full = self.force_full.swap(false, Ordering::AcqRel);
        if !full && is_expired(self.cache.updated_at(), self.cache_expiration) {
            log::debug!(target: "split", "flag cache expired, running a full resync");
            full = true;
        }

        let mut since = if full {
            UNKNOWN_VERSION
        } else {
            self.cache.current_version()
        };
        let mut outcome = SyncOutcome::UpToDate;

        for _ in 0..MAX_FETCH_ITERATIONS {
            let options = FetchOptions { no_cache: full };
            let delta = match self.fetcher.fetch_flags_since(since, options) {
                Ok(delta) => delta,
                Err(err) => {
                    log::warn!(target: "split", since; "failed to fetch flag changes: {err}");
                    return self.abort(full, SyncOutcome::Failed(err));
                }
            };
            let till = delta.till;

            if till < since {
                log::warn!(target: "split", since, till; "discarding stale flag changes");
                let err = Error::StaleResponse { since, till };
                return self.abort(full, SyncOutcome::Rejected(err));
            }

            let (added, removed) = match self.ingest(delta.added, delta.removed) {
                Ok(changes) => changes,
                Err(err) => {
                    log::warn!(target: "split", since, till; "discarding flag changes: {err}");
                    return self.abort(full, SyncOutcome::Rejected(err));
                }
            };

            if full {
                self.cache.replace_all(added, till);
                full = false;
            } else if till == since {
                break;
            } else {
                self.cache.apply_delta(added, &removed, till);
            }
            log::debug!(target: "split", since, till; "applied flag changes");
            outcome = SyncOutcome::Updated { till };

            if till == since {
                break;
            }
            since = till;
        }

        outcome
    }

    /// Validate every definition and turn those outside the flag sets filter into removals. Any
    /// invalid definition fails the whole delta.
    fn ingest(
        &self,
        added: Vec<TryParse<FlagDefinition>>,
        mut removed: Vec<String>,
    ) -> Result<(Vec<FlagDefinition>, Vec<String>)> {
        let mut kept = Vec::with_capacity(added.len());
        for definition in added {
            let definition = definition.into_valid()?;
            if self.passes_filter(&definition) {
                kept.push(definition);
            } else {
                removed.push(definition.name);
            }
        }
        Ok((kept, removed))
    }

    fn passes_filter(&self, definition: &FlagDefinition) -> bool {
        self.flag_sets_filter.is_empty()
            || definition
                .sets
                .iter()
                .any(|set| self.flag_sets_filter.contains(set))
    }

    /// A failed full resync is retried in full on the next cycle.
    fn abort(&self, full: bool, outcome: SyncOutcome) -> SyncOutcome {
        if full {
            self.force_full.store(true, Ordering::Release);
        }
        outcome
    }
}

impl SyncTask for FlagSyncWorker {
    fn resource(&self) -> &str {
        "flags"
    }

    fn sync(&self) -> SyncOutcome {
        FlagSyncWorker::sync(self)
    }

    fn force_refresh(&self) {
        FlagSyncWorker::force_refresh(self)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::{
        error::FetchError,
        flag_cache::FlagSnapshot,
        sync::testing::{definition, flags_delta, ScriptedFetcher},
    };

    fn worker(fetcher: &Arc<ScriptedFetcher>) -> (FlagSyncWorker, Arc<FlagCache>) {
        let cache = Arc::new(FlagCache::new());
        let worker = FlagSyncWorker::new(fetcher.clone(), cache.clone());
        (worker, cache)
    }

    #[test]
    fn applies_changes_and_catches_up() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Ok(flags_delta(vec![definition("a", 5, &[])], &[], -1, 5)));
        fetcher.push_flags(Ok(flags_delta(vec![definition("b", 8, &[])], &[], 5, 8)));
        let (worker, cache) = worker(&fetcher);

        assert!(matches!(worker.sync(), SyncOutcome::Updated { till: 8 }));
        assert_eq!(fetcher.flag_calls(), vec![-1, 5, 8]);
        assert_eq!(cache.current_version(), 8);
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_some());

        assert!(matches!(worker.sync(), SyncOutcome::UpToDate));
        assert_eq!(cache.current_version(), 8);
    }

    #[test]
    fn stops_after_max_iterations() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        for i in 0..20 {
            fetcher.push_flags(Ok(flags_delta(vec![], &[], i, i + 1)));
        }
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![], &[], 0);

        assert!(matches!(worker.sync(), SyncOutcome::Updated { till: 10 }));
        assert_eq!(fetcher.flag_calls().len(), MAX_FETCH_ITERATIONS);
    }

    #[test]
    fn applies_removals() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Ok(flags_delta(vec![], &["a"], 5, 6)));
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![definition("a", 5, &[]).into_valid().unwrap()], &[], 5);

        assert!(matches!(worker.sync(), SyncOutcome::Updated { till: 6 }));
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn rejects_stale_response() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Ok(flags_delta(vec![definition("a", 5, &[])], &[], 10, 5)));
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![], &[], 10);

        assert!(matches!(
            worker.sync(),
            SyncOutcome::Rejected(Error::StaleResponse { since: 10, till: 5 })
        ));
        assert_eq!(cache.current_version(), 10);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn rejects_whole_delta_with_invalid_definition() {
        let broken: TryParse<FlagDefinition> = serde_json::from_value(json!({
            "name": "broken",
            "defaultTreatment": "off",
            "seed": 1,
            "changeNumber": 5,
            "conditions": []
        }))
        .unwrap();
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Ok(flags_delta(vec![definition("a", 5, &[]), broken], &[], -1, 5)));
        let (worker, cache) = worker(&fetcher);

        assert!(matches!(
            worker.sync(),
            SyncOutcome::Rejected(Error::InvalidDefinition { name, .. }) if name == "broken"
        ));
        assert_eq!(cache.current_version(), UNKNOWN_VERSION);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn keeps_version_on_fetch_failure() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Err(FetchError::HttpStatus(500).into()));
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![], &[], 3);

        assert!(matches!(
            worker.sync(),
            SyncOutcome::Failed(Error::Fetch(FetchError::HttpStatus(500)))
        ));
        assert_eq!(cache.current_version(), 3);

        // Retried from the same version next time.
        assert!(matches!(worker.sync(), SyncOutcome::UpToDate));
        assert_eq!(fetcher.flag_calls(), vec![3, 3]);
    }

    #[test]
    fn filters_by_flag_sets() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Ok(flags_delta(
            vec![definition("front", 5, &["frontend"]), definition("back", 5, &["backend"])],
            &[],
            4,
            5,
        )));
        let cache = Arc::new(FlagCache::new());
        cache.apply_delta(vec![definition("back", 4, &["frontend"]).into_valid().unwrap()], &[], 4);
        let worker = FlagSyncWorker::new(fetcher.clone(), cache.clone())
            .with_flag_sets_filter(["frontend".to_owned()].into_iter().collect());

        assert!(worker.sync().is_synced());
        assert!(cache.get("front").is_some());
        // Moved out of the filtered sets, so dropped.
        assert!(cache.get("back").is_none());
    }

    #[test]
    fn force_refresh_runs_full_resync() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![definition("old", 5, &[]).into_valid().unwrap()], &[], 5);

        fetcher.push_flags(Ok(flags_delta(vec![definition("new", 9, &[])], &[], -1, 9)));
        worker.force_refresh();
        assert!(matches!(worker.sync(), SyncOutcome::Updated { till: 9 }));

        assert_eq!(fetcher.flag_calls(), vec![-1, 9]);
        assert!(fetcher.flag_options()[0].no_cache);
        assert!(!fetcher.flag_options()[1].no_cache);
        assert!(cache.get("old").is_none());
        assert!(cache.get("new").is_some());
    }

    #[test]
    fn failed_full_resync_is_retried_in_full() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        fetcher.push_flags(Err(FetchError::Unreachable("timeout".to_owned()).into()));
        let (worker, cache) = worker(&fetcher);
        cache.apply_delta(vec![], &[], 5);

        worker.force_refresh();
        assert!(matches!(worker.sync(), SyncOutcome::Failed(_)));
        worker.sync();
        assert_eq!(fetcher.flag_calls()[..2], [-1, -1]);
    }

    #[test]
    fn expired_cache_runs_full_resync() {
        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = Arc::new(FlagCache::new());
        cache.apply_delta(vec![definition("old", 5, &[]).into_valid().unwrap()], &[], 5);
        let worker = FlagSyncWorker::new(fetcher.clone(), cache.clone())
            .with_cache_expiration(Duration::ZERO);
        thread::sleep(Duration::from_millis(5));

        fetcher.push_flags(Ok(flags_delta(vec![definition("new", 9, &[])], &[], -1, 9)));
        assert!(worker.sync().is_synced());
        assert_eq!(fetcher.flag_calls()[0], -1);
        assert!(cache.get("old").is_none());
    }

    #[test]
    fn restored_snapshot_expires_by_its_original_update_time() {
        let restored = |age: TimeDelta| {
            FlagSnapshot::new([definition("old", 5, &[]).into_valid().unwrap()], 5)
                .with_updated_at(Some(Utc::now() - age))
        };

        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = Arc::new(FlagCache::new());
        cache.prime(restored(TimeDelta::seconds(10)));
        let worker = FlagSyncWorker::new(fetcher.clone(), cache.clone())
            .with_cache_expiration(Duration::from_secs(60));
        assert!(worker.sync().is_synced());
        assert_eq!(fetcher.flag_calls()[0], 5);

        let fetcher = Arc::new(ScriptedFetcher::new());
        let cache = Arc::new(FlagCache::new());
        cache.prime(restored(TimeDelta::hours(1)));
        let worker = FlagSyncWorker::new(fetcher.clone(), cache.clone())
            .with_cache_expiration(Duration::from_secs(60));
        fetcher.push_flags(Ok(flags_delta(vec![definition("new", 9, &[])], &[], -1, 9)));
        assert!(matches!(worker.sync(), SyncOutcome::Updated { till: 9 }));
        assert_eq!(fetcher.flag_calls()[0], -1);
        assert!(fetcher.flag_options()[0].no_cache);
        assert!(cache.get("old").is_none());
    }

    #[test]
    fn overlapping_cycles_are_skipped() {
        let fetcher = Arc::new(ScriptedFetcher::new().with_delay(Duration::from_millis(200)));
        fetcher.push_flags(Ok(flags_delta(vec![definition("a", 5, &[])], &[], -1, 5)));
        let cache = Arc::new(FlagCache::new());
        let worker = Arc::new(FlagSyncWorker::new(fetcher.clone(), cache.clone()));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let worker = worker.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    worker.sync()
                })
            })
            .collect();
        let outcomes: Vec<SyncOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Skipped))
            .count();
        let updated = outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Updated { till: 5 }))
            .count();
        assert_eq!((skipped, updated), (1, 1));
        // One cycle: the initial fetch plus the catch-up check.
        assert_eq!(fetcher.flag_calls(), vec![-1, 5]);
    }
}
