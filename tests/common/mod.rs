#![allow(dead_code)]

use std::{
    collections::HashMap,
    fs::File,
    sync::{Arc, Mutex},
};

use split_core::{
    models::{FlagsDelta, MembershipsChange, SegmentsDelta, SplitChange},
    ChangeFetcher, FetchOptions, FlagCache, Result, SegmentCache,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn split_changes() -> FlagsDelta {
    let change: SplitChange =
        serde_json::from_reader(File::open("tests/data/split_changes.json").unwrap()).unwrap();
    FlagsDelta::from(change)
}

pub fn memberships() -> HashMap<String, MembershipsChange> {
    serde_json::from_reader(File::open("tests/data/memberships.json").unwrap()).unwrap()
}

/// Caches loaded straight from the fixtures, without going through a sync worker.
pub fn loaded_caches() -> (Arc<FlagCache>, Arc<SegmentCache>) {
    let delta = split_changes();
    let flags = Arc::new(FlagCache::new());
    let added = delta
        .added
        .into_iter()
        .map(|definition| definition.into_valid().unwrap())
        .collect();
    flags.apply_delta(added, &delta.removed, delta.till);

    let segments = Arc::new(SegmentCache::new());
    for (key, change) in memberships() {
        let delta = change.into_delta(-1);
        segments.apply_delta(&key, &delta.added, &delta.removed, delta.till);
    }

    (flags, segments)
}

/// Serves the fixtures the way the remote source would: everything on the first request, then
/// "nothing new".
#[derive(Default)]
pub struct FixtureFetcher {
    flag_requests: Mutex<Vec<(i64, FetchOptions)>>,
    segment_requests: Mutex<Vec<(String, i64)>>,
}

impl FixtureFetcher {
    pub fn new() -> Arc<FixtureFetcher> {
        Arc::new(FixtureFetcher::default())
    }

    pub fn flag_requests(&self) -> Vec<(i64, FetchOptions)> {
        self.flag_requests.lock().unwrap().clone()
    }

    pub fn segment_requests(&self) -> Vec<(String, i64)> {
        self.segment_requests.lock().unwrap().clone()
    }
}

impl ChangeFetcher for FixtureFetcher {
    fn fetch_flags_since(&self, since: i64, options: FetchOptions) -> Result<FlagsDelta> {
        self.flag_requests.lock().unwrap().push((since, options));
        let delta = split_changes();
        if since >= delta.till {
            return Ok(FlagsDelta {
                added: vec![],
                removed: vec![],
                since,
                till: since,
            });
        }
        Ok(delta)
    }

    fn fetch_segments_since(
        &self,
        key: &str,
        since: i64,
        _options: FetchOptions,
    ) -> Result<SegmentsDelta> {
        self.segment_requests
            .lock()
            .unwrap()
            .push((key.to_owned(), since));
        let change = memberships().remove(key).unwrap_or_default();
        Ok(change.into_delta(since))
    }
}
