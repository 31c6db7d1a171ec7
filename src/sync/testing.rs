//! Scripted fetcher shared by the sync tests.
use std::{
    collections::VecDeque,
    sync::Mutex,
    thread,
    time::Duration,
};

use serde_json::json;

use crate::{
    fetcher::{ChangeFetcher, FetchOptions},
    models::{FlagDefinition, FlagsDelta, SegmentsDelta, TryParse},
    Result,
};

/// Replays queued responses in order. Once a queue is empty, answers "nothing new" (`till ==
/// since`).
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    flags: Mutex<VecDeque<Result<FlagsDelta>>>,
    segments: Mutex<VecDeque<Result<SegmentsDelta>>>,
    flag_calls: Mutex<Vec<(i64, FetchOptions)>>,
    segment_calls: Mutex<Vec<(String, i64)>>,
    delay: Duration,
}

impl ScriptedFetcher {
    pub fn new() -> ScriptedFetcher {
        ScriptedFetcher::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> ScriptedFetcher {
        self.delay = delay;
        self
    }

    pub fn push_flags(&self, response: Result<FlagsDelta>) {
        self.flags.lock().unwrap().push_back(response);
    }

    pub fn push_segments(&self, response: Result<SegmentsDelta>) {
        self.segments.lock().unwrap().push_back(response);
    }

    /// `since` of every flag fetch so far.
    pub fn flag_calls(&self) -> Vec<i64> {
        self.flag_calls.lock().unwrap().iter().map(|c| c.0).collect()
    }

    pub fn flag_options(&self) -> Vec<FetchOptions> {
        self.flag_calls.lock().unwrap().iter().map(|c| c.1).collect()
    }

    pub fn segment_calls(&self) -> Vec<(String, i64)> {
        self.segment_calls.lock().unwrap().clone()
    }
}

impl ChangeFetcher for ScriptedFetcher {
    fn fetch_flags_since(&self, since: i64, options: FetchOptions) -> Result<FlagsDelta> {
        self.flag_calls.lock().unwrap().push((since, options));
        thread::sleep(self.delay);
        self.flags.lock().unwrap().pop_front().unwrap_or(Ok(FlagsDelta {
            added: vec![],
            removed: vec![],
            since,
            till: since,
        }))
    }

    fn fetch_segments_since(
        &self,
        key: &str,
        since: i64,
        _options: FetchOptions,
    ) -> Result<SegmentsDelta> {
        self.segment_calls
            .lock()
            .unwrap()
            .push((key.to_owned(), since));
        thread::sleep(self.delay);
        self.segments
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(SegmentsDelta {
                added: vec![],
                removed: vec![],
                since,
                till: since,
                replace_all: false,
            }))
    }
}

/// A valid definition serving "on" to everyone.
pub(crate) fn definition(name: &str, change_number: i64, sets: &[&str]) -> TryParse<FlagDefinition> {
    serde_json::from_value(json!({
        "name": name,
        "trafficTypeName": "user",
        "defaultTreatment": "off",
        "seed": 1,
        "changeNumber": change_number,
        "sets": sets,
        "conditions": [{
            "matcherGroup": { "combiner": "AND", "matchers": [{ "matcherType": "ALL_KEYS" }] },
            "partitions": [{ "treatment": "on", "size": 100 }],
            "label": "default rule"
        }]
    }))
    .unwrap()
}

pub(crate) fn flags_delta(
    added: Vec<TryParse<FlagDefinition>>,
    removed: &[&str],
    since: i64,
    till: i64,
) -> FlagsDelta {
    FlagsDelta {
        added,
        removed: removed.iter().map(|s| s.to_string()).collect(),
        since,
        till,
    }
}
