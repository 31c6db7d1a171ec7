//! In-memory storage of per-key segment memberships.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{flag_cache::UNKNOWN_VERSION, snapshot_store::SnapshotStore};

/// Segments a single key belongs to, at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    segments: BTreeSet<String>,
    change_number: i64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl Default for Membership {
    fn default() -> Self {
        Membership {
            segments: BTreeSet::new(),
            change_number: UNKNOWN_VERSION,
            updated_at: None,
        }
    }
}

impl Membership {
    /// Build a membership holding `segments` at `change_number`, updated now.
    pub fn new(segments: impl IntoIterator<Item = String>, change_number: i64) -> Membership {
        Membership {
            segments: segments.into_iter().collect(),
            change_number,
            updated_at: Some(Utc::now()),
        }
    }

    /// Override the time of the last update, e.g. with the one persisted alongside the
    /// membership.
    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> Membership {
        self.updated_at = updated_at;
        self
    }

    /// Whether the key belongs to `segment_name`.
    pub fn contains(&self, segment_name: &str) -> bool {
        self.segments.contains(segment_name)
    }

    /// Segment names, sorted.
    pub fn segments(&self) -> &BTreeSet<String> {
        &self.segments
    }

    /// Version of the membership, or [`UNKNOWN_VERSION`].
    pub fn change_number(&self) -> i64 {
        self.change_number
    }

    /// Time of the last successful apply.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Immutable view of the memberships of every tracked key.
#[derive(Debug, Clone, Default)]
pub struct SegmentSnapshot {
    memberships: HashMap<String, Membership>,
}

impl SegmentSnapshot {
    /// Membership of `key`, if it has been synchronized.
    pub fn get(&self, key: &str) -> Option<&Membership> {
        self.memberships.get(key)
    }

    /// Whether `key` belongs to `segment_name`. Unknown keys belong to no segment.
    pub fn is_member(&self, key: &str, segment_name: &str) -> bool {
        self.memberships
            .get(key)
            .is_some_and(|membership| membership.contains(segment_name))
    }

    /// Tracked keys and their memberships.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Membership)> {
        self.memberships.iter()
    }
}

/// `SegmentCache` provides thread-safe storage of segment memberships, with the same
/// publish-by-replacement discipline as [`FlagCache`](crate::FlagCache).
#[derive(Debug)]
pub struct SegmentCache {
    store: SnapshotStore<SegmentSnapshot>,
}

impl Default for SegmentCache {
    fn default() -> Self {
        SegmentCache::new()
    }
}

impl SegmentCache {
    /// Create a cache tracking no key.
    pub fn new() -> SegmentCache {
        SegmentCache {
            store: SnapshotStore::new(SegmentSnapshot::default()),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<SegmentSnapshot> {
        self.store.get()
    }

    /// Segment names `key` belongs to.
    pub fn get(&self, key: &str) -> BTreeSet<String> {
        self.snapshot()
            .get(key)
            .map(|m| m.segments.clone())
            .unwrap_or_default()
    }

    /// Version of `key`'s membership, or [`UNKNOWN_VERSION`].
    pub fn current_version(&self, key: &str) -> i64 {
        self.snapshot()
            .get(key)
            .map_or(UNKNOWN_VERSION, Membership::change_number)
    }

    /// Time `key`'s membership was last updated.
    pub fn updated_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.snapshot().get(key).and_then(Membership::updated_at)
    }

    /// Add `key` to `added`, remove it from `removed` and move its membership to `new_version`,
    /// all in one publish.
    pub fn apply_delta(&self, key: &str, added: &[String], removed: &[String], new_version: i64) {
        self.store.update(|snapshot| {
            let membership = snapshot.memberships.entry(key.to_owned()).or_default();
            for name in removed {
                membership.segments.remove(name);
            }
            membership.segments.extend(added.iter().cloned());
            membership.change_number = membership.change_number.max(new_version);
            membership.updated_at = Some(Utc::now());
        });
    }

    /// Publish a previously built membership for `key`, e.g. one restored from persistence.
    pub fn prime(&self, key: &str, membership: Membership) {
        self.store.update(|snapshot| {
            snapshot.memberships.insert(key.to_owned(), membership);
        });
    }

    /// Forget `key`'s membership, resetting its version to [`UNKNOWN_VERSION`].
    pub fn clear_key(&self, key: &str) {
        self.store.update(|snapshot| {
            snapshot.memberships.remove(key);
        });
    }

    /// Forget every membership.
    pub fn clear(&self) {
        self.store.replace(SegmentSnapshot::default());
    }
}
