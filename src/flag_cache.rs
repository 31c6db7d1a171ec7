//! In-memory storage of flag definitions.
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{models::FlagDefinition, snapshot_store::SnapshotStore};

/// Version of a cache that has never been synchronized.
pub const UNKNOWN_VERSION: i64 = -1;

/// Immutable view of every cached flag definition at one version.
///
/// Serializes to a flat list of definitions with the change number, the time of the last update
/// and the flag sets filter it was synchronized under, so a [`Persistence`](crate::Persistence)
/// implementation can store it as is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "StoredFlagSnapshot", into = "StoredFlagSnapshot")]
pub struct FlagSnapshot {
    flags: HashMap<String, Arc<FlagDefinition>>,
    change_number: i64,
    /// Flag set name to names of the flags in it.
    flag_sets: HashMap<String, BTreeSet<String>>,
    /// Traffic type name to number of flags using it.
    traffic_types: HashMap<String, usize>,
    updated_at: Option<DateTime<Utc>>,
    flag_sets_filter: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredFlagSnapshot {
    flags: Vec<FlagDefinition>,
    change_number: i64,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    flag_sets_filter: BTreeSet<String>,
}

impl From<StoredFlagSnapshot> for FlagSnapshot {
    fn from(stored: StoredFlagSnapshot) -> Self {
        FlagSnapshot::new(stored.flags, stored.change_number)
            .with_updated_at(stored.updated_at)
            .with_flag_sets_filter(stored.flag_sets_filter)
    }
}

impl From<FlagSnapshot> for StoredFlagSnapshot {
    fn from(snapshot: FlagSnapshot) -> Self {
        StoredFlagSnapshot {
            flags: snapshot
                .flags
                .values()
                .map(|definition| FlagDefinition::clone(definition))
                .collect(),
            change_number: snapshot.change_number,
            updated_at: snapshot.updated_at,
            flag_sets_filter: snapshot.flag_sets_filter,
        }
    }
}

impl Default for FlagSnapshot {
    fn default() -> Self {
        FlagSnapshot {
            flags: HashMap::new(),
            change_number: UNKNOWN_VERSION,
            flag_sets: HashMap::new(),
            traffic_types: HashMap::new(),
            updated_at: None,
            flag_sets_filter: BTreeSet::new(),
        }
    }
}

impl FlagSnapshot {
    /// Build a snapshot holding `definitions` at `change_number`, updated now.
    pub fn new(
        definitions: impl IntoIterator<Item = FlagDefinition>,
        change_number: i64,
    ) -> FlagSnapshot {
        let mut snapshot = FlagSnapshot::default();
        snapshot.apply(definitions, &[], change_number);
        snapshot
    }

    /// Override the time of the last update. Restored snapshots keep the time they were
    /// originally synchronized at, so cache expiration still applies to them.
    pub fn with_updated_at(mut self, updated_at: Option<DateTime<Utc>>) -> FlagSnapshot {
        self.updated_at = updated_at;
        self
    }

    /// Record the flag sets filter the snapshot was synchronized under.
    pub fn with_flag_sets_filter(mut self, flag_sets_filter: BTreeSet<String>) -> FlagSnapshot {
        self.flag_sets_filter = flag_sets_filter;
        self
    }

    /// Definition named `name`.
    pub fn get(&self, name: &str) -> Option<&Arc<FlagDefinition>> {
        self.flags.get(name)
    }

    /// All definitions, in no particular order.
    pub fn get_all(&self) -> impl Iterator<Item = &Arc<FlagDefinition>> {
        self.flags.values()
    }

    /// Number of definitions.
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    /// Whether the snapshot holds no definition.
    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// Highest version applied to this snapshot, or [`UNKNOWN_VERSION`].
    pub fn change_number(&self) -> i64 {
        self.change_number
    }

    /// Time of the last successful apply. `None` for a snapshot that was never synchronized.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Flag sets filter recorded with [`FlagSnapshot::with_flag_sets_filter`]. Empty if none.
    pub fn flag_sets_filter(&self) -> &BTreeSet<String> {
        &self.flag_sets_filter
    }

    /// Names of flags belonging to any of `sets`, sorted.
    pub fn names_by_flag_sets<S: AsRef<str>>(&self, sets: &[S]) -> BTreeSet<String> {
        sets.iter()
            .filter_map(|set| self.flag_sets.get(set.as_ref()))
            .flatten()
            .cloned()
            .collect()
    }

    /// Whether any cached flag uses `traffic_type`.
    pub fn is_traffic_type_known(&self, traffic_type: &str) -> bool {
        self.traffic_types.contains_key(traffic_type)
    }

    fn apply(
        &mut self,
        added: impl IntoIterator<Item = FlagDefinition>,
        removed: &[String],
        new_version: i64,
    ) {
        for name in removed {
            self.remove(name);
        }
        for definition in added {
            self.insert(definition);
        }
        self.change_number = self.change_number.max(new_version);
        self.updated_at = Some(Utc::now());
    }

    fn insert(&mut self, definition: FlagDefinition) {
        self.remove(&definition.name);

        for set in &definition.sets {
            self.flag_sets
                .entry(set.clone())
                .or_default()
                .insert(definition.name.clone());
        }
        if let Some(traffic_type) = &definition.traffic_type_name {
            *self.traffic_types.entry(traffic_type.clone()).or_default() += 1;
        }
        self.flags
            .insert(definition.name.clone(), Arc::new(definition));
    }

    fn remove(&mut self, name: &str) {
        let Some(previous) = self.flags.remove(name) else {
            return;
        };

        for set in &previous.sets {
            if let Some(names) = self.flag_sets.get_mut(set) {
                names.remove(name);
                if names.is_empty() {
                    self.flag_sets.remove(set);
                }
            }
        }
        if let Some(traffic_type) = &previous.traffic_type_name {
            if let Some(count) = self.traffic_types.get_mut(traffic_type) {
                *count -= 1;
                if *count == 0 {
                    self.traffic_types.remove(traffic_type);
                }
            }
        }
    }
}

/// `FlagCache` provides thread-safe storage of flag definitions.
///
/// Every change publishes a new [`FlagSnapshot`]; readers holding the previous one keep a
/// consistent view.
#[derive(Debug)]
pub struct FlagCache {
    store: SnapshotStore<FlagSnapshot>,
}

impl Default for FlagCache {
    fn default() -> Self {
        FlagCache::new()
    }
}

impl FlagCache {
    /// Create an empty cache at [`UNKNOWN_VERSION`].
    pub fn new() -> FlagCache {
        FlagCache {
            store: SnapshotStore::new(FlagSnapshot::default()),
        }
    }

    /// The currently published snapshot.
    pub fn snapshot(&self) -> Arc<FlagSnapshot> {
        self.store.get()
    }

    /// Definition named `name` in the current snapshot.
    pub fn get(&self, name: &str) -> Option<Arc<FlagDefinition>> {
        self.snapshot().get(name).cloned()
    }

    /// Every definition in the current snapshot.
    pub fn get_all(&self) -> Vec<Arc<FlagDefinition>> {
        self.snapshot().get_all().cloned().collect()
    }

    /// Change number of the current snapshot.
    pub fn current_version(&self) -> i64 {
        self.snapshot().change_number()
    }

    /// Time of the last successful apply.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot().updated_at()
    }

    /// Add or replace `added`, drop `removed` and move to `new_version`, all in one publish.
    pub fn apply_delta(&self, added: Vec<FlagDefinition>, removed: &[String], new_version: i64) {
        self.store
            .update(|snapshot| snapshot.apply(added, removed, new_version));
    }

    /// Replace the whole content with `definitions` at `new_version`, in one publish.
    pub fn replace_all(&self, definitions: Vec<FlagDefinition>, new_version: i64) {
        self.store.replace(FlagSnapshot::new(definitions, new_version));
    }

    /// Publish a previously built snapshot, e.g. one restored from persistence.
    pub fn prime(&self, snapshot: FlagSnapshot) {
        self.store.replace(snapshot);
    }

    /// Drop every definition and reset the version to [`UNKNOWN_VERSION`].
    pub fn clear(&self) {
        self.store.replace(FlagSnapshot::default());
    }

    /// See [`FlagSnapshot::names_by_flag_sets`].
    pub fn names_by_flag_sets<S: AsRef<str>>(&self, sets: &[S]) -> BTreeSet<String> {
        self.snapshot().names_by_flag_sets(sets)
    }

    /// See [`FlagSnapshot::is_traffic_type_known`].
    pub fn is_traffic_type_known(&self, traffic_type: &str) -> bool {
        self.snapshot().is_traffic_type_known(traffic_type)
    }
}
