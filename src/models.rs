//! Wire and domain model of flag definitions, as served by the `splitChanges` and `memberships`
//! endpoints.
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::{matchers::Matcher, Error, Result};

/// Hash algorithm used to bucket keys for a flag.
///
/// Encoded on the wire as an integer: `2` is Murmur3, anything else (including an absent field)
/// selects the legacy hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum HashAlgorithm {
    #[default]
    #[allow(missing_docs)]
    Legacy,
    #[allow(missing_docs)]
    Murmur3,
}

impl From<i32> for HashAlgorithm {
    fn from(value: i32) -> Self {
        match value {
            2 => HashAlgorithm::Murmur3,
            _ => HashAlgorithm::Legacy,
        }
    }
}

impl From<HashAlgorithm> for i32 {
    fn from(value: HashAlgorithm) -> Self {
        match value {
            HashAlgorithm::Legacy => 1,
            HashAlgorithm::Murmur3 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Status {
    #[default]
    Active,
    Archived,
}

/// A flag ("split") definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct FlagDefinition {
    pub name: String,
    #[serde(default)]
    pub traffic_type_name: Option<String>,
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub killed: bool,
    pub default_treatment: String,
    pub seed: i32,
    #[serde(default)]
    pub algo: HashAlgorithm,
    #[serde(default = "default_traffic_allocation")]
    pub traffic_allocation: u32,
    /// Seed for the traffic allocation bucket. Falls back to `seed` when absent.
    #[serde(default)]
    pub traffic_allocation_seed: Option<i32>,
    pub change_number: i64,
    pub conditions: Vec<Condition>,
    /// Treatment name to a JSON configuration string.
    #[serde(default)]
    pub configurations: HashMap<String, String>,
    /// Flag sets this flag belongs to.
    #[serde(default)]
    pub sets: BTreeSet<String>,
    #[serde(default)]
    pub impressions_disabled: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
}

fn default_traffic_allocation() -> u32 {
    100
}

impl FlagDefinition {
    /// Structural validation applied before a definition is allowed into the cache.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidDefinition {
            name: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("empty name".to_owned()));
        }
        if self.default_treatment.is_empty() {
            return Err(invalid("empty defaultTreatment".to_owned()));
        }
        if self.traffic_allocation > 100 {
            return Err(invalid(format!(
                "trafficAllocation {} exceeds 100",
                self.traffic_allocation
            )));
        }
        if self.conditions.is_empty() {
            return Err(invalid("no conditions".to_owned()));
        }
        for (i, condition) in self.conditions.iter().enumerate() {
            if let Some(partition) = condition.partitions.iter().find(|p| p.size > 100) {
                return Err(invalid(format!(
                    "condition {i}: partition {:?} has size {}",
                    partition.treatment, partition.size
                )));
            }
            let total: u32 = condition.partitions.iter().map(|p| p.size).sum();
            if total != 100 {
                return Err(invalid(format!(
                    "condition {i}: partitions sum to {total}"
                )));
            }
        }
        Ok(())
    }

    /// Configuration attached to `treatment`, if any.
    pub fn config_for(&self, treatment: &str) -> Option<&str> {
        self.configurations.get(treatment).map(String::as_str)
    }
}

/// Another flag that must evaluate to one of `treatments` before this flag's conditions are
/// considered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prerequisite {
    /// Prerequisite flag name.
    #[serde(rename = "n")]
    pub flag_name: String,
    /// Accepted treatments.
    #[serde(rename = "ts", default)]
    pub treatments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Condition {
    #[serde(default)]
    pub condition_type: ConditionType,
    pub matcher_group: MatcherGroup,
    pub partitions: Vec<Partition>,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum ConditionType {
    Whitelist,
    #[default]
    Rollout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct MatcherGroup {
    #[serde(default)]
    pub combiner: Combiner,
    #[serde(default)]
    pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum Combiner {
    #[default]
    And,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Partition {
    pub treatment: String,
    pub size: u32,
}

/// Interpretation of numeric matcher operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    /// Plain integers.
    #[default]
    Number,
    /// Epoch milliseconds.
    Datetime,
}

/// Matcher as it appears on the wire. [`Matcher`] decodes it right after parsing and keeps it to
/// serialize back to the same shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MatcherWire {
    pub matcher_type: String,
    #[serde(default)]
    pub negate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_selector: Option<KeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist_matcher_data: Option<WhitelistData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unary_numeric_matcher_data: Option<UnaryNumericData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub between_matcher_data: Option<BetweenData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub between_string_matcher_data: Option<BetweenStringData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependency_matcher_data: Option<DependencyData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_defined_segment_matcher_data: Option<SegmentData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boolean_matcher_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_matcher_data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct KeySelector {
    #[serde(default)]
    pub attribute: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WhitelistData {
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UnaryNumericData {
    #[serde(default)]
    pub data_type: DataType,
    pub value: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BetweenData {
    #[serde(default)]
    pub data_type: DataType,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct BetweenStringData {
    pub start: String,
    pub end: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct DependencyData {
    pub split: String,
    #[serde(default)]
    pub treatments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SegmentData {
    pub segment_name: String,
}

/// `TryParse` allows the subfield to fail parsing without failing the parsing of the whole
/// structure.
///
/// A definition that fails to parse is still reported by name so the delta carrying it can be
/// rejected with a useful error.
#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
pub enum TryParse<T> {
    /// Successfully parsed.
    Parsed(T),
    /// Parsing failed.
    ParseFailed(serde_json::Value),
}

impl TryParse<FlagDefinition> {
    /// Parse and validate, turning a parse failure into [`Error::InvalidDefinition`].
    pub fn into_valid(self) -> Result<FlagDefinition> {
        match self {
            TryParse::Parsed(definition) => {
                definition.validate()?;
                Ok(definition)
            }
            TryParse::ParseFailed(value) => Err(Error::InvalidDefinition {
                name: value
                    .get("name")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                reason: "failed to parse definition".to_owned(),
            }),
        }
    }
}

/// Response of the `splitChanges` endpoint, in either of the shapes it is served in.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum SplitChange {
    /// `{"ff": {"d": [...], "s": since, "t": till}}`
    Compact {
        /// Feature flag changes.
        ff: CompactChange,
    },
    /// `{"splits": [...], "since": since, "till": till}`
    Legacy {
        #[allow(missing_docs)]
        splits: Vec<TryParse<FlagDefinition>>,
        #[allow(missing_docs)]
        since: i64,
        #[allow(missing_docs)]
        till: i64,
    },
}

#[derive(Debug, Deserialize)]
#[allow(missing_docs)]
pub struct CompactChange {
    #[serde(rename = "d", default)]
    pub definitions: Vec<TryParse<FlagDefinition>>,
    #[serde(rename = "s")]
    pub since: i64,
    #[serde(rename = "t")]
    pub till: i64,
}

/// Versioned change set for flag definitions.
#[derive(Debug, Clone)]
pub struct FlagsDelta {
    /// Added or updated definitions, not yet validated.
    pub added: Vec<TryParse<FlagDefinition>>,
    /// Names of definitions to drop.
    pub removed: Vec<String>,
    /// Version the delta was requested from.
    pub since: i64,
    /// Version the cache is at once the delta is applied.
    pub till: i64,
}

impl From<SplitChange> for FlagsDelta {
    fn from(value: SplitChange) -> Self {
        let (definitions, since, till) = match value {
            SplitChange::Compact { ff } => (ff.definitions, ff.since, ff.till),
            SplitChange::Legacy {
                splits,
                since,
                till,
            } => (splits, since, till),
        };

        let mut added = Vec::with_capacity(definitions.len());
        let mut removed = Vec::new();
        for definition in definitions {
            match definition {
                TryParse::Parsed(d) if d.status == Status::Archived => removed.push(d.name),
                other => added.push(other),
            }
        }

        FlagsDelta {
            added,
            removed,
            since,
            till,
        }
    }
}

/// Response of the `memberships/{key}` endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct MembershipsChange {
    /// Segments the key belongs to.
    #[serde(rename = "ms", default)]
    pub my_segments: SegmentMemberships,
}

#[derive(Debug, Default, Deserialize)]
#[allow(missing_docs)]
pub struct SegmentMemberships {
    #[serde(rename = "k", default)]
    pub segments: Vec<SegmentName>,
    #[serde(rename = "cn", default)]
    pub change_number: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[allow(missing_docs)]
pub struct SegmentName {
    #[serde(rename = "n")]
    pub name: String,
}

impl MembershipsChange {
    /// Convert into a full-replacement delta. A response without a change number keeps the
    /// requested version.
    pub fn into_delta(self, since: i64) -> SegmentsDelta {
        SegmentsDelta {
            added: self
                .my_segments
                .segments
                .into_iter()
                .map(|s| s.name)
                .collect(),
            removed: Vec::new(),
            since,
            till: self.my_segments.change_number.unwrap_or(since),
            replace_all: true,
        }
    }
}

/// Versioned change set for one key's segment memberships.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentsDelta {
    /// Segment names the key joined (or, with `replace_all`, the complete membership).
    pub added: Vec<String>,
    /// Segment names the key left.
    pub removed: Vec<String>,
    /// Version the delta was requested from.
    pub since: i64,
    /// Version the cache is at once the delta is applied.
    pub till: i64,
    /// `added` is the complete membership set; anything else currently cached is removed.
    pub replace_all: bool,
}
