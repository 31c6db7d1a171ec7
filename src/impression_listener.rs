use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Attributes;

/// Record of a treatment served by the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
#[allow(missing_docs)]
pub struct Impression {
    pub feature_flag: String,
    pub key_name: String,
    pub bucketing_key: Option<String>,
    pub treatment: String,
    pub label: String,
    pub change_number: Option<i64>,
    pub attributes: Attributes,
    pub time: DateTime<Utc>,
}

/// Receives an [`Impression`] for every client evaluation of a flag that does not disable
/// impressions.
pub trait ImpressionListener {
    #[allow(missing_docs)]
    fn log_impression(&self, impression: Impression);
}

pub(crate) struct NoopImpressionListener;
impl ImpressionListener for NoopImpressionListener {
    fn log_impression(&self, _impression: Impression) {}
}

impl<T: Fn(Impression)> ImpressionListener for T {
    fn log_impression(&self, impression: Impression) {
        self(impression);
    }
}
