use std::{
    collections::BTreeSet,
    sync::{Arc, OnceLock},
    time::Duration,
};

use regex::Regex;

use crate::{
    fetcher::{ChangeFetcher, DEFAULT_BASE_URL},
    impression_listener::NoopImpressionListener,
    persistence::NoopPersistence,
    ImpressionListener, Persistence, SplitClient,
};

/// Identity a client evaluates flags for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Key used by matchers and segment membership.
    pub matching_key: String,
    /// Key used to pick a partition. Defaults to `matching_key`.
    pub bucketing_key: Option<String>,
}

impl Key {
    /// A key that buckets by its matching key.
    pub fn new(matching_key: impl Into<String>) -> Key {
        Key {
            matching_key: matching_key.into(),
            bucketing_key: None,
        }
    }

    /// Bucket by `bucketing_key` instead of the matching key.
    pub fn with_bucketing_key(mut self, bucketing_key: impl Into<String>) -> Key {
        self.bucketing_key = Some(bucketing_key.into());
        self
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Key {
        Key::new(value)
    }
}

impl From<String> for Key {
    fn from(value: String) -> Key {
        Key::new(value)
    }
}

/// Configuration for [`SplitClient`].
///
/// # Examples
/// ```
/// # use split_core::ClientConfig;
/// let client = ClientConfig::from_sdk_key("sdk-key", "user-1")
///     .flag_sets_filter(["frontend", "mobile"])
///     .impression_listener(|impression| {
///         println!("{:?}", impression);
///     })
///     .to_client();
/// ```
pub struct ClientConfig<'a> {
    pub(crate) sdk_key: String,
    pub(crate) key: Key,
    pub(crate) base_url: String,
    pub(crate) features_refresh_rate: Duration,
    pub(crate) segments_refresh_rate: Duration,
    pub(crate) poll_jitter: Duration,
    pub(crate) cache_expiration: Duration,
    pub(crate) flag_sets_filter: BTreeSet<String>,
    pub(crate) impression_listener: Box<dyn ImpressionListener + Send + Sync + 'a>,
    pub(crate) persistence: Arc<dyn Persistence>,
    pub(crate) fetcher: Option<Arc<dyn ChangeFetcher>>,
}

impl<'a> ClientConfig<'a> {
    /// Default value for [`ClientConfig::features_refresh_rate`].
    pub const DEFAULT_FEATURES_REFRESH_RATE: Duration = Duration::from_secs(3600);
    /// Default value for [`ClientConfig::segments_refresh_rate`].
    pub const DEFAULT_SEGMENTS_REFRESH_RATE: Duration = Duration::from_secs(1800);
    /// Default value for [`ClientConfig::poll_jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
    /// Default value for [`ClientConfig::cache_expiration`].
    pub const DEFAULT_CACHE_EXPIRATION: Duration = Duration::from_secs(10 * 24 * 60 * 60);

    /// Create a default configuration for `key` using the specified SDK key.
    ///
    /// ```
    /// # use split_core::{ClientConfig, Key};
    /// ClientConfig::from_sdk_key("sdk-key", "user-1");
    /// ClientConfig::from_sdk_key("sdk-key", Key::new("user-1").with_bucketing_key("account-7"));
    /// ```
    pub fn from_sdk_key(sdk_key: impl Into<String>, key: impl Into<Key>) -> Self {
        ClientConfig {
            sdk_key: sdk_key.into(),
            key: key.into(),
            base_url: DEFAULT_BASE_URL.to_owned(),
            features_refresh_rate: Self::DEFAULT_FEATURES_REFRESH_RATE,
            segments_refresh_rate: Self::DEFAULT_SEGMENTS_REFRESH_RATE,
            poll_jitter: Self::DEFAULT_POLL_JITTER,
            cache_expiration: Self::DEFAULT_CACHE_EXPIRATION,
            flag_sets_filter: BTreeSet::new(),
            impression_listener: Box::new(NoopImpressionListener),
            persistence: Arc::new(NoopPersistence),
            fetcher: None,
        }
    }

    /// Override base URL for API calls. Clients should use the default setting in most cases.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Interval between flag definition polls.
    pub fn features_refresh_rate(mut self, rate: Duration) -> Self {
        self.features_refresh_rate = rate;
        self
    }

    /// Interval between segment membership polls.
    pub fn segments_refresh_rate(mut self, rate: Duration) -> Self {
        self.segments_refresh_rate = rate;
        self
    }

    /// Maximum random duration subtracted from each poll interval.
    pub fn poll_jitter(mut self, jitter: Duration) -> Self {
        self.poll_jitter = jitter;
        self
    }

    /// Caches not updated for longer than `expiration` are resynced from scratch.
    pub fn cache_expiration(mut self, expiration: Duration) -> Self {
        self.cache_expiration = expiration;
        self
    }

    /// Only fetch and keep flags belonging to one of `flag_sets`.
    ///
    /// Names are trimmed and lowercased. Names that are not valid flag set names are discarded
    /// with a warning.
    pub fn flag_sets_filter<S: AsRef<str>>(mut self, flag_sets: impl IntoIterator<Item = S>) -> Self {
        self.flag_sets_filter = clean_flag_sets(flag_sets);
        self
    }

    /// Set impression listener to receive every served treatment.
    ///
    /// ```
    /// # use split_core::ClientConfig;
    /// let config = ClientConfig::from_sdk_key("sdk-key", "user-1").impression_listener(|impression| {
    ///   println!("{:?}", impression);
    /// });
    /// ```
    pub fn impression_listener(
        mut self,
        impression_listener: impl ImpressionListener + Send + Sync + 'a,
    ) -> Self {
        self.impression_listener = Box::new(impression_listener);
        self
    }

    /// Storage used to prime the caches at start and save them at stop.
    pub fn persistence(mut self, persistence: impl Persistence + 'static) -> Self {
        self.persistence = Arc::new(persistence);
        self
    }

    /// Replace the HTTP transport. `base_url` and `sdk_key` are ignored when set.
    pub fn fetcher(mut self, fetcher: Arc<dyn ChangeFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Create a new [`SplitClient`] using the specified configuration.
    ///
    /// ```
    /// # use split_core::{ClientConfig, SplitClient};
    /// let client: SplitClient = ClientConfig::from_sdk_key("sdk-key", "user-1").to_client();
    /// ```
    pub fn to_client(self) -> SplitClient<'a> {
        SplitClient::new(self)
    }
}

const FLAG_SET_PATTERN: &str = "^[a-z0-9][_a-z0-9]{0,49}$";

fn flag_set_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(FLAG_SET_PATTERN).expect("flag set pattern should be valid"))
}

/// Trim, lowercase, deduplicate and sort flag set names, dropping invalid ones.
pub(crate) fn clean_flag_sets<S: AsRef<str>>(flag_sets: impl IntoIterator<Item = S>) -> BTreeSet<String> {
    let mut clean = BTreeSet::new();
    for flag_set in flag_sets {
        let flag_set = flag_set.as_ref();
        let value = flag_set.trim().to_lowercase();
        if value.len() < flag_set.len() {
            log::warn!(target: "split", flag_set; "flag set name has extra whitespace, trimming");
        }
        if !flag_set_regex().is_match(&value) {
            log::warn!(target: "split", flag_set = value;
                       "flag set name must match {FLAG_SET_PATTERN}, discarding");
            continue;
        }
        clean.insert(value);
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::from_sdk_key("sdk-key", "user-1");
        assert_eq!(config.key, Key::new("user-1"));
        assert_eq!(config.base_url, "https://sdk.split.io/api");
        assert_eq!(config.features_refresh_rate, Duration::from_secs(3600));
        assert_eq!(config.segments_refresh_rate, Duration::from_secs(1800));
        assert_eq!(config.poll_jitter, Duration::from_secs(3));
        assert_eq!(config.cache_expiration, Duration::from_secs(864_000));
        assert!(config.flag_sets_filter.is_empty());
        assert!(config.fetcher.is_none());
    }

    #[test]
    fn normalizes_flag_sets() {
        let config = ClientConfig::from_sdk_key("sdk-key", "user-1").flag_sets_filter([
            " Mobile ",
            "frontend",
            "FRONTEND",
            "_invalid",
            "has space",
            "",
        ]);
        assert_eq!(
            config.flag_sets_filter.into_iter().collect::<Vec<_>>(),
            vec!["frontend", "mobile"]
        );
    }

    #[test]
    fn rejects_too_long_flag_set() {
        let long = "a".repeat(51);
        assert!(clean_flag_sets([long.as_str()]).is_empty());
        assert_eq!(clean_flag_sets([&long[..50]]).len(), 1);
    }

    #[test]
    fn bucketing_key() {
        let key = Key::new("user-1").with_bucketing_key("account-7");
        assert_eq!(key.matching_key, "user-1");
        assert_eq!(key.bucketing_key.as_deref(), Some("account-7"));
    }
}
