//! Transport for flag and segment changes.
use std::{
    collections::BTreeSet,
    sync::atomic::{AtomicBool, Ordering},
};

use reqwest::{header::CACHE_CONTROL, StatusCode, Url};

use crate::{
    error::FetchError,
    models::{FlagsDelta, MembershipsChange, SegmentsDelta, SplitChange},
    Error, Result,
};

/// Per-request options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Ask intermediaries not to serve a cached response.
    pub no_cache: bool,
}

/// Source of versioned changes.
///
/// Implementations classify failures into [`FetchError`] (wrapped in [`Error::Fetch`]) and return
/// [`Error::Unauthorized`] when the credentials are rejected.
pub trait ChangeFetcher: Send + Sync {
    /// Flag definitions changed since `since`.
    fn fetch_flags_since(&self, since: i64, options: FetchOptions) -> Result<FlagsDelta>;

    /// Segment memberships of `key` changed since `since`.
    fn fetch_segments_since(
        &self,
        key: &str,
        since: i64,
        options: FetchOptions,
    ) -> Result<SegmentsDelta>;
}

/// Configuration for [`HttpFetcher`].
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    /// Base URL, without a trailing slash.
    pub base_url: String,
    /// Sent as the bearer token.
    pub sdk_key: String,
    /// Flag sets to request. Empty requests every flag.
    pub flag_sets: BTreeSet<String>,
}

/// Default base URL for API calls.
pub const DEFAULT_BASE_URL: &str = "https://sdk.split.io/api";

const SPLIT_CHANGES_ENDPOINT: &str = "/splitChanges";
const MEMBERSHIPS_ENDPOINT: &str = "/memberships";

/// A blocking HTTP client for the `splitChanges` and `memberships` endpoints.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: HttpFetcherConfig,
    /// If we receive a 401 Unauthorized or 403 Forbidden error during a request, it means the SDK
    /// key is not valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

impl HttpFetcher {
    /// Build the blocking HTTP client for `config`.
    pub fn new(config: HttpFetcherConfig) -> HttpFetcher {
        HttpFetcher {
            client: reqwest::blocking::Client::new(),
            config,
            unauthorized: AtomicBool::new(false),
        }
    }

    fn split_changes_url(&self, since: i64) -> Result<Url> {
        let since = since.to_string();
        let mut params = vec![("since", since)];
        if !self.config.flag_sets.is_empty() {
            let sets: Vec<&str> = self.config.flag_sets.iter().map(String::as_str).collect();
            params.push(("sets", sets.join(",")));
        }
        Url::parse_with_params(
            &format!("{}{}", self.config.base_url, SPLIT_CHANGES_ENDPOINT),
            &params,
        )
        .map_err(Error::InvalidBaseUrl)
    }

    fn memberships_url(&self, key: &str) -> Result<Url> {
        let mut url = Url::parse(&format!("{}{}", self.config.base_url, MEMBERSHIPS_ENDPOINT))
            .map_err(Error::InvalidBaseUrl)?;
        url.path_segments_mut()
            .map_err(|()| Error::InvalidBaseUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .push(key);
        Ok(url)
    }

    fn get(&self, url: Url, options: FetchOptions) -> Result<reqwest::blocking::Response> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }

        let mut request = self.client.get(url).bearer_auth(&self.config.sdk_key);
        if options.no_cache {
            request = request.header(CACHE_CONTROL, "no-cache");
        }
        let response = request.send().map_err(FetchError::from)?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            log::warn!(target: "split", "client is not authorized. Check your SDK key");
            self.unauthorized.store(true, Ordering::Relaxed);
            return Err(Error::Unauthorized);
        }

        response.error_for_status().map_err(|err| {
            log::warn!(target: "split", "received non-200 response while fetching changes: {err}");
            Error::from(FetchError::from(err))
        })
    }
}

impl ChangeFetcher for HttpFetcher {
    fn fetch_flags_since(&self, since: i64, options: FetchOptions) -> Result<FlagsDelta> {
        let url = self.split_changes_url(since)?;

        log::debug!(target: "split", since; "fetching flag changes");
        let change: SplitChange = self.get(url, options)?.json().map_err(FetchError::from)?;
        let delta = FlagsDelta::from(change);
        log::debug!(target: "split",
                    since,
                    till = delta.till,
                    added = delta.added.len(),
                    removed = delta.removed.len();
                    "fetched flag changes");

        Ok(delta)
    }

    fn fetch_segments_since(
        &self,
        key: &str,
        since: i64,
        options: FetchOptions,
    ) -> Result<SegmentsDelta> {
        let url = self.memberships_url(key)?;

        log::debug!(target: "split", key, since; "fetching segment memberships");
        let change: MembershipsChange = self.get(url, options)?.json().map_err(FetchError::from)?;

        Ok(change.into_delta(since))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetcher(base_url: &str, flag_sets: &[&str]) -> HttpFetcher {
        HttpFetcher::new(HttpFetcherConfig {
            base_url: base_url.to_owned(),
            sdk_key: "sdk-key".to_owned(),
            flag_sets: flag_sets.iter().map(|s| s.to_string()).collect(),
        })
    }

    #[test]
    fn builds_split_changes_url() {
        let url = fetcher(DEFAULT_BASE_URL, &[]).split_changes_url(-1).unwrap();
        assert_eq!(url.as_str(), "https://sdk.split.io/api/splitChanges?since=-1");

        let url = fetcher(DEFAULT_BASE_URL, &["b", "a"]).split_changes_url(42).unwrap();
        assert_eq!(
            url.as_str(),
            "https://sdk.split.io/api/splitChanges?since=42&sets=a%2Cb"
        );
    }

    #[test]
    fn escapes_key_in_memberships_url() {
        let url = fetcher(DEFAULT_BASE_URL, &[])
            .memberships_url("user/1 2")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://sdk.split.io/api/memberships/user%2F1%202"
        );
    }

    #[test]
    fn rejects_invalid_base_url() {
        let err = fetcher("not a url", &[]).split_changes_url(-1).unwrap_err();
        assert!(matches!(err, Error::InvalidBaseUrl(_)));
    }

    #[test]
    fn unauthorized_is_cached() {
        let fetcher = fetcher(DEFAULT_BASE_URL, &[]);
        fetcher.unauthorized.store(true, Ordering::Relaxed);
        let err = fetcher
            .fetch_flags_since(-1, FetchOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized));
    }
}
