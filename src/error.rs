use std::sync::Arc;

/// Represents a result type for synchronization and setup operations.
///
/// Evaluation never returns this type: every evaluation resolves to an
/// [`EvaluationResult`](crate::EvaluationResult).
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while synchronizing flag definitions or setting up a client.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The remote source could not be queried.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The remote source answered with a version older than the one requested.
    #[error("stale response (since: {since}, till: {till})")]
    StaleResponse {
        /// Version that was requested.
        since: i64,
        /// Version that was returned.
        till: i64,
    },

    /// A returned definition failed structural validation. The whole delta is discarded.
    #[error("invalid definition {name:?}: {reason}")]
    InvalidDefinition {
        /// Name of the offending definition, if it could be read.
        name: String,
        /// Human-readable reason.
        reason: String,
    },

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk_key is likely invalid")]
    Unauthorized,

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// Indicates that a scheduler thread panicked. This should normally never happen.
    #[error("scheduler thread panicked")]
    SchedulerThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

/// Classified failure of the transport collaborator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The host could not be reached (connection refused, DNS failure, timeout, ...).
    #[error("remote source unreachable: {0}")]
    Unreachable(String),

    /// The remote source answered with a non-success status.
    #[error("http status {0}")]
    HttpStatus(u16),

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Serialization(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(value: reqwest::Error) -> Self {
        let value = value.without_url();
        if let Some(status) = value.status() {
            FetchError::HttpStatus(status.as_u16())
        } else if value.is_decode() {
            FetchError::Serialization(value.to_string())
        } else {
            FetchError::Unreachable(value.to_string())
        }
    }
}

/// Errors raised while walking a flag's rule tree. They never escape the
/// [`Evaluator`](crate::eval::Evaluator); each maps to a label.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EvaluationError {
    /// The definition references a matcher type this engine does not implement.
    #[error("matcher not found: {0}")]
    MatcherNotFound(String),

    /// Dependency or prerequisite evaluation nested deeper than allowed. Usually a cycle between
    /// flags.
    #[error("dependency depth exceeded while evaluating {flag_name:?}")]
    DependencyDepthExceeded {
        /// Flag at which the limit was hit.
        flag_name: String,
    },
}

/// Failure to parse a semantic version string.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SemverParseError {
    /// The string is not `major.minor.patch[-prerelease][+metadata]`.
    #[error("invalid semver format: {0:?}")]
    InvalidFormat(String),
}
