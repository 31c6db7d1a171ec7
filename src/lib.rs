//! A client-side evaluation and synchronization engine for Split feature flags.
//!
//! # Overview
//!
//! The crate revolves around a [`SplitClient`] bound to a single [`Key`]. The client keeps local
//! caches of flag definitions ([`FlagCache`]) and of the key's segment memberships
//! ([`SegmentCache`]) in sync with the remote source, and evaluates flags against them entirely
//! in memory. Every evaluation results in a treatment string; when no definition-provided
//! treatment can be served, the treatment is `"control"`.
//!
//! The lower layers are usable on their own: an [`Evaluator`] evaluates any key against a pair of
//! caches, [`FlagSyncWorker`](sync::FlagSyncWorker) and [`SegmentSyncWorker`](sync::SegmentSyncWorker)
//! run one sync cycle each, and a [`PollScheduler`](sync::PollScheduler) drives a worker on a
//! background thread.
//!
//! An [`ImpressionListener`] can be provided to receive every treatment served, and a
//! [`Persistence`] implementation to keep caches across restarts.
//!
//! # Error Handling
//!
//! Evaluation never fails: errors are reported through the label of the [`EvaluationResult`] and
//! the `"control"` treatment. Synchronization and setup errors are represented by the [`Error`]
//! enum.
//!
//! Sync failures never discard cached data. A failed or rejected cycle keeps the current version
//! and is retried on the next tick.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `split`. Consider integrating a `log`-compatible logger implementation for better
//! visibility into SDK operations.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod attributes;
pub mod bucketer;
mod client;
mod config;
mod error;
pub mod eval;
mod fetcher;
mod flag_cache;
pub mod hashing;
mod impression_listener;
pub mod matchers;
pub mod models;
mod persistence;
mod rules;
mod segment_cache;
pub mod semver;
mod snapshot_store;
pub mod sync;

pub use attributes::{AttributeValue, Attributes};
pub use client::{SplitClient, TreatmentWithConfig};
pub use config::{ClientConfig, Key};
pub use error::{Error, EvaluationError, FetchError, Result, SemverParseError};
pub use eval::{EvaluationResult, Evaluator, CONTROL};
pub use fetcher::{ChangeFetcher, FetchOptions, HttpFetcher, HttpFetcherConfig, DEFAULT_BASE_URL};
pub use flag_cache::{FlagCache, FlagSnapshot, UNKNOWN_VERSION};
pub use impression_listener::{Impression, ImpressionListener};
pub use persistence::Persistence;
pub use segment_cache::{Membership, SegmentCache, SegmentSnapshot};
