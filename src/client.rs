use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::Serialize;

#[cfg(doc)]
use crate::Error;
use crate::{
    config::clean_flag_sets,
    eval::{labels, EvaluationResult, Evaluator},
    fetcher::{ChangeFetcher, HttpFetcher, HttpFetcherConfig},
    flag_cache::{FlagCache, FlagSnapshot},
    segment_cache::SegmentCache,
    sync::{FlagSyncWorker, PollScheduler, SchedulerConfig, SegmentSyncWorker},
    Attributes, ClientConfig, Impression, Key, Result,
};

/// A treatment together with the configuration attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreatmentWithConfig {
    /// Treatment served.
    pub treatment: String,
    /// `None` when the definition carries no configuration for `treatment`.
    pub config: Option<String>,
}

struct Schedulers {
    flags: PollScheduler,
    segments: PollScheduler,
}

/// A client evaluating flags for a single [`Key`].
///
/// In order to create a client instance, first create [`ClientConfig`].
///
/// # Synchronization
///
/// The client does not fetch anything until [`SplitClient::start`] is called. Starting primes the
/// caches from [`Persistence`](crate::Persistence) and runs two background schedulers: one for flag
/// definitions and one for the key's segment memberships. Until the first sync completes, flags
/// evaluate to `control` with label `definition not found`. Use
/// [`SplitClient::wait_for_first_sync`] to block until data is available.
///
/// # Examples
/// ```no_run
/// # use split_core::ClientConfig;
/// let mut client = ClientConfig::from_sdk_key("sdk-key", "user-1").to_client();
/// client.start().unwrap();
/// client.wait_for_first_sync().unwrap();
///
/// if client.get_treatment("new-checkout", &Default::default()) == "on" {
///     // ...
/// }
///
/// client.stop().unwrap();
/// ```
pub struct SplitClient<'a> {
    flags: Arc<FlagCache>,
    segments: Arc<SegmentCache>,
    evaluator: Evaluator,
    flag_worker: Arc<FlagSyncWorker>,
    segment_worker: Arc<SegmentSyncWorker>,
    schedulers: Option<Schedulers>,
    config: ClientConfig<'a>,
}

impl<'a> SplitClient<'a> {
    /// Create a new `SplitClient` using the specified configuration.
    ///
    /// ```
    /// # use split_core::{ClientConfig, SplitClient};
    /// let client = SplitClient::new(ClientConfig::from_sdk_key("sdk-key", "user-1"));
    /// ```
    pub fn new(config: ClientConfig<'a>) -> Self {
        let fetcher: Arc<dyn ChangeFetcher> = match &config.fetcher {
            Some(fetcher) => fetcher.clone(),
            None => Arc::new(HttpFetcher::new(HttpFetcherConfig {
                base_url: config.base_url.clone(),
                sdk_key: config.sdk_key.clone(),
                flag_sets: config.flag_sets_filter.clone(),
            })),
        };

        let flags = Arc::new(FlagCache::new());
        let segments = Arc::new(SegmentCache::new());
        let flag_worker = FlagSyncWorker::new(fetcher.clone(), flags.clone())
            .with_flag_sets_filter(config.flag_sets_filter.clone())
            .with_cache_expiration(config.cache_expiration);
        let segment_worker =
            SegmentSyncWorker::new(fetcher, segments.clone(), config.key.matching_key.clone())
                .with_cache_expiration(config.cache_expiration);

        SplitClient {
            evaluator: Evaluator::new(flags.clone(), segments.clone()),
            flags,
            segments,
            flag_worker: Arc::new(flag_worker),
            segment_worker: Arc::new(segment_worker),
            schedulers: None,
            config,
        }
    }

    /// Key this client evaluates flags for.
    pub fn key(&self) -> &Key {
        &self.config.key
    }

    /// Prime the caches from persistence and start the background schedulers.
    ///
    /// Does nothing if the client is already started.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if a scheduler thread failed to start.
    pub fn start(&mut self) -> Result<()> {
        if self.schedulers.is_some() {
            return Ok(());
        }
        self.prime();

        let flags = PollScheduler::start(
            self.flag_worker.clone(),
            SchedulerConfig::new()
                .with_interval(self.config.features_refresh_rate)
                .with_jitter(self.config.poll_jitter),
        )?;
        let segments = match PollScheduler::start(
            self.segment_worker.clone(),
            SchedulerConfig::new()
                .with_interval(self.config.segments_refresh_rate)
                .with_jitter(self.config.poll_jitter),
        ) {
            Ok(segments) => segments,
            Err(err) => {
                flags.stop();
                return Err(err.into());
            }
        };

        self.schedulers = Some(Schedulers { flags, segments });
        Ok(())
    }

    /// Stop the background schedulers, waiting for cycles in progress to finish, then persist the
    /// caches.
    ///
    /// # Errors
    ///
    /// - [`Error::SchedulerThreadPanicked`] if a scheduler thread panicked.
    /// - Any error returned by [`Persistence`](crate::Persistence).
    pub fn stop(&mut self) -> Result<()> {
        let Some(schedulers) = self.schedulers.take() else {
            return Ok(());
        };
        schedulers.flags.stop();
        schedulers.segments.stop();
        let flags = schedulers.flags.shutdown();
        let segments = schedulers.segments.shutdown();
        flags?;
        segments?;

        self.persist()
    }

    /// Discard incremental state and resync everything from scratch, bypassing intermediary
    /// caches. Runs immediately if the client is started, otherwise on the first cycle.
    pub fn force_refresh(&self) {
        match &self.schedulers {
            Some(schedulers) => {
                schedulers.flags.force_refresh();
                schedulers.segments.force_refresh();
            }
            None => {
                self.flag_worker.force_refresh();
                self.segment_worker.force_refresh();
            }
        }
    }

    /// Block until both flags and segment memberships have synced once.
    ///
    /// Returns immediately if the client is not started.
    ///
    /// # Errors
    ///
    /// - [`Error::Unauthorized`] if the SDK key was rejected.
    /// - [`Error::InvalidBaseUrl`]
    /// - [`Error::SchedulerThreadPanicked`]
    pub fn wait_for_first_sync(&self) -> Result<()> {
        let Some(schedulers) = &self.schedulers else {
            return Ok(());
        };
        schedulers.flags.wait_for_first_sync()?;
        schedulers.segments.wait_for_first_sync()
    }

    /// Get the treatment of `flag_name` for this client's key.
    ///
    /// Returns `"control"` if the flag is unknown or cannot be evaluated.
    ///
    /// # Examples
    ///
    /// ```
    /// # fn test(client: &split_core::SplitClient) {
    /// let treatment = client.get_treatment(
    ///     "new-checkout",
    ///     &[("age".to_owned(), 42.0.into())].into_iter().collect(),
    /// );
    /// # }
    /// ```
    pub fn get_treatment(&self, flag_name: &str, attributes: &Attributes) -> String {
        self.evaluate(flag_name, attributes).treatment
    }

    /// Get the treatment of `flag_name` and the configuration attached to it.
    pub fn get_treatment_with_config(
        &self,
        flag_name: &str,
        attributes: &Attributes,
    ) -> TreatmentWithConfig {
        let result = self.evaluate(flag_name, attributes);
        TreatmentWithConfig {
            treatment: result.treatment,
            config: result.config,
        }
    }

    /// Get treatments of several flags, evaluated against the same cache snapshot.
    pub fn get_treatments<S: AsRef<str>>(
        &self,
        flag_names: &[S],
        attributes: &Attributes,
    ) -> HashMap<String, String> {
        let key = &self.config.key;
        let results = self.evaluator.eval_treatments(
            &key.matching_key,
            key.bucketing_key.as_deref(),
            flag_names,
            Some(attributes),
        );
        self.collect_treatments(results, attributes)
    }

    /// Get treatments of every flag belonging to any of `flag_sets`.
    ///
    /// Invalid flag set names are ignored, as are names outside the configured
    /// [`ClientConfig::flag_sets_filter`].
    pub fn get_treatments_by_flag_sets<S: AsRef<str>>(
        &self,
        flag_sets: &[S],
        attributes: &Attributes,
    ) -> HashMap<String, String> {
        let filter = &self.config.flag_sets_filter;
        let flag_sets: Vec<String> = clean_flag_sets(flag_sets)
            .into_iter()
            .filter(|flag_set| {
                let allowed = filter.is_empty() || filter.contains(flag_set);
                if !allowed {
                    log::warn!(target: "split", flag_set; "flag set is not part of the configured filter, ignoring");
                }
                allowed
            })
            .collect();

        let key = &self.config.key;
        let results = self.evaluator.eval_treatments_by_flag_sets(
            &key.matching_key,
            key.bucketing_key.as_deref(),
            &flag_sets,
            Some(attributes),
        );
        self.collect_treatments(results, attributes)
    }

    /// The underlying evaluator, for evaluating other keys against the same caches.
    ///
    /// Segment memberships are only synchronized for this client's key.
    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    fn evaluate(&self, flag_name: &str, attributes: &Attributes) -> EvaluationResult {
        let key = &self.config.key;
        let result = self.evaluator.eval_treatment(
            &key.matching_key,
            key.bucketing_key.as_deref(),
            flag_name,
            Some(attributes),
        );
        self.log_impression(flag_name, &result, attributes);
        result
    }

    fn collect_treatments(
        &self,
        results: HashMap<String, EvaluationResult>,
        attributes: &Attributes,
    ) -> HashMap<String, String> {
        results
            .into_iter()
            .map(|(flag_name, result)| {
                self.log_impression(&flag_name, &result, attributes);
                (flag_name, result.treatment)
            })
            .collect()
    }

    fn log_impression(&self, flag_name: &str, result: &EvaluationResult, attributes: &Attributes) {
        if result.impressions_disabled || result.label == labels::DEFINITION_NOT_FOUND {
            return;
        }

        let key = &self.config.key;
        let impression = Impression {
            feature_flag: flag_name.to_owned(),
            key_name: key.matching_key.clone(),
            bucketing_key: key.bucketing_key.clone(),
            treatment: result.treatment.clone(),
            label: result.label.clone(),
            change_number: result.change_number,
            attributes: attributes.clone(),
            time: Utc::now(),
        };
        log::trace!(target: "split",
                    impression:serde;
                    "logging impression");
        self.config.impression_listener.log_impression(impression);
    }

    fn prime(&self) {
        let persistence = &self.config.persistence;
        let key = self.config.key.matching_key.as_str();

        match persistence.load_flags() {
            Ok(Some(snapshot)) if snapshot.flag_sets_filter() != &self.config.flag_sets_filter => {
                log::info!(target: "split",
                           change_number = snapshot.change_number();
                           "flag sets filter changed since flags were persisted, resyncing from scratch");
                self.flag_worker.force_refresh();
            }
            Ok(Some(snapshot)) => {
                log::debug!(target: "split", change_number = snapshot.change_number(); "primed flags from persistence");
                self.flags.prime(snapshot);
            }
            Ok(None) => {}
            Err(err) => log::warn!(target: "split", "failed to load persisted flags: {err}"),
        }

        match persistence.load_segments(key) {
            Ok(Some(membership)) => self.segments.prime(key, membership),
            Ok(None) => {}
            Err(err) => {
                log::warn!(target: "split", key; "failed to load persisted segment memberships: {err}")
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let persistence = &self.config.persistence;
        let key = self.config.key.matching_key.as_str();

        let snapshot = FlagSnapshot::clone(&self.flags.snapshot())
            .with_flag_sets_filter(self.config.flag_sets_filter.clone());
        persistence.persist_flags(&snapshot)?;
        if let Some(membership) = self.segments.snapshot().get(key) {
            persistence.persist_segments(key, membership)?;
        }
        Ok(())
    }
}
