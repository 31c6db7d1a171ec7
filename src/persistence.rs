//! Storage collaborator used to prime caches at start and save them at stop.
use crate::{flag_cache::FlagSnapshot, segment_cache::Membership, Result};

/// Durable storage for cache contents. Never consulted while evaluating.
///
/// [`FlagSnapshot`] and [`Membership`] implement `Serialize` and `Deserialize`, and carry the time
/// they were last synchronized, so a restored cache still expires on schedule.
pub trait Persistence: Send + Sync {
    /// Previously persisted flags, if any.
    fn load_flags(&self) -> Result<Option<FlagSnapshot>>;

    /// Save `snapshot`, replacing what was saved before.
    fn persist_flags(&self, snapshot: &FlagSnapshot) -> Result<()>;

    /// Previously persisted membership of `key`, if any.
    fn load_segments(&self, key: &str) -> Result<Option<Membership>>;

    /// Save the membership of `key`, replacing what was saved before.
    fn persist_segments(&self, key: &str, membership: &Membership) -> Result<()>;
}

/// Persistence that stores nothing.
pub(crate) struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn load_flags(&self) -> Result<Option<FlagSnapshot>> {
        Ok(None)
    }

    fn persist_flags(&self, _snapshot: &FlagSnapshot) -> Result<()> {
        Ok(())
    }

    fn load_segments(&self, _key: &str) -> Result<Option<Membership>> {
        Ok(None)
    }

    fn persist_segments(&self, _key: &str, _membership: &Membership) -> Result<()> {
        Ok(())
    }
}
