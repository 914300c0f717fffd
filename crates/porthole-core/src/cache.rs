//! TTL memoization of target existence checks.
//!
//! Discovery backends are slow and rate-limited compared to how often a
//! frontend asks "is this target still there". Answers are cached for a
//! fixed window, negative answers the same as positive ones. A failed
//! query is surfaced to the caller and leaves no entry behind, so the
//! next lookup asks again.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::exec::{TargetDiscovery, TargetRef};

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    exists: bool,
    checked_at: Instant,
}

pub struct ExistenceCache {
    discovery: Arc<dyn TargetDiscovery>,
    ttl: Duration,
    entries: DashMap<TargetRef, CacheEntry>,
}

impl ExistenceCache {
    pub fn new(discovery: Arc<dyn TargetDiscovery>, ttl: Duration) -> Self {
        Self {
            discovery,
            ttl,
            entries: DashMap::new(),
        }
    }

    /// Whether the target exists, asking the backend at most once per TTL
    /// window per target.
    pub async fn exists(&self, target: &TargetRef) -> Result<bool> {
        {
            // the map guard must not live across the query await
            if let Some(entry) = self.entries.get(target) {
                if entry.checked_at.elapsed() < self.ttl {
                    return Ok(entry.exists);
                }
            }
        }
        let checked_at = Instant::now();
        let exists = self.discovery.query(target).await?;
        debug!("existence of {} refreshed: {}", target, exists);
        self.entries
            .entry(target.clone())
            .and_modify(|entry| {
                // concurrent refreshes race; keep the newer answer
                if checked_at >= entry.checked_at {
                    *entry = CacheEntry { exists, checked_at };
                }
            })
            .or_insert(CacheEntry { exists, checked_at });
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::exec::mock::{CountingDiscovery, QueryScript};

    fn target() -> TargetRef {
        TargetRef::new("default", "web-0")
    }

    #[tokio::test]
    async fn repeat_lookups_within_ttl_hit_the_cache() {
        let discovery = CountingDiscovery::new();
        discovery.script_query(QueryScript::Exists(true));
        let cache = ExistenceCache::new(discovery.clone(), Duration::from_secs(300));
        assert!(cache.exists(&target()).await.unwrap());
        assert!(cache.exists(&target()).await.unwrap());
        assert_eq!(discovery.calls(), 1);
    }

    #[tokio::test]
    async fn negative_answers_are_cached_too() {
        let discovery = CountingDiscovery::new();
        discovery.script_query(QueryScript::Exists(false));
        let cache = ExistenceCache::new(discovery.clone(), Duration::from_secs(300));
        assert!(!cache.exists(&target()).await.unwrap());
        assert!(!cache.exists(&target()).await.unwrap());
        assert_eq!(discovery.calls(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_refreshed() {
        let discovery = CountingDiscovery::new();
        discovery.script_query(QueryScript::Exists(true));
        discovery.script_query(QueryScript::Exists(false));
        let cache = ExistenceCache::new(discovery.clone(), Duration::from_millis(20));
        assert!(cache.exists(&target()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!cache.exists(&target()).await.unwrap());
        assert_eq!(discovery.calls(), 2);
    }

    #[tokio::test]
    async fn failures_are_surfaced_and_never_cached() {
        let discovery = CountingDiscovery::new();
        discovery.script_query(QueryScript::Fail);
        discovery.script_query(QueryScript::Exists(true));
        let cache = ExistenceCache::new(discovery.clone(), Duration::from_secs(300));

        let err = cache.exists(&target()).await.unwrap_err();
        assert!(matches!(err, Error::QueryFailed(_)));

        // the failure left nothing behind, so the next call queries again
        assert!(cache.exists(&target()).await.unwrap());
        assert_eq!(discovery.calls(), 2);

        // and that answer is cached
        assert!(cache.exists(&target()).await.unwrap());
        assert_eq!(discovery.calls(), 2);
    }

    #[tokio::test]
    async fn distinct_targets_do_not_share_entries() {
        let discovery = CountingDiscovery::new();
        discovery.script_query(QueryScript::Exists(true));
        discovery.script_query(QueryScript::Exists(false));
        let cache = ExistenceCache::new(discovery.clone(), DEFAULT_TTL);
        assert!(cache.exists(&TargetRef::new("default", "a")).await.unwrap());
        assert!(!cache.exists(&TargetRef::new("default", "b")).await.unwrap());
        assert_eq!(discovery.calls(), 2);
    }
}
