use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::sync::{watch, RwLock};

use crate::lifecycle::JobCallAuthData;

const CLEAN_UP_PERIOD: Duration = Duration::from_secs(60);

/// Cache of Lifecycle authorization responses with two freshness windows:
/// entries younger than `ttl_min` are served normally, entries up to
/// `ttl_max` are served only to bridge a Lifecycle outage.
pub struct LifecycleCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    ttl_min: Duration,
    ttl_max: Duration,
}

/// Tokens are hashed so cache keys never hold credential bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    job_name: String,
    job_version: String,
    endpoint: String,
    auth_token_hash: [u8; 32],
}

struct CacheEntry {
    auth_data: JobCallAuthData,
    created_at: Instant,
}

impl CacheKey {
    fn new(job_name: &str, job_version: &str, endpoint: &str, auth_token: &str) -> Self {
        Self {
            job_name: job_name.to_string(),
            job_version: job_version.to_string(),
            endpoint: endpoint.to_string(),
            auth_token_hash: Sha256::digest(auth_token.as_bytes()).into(),
        }
    }
}

impl LifecycleCache {
    pub fn new(ttl_min: Duration, ttl_max: Duration, shutdown_rx: watch::Receiver<bool>) -> Arc<Self> {
        let cache = Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            ttl_min,
            ttl_max,
        });
        tokio::spawn(clean_up_loop(cache.clone(), shutdown_rx));
        cache
    }

    pub async fn put(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
        auth_token: &str,
        auth_data: JobCallAuthData,
    ) {
        let key = CacheKey::new(job_name, job_version, endpoint, auth_token);
        let entry = CacheEntry {
            auth_data,
            created_at: Instant::now(),
        };
        self.entries.write().await.insert(key, entry);
    }

    /// Return a hit only within the normal freshness window.
    pub async fn retrieve(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
        auth_token: &str,
    ) -> Option<JobCallAuthData> {
        let key = CacheKey::new(job_name, job_version, endpoint, auth_token);
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.created_at.elapsed() <= self.ttl_min {
            Some(entry.auth_data.clone())
        } else {
            None
        }
    }

    /// Recover a stale entry after a failed Lifecycle call. Entries beyond
    /// the stale-serve window are evicted.
    pub async fn recover_failed(
        &self,
        job_name: &str,
        job_version: &str,
        endpoint: &str,
        auth_token: &str,
    ) -> Option<JobCallAuthData> {
        let key = CacheKey::new(job_name, job_version, endpoint, auth_token);
        let mut entries = self.entries.write().await;
        let entry = entries.get(&key)?;
        if entry.created_at.elapsed() <= self.ttl_max {
            Some(entry.auth_data.clone())
        } else {
            entries.remove(&key);
            None
        }
    }

    async fn clean_up(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.created_at.elapsed() <= self.ttl_max);
    }
}

async fn clean_up_loop(cache: Arc<LifecycleCache>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(CLEAN_UP_PERIOD) => {}
            _ = shutdown_rx.changed() => return,
        }
        cache.clean_up().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::JobDetails;

    fn auth_data(caller: &str) -> JobCallAuthData {
        JobCallAuthData {
            job: Some(JobDetails {
                name: "adder".to_string(),
                version: "0.0.1".to_string(),
                status: "running".to_string(),
                internal_name: "adder-v-0-0-1".to_string(),
                infrastructure_target: String::new(),
            }),
            caller: Some(caller.to_string()),
            remote_gateway_url: None,
            remote_gateway_token: None,
        }
    }

    #[tokio::test]
    async fn fresh_entry_is_retrieved() {
        let (_tx, rx) = watch::channel(false);
        let cache = LifecycleCache::new(Duration::from_secs(60), Duration::from_secs(600), rx);
        cache
            .put("adder", "latest", "/api/v1/perform", "secret", auth_data("bob"))
            .await;

        let hit = cache
            .retrieve("adder", "latest", "/api/v1/perform", "secret")
            .await;
        assert_eq!(hit.unwrap().caller.as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn different_token_misses() {
        let (_tx, rx) = watch::channel(false);
        let cache = LifecycleCache::new(Duration::from_secs(60), Duration::from_secs(600), rx);
        cache
            .put("adder", "latest", "/api/v1/perform", "secret", auth_data("bob"))
            .await;

        let hit = cache
            .retrieve("adder", "latest", "/api/v1/perform", "other")
            .await;
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn expired_entry_recoverable_only_within_max_ttl() {
        let (_tx, rx) = watch::channel(false);
        // ttl_min of zero: every entry is immediately stale but recoverable.
        let cache = LifecycleCache::new(Duration::ZERO, Duration::from_secs(600), rx);
        cache
            .put("adder", "latest", "/api/v1/perform", "secret", auth_data("bob"))
            .await;

        let fresh = cache
            .retrieve("adder", "latest", "/api/v1/perform", "secret")
            .await;
        assert!(fresh.is_none());

        let stale = cache
            .recover_failed("adder", "latest", "/api/v1/perform", "secret")
            .await;
        assert!(stale.is_some());
    }

    #[tokio::test]
    async fn entry_beyond_max_ttl_is_evicted_on_recovery() {
        let (_tx, rx) = watch::channel(false);
        let cache = LifecycleCache::new(Duration::ZERO, Duration::ZERO, rx);
        cache
            .put("adder", "latest", "/api/v1/perform", "secret", auth_data("bob"))
            .await;

        // Instant::elapsed() is non-zero by the time we query, so a zero
        // ttl_max has always passed.
        let stale = cache
            .recover_failed("adder", "latest", "/api/v1/perform", "secret")
            .await;
        assert!(stale.is_none());
        assert!(cache.entries.read().await.is_empty());
    }
}
