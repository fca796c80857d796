use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

pub const DEFAULT_FAILURE_TTL: Duration = Duration::from_secs(30 * 60);

/// Negative cache of remote URLs whose transfer recently failed.
///
/// Only checksum-sibling fetches consult it; a primary resource is always
/// attempted and its failures are left to the download-error policies.
#[derive(Debug)]
pub struct UrlFailureCache {
    ttl: Duration,
    entries: DashMap<String, Instant>,
}

impl UrlFailureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: DashMap::new(),
        }
    }

    pub fn cache_failure(&self, url: &str) {
        debug!(url, "caching transfer failure");
        self.entries.insert(url.to_string(), Instant::now());
    }

    pub fn has_failed_recently(&self, url: &str) -> bool {
        let failed_at = match self.entries.get(url) {
            Some(entry) => *entry.value(),
            None => return false,
        };
        if failed_at.elapsed() < self.ttl {
            return true;
        }
        self.entries
            .remove_if(url, |_, at| at.elapsed() >= self.ttl);
        false
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for UrlFailureCache {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_TTL)
    }
}
