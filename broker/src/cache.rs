use std::time::Duration;

use moka::sync::Cache;
use serde_json::Value;
use time::OffsetDateTime;

#[derive(Clone)]
struct CacheEntry {
    payload: Value,
    expires_at: OffsetDateTime,
}

/// Short-TTL cache for inspect results, bounding load on the runtime while
/// keeping dashboard data nearly live.
///
/// Entries carry their own expiry and are checked against the caller's
/// `now`, so staleness is deterministic under test; the moka layer bounds
/// capacity and evicts cold keys.
pub struct InspectCache {
    cache: Cache<String, CacheEntry>,
    ttl: Duration,
}

impl InspectCache {
    pub fn new(ttl: Duration, capacity: u64) -> Self {
        Self {
            // moka TTL is a backstop at twice the logical TTL; expiry
            // decisions use the per-entry deadline below
            cache: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl * 2)
                .build(),
            ttl,
        }
    }

    /// Returns the cached payload unless it has expired. An expired entry
    /// is never returned, whatever moka still holds.
    pub fn get(&self, key: &str, now: OffsetDateTime) -> Option<Value> {
        let entry = self.cache.get(key)?;
        if entry.expires_at > now {
            Some(entry.payload)
        } else {
            None
        }
    }

    pub fn insert(&self, key: String, payload: Value, now: OffsetDateTime) {
        let entry = CacheEntry {
            payload,
            expires_at: now + self.ttl,
        };
        self.cache.insert(key, entry);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use time::OffsetDateTime;

    use super::InspectCache;

    #[test]
    fn fresh_entries_are_served() {
        let cache = InspectCache::new(Duration::from_secs(3), 16);
        let now = OffsetDateTime::now_utc();
        cache.insert("web1".to_string(), json!([{"Id": "abc"}]), now);

        let hit = cache.get("web1", now + time::Duration::seconds(2));
        assert_eq!(hit, Some(json!([{"Id": "abc"}])));
    }

    #[test]
    fn expired_entries_are_never_served() {
        let cache = InspectCache::new(Duration::from_secs(3), 16);
        let now = OffsetDateTime::now_utc();
        cache.insert("web1".to_string(), json!([{"Id": "abc"}]), now);

        assert_eq!(cache.get("web1", now + time::Duration::seconds(3)), None);
        assert_eq!(cache.get("web1", now + time::Duration::seconds(30)), None);
    }

    #[test]
    fn unknown_keys_miss() {
        let cache = InspectCache::new(Duration::from_secs(3), 16);
        assert_eq!(cache.get("web1", OffsetDateTime::now_utc()), None);
    }

    #[test]
    fn reinsert_refreshes_expiry() {
        let cache = InspectCache::new(Duration::from_secs(3), 16);
        let now = OffsetDateTime::now_utc();
        cache.insert("web1".to_string(), json!(1), now);

        let later = now + time::Duration::seconds(3);
        assert_eq!(cache.get("web1", later), None);

        cache.insert("web1".to_string(), json!(2), later);
        assert_eq!(cache.get("web1", later + time::Duration::seconds(1)), Some(json!(2)));
    }
}
