use std::time::Duration;

use time::OffsetDateTime;

/// Single-slot credential cache with an absolute expiry.
///
/// A secret is never served once `now` passes its expiry; the slot is simply
/// cleared and the caller recomputes lazily.
#[derive(Debug, Default)]
pub struct CredentialCache {
    slot: Option<CachedSecret>,
}

#[derive(Debug, Clone)]
struct CachedSecret {
    secret: String,
    expires_at: OffsetDateTime,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, now: OffsetDateTime) -> Option<String> {
        match &self.slot {
            Some(cached) if cached.expires_at > now => Some(cached.secret.clone()),
            Some(_) => {
                self.slot = None;
                None
            }
            None => None,
        }
    }

    pub fn put(&mut self, secret: String, ttl: Duration, now: OffsetDateTime) {
        self.slot = Some(CachedSecret {
            secret,
            expires_at: now + ttl,
        });
    }

    pub fn clear(&mut self) {
        self.slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_until_expiry() {
        let mut cache = CredentialCache::new();
        let now = OffsetDateTime::now_utc();
        cache.put("tok".into(), Duration::from_secs(300), now);
        assert_eq!(cache.get(now), Some("tok".to_string()));
        assert_eq!(
            cache.get(now + Duration::from_secs(299)),
            Some("tok".to_string())
        );
    }

    #[test]
    fn never_serves_past_expiry() {
        let mut cache = CredentialCache::new();
        let now = OffsetDateTime::now_utc();
        cache.put("tok".into(), Duration::from_secs(10), now);
        assert_eq!(cache.get(now + Duration::from_secs(10)), None);
        // Slot is dropped once it has lapsed.
        assert_eq!(cache.get(now), None);
    }

    #[test]
    fn clear_empties_the_slot() {
        let mut cache = CredentialCache::new();
        let now = OffsetDateTime::now_utc();
        cache.put("tok".into(), Duration::from_secs(10), now);
        cache.clear();
        assert_eq!(cache.get(now), None);
    }
}
