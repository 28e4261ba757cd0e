//! Host-keyed cookie cache for the RPA collector.
//!
//! Lives for the worker process only; constructed at startup and passed
//! by reference, never a module-level global. A successful credentialed
//! login saves its cookies here so subsequent runs against the same host
//! skip the login sequence. Entries expire 24 hours after saving; there
//! is no disk persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::config::CookieSpec;

/// Cached cookies stay fresh this long.
const SESSION_TTL_HOURS: i64 = 24;

struct SessionEntry {
    cookies: Vec<CookieSpec>,
    saved_at: DateTime<Utc>,
}

/// Process-wide login session store, keyed by host.
#[derive(Default)]
pub struct SessionCache {
    entries: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save cookies for a host, replacing any previous entry.
    pub fn save(&self, host: &str, cookies: Vec<CookieSpec>) {
        debug!(host = %host, cookies = cookies.len(), "saving session cookies");
        let mut entries = self.entries.lock().expect("session cache lock poisoned");
        entries.insert(
            host.to_string(),
            SessionEntry {
                cookies,
                saved_at: Utc::now(),
            },
        );
    }

    /// Load fresh cookies for a host. A stale entry is evicted and `None`
    /// is returned.
    pub fn load(&self, host: &str) -> Option<Vec<CookieSpec>> {
        self.load_at(host, Utc::now())
    }

    fn load_at(&self, host: &str, now: DateTime<Utc>) -> Option<Vec<CookieSpec>> {
        let mut entries = self.entries.lock().expect("session cache lock poisoned");
        match entries.get(host) {
            Some(entry) if now - entry.saved_at < Duration::hours(SESSION_TTL_HOURS) => {
                Some(entry.cookies.clone())
            }
            Some(_) => {
                debug!(host = %host, "session cookies expired, evicting");
                entries.remove(host);
                None
            }
            None => None,
        }
    }

    /// Drop every entry. Called on worker shutdown.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("session cache lock poisoned")
            .clear();
    }

    #[cfg(test)]
    fn backdate(&self, host: &str, age: Duration) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(host) {
            entry.saved_at -= age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cookie(name: &str) -> CookieSpec {
        CookieSpec {
            name: name.to_string(),
            value: "v".to_string(),
            domain: String::new(),
            path: String::new(),
        }
    }

    #[test]
    fn test_save_and_load() {
        let cache = SessionCache::new();
        cache.save("example.com", vec![cookie("sid")]);

        let loaded = cache.load("example.com").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "sid");
        assert!(cache.load("other.com").is_none());
    }

    #[test]
    fn test_stale_entry_is_evicted() {
        let cache = SessionCache::new();
        cache.save("example.com", vec![cookie("sid")]);
        cache.backdate("example.com", Duration::hours(25));

        assert!(cache.load("example.com").is_none());
        // Eviction, not just a miss: a second load also sees nothing.
        assert!(cache.load("example.com").is_none());
    }

    #[test]
    fn test_clear() {
        let cache = SessionCache::new();
        cache.save("a.com", vec![cookie("x")]);
        cache.save("b.com", vec![cookie("y")]);
        cache.clear();

        assert!(cache.load("a.com").is_none());
        assert!(cache.load("b.com").is_none());
    }
}
