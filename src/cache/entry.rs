//! Values and flush lists held by the memory backend
//!
//! Expiry uses the monotonic clock, so a wall-clock jump never resurrects a
//! tombstone or drops a live result early.

use crate::cache::types::{CacheKey, CacheValue, Ttl};
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// One stored value
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: CacheValue,

    /// `None` for `Ttl::Forever`
    pub expires_at: Option<Instant>,

    pub last_access: Instant,
    pub reads: u64,

    /// Approximate footprint counted against the backend's size limit
    pub size_bytes: usize,
}

impl CacheEntry {
    pub fn new(key: CacheKey, value: CacheValue, ttl: Ttl) -> Self {
        let size_bytes = footprint(&key, &value);

        Self {
            key,
            value,
            expires_at: deadline(ttl),
            last_access: Instant::now(),
            reads: 0,
            size_bytes,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left before expiry; `None` when it never expires
    pub fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn record_read(&mut self) {
        self.last_access = Instant::now();
        self.reads += 1;
    }
}

/// One flush list
#[derive(Debug, Clone)]
pub struct ListEntry {
    pub members: HashSet<String>,

    /// `None` once any member was added for `Ttl::Forever`
    pub expires_at: Option<Instant>,
}

impl ListEntry {
    pub fn new(ttl: Ttl) -> Self {
        Self {
            members: HashSet::new(),
            expires_at: deadline(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Push the expiry out so the list outlives a member cached for `ttl`.
    /// The expiry is never pulled in.
    pub fn extend(&mut self, ttl: Ttl) {
        let Some(current) = self.expires_at else {
            return;
        };
        match deadline(ttl) {
            None => self.expires_at = None,
            Some(at) if at > current => self.expires_at = Some(at),
            Some(_) => {}
        }
    }
}

// Durations too large for the clock are treated as forever
fn deadline(ttl: Ttl) -> Option<Instant> {
    ttl.as_duration()
        .and_then(|d| Instant::now().checked_add(d))
}

fn footprint(key: &str, value: &[u8]) -> usize {
    key.len() + value.len() + std::mem::size_of::<CacheEntry>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_footprint_covers_key_and_value() {
        let entry = CacheEntry::new(
            "q:abc".to_string(),
            b"rows".to_vec(),
            Ttl::After(Duration::from_secs(60)),
        );
        assert!(entry.size_bytes > "q:abc".len() + "rows".len());
        assert!(!entry.is_expired());
    }

    #[test]
    fn test_expiry() {
        let entry = CacheEntry::new(
            "k".to_string(),
            vec![0],
            Ttl::After(Duration::from_millis(50)),
        );
        assert!(entry.remaining().is_some_and(|d| d <= Duration::from_millis(50)));

        sleep(Duration::from_millis(80));
        assert!(entry.is_expired());
        assert_eq!(entry.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_forever() {
        let entry = CacheEntry::new("k".to_string(), vec![1], Ttl::Forever);
        assert!(!entry.is_expired());
        assert_eq!(entry.remaining(), None);
    }

    #[test]
    fn test_record_read() {
        let mut entry = CacheEntry::new("k".to_string(), vec![1], Ttl::Forever);
        let created = entry.last_access;
        sleep(Duration::from_millis(5));

        entry.record_read();
        entry.record_read();
        assert_eq!(entry.reads, 2);
        assert!(entry.last_access > created);
    }

    #[test]
    fn test_list_expiry_only_grows() {
        let mut list = ListEntry::new(Ttl::After(Duration::from_secs(60)));
        let first = list.expires_at;

        list.extend(Ttl::After(Duration::from_secs(1)));
        assert_eq!(list.expires_at, first);

        list.extend(Ttl::After(Duration::from_secs(120)));
        assert!(list.expires_at > first);

        list.extend(Ttl::Forever);
        assert_eq!(list.expires_at, None);
        list.extend(Ttl::After(Duration::from_secs(1)));
        assert_eq!(list.expires_at, None);
    }

    #[test]
    fn test_list_expires() {
        let list = ListEntry::new(Ttl::After(Duration::from_millis(20)));
        assert!(!list.is_expired());
        sleep(Duration::from_millis(40));
        assert!(list.is_expired());
    }
}
