//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Cache key type - derived by the key codec, never stored on its own
pub type CacheKey = String;

/// Raw cached payload
pub type CacheValue = Vec<u8>;

/// Lifetime of a stored entry.
///
/// `Forever` keeps the entry until it is explicitly invalidated. "Do not
/// cache" is not a TTL and never reaches the store; see
/// [`CacheTimeout::NoCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ttl {
    /// Cache indefinitely
    Forever,

    /// Expire after the given duration
    After(Duration),
}

impl Ttl {
    /// Interpret a number of seconds the way cache configuration does:
    /// `0` means forever.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            Ttl::Forever
        } else {
            Ttl::After(Duration::from_secs(secs))
        }
    }

    /// The finite duration, if any
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Ttl::Forever => None,
            Ttl::After(d) => Some(*d),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Forever => write!(f, "forever"),
            Ttl::After(d) => write!(f, "{}s", d.as_secs_f64()),
        }
    }
}

/// Per-call timeout override for cached queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheTimeout {
    /// Use the configured default TTL
    #[default]
    Default,

    /// Cache until invalidated
    Forever,

    /// Cache for the given duration
    After(Duration),

    /// Bypass the cache entirely for this call
    NoCache,
}

impl CacheTimeout {
    /// Resolve against the configured default. `None` means do not cache.
    pub fn resolve(self, default: Ttl) -> Option<Ttl> {
        match self {
            CacheTimeout::Default => Some(default),
            CacheTimeout::Forever => Some(Ttl::Forever),
            CacheTimeout::After(d) if d.is_zero() => Some(Ttl::Forever),
            CacheTimeout::After(d) => Some(Ttl::After(d)),
            CacheTimeout::NoCache => None,
        }
    }

    /// Whether caching is disabled for this call
    pub fn is_no_cache(&self) -> bool {
        matches!(self, CacheTimeout::NoCache)
    }
}

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Number of entries currently in cache
    pub entries: usize,

    /// Number of flush lists currently held
    pub lists: usize,

    /// Total size of cached data in bytes
    pub size_bytes: usize,

    /// Number of evictions due to size limits
    pub evictions_size: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of explicit deletions and drained lists
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, lists: {}, size: {} bytes, evictions: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.lists,
            self.size_bytes,
            self.total_evictions()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_from_secs() {
        assert_eq!(Ttl::from_secs(0), Ttl::Forever);
        assert_eq!(Ttl::from_secs(60), Ttl::After(Duration::from_secs(60)));
        assert_eq!(Ttl::Forever.as_duration(), None);
    }

    #[test]
    fn test_timeout_resolution() {
        let default = Ttl::After(Duration::from_secs(300));

        assert_eq!(CacheTimeout::Default.resolve(default), Some(default));
        assert_eq!(CacheTimeout::Forever.resolve(default), Some(Ttl::Forever));
        assert_eq!(
            CacheTimeout::After(Duration::ZERO).resolve(default),
            Some(Ttl::Forever)
        );
        assert_eq!(
            CacheTimeout::After(Duration::from_secs(12)).resolve(default),
            Some(Ttl::After(Duration::from_secs(12)))
        );
        assert_eq!(CacheTimeout::NoCache.resolve(default), None);
    }

    #[test]
    fn test_cache_stats_hit_rate() {
        let mut stats = CacheStats::default();
        stats.hits = 80;
        stats.misses = 20;

        assert_eq!(stats.hit_rate(), 80.0);
        assert_eq!(stats.miss_rate(), 20.0);
    }

    #[test]
    fn test_cache_stats_zero_requests() {
        let stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.miss_rate(), 100.0);
    }

    #[test]
    fn test_cache_stats_display() {
        let stats = CacheStats {
            hits: 100,
            misses: 50,
            entries: 75,
            lists: 4,
            size_bytes: 1024,
            evictions_size: 10,
            evictions_ttl: 5,
            invalidations: 3,
        };

        let display = format!("{}", stats);
        assert!(display.contains("hits: 100"));
        assert!(display.contains("lists: 4"));
    }
}
