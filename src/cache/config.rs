//! Configuration for the cache system

use crate::cache::types::Ttl;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do with cached queries when a new row is inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidateOnCreate {
    /// Creation only invalidates the new object's own flush list
    #[default]
    Off,

    /// Creation invalidates every cached query that touched the table
    WholeTable,
}

impl FromStr for InvalidateOnCreate {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "off" | "none" => Ok(InvalidateOnCreate::Off),
            "whole-table" | "whole-model" => Ok(InvalidateOnCreate::WholeTable),
            other => Err(CacheError::Config(format!(
                "invalidate_on_create must be one of: off, whole-table (got {:?})",
                other
            ))),
        }
    }
}

impl fmt::Display for InvalidateOnCreate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidateOnCreate::Off => write!(f, "off"),
            InvalidateOnCreate::WholeTable => write!(f, "whole-table"),
        }
    }
}

/// Configuration for the query cache
///
/// Constructed once at startup and shared by reference between the query
/// façade, the invalidator and the manual helper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Prefix prepended to every key
    pub prefix: String,

    /// Database alias folded into query keys so replicas don't share entries
    pub db_alias: String,

    /// Default lifetime of cached query results
    pub default_ttl: Ttl,

    /// TTL jitter factor (0.0 - 1.0), applied to finite TTLs only
    /// Adds random variation to prevent cache stampede
    pub ttl_jitter: f64,

    /// Lifetime of the sentinel written during invalidation
    pub tombstone_ttl: Duration,

    /// TTL for cached counts; `None` disables count caching
    pub count_timeout: Option<Duration>,

    /// Cache queries that return no rows
    pub cache_empty_results: bool,

    /// Invalidation policy on object creation
    pub invalidate_on_create: InvalidateOnCreate,

    /// When false, flush lists are never written and invalidation is skipped
    pub invalidation_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            db_alias: "default".to_string(),
            // 1 hour default TTL
            default_ttl: Ttl::After(Duration::from_secs(3600)),
            ttl_jitter: 0.1,
            tombstone_ttl: Duration::from_secs(5),
            count_timeout: None,
            cache_empty_results: false,
            invalidate_on_create: InvalidateOnCreate::Off,
            invalidation_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Load configuration from the environment (and a `.env` file if present)
    ///
    /// Recognised variables: `CACHE_PREFIX`, `CACHE_DB_ALIAS`,
    /// `CACHE_DEFAULT_TTL` (seconds, 0 = forever), `CACHE_COUNT_TIMEOUT`
    /// (seconds, 0 = disabled), `CACHE_EMPTY_QUERYSETS`,
    /// `CACHE_INVALIDATE_ON_CREATE`, `CACHE_MACHINE_NO_INVALIDATION`,
    /// `CACHE_TOMBSTONE_TTL` (seconds).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("CACHE_PREFIX") {
            config.prefix = prefix;
        }
        if let Some(alias) = lookup("CACHE_DB_ALIAS") {
            config.db_alias = alias;
        }
        if let Some(secs) = lookup("CACHE_DEFAULT_TTL") {
            config.default_ttl = Ttl::from_secs(parse_secs("CACHE_DEFAULT_TTL", &secs)?);
        }
        if let Some(secs) = lookup("CACHE_COUNT_TIMEOUT") {
            let secs = parse_secs("CACHE_COUNT_TIMEOUT", &secs)?;
            config.count_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(flag) = lookup("CACHE_EMPTY_QUERYSETS") {
            config.cache_empty_results = parse_bool(&flag);
        }
        if let Some(mode) = lookup("CACHE_INVALIDATE_ON_CREATE") {
            config.invalidate_on_create = mode.parse()?;
        }
        if let Some(flag) = lookup("CACHE_MACHINE_NO_INVALIDATION") {
            config.invalidation_enabled = !parse_bool(&flag);
        }
        if let Some(secs) = lookup("CACHE_TOMBSTONE_TTL") {
            config.tombstone_ttl =
                Duration::from_secs(parse_secs("CACHE_TOMBSTONE_TTL", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.prefix.chars().any(char::is_whitespace) {
            return Err(CacheError::Config(
                "prefix must not contain whitespace".to_string(),
            ));
        }

        if self.db_alias.is_empty() {
            return Err(CacheError::Config("db_alias must not be empty".to_string()));
        }

        if self.ttl_jitter < 0.0 || self.ttl_jitter > 1.0 {
            return Err(CacheError::Config(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.tombstone_ttl.is_zero() {
            return Err(CacheError::Config(
                "tombstone_ttl must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply jitter to a TTL. `Forever` is returned unchanged.
    pub fn ttl_with_jitter(&self, ttl: Ttl) -> Ttl {
        let base = match ttl {
            Ttl::Forever => return Ttl::Forever,
            Ttl::After(d) => d,
        };

        if self.ttl_jitter == 0.0 {
            return ttl;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(1.0);

        Ttl::After(Duration::from_secs_f64(final_secs))
    }

    /// Resolved TTL for cached counts, if count caching is enabled
    pub fn count_ttl(&self) -> Option<Ttl> {
        self.count_timeout.map(Ttl::After)
    }
}

fn parse_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| CacheError::Config(format!("{} must be a number of seconds: {}", name, e)))
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    prefix: Option<String>,
    db_alias: Option<String>,
    default_ttl: Option<Ttl>,
    ttl_jitter: Option<f64>,
    tombstone_ttl: Option<Duration>,
    count_timeout: Option<Option<Duration>>,
    cache_empty_results: Option<bool>,
    invalidate_on_create: Option<InvalidateOnCreate>,
    invalidation_enabled: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set the key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set the database alias folded into query keys
    pub fn db_alias(mut self, alias: impl Into<String>) -> Self {
        self.db_alias = Some(alias.into());
        self
    }

    /// Set default TTL for cached query results
    pub fn default_ttl(mut self, ttl: Ttl) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set tombstone lifetime
    pub fn tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = Some(ttl);
        self
    }

    /// Enable count caching with the given TTL (`None` disables it)
    pub fn count_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.count_timeout = Some(timeout);
        self
    }

    /// Cache queries that return no rows
    pub fn cache_empty_results(mut self, enable: bool) -> Self {
        self.cache_empty_results = Some(enable);
        self
    }

    /// Set invalidate-on-create policy
    pub fn invalidate_on_create(mut self, mode: InvalidateOnCreate) -> Self {
        self.invalidate_on_create = Some(mode);
        self
    }

    /// Enable or disable flush-list invalidation
    pub fn invalidation_enabled(mut self, enable: bool) -> Self {
        self.invalidation_enabled = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            prefix: self.prefix.unwrap_or(defaults.prefix),
            db_alias: self.db_alias.unwrap_or(defaults.db_alias),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            tombstone_ttl: self.tombstone_ttl.unwrap_or(defaults.tombstone_ttl),
            count_timeout: self.count_timeout.unwrap_or(defaults.count_timeout),
            cache_empty_results: self
                .cache_empty_results
                .unwrap_or(defaults.cache_empty_results),
            invalidate_on_create: self
                .invalidate_on_create
                .unwrap_or(defaults.invalidate_on_create),
            invalidation_enabled: self
                .invalidation_enabled
                .unwrap_or(defaults.invalidation_enabled),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Short-lived results for rapidly changing tables
    pub fn realtime() -> Self {
        Self {
            default_ttl: Ttl::After(Duration::from_secs(300)), // 5 minutes
            ttl_jitter: 0.15,
            ..Default::default()
        }
    }

    /// Results live until a write invalidates them
    pub fn until_invalidated() -> Self {
        Self {
            default_ttl: Ttl::Forever,
            ttl_jitter: 0.0,
            ..Default::default()
        }
    }
}
