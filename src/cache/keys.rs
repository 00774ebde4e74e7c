//! Key codec: deterministic mapping from queries and object identities to
//! cache keys
//!
//! Key layout, with `{p}` the configured prefix:
//!
//! | key                  | format                    |
//! |----------------------|---------------------------|
//! | query result         | `{p}:q:{sha256}`          |
//! | cached count         | `{p}:c:{sha256}`          |
//! | manual entry         | `{p}:f:{sha256}`          |
//! | object record        | `{p}:r:{table}:{pk}::db:{alias}` |
//! | object flush list    | `{p}:o:{table}:{pk}`      |
//! | table flush list     | `{p}:m:{table}`           |
//! | query flush list     | `{p}:qf:{sha256}`         |
//!
//! ## Normalization
//!
//! Query text is normalized before hashing:
//! - leading and trailing whitespace is trimmed
//! - every run of whitespace outside quoted literals (`'...'`, `"..."`)
//!   becomes a single space
//! - literal contents and letter case are preserved
//!
//! Parameters are appended in the order given, each as `{index}={value}`
//! behind a unit separator, so the same SQL with different values (or the
//! same values in a different order) produces a different key.
//!
//! ## Identities
//!
//! Table names may not contain `:`. The primary key is always the last
//! segment of an object key, so it may, and `("a", "1:2")` stays distinct
//! from `("a:1", "2")`.

use crate::cache::config::CacheConfig;
use crate::cache::types::CacheKey;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a row: table plus primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub table: String,
    pub pk: String,
}

impl ObjectRef {
    pub fn new(table: impl Into<String>, pk: impl ToString) -> Self {
        Self {
            table: table.into(),
            pk: pk.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table, self.pk)
    }
}

/// Normalized representation of a query: SQL text plus bound parameters
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryFingerprint {
    sql: String,
    params: Vec<String>,
}

impl QueryFingerprint {
    /// Create a fingerprint from SQL text
    pub fn new(sql: impl AsRef<str>) -> Self {
        Self {
            sql: normalize_sql(sql.as_ref()),
            params: Vec::new(),
        }
    }

    /// Bind the next positional parameter
    pub fn param(mut self, value: impl fmt::Display) -> Self {
        self.params.push(value.to_string());
        self
    }

    /// Bind several positional parameters
    pub fn params<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        self.params.extend(values.into_iter().map(|v| v.to_string()));
        self
    }

    /// The normalized SQL text
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Canonical text hashed into the key
    pub fn normalized(&self) -> String {
        let mut out = self.sql.clone();
        for (i, value) in self.params.iter().enumerate() {
            out.push('\u{1f}');
            out.push_str(&format!("{}={}", i, value));
        }
        out
    }
}

impl From<&str> for QueryFingerprint {
    fn from(sql: &str) -> Self {
        QueryFingerprint::new(sql)
    }
}

impl From<String> for QueryFingerprint {
    fn from(sql: String) -> Self {
        QueryFingerprint::new(sql)
    }
}

impl fmt::Display for QueryFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.sql)
        } else {
            write!(f, "{} [{}]", self.sql, self.params.join(", "))
        }
    }
}

/// Collapse whitespace outside quoted literals
pub fn normalize_sql(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<char> = None;
    let mut pending_space = false;

    for c in sql.trim().chars() {
        match quote {
            Some(q) => {
                out.push(c);
                if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => pending_space = true,
            None => {
                if pending_space {
                    out.push(' ');
                    pending_space = false;
                }
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                out.push(c);
            }
        }
    }

    out
}

fn digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn check_part(what: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CacheError::InvalidIdentity(format!("{} is empty", what)));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::InvalidIdentity(format!(
            "{} {:?} contains whitespace or control characters",
            what, value
        )));
    }
    Ok(())
}

fn check_table(table: &str) -> Result<()> {
    check_part("table", table)?;
    if table.contains(':') {
        return Err(CacheError::InvalidIdentity(format!(
            "table {:?} contains ':'",
            table
        )));
    }
    Ok(())
}

/// Derives every key the cache uses. Pure: no I/O, no state beyond the
/// configured prefix and database alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
    db_alias: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>, db_alias: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            db_alias: db_alias.into(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.prefix.clone(), config.db_alias.clone())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Same codec bound to another database alias
    pub fn with_db_alias(&self, alias: impl Into<String>) -> Self {
        Self::new(self.prefix.clone(), alias)
    }

    /// Key under which a query's result set is stored
    pub fn query_key(&self, fingerprint: &QueryFingerprint) -> CacheKey {
        let base = format!("qs:{}::db:{}", fingerprint.normalized(), self.db_alias);
        format!("{}:q:{}", self.prefix, digest(&base))
    }

    /// Flush list attached to a query, independent of database alias
    pub fn query_flush_key(&self, fingerprint: &QueryFingerprint) -> CacheKey {
        format!("{}:qf:{}", self.prefix, digest(&fingerprint.normalized()))
    }

    /// Key for a cached count over a query
    pub fn count_key(&self, fingerprint: &QueryFingerprint) -> CacheKey {
        let base = format!("count:{}::db:{}", fingerprint.normalized(), self.db_alias);
        format!("{}:c:{}", self.prefix, digest(&base))
    }

    /// Namespaced key for a manually cached value
    pub fn function_key(&self, name: &str) -> CacheKey {
        format!("{}:f:{}", self.prefix, digest(name))
    }

    /// Flush list of a single object
    pub fn object_key(&self, table: &str, pk: &str) -> Result<CacheKey> {
        check_table(table)?;
        check_part("primary key", pk)?;
        Ok(format!("{}:o:{}:{}", self.prefix, table, pk))
    }

    /// Flush list key for an [`ObjectRef`]
    pub fn object_ref_key(&self, object: &ObjectRef) -> Result<CacheKey> {
        self.object_key(&object.table, &object.pk)
    }

    /// Key of an individually cached object record
    pub fn record_key(&self, table: &str, pk: &str) -> Result<CacheKey> {
        check_table(table)?;
        check_part("primary key", pk)?;
        Ok(format!("{}:r:{}:{}::db:{}", self.prefix, table, pk, self.db_alias))
    }

    /// Flush list covering every cached query that touched `table`
    pub fn model_flush_key(&self, table: &str) -> Result<CacheKey> {
        check_table(table)?;
        Ok(format!("{}:m:{}", self.prefix, table))
    }

    /// Whether `key` names a flush list (as opposed to a cached value)
    pub fn is_flush_key(&self, key: &str) -> bool {
        key.strip_prefix(self.prefix.as_str())
            .map(|rest| {
                rest.starts_with(":o:") || rest.starts_with(":m:") || rest.starts_with(":qf:")
            })
            .unwrap_or(false)
    }
}

impl Default for KeyCodec {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> KeyCodec {
        KeyCodec::new("test", "default")
    }

    #[test]
    fn test_normalize_collapses_whitespace() {
        assert_eq!(
            normalize_sql("  SELECT *\n  FROM widgets\tWHERE id = 1  "),
            "SELECT * FROM widgets WHERE id = 1"
        );
    }

    #[test]
    fn test_normalize_preserves_literals() {
        assert_eq!(
            normalize_sql("SELECT * FROM t WHERE name = 'a   b'"),
            "SELECT * FROM t WHERE name = 'a   b'"
        );
        assert_eq!(
            normalize_sql("SELECT \"odd  column\"  FROM t"),
            "SELECT \"odd  column\" FROM t"
        );
        assert_eq!(
            normalize_sql("SELECT 'it''s   here'   FROM t"),
            "SELECT 'it''s   here' FROM t"
        );
    }

    #[test]
    fn test_equivalent_queries_share_key() {
        let a = QueryFingerprint::new("SELECT * FROM widgets WHERE color = $1").param("red");
        let b = QueryFingerprint::new("SELECT *\n FROM   widgets WHERE color = $1").param("red");
        assert_eq!(codec().query_key(&a), codec().query_key(&b));
    }

    #[test]
    fn test_different_params_differ() {
        let red = QueryFingerprint::new("SELECT * FROM widgets WHERE color = $1").param("red");
        let blue = QueryFingerprint::new("SELECT * FROM widgets WHERE color = $1").param("blue");
        assert_ne!(codec().query_key(&red), codec().query_key(&blue));

        let ab = QueryFingerprint::new("SELECT $1, $2").params(["a", "b"]);
        let ba = QueryFingerprint::new("SELECT $1, $2").params(["b", "a"]);
        assert_ne!(codec().query_key(&ab), codec().query_key(&ba));
    }

    #[test]
    fn test_distinct_literal_predicates_differ() {
        let keys: std::collections::HashSet<_> = (0..500)
            .map(|i| {
                codec().query_key(&QueryFingerprint::new(format!(
                    "SELECT * FROM widgets WHERE id = {}",
                    i
                )))
            })
            .collect();
        assert_eq!(keys.len(), 500);
    }

    #[test]
    fn test_query_key_format() {
        let key = codec().query_key(&"SELECT 1".into());
        assert!(key.starts_with("test:q:"));
        assert_eq!(key.len(), "test:q:".len() + 64);
    }

    #[test]
    fn test_db_alias_separates_query_keys() {
        let fp = QueryFingerprint::new("SELECT * FROM widgets");
        let primary = codec();
        let replica = primary.with_db_alias("replica");

        assert_ne!(primary.query_key(&fp), replica.query_key(&fp));
        assert_eq!(primary.query_flush_key(&fp), replica.query_flush_key(&fp));
        assert_eq!(
            primary.object_key("widgets", "1").unwrap(),
            replica.object_key("widgets", "1").unwrap()
        );
    }

    #[test]
    fn test_object_key() {
        assert_eq!(codec().object_key("widget", "2").unwrap(), "test:o:widget:2");
        assert_eq!(
            codec().object_ref_key(&ObjectRef::new("widget", 2)).unwrap(),
            "test:o:widget:2"
        );
    }

    #[test]
    fn test_invalid_identity() {
        assert!(matches!(
            codec().object_key("widget", ""),
            Err(CacheError::InvalidIdentity(_))
        ));
        assert!(matches!(
            codec().object_key("", "1"),
            Err(CacheError::InvalidIdentity(_))
        ));
        assert!(codec().object_key("wid get", "1").is_err());
        assert!(codec().model_flush_key("").is_err());
    }

    #[test]
    fn test_colon_in_table_rejected() {
        let c = codec();
        assert!(matches!(
            c.object_key("a:1", "2"),
            Err(CacheError::InvalidIdentity(_))
        ));
        assert!(c.record_key("a:1", "2").is_err());
        assert!(c.model_flush_key("a:1").is_err());

        // A colon in the primary key cannot be confused with a table boundary
        assert_eq!(c.object_key("a", "1:2").unwrap(), "test:o:a:1:2");
        assert_ne!(
            c.object_key("a", "1:2").unwrap(),
            c.object_key("a", "1").unwrap()
        );
    }

    #[test]
    fn test_is_flush_key() {
        let c = codec();
        assert!(c.is_flush_key(&c.object_key("widget", "1").unwrap()));
        assert!(c.is_flush_key(&c.model_flush_key("widget").unwrap()));
        assert!(c.is_flush_key(&c.query_flush_key(&"SELECT 1".into())));
        assert!(!c.is_flush_key(&c.query_key(&"SELECT 1".into())));
        assert!(!c.is_flush_key(&c.function_key("stats:total")));
    }

    #[test]
    fn test_empty_prefix() {
        let c = KeyCodec::new("", "default");
        assert_eq!(c.object_key("widget", "1").unwrap(), ":o:widget:1");
        assert!(c.is_flush_key(":o:widget:1"));
    }
}
