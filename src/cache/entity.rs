//! Capability trait for rows the query cache can store and invalidate

use crate::cache::keys::ObjectRef;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};

/// A row type that can participate in query caching.
///
/// Implemented by whatever the data-access layer materializes. The cache
/// needs a stable table name, a primary key, and the rows this one points to
/// through foreign keys.
pub trait CacheableEntity {
    /// Table the row belongs to
    fn table(&self) -> &str;

    /// Primary key; `None` for rows that were never persisted
    fn primary_key(&self) -> Option<String>;

    /// Rows referenced through foreign keys (`None` values omitted)
    fn references(&self) -> Vec<ObjectRef> {
        Vec::new()
    }

    /// Identity snapshot used by invalidation
    fn identity(&self) -> Result<EntityIdentity> {
        let pk = self.primary_key().ok_or_else(|| {
            CacheError::InvalidIdentity(format!("{} row has no primary key", self.table()))
        })?;
        Ok(EntityIdentity {
            object: ObjectRef::new(self.table(), pk),
            references: self.references(),
        })
    }
}

/// Identity of a written row plus its foreign-key targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityIdentity {
    pub object: ObjectRef,
    pub references: Vec<ObjectRef>,
}

impl EntityIdentity {
    pub fn new(table: impl Into<String>, pk: impl ToString) -> Self {
        Self {
            object: ObjectRef::new(table, pk),
            references: Vec::new(),
        }
    }

    /// Add a foreign-key target
    pub fn references(mut self, table: impl Into<String>, pk: impl ToString) -> Self {
        self.references.push(ObjectRef::new(table, pk));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Addon {
        id: Option<u64>,
        author: u64,
    }

    impl CacheableEntity for Addon {
        fn table(&self) -> &str {
            "addon"
        }

        fn primary_key(&self) -> Option<String> {
            self.id.map(|id| id.to_string())
        }

        fn references(&self) -> Vec<ObjectRef> {
            vec![ObjectRef::new("user", self.author)]
        }
    }

    #[test]
    fn test_identity() {
        let addon = Addon {
            id: Some(1),
            author: 7,
        };
        let identity = addon.identity().unwrap();
        assert_eq!(
            identity,
            EntityIdentity::new("addon", 1).references("user", 7)
        );
    }

    #[test]
    fn test_identity_without_pk() {
        let addon = Addon { id: None, author: 7 };
        assert!(matches!(addon.identity(), Err(CacheError::InvalidIdentity(_))));
    }
}
