//! Redis backend
//!
//! Values map to plain strings with `SET`/`SET EX`; flush lists map to Redis
//! sets, so membership is deduplicated server side and a drain is a single
//! `MULTI` block. A list's expiry is pushed out to its longest-lived member.

use crate::cache::{
    backend::CacheBackend,
    types::{CacheKey, CacheValue, Ttl},
};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands};
use std::fmt;
use tracing::{info, warn};

/// Redis-backed cache store
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend").finish_non_exhaustive()
    }
}

impl RedisBackend {
    /// Connect to `redis://host:port/db`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected redis cache backend");
        Ok(Self { conn })
    }

    /// Redis keys must not carry whitespace
    fn safe_key<'a>(&self, key: &'a str) -> Result<&'a str> {
        if key.chars().any(char::is_whitespace) {
            warn!("Refusing redis key with whitespace: {:?}", key);
            return Err(CacheError::Other(format!("bad redis key: {:?}", key)));
        }
        Ok(key)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheValue>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(self.safe_key(key)?).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<()> {
        let key = self.safe_key(key)?;
        let mut conn = self.conn.clone();
        match ttl {
            Ttl::Forever => {
                let _: () = conn.set(key, value).await?;
            }
            Ttl::After(d) => {
                let _: () = conn.set_ex(key, value, d.as_secs().max(1)).await?;
            }
        }
        Ok(())
    }

    async fn add(&self, key: &str, value: CacheValue, ttl: Ttl) -> Result<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.safe_key(key)?).arg(value).arg("NX");
        if let Ttl::After(d) = ttl {
            cmd.arg("EX").arg(d.as_secs().max(1));
        }

        let mut conn = self.conn.clone();
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn set_many(&self, entries: Vec<(CacheKey, CacheValue)>, ttl: Ttl) -> Result<()> {
        let mut pipe = redis::pipe();
        for (key, value) in &entries {
            let key = self.safe_key(key)?;
            match ttl {
                Ttl::Forever => pipe.set(key, value).ignore(),
                Ttl::After(d) => pipe.set_ex(key, value, d.as_secs().max(1)).ignore(),
            };
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(self.safe_key(key)?).await?;
        Ok(())
    }

    async fn add_to_list(&self, list_key: &str, value: &str, ttl: Ttl) -> Result<()> {
        let key = self.safe_key(list_key)?;
        let mut conn = self.conn.clone();

        // -2: no such key, -1: no expiry
        let current: i64 = conn.ttl(key).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().sadd(key, value).ignore();
        match ttl {
            Ttl::Forever => {
                if current != -1 {
                    pipe.persist(key).ignore();
                }
            }
            Ttl::After(d) => {
                let secs = d.as_secs().max(1) as i64;
                if current == -2 || (0..secs).contains(&current) {
                    pipe.expire(key, secs).ignore();
                }
            }
        }

        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_list(&self, list_key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.smembers(self.safe_key(list_key)?).await?;
        Ok(members)
    }

    async fn delete_list(&self, list_key: &str) -> Result<()> {
        self.delete(list_key).await
    }

    async fn take_list(&self, list_key: &str) -> Result<Vec<String>> {
        let key = self.safe_key(list_key)?;
        let mut conn = self.conn.clone();
        let (members, _removed): (Vec<String>, i64) = redis::pipe()
            .atomic()
            .smembers(key)
            .del(key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
