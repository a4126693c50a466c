//! Redis-backed [`KeyedStore`].
//!
//! Conditional sets use `SET .. PX .. NX`; batched writes and deletes go
//! through `MULTI`/`EXEC` pipelines so readers observe all-or-nothing;
//! keepalive is `PEXPIRE`. The connection manager reconnects on its own,
//! so every operation clones a handle instead of holding one open.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::StoreError;
use crate::store::store::KeyedStore;

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("connected to shared store at {}", url);
        Ok(Self { conn })
    }

    fn ttl_ms(ttl: Duration) -> u64 {
        // PX 0 is a Redis error; clamp to the smallest legal expiry.
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl KeyedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ttl_ms(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_many(&self, entries: Vec<(String, String, Duration)>) -> Result<(), StoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value, ttl) in &entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(Self::ttl_ms(*ttl))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete_many(&self, keys: Vec<String>) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(&keys).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let refreshed: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(Self::ttl_ms(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(refreshed == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let found: i64 = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(found == 1)
    }
}
