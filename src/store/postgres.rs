//! PostgreSQL backends for the ephemeral and long-lived stores.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//! - `NEIGHBORHOOD_MAX_EPHEMERAL_ROWS`: Ephemeral row ceiling (default: 100000)
//!
//! ## Schema
//!
//! ```sql
//! neighborhood_ephemeral(key TEXT PRIMARY KEY, value TEXT NULL,
//!                        written_at TIMESTAMPTZ, expires_at TIMESTAMPTZ)
//! neighborhood_durable(key TEXT PRIMARY KEY, value TEXT NOT NULL)
//! ```
//!
//! Both stores share one pool; call `ensure_schema` once at startup.
//!
//! ## Row ceiling
//!
//! Overwrites of an existing ephemeral key skip the ceiling. Inserts of new
//! keys take a transaction-scoped advisory lock before counting, so
//! concurrent inserts are checked one at a time and the table never
//! exceeds the ceiling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;

use crate::config::env_or;
use super::memory::DEFAULT_MAX_EPHEMERAL_ROWS;
use super::{DurableStore, EphemeralRecord, EphemeralStore, StoreError};

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
    /// Ephemeral row ceiling.
    pub max_ephemeral_rows: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/neighborhood".to_string()),
            max_connections: env_or("DB_MAX_CONNECTIONS", 10),
            min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            connect_timeout_secs: env_or("DB_CONNECT_TIMEOUT_SECS", 10),
            idle_timeout_secs: env_or("DB_IDLE_TIMEOUT_SECS", 300),
            max_lifetime_secs: env_or("DB_MAX_LIFETIME_SECS", 1800),
            max_ephemeral_rows: env_or("NEIGHBORHOOD_MAX_EPHEMERAL_ROWS", DEFAULT_MAX_EPHEMERAL_ROWS),
        }
    }

    /// Open a connection pool.
    pub async fn connect(&self) -> Result<PgPool, StoreError> {
        tracing::info!(
            max_connections = self.max_connections,
            min_connections = self.min_connections,
            connect_timeout_secs = self.connect_timeout_secs,
            idle_timeout_secs = self.idle_timeout_secs,
            max_lifetime_secs = self.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        PgPoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(Duration::from_secs(self.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(self.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(self.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&self.database_url)
            .await
            .map_err(StoreError::from_backend)
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

fn pool_stats(pool: &PgPool) -> PoolStats {
    PoolStats {
        size: pool.size(),
        idle: pool.num_idle(),
        max: pool.options().get_max_connections(),
    }
}

/// Advisory lock key serializing new-key inserts into `neighborhood_ephemeral`.
const EPHEMERAL_INSERT_LOCK: i64 = 0x6e62_6864_6570_6831;

/// Ephemeral store backed by `neighborhood_ephemeral`.
pub struct PostgresEphemeralStore {
    pool: PgPool,
    max_rows: u64,
}

impl PostgresEphemeralStore {
    /// Wrap a pool.
    pub fn new(pool: PgPool, max_rows: u64) -> Self {
        Self { pool, max_rows }
    }

    /// Connect using environment configuration.
    pub async fn from_env() -> Result<Self, StoreError> {
        let config = PostgresConfig::from_env();
        Ok(Self::new(config.connect().await?, config.max_ephemeral_rows))
    }

    /// Create the table and expiry index if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS neighborhood_ephemeral (
                key        TEXT PRIMARY KEY,
                value      TEXT NULL,
                written_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS neighborhood_ephemeral_expires_at ON neighborhood_ephemeral (expires_at)"
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;

        Ok(())
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        pool_stats(&self.pool)
    }
}

#[async_trait]
impl EphemeralStore for PostgresEphemeralStore {
    async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<EphemeralRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT value, written_at, expires_at
            FROM neighborhood_ephemeral
            WHERE key = $1 AND expires_at > $2
            "#
        )
        .bind(key)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;

        let Some(r) = row else {
            return Ok(None);
        };
        Ok(Some(EphemeralRecord {
            value: r.try_get("value").map_err(StoreError::from_backend)?,
            written_at: r.try_get("written_at").map_err(StoreError::from_backend)?,
            expires_at: r.try_get("expires_at").map_err(StoreError::from_backend)?,
        }))
    }

    async fn put(&self, key: &str, record: EphemeralRecord) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from_backend)?;

        let updated = sqlx::query(
            r#"
            UPDATE neighborhood_ephemeral
               SET value = $2, written_at = $3, expires_at = $4
             WHERE key = $1
            "#
        )
        .bind(key)
        .bind(record.value.as_deref())
        .bind(record.written_at)
        .bind(record.expires_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_backend)?;

        if updated.rows_affected() == 0 {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(EPHEMERAL_INSERT_LOCK)
                .execute(&mut *tx)
                .await
                .map_err(StoreError::from_backend)?;

            // Zero rows affected means a new key was refused.
            let inserted = sqlx::query(
                r#"
                INSERT INTO neighborhood_ephemeral (key, value, written_at, expires_at)
                SELECT $1::text, $2::text, $3::timestamptz, $4::timestamptz
                WHERE EXISTS (SELECT 1 FROM neighborhood_ephemeral WHERE key = $1::text)
                   OR (SELECT COUNT(*) FROM neighborhood_ephemeral) < $5::bigint
                ON CONFLICT (key) DO UPDATE
                   SET value = EXCLUDED.value,
                       written_at = EXCLUDED.written_at,
                       expires_at = EXCLUDED.expires_at
                "#
            )
            .bind(key)
            .bind(record.value.as_deref())
            .bind(record.written_at)
            .bind(record.expires_at)
            .bind(self.max_rows as i64)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from_backend)?;

            if inserted.rows_affected() == 0 {
                tracing::warn!(key = %key, limit = self.max_rows, "Ephemeral row ceiling reached");
                return Err(StoreError::CapacityExceeded { limit: self.max_rows });
            }
        }

        tx.commit().await.map_err(StoreError::from_backend)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM neighborhood_ephemeral WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM neighborhood_ephemeral WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_backend)?;
        Ok(result.rows_affected())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM neighborhood_ephemeral WHERE left(key, char_length($1)) = $1")
            .bind(prefix)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_backend)?;
        Ok(result.rows_affected())
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM neighborhood_ephemeral")
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_backend)?;
        Ok(count.max(0) as u64)
    }
}

/// Long-lived store backed by `neighborhood_durable`.
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    /// Wrap a pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the table if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS neighborhood_durable (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#
        )
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;
        Ok(())
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        pool_stats(&self.pool)
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        sqlx::query_scalar("SELECT value FROM neighborhood_durable WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from_backend)
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO neighborhood_durable (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM neighborhood_durable WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_backend)?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, value
            FROM neighborhood_durable
            WHERE left(key, char_length($1)) = $1
            ORDER BY key
            "#
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from_backend)?;

        rows.iter()
            .map(|row| {
                let key: String = row.try_get("key").map_err(StoreError::from_backend)?;
                let value: String = row.try_get("value").map_err(StoreError::from_backend)?;
                Ok((key, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use futures::future::join_all;

    async fn store(max_rows: u64) -> PostgresEphemeralStore {
        let pool = PostgresConfig::from_env().connect().await.unwrap();
        let store = PostgresEphemeralStore::new(pool, max_rows);
        store.ensure_schema().await.unwrap();
        sqlx::query("DELETE FROM neighborhood_ephemeral").execute(&store.pool).await.unwrap();
        store
    }

    fn record(now: DateTime<Utc>) -> EphemeralRecord {
        EphemeralRecord { value: Some("v".to_string()), written_at: now, expires_at: now + ChronoDuration::hours(1) }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_concurrent_inserts_respect_ceiling() {
        let store = store(5).await;
        let now = Utc::now();

        let keys: Vec<String> = (0..20).map(|i| format!("account:{}", i)).collect();
        let results = join_all(keys.iter().map(|key| store.put(key, record(now)))).await;

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 5);
        assert!(results.iter().filter_map(|r| r.as_ref().err()).all(StoreError::is_capacity));
        assert_eq!(store.row_count().await.unwrap(), 5);

        // Overwrites still go through at the ceiling.
        let mut stored = None;
        for key in &keys {
            if store.get(key, now).await.unwrap().is_some() {
                stored = Some(key);
                break;
            }
        }
        assert!(store.put(stored.unwrap(), record(now)).await.is_ok());
    }
}
