//! SQLite Persistence
//!
//! Two databases back the interception core:
//! - `NetworkDb`: process-wide, holds forged certificates (and the root CA)
//! - `SessionDb`: one per session, holds resource state rows, resources and
//!   websocket messages
//!
//! Both are opened in WAL mode and create their schema on open.

use crate::mitm::resource::{Resource, ResourceId};
use crate::mitm::resource_state::{Milestone, ResourceStatesRow};
use crate::mitm::websocket_messages::WebsocketMessage;
use bytes::Bytes;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Open (creating if needed) a SQLite database in WAL mode
async fn open_pool(db_path: &str) -> Result<SqlitePool, StorageError> {
    if let Some(parent) = Path::new(db_path).parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::DatabaseError(sqlx::Error::Io(e)))?;
    }

    let pool = SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db_path)).await?;
    info!(db_path = %db_path, "Connected to SQLite database");

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;

    Ok(pool)
}

/// Row of the `certificates` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRow {
    pub host: String,
    /// PEM-encoded private key
    pub key: String,
    /// PEM-encoded certificate
    pub pem: String,
    /// Expiry, epoch milliseconds
    pub expire_date: i64,
}

/// Process-wide certificate database
pub struct NetworkDb {
    pool: SqlitePool,
}

impl NetworkDb {
    pub async fn new(db_path: &str) -> Result<Self, StorageError> {
        let pool = open_pool(db_path).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS certificates (
                host TEXT PRIMARY KEY,
                key TEXT NOT NULL,
                pem TEXT NOT NULL,
                expire_date INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub async fn get_certificate(&self, host: &str) -> Result<Option<CertificateRow>, StorageError> {
        let row = sqlx::query("SELECT host, key, pem, expire_date FROM certificates WHERE host = ?")
            .bind(host)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(CertificateRow {
                host: row.try_get("host")?,
                key: row.try_get("key")?,
                pem: row.try_get("pem")?,
                expire_date: row.try_get("expire_date")?,
            })
        })
        .transpose()
        .map_err(StorageError::DatabaseError)
    }

    pub async fn insert_certificate(&self, cert: &CertificateRow) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO certificates (host, key, pem, expire_date) VALUES (?, ?, ?, ?)
            ON CONFLICT(host) DO UPDATE SET
                key = excluded.key,
                pem = excluded.pem,
                expire_date = excluded.expire_date
            "#,
        )
        .bind(&cert.host)
        .bind(&cert.key)
        .bind(&cert.pem)
        .bind(cert.expire_date)
        .execute(&self.pool)
        .await?;

        debug!(host = %cert.host, "Certificate persisted");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Per-session recording database
pub struct SessionDb {
    pool: SqlitePool,
}

impl SessionDb {
    pub async fn new(db_path: &str) -> Result<Self, StorageError> {
        let pool = open_pool(db_path).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
        let columns: Vec<String> = Milestone::ALL
            .iter()
            .map(|m| format!("{} INTEGER", m.column_name()))
            .collect();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS resource_states (resource_id INTEGER PRIMARY KEY, {})",
            columns.join(", ")
        ))
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS websocket_messages (
                id INTEGER PRIMARY KEY,
                resource_id INTEGER NOT NULL,
                message BLOB NOT NULL,
                is_binary BOOLEAN NOT NULL,
                is_from_server BOOLEAN NOT NULL,
                timestamp INTEGER NOT NULL,
                received_at_command_id INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_websocket_messages_resource
            ON websocket_messages(resource_id)
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                id INTEGER PRIMARY KEY,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                status INTEGER,
                resource_type TEXT NOT NULL,
                request_headers TEXT NOT NULL,
                response_headers TEXT,
                is_ssl BOOLEAN NOT NULL,
                is_http2 BOOLEAN NOT NULL,
                is_http2_push BOOLEAN NOT NULL,
                parent_resource_id INTEGER,
                document_url TEXT,
                is_from_redirect BOOLEAN NOT NULL,
                previous_url TEXT,
                first_redirecting_url TEXT,
                redirected_to_url TEXT,
                served_from_cache BOOLEAN NOT NULL,
                request_time INTEGER NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        debug!("Session database migrated");
        Ok(())
    }

    /// Upsert state rows. Columns already set are never overwritten.
    pub async fn save_resource_states(&self, rows: &[ResourceStatesRow]) -> Result<(), StorageError> {
        if rows.is_empty() {
            return Ok(());
        }

        let names: Vec<&str> = Milestone::ALL.iter().map(|m| m.column_name()).collect();
        let placeholders = vec!["?"; names.len()].join(", ");
        let updates: Vec<String> = names
            .iter()
            .map(|c| format!("{c} = COALESCE(resource_states.{c}, excluded.{c})"))
            .collect();
        let sql = format!(
            "INSERT INTO resource_states (resource_id, {}) VALUES (?, {}) \
             ON CONFLICT(resource_id) DO UPDATE SET {}",
            names.join(", "),
            placeholders,
            updates.join(", ")
        );

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut query = sqlx::query(&sql).bind(row.resource_id as i64);
            for milestone in Milestone::ALL {
                query = query.bind(row.get(milestone));
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;

        debug!(rows = rows.len(), "Resource states persisted");
        Ok(())
    }

    pub async fn load_resource_states(
        &self,
        resource_id: ResourceId,
    ) -> Result<Option<ResourceStatesRow>, StorageError> {
        let row = sqlx::query("SELECT * FROM resource_states WHERE resource_id = ?")
            .bind(resource_id as i64)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut values = Vec::with_capacity(Milestone::ALL.len());
        for milestone in Milestone::ALL {
            let ts: Option<i64> = row.try_get(milestone.column_name())?;
            values.push((milestone, ts));
        }

        Ok(Some(ResourceStatesRow {
            resource_id,
            values,
        }))
    }

    pub async fn save_websocket_messages(
        &self,
        messages: &[WebsocketMessage],
    ) -> Result<(), StorageError> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for msg in messages {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO websocket_messages (
                    id, resource_id, message, is_binary, is_from_server,
                    timestamp, received_at_command_id
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(msg.message_id as i64)
            .bind(msg.resource_id as i64)
            .bind(msg.message.as_ref())
            .bind(msg.is_binary)
            .bind(msg.is_from_server)
            .bind(msg.timestamp)
            .bind(msg.received_at_command_id.map(|id| id as i64))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(messages = messages.len(), "Websocket messages persisted");
        Ok(())
    }

    pub async fn load_websocket_messages(
        &self,
        resource_id: ResourceId,
    ) -> Result<Vec<WebsocketMessage>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, resource_id, message, is_binary, is_from_server,
                   timestamp, received_at_command_id
            FROM websocket_messages
            WHERE resource_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(resource_id as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(WebsocketMessage {
                    message_id: row.try_get::<i64, _>("id")? as u64,
                    resource_id: row.try_get::<i64, _>("resource_id")? as u64,
                    message: Bytes::from(row.try_get::<Vec<u8>, _>("message")?),
                    is_binary: row.try_get("is_binary")?,
                    is_from_server: row.try_get("is_from_server")?,
                    timestamp: row.try_get("timestamp")?,
                    received_at_command_id: row
                        .try_get::<Option<i64>, _>("received_at_command_id")?
                        .map(|id| id as u64),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StorageError::DatabaseError)
    }

    pub async fn save_resources(&self, resources: &[Resource]) -> Result<(), StorageError> {
        if resources.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for r in resources {
            let request_headers = serde_json::to_string(r.request_headers.original())
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            let response_headers = r
                .response_headers
                .as_ref()
                .map(|h| serde_json::to_string(h.original()))
                .transpose()
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;
            let resource_type = serde_json::to_string(&r.resource_type)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT OR REPLACE INTO resources (
                    id, method, url, status, resource_type, request_headers,
                    response_headers, is_ssl, is_http2, is_http2_push,
                    parent_resource_id, document_url, is_from_redirect,
                    previous_url, first_redirecting_url, redirected_to_url,
                    served_from_cache, request_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(r.id as i64)
            .bind(&r.method)
            .bind(&r.url)
            .bind(r.status.map(i64::from))
            .bind(resource_type.trim_matches('"').to_string())
            .bind(request_headers)
            .bind(response_headers)
            .bind(r.is_ssl)
            .bind(r.is_http2)
            .bind(r.is_http2_push)
            .bind(r.parent_resource_id.map(|id| id as i64))
            .bind(&r.document_url)
            .bind(r.is_from_redirect)
            .bind(&r.previous_url)
            .bind(&r.first_redirecting_url)
            .bind(&r.redirected_to_url)
            .bind(r.served_from_cache)
            .bind(r.request_time.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_resources(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM resources")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
