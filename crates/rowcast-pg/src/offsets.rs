//! Postgres-backed offset storage.
//!
//! Offsets live in a `__rowcast_offsets` table in the target database, so a
//! deployment that already has Postgres needs no local state.

use std::future::Future;

use chrono::{DateTime, Utc};
use rowcast_core::{OffsetRecord, OffsetStore};
use tokio::sync::{Mutex, MutexGuard};
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::connect::{connect_postgres, Reconnecting, Slot};
use crate::error::{PgError, PgResult};

/// Offsets in Postgres. A store opened with [`connect`](Self::connect)
/// reconnects on the next call after its connection drops.
pub struct PostgresOffsetStore {
    conn: Mutex<Reconnecting<Client>>,
}

impl PostgresOffsetStore {
    /// Connect and create the offsets table if needed.
    pub async fn connect(connection_string: &str) -> PgResult<Self> {
        let store = Self {
            conn: Mutex::new(Reconnecting::lazy(connection_string)),
        };
        store.session().await?;
        Ok(store)
    }

    /// Create a store from an existing client. It cannot reconnect.
    pub async fn from_client(client: Client) -> PgResult<Self> {
        ensure_schema(&client).await?;
        Ok(Self {
            conn: Mutex::new(Reconnecting::fixed(client)),
        })
    }

    /// Lock the connection, re-establishing it first if it dropped.
    async fn session(&self) -> PgResult<MutexGuard<'_, Reconnecting<Client>>> {
        let mut conn = self.conn.lock().await;
        let slot = conn.check();
        if slot != Slot::Live {
            if slot == Slot::Lost {
                warn!("Offset store connection lost; reconnecting");
            }
            let client = connect_postgres(conn.target()?).await?;
            ensure_schema(&client).await?;
            conn.install(client);
        }
        Ok(conn)
    }

    pub async fn read_offset(&self, source: &str) -> PgResult<Option<String>> {
        let conn = self.session().await?;
        let row = conn
            .get()?
            .query_opt(
                "SELECT offset_token FROM __rowcast_offsets WHERE source = $1",
                &[&source],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn write_offset(&self, source: &str, offset: &str) -> PgResult<()> {
        if offset.is_empty() {
            return Err(PgError::InvalidOffset(offset.to_string()));
        }
        let conn = self.session().await?;
        conn.get()?
            .execute(
                r#"
                INSERT INTO __rowcast_offsets (source, offset_token, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (source) DO UPDATE SET
                    offset_token = EXCLUDED.offset_token,
                    updated_at = NOW()
                "#,
                &[&source, &offset],
            )
            .await?;
        debug!(source, offset, "Offset stored");
        Ok(())
    }

    /// Every stored offset, ordered by source.
    pub async fn list_offsets(&self) -> PgResult<Vec<OffsetRecord>> {
        let conn = self.session().await?;
        let rows = conn
            .get()?
            .query(
                "SELECT source, offset_token, updated_at FROM __rowcast_offsets ORDER BY source",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(|r| OffsetRecord {
                source: r.get(0),
                offset: r.get(1),
                updated_at: r.get::<_, DateTime<Utc>>(2).to_rfc3339(),
            })
            .collect())
    }
}

async fn ensure_schema(client: &Client) -> PgResult<()> {
    debug!("Ensuring rowcast offset schema exists");
    client
        .execute(
            r#"
            CREATE TABLE IF NOT EXISTS __rowcast_offsets (
                source TEXT PRIMARY KEY,
                offset_token TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            &[],
        )
        .await?;
    info!("Rowcast offset schema initialized");
    Ok(())
}

impl OffsetStore for PostgresOffsetStore {
    fn get_offset(
        &self,
        source: &str,
    ) -> impl Future<Output = rowcast_core::Result<Option<String>>> + Send {
        async move {
            self.read_offset(source)
                .await
                .map_err(|e| rowcast_core::Error::OffsetStore(e.to_string()))
        }
    }

    fn set_offset(
        &self,
        source: &str,
        offset: &str,
    ) -> impl Future<Output = rowcast_core::Result<()>> + Send {
        async move {
            self.write_offset(source, offset)
                .await
                .map_err(|e| rowcast_core::Error::OffsetStore(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_fails_without_server() {
        let result =
            PostgresOffsetStore::connect("host=127.0.0.1 port=1 user=rowcast connect_timeout=2")
                .await;
        assert!(matches!(result, Err(PgError::Connection(_))));
    }
}
