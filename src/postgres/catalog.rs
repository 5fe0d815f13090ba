//! Catalog lookups over a regular (non-replication) connection.
//!
//! The replication socket cannot run SQL, so primary keys are fetched from
//! `pg_index` through `tokio-postgres`. Connections are pooled per slot id:
//! a session re-resolving relations keeps reusing one catalog connection
//! instead of dialing for every `Relation` message.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};

const PRIMARY_KEY_QUERY: &str = "\
    SELECT a.attname \
    FROM pg_index i \
    JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
    WHERE i.indrelid = ($1 || '.' || $2)::regclass AND i.indisprimary";

/// One pooled catalog connection.
pub struct CatalogClient {
    client: Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl CatalogClient {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(config.port)
            .dbname(&config.database)
            .user(&config.user)
            .password(&config.password)
            .connect_timeout(config.connect_timeout())
            .application_name("pg-relay-catalog");

        let (client, connection) = pg_config
            .connect(NoTls)
            .await
            .map_err(|e| Error::Catalog(format!("catalog connect failed: {e}")))?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("catalog connection ended: {e}");
            }
        });

        debug!(host = %config.host, database = %config.database, "catalog connection established");
        Ok(Self {
            client,
            connection_task,
        })
    }

    /// Primary-key column names for `schema.table`, in index order.
    pub async fn primary_key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(PRIMARY_KEY_QUERY, &[&schema, &table])
            .await
            .map_err(|e| {
                Error::Catalog(format!("pg_index lookup for {schema}.{table} failed: {e}"))
            })?;

        Ok(rows.iter().map(|row| row.get::<_, String>(0)).collect())
    }

    pub fn close(self) {
        self.connection_task.abort();
    }
}

/// Process-wide pool of catalog connections, deduplicated by slot id.
/// Sessions register on start and deregister on teardown.
#[derive(Clone, Default)]
pub struct CatalogPool {
    clients: Arc<Mutex<HashMap<String, Arc<CatalogClient>>>>,
}

impl CatalogPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get (or establish) the catalog connection for a slot.
    pub async fn client_for(
        &self,
        slot_id: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<CatalogClient>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(slot_id) {
            return Ok(Arc::clone(client));
        }

        let client = Arc::new(CatalogClient::connect(config).await?);
        clients.insert(slot_id.to_string(), Arc::clone(&client));
        info!(slot_id, "registered catalog connection");
        Ok(client)
    }

    /// Drop the slot's connection. Called on session teardown so a
    /// reconnect gets a fresh one.
    pub async fn release(&self, slot_id: &str) {
        let mut clients = self.clients.lock().await;
        if clients.remove(slot_id).is_some() {
            debug!(slot_id, "released catalog connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_key_query_targets_pg_index() {
        assert!(PRIMARY_KEY_QUERY.contains("pg_index"));
        assert!(PRIMARY_KEY_QUERY.contains("indisprimary"));
        assert!(PRIMARY_KEY_QUERY.contains("regclass"));
    }

    #[tokio::test]
    async fn release_of_unknown_slot_is_a_noop() {
        let pool = CatalogPool::new();
        pool.release("never-registered").await;
    }
}
