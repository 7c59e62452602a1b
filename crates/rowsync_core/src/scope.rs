//! Persisted scope metadata.
//!
//! Scope records live in scope tables inside the replicated database, so the
//! watermark is written in the same transaction as the rows it certifies.

use crate::error::{CoreError, CoreResult};
use crate::provider::StorageProvider;
use crate::schema::SyncSchema;
use crate::setup::{NamingOptions, SyncSetup};
use chrono::{DateTime, Utc};
use rowsync_codec::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sync metadata of one scope on one side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeInfo {
    /// Scope name.
    pub name: String,
    /// Identity of this replica for this scope. Stable for a client.
    pub id: Uuid,
    /// Setup the scope was provisioned with.
    pub setup: SyncSetup,
    /// Schema of the setup's tables.
    pub schema: SyncSchema,
    /// Fingerprint of `setup`.
    pub setup_hash: String,
    /// Local watermark: changes up to here have been exchanged.
    pub last_sync_timestamp: Option<u64>,
    /// Client only: server watermark received on the last successful run.
    pub last_server_sync_timestamp: Option<u64>,
    /// Wall-clock end of the last successful run.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Duration of the last successful run, in milliseconds.
    pub last_sync_duration_ms: u64,
    /// Client only: a reinitialization reset the tables but did not finish.
    /// The next run must reinitialize again.
    #[serde(default)]
    pub reinitializing: bool,
}

impl ScopeInfo {
    /// Creates a never-synchronized scope with a fresh id.
    pub fn new(name: impl Into<String>, setup: SyncSetup, schema: SyncSchema) -> CoreResult<Self> {
        let setup_hash = setup.fingerprint()?;
        Ok(Self {
            name: name.into(),
            id: Uuid::new_v4(),
            setup,
            schema,
            setup_hash,
            last_sync_timestamp: None,
            last_server_sync_timestamp: None,
            last_sync_at: None,
            last_sync_duration_ms: 0,
            reinitializing: false,
        })
    }

    /// Returns true if this client never completed a run against the server.
    pub fn is_new(&self) -> bool {
        self.last_server_sync_timestamp.is_none()
    }

    /// Replaces setup and schema after a migration, keeping id and watermarks.
    pub fn migrate(&mut self, setup: SyncSetup, schema: SyncSchema) -> CoreResult<()> {
        self.setup_hash = setup.fingerprint()?;
        self.setup = setup;
        self.schema = schema;
        Ok(())
    }
}

/// Server-side record of one client's progress in a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientScopeHistory {
    /// Scope name.
    pub scope_name: String,
    /// Client scope id.
    pub client_scope_id: Uuid,
    /// Server watermark handed to the client on its last run.
    pub last_sync_timestamp: u64,
    /// Wall-clock time of the last run.
    pub last_sync_at: DateTime<Utc>,
    /// Fingerprint of the filter parameters the client used.
    pub parameters_hash: Option<String>,
}

impl ClientScopeHistory {
    /// Creates a history record.
    pub fn new(scope_name: impl Into<String>, client_scope_id: Uuid) -> Self {
        Self {
            scope_name: scope_name.into(),
            client_scope_id,
            last_sync_timestamp: 0,
            last_sync_at: Utc::now(),
            parameters_hash: None,
        }
    }
}

/// Reads and writes scope records through a provider.
#[derive(Debug, Clone)]
pub struct ScopeStore {
    info_table: String,
    history_table: String,
}

impl ScopeStore {
    /// Creates a store using the scope table names of `naming`.
    pub fn new(naming: &NamingOptions) -> Self {
        Self {
            info_table: naming.scope_info_table.clone(),
            history_table: naming.scope_history_table.clone(),
        }
    }

    /// Name of the scope info table.
    pub fn info_table(&self) -> &str {
        &self.info_table
    }

    /// Name of the client history table.
    pub fn history_table(&self) -> &str {
        &self.history_table
    }

    /// Returns true if the scope info table is provisioned.
    pub async fn is_provisioned<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
    ) -> CoreResult<bool> {
        provider.object_exists(txn, &self.info_table).await
    }

    /// Loads a scope by name.
    pub async fn load_scope<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        name: &str,
    ) -> CoreResult<Option<ScopeInfo>> {
        match provider.read_scope_record(txn, &self.info_table, name).await? {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Saves a scope.
    pub async fn save_scope<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        scope: &ScopeInfo,
    ) -> CoreResult<()> {
        let bytes = to_cbor(scope)?;
        provider
            .write_scope_record(txn, &self.info_table, &scope.name, bytes)
            .await?;
        tracing::debug!(
            scope = %scope.name,
            last_sync = ?scope.last_sync_timestamp,
            last_server_sync = ?scope.last_server_sync_timestamp,
            "scope saved"
        );
        Ok(())
    }

    /// Deletes a scope record.
    pub async fn delete_scope<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        name: &str,
    ) -> CoreResult<()> {
        provider
            .delete_scope_record(txn, &self.info_table, name)
            .await
    }

    /// Loads one client's history.
    pub async fn load_client_history<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        scope_name: &str,
        client_scope_id: Uuid,
    ) -> CoreResult<Option<ClientScopeHistory>> {
        let key = history_key(scope_name, client_scope_id);
        match provider
            .read_scope_record(txn, &self.history_table, &key)
            .await?
        {
            Some(bytes) => Ok(Some(from_cbor(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Saves one client's history.
    pub async fn save_client_history<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        history: &ClientScopeHistory,
    ) -> CoreResult<()> {
        let key = history_key(&history.scope_name, history.client_scope_id);
        provider
            .write_scope_record(txn, &self.history_table, &key, to_cbor(history)?)
            .await
    }

    /// Lists every client known in a scope.
    pub async fn list_client_scopes<P: StorageProvider>(
        &self,
        provider: &P,
        txn: &mut P::Transaction,
        scope_name: &str,
    ) -> CoreResult<Vec<ClientScopeHistory>> {
        let prefix = format!("{scope_name}/");
        provider
            .list_scope_records(txn, &self.history_table, &prefix)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                from_cbor(&bytes).map_err(|e| {
                    CoreError::invalid_operation(format!("unreadable history record {key}: {e}"))
                })
            })
            .collect()
    }
}

fn history_key(scope_name: &str, client_scope_id: Uuid) -> String {
    format!("{scope_name}/{client_scope_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_scope_is_new() {
        let scope = ScopeInfo::new("default", SyncSetup::new(["Customer"]), SyncSchema::default())
            .unwrap();
        assert!(scope.is_new());
        assert_eq!(scope.setup_hash.len(), 64);
    }

    #[test]
    fn migrate_keeps_identity() {
        let mut scope =
            ScopeInfo::new("default", SyncSetup::new(["Customer"]), SyncSchema::default()).unwrap();
        let id = scope.id;
        let old_hash = scope.setup_hash.clone();
        scope
            .migrate(SyncSetup::new(["Customer", "Order"]), SyncSchema::default())
            .unwrap();
        assert_eq!(scope.id, id);
        assert_ne!(scope.setup_hash, old_hash);
    }

    #[test]
    fn history_keys_are_scoped() {
        let id = Uuid::nil();
        assert_eq!(
            history_key("default", id),
            "default/00000000-0000-0000-0000-000000000000"
        );
    }
}
