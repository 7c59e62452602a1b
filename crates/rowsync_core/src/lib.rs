//! # rowsync Core
//!
//! Change tracking, batching and conflict resolution for rowsync.
//!
//! This crate provides:
//! - The data model: setups, filters, schemas, rows and scope records
//! - The [`StorageProvider`] contract and the in-memory [`MemoryProvider`]
//! - [`ScopeStore`] for watermarks kept inside the replicated database
//! - [`Provisioner`] for tracking tables, triggers, procedures and scope tables
//! - [`ChangeTracker`] for selecting pending changes into a batch
//! - [`BatchManager`] and [`BatchInfo`] for disk-backed, size-bounded batches
//! - [`ConflictResolver`] and [`ChangeApplier`] for applying remote batches
//! - [`SnapshotStore`] for initial-load snapshots
//!
//! ## Change tracking model
//!
//! Every tracked row has one tracking row carrying a timestamp from a
//! per-database counter. Any write bumps the timestamp in place, so a row
//! inserted then deleted before a sync is a single tombstone. A replica asks
//! for changes above its watermark, excluding the ones it wrote itself.
//!
//! ## Key Invariants
//!
//! - Watermarks are saved in the same transaction as the last rows applied
//! - A batch manifest is written only after all of its parts
//! - Provisioning is idempotent per object category
//! - Row-level failures never abort a batch; run-level failures roll back the part

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod batch;
mod conflict;
mod error;
mod filter;
mod interceptor;
mod memory;
mod provider;
mod provision;
mod row;
mod schema;
mod scope;
mod setup;
mod snapshot;
mod tracker;

pub use applier::{ApplyOptions, ApplyReport, ChangeApplier};
pub use batch::{part_file_name, write_part, BatchInfo, BatchManager, BatchPartInfo, BatchWriter, MANIFEST_FILE};
pub use conflict::{Conflict, ConflictAction, ConflictOutcome, ConflictPolicy, ConflictResolver, ResolvedConflict};
pub use error::{CoreError, CoreResult};
pub use filter::{
    BoundFilter, FilterJoin, FilterParameter, FilterWhere, JoinKind, ParameterSource, SetupFilter, SyncParameters,
};
pub use interceptor::{Interceptors, TableApplied, TableSelecting};
pub use memory::{MemoryProvider, MemoryTransaction, ObjectKind, TrackingRow};
pub use provider::{
    ApplyContext, ApplyOutcome, ConflictRow, DdlStatement, ProcedureKind, ProvisionFlags, ScopeTableKind,
    SelectChanges, StorageProvider, TriggerKind,
};
pub use provision::{ProvisionReport, Provisioner};
pub use row::{display_key, FailedRow, RowState, SyncRow, SyncSet, SyncTable};
pub use schema::{ColumnSchema, Relation, SyncSchema, TableSchema};
pub use scope::{ClientScopeHistory, ScopeInfo, ScopeStore};
pub use setup::{NamingOptions, SetupTable, SyncDirection, SyncSetup, SyncSide};
pub use snapshot::{SnapshotEntry, SnapshotStore};
pub use tracker::{ChangeRequest, ChangeTracker};

/// Version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
