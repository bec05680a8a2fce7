//! The engine handle: owned state (catalog, storage, transaction manager,
//! WAL, executor), session lifecycle, plan routing and checkpointing.
//!
//! Lifecycle: `Engine::open` runs recovery (catalog load, checkpointed
//! tables, WAL replay), queries run against the handle, `close` takes a
//! final checkpoint and syncs. Nothing here is process-global.

use crate::config::EngineConfig;
use crate::dispatcher;
use crate::loader;
use crate::EngineError;
use otter_catalog::{Catalog, CatalogError, CatalogFile, ColumnEntry, TableEntry, TableStorageMode};
use otter_exec::{Cursor, ErrorCode, ExecutionContext, Executor, WriteEffect};
use otter_plan::{ParameterBinding, PlanNode, StorageMode};
use otter_primitives::{LogicalType, TransactionData};
use otter_store::{
    BlockManager, BufferPool, ColumnDefinition, DataTable, DatabaseHeader, InMemoryBlockManager,
    MetadataManager, MetadataWriter, SessionId, SingleFileBlockManager, TransactionManager,
};
use otter_wal::{WalConfig, WalWriter};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A secondary-index definition tracked by the engine. The index engine
/// itself is an external collaborator; the core persists definitions
/// through the WAL and mirrors writes to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub name: String,
    pub keys: Vec<String>,
}

struct SessionState {
    journal: Arc<Mutex<Vec<WriteEffect>>>,
    cancelled: Arc<AtomicBool>,
}

impl SessionState {
    fn new() -> Self {
        Self {
            journal: Arc::new(Mutex::new(Vec::new())),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

type QualifiedName = (String, String);

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    txn_manager: Arc<TransactionManager>,
    tables: RwLock<HashMap<QualifiedName, Arc<DataTable>>>,
    indexes: RwLock<HashMap<QualifiedName, Vec<IndexDef>>>,
    enum_types: RwLock<HashMap<QualifiedName, Vec<String>>>,
    block_manager: Arc<dyn BlockManager>,
    file_manager: Option<Arc<SingleFileBlockManager>>,
    buffer_pool: Arc<BufferPool>,
    wal: Option<Arc<WalWriter>>,
    executor: Executor,
    sessions: Mutex<HashMap<SessionId, SessionState>>,
    next_session: AtomicU64,
    last_checkpoint_wal_id: AtomicU64,
}

impl Engine {
    /// Open (or create) an engine. For a durable configuration this runs
    /// the whole recovery path: database file, catalog file, checkpointed
    /// tables, then the committed WAL suffix.
    pub async fn open(config: EngineConfig) -> Result<Engine, EngineError> {
        if let Some(dir) = &config.data_dir {
            std::fs::create_dir_all(dir)?;
        }

        let (file_manager, free_list_root) = match config.database_file() {
            Some(path) => {
                if path.exists() {
                    let (manager, header) = SingleFileBlockManager::open_existing(
                        &path,
                        config.store.block_alloc_size,
                    )?;
                    (Some(Arc::new(manager)), header.free_list)
                } else {
                    let manager =
                        SingleFileBlockManager::create_new(&path, config.store.block_alloc_size)?;
                    (Some(Arc::new(manager)), otter_primitives::INVALID_INDEX)
                }
            }
            None => (None, otter_primitives::INVALID_INDEX),
        };
        let block_manager: Arc<dyn BlockManager> = match &file_manager {
            Some(manager) => Arc::clone(manager) as Arc<dyn BlockManager>,
            None => Arc::new(InMemoryBlockManager::new(config.store.block_alloc_size)),
        };
        let buffer_pool = Arc::new(BufferPool::new(
            config.store.buffer_pool_bytes,
            config.store.block_alloc_size,
        ));

        let catalog = match config.catalog_file() {
            Some(path) => Arc::new(Catalog::open(CatalogFile::new(path))?),
            None => Arc::new(Catalog::ephemeral()),
        };

        let loaded = match &file_manager {
            Some(manager) => {
                loader::restore_free_list(manager, &block_manager, free_list_root)?;
                loader::load_tables(&block_manager, &buffer_pool)?
            }
            None => loader::LoadedState::empty(),
        };

        let mut engine = Engine {
            config,
            catalog,
            txn_manager: Arc::new(TransactionManager::new()),
            tables: RwLock::new(HashMap::new()),
            indexes: RwLock::new(HashMap::new()),
            enum_types: RwLock::new(HashMap::new()),
            block_manager,
            file_manager,
            buffer_pool,
            wal: None,
            executor: Executor::new(None),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            last_checkpoint_wal_id: AtomicU64::new(loaded.last_wal_id),
        };

        // checkpointed tables first, fresh instances for the rest of the
        // catalog
        for (database, table) in loaded.tables {
            let key = (database, table.name());
            engine.tables.write().insert(key, Arc::new(table));
        }
        engine.instantiate_catalog_tables();

        // replay the committed WAL suffix, then open the writer after it
        if let Some(wal_dir) = engine.config.wal_dir() {
            let recovery = otter_wal::recover(
                &wal_dir,
                engine.config.wal.shards,
                loaded.last_wal_id,
            )?;
            let next_wal_id = recovery.max_id + 1;
            let replay_count = recovery.records.len();
            for record in recovery.records {
                engine.replay(&record.node, &record.params).await;
            }
            if replay_count > 0 {
                tracing::info!(target: "engine", replayed = replay_count, "wal replay complete");
            }

            let mut wal_config =
                WalConfig::new(wal_dir).with_shards(engine.config.wal.shards);
            wal_config.sync_on_write = engine.config.wal.sync_on_write;
            let wal = Arc::new(WalWriter::open(wal_config, next_wal_id)?);
            engine.executor = Executor::new(Some(Arc::clone(&wal)));
            engine.wal = Some(wal);
        }

        Ok(engine)
    }

    /// Make sure every catalog table has a live `DataTable`.
    fn instantiate_catalog_tables(&self) {
        let mut tables = self.tables.write();
        for db in self.catalog.snapshot() {
            for entry in &db.tables {
                let key = (db.name.clone(), entry.name.clone());
                if tables.contains_key(&key) {
                    continue;
                }
                tables.insert(key, Arc::new(self.make_table(entry)));
            }
        }
    }

    fn make_table(&self, entry: &TableEntry) -> DataTable {
        let columns = entry
            .columns
            .iter()
            .map(|column| ColumnDefinition {
                name: column.name.clone(),
                ty: column.ty.clone(),
                not_null: column.not_null,
            })
            .collect();
        DataTable::new(
            Arc::clone(&self.block_manager),
            Arc::clone(&self.buffer_pool),
            columns,
            entry.name.clone(),
        )
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn table(&self, database: &str, name: &str) -> Option<Arc<DataTable>> {
        self.tables.read().get(&(database.to_string(), name.to_string())).cloned()
    }

    pub fn indexes(&self, database: &str, name: &str) -> Vec<IndexDef> {
        self.indexes
            .read()
            .get(&(database.to_string(), name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    // --- session and transaction lifecycle ---

    pub fn create_session(&self) -> SessionId {
        let session = SessionId(self.next_session.fetch_add(1, Ordering::AcqRel));
        self.sessions.lock().insert(session, SessionState::new());
        session
    }

    pub fn begin_transaction(&self, session: SessionId) -> TransactionData {
        self.txn_manager.begin(session)
    }

    /// Commit the session's transaction: allocate the commit id, rewrite
    /// the tentative MVCC markers, append the WAL COMMIT marker, and run
    /// version cleanup bounded by the remaining active transactions.
    pub fn commit(&self, session: SessionId) -> Result<u64, EngineError> {
        let txn = self
            .txn_manager
            .get(session)
            .ok_or(EngineError::NoActiveTransaction(session))?;
        let commit_id =
            self.txn_manager.commit(session).ok_or(EngineError::NoActiveTransaction(session))?;

        let journal = {
            let sessions = self.sessions.lock();
            sessions.get(&session).map(|state| Arc::clone(&state.journal))
        };
        if let Some(journal) = journal {
            for effect in journal.lock().drain(..) {
                match effect {
                    WriteEffect::Append { table, row_start, count } => {
                        table.commit_append(commit_id, row_start, count);
                    }
                    WriteEffect::Delete { table } => {
                        table.commit_all_deletes(txn.transaction_id, commit_id);
                    }
                }
            }
        }

        if let Some(wal) = &self.wal {
            wal.append_commit(txn.transaction_id)?;
        }

        self.cleanup_versions();
        Ok(commit_id)
    }

    /// Abort the session's transaction: revert tentative appends and
    /// deletes. Any in-flight execution observes the cancellation at its
    /// next suspension point.
    pub fn abort(&self, session: SessionId) {
        let Some(txn) = self.txn_manager.abort(session) else { return };

        let state = {
            let mut sessions = self.sessions.lock();
            sessions.insert(session, SessionState::new())
        };
        if let Some(state) = state {
            state.cancelled.store(true, Ordering::Release);
            for effect in state.journal.lock().drain(..) {
                match effect {
                    WriteEffect::Append { table, row_start, count } => {
                        table.revert_append(row_start, count);
                    }
                    WriteEffect::Delete { table } => {
                        table.revert_all_deletes(txn.transaction_id);
                    }
                }
            }
        }
    }

    fn cleanup_versions(&self) {
        let lowest = self.txn_manager.lowest_active_start_time();
        for table in self.tables.read().values() {
            table.cleanup_versions(lowest);
        }
    }

    // --- execution ---

    /// Validate and execute one plan for a session, returning its cursor.
    pub async fn execute(
        &self,
        session: SessionId,
        node: &PlanNode,
        params: &ParameterBinding,
    ) -> Cursor {
        let resolved = match dispatcher::validate(&self.catalog, node) {
            Ok(resolved) => resolved,
            Err(cursor) => return cursor,
        };
        if !params.all_bound(&node.referenced_parameters()) {
            return Cursor::error(ErrorCode::UnboundParameter, "plan has unbound parameters");
        }

        if node.is_ddl() {
            let cursor = self.apply_ddl(node, false);
            if cursor.is_success() {
                if let Some(wal) = &self.wal {
                    let shard_key = node
                        .collection()
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "ddl".to_string());
                    if let Err(err) = wal.append(&shard_key, 0, node, params) {
                        return Cursor::error(ErrorCode::DurabilityFailure, err.to_string());
                    }
                }
            }
            return cursor;
        }

        // sessions without an open transaction read at the latest commit
        // horizon and write immediately-visible rows
        let txn = self.txn_manager.get(session).unwrap_or_else(|| {
            TransactionData::new(0, self.txn_manager.last_commit_id())
        });
        let (journal, cancelled) = {
            let sessions = self.sessions.lock();
            match sessions.get(&session) {
                Some(state) => {
                    (Some(Arc::clone(&state.journal)), Arc::clone(&state.cancelled))
                }
                None => (None, Arc::new(AtomicBool::new(false))),
            }
        };

        let (table, table_name, primary_key) = match (&resolved.table, node.collection()) {
            (Some(entry), Some(name)) => {
                let Some(table) = self.table(&name.database, &entry.name) else {
                    return Cursor::error(
                        ErrorCode::UnknownCollection,
                        format!("collection {name} has no storage"),
                    );
                };
                self.adopt_schema_if_needed(node, &name.database, &table);
                (Some(table), name.to_string(), entry.primary_key_columns.clone())
            }
            _ => (None, String::new(), Vec::new()),
        };
        let join_table = match (&resolved.join_table, node) {
            (Some(entry), PlanNode::Aggregate(aggregate)) => aggregate
                .join
                .as_ref()
                .and_then(|join| self.table(&join.collection.database, &entry.name)),
            _ => None,
        };

        let ctx = ExecutionContext {
            table,
            join_table,
            table_name,
            primary_key,
            txn,
            cancelled,
            journal,
        };
        self.executor.execute_plan(node, params, &ctx).await
    }

    /// Schema adoption: an insert into a table created without columns
    /// infers the schema from the payload and installs it in the catalog.
    fn adopt_schema_if_needed(&self, node: &PlanNode, database: &str, table: &Arc<DataTable>) {
        let PlanNode::Insert { payload, .. } = node else { return };
        if table.column_count() != 0 || payload.columns.is_empty() {
            return;
        }
        let first_row = match payload.rows.first() {
            Some(row) => row,
            None => return,
        };
        let columns: Vec<ColumnDefinition> = payload
            .columns
            .iter()
            .zip(first_row)
            .map(|(name, value)| {
                let ty = if value.is_null() { LogicalType::String } else { value.logical_type() };
                ColumnDefinition { name: name.clone(), ty, not_null: false }
            })
            .collect();
        table.adopt_schema(columns.clone());
        let entries: Vec<ColumnEntry> = columns
            .into_iter()
            .map(|column| ColumnEntry {
                name: column.name,
                ty: column.ty,
                not_null: column.not_null,
                has_default: false,
            })
            .collect();
        if let Err(err) = self.catalog.update_table_columns(database, &table.name(), entries) {
            tracing::warn!(target: "engine", %err, "failed to persist adopted schema");
        }
    }

    /// Apply a DDL node to the catalog and the live registries. WAL replay
    /// passes `replay = true`, which makes the application idempotent.
    fn apply_ddl(&self, node: &PlanNode, replay: bool) -> Cursor {
        let outcome: Result<(), CatalogError> = match node {
            PlanNode::CreateDatabase { database } => self.catalog.create_database(database),
            PlanNode::DropDatabase { database } => {
                self.tables.write().retain(|(db, _), _| db != database);
                self.indexes.write().retain(|(db, _), _| db != database);
                self.enum_types.write().retain(|(db, _), _| db != database);
                self.catalog.drop_database(database)
            }
            PlanNode::CreateCollection { collection, schema, primary_key, storage_mode } => {
                let entry = TableEntry {
                    name: collection.collection.clone(),
                    storage_mode: match storage_mode {
                        StorageMode::InMemory => TableStorageMode::InMemory,
                        StorageMode::Disk => TableStorageMode::Disk,
                    },
                    columns: schema
                        .iter()
                        .map(|column| ColumnEntry {
                            name: column.name.clone(),
                            ty: column.ty.clone(),
                            not_null: column.not_null,
                            has_default: false,
                        })
                        .collect(),
                    primary_key_columns: primary_key.clone(),
                };
                match self.catalog.create_table(&collection.database, entry.clone()) {
                    Ok(()) => {
                        let key =
                            (collection.database.clone(), collection.collection.clone());
                        self.tables.write().insert(key, Arc::new(self.make_table(&entry)));
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            PlanNode::DropCollection { collection } => {
                let key = (collection.database.clone(), collection.collection.clone());
                self.tables.write().remove(&key);
                self.indexes.write().remove(&key);
                self.catalog.drop_table(&collection.database, &collection.collection)
            }
            PlanNode::CreateIndex { collection, name, keys } => {
                let key = (collection.database.clone(), collection.collection.clone());
                let mut indexes = self.indexes.write();
                let defs = indexes.entry(key).or_default();
                if defs.iter().any(|def| def.name == *name) {
                    return if replay {
                        Cursor::Success
                    } else {
                        Cursor::error(ErrorCode::IndexCreateFail, "index already exists")
                    };
                }
                defs.push(IndexDef { name: name.clone(), keys: keys.clone() });
                Ok(())
            }
            PlanNode::DropIndex { collection, name } => {
                let key = (collection.database.clone(), collection.collection.clone());
                if let Some(defs) = self.indexes.write().get_mut(&key) {
                    defs.retain(|def| def.name != *name);
                }
                Ok(())
            }
            PlanNode::CreateType { database, name, values } => {
                self.enum_types
                    .write()
                    .insert((database.clone(), name.clone()), values.clone());
                Ok(())
            }
            PlanNode::DropType { database, name } => {
                self.enum_types.write().remove(&(database.clone(), name.clone()));
                Ok(())
            }
            _ => return Cursor::error(ErrorCode::InvalidPlan, "not a ddl node"),
        };

        match outcome {
            Ok(()) => Cursor::Success,
            // replay re-applies effects that may already be in the catalog
            Err(
                CatalogError::DatabaseExists(_)
                | CatalogError::TableExists { .. }
                | CatalogError::DatabaseNotFound(_)
                | CatalogError::TableNotFound { .. },
            ) if replay => Cursor::Success,
            Err(err) => Cursor::error(catalog_error_code(&err), err.to_string()),
        }
    }

    /// Replay one recovered WAL record. Failures are logged, not fatal:
    /// the record was committed, so the data it touches must already be
    /// consistent or the load would have failed earlier.
    async fn replay(&self, node: &PlanNode, params: &ParameterBinding) {
        if node.is_ddl() {
            let cursor = self.apply_ddl(node, true);
            if cursor.is_error() {
                tracing::warn!(target: "engine", "ddl replay failed: {cursor:?}");
            }
            return;
        }
        let session = self.create_session();
        let cursor = self.execute(session, node, params).await;
        if cursor.is_error() {
            tracing::warn!(target: "engine", "dml replay failed: {cursor:?}");
        }
        self.sessions.lock().remove(&session);
    }

    // --- durability ---

    /// Write every DISK table's row groups as immutable segments, record
    /// the row-group pointers and the replayed WAL id in the metadata
    /// stream, and commit the database header.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        let Some(file_manager) = &self.file_manager else { return Ok(()) };

        let wal_id = self
            .wal
            .as_ref()
            .map(|wal| wal.last_id())
            .unwrap_or_else(|| self.last_checkpoint_wal_id.load(Ordering::Acquire));

        // collect the disk-mode tables in catalog order
        let mut disk_tables: Vec<(String, Arc<DataTable>)> = Vec::new();
        for db in self.catalog.snapshot() {
            for entry in &db.tables {
                if entry.storage_mode != TableStorageMode::Disk {
                    continue;
                }
                if let Some(table) = self.table(&db.name, &entry.name) {
                    disk_tables.push((db.name.clone(), table));
                }
            }
        }

        let mut manager = MetadataManager::new(Arc::clone(&self.block_manager));
        let root = {
            let mut writer = MetadataWriter::new(&mut manager);
            writer.write_u64(wal_id);
            writer.write_u32(disk_tables.len() as u32);
            for (database, table) in &disk_tables {
                writer.write_string(database);
                table.checkpoint(&mut writer)?;
            }
            writer.flush()?;
            writer.block_pointer()
        };

        // persist the free list alongside the table metadata
        let free_ids = file_manager.free_list_ids();
        let free_root = if free_ids.is_empty() {
            otter_primitives::INVALID_INDEX
        } else {
            let mut writer = MetadataWriter::new(&mut manager);
            writer.write_u64(free_ids.len() as u64);
            for id in &free_ids {
                writer.write_u64(*id);
            }
            writer.flush()?;
            writer.block_pointer().block_pointer
        };

        self.block_manager.set_meta_block(root.block_pointer);
        // iteration, meta_block, block_count and alloc size are filled in
        // by the header-commit protocol
        let header = DatabaseHeader {
            iteration: 0,
            meta_block: root.block_pointer,
            free_list: free_root,
            block_count: 0,
            block_alloc_size: 0,
            checksum: 0,
        };
        file_manager.write_header(header)?;
        self.block_manager.sync()?;

        self.last_checkpoint_wal_id.store(wal_id, Ordering::Release);
        tracing::info!(
            target: "engine",
            tables = disk_tables.len(),
            wal_id,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Final checkpoint + fsync; consumes the engine.
    pub async fn close(self) -> Result<(), EngineError> {
        self.executor.drain_pending().await;
        if let Some(wal) = &self.wal {
            wal.flush()?;
        }
        self.checkpoint()?;
        self.block_manager.sync()?;
        Ok(())
    }
}

fn catalog_error_code(err: &CatalogError) -> ErrorCode {
    match err {
        CatalogError::DatabaseNotFound(_) => ErrorCode::UnknownDatabase,
        CatalogError::DatabaseExists(_) => ErrorCode::DatabaseExists,
        CatalogError::TableNotFound { .. } => ErrorCode::UnknownCollection,
        CatalogError::TableExists { .. } => ErrorCode::CollectionExists,
        CatalogError::ChecksumMismatch | CatalogError::BadMagic | CatalogError::Truncated => {
            ErrorCode::Corruption
        }
        _ => ErrorCode::Internal,
    }
}
