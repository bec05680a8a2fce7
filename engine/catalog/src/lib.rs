//! The catalog: databases, tables, sequences, views and macros, plus the
//! single-file on-disk format they persist in.
//!
//! The file layout is magic + format version + payload + trailing CRC32
//! (ISO-HDLC) and is rewritten atomically (`.tmp` → fsync → rename) on every
//! mutation, so a crash mid-write leaves the previous catalog intact.

pub mod file;

pub use file::{deserialize_catalog, serialize_catalog, CatalogFile};

use otter_primitives::LogicalType;
use parking_lot::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog file too small")]
    FileTooSmall,

    #[error("invalid catalog magic number")]
    BadMagic,

    #[error("unsupported catalog format version {0}")]
    UnsupportedVersion(u32),

    #[error("catalog checksum mismatch")]
    ChecksumMismatch,

    #[error("catalog payload is truncated")]
    Truncated,

    #[error("unknown column type tag {0}")]
    UnknownTypeTag(u8),

    #[error("database {0} not found")]
    DatabaseNotFound(String),

    #[error("database {0} already exists")]
    DatabaseExists(String),

    #[error("table {database}.{table} not found")]
    TableNotFound { database: String, table: String },

    #[error("table {database}.{table} already exists")]
    TableExists { database: String, table: String },
}

pub type Result<T, E = CatalogError> = std::result::Result<T, E>;

/// Where a table's rows live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableStorageMode {
    #[default]
    InMemory,
    Disk,
}

impl TableStorageMode {
    pub fn as_u8(self) -> u8 {
        match self {
            TableStorageMode::InMemory => 0,
            TableStorageMode::Disk => 1,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        if v == 1 { TableStorageMode::Disk } else { TableStorageMode::InMemory }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnEntry {
    pub name: String,
    pub ty: LogicalType,
    pub not_null: bool,
    pub has_default: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableEntry {
    pub name: String,
    pub storage_mode: TableStorageMode,
    pub columns: Vec<ColumnEntry>,
    pub primary_key_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEntry {
    pub name: String,
    pub start_value: i64,
    pub increment: i64,
    pub current_value: i64,
    pub min_value: i64,
    pub max_value: i64,
}

impl SequenceEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_value: 1,
            increment: 1,
            current_value: 1,
            min_value: 1,
            max_value: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub name: String,
    pub query_sql: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacroEntry {
    pub name: String,
    pub parameters: Vec<String>,
    pub body_sql: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseEntry {
    pub name: String,
    pub tables: Vec<TableEntry>,
    pub sequences: Vec<SequenceEntry>,
    pub views: Vec<ViewEntry>,
    pub macros: Vec<MacroEntry>,
}

/// In-memory catalog state. Every mutating call saves through the attached
/// [`CatalogFile`] before returning, keeping disk and memory in lockstep.
pub struct Catalog {
    file: Option<CatalogFile>,
    databases: RwLock<Vec<DatabaseEntry>>,
}

impl Catalog {
    /// A catalog with no backing file; `IN_MEMORY`-only engines use this.
    pub fn ephemeral() -> Self {
        Self { file: None, databases: RwLock::new(Vec::new()) }
    }

    /// Load the catalog from `file`, or start empty when the file does not
    /// exist yet.
    pub fn open(file: CatalogFile) -> Result<Self> {
        let databases = file.load()?;
        Ok(Self { file: Some(file), databases: RwLock::new(databases) })
    }

    fn save(&self, databases: &[DatabaseEntry]) -> Result<()> {
        if let Some(file) = &self.file {
            file.save(databases)?;
        }
        Ok(())
    }

    pub fn databases(&self) -> Vec<String> {
        self.databases.read().iter().map(|db| db.name.clone()).collect()
    }

    pub fn database_exists(&self, name: &str) -> bool {
        self.databases.read().iter().any(|db| db.name == name)
    }

    pub fn create_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if databases.iter().any(|db| db.name == name) {
            return Err(CatalogError::DatabaseExists(name.to_string()));
        }
        databases.push(DatabaseEntry { name: name.to_string(), ..Default::default() });
        self.save(&databases)
    }

    pub fn drop_database(&self, name: &str) -> Result<()> {
        let mut databases = self.databases.write();
        let before = databases.len();
        databases.retain(|db| db.name != name);
        if databases.len() == before {
            return Err(CatalogError::DatabaseNotFound(name.to_string()));
        }
        self.save(&databases)
    }

    pub fn tables(&self, database: &str) -> Result<Vec<TableEntry>> {
        let databases = self.databases.read();
        let db = databases
            .iter()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        Ok(db.tables.clone())
    }

    pub fn find_table(&self, database: &str, table: &str) -> Option<TableEntry> {
        let databases = self.databases.read();
        databases
            .iter()
            .find(|db| db.name == database)?
            .tables
            .iter()
            .find(|t| t.name == table)
            .cloned()
    }

    pub fn create_table(&self, database: &str, entry: TableEntry) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        if db.tables.iter().any(|t| t.name == entry.name) {
            return Err(CatalogError::TableExists {
                database: database.to_string(),
                table: entry.name,
            });
        }
        db.tables.push(entry);
        self.save(&databases)
    }

    pub fn drop_table(&self, database: &str, table: &str) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        let before = db.tables.len();
        db.tables.retain(|t| t.name != table);
        if db.tables.len() == before {
            return Err(CatalogError::TableNotFound {
                database: database.to_string(),
                table: table.to_string(),
            });
        }
        self.save(&databases)
    }

    /// Replace a table's column list; schema adoption on schema-less tables
    /// goes through here.
    pub fn update_table_columns(
        &self,
        database: &str,
        table: &str,
        columns: Vec<ColumnEntry>,
    ) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        let entry = db.tables.iter_mut().find(|t| t.name == table).ok_or_else(|| {
            CatalogError::TableNotFound {
                database: database.to_string(),
                table: table.to_string(),
            }
        })?;
        entry.columns = columns;
        self.save(&databases)
    }

    pub fn sequences(&self, database: &str) -> Vec<SequenceEntry> {
        let databases = self.databases.read();
        databases
            .iter()
            .find(|db| db.name == database)
            .map(|db| db.sequences.clone())
            .unwrap_or_default()
    }

    pub fn create_sequence(&self, database: &str, entry: SequenceEntry) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        db.sequences.retain(|s| s.name != entry.name);
        db.sequences.push(entry);
        self.save(&databases)
    }

    pub fn drop_sequence(&self, database: &str, name: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if let Some(db) = databases.iter_mut().find(|db| db.name == database) {
            db.sequences.retain(|s| s.name != name);
        }
        self.save(&databases)
    }

    pub fn views(&self, database: &str) -> Vec<ViewEntry> {
        let databases = self.databases.read();
        databases
            .iter()
            .find(|db| db.name == database)
            .map(|db| db.views.clone())
            .unwrap_or_default()
    }

    pub fn create_view(&self, database: &str, entry: ViewEntry) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        db.views.retain(|v| v.name != entry.name);
        db.views.push(entry);
        self.save(&databases)
    }

    pub fn drop_view(&self, database: &str, name: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if let Some(db) = databases.iter_mut().find(|db| db.name == database) {
            db.views.retain(|v| v.name != name);
        }
        self.save(&databases)
    }

    pub fn macros(&self, database: &str) -> Vec<MacroEntry> {
        let databases = self.databases.read();
        databases
            .iter()
            .find(|db| db.name == database)
            .map(|db| db.macros.clone())
            .unwrap_or_default()
    }

    pub fn create_macro(&self, database: &str, entry: MacroEntry) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .iter_mut()
            .find(|db| db.name == database)
            .ok_or_else(|| CatalogError::DatabaseNotFound(database.to_string()))?;
        db.macros.retain(|m| m.name != entry.name);
        db.macros.push(entry);
        self.save(&databases)
    }

    pub fn drop_macro(&self, database: &str, name: &str) -> Result<()> {
        let mut databases = self.databases.write();
        if let Some(db) = databases.iter_mut().find(|db| db.name == database) {
            db.macros.retain(|m| m.name != name);
        }
        self.save(&databases)
    }

    /// Snapshot of everything; the loader iterates this on startup.
    pub fn snapshot(&self) -> Vec<DatabaseEntry> {
        self.databases.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_and_table_lifecycle() {
        let catalog = Catalog::ephemeral();
        catalog.create_database("db").unwrap();
        assert!(catalog.database_exists("db"));
        assert_matches::assert_matches!(
            catalog.create_database("db"),
            Err(CatalogError::DatabaseExists(_))
        );

        let table = TableEntry {
            name: "t".into(),
            storage_mode: TableStorageMode::Disk,
            columns: vec![ColumnEntry {
                name: "id".into(),
                ty: LogicalType::Int64,
                not_null: true,
                has_default: false,
            }],
            primary_key_columns: vec!["id".into()],
        };
        catalog.create_table("db", table.clone()).unwrap();
        assert_eq!(catalog.find_table("db", "t"), Some(table));

        catalog.drop_table("db", "t").unwrap();
        assert!(catalog.find_table("db", "t").is_none());

        catalog.drop_database("db").unwrap();
        assert!(!catalog.database_exists("db"));
    }
}
