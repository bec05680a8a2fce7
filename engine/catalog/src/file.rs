use crate::{
    CatalogError, ColumnEntry, DatabaseEntry, MacroEntry, Result, SequenceEntry, TableEntry,
    TableStorageMode, ViewEntry,
};
use byteorder::{ByteOrder, LittleEndian};
use otter_primitives::LogicalType;
use std::io::Write;
use std::path::PathBuf;

/// "OTBX" little-endian.
const CATALOG_MAGIC: u32 = 0x5842544F;
const CATALOG_FORMAT_VERSION: u32 = 2;

struct Writer {
    data: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn u8(&mut self, v: u8) {
        self.data.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.pos + n > self.data.len() {
            return Err(CatalogError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = LittleEndian::read_u32(&self.data[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64> {
        self.need(8)?;
        let v = LittleEndian::read_i64(&self.data[self.pos..self.pos + 8]);
        self.pos += 8;
        Ok(v)
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let s = String::from_utf8_lossy(&self.data[self.pos..self.pos + len]).into_owned();
        self.pos += len;
        Ok(s)
    }
}

/// Serialize the whole catalog: magic, version, databases, trailing CRC32
/// over everything after magic + version.
pub fn serialize_catalog(databases: &[DatabaseEntry]) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(CATALOG_MAGIC);
    w.u32(CATALOG_FORMAT_VERSION);
    w.u32(databases.len() as u32);

    for db in databases {
        w.string(&db.name);

        w.u32(db.tables.len() as u32);
        for table in &db.tables {
            w.string(&table.name);
            w.u8(table.storage_mode.as_u8());
            w.u32(table.columns.len() as u32);
            for column in &table.columns {
                w.string(&column.name);
                w.u8(column.ty.type_tag());
                w.u8(column.not_null as u8);
                w.u8(column.has_default as u8);
            }
            w.u32(table.primary_key_columns.len() as u32);
            for pk in &table.primary_key_columns {
                w.string(pk);
            }
        }

        w.u32(db.sequences.len() as u32);
        for seq in &db.sequences {
            w.string(&seq.name);
            w.i64(seq.start_value);
            w.i64(seq.increment);
            w.i64(seq.current_value);
            w.i64(seq.min_value);
            w.i64(seq.max_value);
        }

        w.u32(db.views.len() as u32);
        for view in &db.views {
            w.string(&view.name);
            w.string(&view.query_sql);
        }

        w.u32(db.macros.len() as u32);
        for mac in &db.macros {
            w.string(&mac.name);
            w.u32(mac.parameters.len() as u32);
            for param in &mac.parameters {
                w.string(param);
            }
            w.string(&mac.body_sql);
        }
    }

    let crc = crc32fast::hash(&w.data[8..]);
    w.u32(crc);
    w.data
}

pub fn deserialize_catalog(bytes: &[u8]) -> Result<Vec<DatabaseEntry>> {
    // magic(4) + version(4) + crc(4) minimum
    if bytes.len() < 12 {
        return Err(CatalogError::FileTooSmall);
    }

    let mut r = Reader::new(bytes);
    let magic = r.u32()?;
    if magic != CATALOG_MAGIC {
        return Err(CatalogError::BadMagic);
    }
    let version = r.u32()?;
    if version > CATALOG_FORMAT_VERSION {
        return Err(CatalogError::UnsupportedVersion(version));
    }

    let stored_crc = LittleEndian::read_u32(&bytes[bytes.len() - 4..]);
    let computed_crc = crc32fast::hash(&bytes[8..bytes.len() - 4]);
    if stored_crc != computed_crc {
        return Err(CatalogError::ChecksumMismatch);
    }

    let database_count = r.u32()? as usize;
    let mut databases = Vec::with_capacity(database_count);
    for _ in 0..database_count {
        let mut db = DatabaseEntry { name: r.string()?, ..Default::default() };

        let table_count = r.u32()? as usize;
        for _ in 0..table_count {
            let mut table = TableEntry {
                name: r.string()?,
                storage_mode: TableStorageMode::from_u8(r.u8()?),
                ..Default::default()
            };
            let column_count = r.u32()? as usize;
            for _ in 0..column_count {
                let name = r.string()?;
                let tag = r.u8()?;
                let ty =
                    LogicalType::from_type_tag(tag).ok_or(CatalogError::UnknownTypeTag(tag))?;
                let (not_null, has_default) = if version >= 2 {
                    (r.u8()? != 0, r.u8()? != 0)
                } else {
                    (false, false)
                };
                table.columns.push(ColumnEntry { name, ty, not_null, has_default });
            }
            if version >= 2 {
                let pk_count = r.u32()? as usize;
                for _ in 0..pk_count {
                    table.primary_key_columns.push(r.string()?);
                }
            }
            db.tables.push(table);
        }

        if version >= 2 {
            let sequence_count = r.u32()? as usize;
            for _ in 0..sequence_count {
                db.sequences.push(SequenceEntry {
                    name: r.string()?,
                    start_value: r.i64()?,
                    increment: r.i64()?,
                    current_value: r.i64()?,
                    min_value: r.i64()?,
                    max_value: r.i64()?,
                });
            }
            let view_count = r.u32()? as usize;
            for _ in 0..view_count {
                db.views.push(ViewEntry { name: r.string()?, query_sql: r.string()? });
            }
            let macro_count = r.u32()? as usize;
            for _ in 0..macro_count {
                let name = r.string()?;
                let param_count = r.u32()? as usize;
                let mut parameters = Vec::with_capacity(param_count);
                for _ in 0..param_count {
                    parameters.push(r.string()?);
                }
                db.macros.push(MacroEntry { name, parameters, body_sql: r.string()? });
            }
        }

        databases.push(db);
    }

    Ok(databases)
}

/// The catalog file on disk. Writes are atomic: serialize to `<path>.tmp`,
/// fsync, rename over the live file.
pub struct CatalogFile {
    path: PathBuf,
}

impl CatalogFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Load the catalog, or an empty one when the file does not exist.
    pub fn load(&self) -> Result<Vec<DatabaseEntry>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        deserialize_catalog(&bytes)
    }

    pub fn save(&self, databases: &[DatabaseEntry]) -> Result<()> {
        let bytes = serialize_catalog(databases);
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        tracing::debug!(
            target: "catalog",
            path = %self.path.display(),
            bytes = bytes.len(),
            "catalog rewritten"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn sample_catalog() -> Vec<DatabaseEntry> {
        vec![DatabaseEntry {
            name: "db".into(),
            tables: vec![TableEntry {
                name: "users".into(),
                storage_mode: TableStorageMode::Disk,
                columns: vec![
                    ColumnEntry {
                        name: "id".into(),
                        ty: LogicalType::Int64,
                        not_null: true,
                        has_default: false,
                    },
                    ColumnEntry {
                        name: "name".into(),
                        ty: LogicalType::String,
                        not_null: false,
                        has_default: false,
                    },
                ],
                primary_key_columns: vec!["id".into()],
            }],
            sequences: vec![SequenceEntry::new("user_ids")],
            views: vec![ViewEntry { name: "v".into(), query_sql: "SELECT 1".into() }],
            macros: vec![MacroEntry {
                name: "m".into(),
                parameters: vec!["x".into()],
                body_sql: "x + 1".into(),
            }],
        }]
    }

    #[test]
    fn serialize_round_trips() {
        let catalog = sample_catalog();
        let bytes = serialize_catalog(&catalog);
        assert_eq!(deserialize_catalog(&bytes).unwrap(), catalog);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut bytes = serialize_catalog(&sample_catalog());
        let flip_at = bytes.len() / 2;
        bytes[flip_at] ^= 0xFF;
        assert_matches!(deserialize_catalog(&bytes), Err(CatalogError::ChecksumMismatch));
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let mut bytes = serialize_catalog(&sample_catalog());
        bytes[0] = 0;
        assert_matches!(deserialize_catalog(&bytes), Err(CatalogError::BadMagic));
    }

    #[test]
    fn file_round_trip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = CatalogFile::new(dir.path().join("catalog.otbx"));
        assert!(file.load().unwrap().is_empty());

        let catalog = sample_catalog();
        file.save(&catalog).unwrap();
        assert_eq!(file.load().unwrap(), catalog);

        // no stray tmp file remains
        assert!(!dir.path().join("catalog.tmp").exists());
    }
}
