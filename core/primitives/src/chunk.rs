use crate::types::LogicalType;
use crate::value::Value;
use crate::vector::Vector;
use crate::{TypeError, VECTOR_CAPACITY};
use std::hash::{Hash, Hasher};

/// An ordered list of equal-length vectors: the unit of data flow between
/// physical operators. Storage produces batches of at most
/// [`VECTOR_CAPACITY`] rows; operators that materialize their whole input
/// (sort, group) may concatenate batches beyond that. Optionally carries a
/// parallel `row_ids` vector naming the absolute source row of each tuple.
#[derive(Debug, Clone, Default)]
pub struct DataChunk {
    columns: Vec<Vector>,
    cardinality: usize,
    row_ids: Option<Vector>,
}

impl DataChunk {
    /// An empty chunk with the given column types.
    pub fn new(types: &[LogicalType]) -> Self {
        Self {
            columns: types.iter().map(|ty| Vector::empty(ty.clone())).collect(),
            cardinality: 0,
            row_ids: None,
        }
    }

    /// A chunk of `rows` default-initialized rows, ready for `set_value`.
    pub fn with_rows(types: &[LogicalType], rows: usize) -> Self {
        debug_assert!(rows <= VECTOR_CAPACITY);
        Self {
            columns: types.iter().map(|ty| Vector::with_len(ty.clone(), rows)).collect(),
            cardinality: rows,
            row_ids: None,
        }
    }

    pub fn from_columns(columns: Vec<Vector>, cardinality: usize) -> Self {
        Self { columns, cardinality, row_ids: None }
    }

    pub fn size(&self) -> usize {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Vector] {
        &self.columns
    }

    pub fn columns_mut(&mut self) -> &mut Vec<Vector> {
        &mut self.columns
    }

    pub fn column(&self, idx: usize) -> &Vector {
        &self.columns[idx]
    }

    pub fn column_mut(&mut self, idx: usize) -> &mut Vector {
        &mut self.columns[idx]
    }

    pub fn types(&self) -> Vec<LogicalType> {
        self.columns.iter().map(|c| c.ty().clone()).collect()
    }

    pub fn set_cardinality(&mut self, cardinality: usize) {
        debug_assert!(cardinality <= VECTOR_CAPACITY);
        self.cardinality = cardinality;
    }

    pub fn value(&self, column: usize, row: usize) -> Value {
        self.columns[column].value(row)
    }

    pub fn set_value(&mut self, column: usize, row: usize, value: &Value) -> Result<(), TypeError> {
        self.columns[column].set_value(row, value)
    }

    /// The column whose alias is `name`, if any.
    pub fn column_by_alias(&self, name: &str) -> Option<&Vector> {
        self.columns.iter().find(|c| c.alias() == Some(name))
    }

    pub fn column_index_by_alias(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.alias() == Some(name))
    }

    pub fn row_ids(&self) -> Option<&Vector> {
        self.row_ids.as_ref()
    }

    pub fn set_row_ids(&mut self, row_ids: Vector) {
        self.row_ids = Some(row_ids);
    }

    pub fn take_row_ids(&mut self) -> Option<Vector> {
        self.row_ids.take()
    }

    /// Gather `sel` rows into a new chunk, row_ids included.
    pub fn slice(&self, sel: &[usize]) -> DataChunk {
        DataChunk {
            columns: self.columns.iter().map(|c| c.slice(sel)).collect(),
            cardinality: sel.len(),
            row_ids: self.row_ids.as_ref().map(|ids| ids.slice(sel)),
        }
    }

    /// Append all rows of `other`, which must have the same column types.
    /// The combined cardinality must stay within [`VECTOR_CAPACITY`].
    pub fn append(&mut self, other: &DataChunk) -> Result<(), TypeError> {
        debug_assert_eq!(self.column_count(), other.column_count());
        for row in 0..other.size() {
            for col in 0..self.columns.len() {
                let v = other.value(col, row);
                self.columns[col].push_value(&v)?;
            }
        }
        self.cardinality += other.size();
        Ok(())
    }

    /// Push one row of values.
    pub fn push_row(&mut self, row: &[Value]) -> Result<(), TypeError> {
        debug_assert_eq!(row.len(), self.columns.len());
        for (col, value) in row.iter().enumerate() {
            self.columns[col].push_value(value)?;
        }
        self.cardinality += 1;
        Ok(())
    }

    /// Drop all rows, keeping the type signature.
    pub fn reset(&mut self) {
        let types = self.types();
        let aliases: Vec<_> = self.columns.iter().map(|c| c.alias().map(str::to_owned)).collect();
        self.columns = types.iter().map(|ty| Vector::empty(ty.clone())).collect();
        for (col, alias) in self.columns.iter_mut().zip(aliases) {
            if let Some(alias) = alias {
                col.set_alias(alias);
            }
        }
        self.cardinality = 0;
        self.row_ids = None;
    }

    /// Hash the given key columns row-wise into `out` (resized to fit).
    /// Used by the grouping fast path; the hash is over materialized values
    /// so that equal keys of different widths collide as they compare.
    pub fn hash_rows(&self, key_columns: &[usize], out: &mut Vec<u64>) {
        out.clear();
        out.reserve(self.cardinality);
        for row in 0..self.cardinality {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            for &col in key_columns {
                self.columns[col].value(row).hash(&mut hasher);
            }
            out.push(hasher.finish());
        }
    }
}
