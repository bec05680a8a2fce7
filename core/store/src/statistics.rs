use crate::metadata::{MetadataReader, MetadataWriter};
use crate::Result;
use otter_primitives::{LogicalType, Value, Vector, VectorKind};

/// Conservative per-column statistics: for every visible value `v` of the
/// column, `min <= v <= max`. Null counts accumulate across batches.
#[derive(Debug, Clone)]
pub struct BaseStatistics {
    ty: LogicalType,
    min: Value,
    max: Value,
    null_count: u64,
    has_stats: bool,
}

impl BaseStatistics {
    pub fn new(ty: LogicalType) -> Self {
        Self { ty, min: Value::Null, max: Value::Null, null_count: 0, has_stats: false }
    }

    pub fn ty(&self) -> &LogicalType {
        &self.ty
    }

    pub fn min(&self) -> &Value {
        &self.min
    }

    pub fn max(&self) -> &Value {
        &self.max
    }

    pub fn null_count(&self) -> u64 {
        self.null_count
    }

    pub fn has_stats(&self) -> bool {
        self.has_stats
    }

    fn absorb(&mut self, batch_min: Value, batch_max: Value) {
        if !self.has_stats {
            self.min = batch_min;
            self.max = batch_max;
            self.has_stats = true;
        } else {
            if batch_min < self.min {
                self.min = batch_min;
            }
            if batch_max > self.max {
                self.max = batch_max;
            }
        }
    }

    /// Fold one vector's `count` rows into the statistics.
    ///
    /// A constant vector contributes its single value once, or `count` nulls
    /// when the slot is invalid. Types without an ordering (struct, list)
    /// only track null counts.
    pub fn update(&mut self, vector: &Vector, count: usize) {
        if count == 0 {
            return;
        }
        if vector.kind() == VectorKind::Constant {
            if vector.is_null(0) {
                self.null_count += count as u64;
            } else {
                let v = vector.value(0);
                self.absorb(v.clone(), v);
            }
            return;
        }

        let mut found: Option<(Value, Value)> = None;
        let mut nulls = 0u64;
        for row in 0..count {
            if vector.is_null(row) {
                nulls += 1;
                continue;
            }
            let v = vector.value(row);
            if !self.supports_min_max() {
                continue;
            }
            match &mut found {
                None => found = Some((v.clone(), v)),
                Some((min, max)) => {
                    if v < *min {
                        *min = v;
                    } else if v > *max {
                        *max = v;
                    }
                }
            }
        }
        self.null_count += nulls;
        if let Some((min, max)) = found {
            self.absorb(min, max);
        }
    }

    fn supports_min_max(&self) -> bool {
        !matches!(
            self.ty,
            LogicalType::Struct { .. } | LogicalType::List { .. } | LogicalType::Null
        )
    }

    /// Merge another column's statistics into this one (checkpoint merge of
    /// segment stats into row-group stats).
    pub fn merge(&mut self, other: &BaseStatistics) {
        self.null_count += other.null_count;
        if other.has_stats {
            self.absorb(other.min.clone(), other.max.clone());
        }
    }

    pub fn serialize(&self, writer: &mut MetadataWriter<'_>) {
        writer.write_u8(self.ty.type_tag());
        writer.write_u64(self.null_count);
        writer.write_u8(self.has_stats as u8);
        if self.has_stats {
            serialize_value(&self.min, writer);
            serialize_value(&self.max, writer);
        }
    }

    pub fn deserialize(ty: LogicalType, reader: &mut MetadataReader<'_>) -> Result<Self> {
        let _tag = reader.read_u8()?;
        let null_count = reader.read_u64()?;
        let has_stats = reader.read_u8()? != 0;
        let (min, max) = if has_stats {
            (deserialize_value(&ty, reader)?, deserialize_value(&ty, reader)?)
        } else {
            (Value::Null, Value::Null)
        };
        Ok(Self { ty, min, max, null_count, has_stats })
    }
}

fn serialize_value(value: &Value, writer: &mut MetadataWriter<'_>) {
    match value {
        Value::Boolean(v) => writer.write_u8(*v as u8),
        Value::Int8(v) => writer.write_u8(*v as u8),
        Value::Int16(v) => writer.write_u16(*v as u16),
        Value::Int32(v) => writer.write_u32(*v as u32),
        Value::Int64(v) => writer.write_i64(*v),
        Value::Int128(v) => {
            writer.write_u64(*v as u64);
            writer.write_u64((*v >> 64) as u64);
        }
        Value::UInt8(v) => writer.write_u8(*v),
        Value::UInt16(v) => writer.write_u16(*v),
        Value::UInt32(v) => writer.write_u32(*v),
        Value::UInt64(v) => writer.write_u64(*v),
        Value::UInt128(v) => {
            writer.write_u64(*v as u64);
            writer.write_u64((*v >> 64) as u64);
        }
        Value::Float(v) => writer.write_u32(v.to_bits()),
        Value::Double(v) => writer.write_f64(*v),
        Value::Decimal { value, .. } => writer.write_i64(*value),
        Value::Timestamp { value, .. } => writer.write_i64(*value),
        Value::Enum(v) => writer.write_u32(*v),
        Value::String(s) => writer.write_string(s),
        Value::Null | Value::Struct(_) | Value::List(_) => {}
    }
}

fn deserialize_value(ty: &LogicalType, reader: &mut MetadataReader<'_>) -> Result<Value> {
    Ok(match ty {
        LogicalType::Boolean => Value::Boolean(reader.read_u8()? != 0),
        LogicalType::Int8 => Value::Int8(reader.read_u8()? as i8),
        LogicalType::Int16 => Value::Int16(reader.read_u16()? as i16),
        LogicalType::Int32 => Value::Int32(reader.read_u32()? as i32),
        LogicalType::Int64 => Value::Int64(reader.read_i64()?),
        LogicalType::Int128 => {
            let lo = reader.read_u64()? as u128;
            let hi = reader.read_u64()? as u128;
            Value::Int128(((hi << 64) | lo) as i128)
        }
        LogicalType::UInt8 => Value::UInt8(reader.read_u8()?),
        LogicalType::UInt16 => Value::UInt16(reader.read_u16()?),
        LogicalType::UInt32 => Value::UInt32(reader.read_u32()?),
        LogicalType::UInt64 => Value::UInt64(reader.read_u64()?),
        LogicalType::UInt128 => {
            let lo = reader.read_u64()? as u128;
            let hi = reader.read_u64()? as u128;
            Value::UInt128((hi << 64) | lo)
        }
        LogicalType::Float => Value::Float(f32::from_bits(reader.read_u32()?)),
        LogicalType::Double => Value::Double(reader.read_f64()?),
        LogicalType::Decimal { width, scale } => {
            Value::Decimal { value: reader.read_i64()?, width: *width, scale: *scale }
        }
        LogicalType::Timestamp(unit) => {
            Value::Timestamp { value: reader.read_i64()?, unit: *unit }
        }
        LogicalType::Enum { .. } => Value::Enum(reader.read_u32()?),
        LogicalType::String => Value::String(reader.read_string()?),
        LogicalType::Struct { .. } | LogicalType::List { .. } | LogicalType::Null => Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_manager::{BlockManager, InMemoryBlockManager};
    use crate::metadata::MetadataManager;
    use otter_primitives::Vector;
    use std::sync::Arc;

    #[test]
    fn update_tracks_min_max_and_nulls() {
        let mut stats = BaseStatistics::new(LogicalType::Int64);
        let mut vec = Vector::with_len(LogicalType::Int64, 5);
        for (row, v) in [3i64, -7, 12, 0].iter().enumerate() {
            vec.set_value(row, &Value::Int64(*v)).unwrap();
        }
        vec.set_value(4, &Value::Null).unwrap();

        stats.update(&vec, 5);
        assert!(stats.has_stats());
        assert_eq!(stats.min(), &Value::Int64(-7));
        assert_eq!(stats.max(), &Value::Int64(12));
        assert_eq!(stats.null_count(), 1);
    }

    #[test]
    fn constant_vector_counts_once_or_all_null() {
        let mut stats = BaseStatistics::new(LogicalType::Int32);
        let vec = Vector::constant(LogicalType::Int32, &Value::Int32(9)).unwrap();
        stats.update(&vec, 100);
        assert_eq!(stats.min(), &Value::Int32(9));
        assert_eq!(stats.null_count(), 0);

        let nulls = Vector::constant(LogicalType::Int32, &Value::Null).unwrap();
        stats.update(&nulls, 100);
        assert_eq!(stats.null_count(), 100);
    }

    #[test]
    fn merge_widens_bounds() {
        let mut a = BaseStatistics::new(LogicalType::Int64);
        let mut left = Vector::with_len(LogicalType::Int64, 1);
        left.set_value(0, &Value::Int64(5)).unwrap();
        a.update(&left, 1);

        let mut b = BaseStatistics::new(LogicalType::Int64);
        let mut right = Vector::with_len(LogicalType::Int64, 2);
        right.set_value(0, &Value::Int64(-3)).unwrap();
        right.set_value(1, &Value::Null).unwrap();
        b.update(&right, 2);

        a.merge(&b);
        assert_eq!(a.min(), &Value::Int64(-3));
        assert_eq!(a.max(), &Value::Int64(5));
        assert_eq!(a.null_count(), 1);
    }

    #[test]
    fn string_stats_round_trip() {
        let bm: Arc<dyn BlockManager> = Arc::new(InMemoryBlockManager::default());
        let mut manager = MetadataManager::new(bm);

        let mut stats = BaseStatistics::new(LogicalType::String);
        let mut vec = Vector::with_len(LogicalType::String, 2);
        vec.set_value(0, &Value::String("apple".into())).unwrap();
        vec.set_value(1, &Value::String("zebra".into())).unwrap();
        stats.update(&vec, 2);

        let pointer = {
            let mut writer = MetadataWriter::new(&mut manager);
            stats.serialize(&mut writer);
            writer.block_pointer()
        };
        let mut reader = MetadataReader::new(&mut manager, pointer);
        let loaded = BaseStatistics::deserialize(LogicalType::String, &mut reader).unwrap();
        assert_eq!(loaded.min(), &Value::String("apple".into()));
        assert_eq!(loaded.max(), &Value::String("zebra".into()));
    }
}
