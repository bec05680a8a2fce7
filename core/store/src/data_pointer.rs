use crate::metadata::{MetadataReader, MetadataWriter};
use crate::Result;

/// Location of a byte range inside a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockPointer {
    pub block_id: u64,
    pub offset: u32,
}

/// On-disk address of one column segment: where it lives, how it is encoded
/// and which rows it covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataPointer {
    pub row_start: u64,
    pub tuple_count: u64,
    pub block_pointer: BlockPointer,
    /// Compression code; 0 = uncompressed.
    pub compression: u8,
    pub segment_size: u64,
}

impl DataPointer {
    pub fn serialize(&self, writer: &mut MetadataWriter<'_>) {
        writer.write_u64(self.row_start);
        writer.write_u64(self.tuple_count);
        writer.write_u64(self.block_pointer.block_id);
        writer.write_u32(self.block_pointer.offset);
        writer.write_u8(self.compression);
        writer.write_u64(self.segment_size);
    }

    pub fn deserialize(reader: &mut MetadataReader<'_>) -> Result<Self> {
        Ok(Self {
            row_start: reader.read_u64()?,
            tuple_count: reader.read_u64()?,
            block_pointer: BlockPointer {
                block_id: reader.read_u64()?,
                offset: reader.read_u32()?,
            },
            compression: reader.read_u8()?,
            segment_size: reader.read_u64()?,
        })
    }
}

/// Everything needed to reconstruct one row group: per-column segment lists
/// plus the delete-list segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowGroupPointer {
    pub row_start: u64,
    pub tuple_count: u64,
    pub data_pointers: Vec<Vec<DataPointer>>,
    pub delete_pointers: Vec<DataPointer>,
}

impl RowGroupPointer {
    pub fn serialize(&self, writer: &mut MetadataWriter<'_>) {
        writer.write_u64(self.row_start);
        writer.write_u64(self.tuple_count);

        writer.write_u32(self.data_pointers.len() as u32);
        for column_pointers in &self.data_pointers {
            writer.write_u32(column_pointers.len() as u32);
            for pointer in column_pointers {
                pointer.serialize(writer);
            }
        }

        writer.write_u32(self.delete_pointers.len() as u32);
        for pointer in &self.delete_pointers {
            pointer.serialize(writer);
        }
    }

    pub fn deserialize(reader: &mut MetadataReader<'_>) -> Result<Self> {
        let row_start = reader.read_u64()?;
        let tuple_count = reader.read_u64()?;

        let column_count = reader.read_u32()? as usize;
        let mut data_pointers = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let segment_count = reader.read_u32()? as usize;
            let mut column_pointers = Vec::with_capacity(segment_count);
            for _ in 0..segment_count {
                column_pointers.push(DataPointer::deserialize(reader)?);
            }
            data_pointers.push(column_pointers);
        }

        let delete_count = reader.read_u32()? as usize;
        let mut delete_pointers = Vec::with_capacity(delete_count);
        for _ in 0..delete_count {
            delete_pointers.push(DataPointer::deserialize(reader)?);
        }

        Ok(Self { row_start, tuple_count, data_pointers, delete_pointers })
    }
}
