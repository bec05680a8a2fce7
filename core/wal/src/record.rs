use crate::{Result, WalError, WalId};
use byteorder::{BigEndian, ByteOrder};
use otter_plan::{ParameterBinding, PlanNode};

/// Decoded payload of one WAL record.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Data {
        last_crc32: u32,
        id: WalId,
        transaction_id: u64,
        node: PlanNode,
        params: ParameterBinding,
    },
    Commit {
        last_crc32: u32,
        id: WalId,
        transaction_id: u64,
    },
}

impl WalRecord {
    pub fn id(&self) -> WalId {
        match self {
            WalRecord::Data { id, .. } | WalRecord::Commit { id, .. } => *id,
        }
    }

    pub fn transaction_id(&self) -> u64 {
        match self {
            WalRecord::Data { transaction_id, .. } | WalRecord::Commit { transaction_id, .. } => {
                *transaction_id
            }
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            WalRecord::Data { last_crc32, id, transaction_id, node, params } => {
                rmp_serde::to_vec(&(*last_crc32, *id, *transaction_id, node, params))
                    .map_err(otter_plan::PlanError::from)?
            }
            WalRecord::Commit { last_crc32, id, transaction_id } => {
                rmp_serde::to_vec(&(*last_crc32, *id, *transaction_id))
                    .map_err(otter_plan::PlanError::from)?
            }
        };
        Ok(bytes)
    }

    pub fn decode_payload(payload: &[u8]) -> Result<WalRecord> {
        // A DATA record is a 5-element array, a COMMIT marker a 3-element
        // one; try the longer shape first.
        if let Ok((last_crc32, id, transaction_id, node, params)) =
            rmp_serde::from_slice::<(u32, WalId, u64, PlanNode, ParameterBinding)>(payload)
        {
            return Ok(WalRecord::Data { last_crc32, id, transaction_id, node, params });
        }
        if let Ok((last_crc32, id, transaction_id)) =
            rmp_serde::from_slice::<(u32, WalId, u64)>(payload)
        {
            return Ok(WalRecord::Commit { last_crc32, id, transaction_id });
        }
        Err(WalError::MalformedPayload)
    }
}

/// Byte-level framing of records inside a shard file.
pub struct WalFrame;

impl WalFrame {
    pub const SIZE_BYTES: usize = 4;
    pub const CRC_BYTES: usize = 4;

    /// `[size: u32 BE][payload][crc32c(payload): u32 BE]`
    pub fn encode(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE_BYTES + payload.len() + Self::CRC_BYTES);
        let mut size = [0u8; 4];
        BigEndian::write_u32(&mut size, payload.len() as u32);
        out.extend_from_slice(&size);
        out.extend_from_slice(payload);
        let mut crc = [0u8; 4];
        BigEndian::write_u32(&mut crc, crc32c::crc32c(payload));
        out.extend_from_slice(&crc);
        out
    }

    /// Decode one frame starting at `offset` in `bytes`. Returns the
    /// payload slice, its CRC validity, and the offset of the next frame.
    /// `None` when fewer bytes than a complete frame remain.
    pub fn decode(bytes: &[u8], offset: usize) -> Option<(&[u8], bool, usize)> {
        if offset + Self::SIZE_BYTES > bytes.len() {
            return None;
        }
        let size = BigEndian::read_u32(&bytes[offset..offset + Self::SIZE_BYTES]) as usize;
        if size == 0 {
            return None;
        }
        let payload_start = offset + Self::SIZE_BYTES;
        let crc_start = payload_start + size;
        let next = crc_start + Self::CRC_BYTES;
        if next > bytes.len() {
            return None;
        }
        let payload = &bytes[payload_start..crc_start];
        let stored_crc = BigEndian::read_u32(&bytes[crc_start..next]);
        let valid = stored_crc == crc32c::crc32c(payload);
        Some((payload, valid, next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_plan::{CollectionName, Limit, PlanNode};

    fn data_record() -> WalRecord {
        WalRecord::Data {
            last_crc32: 0xDEAD,
            id: 7,
            transaction_id: 0,
            node: PlanNode::Delete {
                collection: CollectionName::new("db", "t"),
                r#match: None,
                limit: Limit::unlimit(),
            },
            params: ParameterBinding::new(),
        }
    }

    #[test]
    fn data_record_round_trip() {
        let record = data_record();
        let payload = record.encode_payload().unwrap();
        assert_eq!(WalRecord::decode_payload(&payload).unwrap(), record);
    }

    #[test]
    fn commit_marker_round_trip() {
        let record = WalRecord::Commit { last_crc32: 5, id: 9, transaction_id: 1 << 62 };
        let payload = record.encode_payload().unwrap();
        assert_eq!(WalRecord::decode_payload(&payload).unwrap(), record);
    }

    #[test]
    fn frame_detects_corruption() {
        let payload = data_record().encode_payload().unwrap();
        let mut framed = WalFrame::encode(&payload);
        let (decoded, valid, _) = WalFrame::decode(&framed, 0).unwrap();
        assert!(valid);
        assert_eq!(decoded, payload.as_slice());

        // flip one payload byte
        framed[WalFrame::SIZE_BYTES + 2] ^= 0xFF;
        let (_, valid, next) = WalFrame::decode(&framed, 0).unwrap();
        assert!(!valid);
        assert_eq!(next, framed.len());
    }

    #[test]
    fn truncated_frame_yields_none() {
        let payload = data_record().encode_payload().unwrap();
        let framed = WalFrame::encode(&payload);
        assert!(WalFrame::decode(&framed[..framed.len() - 1], 0).is_none());
        assert!(WalFrame::decode(&framed, framed.len()).is_none());
    }
}
