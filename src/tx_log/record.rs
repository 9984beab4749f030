use crate::{
    error::KvError,
    io::{SmallReader, SmallWriter},
    types::KvResult,
    utils::now_millis,
};

/// Operation kind of a WAL record. The numeric encoding is part of the
/// on-disk format and stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    Cas,
    TxBegin,
    TxCommit,
    TxRollback,
}

impl OpKind {
    pub fn to_u32(self) -> u32 {
        match self {
            OpKind::Insert => 0,
            OpKind::Update => 1,
            OpKind::Delete => 2,
            OpKind::Cas => 3,
            OpKind::TxBegin => 4,
            OpKind::TxCommit => 5,
            OpKind::TxRollback => 6,
        }
    }

    pub fn from_u32(value: u32) -> KvResult<Self> {
        match value {
            0 => Ok(OpKind::Insert),
            1 => Ok(OpKind::Update),
            2 => Ok(OpKind::Delete),
            3 => Ok(OpKind::Cas),
            4 => Ok(OpKind::TxBegin),
            5 => Ok(OpKind::TxCommit),
            6 => Ok(OpKind::TxRollback),
            other => Err(KvError::corruption(format!(
                "invalid op kind {} in log record",
                other
            ))),
        }
    }

    /// Whether this record carries a data operation, as opposed to a
    /// transaction state marker.
    pub fn is_data(self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::Update | OpKind::Delete | OpKind::Cas
        )
    }
}

/// One write-ahead log record.
///
/// # Body format
///
/// ```text
/// u64 sequence | u64 transaction_id | u32 op_kind | u64 timestamp_ms
/// | u32 klen | key | u32 vlen | new_value | u32 olen | old_value
/// ```
///
/// On disk each body is framed by a 4-byte big-endian length prefix.
/// Absent byte slots encode as length 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Assigned by the log manager on append. Strictly increasing in
    /// on-disk order.
    pub sequence: u64,
    pub tx_id: u64,
    pub op: OpKind,
    /// Wall-clock capture time, kept for audit tooling only.
    pub timestamp_ms: u64,
    pub key: Vec<u8>,
    pub new_value: Vec<u8>,
    pub old_value: Vec<u8>,
}

impl LogRecord {
    /// A data record (insert, update, delete or compare-and-set).
    pub fn data(
        tx_id: u64,
        op: OpKind,
        key: Vec<u8>,
        new_value: Vec<u8>,
        old_value: Vec<u8>,
    ) -> Self {
        debug_assert!(op.is_data());
        Self {
            sequence: 0,
            tx_id,
            op,
            timestamp_ms: now_millis(),
            key,
            new_value,
            old_value,
        }
    }

    /// A transaction state marker (begin, commit or rollback).
    pub fn marker(tx_id: u64, op: OpKind) -> Self {
        debug_assert!(!op.is_data());
        Self {
            sequence: 0,
            tx_id,
            op,
            timestamp_ms: now_millis(),
            key: Vec::new(),
            new_value: Vec::new(),
            old_value: Vec::new(),
        }
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut writer = SmallWriter::with_capacity(
            8 + 8 + 4 + 8 + 12 + self.key.len() + self.new_value.len() + self.old_value.len(),
        );
        writer.write_u64(self.sequence);
        writer.write_u64(self.tx_id);
        writer.write_u32(self.op.to_u32());
        writer.write_u64(self.timestamp_ms);
        writer.write_slot(&self.key);
        writer.write_slot(&self.new_value);
        writer.write_slot(&self.old_value);
        writer.to_bytes()
    }

    pub fn decode_body(body: &[u8]) -> KvResult<Self> {
        let mut reader = SmallReader::new(body);
        let sequence = reader.read_u64()?;
        let tx_id = reader.read_u64()?;
        let op = OpKind::from_u32(reader.read_u32()?)?;
        let timestamp_ms = reader.read_u64()?;
        let key = reader.read_slot()?.to_vec();
        let new_value = reader.read_slot()?.to_vec();
        let old_value = reader.read_slot()?.to_vec();
        if reader.remaining() != 0 {
            return Err(KvError::corruption(format!(
                "{} trailing bytes in log record body",
                reader.remaining()
            )));
        }
        Ok(Self {
            sequence,
            tx_id,
            op,
            timestamp_ms,
            key,
            new_value,
            old_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_body_round_trip() {
        let mut record = LogRecord::data(
            12,
            OpKind::Update,
            b"k1".to_vec(),
            b"new".to_vec(),
            b"old".to_vec(),
        );
        record.sequence = 99;

        let body = record.encode_body();
        let decoded = LogRecord::decode_body(&body).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_invalid_op_kind_is_corruption() {
        let mut record = LogRecord::marker(1, OpKind::TxBegin);
        record.sequence = 1;
        let mut body = record.encode_body();
        // op kind lives at offset 16
        body[16..20].copy_from_slice(&777u32.to_be_bytes());
        match LogRecord::decode_body(&body) {
            Err(KvError::Corruption(_)) => {}
            other => panic!("expected corruption, got {:?}", other),
        }
    }
}
