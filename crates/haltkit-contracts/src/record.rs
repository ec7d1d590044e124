use serde::{Deserialize, Serialize};

use crate::ResolveError;

/// Encoded size of one [`HandleRecord`] on the helper request pipe.
pub const HANDLE_RECORD_LEN: usize = 40;

/// One entry of a system-wide handle-table snapshot.
///
/// Pointer-width fields are widened to `u64` so the encoding is the same on
/// every host. Encoding (`haltkit.handle-record@1`, little-endian):
///
/// | offset | width | field |
/// |-------:|------:|-------|
/// | 0  | 8 | `object` |
/// | 8  | 8 | `owner_pid` |
/// | 16 | 8 | `handle_value` |
/// | 24 | 4 | `granted_access` |
/// | 28 | 2 | `creator_back_trace_index` |
/// | 30 | 2 | `object_type_index` |
/// | 32 | 4 | `handle_attributes` |
/// | 36 | 4 | `reserved` |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    #[serde(default)]
    pub object: u64,
    pub owner_pid: u64,
    pub handle_value: u64,
    #[serde(default)]
    pub granted_access: u32,
    #[serde(default)]
    pub creator_back_trace_index: u16,
    #[serde(default)]
    pub object_type_index: u16,
    #[serde(default)]
    pub handle_attributes: u32,
    #[serde(default)]
    pub reserved: u32,
}

/// JSON form of a handle-table snapshot, as fed to the diagnostic CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandleSnapshot {
    pub schema_version: String,
    pub records: Vec<HandleRecord>,
}

impl HandleSnapshot {
    pub fn new(records: Vec<HandleRecord>) -> Self {
        HandleSnapshot {
            schema_version: crate::HANDLE_RECORD_SCHEMA_VERSION.to_string(),
            records,
        }
    }

    pub fn check_schema(&self) -> Result<(), ResolveError> {
        if self.schema_version != crate::HANDLE_RECORD_SCHEMA_VERSION {
            return Err(ResolveError::ProtocolViolation(format!(
                "snapshot schema_version {:?}, expected {:?}",
                self.schema_version,
                crate::HANDLE_RECORD_SCHEMA_VERSION
            )));
        }
        Ok(())
    }
}

impl HandleRecord {
    pub fn new(owner_pid: u64, handle_value: u64) -> Self {
        HandleRecord {
            owner_pid,
            handle_value,
            ..HandleRecord::default()
        }
    }

    pub fn encode(&self) -> [u8; HANDLE_RECORD_LEN] {
        let mut out = [0u8; HANDLE_RECORD_LEN];
        out[0..8].copy_from_slice(&self.object.to_le_bytes());
        out[8..16].copy_from_slice(&self.owner_pid.to_le_bytes());
        out[16..24].copy_from_slice(&self.handle_value.to_le_bytes());
        out[24..28].copy_from_slice(&self.granted_access.to_le_bytes());
        out[28..30].copy_from_slice(&self.creator_back_trace_index.to_le_bytes());
        out[30..32].copy_from_slice(&self.object_type_index.to_le_bytes());
        out[32..36].copy_from_slice(&self.handle_attributes.to_le_bytes());
        out[36..40].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ResolveError> {
        let Ok(b) = <&[u8; HANDLE_RECORD_LEN]>::try_from(bytes) else {
            return Err(ResolveError::ProtocolViolation(format!(
                "handle record must be {HANDLE_RECORD_LEN} bytes, got {}",
                bytes.len()
            )));
        };
        Ok(HandleRecord {
            object: u64_at(b, 0),
            owner_pid: u64_at(b, 8),
            handle_value: u64_at(b, 16),
            granted_access: u32_at(b, 24),
            creator_back_trace_index: u16::from_le_bytes([b[28], b[29]]),
            object_type_index: u16::from_le_bytes([b[30], b[31]]),
            handle_attributes: u32_at(b, 32),
            reserved: u32_at(b, 36),
        })
    }
}

fn u64_at(b: &[u8; HANDLE_RECORD_LEN], off: usize) -> u64 {
    let mut v = [0u8; 8];
    v.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(v)
}

fn u32_at(b: &[u8; HANDLE_RECORD_LEN], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_offsets_match_the_documented_layout() {
        let rec = HandleRecord {
            object: 0x1122_3344_5566_7788,
            owner_pid: 0x1234,
            handle_value: 0x4c,
            granted_access: 0x0012_019f,
            creator_back_trace_index: 0xbeef,
            object_type_index: 0x25,
            handle_attributes: 0x2,
            reserved: 0xffff_ffff,
        };
        let b = rec.encode();
        assert_eq!(&b[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&b[8..16], &[0x34, 0x12, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&b[16..24], &[0x4c, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&b[24..28], &[0x9f, 0x01, 0x12, 0x00]);
        assert_eq!(&b[28..30], &[0xef, 0xbe]);
        assert_eq!(&b[30..32], &[0x25, 0x00]);
        assert_eq!(&b[32..36], &[0x02, 0, 0, 0]);
        assert_eq!(&b[36..40], &[0xff; 4]);
        assert_eq!(HandleRecord::decode(&b).unwrap(), rec);
    }

    #[test]
    fn decode_rejects_short_and_long_input() {
        let b = HandleRecord::new(1, 2).encode();
        let err = HandleRecord::decode(&b[..39]).unwrap_err();
        assert!(matches!(err, ResolveError::ProtocolViolation(_)), "{err}");
        let mut long = b.to_vec();
        long.push(0);
        assert!(HandleRecord::decode(&long).is_err());
    }

    #[test]
    fn json_snapshot_entry_defaults_optional_fields() {
        let rec: HandleRecord =
            serde_json::from_str(r#"{"owner_pid": 4, "handle_value": 8}"#).unwrap();
        assert_eq!(rec, HandleRecord::new(4, 8));
    }

    #[test]
    fn snapshot_schema_version_is_checked() {
        let snapshot = HandleSnapshot::new(vec![HandleRecord::new(4, 8)]);
        snapshot.check_schema().unwrap();

        let stale: HandleSnapshot = serde_json::from_str(
            r#"{"schema_version": "haltkit.handle-record@0", "records": []}"#,
        )
        .unwrap();
        let err = stale.check_schema().unwrap_err();
        assert!(matches!(err, ResolveError::ProtocolViolation(_)), "{err}");
    }
}
