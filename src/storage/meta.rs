use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// How piece content is stored relative to the source bytes.
///
/// Only plain verbatim storage exists today; the discriminant is persisted
/// so future transformed styles stay decodable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PieceStyle {
    #[default]
    Plain = 0,
}

impl PieceStyle {
    fn from_u8(value: u8) -> Result<Self, StorageError> {
        match value {
            0 => Ok(Self::Plain),
            other => Err(StorageError::ConvertFailed(format!(
                "unknown piece style: {other}"
            ))),
        }
    }
}

/// An inclusive byte range, rendered as `start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceRange {
    pub start: u64,
    pub end: u64,
}

impl PieceRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for PieceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PieceRange {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| StorageError::ConvertFailed(format!("invalid range: {s}")))?;
        let start = start
            .parse::<u64>()
            .map_err(|_| StorageError::ConvertFailed(format!("invalid range start: {s}")))?;
        let end = end
            .parse::<u64>()
            .map_err(|_| StorageError::ConvertFailed(format!("invalid range end: {s}")))?;
        if end < start {
            return Err(StorageError::ConvertFailed(format!(
                "range end before start: {s}"
            )));
        }
        Ok(Self { start, end })
    }
}

/// Metadata of one completed piece, one line in the piece log.
///
/// Serialized form: `num:len:md5:storedStart-storedEnd:sourceStart-sourceEnd:style`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceMetaRecord {
    /// Piece number, 0-based.
    pub piece_num: u32,
    /// Length stored on disk.
    pub piece_len: u32,
    /// MD5 of the stored content, 32-char lowercase hex.
    pub md5: String,
    /// Byte range in the stored payload file.
    pub stored_range: PieceRange,
    /// Byte range in the logical source. Equal to `stored_range` for
    /// [`PieceStyle::Plain`].
    pub source_range: PieceRange,
    pub style: PieceStyle,
}

const FIELD_SEPARATOR: char = ':';

impl fmt::Display for PieceMetaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.piece_num,
            self.piece_len,
            self.md5,
            self.stored_range,
            self.source_range,
            self.style as u8
        )
    }
}

impl FromStr for PieceMetaRecord {
    type Err = StorageError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.trim().split(FIELD_SEPARATOR).collect();
        if fields.len() != 6 {
            return Err(StorageError::ConvertFailed(format!(
                "piece record needs 6 fields, got {}: {line}",
                fields.len()
            )));
        }
        let piece_num = fields[0]
            .parse::<u32>()
            .map_err(|_| StorageError::ConvertFailed(format!("invalid piece num: {}", fields[0])))?;
        let piece_len = fields[1]
            .parse::<u32>()
            .map_err(|_| StorageError::ConvertFailed(format!("invalid piece len: {}", fields[1])))?;
        let md5 = fields[2].to_string();
        if md5.len() != 32 || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::ConvertFailed(format!(
                "invalid piece md5: {md5}"
            )));
        }
        let stored_range = fields[3].parse::<PieceRange>()?;
        let source_range = fields[4].parse::<PieceRange>()?;
        let style = fields[5]
            .parse::<u8>()
            .map_err(|_| StorageError::ConvertFailed(format!("invalid piece style: {}", fields[5])))
            .and_then(PieceStyle::from_u8)?;
        Ok(Self {
            piece_num,
            piece_len,
            md5,
            stored_range,
            source_range,
            style,
        })
    }
}

/// JSON sidecar persisted per task.
///
/// Field names are part of the on-disk format and must stay stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    #[serde(rename = "taskID")]
    pub task_id: String,
    #[serde(rename = "taskURL")]
    pub task_url: String,
    pub piece_size: u32,
    pub source_file_len: i64,
    /// Last consumption timestamp, unix millis.
    pub access_time: i64,
    /// Gap between the two most recent accesses, millis.
    pub interval: i64,
    pub cdn_file_length: i64,
    /// Declared digest in `algo:hex` form, empty when absent.
    pub digest: String,
    pub source_real_digest: String,
    pub tag: String,
    pub expire_info: HashMap<String, String>,
    pub finish: bool,
    pub success: bool,
    pub total_piece_count: u32,
    pub piece_md5_sign: String,
    pub range: String,
    pub filter: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> PieceMetaRecord {
        PieceMetaRecord {
            piece_num: 3,
            piece_len: 2000,
            md5: "0408118a35af5084043eabcea19c8695".to_string(),
            stored_range: PieceRange::new(6000, 7999),
            source_range: PieceRange::new(6000, 7999),
            style: PieceStyle::Plain,
        }
    }

    #[test]
    fn test_piece_record_line_format() {
        assert_eq!(
            record().to_string(),
            "3:2000:0408118a35af5084043eabcea19c8695:6000-7999:6000-7999:0"
        );
    }

    #[test]
    fn test_piece_record_round_trip() {
        let original = record();
        let parsed: PieceMetaRecord = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn test_piece_record_rejects_corrupt_lines() {
        assert!("".parse::<PieceMetaRecord>().is_err());
        assert!("1:2:3".parse::<PieceMetaRecord>().is_err());
        assert!("x:2000:0408118a35af5084043eabcea19c8695:0-1:0-1:0"
            .parse::<PieceMetaRecord>()
            .is_err());
        assert!("1:2000:not-a-digest:0-1:0-1:0".parse::<PieceMetaRecord>().is_err());
        assert!("1:2000:0408118a35af5084043eabcea19c8695:1-0:0-1:0"
            .parse::<PieceMetaRecord>()
            .is_err());
        assert!("1:2000:0408118a35af5084043eabcea19c8695:0-1:0-1:9"
            .parse::<PieceMetaRecord>()
            .is_err());
    }

    #[test]
    fn test_range_length_is_inclusive() {
        assert_eq!(PieceRange::new(0, 1999).length(), 2000);
        assert_eq!(PieceRange::new(8000, 9788).length(), 1789);
    }

    #[test]
    fn test_file_metadata_json_round_trip() {
        let mut expire_info = HashMap::new();
        expire_info.insert("ETag".to_string(), "\"abc\"".to_string());
        expire_info.insert(
            "Last-Modified".to_string(),
            "Wed, 21 Oct 2015 07:28:00 GMT".to_string(),
        );
        let metadata = FileMetadata {
            task_id: "a".repeat(64),
            task_url: "http://example.com/data.bin".to_string(),
            piece_size: 2000,
            source_file_len: 9789,
            access_time: 1624126443284,
            interval: 60_000,
            cdn_file_length: 9789,
            digest: "md5:9e107d9d372bb6826bd81d3542a419d6".to_string(),
            source_real_digest: "9e107d9d372bb6826bd81d3542a419d6".to_string(),
            tag: "canary".to_string(),
            expire_info,
            finish: true,
            success: true,
            total_piece_count: 5,
            piece_md5_sign: "b".repeat(64),
            range: "0-9788".to_string(),
            filter: "token&sig".to_string(),
        };

        let json = serde_json::to_string(&metadata).unwrap();
        let parsed: FileMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[test]
    fn test_file_metadata_stable_field_names() {
        let json = serde_json::to_value(FileMetadata::default()).unwrap();
        for field in [
            "taskID",
            "taskURL",
            "pieceSize",
            "sourceFileLen",
            "accessTime",
            "interval",
            "cdnFileLength",
            "digest",
            "sourceRealDigest",
            "tag",
            "expireInfo",
            "finish",
            "success",
            "totalPieceCount",
            "pieceMd5Sign",
            "range",
            "filter",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
