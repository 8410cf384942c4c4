//! Data-channel frames.
//!
//! Frames travel over an open peer link as JSON text. Payloads above the
//! chunk threshold are split into [`Chunk`] frames; everything else fits in
//! a single [`Complete`] or [`PushData`] frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{normalize_part, normalize_team};
use crate::{ScoutingRecord, SyncError, TransferId};

/// What a payload represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataType {
    /// Match scouting records, merged through conflict resolution
    Scouting,
    /// Pit scouting entries, opaque to sync
    PitScouting,
    /// Match schedule data, opaque to sync
    Matches,
}

impl DataType {
    /// Wire name of the data type.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Scouting => "scouting",
            DataType::PitScouting => "pit-scouting",
            DataType::Matches => "matches",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag describing a reassembled payload.
///
/// `push` separates unsolicited sends from responses to an outstanding
/// request, so the two are never confused on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadKind {
    /// Payload content type
    pub data_type: DataType,
    /// Whether the payload was pushed without a request
    pub push: bool,
}

impl PayloadKind {
    /// A response to a `request-data` frame.
    pub fn response(data_type: DataType) -> Self {
        Self {
            data_type,
            push: false,
        }
    }

    /// An unsolicited push.
    pub fn push(data_type: DataType) -> Self {
        Self {
            data_type,
            push: true,
        }
    }
}

/// Optional filters on a data request.
///
/// A record matches when any listed key matches (union). No keys at all
/// matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFilters {
    /// Event keys to include
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_keys: Vec<String>,
    /// Team keys to include
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub team_keys: Vec<String>,
    /// Match keys to include
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_keys: Vec<String>,
}

impl DataFilters {
    /// True when no key is listed.
    pub fn is_empty(&self) -> bool {
        self.event_keys.is_empty() && self.team_keys.is_empty() && self.match_keys.is_empty()
    }

    /// Check whether a record is selected by these filters.
    pub fn matches(&self, record: &ScoutingRecord) -> bool {
        if self.is_empty() {
            return true;
        }
        let event = normalize_part(&record.event_key);
        let team = normalize_team(&record.team_key);
        let match_key = normalize_part(&record.match_key);

        self.event_keys.iter().any(|k| normalize_part(k) == event)
            || self.team_keys.iter().any(|k| normalize_team(k) == team)
            || self.match_keys.iter().any(|k| normalize_part(k) == match_key)
    }
}

/// All frames carried on a data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Ask the remote for data
    RequestData(RequestData),
    /// Small unsolicited payload
    PushData(PushData),
    /// Single-frame response payload
    Complete(Complete),
    /// One slice of a chunked payload
    Chunk(Chunk),
    /// The remote refused a request
    RequestDeclined,
    /// The remote refused a push
    PushDeclined(PushDeclined),
    /// The remote is closing the session
    Disconnected,
    /// Any frame type this build does not know
    #[serde(other)]
    Unknown,
}

impl Frame {
    /// Serialize to JSON bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SyncError> {
        serde_json::to_vec(self).map_err(SyncError::Serialization)
    }

    /// Deserialize from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SyncError> {
        serde_json::from_slice(bytes).map_err(SyncError::Deserialization)
    }

    /// Wire name of the frame, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::RequestData(_) => "request-data",
            Frame::PushData(_) => "push-data",
            Frame::Complete(_) => "complete",
            Frame::Chunk(_) => "chunk",
            Frame::RequestDeclined => "request-declined",
            Frame::PushDeclined(_) => "push-declined",
            Frame::Disconnected => "disconnected",
            Frame::Unknown => "unknown",
        }
    }
}

/// Request for data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    /// Optional selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<DataFilters>,
    /// Requested content type
    pub data_type: DataType,
}

/// Unsolicited payload small enough for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushData {
    /// Content type
    pub data_type: DataType,
    /// The payload
    pub data: Value,
}

/// Response payload small enough for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complete {
    /// The payload
    pub data: Value,
    /// Content type
    pub data_type: DataType,
}

/// One slice of a chunked payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// Transfer this chunk belongs to
    pub transfer_id: TransferId,
    /// Zero-based slot index
    pub chunk_index: u32,
    /// Number of slots in the transfer
    pub total_chunks: u32,
    /// Base64 slice of the serialized payload
    pub data: String,
    /// Content type
    pub data_type: DataType,
    /// Set when the transfer is an unsolicited push
    #[serde(default, skip_serializing_if = "is_false")]
    pub push: bool,
}

impl Chunk {
    /// Payload kind of the transfer this chunk belongs to.
    pub fn kind(&self) -> PayloadKind {
        PayloadKind {
            data_type: self.data_type,
            push: self.push,
        }
    }
}

/// Refusal of a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushDeclined {
    /// Content type that was refused
    pub data_type: DataType,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(event: &str, team: &str, match_key: &str) -> ScoutingRecord {
        ScoutingRecord::new(event, match_key, team, "red", 0)
    }

    #[test]
    fn request_data_wire_shape() {
        let frame = Frame::RequestData(RequestData {
            filters: Some(DataFilters {
                team_keys: vec!["frc254".into()],
                ..Default::default()
            }),
            data_type: DataType::Scouting,
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "request-data", "filters": {"teamKeys": ["frc254"]}, "dataType": "scouting"})
        );
    }

    #[test]
    fn unit_frames_wire_shape() {
        let value = serde_json::to_value(Frame::RequestDeclined).unwrap();
        assert_eq!(value, json!({"type": "request-declined"}));
        let value = serde_json::to_value(Frame::Disconnected).unwrap();
        assert_eq!(value, json!({"type": "disconnected"}));
    }

    #[test]
    fn chunk_omits_push_flag_for_responses() {
        let chunk = Chunk {
            transfer_id: TransferId::new(),
            chunk_index: 0,
            total_chunks: 2,
            data: "aGk=".into(),
            data_type: DataType::PitScouting,
            push: false,
        };
        let value = serde_json::to_value(Frame::Chunk(chunk)).unwrap();
        assert_eq!(value["type"], "chunk");
        assert_eq!(value["dataType"], "pit-scouting");
        assert!(value.get("push").is_none());
    }

    #[test]
    fn chunk_without_push_field_parses_as_response() {
        let json = format!(
            r#"{{"type":"chunk","transferId":"{}","chunkIndex":1,"totalChunks":3,"data":"","dataType":"matches"}}"#,
            TransferId::new()
        );
        match Frame::from_bytes(json.as_bytes()).unwrap() {
            Frame::Chunk(chunk) => {
                assert_eq!(chunk.kind(), PayloadKind::response(DataType::Matches));
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn unknown_frame_type_is_tolerated() {
        let frame = Frame::from_bytes(br#"{"type":"typing","who":"x"}"#).unwrap();
        assert_eq!(frame, Frame::Unknown);
    }

    #[test]
    fn malformed_frame_errors() {
        assert!(Frame::from_bytes(b"not json").is_err());
        assert!(Frame::from_bytes(br#"{"type":"push-data"}"#).is_err());
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(DataFilters::default().matches(&record("2024casj", "frc254", "qm1")));
    }

    #[test]
    fn filters_are_a_union() {
        let filters = DataFilters {
            event_keys: vec!["2024CASJ".into()],
            team_keys: vec!["1678".into()],
            match_keys: vec![],
        };
        assert!(filters.matches(&record("2024casj", "frc254", "qm1")));
        assert!(filters.matches(&record("2024txho", "frc1678", "qm2")));
        assert!(!filters.matches(&record("2024txho", "frc254", "qm2")));
    }
}
