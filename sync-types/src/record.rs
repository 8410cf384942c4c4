//! The scouting record model and its composite identity.
//!
//! Two devices that observe the same team in the same match must produce
//! records that collide on id. The id is therefore derived from four
//! normalized fields rather than generated:
//!
//! ```text
//! <event>::<match>::<team>::<alliance>      e.g. 2024casj::qm12::254::red
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Separator between composite key parts.
pub const KEY_SEPARATOR: &str = "::";

/// Normalize one key part: trimmed and lowercased.
pub(crate) fn normalize_part(part: &str) -> String {
    part.trim().to_lowercase()
}

/// Normalize a team key: like [`normalize_part`], with any `frc` prefix removed.
pub(crate) fn normalize_team(team: &str) -> String {
    let normalized = normalize_part(team);
    match normalized.strip_prefix("frc") {
        Some(rest) if !rest.is_empty() => rest.to_string(),
        _ => normalized,
    }
}

/// Deterministic record identity built from normalized fields.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompositeKey(String);

impl CompositeKey {
    /// Build a key from raw (unnormalized) parts.
    pub fn from_parts(event_key: &str, match_key: &str, team_key: &str, alliance: &str) -> Self {
        let parts = [
            normalize_part(event_key),
            normalize_part(match_key),
            normalize_team(team_key),
            normalize_part(alliance),
        ];
        Self(parts.join(KEY_SEPARATOR))
    }

    /// Recompute the key from a record's raw fields, ignoring its stored id.
    pub fn from_record(record: &ScoutingRecord) -> Self {
        Self::from_parts(
            &record.event_key,
            &record.match_key,
            &record.team_key,
            &record.alliance,
        )
    }

    /// Get the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume into the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompositeKey({})", self.0)
    }
}

/// A possibly partial composite key used for store queries.
///
/// `None` parts match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyParts {
    /// Event key
    pub event_key: Option<String>,
    /// Match key
    pub match_key: Option<String>,
    /// Team key
    pub team_key: Option<String>,
    /// Alliance colour
    pub alliance: Option<String>,
}

impl KeyParts {
    /// All four parts of a record, for an exact composite lookup.
    pub fn of(record: &ScoutingRecord) -> Self {
        Self {
            event_key: Some(record.event_key.clone()),
            match_key: Some(record.match_key.clone()),
            team_key: Some(record.team_key.clone()),
            alliance: Some(record.alliance.clone()),
        }
    }

    /// Only the event part.
    pub fn event(event_key: impl Into<String>) -> Self {
        Self {
            event_key: Some(event_key.into()),
            ..Default::default()
        }
    }

    /// Check whether a record's normalized fields satisfy every given part.
    pub fn matches(&self, record: &ScoutingRecord) -> bool {
        fn part_ok(want: &Option<String>, have: &str, norm: fn(&str) -> String) -> bool {
            want.as_deref().map_or(true, |w| norm(w) == norm(have))
        }
        part_ok(&self.event_key, &record.event_key, normalize_part)
            && part_ok(&self.match_key, &record.match_key, normalize_part)
            && part_ok(&self.team_key, &record.team_key, normalize_team)
            && part_ok(&self.alliance, &record.alliance, normalize_part)
    }
}

/// One observation of one team in one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoutingRecord {
    /// Composite id; empty on legacy records
    #[serde(default)]
    pub id: String,
    /// Event the match belongs to
    pub event_key: String,
    /// Match within the event
    pub match_key: String,
    /// Observed team
    pub team_key: String,
    /// Alliance colour the team played on
    pub alliance: String,
    /// Collection time, milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Observed field values
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    /// Whether a lead scout has corrected this record
    #[serde(default)]
    pub is_corrected: bool,
    /// How many corrections have been applied
    #[serde(default)]
    pub correction_count: u32,
    /// Time of the last correction, milliseconds since the Unix epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_corrected_at: Option<i64>,
    /// Who made the last correction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_corrected_by: Option<String>,
}

impl ScoutingRecord {
    /// Create an uncorrected record with its composite id filled in.
    pub fn new(
        event_key: impl Into<String>,
        match_key: impl Into<String>,
        team_key: impl Into<String>,
        alliance: impl Into<String>,
        timestamp: i64,
    ) -> Self {
        let mut record = Self {
            id: String::new(),
            event_key: event_key.into(),
            match_key: match_key.into(),
            team_key: team_key.into(),
            alliance: alliance.into(),
            timestamp,
            data: BTreeMap::new(),
            is_corrected: false,
            correction_count: 0,
            last_corrected_at: None,
            last_corrected_by: None,
        };
        record.id = record.composite_key().into_string();
        record
    }

    /// Builder: set one data field.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// Builder: mark as corrected.
    pub fn corrected(mut self, at: i64, by: impl Into<String>) -> Self {
        self.is_corrected = true;
        self.correction_count += 1;
        self.last_corrected_at = Some(at);
        self.last_corrected_by = Some(by.into());
        self
    }

    /// The composite key recomputed from raw fields.
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey::from_record(self)
    }

    /// The id to store this record under: its own id, or the composite key
    /// for legacy records that lack one.
    pub fn storage_id(&self) -> String {
        if self.id.is_empty() {
            self.composite_key().into_string()
        } else {
            self.id.clone()
        }
    }
}
