//! Deterministic conflict resolution for incoming scouting records.
//!
//! Every incoming record is matched against one snapshot of local state and
//! lands in exactly one bucket, or is skipped as already in sync:
//!
//! | local corrected | incoming corrected | outcome                          |
//! |-----------------|--------------------|----------------------------------|
//! | (no local)      | any                | auto-import                      |
//! | no              | no                 | batch review                     |
//! | no              | yes                | auto-replace                     |
//! | yes             | no                 | manual conflict                  |
//! | yes             | yes                | auto-replace if correction times agree, else manual conflict |
//!
//! Correction status is compared before content, so a draft never silently
//! replaces a correction even when their field values agree.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use sync_types::{CompositeKey, ScoutingRecord};

/// Default window within which two correction timestamps count as equal.
pub const DEFAULT_CORRECTION_TOLERANCE_MS: i64 = 1000;

/// Field names that never take part in fingerprints or diffs.
///
/// Record identity and correction bookkeeping live outside the data map,
/// but older clients sometimes copied them into it.
pub const EXCLUDED_FIELDS: &[&str] = &[
    "id",
    "eventKey",
    "matchKey",
    "teamKey",
    "alliance",
    "timestamp",
    "isCorrected",
    "correctionCount",
    "lastCorrectedAt",
    "lastCorrectedBy",
];

/// Tunables for resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConflictConfig {
    /// Two correction timestamps closer than this are treated as the same
    /// correction. Device clocks are not synchronized, so this is a
    /// heuristic rather than a guarantee.
    pub correction_tolerance_ms: i64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            correction_tolerance_ms: DEFAULT_CORRECTION_TOLERANCE_MS,
        }
    }
}

/// Classification of one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// No local counterpart; write as is.
    AutoImport,
    /// Incoming outranks local; write without asking.
    AutoReplace,
    /// Both are drafts; the user picks, per record or en masse.
    BatchReview,
    /// A local correction is at stake; the user must decide.
    ManualConflict,
}

/// How one field differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// Both sides hold different non-null values.
    Conflict,
    /// Only the incoming side holds a value.
    Added,
}

/// One differing field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDiff {
    /// Field name within the record's data
    pub field: String,
    /// Local value (`Null` when absent)
    pub local: Value,
    /// Incoming value
    pub incoming: Value,
    /// Kind of difference
    pub kind: DiffKind,
}

/// The outcome for one incoming record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictDecision {
    /// The incoming record, untouched
    pub incoming: ScoutingRecord,
    /// The matched local record, if any
    pub local: Option<ScoutingRecord>,
    /// Where the record landed
    pub bucket: Bucket,
    /// Differing fields, filled for buckets that need the user
    pub diff: Vec<FieldDiff>,
    /// For two corrections that disagree: whether the incoming one is newer
    pub is_newer_incoming: Option<bool>,
}

/// Resolution of a whole incoming batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    /// Records with no local counterpart
    pub auto_import: Vec<ConflictDecision>,
    /// Records that replace local ones without asking
    pub auto_replace: Vec<ConflictDecision>,
    /// Draft-vs-draft records for the user
    pub batch_review: Vec<ConflictDecision>,
    /// Records that would override a local correction
    pub manual_conflicts: Vec<ConflictDecision>,
    /// Records skipped because both sides already agree
    pub in_sync: usize,
}

impl Resolution {
    /// Number of records that produced a decision.
    pub fn decisions(&self) -> usize {
        self.auto_import.len()
            + self.auto_replace.len()
            + self.batch_review.len()
            + self.manual_conflicts.len()
    }

    /// True when some records wait on the user.
    pub fn needs_attention(&self) -> bool {
        !self.batch_review.is_empty() || !self.manual_conflicts.is_empty()
    }

    fn push(&mut self, decision: ConflictDecision) {
        match decision.bucket {
            Bucket::AutoImport => self.auto_import.push(decision),
            Bucket::AutoReplace => self.auto_replace.push(decision),
            Bucket::BatchReview => self.batch_review.push(decision),
            Bucket::ManualConflict => self.manual_conflicts.push(decision),
        }
    }
}

/// A user's choice for a record that needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Choice {
    /// Keep the local record; nothing is written.
    KeepLocal,
    /// Merge the incoming record over the local one.
    TakeIncoming,
}

/// A frozen copy of the local records relevant to one batch.
///
/// Lookups go by exact id first, then by the composite key recomputed from
/// raw fields, which catches legacy records stored without an id.
#[derive(Debug, Clone, Default)]
pub struct LocalSnapshot {
    by_id: HashMap<String, ScoutingRecord>,
    by_key: HashMap<CompositeKey, String>,
}

impl LocalSnapshot {
    /// Build a snapshot from local records.
    pub fn new(records: impl IntoIterator<Item = ScoutingRecord>) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            let id = record.storage_id();
            snapshot.by_key.insert(record.composite_key(), id.clone());
            snapshot.by_id.insert(id, record);
        }
        snapshot
    }

    /// Find the local counterpart of an incoming record.
    pub fn lookup(&self, incoming: &ScoutingRecord) -> Option<&ScoutingRecord> {
        if !incoming.id.is_empty() {
            if let Some(found) = self.by_id.get(&incoming.id) {
                return Some(found);
            }
        }
        self.by_key
            .get(&incoming.composite_key())
            .and_then(|id| self.by_id.get(id))
    }

    /// Number of records in the snapshot.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if the snapshot holds no records.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Classify every incoming record against one snapshot.
pub fn resolve(
    incoming: impl IntoIterator<Item = ScoutingRecord>,
    local: &LocalSnapshot,
    config: &ConflictConfig,
) -> Resolution {
    let mut resolution = Resolution::default();
    for record in incoming {
        match classify(record, local, config) {
            Some(decision) => resolution.push(decision),
            None => resolution.in_sync += 1,
        }
    }
    resolution
}

/// Classify one record. `None` means already in sync.
pub fn classify(
    incoming: ScoutingRecord,
    local: &LocalSnapshot,
    config: &ConflictConfig,
) -> Option<ConflictDecision> {
    let Some(existing) = local.lookup(&incoming) else {
        return Some(ConflictDecision {
            incoming,
            local: None,
            bucket: Bucket::AutoImport,
            diff: Vec::new(),
            is_newer_incoming: None,
        });
    };

    let same_correction = corrections_agree(existing, &incoming, config);
    if existing.is_corrected == incoming.is_corrected
        && (!existing.is_corrected || same_correction)
        && fingerprint(existing) == fingerprint(&incoming)
    {
        return None;
    }

    let (bucket, is_newer_incoming) = match (existing.is_corrected, incoming.is_corrected) {
        (false, false) => (Bucket::BatchReview, None),
        (false, true) => (Bucket::AutoReplace, None),
        (true, false) => (Bucket::ManualConflict, None),
        (true, true) if same_correction => (Bucket::AutoReplace, None),
        (true, true) => {
            let local_at = existing.last_corrected_at.unwrap_or(i64::MIN);
            let incoming_at = incoming.last_corrected_at.unwrap_or(i64::MIN);
            (Bucket::ManualConflict, Some(incoming_at > local_at))
        }
    };

    let changes = match bucket {
        Bucket::BatchReview | Bucket::ManualConflict => diff(existing, &incoming),
        _ => Vec::new(),
    };
    // Taking an empty-diff draft would write nothing new.
    if bucket == Bucket::BatchReview && changes.is_empty() {
        return None;
    }

    Some(ConflictDecision {
        local: Some(existing.clone()),
        incoming,
        bucket,
        diff: changes,
        is_newer_incoming,
    })
}

fn corrections_agree(a: &ScoutingRecord, b: &ScoutingRecord, config: &ConflictConfig) -> bool {
    match (a.last_corrected_at, b.last_corrected_at) {
        (Some(x), Some(y)) => x.abs_diff(y) <= config.correction_tolerance_ms.unsigned_abs(),
        (None, None) => true,
        _ => false,
    }
}

fn is_excluded(field: &str) -> bool {
    EXCLUDED_FIELDS.contains(&field)
}

/// Order-independent SHA-256 over a record's data fields, hex-rendered.
///
/// Excluded fields and null values do not contribute, and nested objects
/// are hashed with sorted keys.
pub fn fingerprint(record: &ScoutingRecord) -> String {
    let mut hasher = Sha256::new();
    for (field, value) in &record.data {
        if is_excluded(field) || value.is_null() {
            continue;
        }
        hasher.update(field.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical_json(value).as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Field-level differences that would matter if `incoming` were taken.
///
/// A null or missing incoming field is "no change". A value present only on
/// the incoming side is [`DiffKind::Added`].
pub fn diff(local: &ScoutingRecord, incoming: &ScoutingRecord) -> Vec<FieldDiff> {
    let fields: BTreeSet<&String> = local.data.keys().chain(incoming.data.keys()).collect();
    let mut out = Vec::new();

    for field in fields {
        if is_excluded(field) {
            continue;
        }
        let incoming_value = incoming.data.get(field).unwrap_or(&Value::Null);
        if incoming_value.is_null() {
            continue;
        }
        let local_value = local.data.get(field).unwrap_or(&Value::Null);
        let kind = if local_value.is_null() {
            DiffKind::Added
        } else if canonical_json(local_value) != canonical_json(incoming_value) {
            DiffKind::Conflict
        } else {
            continue;
        };
        out.push(FieldDiff {
            field: field.clone(),
            local: local_value.clone(),
            incoming: incoming_value.clone(),
            kind,
        });
    }
    out
}

/// Build the record to write when the incoming side wins.
///
/// Without a local record this is the incoming record under its storage id.
/// Otherwise local fields are overlaid with every non-null incoming field,
/// correction metadata comes from the incoming side, and the correction
/// count never goes down. Neither input is modified.
pub fn merge_incoming(local: Option<&ScoutingRecord>, incoming: &ScoutingRecord) -> ScoutingRecord {
    let Some(local) = local else {
        let mut record = incoming.clone();
        record.id = incoming.storage_id();
        return record;
    };

    let mut merged = local.clone();
    merged.id = local.storage_id();
    for (field, value) in &incoming.data {
        if !value.is_null() {
            merged.data.insert(field.clone(), value.clone());
        }
    }
    merged.timestamp = merged.timestamp.max(incoming.timestamp);
    merged.is_corrected = incoming.is_corrected;
    merged.correction_count = local.correction_count.max(incoming.correction_count);
    merged.last_corrected_at = incoming.last_corrected_at;
    merged.last_corrected_by = incoming.last_corrected_by.clone();
    merged
}

/// The record to write for a decision and a choice, if any.
///
/// Auto buckets always write. For buckets that need the user,
/// [`Choice::KeepLocal`] writes nothing.
pub fn record_to_write(decision: &ConflictDecision, choice: Choice) -> Option<ScoutingRecord> {
    match (decision.bucket, choice) {
        (Bucket::AutoImport | Bucket::AutoReplace, _) | (_, Choice::TakeIncoming) => {
            Some(merge_incoming(decision.local.as_ref(), &decision.incoming))
        }
        (_, Choice::KeepLocal) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> ScoutingRecord {
        ScoutingRecord::new("evt", "m1", "frc42", "red", 1_000)
            .with_field("autoPoints", 6)
            .with_field("notes", "fast")
    }

    fn snapshot(records: &[ScoutingRecord]) -> LocalSnapshot {
        LocalSnapshot::new(records.iter().cloned())
    }

    fn one(incoming: ScoutingRecord, local: &[ScoutingRecord]) -> Option<ConflictDecision> {
        classify(incoming, &snapshot(local), &ConflictConfig::default())
    }

    // ===========================================
    // Bucket matrix
    // ===========================================

    #[test]
    fn no_local_record_is_auto_import() {
        let incoming = base();
        assert_eq!(incoming.id, "evt::m1::42::red");
        let decision = one(incoming, &[]).unwrap();
        assert_eq!(decision.bucket, Bucket::AutoImport);
        assert!(decision.local.is_none());
    }

    #[test]
    fn identical_records_are_in_sync() {
        assert!(one(base(), &[base()]).is_none());
    }

    #[test]
    fn resolution_is_idempotent_after_import() {
        let incoming = base();
        let first = resolve([incoming.clone()], &snapshot(&[]), &ConflictConfig::default());
        assert_eq!(first.auto_import.len(), 1);

        let written = record_to_write(&first.auto_import[0], Choice::KeepLocal).unwrap();
        let second = resolve([incoming], &snapshot(&[written]), &ConflictConfig::default());
        assert_eq!(second.decisions(), 0);
        assert_eq!(second.in_sync, 1);
    }

    #[test]
    fn two_drafts_that_differ_go_to_batch_review() {
        let local = base();
        let incoming = base().with_field("autoPoints", 8);
        let decision = one(incoming, &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::BatchReview);
        assert_eq!(decision.diff.len(), 1);
        assert_eq!(decision.diff[0].field, "autoPoints");
        assert_eq!(decision.diff[0].kind, DiffKind::Conflict);
    }

    #[test]
    fn draft_missing_local_fields_is_in_sync() {
        let local = base().with_field("climbed", true);
        let incoming = base();
        assert!(one(incoming.clone(), &[local.clone()]).is_none());

        // Still in sync after the incoming side was merged once.
        let merged = merge_incoming(Some(&local), &incoming);
        assert_ne!(fingerprint(&merged), fingerprint(&incoming));
        assert!(one(incoming, &[merged]).is_none());
    }

    #[test]
    fn correction_beats_draft() {
        let local = base();
        let incoming = base().with_field("autoPoints", 0).corrected(5_000, "lead");
        let decision = one(incoming, &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::AutoReplace);
        assert!(decision.diff.is_empty());
    }

    #[test]
    fn corrected_replaces_uncorrected_even_with_same_fields() {
        let decision = one(base().corrected(5_000, "lead"), &[base()]).unwrap();
        assert_eq!(decision.bucket, Bucket::AutoReplace);
    }

    #[test]
    fn draft_never_overwrites_local_correction() {
        let local = base().corrected(5_000, "lead");
        let decision = one(base(), &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::ManualConflict);
        assert!(decision.is_newer_incoming.is_none());
    }

    #[test]
    fn same_correction_within_tolerance_is_in_sync() {
        let local = base().corrected(5_000, "lead");
        let incoming = base().corrected(5_800, "lead");
        assert!(one(incoming, &[local]).is_none());
    }

    #[test]
    fn same_correction_time_with_different_fields_auto_replaces() {
        let local = base().corrected(5_000, "lead");
        let incoming = base().with_field("notes", "slow").corrected(5_400, "lead");
        let decision = one(incoming, &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::AutoReplace);
    }

    #[test]
    fn corrections_two_seconds_apart_conflict() {
        let local = base().corrected(10_000, "lead");
        let incoming = base().with_field("notes", "slow").corrected(12_000, "other");
        let decision = one(incoming, &[local.clone()]).unwrap();
        assert_eq!(decision.bucket, Bucket::ManualConflict);
        assert_eq!(decision.is_newer_incoming, Some(true));
        assert_eq!(decision.diff.len(), 1);

        let older = base().corrected(8_000, "other");
        let decision = one(older, &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::ManualConflict);
        assert_eq!(decision.is_newer_incoming, Some(false));
    }

    #[test]
    fn tolerance_is_configurable() {
        let local = base().corrected(10_000, "lead");
        let incoming = base().corrected(12_000, "lead");
        let loose = ConflictConfig {
            correction_tolerance_ms: 5_000,
        };
        assert!(classify(incoming, &snapshot(&[local]), &loose).is_none());
    }

    // ===========================================
    // Matching
    // ===========================================

    #[test]
    fn legacy_incoming_matches_by_composite_key() {
        let local = base();
        let mut legacy = base().with_field("autoPoints", 9);
        legacy.id.clear();
        legacy.team_key = "42".into();
        legacy.event_key = "EVT".into();

        let decision = one(legacy, &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::BatchReview);
        assert!(decision.local.is_some());
    }

    #[test]
    fn legacy_local_matches_by_composite_key() {
        let mut local = base();
        local.id.clear();
        let decision = one(base().with_field("autoPoints", 1), &[local]).unwrap();
        assert_eq!(decision.bucket, Bucket::BatchReview);
    }

    #[test]
    fn whole_batch_uses_one_snapshot() {
        let local = base();
        let a = base().with_field("autoPoints", 1);
        let b = base().with_field("autoPoints", 2);
        let other = ScoutingRecord::new("evt", "m2", "254", "blue", 0);

        let resolution = resolve(
            [a, b, other, base()],
            &snapshot(&[local]),
            &ConflictConfig::default(),
        );
        assert_eq!(resolution.batch_review.len(), 2);
        assert_eq!(resolution.auto_import.len(), 1);
        assert_eq!(resolution.in_sync, 1);
        assert!(resolution.needs_attention());
    }

    // ===========================================
    // Fingerprints and diffs
    // ===========================================

    #[test]
    fn fingerprint_ignores_key_order_nulls_and_metadata() {
        let mut a = base().with_field("nested", json!({"x": 1, "y": [1, 2]}));
        let mut b = base()
            .with_field("nested", json!({"y": [1, 2], "x": 1}))
            .with_field("empty", Value::Null)
            .with_field("isCorrected", true);
        b.timestamp = 99;
        a.last_corrected_by = Some("someone".into());

        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        assert_ne!(
            fingerprint(&base()),
            fingerprint(&base().with_field("autoPoints", 7))
        );
    }

    #[test]
    fn diff_treats_incoming_null_as_no_change() {
        let local = base();
        let incoming = base()
            .with_field("notes", Value::Null)
            .with_field("endgame", "climb");
        let changes = diff(&local, &incoming);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "endgame");
        assert_eq!(changes[0].kind, DiffKind::Added);
        assert_eq!(changes[0].local, Value::Null);
    }

    #[test]
    fn diff_skips_excluded_fields() {
        let local = base().with_field("timestamp", 1);
        let incoming = base().with_field("timestamp", 2);
        assert!(diff(&local, &incoming).is_empty());
    }

    // ===========================================
    // Merging
    // ===========================================

    #[test]
    fn merge_overlays_non_null_fields_and_keeps_max_count() {
        let mut local = base().with_field("endgame", "park").corrected(1_000, "a");
        local.correction_count = 3;
        let incoming = base()
            .with_field("endgame", Value::Null)
            .with_field("autoPoints", 10)
            .corrected(2_000, "b");

        let merged = merge_incoming(Some(&local), &incoming);
        assert_eq!(merged.data["endgame"], json!("park"));
        assert_eq!(merged.data["autoPoints"], json!(10));
        assert_eq!(merged.correction_count, 3);
        assert_eq!(merged.last_corrected_at, Some(2_000));
        assert_eq!(merged.last_corrected_by.as_deref(), Some("b"));
        assert_eq!(local.data["autoPoints"], json!(6));
    }

    #[test]
    fn keep_local_writes_nothing_for_review_buckets() {
        let decision = one(base().with_field("autoPoints", 1), &[base()]).unwrap();
        assert!(record_to_write(&decision, Choice::KeepLocal).is_none());
        let taken = record_to_write(&decision, Choice::TakeIncoming).unwrap();
        assert_eq!(taken.data["autoPoints"], json!(1));
    }
}
