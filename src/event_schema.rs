//! Shared data model for the shipper: parsed action-log records, the
//! durable cache entries derived from them, and the JSON events
//! appended to the per-MDT streams.
//!
//! Everything on the wire and on disk is JSON: the payloads are small
//! and short-lived, only our own code reads them back, and consumers
//! tail the streams with stock JSON tooling.
use serde::Deserialize;
use serde::Serialize;

use crate::fresh_warn;
use crate::result::Result;

/// Status string carried by every purge event, synthetic or not,
/// overriding whatever status the action last reported.
pub const PURGED_STATUS: &str = "PURGED";

/// Stand-in for `action`/`status` tokens missing from a source line.
pub const UNKNOWN_FIELD: &str = "UNKNOWN";

lazy_static::lazy_static! {
    static ref LINE_PARAMS: umash::Params = umash::Params::derive(0, b"hsm action line params");
}

/// Returns the 128-bit digest of one raw action-log line, as 32
/// lowercase hex digits.  Cache entries store this digest, and the
/// differ compares it to decide between `UPDATE` and no-op.
pub fn digest_line(raw: &str) -> String {
    let fprint = LINE_PARAMS.fingerprinter(0).write(raw.as_bytes()).digest();
    format!("{:016x}{:016x}", fprint.hash[0], fprint.hash[1])
}

/// Returns the stream key for `mdt` under `prefix`, e.g.
/// `hsm:actions:elm-MDT0003`.
pub fn stream_key(prefix: &str, mdt: &str) -> String {
    format!("{}:{}", prefix, mdt)
}

/// Primary key for one line of an action log: the MDT that exposes
/// the log, plus the catalog and record indices of the line.
///
/// The derived ordering ((mdt, cat_idx, rec_idx) ascending) is the
/// batch ordering required within each event group.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActionId {
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
}

impl ActionId {
    pub fn new(mdt: impl Into<String>, cat_idx: u64, rec_idx: u64) -> ActionId {
        ActionId {
            mdt: mdt.into(),
            cat_idx,
            rec_idx,
        }
    }

    /// Renders the key in the cache file's `mdt|cat_idx|rec_idx`
    /// format.
    pub fn cache_key(&self) -> String {
        format!("{}|{}|{}", self.mdt, self.cat_idx, self.rec_idx)
    }

    /// Parses a `mdt|cat_idx|rec_idx` cache key.
    pub fn from_cache_key(key: &str) -> Result<ActionId> {
        let mut parts = key.rsplitn(3, '|');

        // rsplitn yields the components back to front, so a key with
        // extra pipes in the MDT name still parses.
        let rec = parts.next();
        let cat = parts.next();
        let mdt = parts.next();

        match (mdt, cat, rec) {
            (Some(mdt), Some(cat), Some(rec)) if !mdt.is_empty() => {
                let cat_idx = cat
                    .parse::<u64>()
                    .map_err(|_| fresh_warn!("invalid cat_idx in cache key", key))?;
                let rec_idx = rec
                    .parse::<u64>()
                    .map_err(|_| fresh_warn!("invalid rec_idx in cache key", key))?;
                Ok(ActionId::new(mdt, cat_idx, rec_idx))
            }
            _ => Err(fresh_warn!("malformed cache key", key)),
        }
    }
}

/// One live HSM request, as parsed from a single action-log line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionRecord {
    pub id: ActionId,
    pub fid: String,
    pub action: String,
    pub status: String,
    pub raw: String,
}

impl ActionRecord {
    /// The `fid:action` key that correlates one logical operation
    /// across catalog index changes.
    pub fn action_key(&self) -> String {
        format!("{}:{}", self.fid, self.action)
    }
}

/// Persisted last-known state for one action, keyed by the action's
/// primary key in the cache map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fid: String,
    pub action: String,
    pub status: String,
    pub raw: String,
    pub hash: String,
    pub timestamp: u64,
}

impl CacheEntry {
    /// Builds the entry recorded after publishing `record` at
    /// `timestamp`.
    pub fn observed(record: &ActionRecord, timestamp: u64) -> CacheEntry {
        CacheEntry {
            fid: record.fid.clone(),
            action: record.action.clone(),
            status: record.status.clone(),
            raw: record.raw.clone(),
            hash: digest_line(&record.raw),
            timestamp,
        }
    }

    pub fn action_key(&self) -> String {
        format!("{}:{}", self.fid, self.action)
    }
}

/// The in-memory shape of the persistent cache: last-known state per
/// primary key, exactly the set observed at the most recently
/// successfully published cycle.
pub type Cache = std::collections::BTreeMap<ActionId, CacheEntry>;

/// Three-valued event lifecycle derived from successive snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    New,
    Update,
    Purged,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::New => "NEW",
            EventType::Update => "UPDATE",
            EventType::Purged => "PURGED",
        };
        write!(fmt, "{}", name)
    }
}

/// One unit appended to a stream, serialized as a single JSON object
/// under the `data` field of the stream entry.
///
/// `NEW`/`UPDATE` events carry the verbatim source line in `raw`;
/// `PURGED` events instead carry the last-known `hash`, and their
/// `status` is always the literal `PURGED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_type: EventType,
    pub mdt: String,
    pub cat_idx: u64,
    pub rec_idx: u64,
    pub timestamp: u64,
    pub fid: String,
    pub action: String,
    pub status: String,
    pub action_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl StreamEvent {
    /// A `NEW` or `UPDATE` event for a record observed at `timestamp`.
    pub fn observed(event_type: EventType, record: &ActionRecord, timestamp: u64) -> StreamEvent {
        StreamEvent {
            event_type,
            mdt: record.id.mdt.clone(),
            cat_idx: record.id.cat_idx,
            rec_idx: record.id.rec_idx,
            timestamp,
            fid: record.fid.clone(),
            action: record.action.clone(),
            status: record.status.clone(),
            action_key: record.action_key(),
            raw: Some(record.raw.clone()),
            hash: None,
        }
    }

    /// A `PURGED` event carrying the last-known cached payload, so
    /// consumers can reason about the purge without cross-referencing
    /// earlier stream entries.
    pub fn purged(id: &ActionId, entry: &CacheEntry, timestamp: u64) -> StreamEvent {
        StreamEvent {
            event_type: EventType::Purged,
            mdt: id.mdt.clone(),
            cat_idx: id.cat_idx,
            rec_idx: id.rec_idx,
            timestamp,
            fid: entry.fid.clone(),
            action: entry.action.clone(),
            status: PURGED_STATUS.to_owned(),
            action_key: entry.action_key(),
            raw: None,
            hash: Some(entry.hash.clone()),
        }
    }

    pub fn id(&self) -> ActionId {
        ActionId::new(self.mdt.clone(), self.cat_idx, self.rec_idx)
    }
}

#[test]
fn digest_is_stable_128_bit_hex() {
    let digest = digest_line("idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED");

    assert_eq!(digest.len(), 32);
    assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    // Stable across calls, different for different lines.
    assert_eq!(
        digest,
        digest_line("idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED")
    );
    assert_ne!(
        digest,
        digest_line("idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING")
    );
}

#[test]
fn cache_key_round_trips() {
    let id = ActionId::new("elm-MDT0003", 7, 1234);

    assert_eq!(id.cache_key(), "elm-MDT0003|7|1234");
    assert_eq!(ActionId::from_cache_key("elm-MDT0003|7|1234").unwrap(), id);
    assert!(ActionId::from_cache_key("elm-MDT0003|7").is_err());
    assert!(ActionId::from_cache_key("|1|2").is_err());
    assert!(ActionId::from_cache_key("elm-MDT0003|x|2").is_err());
}

#[test]
fn observed_event_serialization_shape() {
    let record = ActionRecord {
        id: ActionId::new("testfs-MDT0000", 1, 1),
        fid: "0x1".to_owned(),
        action: "ARCHIVE".to_owned(),
        status: "STARTED".to_owned(),
        raw: "idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED".to_owned(),
    };
    let event = StreamEvent::observed(EventType::New, &record, 1700000000);

    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
    assert_eq!(json["event_type"], "NEW");
    assert_eq!(json["cat_idx"], 1);
    assert_eq!(json["action_key"], "0x1:ARCHIVE");
    assert_eq!(
        json["raw"],
        "idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"
    );
    assert!(json.get("hash").is_none());
}

#[test]
fn purged_event_serialization_shape() {
    let id = ActionId::new("testfs-MDT0000", 1, 1);
    let entry = CacheEntry {
        fid: "0x1".to_owned(),
        action: "ARCHIVE".to_owned(),
        status: "WAITING".to_owned(),
        raw: "idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING".to_owned(),
        hash: digest_line("idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING"),
        timestamp: 1700000000,
    };
    let event = StreamEvent::purged(&id, &entry, 1700000123);

    let json: serde_json::Value =
        serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
    assert_eq!(json["event_type"], "PURGED");
    // The cached status is overridden by the PURGED literal, but the
    // rest of the payload is carried over.
    assert_eq!(json["status"], "PURGED");
    assert_eq!(json["fid"], "0x1");
    assert_eq!(json["action"], "ARCHIVE");
    assert_eq!(json["hash"], entry.hash);
    assert!(json.get("raw").is_none());

    let round_trip: StreamEvent = serde_json::from_value(json).unwrap();
    assert_eq!(round_trip, event);
}
