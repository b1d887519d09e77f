//! The state differ turns two snapshots of the world — the freshly
//! parsed action logs and the cache committed after the last
//! successful publish — into the event batch that reconciles them.
//!
//! The differ is pure: it performs no I/O and takes the current time
//! as an argument, so a failed publish simply re-runs it against the
//! same cache and produces the identical batch (the at-least-once
//! retry path).
use std::collections::BTreeMap;

use crate::event_schema::ActionId;
use crate::event_schema::ActionRecord;
use crate::event_schema::Cache;
use crate::event_schema::CacheEntry;
use crate::event_schema::EventType;
use crate::event_schema::StreamEvent;
use crate::event_schema::digest_line;

/// The events to publish and the cache to commit once they land.
#[derive(Clone, Debug, Default)]
pub struct DiffOutcome {
    pub events: Vec<StreamEvent>,
    pub next_cache: Cache,
}

/// Compares `live` against `cache` and emits one event per changed
/// primary key: `NEW` for keys never seen, `UPDATE` for keys whose
/// raw line changed, `PURGED` (carrying the cached payload) for keys
/// that disappeared.
///
/// Batch order is all `NEW`, then all `UPDATE`, then all `PURGED`;
/// each group is sorted by (mdt, cat_idx, rec_idx), which both
/// clusters a group by MDT and guarantees that a key's `NEW` precedes
/// any later event for it in append order.  A key can contribute at
/// most one event per batch.
///
/// An MDT present in `cache` but absent from `live` — failed away, or
/// its log truncated — contributes a `PURGED` for every cached entry.
pub fn diff(live: &BTreeMap<ActionId, ActionRecord>, cache: &Cache, now: u64) -> DiffOutcome {
    let mut news = Vec::new();
    let mut updates = Vec::new();
    let mut purges = Vec::new();
    let mut next_cache = Cache::new();

    // BTreeMap iteration is (mdt, cat_idx, rec_idx) ascending, which
    // is exactly the required order within each event group.
    for (id, record) in live {
        match cache.get(id) {
            None => {
                news.push(StreamEvent::observed(EventType::New, record, now));
                next_cache.insert(id.clone(), CacheEntry::observed(record, now));
            }
            Some(entry) if entry.hash != digest_line(&record.raw) => {
                updates.push(StreamEvent::observed(EventType::Update, record, now));
                next_cache.insert(id.clone(), CacheEntry::observed(record, now));
            }
            Some(entry) => {
                // Unchanged: no event, and the entry keeps the
                // timestamp of its last observed change.
                next_cache.insert(id.clone(), entry.clone());
            }
        }
    }

    for (id, entry) in cache {
        if !live.contains_key(id) {
            purges.push(StreamEvent::purged(id, entry, now));
        }
    }

    let mut events = news;
    events.append(&mut updates);
    events.append(&mut purges);

    DiffOutcome { events, next_cache }
}

#[cfg(test)]
fn record(mdt: &str, cat_idx: u64, rec_idx: u64, fid: &str, status: &str) -> ActionRecord {
    let raw = format!(
        "idx=[{}/{}] action=ARCHIVE fid=[{}] status={}",
        cat_idx, rec_idx, fid, status
    );
    ActionRecord {
        id: ActionId::new(mdt, cat_idx, rec_idx),
        fid: fid.to_owned(),
        action: "ARCHIVE".to_owned(),
        status: status.to_owned(),
        raw,
    }
}

#[cfg(test)]
fn live_map(records: &[ActionRecord]) -> BTreeMap<ActionId, ActionRecord> {
    records
        .iter()
        .map(|r| (r.id.clone(), r.clone()))
        .collect()
}

#[test]
fn lifecycle_new_update_purged() {
    let started = record("testfs-MDT0000", 1, 1, "0x1", "STARTED");

    // First observation: NEW, and the cache picks the key up.
    let first = diff(&live_map(&[started.clone()]), &Cache::new(), 100);
    assert_eq!(first.events.len(), 1);
    assert_eq!(first.events[0].event_type, EventType::New);
    assert_eq!(first.events[0].status, "STARTED");
    assert_eq!(first.events[0].raw.as_deref(), Some(started.raw.as_str()));
    assert_eq!(first.next_cache.len(), 1);

    // Same line again: nothing to say.
    let idle = diff(&live_map(&[started.clone()]), &first.next_cache, 110);
    assert!(idle.events.is_empty());
    assert_eq!(idle.next_cache, first.next_cache);

    // The line changed: UPDATE with the new payload.
    let waiting = record("testfs-MDT0000", 1, 1, "0x1", "WAITING");
    let second = diff(&live_map(&[waiting.clone()]), &first.next_cache, 120);
    assert_eq!(second.events.len(), 1);
    assert_eq!(second.events[0].event_type, EventType::Update);
    assert_eq!(second.events[0].status, "WAITING");

    // The line vanished: PURGED carries the last cached payload.
    let third = diff(&BTreeMap::new(), &second.next_cache, 130);
    assert_eq!(third.events.len(), 1);
    let purged = &third.events[0];
    assert_eq!(purged.event_type, EventType::Purged);
    assert_eq!(purged.status, "PURGED");
    assert_eq!(purged.fid, "0x1");
    assert_eq!(purged.action, "ARCHIVE");
    assert_eq!(purged.hash.as_deref(), Some(digest_line(&waiting.raw).as_str()));
    assert_eq!(purged.raw, None);
    assert!(third.next_cache.is_empty());
}

#[test]
fn diff_is_deterministic_for_retries() {
    let live = live_map(&[
        record("testfs-MDT0000", 1, 1, "0x1", "STARTED"),
        record("testfs-MDT0000", 1, 2, "0x2", "WAITING"),
    ]);
    let cache = Cache::new();

    // A failed publish leaves the cache untouched; the retry must
    // re-derive the identical batch.
    let first = diff(&live, &cache, 42);
    let retry = diff(&live, &cache, 42);
    assert_eq!(first.events, retry.events);
    assert_eq!(first.next_cache, retry.next_cache);
}

#[test]
fn vanished_mdt_purges_all_of_its_entries() {
    let both = live_map(&[
        record("testfs-MDT0000", 1, 1, "0xa", "STARTED"),
        record("testfs-MDT0001", 1, 1, "0xb", "STARTED"),
        record("testfs-MDT0001", 1, 2, "0xc", "STARTED"),
    ]);
    let seeded = diff(&both, &Cache::new(), 10);

    // MDT0001's file disappears entirely; MDT0000 is untouched.
    let only_first = live_map(&[record("testfs-MDT0000", 1, 1, "0xa", "STARTED")]);
    let outcome = diff(&only_first, &seeded.next_cache, 20);

    assert_eq!(outcome.events.len(), 2);
    assert!(outcome
        .events
        .iter()
        .all(|e| e.event_type == EventType::Purged && e.mdt == "testfs-MDT0001"));
    assert!(outcome.next_cache.keys().all(|id| id.mdt == "testfs-MDT0000"));
}

#[test]
fn batch_order_is_new_update_purged_grouped_by_mdt() {
    // Seed a cache with entries on two MDTs.
    let seeded = diff(
        &live_map(&[
            record("a-MDT0000", 1, 2, "0x1", "STARTED"),
            record("a-MDT0000", 1, 5, "0x2", "STARTED"),
            record("b-MDT0001", 1, 1, "0x3", "STARTED"),
        ]),
        &Cache::new(),
        10,
    );

    // Next cycle: 0x1 updated, 0x2 purged, and two fresh keys appear
    // out of index order.
    let outcome = diff(
        &live_map(&[
            record("a-MDT0000", 1, 2, "0x1", "SUCCEED"),
            record("a-MDT0000", 2, 1, "0x9", "STARTED"),
            record("a-MDT0000", 1, 9, "0x8", "STARTED"),
            record("b-MDT0001", 1, 1, "0x3", "STARTED"),
        ]),
        &seeded.next_cache,
        20,
    );

    let shape: Vec<(EventType, &str, u64, u64)> = outcome
        .events
        .iter()
        .map(|e| (e.event_type, e.mdt.as_str(), e.cat_idx, e.rec_idx))
        .collect();
    assert_eq!(
        shape,
        vec![
            (EventType::New, "a-MDT0000", 1, 9),
            (EventType::New, "a-MDT0000", 2, 1),
            (EventType::Update, "a-MDT0000", 1, 2),
            (EventType::Purged, "a-MDT0000", 1, 5),
        ]
    );
}

#[test]
fn cache_hashes_always_match_their_raw_lines() {
    let outcome = diff(
        &live_map(&[
            record("a-MDT0000", 1, 1, "0x1", "STARTED"),
            record("a-MDT0000", 1, 2, "0x2", "WAITING"),
        ]),
        &Cache::new(),
        7,
    );

    for entry in outcome.next_cache.values() {
        assert_eq!(entry.hash, digest_line(&entry.raw));
    }
}
