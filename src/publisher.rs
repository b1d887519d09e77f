//! The publisher turns a differ batch into pipelined stream appends,
//! one stream per MDT.
//!
//! The caller (the shipper loop) only commits the next cache once
//! `publish` returns `Ok`: a crash or broker outage between send and
//! acknowledgement leaves the old cache in place, so the next cycle
//! re-derives and re-sends the same batch.  Consumers must therefore
//! de-duplicate on `(mdt, cat_idx, rec_idx, event_type, hash)`.
use std::collections::BTreeMap;

use crate::chain_error;
use crate::connector::StreamId;
use crate::connector::StreamOps;
use crate::event_schema::EventType;
use crate::event_schema::StreamEvent;
use crate::event_schema::stream_key;
use crate::result::Result;

/// What landed where.  `first_new_ids` records, per MDT, the
/// server-assigned ID of the batch's first `NEW` append; the
/// maintenance worker uses it as a trim floor when its replay races
/// concurrent publishes.
#[derive(Clone, Debug, Default)]
pub struct PublishReport {
    pub appended: usize,
    pub first_new_ids: BTreeMap<String, StreamId>,
}

/// Appends `events` to their per-MDT streams, in differ order, one
/// pipeline per stream.
///
/// On `Err` the cache must not be advanced: some appends may have
/// landed, and re-sending them is the at-least-once contract.
pub fn publish<S: StreamOps + ?Sized>(
    ops: &S,
    prefix: &str,
    events: &[StreamEvent],
) -> Result<PublishReport> {
    debug_assert!(no_duplicate_primary_keys(events));

    // Partition by target stream; differ order is preserved within
    // each group.
    let mut per_mdt: BTreeMap<&str, Vec<&StreamEvent>> = BTreeMap::new();
    for event in events {
        per_mdt.entry(event.mdt.as_str()).or_default().push(event);
    }

    let mut report = PublishReport::default();
    for (mdt, batch) in per_mdt {
        let key = stream_key(prefix, mdt);
        let payloads = batch
            .iter()
            .map(|event| {
                serde_json::to_string(event)
                    .map_err(|e| chain_error!(e, "failed to serialize stream event", %key))
            })
            .collect::<Result<Vec<String>>>()?;

        let ids = ops
            .pipeline_append(&key, &payloads)
            .map_err(|e| chain_error!(e, "failed to ship event batch", %key, events = batch.len()))?;

        for (event, id) in batch.iter().zip(ids.iter()) {
            if event.event_type == EventType::New && !report.first_new_ids.contains_key(mdt) {
                report.first_new_ids.insert(mdt.to_owned(), *id);
            }
        }
        report.appended += ids.len();
        tracing::debug!(%key, events = batch.len(), "shipped event batch");
    }

    Ok(report)
}

/// The differ emits at most one event per primary key and batch;
/// anything else would let a reordered append break the per-key
/// ordering guarantee.
fn no_duplicate_primary_keys(events: &[StreamEvent]) -> bool {
    let mut seen = std::collections::HashSet::new();
    events.iter().all(|event| seen.insert(event.id()))
}

#[cfg(test)]
use crate::connector::memory::MemoryStream;
#[cfg(test)]
use crate::event_schema::{ActionId, ActionRecord};

#[cfg(test)]
fn observed(mdt: &str, cat: u64, rec: u64, event_type: EventType) -> StreamEvent {
    let record = ActionRecord {
        id: ActionId::new(mdt, cat, rec),
        fid: format!("0x{}", rec),
        action: "ARCHIVE".to_owned(),
        status: "STARTED".to_owned(),
        raw: format!("idx=[{}/{}] action=ARCHIVE fid=[0x{}] status=STARTED", cat, rec, rec),
    };
    StreamEvent::observed(event_type, &record, 1_700_000_000)
}

#[test]
fn publishes_per_mdt_in_batch_order() {
    let stream = MemoryStream::new();
    let events = vec![
        observed("a-MDT0000", 1, 1, EventType::New),
        observed("b-MDT0001", 1, 1, EventType::New),
        observed("a-MDT0000", 1, 2, EventType::Update),
    ];

    let report = publish(&stream, "hsm:actions", &events).expect("publish should succeed");
    assert_eq!(report.appended, 3);

    let first = stream.events("hsm:actions:a-MDT0000");
    assert_eq!(first.len(), 2);
    assert_eq!(first[0].1.event_type, EventType::New);
    assert_eq!(first[1].1.event_type, EventType::Update);
    assert!(first[0].0 < first[1].0);

    let second = stream.events("hsm:actions:b-MDT0001");
    assert_eq!(second.len(), 1);

    // The first NEW of each MDT's batch is recorded as a trim floor.
    assert_eq!(report.first_new_ids["a-MDT0000"], first[0].0);
    assert_eq!(report.first_new_ids["b-MDT0001"], second[0].0);
}

#[test]
fn update_only_batches_record_no_floor() {
    let stream = MemoryStream::new();
    let events = vec![observed("a-MDT0000", 1, 1, EventType::Update)];

    let report = publish(&stream, "hsm:actions", &events).expect("publish should succeed");
    assert_eq!(report.appended, 1);
    assert!(report.first_new_ids.is_empty());
}

#[test]
fn refused_appends_propagate_a_typed_failure() {
    let stream = MemoryStream::new();
    stream.set_fail_appends(true);

    let events = vec![observed("a-MDT0000", 1, 1, EventType::New)];
    assert!(publish(&stream, "hsm:actions", &events).is_err());
    assert!(stream.events("hsm:actions:a-MDT0000").is_empty());

    // Redis restored: the identical retry lands.
    stream.set_fail_appends(false);
    let report = publish(&stream, "hsm:actions", &events).expect("retry should succeed");
    assert_eq!(report.appended, 1);
}

#[test]
fn empty_batches_are_a_no_op() {
    let stream = MemoryStream::new();
    let report = publish(&stream, "hsm:actions", &[]).expect("publish should succeed");

    assert_eq!(report.appended, 0);
    assert!(report.first_new_ids.is_empty());
    assert!(!stream.key_exists("hsm:actions:a-MDT0000"));
}
