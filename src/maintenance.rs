//! Periodic self-healing and garbage collection for the per-MDT
//! streams.
//!
//! The stream itself is the audit log: a maintenance pass replays it
//! from the beginning to reconstruct which actions it still claims
//! are live, compares that against the cache snapshot handed off by
//! the shipper loop, appends corrective `PURGED`s for actions the
//! stream believes in but the ground truth has forgotten (purges
//! missed during downtime), and finally trims everything older than
//! the oldest still-live action.
//!
//! Replay must complete before reconciliation, and reconciliation
//! before trimming.  A pass that fails mid-stream leaves that stream
//! untouched until the next cycle; other streams still get their
//! pass.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use tracing::instrument;

use crate::chain_error;
use crate::chain_warn;
use crate::config::Config;
use crate::connector::StreamId;
use crate::connector::StreamOps;
use crate::event_schema::Cache;
use crate::event_schema::EventType;
use crate::event_schema::PURGED_STATUS;
use crate::event_schema::StreamEvent;
use crate::event_schema::digest_line;
use crate::event_schema::stream_key;
use crate::result::Result;

/// Maintenance knobs lifted out of the full daemon configuration.
#[derive(Clone, Debug)]
pub struct MaintenanceTuning {
    pub replay_chunk_size: usize,
    pub trim_chunk_size: usize,
    pub aggressive_trim_threshold: u64,
}

impl MaintenanceTuning {
    pub fn from_config(config: &Config) -> MaintenanceTuning {
        MaintenanceTuning {
            replay_chunk_size: config.replay_chunk_size,
            trim_chunk_size: config.trim_chunk_size,
            aggressive_trim_threshold: config.aggressive_trim_threshold,
        }
    }
}

/// The hand-off payload built by the shipper loop after a committed
/// cycle: a deep snapshot of the cache (never the live map), the MDTs
/// this host currently answers for, and the per-MDT first-`NEW`
/// floors recorded by the publisher since the last hand-off.
#[derive(Clone, Debug, Default)]
pub struct MaintenanceJob {
    pub snapshot: Cache,
    pub owned_mdts: BTreeSet<String>,
    pub first_new_ids: BTreeMap<String, StreamId>,
}

/// Replayed state for one still-live `action_key`.
#[derive(Clone, Debug)]
pub struct ReplayEntry {
    /// Most recent non-purged append: the orphan-correlation handle.
    pub latest: StreamId,
    /// First `NEW`/`UPDATE` since the key was last absent: the trim
    /// lower bound.  A purge-then-reintroduce restarts it.
    pub earliest: StreamId,
    /// Payload of the most recent non-purged append, kept so a
    /// synthetic purge can carry the last-known state.
    pub last_event: StreamEvent,
}

/// The live-set reconstruction of one stream.
#[derive(Clone, Debug, Default)]
pub struct StreamState {
    pub live: BTreeMap<String, ReplayEntry>,
    pub replayed: u64,
    /// ID of the last entry the replay visited, parseable or not:
    /// everything at or below it is accounted for in `live`.
    pub last_id: Option<StreamId>,
}

impl StreamState {
    /// Folds one stream entry into the live set.
    pub fn apply(&mut self, id: StreamId, event: StreamEvent) {
        use std::collections::btree_map::Entry;

        self.replayed += 1;

        match event.event_type {
            EventType::New | EventType::Update => {
                match self.live.entry(event.action_key.clone()) {
                    Entry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        entry.latest = id;
                        entry.last_event = event;
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(ReplayEntry {
                            latest: id,
                            earliest: id,
                            last_event: event,
                        });
                    }
                }
            }
            EventType::Purged => {
                self.live.remove(&event.action_key);
            }
        }
    }

    /// The oldest ID at which any currently-live key was introduced.
    pub fn oldest_live_id(&self) -> Option<StreamId> {
        self.live.values().map(|entry| entry.earliest).min()
    }
}

/// Replays `stream_key` from the beginning, in pages of `chunk`.
/// Entries that do not parse as events are skipped with a warning;
/// they cannot be live actions.
#[instrument(level = "debug", skip(ops))]
pub fn replay<S: StreamOps + ?Sized>(
    ops: &S,
    stream_key: &str,
    chunk: usize,
) -> Result<StreamState> {
    let mut state = StreamState::default();
    let mut after: Option<StreamId> = None;

    loop {
        let page = ops.range_read(stream_key, after, chunk)?;
        let page_len = page.len();
        let last_id = match page.last() {
            Some((id, _)) => *id,
            None => break,
        };

        for (id, payload) in page {
            match serde_json::from_str::<StreamEvent>(&payload) {
                Ok(event) => state.apply(id, event),
                Err(error) => {
                    tracing::warn!(%error, stream_key, %id, "skipping unparseable stream entry")
                }
            }
        }

        after = Some(last_id);
        state.last_id = Some(last_id);
        if page_len < chunk {
            break;
        }
    }

    Ok(state)
}

/// Live `action_key`s on this stream with no matching (fid, action)
/// entry in the cache snapshot: actions the stream still believes in
/// but the ground truth has forgotten.
fn orphan_keys(state: &StreamState, snapshot: &Cache, mdt: &str) -> Vec<String> {
    let cached: HashSet<String> = snapshot
        .iter()
        .filter(|(id, _)| id.mdt == mdt)
        .map(|(_, entry)| entry.action_key())
        .collect();

    state
        .live
        .iter()
        .filter(|(key, entry)| entry.last_event.mdt == mdt && !cached.contains(*key))
        .map(|(key, _)| key.clone())
        .collect()
}

/// A corrective `PURGED` reconstructed from the orphan's most recent
/// non-purged stream entry.
fn synthetic_purge(entry: &ReplayEntry, now: u64) -> StreamEvent {
    let last = &entry.last_event;

    StreamEvent {
        event_type: EventType::Purged,
        mdt: last.mdt.clone(),
        cat_idx: last.cat_idx,
        rec_idx: last.rec_idx,
        timestamp: now,
        fid: last.fid.clone(),
        action: last.action.clone(),
        status: PURGED_STATUS.to_owned(),
        action_key: last.action_key.clone(),
        raw: None,
        hash: last
            .raw
            .as_deref()
            .map(digest_line)
            .or_else(|| last.hash.clone()),
    }
}

/// What one stream's pass did, for the cycle log line.
#[derive(Clone, Debug)]
pub struct PassSummary {
    pub stream_key: String,
    pub replayed: u64,
    pub live: usize,
    pub healed: usize,
    pub trimmed: u64,
    pub discarded: bool,
}

/// One full replay → reconcile → trim pass over `stream_key`.
#[instrument(level = "debug", skip(ops, job, tuning))]
pub fn run_pass<S: StreamOps + ?Sized>(
    ops: &S,
    stream_key: &str,
    mdt: &str,
    job: &MaintenanceJob,
    tuning: &MaintenanceTuning,
    now: u64,
) -> Result<PassSummary> {
    // (a) Replay.
    let mut state = replay(ops, stream_key, tuning.replay_chunk_size)?;
    let replayed = state.replayed;

    // (b) Reconcile.  An append failure here is a benign deferment:
    // the orphan stays in the live set, which also keeps the trim
    // below conservatively bounded by its earliest ID.
    let mut healed = 0usize;
    let mut appended_ids: Vec<StreamId> = Vec::new();
    for action_key in orphan_keys(&state, &job.snapshot, mdt) {
        let event = synthetic_purge(&state.live[&action_key], now);
        let payload = serde_json::to_string(&event)
            .map_err(|e| chain_error!(e, "failed to serialize synthetic purge", stream_key))?;

        match ops.pipeline_append(stream_key, std::slice::from_ref(&payload)) {
            Ok(ids) => {
                tracing::info!(stream_key, %action_key, "healed orphaned action with synthetic purge");
                appended_ids.extend(ids);
                state.live.remove(&action_key);
                healed += 1;
            }
            Err(error) => {
                let _ = chain_warn!(error, "deferring orphan purge to the next pass",
                                    stream_key, %action_key);
            }
        }
    }

    // (c) Trim.
    let mut trimmed = 0u64;
    let mut discarded = false;
    match state.oldest_live_id() {
        None => {
            // Nothing live: the stream is entirely historical and may
            // be discarded.  A publish may still have raced the end of
            // the replay, so look once past everything this pass has
            // seen or appended; a racing entry defers the discard to
            // the next cycle, which will replay it properly.
            let cutoff = appended_ids.iter().copied().max().or(state.last_id);
            let raced = !ops.range_read(stream_key, cutoff, 1)?.is_empty();

            if raced {
                tracing::info!(stream_key, "publish raced the replay; deferring stream discard");
            } else {
                trimmed = ops.trim_all(stream_key)?;
                ops.delete_key(stream_key)?;
                discarded = true;
            }
        }
        Some(oldest) => {
            // The publisher's first-NEW floor stands in for a live
            // key whose introduction the replay may have missed; it
            // only ever lowers the trim bound.
            let min_id = job
                .first_new_ids
                .get(mdt)
                .copied()
                .map_or(oldest, |floor| oldest.min(floor));

            loop {
                let removed = ops.trim_minid(stream_key, min_id, tuning.trim_chunk_size)?;
                trimmed += removed;

                // Re-issue while the call was LIMIT-capped or removed
                // more than the aggressive threshold; a single
                // scheduled pass must not leave a large backlog
                // behind.
                if removed < tuning.trim_chunk_size as u64
                    && removed <= tuning.aggressive_trim_threshold
                {
                    break;
                }
            }
        }
    }

    Ok(PassSummary {
        stream_key: stream_key.to_owned(),
        replayed,
        live: state.live.len(),
        healed,
        trimmed,
        discarded,
    })
}

/// Runs one maintenance cycle over every owned stream that exists.
///
/// Stream keys are discovered with `SCAN MATCH prefix:*` and
/// intersected with the owned-MDT list, so a stream another MDS now
/// owns after failover is left alone.  A failing pass aborts only its
/// own stream.
pub fn run_cycle<S: StreamOps + ?Sized>(
    ops: &S,
    prefix: &str,
    job: &MaintenanceJob,
    tuning: &MaintenanceTuning,
    now: u64,
) {
    let pattern = format!("{}:*", prefix);
    let existing: BTreeSet<String> = match ops.scan_keys(&pattern) {
        Ok(keys) => keys.into_iter().collect(),
        Err(error) => {
            let _ = chain_warn!(error, "failed to discover stream keys; skipping cycle", %pattern);
            return;
        }
    };

    for mdt in &job.owned_mdts {
        let key = stream_key(prefix, mdt);
        if !existing.contains(&key) {
            continue;
        }

        match run_pass(ops, &key, mdt, job, tuning, now) {
            Ok(summary) => {
                tracing::info!(stream_key = %summary.stream_key, replayed = summary.replayed,
                               live = summary.live, healed = summary.healed,
                               trimmed = summary.trimmed, discarded = summary.discarded,
                               "maintenance pass complete");
            }
            Err(error) => {
                let _ = chain_warn!(error, "maintenance pass failed; stream left for next cycle",
                                    %key);
            }
        }
    }
}

#[cfg(test)]
use crate::connector::memory::MemoryStream;
#[cfg(test)]
use crate::event_schema::{ActionId, ActionRecord, CacheEntry};

#[cfg(test)]
fn observed_event(mdt: &str, rec: u64, fid: &str, event_type: EventType, status: &str) -> StreamEvent {
    let record = ActionRecord {
        id: ActionId::new(mdt, 1, rec),
        fid: fid.to_owned(),
        action: "ARCHIVE".to_owned(),
        status: status.to_owned(),
        raw: format!("idx=[1/{}] action=ARCHIVE fid=[{}] status={}", rec, fid, status),
    };
    StreamEvent::observed(event_type, &record, 1_700_000_000)
}

#[cfg(test)]
fn purged_event(mdt: &str, rec: u64, fid: &str) -> StreamEvent {
    let id = ActionId::new(mdt, 1, rec);
    let raw = format!("idx=[1/{}] action=ARCHIVE fid=[{}] status=SUCCEED", rec, fid);
    let entry = CacheEntry {
        fid: fid.to_owned(),
        action: "ARCHIVE".to_owned(),
        status: "SUCCEED".to_owned(),
        hash: digest_line(&raw),
        raw,
        timestamp: 1_700_000_000,
    };
    StreamEvent::purged(&id, &entry, 1_700_000_001)
}

#[cfg(test)]
fn cache_with(entries: &[(&str, u64, &str)]) -> Cache {
    let mut cache = Cache::new();
    for (mdt, rec, fid) in entries {
        let raw = format!("idx=[1/{}] action=ARCHIVE fid=[{}] status=STARTED", rec, fid);
        cache.insert(
            ActionId::new(*mdt, 1, *rec),
            CacheEntry {
                fid: (*fid).to_owned(),
                action: "ARCHIVE".to_owned(),
                status: "STARTED".to_owned(),
                hash: digest_line(&raw),
                raw,
                timestamp: 1_700_000_000,
            },
        );
    }
    cache
}

#[cfg(test)]
fn tuning() -> MaintenanceTuning {
    MaintenanceTuning::from_config(&Config::default())
}

#[test]
fn replay_tracks_earliest_and_latest_per_action_key() {
    let stream = MemoryStream::new();
    let key = "hsm:actions/test";

    let a_new = stream.seed(key, &observed_event("m-MDT0000", 1, "0xa", EventType::New, "STARTED"));
    let a_update =
        stream.seed(key, &observed_event("m-MDT0000", 1, "0xa", EventType::Update, "WAITING"));
    stream.seed(key, &observed_event("m-MDT0000", 2, "0xb", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 2, "0xb"));
    let b_again = stream.seed(key, &observed_event("m-MDT0000", 2, "0xb", EventType::New, "STARTED"));

    let state = replay(&stream, key, 2).expect("replay should succeed");

    assert_eq!(state.replayed, 5);
    assert_eq!(state.live.len(), 2);

    let a = &state.live["0xa:ARCHIVE"];
    assert_eq!(a.earliest, a_new);
    assert_eq!(a.latest, a_update);
    assert_eq!(a.last_event.status, "WAITING");

    // Purge-then-reintroduce restarts the earliest bound.
    let b = &state.live["0xb:ARCHIVE"];
    assert_eq!(b.earliest, b_again);
    assert_eq!(state.oldest_live_id(), Some(a_new));
}

#[test]
fn orphan_healing_then_discard_of_a_dead_stream() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";
    stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));

    // Ground truth is empty: the source file is empty and so is the
    // cache snapshot.
    let job = MaintenanceJob {
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };

    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_100).expect("pass");

    // One synthetic purge healed the orphan, then the now entirely
    // historical stream was trimmed to nothing and dropped.
    assert_eq!(summary.healed, 1);
    assert_eq!(summary.live, 0);
    assert_eq!(summary.trimmed, 2);
    assert!(summary.discarded);
    assert!(!stream.key_exists(key));
}

#[test]
fn synthetic_purges_carry_the_last_known_payload() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";
    stream.seed(key, &observed_event("m-MDT0000", 7, "0xA", EventType::New, "STARTED"));
    let last = observed_event("m-MDT0000", 7, "0xA", EventType::Update, "WAITING");
    stream.seed(key, &last);

    let state = replay(&stream, key, 100).expect("replay should succeed");
    let purge = synthetic_purge(&state.live["0xA:ARCHIVE"], 1_700_000_200);

    assert_eq!(purge.event_type, EventType::Purged);
    assert_eq!(purge.status, PURGED_STATUS);
    assert_eq!(purge.fid, "0xA");
    assert_eq!(purge.action, "ARCHIVE");
    assert_eq!(purge.cat_idx, 1);
    assert_eq!(purge.rec_idx, 7);
    assert_eq!(purge.action_key, "0xA:ARCHIVE");
    assert_eq!(purge.raw, None);
    assert_eq!(purge.hash.as_deref(), Some(digest_line(last.raw.as_deref().unwrap()).as_str()));
}

#[test]
fn trim_preserves_the_oldest_live_action() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";

    // Historical junk before the live action's introduction.
    stream.seed(key, &observed_event("m-MDT0000", 9, "0xC", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 9, "0xC"));

    let t0 = stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::Update, "WAITING"));
    stream.seed(key, &observed_event("m-MDT0000", 2, "0xB", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 2, "0xB"));

    // Only 0xA is still ground truth.
    let job = MaintenanceJob {
        snapshot: cache_with(&[("m-MDT0000", 1, "0xA")]),
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };

    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_300).expect("pass");

    assert_eq!(summary.healed, 0);
    assert_eq!(summary.trimmed, 2);
    assert!(!summary.discarded);

    let events = stream.events(key);
    assert_eq!(events[0].0, t0);
    assert_eq!(events[0].1.event_type, EventType::New);
    assert_eq!(events[0].1.fid, "0xA");
}

#[test]
fn aggressive_trim_drains_the_backlog_in_one_pass() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";

    // 20,000 purged entries, then one live action near the tail.
    for rec in 0..10_000u64 {
        let fid = format!("0x{:x}", rec + 0x100);
        stream.seed(key, &observed_event("m-MDT0000", rec, &fid, EventType::New, "STARTED"));
        stream.seed(key, &purged_event("m-MDT0000", rec, &fid));
    }
    stream.seed(key, &observed_event("m-MDT0000", 20_000, "0xlive", EventType::New, "STARTED"));

    let job = MaintenanceJob {
        snapshot: cache_with(&[("m-MDT0000", 20_000, "0xlive")]),
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };

    // Default tuning: chunk 1,000, threshold 5,000.  Every capped
    // call removes a full chunk, so the pass keeps re-issuing the
    // trim until the backlog is gone.
    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_400).expect("pass");

    assert_eq!(summary.trimmed, 20_000);
    let events = stream.events(key);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.fid, "0xlive");
}

#[test]
fn publisher_floor_lowers_the_trim_bound_for_live_keys() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";

    // A NEW published and purged within the current hand-off window:
    // its floor is older than anything still live.
    let floor = stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 1, "0xA"));
    stream.seed(key, &observed_event("m-MDT0000", 2, "0xB", EventType::New, "STARTED"));

    // Without the floor the trim bound would be 0xB's introduction
    // and the 0xA pair would be cut; the floor keeps the bound low.
    let job = MaintenanceJob {
        snapshot: cache_with(&[("m-MDT0000", 2, "0xB")]),
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        first_new_ids: [("m-MDT0000".to_owned(), floor)].into(),
        ..Default::default()
    };

    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_500).expect("pass");

    assert!(!summary.discarded);
    assert_eq!(summary.trimmed, 0);
    assert_eq!(stream.events(key).len(), 3);
    assert_eq!(stream.events(key)[0].0, floor);
}

#[test]
fn empty_live_set_discards_even_with_a_floor() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";

    // The floored action was already purged in-stream: nothing is
    // live, so the stream is historical and goes away wholesale (a
    // zero-maxlen trim, never a minid one).
    let floor = stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 1, "0xA"));

    let job = MaintenanceJob {
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        first_new_ids: [("m-MDT0000".to_owned(), floor)].into(),
        ..Default::default()
    };

    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_500).expect("pass");

    assert!(summary.discarded);
    assert_eq!(summary.trimmed, 2);
    assert!(!stream.key_exists(key));
}

/// Delegates to a `MemoryStream`, appending one extra event right
/// after the replay's final page is served: the shape of a publish
/// racing the end of a maintenance replay.
#[cfg(test)]
struct RacingPublish<'a> {
    inner: &'a MemoryStream,
    raced_key: String,
    raced_event: StreamEvent,
    fired: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl StreamOps for RacingPublish<'_> {
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.scan_keys(pattern)
    }

    fn pipeline_append(&self, stream_key: &str, payloads: &[String]) -> Result<Vec<StreamId>> {
        self.inner.pipeline_append(stream_key, payloads)
    }

    fn range_read(
        &self,
        stream_key: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<(StreamId, String)>> {
        use std::sync::atomic::Ordering;

        let page = self.inner.range_read(stream_key, after, count)?;
        if page.len() < count && !self.fired.swap(true, Ordering::Relaxed) {
            self.inner.seed(&self.raced_key, &self.raced_event);
        }
        Ok(page)
    }

    fn trim_minid(&self, stream_key: &str, min_id: StreamId, chunk: usize) -> Result<u64> {
        self.inner.trim_minid(stream_key, min_id, chunk)
    }

    fn trim_all(&self, stream_key: &str) -> Result<u64> {
        self.inner.trim_all(stream_key)
    }

    fn delete_key(&self, stream_key: &str) -> Result<()> {
        self.inner.delete_key(stream_key)
    }
}

#[test]
fn racing_publish_defers_the_stream_discard() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";
    stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.seed(key, &purged_event("m-MDT0000", 1, "0xA"));

    // A NEW lands just after the replay finishes; the pass must not
    // destroy it with a wholesale discard.
    let ops = RacingPublish {
        inner: &stream,
        raced_key: key.to_owned(),
        raced_event: observed_event("m-MDT0000", 2, "0xB", EventType::New, "STARTED"),
        fired: Default::default(),
    };

    let job = MaintenanceJob {
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };
    let summary = run_pass(&ops, key, "m-MDT0000", &job, &tuning(), 1_700_000_550).expect("pass");

    assert!(!summary.discarded);
    assert_eq!(summary.trimmed, 0);
    assert!(stream.key_exists(key));
    // The raced NEW is intact for the next cycle's replay.
    let events = stream.events(key);
    assert_eq!(events.last().map(|(_, e)| e.fid.as_str()), Some("0xB"));
    assert_eq!(events.len(), 3);
}

#[test]
fn orphan_append_failure_is_a_benign_deferment() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";
    let first = stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.set_fail_appends(true);

    let job = MaintenanceJob {
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };

    let summary =
        run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_600).expect("pass");

    // The orphan stays live, which also keeps the trim bounded by
    // its introduction; the stream is left intact for the next pass.
    assert_eq!(summary.healed, 0);
    assert_eq!(summary.live, 1);
    assert_eq!(summary.trimmed, 0);
    assert!(!summary.discarded);
    assert_eq!(stream.events(key)[0].0, first);
}

#[test]
fn cycle_only_touches_owned_streams() {
    let stream = MemoryStream::new();
    stream.seed(
        "hsm:actions:m-MDT0000",
        &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"),
    );
    stream.seed(
        "hsm:actions:m-MDT0001",
        &observed_event("m-MDT0001", 1, "0xB", EventType::New, "STARTED"),
    );

    // Only MDT0000 is owned (and its action is gone from ground
    // truth): its stream is healed and discarded, the other is not
    // ours to touch.
    let job = MaintenanceJob {
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };
    run_cycle(&stream, "hsm:actions", &job, &tuning(), 1_700_000_700);

    assert!(!stream.key_exists("hsm:actions:m-MDT0000"));
    assert_eq!(stream.events("hsm:actions:m-MDT0001").len(), 1);
}

#[test]
fn surviving_live_set_is_a_subset_of_the_snapshot() {
    let stream = MemoryStream::new();
    let key = "hsm:actions:m-MDT0000";
    stream.seed(key, &observed_event("m-MDT0000", 1, "0xA", EventType::New, "STARTED"));
    stream.seed(key, &observed_event("m-MDT0000", 2, "0xB", EventType::New, "STARTED"));
    stream.seed(key, &observed_event("m-MDT0000", 3, "0xC", EventType::New, "STARTED"));

    let job = MaintenanceJob {
        snapshot: cache_with(&[("m-MDT0000", 1, "0xA"), ("m-MDT0000", 3, "0xC")]),
        owned_mdts: ["m-MDT0000".to_owned()].into(),
        ..Default::default()
    };
    run_pass(&stream, key, "m-MDT0000", &job, &tuning(), 1_700_000_800).expect("pass");

    let snapshot_keys: HashSet<String> =
        job.snapshot.values().map(CacheEntry::action_key).collect();
    let state = replay(&stream, key, 100).expect("replay should succeed");
    assert!(state.live.keys().all(|key| snapshot_keys.contains(key)));
    assert_eq!(state.live.len(), 2);
}
