//! Durable storage for the action cache.
//!
//! The cache file is the shipper's commit record: it is rewritten
//! only after a publish batch has been fully acknowledged, via a
//! fsync-ed temporary file atomically renamed over the final path.
//! A crash at any point leaves either the previous or the new
//! version intact, never a partial file.  The file has a single
//! writer (the shipper loop); the maintenance worker only ever sees
//! in-memory snapshots.
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;

use tracing::instrument;

use crate::chain_error;
use crate::chain_warn;
use crate::event_schema::ActionId;
use crate::event_schema::Cache;
use crate::event_schema::CacheEntry;
use crate::fresh_error;
use crate::result::Result;

fn parse_cache(bytes: &[u8]) -> Result<Cache> {
    let keyed: BTreeMap<String, CacheEntry> =
        serde_json::from_slice(bytes).map_err(|e| chain_warn!(e, "malformed cache file"))?;

    keyed
        .into_iter()
        .map(|(key, entry)| Ok((ActionId::from_cache_key(&key)?, entry)))
        .collect()
}

/// Loads the cache from `path`.
///
/// A missing or malformed file yields an empty cache with a warning:
/// the shipper then re-derives everything as `NEW`, which is safe
/// under at-least-once delivery, just noisy.
#[instrument(level = "debug")]
pub fn load(path: &Path) -> Cache {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::info!(?path, "no cache file yet; starting fresh");
            return Cache::new();
        }
        Err(error) => {
            tracing::warn!(%error, ?path, "could not read cache file; starting fresh");
            return Cache::new();
        }
    };

    match parse_cache(&contents) {
        Ok(cache) => cache,
        Err(_) => {
            // parse_cache already traced the cause.
            tracing::warn!(?path, "discarding malformed cache file; starting fresh");
            Cache::new()
        }
    }
}

/// Atomically replaces the cache file at `path` with `cache`.
///
/// The temporary file is written in the target directory (a rename
/// only stays atomic within one filesystem) and fsync-ed before the
/// rename.
#[instrument(level = "debug", skip(cache), fields(entries = cache.len()))]
pub fn commit(path: &Path, cache: &Cache) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| fresh_error!("cache path has no parent directory", ?path))?;
    std::fs::create_dir_all(parent)
        .map_err(|e| chain_error!(e, "failed to create cache directory", ?parent))?;

    let keyed: BTreeMap<String, &CacheEntry> = cache
        .iter()
        .map(|(id, entry)| (id.cache_key(), entry))
        .collect();
    let bytes =
        serde_json::to_vec(&keyed).map_err(|e| chain_error!(e, "failed to serialize cache"))?;

    let temp = tempfile::Builder::new()
        .prefix(".cache.")
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| chain_error!(e, "failed to create temporary cache file", ?parent))?;

    temp.as_file()
        .write_all(&bytes)
        .map_err(|e| chain_error!(e, "failed to write cache contents", len = bytes.len()))?;
    temp.as_file()
        .sync_all()
        .map_err(|e| chain_error!(e, "failed to fsync cache file", ?path))?;

    temp.persist(path)
        .map_err(|e| chain_error!(e, "failed to publish cache file", ?path))?;
    Ok(())
}

#[cfg(test)]
fn sample_cache() -> Cache {
    use crate::event_schema::digest_line;

    let mut cache = Cache::new();
    for (mdt, cat, rec, fid, status) in [
        ("elm-MDT0000", 1u64, 7u64, "0x200000402:0x1:0x0", "STARTED"),
        ("elm-MDT0003", 2, 9, "0x200000402:0x2:0x0", "SUCCEED"),
    ] {
        let raw = format!("idx=[{}/{}] action=RESTORE fid=[{}] status={}", cat, rec, fid, status);
        cache.insert(
            ActionId::new(mdt, cat, rec),
            CacheEntry {
                fid: fid.to_owned(),
                action: "RESTORE".to_owned(),
                status: status.to_owned(),
                hash: digest_line(&raw),
                raw,
                timestamp: 1_700_000_000,
            },
        );
    }
    cache
}

#[test]
fn commit_then_load_round_trips() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("cache.json");
    let cache = sample_cache();

    commit(&path, &cache).expect("commit should succeed");
    assert_eq!(load(&path), cache);

    // Committing again replaces the previous version and leaves no
    // temporary debris behind.
    let mut smaller = cache.clone();
    smaller.remove(&ActionId::new("elm-MDT0000", 1, 7));
    commit(&path, &smaller).expect("commit should succeed");
    assert_eq!(load(&path), smaller);

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .expect("should list dir")
        .map(|entry| entry.expect("should read entry").file_name())
        .collect();
    assert_eq!(leftovers, vec![std::ffi::OsString::from("cache.json")]);
}

#[test]
fn commit_creates_missing_directories() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("nested/deeper/cache.json");

    commit(&path, &sample_cache()).expect("commit should succeed");
    assert_eq!(load(&path), sample_cache());
}

#[test]
fn missing_or_malformed_files_yield_an_empty_cache() {
    let dir = tempfile::tempdir().expect("should create temp dir");

    assert!(load(&dir.path().join("absent.json")).is_empty());

    let garbled = dir.path().join("garbled.json");
    std::fs::write(&garbled, b"{\"elm-MDT0000|1|7\": {\"truncated") //
        .expect("should write");
    assert!(load(&garbled).is_empty());

    // Well-formed JSON with an unparseable key is malformed too.
    let bad_key = dir.path().join("bad_key.json");
    std::fs::write(
        &bad_key,
        br#"{"not-a-key": {"fid": "0x1", "action": "ARCHIVE", "status": "STARTED",
             "raw": "idx=[1/1] fid=[0x1]", "hash": "00", "timestamp": 1}}"#,
    )
    .expect("should write");
    assert!(load(&bad_key).is_empty());
}

#[test]
fn cache_file_uses_the_pipe_key_format() {
    let dir = tempfile::tempdir().expect("should create temp dir");
    let path = dir.path().join("cache.json");
    commit(&path, &sample_cache()).expect("commit should succeed");

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).expect("should read")).expect("should parse");
    let keys: Vec<&String> = json.as_object().expect("top-level object").keys().collect();
    assert_eq!(keys, vec!["elm-MDT0000|1|7", "elm-MDT0003|2|9"]);
}
