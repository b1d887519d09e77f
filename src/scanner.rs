//! The source scanner discovers the per-MDT `hsm/actions` files
//! exposed by the kernel, reads each one whole, and parses the lines
//! into `ActionRecord`s.
//!
//! Reads are best-effort: action logs live in debugfs and can vanish
//! between the glob expansion and the read (MDT failover, unmount).
//! A file that cannot be read is simply omitted from the snapshot;
//! the differ then treats its actions as gone, which is exactly what
//! a failed-away MDT should look like.
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::Path;

use regex::Regex;
use tracing::Level;

use crate::chain_error;
use crate::event_schema::ActionId;
use crate::event_schema::ActionRecord;
use crate::event_schema::UNKNOWN_FIELD;
use crate::filtered_io_error;
use crate::result::Result;

lazy_static::lazy_static! {
    // The MDT name is the path component that looks like
    // `elm-MDT0003`: a filesystem name, a dash, and a 4-digit hex
    // target index.
    static ref MDT_COMPONENT_RE: Regex =
        Regex::new(r"^.+-MDT[0-9A-Fa-f]{4}$").expect("MDT component regex should compile");

    // A line looks like
    // `lrh=[type=10680000 len=192 idx=3/916] fid=[0x200000402:0x1:0x0] \
    //  dfid=[0x200000402:0x1:0x0] ... action=ARCHIVE ... status=STARTED ...`
    // The indices may appear bare (`idx=3/916`) or bracketed, and on
    // older servers they hide inside the `lrh=[...]` record header,
    // so each field is matched on its own anywhere in the line.
    static ref IDX_RE: Regex =
        Regex::new(r"\bidx=\[?(\d+)/(\d+)\]?").expect("idx regex should compile");
    static ref FID_RE: Regex =
        Regex::new(r"\bfid=(\[[^\]]*\]|\S+)").expect("fid regex should compile");
    static ref ACTION_RE: Regex =
        Regex::new(r"\baction=\[?([^\s\]]+)\]?").expect("action regex should compile");
    static ref STATUS_RE: Regex =
        Regex::new(r"\bstatus=\[?([^\s\]]+)\]?").expect("status regex should compile");
}

/// Extracts the MDT name from an action-log path: the deepest
/// component matching `*-MDT????`.
pub fn mdt_from_path(path: &Path) -> Option<String> {
    path.components()
        .rev()
        .filter_map(|component| component.as_os_str().to_str())
        .find(|component| MDT_COMPONENT_RE.is_match(component))
        .map(ToOwned::to_owned)
}

fn strip_brackets(token: &str) -> &str {
    token
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .unwrap_or(token)
}

/// Parses one action-log line into a record for `mdt`.
///
/// Lines lacking a parseable `idx=` or a `fid=` are dropped with a
/// warning; a missing `action=` or `status=` token degrades to
/// `UNKNOWN` (the kernel always emits both, but the shipper must not
/// lose an action over a truncated line).
pub fn parse_action_line(mdt: &str, line: &str) -> Option<ActionRecord> {
    let idx = match IDX_RE.captures(line) {
        Some(captures) => captures,
        None => {
            tracing::warn!(mdt, line, "dropping action line without idx= token");
            return None;
        }
    };

    let (cat_idx, rec_idx) = match (idx[1].parse::<u64>(), idx[2].parse::<u64>()) {
        (Ok(cat), Ok(rec)) => (cat, rec),
        _ => {
            tracing::warn!(mdt, line, "dropping action line with unparseable indices");
            return None;
        }
    };

    let fid = match FID_RE.captures(line) {
        Some(captures) => strip_brackets(&captures[1]).to_owned(),
        None => {
            tracing::warn!(mdt, line, "dropping action line without fid= token");
            return None;
        }
    };

    let capture_or_unknown = |re: &Regex| {
        re.captures(line)
            .map(|captures| captures[1].to_owned())
            .unwrap_or_else(|| UNKNOWN_FIELD.to_owned())
    };

    Some(ActionRecord {
        id: ActionId::new(mdt, cat_idx, rec_idx),
        fid,
        action: capture_or_unknown(&ACTION_RE),
        status: capture_or_unknown(&STATUS_RE),
        raw: line.to_owned(),
    })
}

/// Expands the watch glob and reads every matching action log whole.
///
/// Returns the raw non-empty lines per MDT.  An MDT whose file exists
/// but is empty still appears in the result, with no lines: the
/// differ must see it as "present, with zero live actions" rather
/// than failed away.
pub fn scan(pattern: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let paths =
        glob::glob(pattern).map_err(|e| chain_error!(e, "invalid mdt watch glob", pattern))?;

    let mut snapshot: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut matched = 0usize;

    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(%error, "skipping unreadable glob match");
                continue;
            }
        };

        matched += 1;
        let mdt = match mdt_from_path(&path) {
            Some(mdt) => mdt,
            None => {
                tracing::warn!(?path, "skipping action log with no MDT path component");
                continue;
            }
        };

        // Whole-file read: the kernel regenerates the log on every
        // open, so one read is the closest we get to an atomic
        // snapshot of the MDT's live actions.
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) => {
                let _ = filtered_io_error!(e, ErrorKind::NotFound => Level::DEBUG,
                                           "failed to read action log", ?path, %mdt);
                continue;
            }
        };

        let lines = snapshot.entry(mdt).or_default();
        lines.extend(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToOwned::to_owned),
        );
    }

    if matched == 0 {
        tracing::warn!(pattern, "no action log files matched the watch glob");
    }

    Ok(snapshot)
}

/// Parses a scan result into the live-record map keyed by primary
/// key.  Unparseable lines are dropped (with a warning from
/// `parse_action_line`); duplicate primary keys keep the last line,
/// like the kernel's own log compaction would.
pub fn parse_snapshot(files: &BTreeMap<String, Vec<String>>) -> BTreeMap<ActionId, ActionRecord> {
    let mut live = BTreeMap::new();

    for (mdt, lines) in files {
        for line in lines {
            if let Some(record) = parse_action_line(mdt, line) {
                if let Some(previous) = live.insert(record.id.clone(), record) {
                    tracing::warn!(%mdt, cat_idx = previous.id.cat_idx,
                                   rec_idx = previous.id.rec_idx,
                                   "duplicate primary key in action log; keeping the last line");
                }
            }
        }
    }

    live
}

#[test]
fn mdt_name_comes_from_the_right_component() {
    assert_eq!(
        mdt_from_path(Path::new(
            "/sys/kernel/debug/lustre/mdt/elm-MDT0003/hsm/actions"
        )),
        Some("elm-MDT0003".to_owned())
    );
    // Nothing MDT-shaped in the path.
    assert_eq!(
        mdt_from_path(Path::new("/sys/kernel/debug/lustre/mdt/elm/hsm/actions")),
        None
    );
    // Non-hex target index is not an MDT component.
    assert_eq!(
        mdt_from_path(Path::new("/tmp/elm-MDTzzzz/hsm/actions")),
        None
    );
}

#[test]
fn parses_the_documented_line_shape() {
    let record = parse_action_line(
        "testfs-MDT0000",
        "idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED",
    )
    .expect("should parse");

    assert_eq!(record.id, ActionId::new("testfs-MDT0000", 1, 1));
    assert_eq!(record.fid, "0x1");
    assert_eq!(record.action, "ARCHIVE");
    assert_eq!(record.status, "STARTED");
    assert_eq!(record.action_key(), "0x1:ARCHIVE");
}

#[test]
fn parses_a_real_kernel_line() {
    let line = "lrh=[type=10680000 len=192 idx=3/916] fid=[0x200000402:0x11d:0x0] \
                dfid=[0x200000402:0x11d:0x0] compound/cookie=0x0/0x63b2dbe8 \
                action=ARCHIVE archive#=1 flags=0x0 extent=0x0-0xffffffffffffffff \
                gid=0x0 datalen=0 status=SUCCEED data=[]";
    let record = parse_action_line("elm-MDT0001", line).expect("should parse");

    // `idx` hides inside the lrh record header, and `dfid=[...]` must
    // not shadow the real fid.
    assert_eq!(record.id, ActionId::new("elm-MDT0001", 3, 916));
    assert_eq!(record.fid, "0x200000402:0x11d:0x0");
    assert_eq!(record.action, "ARCHIVE");
    assert_eq!(record.status, "SUCCEED");
    assert_eq!(record.raw, line);
}

#[test]
fn lines_missing_key_tokens_are_dropped() {
    assert!(parse_action_line("m-MDT0000", "action=ARCHIVE fid=[0x1] status=STARTED").is_none());
    assert!(parse_action_line("m-MDT0000", "idx=[1/1] action=ARCHIVE status=STARTED").is_none());
    // Missing action/status degrade instead of dropping.
    let record = parse_action_line("m-MDT0000", "idx=[1/1] fid=[0x1]").expect("should parse");
    assert_eq!(record.action, UNKNOWN_FIELD);
    assert_eq!(record.status, UNKNOWN_FIELD);
}

#[test]
fn scan_reads_live_files_and_keeps_empty_mdts() {
    use std::io::Write;

    let root = tempfile::tempdir().expect("should create temp dir");
    for (mdt, contents) in [
        ("testfs-MDT0000", "idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED\n\n"),
        ("testfs-MDT0001", ""),
    ] {
        let dir = root.path().join(mdt).join("hsm");
        std::fs::create_dir_all(&dir).expect("should create hsm dir");
        let mut file = std::fs::File::create(dir.join("actions")).expect("should create log");
        file.write_all(contents.as_bytes()).expect("should write");
    }

    let pattern = format!("{}/*-MDT????/hsm/actions", root.path().display());
    let snapshot = scan(&pattern).expect("should scan");

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["testfs-MDT0000"].len(), 1);
    // The empty file still registers its MDT.
    assert!(snapshot["testfs-MDT0001"].is_empty());

    let live = parse_snapshot(&snapshot);
    assert_eq!(live.len(), 1);
    assert!(live.contains_key(&ActionId::new("testfs-MDT0000", 1, 1)));
}
