//! A single reconnecting Redis client shared by the shipper and
//! maintenance threads.
//!
//! The connection lives behind a mutex; pipelines are built and
//! flushed while it is held.  Transport-level failures poison the
//! connection and arm an exponential backoff gate (1 s doubling to a
//! 60 s ceiling, reset on success).  The publisher calls straight
//! through and propagates the typed failure — the next poll cycle
//! re-derives its batch anyway — while the maintenance worker blocks
//! in `wait_until_available` until the gate reopens or shutdown is
//! requested.  Nothing is ever silently dropped.
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::chain_error;
use crate::chain_warn;
use crate::config::Config;
use crate::daemon::StopFlag;
use crate::fresh_info;
use crate::fresh_warn;
use crate::result::Result;

/// Socket-level guard rails; the reconnect loop handles anything
/// slower.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

/// Reconnect backoff envelope: start at 1 s, double to a 60 s
/// ceiling, reset on success.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(60);

/// Add up to this fraction of the base delay to each backoff sleep,
/// so a fleet of shippers does not hammer a recovering Redis in
/// lockstep.
const BACKOFF_JITTER_FRAC: f64 = 0.25;

/// `SCAN ... COUNT` page size for stream key discovery.
const SCAN_PAGE: usize = 512;

/// A server-assigned stream entry ID: milliseconds plus a sequence
/// number, ordered the way Redis orders them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub fn new(ms: u64, seq: u64) -> StreamId {
        StreamId { ms, seq }
    }

    /// Parses the wire form `ms-seq`.
    pub fn parse(id: &str) -> Result<StreamId> {
        let (ms, seq) = id
            .split_once('-')
            .ok_or_else(|| fresh_warn!("malformed stream id", id))?;
        let ms = ms
            .parse::<u64>()
            .map_err(|e| chain_warn!(e, "malformed stream id ms part", id))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|e| chain_warn!(e, "malformed stream id seq part", id))?;
        Ok(StreamId { ms, seq })
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{}-{}", self.ms, self.seq)
    }
}

/// The broker operations the shipper core needs.  `RedisConnector`
/// is the production implementation; tests drive the publisher and
/// maintenance worker against an in-memory stream instead.
pub trait StreamOps {
    /// Returns the keys matching `pattern` (`SCAN MATCH`).
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Appends `payloads` to `stream_key` in order, in one pipeline
    /// (`XADD key * data <payload>` each).  Returns the
    /// server-assigned IDs; on `Err`, none, some, or all of the
    /// entries may have landed and the caller must retry the whole
    /// batch.
    fn pipeline_append(&self, stream_key: &str, payloads: &[String]) -> Result<Vec<StreamId>>;

    /// Reads one page of up to `count` entries with IDs strictly
    /// greater than `after` (from the beginning when `None`),
    /// returning each entry's ID and `data` field.
    fn range_read(
        &self,
        stream_key: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<(StreamId, String)>>;

    /// Approximate chunked trim: `XTRIM key MINID ~ min_id LIMIT
    /// chunk`.  Returns the number of entries removed.
    fn trim_minid(&self, stream_key: &str, min_id: StreamId, chunk: usize) -> Result<u64>;

    /// Discards every entry (`XTRIM key MAXLEN 0`).  Returns the
    /// number of entries removed.
    fn trim_all(&self, stream_key: &str) -> Result<u64>;

    /// Deletes the stream key outright.
    fn delete_key(&self, stream_key: &str) -> Result<()>;
}

#[derive(Debug)]
struct Backoff {
    next_delay: Duration,
}

impl Backoff {
    fn new() -> Backoff {
        Backoff {
            next_delay: BACKOFF_BASE,
        }
    }

    fn reset(&mut self) {
        self.next_delay = BACKOFF_BASE;
    }

    /// Returns the jittered delay to sleep before the next attempt,
    /// and doubles the base for the one after that.
    fn advance(&mut self) -> Duration {
        use rand::Rng;

        let jitter = rand::thread_rng().gen_range(1.0..1.0 + BACKOFF_JITTER_FRAC);
        let delay = self.next_delay.mul_f64(jitter);

        self.next_delay = (self.next_delay * 2).min(BACKOFF_CEILING);
        delay
    }
}

struct ConnState {
    conn: Option<redis::Connection>,
    backoff: Backoff,
    /// When set, no reconnect is attempted before this instant;
    /// callers fail fast instead.
    retry_at: Option<Instant>,
}

/// The process-wide Redis client.
pub struct RedisConnector {
    host: String,
    port: u16,
    db: i64,
    password: Option<String>,
    state: Mutex<ConnState>,
}

impl RedisConnector {
    pub fn new(config: &Config) -> RedisConnector {
        RedisConnector {
            host: config.redis_host.clone(),
            port: config.redis_port,
            db: config.redis_db,
            password: config.redis_password.clone(),
            state: Mutex::new(ConnState {
                conn: None,
                backoff: Backoff::new(),
                retry_at: None,
            }),
        }
    }

    fn establish(&self) -> redis::RedisResult<redis::Connection> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: redis::RedisConnectionInfo {
                db: self.db,
                username: None,
                password: self.password.clone(),
                ..Default::default()
            },
        };

        let client = redis::Client::open(info)?;
        let mut conn = client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
        conn.set_read_timeout(Some(SOCKET_TIMEOUT))?;
        conn.set_write_timeout(Some(SOCKET_TIMEOUT))?;

        // Validate before handing the connection out, like the ping
        // the original pooled clients performed on checkout.
        redis::cmd("PING").query::<String>(&mut conn)?;
        Ok(conn)
    }

    /// Runs `op` against the shared connection, connecting first if
    /// needed.  A transport-level failure poisons the connection and
    /// arms the backoff gate; the error propagates to the caller
    /// either way.
    fn run<T>(&self, op: impl Fn(&mut redis::Connection) -> redis::RedisResult<T>) -> Result<T> {
        let mut state = self.state.lock().expect("connector mutex should be valid");

        if state.conn.is_none() {
            if let Some(retry_at) = state.retry_at {
                if Instant::now() < retry_at {
                    return Err(fresh_info!(
                        "redis reconnect backoff in effect",
                        host = %self.host,
                        port = self.port
                    ));
                }
            }

            match self.establish() {
                Ok(conn) => {
                    tracing::info!(host = %self.host, port = self.port, db = self.db,
                                   "connected to redis");
                    state.conn = Some(conn);
                    state.backoff.reset();
                    state.retry_at = None;
                }
                Err(error) => {
                    let delay = state.backoff.advance();
                    state.retry_at = Some(Instant::now() + delay);
                    return Err(chain_warn!(error, "failed to connect to redis",
                                           host = %self.host, port = self.port, ?delay));
                }
            }
        }

        let conn = state.conn.as_mut().expect("connection was just ensured");
        match op(conn) {
            Ok(value) => Ok(value),
            Err(error) => {
                if error.is_io_error() || error.is_timeout() || error.is_connection_dropped() {
                    // The socket is suspect; reconnect after backoff.
                    let delay = state.backoff.advance();
                    state.conn = None;
                    state.retry_at = Some(Instant::now() + delay);
                    Err(chain_warn!(error, "redis connection failed", ?delay))
                } else {
                    Err(chain_error!(error, "redis command failed"))
                }
            }
        }
    }

    /// Blocks until the server answers a `PING`, sleeping through the
    /// backoff gate in between attempts.  Returns `Err` only when
    /// shutdown is requested first.
    pub fn wait_until_available(&self, stop: &StopFlag) -> Result<()> {
        self.wait_for_server(stop, None)
    }

    /// Bounded variant of [`RedisConnector::wait_until_available`]:
    /// gives up once `limit` has elapsed, for callers with no later
    /// cycle to fall back on.
    pub fn wait_until_available_for(&self, stop: &StopFlag, limit: Duration) -> Result<()> {
        self.wait_for_server(stop, Some(Instant::now() + limit))
    }

    fn wait_for_server(&self, stop: &StopFlag, deadline: Option<Instant>) -> Result<()> {
        loop {
            if stop.is_stopped() {
                return Err(fresh_info!("shutdown requested while waiting for redis"));
            }

            if self
                .run(|conn| redis::cmd("PING").query::<String>(conn))
                .is_ok()
            {
                return Ok(());
            }

            let mut delay = {
                let state = self.state.lock().expect("connector mutex should be valid");
                state
                    .retry_at
                    .map(|at| at.saturating_duration_since(Instant::now()))
                    .unwrap_or(BACKOFF_BASE)
            };
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(fresh_warn!(
                        "redis still unreachable at the retry deadline",
                        host = %self.host,
                        port = self.port
                    ));
                }
                delay = delay.min(remaining);
            }
            if stop.wait_timeout(delay) {
                return Err(fresh_info!("shutdown requested while waiting for redis"));
            }
        }
    }
}

impl StreamOps for RedisConnector {
    fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = self.run(|conn| {
            let mut cursor = 0u64;
            let mut keys: Vec<String> = Vec::new();

            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(SCAN_PAGE)
                    .query(conn)?;

                keys.extend(batch);
                cursor = next;
                if cursor == 0 {
                    return Ok(keys);
                }
            }
        })?;

        // SCAN may return duplicates across pages.
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn pipeline_append(&self, stream_key: &str, payloads: &[String]) -> Result<Vec<StreamId>> {
        let ids: Vec<String> = self.run(|conn| {
            let mut pipe = redis::pipe();
            for payload in payloads {
                pipe.cmd("XADD")
                    .arg(stream_key)
                    .arg("*")
                    .arg("data")
                    .arg(payload);
            }
            pipe.query(conn)
        })?;

        ids.iter().map(|id| StreamId::parse(id)).collect()
    }

    fn range_read(
        &self,
        stream_key: &str,
        after: Option<StreamId>,
        count: usize,
    ) -> Result<Vec<(StreamId, String)>> {
        // `(id` is the exclusive range form, so pagination resumes
        // after the last entry of the previous page.
        let start = match after {
            Some(id) => format!("({}", id),
            None => "-".to_owned(),
        };

        let entries: Vec<(String, Vec<(String, String)>)> = self.run(|conn| {
            redis::cmd("XRANGE")
                .arg(stream_key)
                .arg(&start)
                .arg("+")
                .arg("COUNT")
                .arg(count)
                .query(conn)
        })?;

        let mut page = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let id = StreamId::parse(&id)?;
            match fields.into_iter().find(|(name, _)| name == "data") {
                Some((_, data)) => page.push((id, data)),
                None => {
                    tracing::warn!(stream_key, %id, "stream entry without a data field; skipping")
                }
            }
        }
        Ok(page)
    }

    fn trim_minid(&self, stream_key: &str, min_id: StreamId, chunk: usize) -> Result<u64> {
        self.run(|conn| {
            redis::cmd("XTRIM")
                .arg(stream_key)
                .arg("MINID")
                .arg("~")
                .arg(min_id.to_string())
                .arg("LIMIT")
                .arg(chunk)
                .query(conn)
        })
    }

    fn trim_all(&self, stream_key: &str) -> Result<u64> {
        self.run(|conn| {
            redis::cmd("XTRIM")
                .arg(stream_key)
                .arg("MAXLEN")
                .arg(0)
                .query(conn)
        })
    }

    fn delete_key(&self, stream_key: &str) -> Result<()> {
        let _removed: u64 = self.run(|conn| redis::cmd("DEL").arg(stream_key).query(conn))?;
        Ok(())
    }
}

/// An in-memory `StreamOps` with server-assigned IDs, for tests.
#[cfg(test)]
pub(crate) mod memory {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::event_schema::StreamEvent;
    use crate::fresh_warn;

    #[derive(Debug, Default)]
    struct MemoryInner {
        streams: BTreeMap<String, Vec<(StreamId, String)>>,
        clock_ms: u64,
    }

    #[derive(Debug, Default)]
    pub(crate) struct MemoryStream {
        inner: Mutex<MemoryInner>,
        fail_appends: AtomicBool,
    }

    impl MemoryStream {
        pub fn new() -> MemoryStream {
            Default::default()
        }

        /// Makes every subsequent append fail, like a refused XADD.
        pub fn set_fail_appends(&self, fail: bool) {
            self.fail_appends.store(fail, Ordering::Relaxed);
        }

        /// Appends an event directly, bypassing the failure knob:
        /// test setup for pre-existing stream contents.
        pub fn seed(&self, stream_key: &str, event: &StreamEvent) -> StreamId {
            let payload = serde_json::to_string(event).expect("event should serialize");
            let mut inner = self.inner.lock().expect("mutex should be valid");
            append_one(&mut inner, stream_key, payload)
        }

        /// Returns the parsed events currently in the stream, oldest
        /// first.
        pub fn events(&self, stream_key: &str) -> Vec<(StreamId, StreamEvent)> {
            let inner = self.inner.lock().expect("mutex should be valid");
            inner
                .streams
                .get(stream_key)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|(id, payload)| {
                            (
                                *id,
                                serde_json::from_str(payload).expect("payload should parse"),
                            )
                        })
                        .collect()
                })
                .unwrap_or_default()
        }

        pub fn key_exists(&self, stream_key: &str) -> bool {
            let inner = self.inner.lock().expect("mutex should be valid");
            inner.streams.contains_key(stream_key)
        }
    }

    fn append_one(inner: &mut MemoryInner, stream_key: &str, payload: String) -> StreamId {
        inner.clock_ms += 1;
        let id = StreamId::new(inner.clock_ms, 0);
        inner
            .streams
            .entry(stream_key.to_owned())
            .or_default()
            .push((id, payload));
        id
    }

    impl StreamOps for MemoryStream {
        fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
            let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
            let inner = self.inner.lock().expect("mutex should be valid");
            Ok(inner
                .streams
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect())
        }

        fn pipeline_append(&self, stream_key: &str, payloads: &[String]) -> Result<Vec<StreamId>> {
            if self.fail_appends.load(Ordering::Relaxed) {
                return Err(fresh_warn!("append refused by test double"));
            }

            let mut inner = self.inner.lock().expect("mutex should be valid");
            Ok(payloads
                .iter()
                .map(|payload| append_one(&mut inner, stream_key, payload.clone()))
                .collect())
        }

        fn range_read(
            &self,
            stream_key: &str,
            after: Option<StreamId>,
            count: usize,
        ) -> Result<Vec<(StreamId, String)>> {
            let inner = self.inner.lock().expect("mutex should be valid");
            Ok(inner
                .streams
                .get(stream_key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(id, _)| after.map_or(true, |a| *id > a))
                        .take(count)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        fn trim_minid(&self, stream_key: &str, min_id: StreamId, chunk: usize) -> Result<u64> {
            let mut inner = self.inner.lock().expect("mutex should be valid");
            let entries = match inner.streams.get_mut(stream_key) {
                Some(entries) => entries,
                None => return Ok(0),
            };

            // Remove up to `chunk` leading entries below `min_id`,
            // like a LIMIT-capped approximate trim.
            let below = entries.iter().take_while(|(id, _)| *id < min_id).count();
            let removed = below.min(chunk);
            entries.drain(..removed);
            Ok(removed as u64)
        }

        fn trim_all(&self, stream_key: &str) -> Result<u64> {
            let mut inner = self.inner.lock().expect("mutex should be valid");
            match inner.streams.get_mut(stream_key) {
                Some(entries) => {
                    let removed = entries.len() as u64;
                    entries.clear();
                    Ok(removed)
                }
                None => Ok(0),
            }
        }

        fn delete_key(&self, stream_key: &str) -> Result<()> {
            let mut inner = self.inner.lock().expect("mutex should be valid");
            inner.streams.remove(stream_key);
            Ok(())
        }
    }
}

#[test]
fn stream_ids_parse_format_and_order() {
    let id = StreamId::parse("1712345678901-7").expect("should parse");
    assert_eq!(id, StreamId::new(1_712_345_678_901, 7));
    assert_eq!(id.to_string(), "1712345678901-7");

    assert!(StreamId::new(5, 9) < StreamId::new(6, 0));
    assert!(StreamId::new(5, 1) < StreamId::new(5, 2));

    assert!(StreamId::parse("17-").is_err());
    assert!(StreamId::parse("17").is_err());
    assert!(StreamId::parse("a-1").is_err());
}

#[test]
fn backoff_doubles_to_the_ceiling_and_resets() {
    let mut backoff = Backoff::new();

    let first = backoff.advance();
    assert!(first >= BACKOFF_BASE);
    assert!(first <= BACKOFF_BASE.mul_f64(1.0 + BACKOFF_JITTER_FRAC));

    // Drain the doubling; the base delay must cap at the ceiling.
    for _ in 0..10 {
        backoff.advance();
    }
    assert_eq!(backoff.next_delay, BACKOFF_CEILING);

    backoff.reset();
    assert_eq!(backoff.next_delay, BACKOFF_BASE);
}

#[test]
fn memory_stream_behaves_like_a_stream() {
    let stream = memory::MemoryStream::new();

    let ids = stream
        .pipeline_append(
            "hsm:actions:m-MDT0000",
            &["a".to_owned(), "b".to_owned(), "c".to_owned()],
        )
        .expect("append should succeed");
    assert_eq!(ids.len(), 3);
    assert!(ids[0] < ids[1] && ids[1] < ids[2]);

    // Paged reads resume after the last seen ID.
    let first_page = stream
        .range_read("hsm:actions:m-MDT0000", None, 2)
        .expect("read should succeed");
    assert_eq!(first_page.len(), 2);
    let rest = stream
        .range_read("hsm:actions:m-MDT0000", Some(first_page[1].0), 2)
        .expect("read should succeed");
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].1, "c");

    // A chunked trim respects its LIMIT.
    let removed = stream
        .trim_minid("hsm:actions:m-MDT0000", ids[2], 1)
        .expect("trim should succeed");
    assert_eq!(removed, 1);
    let removed = stream
        .trim_minid("hsm:actions:m-MDT0000", ids[2], 10)
        .expect("trim should succeed");
    assert_eq!(removed, 1);

    assert_eq!(
        stream.scan_keys("hsm:actions:*").expect("scan should succeed"),
        vec!["hsm:actions:m-MDT0000".to_owned()]
    );

    assert_eq!(stream.trim_all("hsm:actions:m-MDT0000").unwrap(), 1);
    assert!(stream.key_exists("hsm:actions:m-MDT0000"));
    stream.delete_key("hsm:actions:m-MDT0000").unwrap();
    assert!(!stream.key_exists("hsm:actions:m-MDT0000"));
}

#[test]
fn memory_stream_append_failures_are_typed() {
    let stream = memory::MemoryStream::new();
    stream.set_fail_appends(true);

    assert!(stream
        .pipeline_append("hsm:actions:m-MDT0000", &["a".to_owned()])
        .is_err());
    assert!(stream.events("hsm:actions:m-MDT0000").is_empty());

    stream.set_fail_appends(false);
    assert!(stream
        .pipeline_append("hsm:actions:m-MDT0000", &["a".to_owned()])
        .is_ok());
}
