//! Process lifecycle: the shipper loop, the maintenance worker
//! thread, and the signal plumbing that ties them together.
//!
//! Three threads cooperate.  The shipper loop scans, diffs,
//! publishes and commits on every poll interval; the maintenance
//! worker blocks on a bounded hand-off channel and runs a replay /
//! reconcile / trim cycle per job it receives; the main thread
//! waits on termination signals.  The hand-off always carries a deep
//! cache snapshot — the worker never sees the live cache, so the
//! shipper stays the cache's only writer.  Dropping the hand-off
//! sender doubles as the worker's shutdown notification.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::cache_store;
use crate::chain_error;
use crate::config::Config;
use crate::connector::RedisConnector;
use crate::connector::StreamId;
use crate::connector::StreamOps;
use crate::differ;
use crate::drop_result;
use crate::event_schema::Cache;
use crate::maintenance;
use crate::maintenance::MaintenanceJob;
use crate::maintenance::MaintenanceTuning;
use crate::publisher;
use crate::result::Result;
use crate::scanner;

/// How many times a `--run-once` invocation retries a failed cycle
/// before giving up with a non-zero exit.
const RUN_ONCE_RETRY_LIMIT: u32 = 5;

/// How long each run-once retry waits for redis to answer before the
/// invocation gives up.  Together with the attempt limit this bounds
/// the whole envelope; a cron-style caller must never hang on a dead
/// server.
const RUN_ONCE_RETRY_WAIT: Duration = Duration::from_secs(30);

/// Returns the current Unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

/// The process-wide stop flag: a bool under a mutex plus a condvar,
/// so sleeping threads wake immediately when shutdown is requested.
#[derive(Debug, Default)]
pub struct StopFlag {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopFlag {
    pub fn new() -> StopFlag {
        Default::default()
    }

    pub fn request_stop(&self) {
        let mut stopped = self.stopped.lock().expect("stop mutex should be valid");
        *stopped = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock().expect("stop mutex should be valid")
    }

    /// Sleeps for up to `timeout`, returning early when stop is
    /// requested.  Returns whether the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut stopped = self.stopped.lock().expect("stop mutex should be valid");

        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let (guard, _) = self
                .cond
                .wait_timeout(stopped, deadline - now)
                .expect("stop mutex should be valid");
            stopped = guard;
        }

        *stopped
    }
}

/// What one poll cycle did.
#[derive(Clone, Debug)]
pub struct CycleSummary {
    pub cycle: u64,
    pub shipped: usize,
    pub cache_size: usize,
    /// MDTs this host currently answers for: everything observed by
    /// the scan plus everything still in the cache.
    pub owned_mdts: BTreeSet<String>,
}

/// The shipper loop's state: the in-memory cache (single writer) and
/// the publish floors accumulated for the next maintenance hand-off.
pub struct Shipper {
    config: Config,
    cache: Cache,
    pending_floors: BTreeMap<String, StreamId>,
    cycle: u64,
}

impl Shipper {
    pub fn new(config: &Config) -> Shipper {
        let cache = cache_store::load(&config.cache_path);
        tracing::info!(entries = cache.len(), path = ?config.cache_path,
                       "loaded persistent action cache");

        Shipper {
            config: config.clone(),
            cache,
            pending_floors: BTreeMap::new(),
            cycle: 0,
        }
    }

    /// One poll cycle: scan, diff, publish, and only then commit.
    ///
    /// On publish failure the cache — in memory and on disk — is left
    /// exactly as it was, so the next cycle re-derives and re-sends
    /// the same events.  A commit failure is logged and tolerated:
    /// the in-memory cache still reflects what was published, and a
    /// restart from the stale file only causes re-delivery.
    pub fn run_cycle<S: StreamOps + ?Sized>(&mut self, ops: &S) -> Result<CycleSummary> {
        self.cycle += 1;
        let now = unix_now();

        let files = scanner::scan(&self.config.mdt_watch_glob)?;
        let owned_mdts: BTreeSet<String> = files
            .keys()
            .cloned()
            .chain(self.cache.keys().map(|id| id.mdt.clone()))
            .collect();

        let live = scanner::parse_snapshot(&files);
        let outcome = differ::diff(&live, &self.cache, now);
        let shipped = outcome.events.len();

        if !outcome.events.is_empty() {
            let report =
                publisher::publish(ops, &self.config.redis_stream_prefix, &outcome.events)?;

            // Keep the earliest first-NEW floor per MDT until the
            // next maintenance hand-off drains them.
            for (mdt, id) in report.first_new_ids {
                self.pending_floors
                    .entry(mdt)
                    .and_modify(|floor| *floor = (*floor).min(id))
                    .or_insert(id);
            }

            self.cache = outcome.next_cache;
            drop_result!(cache_store::commit(&self.config.cache_path, &self.cache),
                         e => chain_error!(e, "failed to commit cache; continuing with in-memory state"));
        }

        Ok(CycleSummary {
            cycle: self.cycle,
            shipped,
            cache_size: self.cache.len(),
            owned_mdts,
        })
    }

    /// Builds the maintenance hand-off: a deep snapshot of the
    /// freshly-committed cache, the owned MDT set, and the
    /// accumulated publish floors (drained here, restored if the
    /// hand-off does not go through).
    pub fn take_job(&mut self, owned_mdts: BTreeSet<String>) -> MaintenanceJob {
        MaintenanceJob {
            snapshot: self.cache.clone(),
            owned_mdts,
            first_new_ids: std::mem::take(&mut self.pending_floors),
        }
    }

    /// Puts a job's floors back after a refused hand-off.
    pub fn restore_floors(&mut self, floors: BTreeMap<String, StreamId>) {
        for (mdt, id) in floors {
            self.pending_floors
                .entry(mdt)
                .and_modify(|floor| *floor = (*floor).min(id))
                .or_insert(id);
        }
    }

    /// One final commit on the way out, so a shutdown immediately
    /// after a publish cannot lose the cache advance.
    pub fn final_flush(&self) {
        drop_result!(cache_store::commit(&self.config.cache_path, &self.cache),
                     e => chain_error!(e, "failed to write final cache state"));
    }

    /// Run-once cycles retry through a bounded envelope instead of
    /// deferring to the next poll: there is no next poll.
    fn run_cycle_with_retry(
        &mut self,
        connector: &RedisConnector,
        stop: &StopFlag,
    ) -> Result<CycleSummary> {
        let mut last_error = None;

        for attempt in 0..RUN_ONCE_RETRY_LIMIT {
            if attempt > 0 {
                connector
                    .wait_until_available_for(stop, RUN_ONCE_RETRY_WAIT)
                    .map_err(|e| {
                        chain_error!(e, "redis unreachable beyond the run-once retry envelope")
                    })?;
            }

            match self.run_cycle(connector) {
                Ok(summary) => return Ok(summary),
                Err(error) => {
                    tracing::warn!(attempt, "run-once cycle attempt failed");
                    last_error = Some(error);
                }
            }
        }

        let error = last_error.expect("retry loop records an error per attempt");
        Err(chain_error!(error, "redis unreachable beyond the run-once retry envelope"))
    }
}

fn log_cycle(summary: &CycleSummary, elapsed: Duration) {
    if summary.shipped == 0 {
        tracing::debug!(cycle = summary.cycle, cache_size = summary.cache_size,
                        elapsed_ms = elapsed.as_millis() as u64, "no changes detected");
    } else {
        tracing::info!(cycle = summary.cycle, shipped = summary.shipped,
                       cache_size = summary.cache_size,
                       elapsed_ms = elapsed.as_millis() as u64, "shipped event batch");
    }
}

fn run_shipper_loop(
    config: &Config,
    connector: &RedisConnector,
    stop: &StopFlag,
    job_sender: crossbeam_channel::Sender<MaintenanceJob>,
) -> Result<()> {
    let mut shipper = Shipper::new(config);
    let poll = Duration::from_secs(config.poll_interval);
    let reconcile = Duration::from_secs(config.reconcile_interval);
    let mut last_handoff = Instant::now();

    while !stop.is_stopped() {
        let started = Instant::now();

        match shipper.run_cycle(connector) {
            Ok(summary) => {
                log_cycle(&summary, started.elapsed());

                // Trigger maintenance once the reconcile interval has
                // elapsed.  A full channel means the worker is still
                // on the previous job; try again next cycle.
                if last_handoff.elapsed() >= reconcile {
                    let job = shipper.take_job(summary.owned_mdts);
                    match job_sender.try_send(job) {
                        Ok(()) => last_handoff = Instant::now(),
                        Err(crossbeam_channel::TrySendError::Full(job)) => {
                            shipper.restore_floors(job.first_new_ids);
                            tracing::debug!("maintenance worker busy; deferring hand-off");
                        }
                        Err(crossbeam_channel::TrySendError::Disconnected(_)) => break,
                    }
                }
            }
            Err(_) => {
                // Already traced at the failure site; the cache was
                // not advanced, so the next cycle retries the batch.
            }
        }

        let sleep = poll.saturating_sub(started.elapsed());
        if stop.wait_timeout(sleep) {
            break;
        }
    }

    tracing::info!("shipper loop stopping; writing final cache state");
    shipper.final_flush();
    drop(job_sender);
    Ok(())
}

/// One poll cycle (with a bounded retry envelope) plus one inline
/// maintenance cycle when the operator configured an immediate
/// reconcile interval.  Exit status is the returned `Result`.
fn run_single_cycle(config: &Config, connector: &RedisConnector, stop: &StopFlag) -> Result<()> {
    let mut shipper = Shipper::new(config);

    let started = Instant::now();
    let summary = shipper.run_cycle_with_retry(connector, stop)?;
    log_cycle(&summary, started.elapsed());

    if config.reconcile_interval == 0 {
        let job = shipper.take_job(summary.owned_mdts);
        let tuning = MaintenanceTuning::from_config(config);
        maintenance::run_cycle(
            connector,
            &config.redis_stream_prefix,
            &job,
            &tuning,
            unix_now(),
        );
    }

    shipper.final_flush();
    tracing::info!("run-once cycle complete");
    Ok(())
}

/// Runs the daemon (or a single cycle) to completion.
///
/// Installs the termination handlers, spawns the shipper and
/// maintenance threads, and joins everything before returning: no
/// background thread survives this function.
pub fn run(config: Config, run_once: bool) -> Result<()> {
    use signal_hook::consts::SIGINT;
    use signal_hook::consts::SIGTERM;

    config.validate()?;

    let stop = Arc::new(StopFlag::new());
    let connector = Arc::new(RedisConnector::new(&config));

    let mut signals = signal_hook::iterator::Signals::new([SIGTERM, SIGINT])
        .map_err(|e| chain_error!(e, "failed to install signal handlers"))?;
    let signals_handle = signals.handle();
    let signal_thread = {
        let stop = Arc::clone(&stop);
        std::thread::Builder::new()
            .name("signal-handler".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    if stop.is_stopped() {
                        tracing::warn!(signal, "second shutdown signal; exiting immediately");
                        std::process::exit(1);
                    }

                    tracing::info!(signal, "shutdown signal received; finishing current cycle");
                    stop.request_stop();
                }
            })
            .map_err(|e| chain_error!(e, "failed to spawn signal thread"))?
    };

    let result = if run_once {
        run_single_cycle(&config, &connector, &stop)
    } else {
        let (job_sender, job_receiver) = crossbeam_channel::bounded::<MaintenanceJob>(1);

        let maintenance_thread = {
            let connector = Arc::clone(&connector);
            let stop = Arc::clone(&stop);
            let prefix = config.redis_stream_prefix.clone();
            let tuning = MaintenanceTuning::from_config(&config);

            std::thread::Builder::new()
                .name("maintenance".to_owned())
                .spawn(move || {
                    // recv fails once the shipper drops its sender:
                    // that is the shutdown notification.
                    while let Ok(job) = job_receiver.recv() {
                        if stop.is_stopped() {
                            break;
                        }
                        if connector.wait_until_available(&stop).is_err() {
                            break;
                        }

                        maintenance::run_cycle(&*connector, &prefix, &job, &tuning, unix_now());
                    }
                })
                .map_err(|e| chain_error!(e, "failed to spawn maintenance thread"))?
        };

        let result = run_shipper_loop(&config, &connector, &stop, job_sender);
        drop_result!(maintenance_thread.join(),
                     e => log_thread_panic("maintenance thread panicked", e));
        result
    };

    // Tear the signal thread down so nothing outlives this call.
    stop.request_stop();
    signals_handle.close();
    drop_result!(signal_thread.join(),
                 e => log_thread_panic("signal thread panicked", e));

    result
}

fn log_thread_panic(message: &'static str, payload: Box<dyn std::any::Any + Send>) {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "opaque panic payload".to_owned());
    tracing::error!(%detail, "{}", message);
}

#[cfg(test)]
use crate::connector::memory::MemoryStream;
#[cfg(test)]
use crate::event_schema::EventType;

#[cfg(test)]
fn test_config(root: &std::path::Path) -> Config {
    Config {
        mdt_watch_glob: format!("{}/*-MDT????/hsm/actions", root.display()),
        cache_path: root.join("cache.json"),
        ..Config::default()
    }
}

#[cfg(test)]
fn write_actions(root: &std::path::Path, mdt: &str, lines: &[&str]) {
    let dir = root.join(mdt).join("hsm");
    std::fs::create_dir_all(&dir).expect("should create hsm dir");
    std::fs::write(dir.join("actions"), lines.join("\n")).expect("should write actions");
}

#[test]
fn cycle_ships_new_update_and_purged() {
    let root = tempfile::tempdir().expect("should create temp dir");
    let config = test_config(root.path());
    let stream = MemoryStream::new();
    let mut shipper = Shipper::new(&config);

    // NEW.
    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"]);
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    assert_eq!(summary.shipped, 1);
    assert_eq!(summary.cache_size, 1);
    assert_eq!(summary.owned_mdts, ["testfs-MDT0000".to_owned()].into());

    let events = stream.events("hsm:actions:testfs-MDT0000");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.event_type, EventType::New);
    assert_eq!(events[0].1.cat_idx, 1);
    assert_eq!(events[0].1.rec_idx, 1);
    assert_eq!(events[0].1.fid, "0x1");
    assert_eq!(events[0].1.status, "STARTED");

    // Unchanged file: nothing shipped.
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    assert_eq!(summary.shipped, 0);

    // UPDATE.
    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0x1] status=WAITING"]);
    shipper.run_cycle(&stream).expect("cycle should succeed");
    let events = stream.events("hsm:actions:testfs-MDT0000");
    assert_eq!(events.len(), 2);
    assert_eq!(events[1].1.event_type, EventType::Update);
    assert_eq!(events[1].1.status, "WAITING");

    // Truncate: PURGED carrying the last-known payload.
    write_actions(root.path(), "testfs-MDT0000", &[]);
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    assert_eq!(summary.shipped, 1);
    assert_eq!(summary.cache_size, 0);
    let events = stream.events("hsm:actions:testfs-MDT0000");
    assert_eq!(events.len(), 3);
    assert_eq!(events[2].1.event_type, EventType::Purged);
    assert_eq!(events[2].1.status, "PURGED");
    assert_eq!(events[2].1.action, "ARCHIVE");
    assert_eq!(events[2].1.fid, "0x1");

    // The committed cache file tracks the in-memory state.
    assert!(cache_store::load(&config.cache_path).is_empty());
}

#[test]
fn publish_failure_leaves_the_cache_for_a_replay() {
    let root = tempfile::tempdir().expect("should create temp dir");
    let config = test_config(root.path());
    let stream = MemoryStream::new();
    let mut shipper = Shipper::new(&config);

    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"]);

    // Redis refuses the append: the cycle fails and no cache exists,
    // in memory or on disk.
    stream.set_fail_appends(true);
    assert!(shipper.run_cycle(&stream).is_err());
    assert_eq!(shipper.cache.len(), 0);
    assert!(cache_store::load(&config.cache_path).is_empty());

    // Redis restored: the same NEW is emitted and the cache advances.
    stream.set_fail_appends(false);
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    assert_eq!(summary.shipped, 1);
    assert_eq!(summary.cache_size, 1);

    let events = stream.events("hsm:actions:testfs-MDT0000");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.event_type, EventType::New);
    assert_eq!(cache_store::load(&config.cache_path).len(), 1);
}

#[test]
fn vanished_mdt_purges_only_its_own_stream() {
    let root = tempfile::tempdir().expect("should create temp dir");
    let config = test_config(root.path());
    let stream = MemoryStream::new();
    let mut shipper = Shipper::new(&config);

    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0xa] status=STARTED"]);
    write_actions(root.path(), "testfs-MDT0001", //
                  &["idx=[1/1] action=RESTORE fid=[0xb] status=STARTED",
                    "idx=[1/2] action=RESTORE fid=[0xc] status=STARTED"]);
    shipper.run_cycle(&stream).expect("cycle should succeed");

    // MDT0001 disappears wholesale.
    std::fs::remove_dir_all(root.path().join("testfs-MDT0001")).expect("should remove");
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    assert_eq!(summary.shipped, 2);
    // The cycle that witnesses the disappearance still owns the MDT.
    assert!(summary.owned_mdts.contains("testfs-MDT0001"));

    let first = stream.events("hsm:actions:testfs-MDT0000");
    assert_eq!(first.len(), 1);
    let second = stream.events("hsm:actions:testfs-MDT0001");
    assert_eq!(second.len(), 4);
    assert!(second[2..]
        .iter()
        .all(|(_, event)| event.event_type == EventType::Purged
            && event.mdt == "testfs-MDT0001"));
}

#[test]
fn handoff_jobs_carry_snapshot_owned_set_and_floors() {
    let root = tempfile::tempdir().expect("should create temp dir");
    let config = test_config(root.path());
    let stream = MemoryStream::new();
    let mut shipper = Shipper::new(&config);

    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED"]);
    let summary = shipper.run_cycle(&stream).expect("cycle should succeed");
    let first_id = stream.events("hsm:actions:testfs-MDT0000")[0].0;

    // A later NEW does not move the recorded floor backwards.
    write_actions(root.path(), "testfs-MDT0000", //
                  &["idx=[1/1] action=ARCHIVE fid=[0x1] status=STARTED",
                    "idx=[1/2] action=ARCHIVE fid=[0x2] status=STARTED"]);
    let summary2 = shipper.run_cycle(&stream).expect("cycle should succeed");

    let job = shipper.take_job(summary2.owned_mdts.clone());
    assert_eq!(job.owned_mdts, summary.owned_mdts);
    assert_eq!(job.snapshot.len(), 2);
    assert_eq!(job.first_new_ids["testfs-MDT0000"], first_id);

    // Floors are drained by the hand-off, and a refused hand-off puts
    // them back.
    assert!(shipper.take_job(summary2.owned_mdts.clone()).first_new_ids.is_empty());
    shipper.restore_floors(job.first_new_ids.clone());
    assert_eq!(
        shipper.take_job(summary2.owned_mdts).first_new_ids,
        job.first_new_ids
    );
}

#[test]
fn stop_flag_wakes_sleepers_immediately() {
    let stop = Arc::new(StopFlag::new());
    assert!(!stop.is_stopped());

    // A long sleep cut short by a stop request from another thread.
    let sleeper = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let started = Instant::now();
            let stopped = stop.wait_timeout(Duration::from_secs(60));
            (stopped, started.elapsed())
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    stop.request_stop();

    let (stopped, elapsed) = sleeper.join().expect("sleeper should not panic");
    assert!(stopped);
    assert!(elapsed < Duration::from_secs(10));

    // Once stopped, waits return without sleeping.
    let started = Instant::now();
    assert!(stop.wait_timeout(Duration::from_secs(60)));
    assert!(started.elapsed() < Duration::from_secs(1));
}
