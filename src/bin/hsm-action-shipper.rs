use clap::Parser;
use lustre_hsm_action_shipper::Config;
use lustre_hsm_action_shipper::Result;
use lustre_hsm_action_shipper::daemon;

#[derive(Debug, Parser)]
#[clap(
    name = "hsm-action-shipper",
    about = "ships Lustre HSM action-log events to per-MDT Redis streams"
)]
/// The shipper reads its configuration from a JSON string: either
/// the `--config` flag (inline JSON, or "@/path/to/file.json" to
/// read that file), or the `HSM_SHIPPER_CONFIG` environment
/// variable.  With neither set, built-in defaults apply.
struct Opt {
    /// The shipper JSON configuration.
    ///
    /// A value of the form "@/path/to/json.file" refers to the
    /// contents of that file; otherwise, the argument itself is the
    /// configuration string.
    ///
    /// This parameter is optional, and defaults to the value of the
    /// `HSM_SHIPPER_CONFIG` environment variable.
    #[clap(short, long)]
    config: Option<String>,

    /// Log level, in the same format as `RUST_LOG`.  Overrides the
    /// configuration's `log_level`; defaults to only logging errors
    /// to stderr.
    ///
    /// To fully disable logging, pass `--log=off`.
    #[clap(short, long)]
    log: Option<String>,

    /// Perform a single poll cycle (plus a maintenance pass when the
    /// reconcile interval is zero) and then exit.  Intended for
    /// testing and cron-style operation.
    #[clap(long)]
    run_once: bool,
}

pub fn main() -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let opts = Opt::parse();
    let config = Config::resolve(opts.config.as_deref())?;

    // Send tracing calls to stderr; the log stream is the shipper's
    // whole user-visible surface besides the exit code.
    let filter = if let Some(log_level) = opts.log.as_deref().or(config.log_level.as_deref()) {
        EnvFilter::try_new(log_level)
    } else {
        Ok(EnvFilter::from_default_env())
    }
    .expect("failed to parse --log level.");

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    tracing::info!(glob = %config.mdt_watch_glob, prefix = %config.redis_stream_prefix,
                   poll_interval = config.poll_interval,
                   reconcile_interval = config.reconcile_interval,
                   run_once = opts.run_once, "starting hsm-action-shipper");

    daemon::run(config, opts.run_once)
}
