//! Ships Lustre HSM events from the kernel-exposed per-MDT `actions`
//! logs to durable per-MDT Redis streams.
//!
//! The action logs are volatile text files with no change
//! notification, so the shipper polls: each cycle reads every log
//! whole, diffs the parsed snapshot against the cache committed
//! after the last successful publish, and appends the resulting
//! `NEW`/`UPDATE`/`PURGED` events to one stream per MDT.  The cache
//! only advances after the broker acknowledged the whole batch,
//! which makes delivery at-least-once across crashes, Redis outages
//! and MDT failover.  A low-frequency maintenance worker replays
//! each owned stream against a cache snapshot to heal purges the
//! shipper missed, then trims everything older than the oldest
//! still-live action.
pub mod cache_store;
pub mod config;
pub mod connector;
pub mod daemon;
pub mod differ;
pub mod event_schema;
pub mod maintenance;
pub mod publisher;
pub mod result;
pub mod scanner;

pub use config::Config;
pub use result::Error;
pub use result::Result;
