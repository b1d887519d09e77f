//! Fallible operations in this crate return `Result`s with a small
//! error payload.  Context lives in the tracing events emitted when a
//! failure is first observed; the error value itself only carries a
//! static message and the id of that initial event, so it stays cheap
//! to propagate through the shipper and maintenance loops.
pub use tracing::Level;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

/// Capture a backtrace whenever we mint an error at least as severe
/// as BACKTRACE_SEVERITY.
const BACKTRACE_SEVERITY: Level = Level::ERROR;

/// A lightweight error value tied to the tracing event logged when
/// the root failure was captured.  Wrapping an `Error` in another
/// `Error` preserves the root id, so operators can grep the log
/// stream for the whole causal chain.
#[derive(Debug)]
pub struct Error {
    root_id: Uuid,
    pub message: &'static str,
}

impl Error {
    /// Creates a new `Error`; this constructor should only be called
    /// via the `fresh!`/`chain!` macros, which also log the event.
    #[inline(always)]
    pub fn new(root_id: Uuid, message: &'static str) -> Self {
        Error { root_id, message }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "{} (root_id={})", self.message, self.root_id)
    }
}

/// Only exported for macro use.
///
/// Computes a backtrace if `level` is severe enough.
#[inline(always)]
pub fn __maybe_compute_backtrace(level: Level) -> Option<backtrace::Backtrace> {
    if level > BACKTRACE_SEVERITY {
        return None;
    }

    Some(backtrace::Backtrace::new())
}

/// Only exported for macro use.
///
/// If `T == Error`, returns `x`'s `root_id` and `(None, None)`: the
/// cause was already logged when it was minted.  Otherwise, returns a
/// fresh uuid, `x` itself, and potentially a backtrace.
#[inline(always)]
pub fn __extract_cause_info<T: std::any::Any>(
    x: T,
    level: Level,
) -> (Uuid, Option<T>, Option<backtrace::Backtrace>) {
    use std::any::Any;

    match (&x as &dyn Any).downcast_ref::<Error>() {
        Some(as_error) => (as_error.root_id, None, None),
        None => (Uuid::new_v4(), Some(x), __maybe_compute_backtrace(level)),
    }
}

/// If `value` evaluates to `Err`, matches the error payload against
/// the patterns, evaluates the corresponding handling expression, and
/// drops the result.
#[macro_export]
macro_rules! drop_result {
    ($value:expr, $($($pattern:pat_param)|+ $(if $guard:expr)? => $handler:expr),+) => {
        if let Err(name) = $value {
            match name {
                $($($pattern)|+ $(if $guard)? => { let _ = $handler; }),+
            }
        }
    };
}

/// Returns a fresh `Error`, after tracing it at `level` with
/// `message` and any additional fields passed as a `tracing::event`.
#[macro_export]
macro_rules! fresh {
    ($level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message);

        tracing::event!(LEVEL, %root_id, ?bt, $message);
        ret
    }};
    ($level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let root_id = uuid::Uuid::new_v4();
        let bt = $crate::result::__maybe_compute_backtrace(LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! fresh_error {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_warn {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! fresh_info {
    ($($message_and_fields:tt)+) => { $crate::fresh!(tracing::Level::INFO, $($message_and_fields)+) };
}

/// Returns an `Error` derived from `initial`, after tracing it at
/// `level` with `message` and any additional fields passed as a
/// `tracing::event`.
#[macro_export]
macro_rules! chain {
    ($initial:expr, $level:expr, $message:expr $(,)?) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message);

        tracing::event!(LEVEL, %root_id, ?cause, ?bt, $message);
        ret
    }};
    ($initial:expr, $level:expr, $message:expr, $($fields:tt)+) => {{
        #[allow(unused)]
        const LEVEL: tracing::Level = $level;
        let (root_id, cause, bt) = $crate::result::__extract_cause_info($initial, LEVEL);
        let message = $message;
        let ret = $crate::result::Error::new(root_id, message);

        tracing::event!(LEVEL, $($fields)+, %root_id, ?cause, ?bt, $message);
        ret
    }};
}

#[macro_export]
macro_rules! chain_error {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::ERROR, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_warn {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::WARN, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_info {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::INFO, $($message_and_fields)+) };
}
#[macro_export]
macro_rules! chain_debug {
    ($initial:expr, $($message_and_fields:tt)+) => { $crate::chain!($initial, tracing::Level::DEBUG, $($message_and_fields)+) };
}

/// Creates an `Error` from the `std::io::Error` `error`, logged at a
/// dynamic level: if the error's kind matches the pattern, the level
/// is `benign_level`, otherwise it's `ERROR`.
#[macro_export]
macro_rules! filtered_io_error {
    ($error:expr, $($benign_kind:pat_param)|+ $(if $guard:expr)? => $benign_level:expr, $($message_and_fields:tt)+) => {{
        let err = $error;
        match err.kind() {
            $($benign_kind)|+ $(if $guard)? => $crate::chain!(err, $benign_level, $($message_and_fields)+),
            _ => $crate::chain!(err, tracing::Level::ERROR, $($message_and_fields)+),
        }
    }};
}
