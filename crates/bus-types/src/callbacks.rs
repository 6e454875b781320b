use std::{any::Any, sync::Arc};

use crate::{log::LogEvent, message::MsgResult, unpack::UnpackOutcome};

/// Type-erased per-socket / per-bus user data, mirroring the `void *udata`
/// the reference C source threads through every callback.
pub type AnyUdata = Arc<dyn Any + Send + Sync>;

/// Per-request user data. Unlike socket/bus udata this travels with exactly
/// one [`crate::BoxedMessage`] and is consumed at most once, so it is boxed
/// rather than `Arc`'d.
pub type MsgUdata = Box<dyn Any + Send>;

pub type UnpackCb<R> = Arc<dyn Fn(&[u8], &AnyUdata) -> UnpackOutcome<R> + Send + Sync>;

/// Delivers raw bytes read off the wire into the listener's buffer. Used by
/// TLS wrappers to tunnel decrypted plaintext; the default (`Plain`) path
/// just copies.
pub type SinkCb = Arc<dyn Fn(&[u8], &AnyUdata) -> usize + Send + Sync>;

pub type UnexpectedMsgCb<R> = Arc<dyn Fn(R, i64, &AnyUdata) + Send + Sync>;

pub type ErrorCb = Arc<dyn Fn(crate::unpack::UnpackError, &AnyUdata) + Send + Sync>;

pub type LogCb = Arc<dyn Fn(LogEvent, tracing::Level, &str, &AnyUdata) + Send + Sync>;

pub type ResultCb<R> = Box<dyn FnOnce(&MsgResult<R>, Option<MsgUdata>) + Send>;

/// The capability set an embedder must provide at `init`. Mirrors
/// `bus_config`'s callback fields (`sink_cb`, `unpack_cb`, `unexpected_msg_cb`,
/// `error_cb`, `log_cb`) from the C source, grouped into one struct so a
/// `Bus<R>` can hold a single `Arc<BusCallbacks<R>>` instead of five loose
/// fields.
pub struct BusCallbacks<R> {
    pub sink: SinkCb,
    pub unpack: UnpackCb<R>,
    pub unexpected_msg: UnexpectedMsgCb<R>,
    pub error: ErrorCb,
    pub log: LogCb,
}

fn noop_log() -> LogCb {
    Arc::new(|_event, _level, _msg, _udata| {})
}

fn noop_error() -> ErrorCb {
    Arc::new(|_err, _udata| {})
}

impl<R> BusCallbacks<R> {
    /// Builds the callback set, substituting no-op defaults for the optional
    /// `error_cb`/`log_cb` the way `bus_init` does for `log_cb` (driving
    /// `log_level` to its minimum) and `error_cb`.
    pub fn new(
        sink: SinkCb,
        unpack: UnpackCb<R>,
        unexpected_msg: UnexpectedMsgCb<R>,
        error: Option<ErrorCb>,
        log: Option<LogCb>,
    ) -> Self {
        Self { sink, unpack, unexpected_msg, error: error.unwrap_or_else(noop_error), log: log.unwrap_or_else(noop_log) }
    }
}
