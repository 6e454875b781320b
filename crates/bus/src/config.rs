//! Typed, validated configuration surface for `Bus::init`.
//!
//! File-format parsing (TOML/env) stays out of scope, same as the core
//! protocol; what the ambient stack still owes is a typed struct with
//! sane defaults and the same structural validation `bus_init` does
//! synchronously in the reference source (see `validate`).

use std::time::Duration;

use bus_threadpool::ThreadpoolConfig;
use bus_types::{ErrorCb, LogCb, SinkCb, UnexpectedMsgCb, UnpackCb};
use tracing::Level;

/// Typed configuration for [`crate::Bus::init`].
///
/// Callback fields that are mandatory in the reference source
/// (`sink_cb`, `unpack_cb`, `unexpected_msg_cb`) are constructor arguments
/// here instead of optional struct fields, making "missing callback" a
/// type-level impossibility rather than a runtime `InitError` variant.
pub struct BusConfig<R> {
    pub sink: SinkCb,
    pub unpack: UnpackCb<R>,
    pub unexpected_msg: UnexpectedMsgCb<R>,
    pub error: Option<ErrorCb>,
    pub log: Option<LogCb>,

    pub sender_count: u32,
    pub listener_count: u32,
    pub threadpool: ThreadpoolConfig,
    /// Overall timeout `send_request` waits on a submission's completion
    /// pipe, expressed in the reference source as "ten 1-second ticks".
    pub request_timeout: Duration,
    /// Upper bound on a single sender/listener `poll` wait.
    pub tick_max: Duration,
    /// How long an early-arriving response is held awaiting its
    /// expectation before being silently dropped.
    pub hold_deadline: Duration,
    pub log_level: Level,
}

impl<R> BusConfig<R> {
    pub fn new(sink: SinkCb, unpack: UnpackCb<R>, unexpected_msg: UnexpectedMsgCb<R>) -> Self {
        Self {
            sink,
            unpack,
            unexpected_msg,
            error: None,
            log: None,
            sender_count: 1,
            listener_count: 1,
            threadpool: ThreadpoolConfig::default(),
            request_timeout: Duration::from_secs(10),
            tick_max: Duration::from_millis(100),
            hold_deadline: Duration::from_secs(1),
            log_level: Level::INFO,
        }
    }

    #[must_use]
    pub fn with_error_cb(mut self, error: ErrorCb) -> Self {
        self.error = Some(error);
        self
    }

    #[must_use]
    pub fn with_log_cb(mut self, log: LogCb) -> Self {
        self.log = Some(log);
        self
    }

    #[must_use]
    pub const fn with_sender_count(mut self, count: u32) -> Self {
        self.sender_count = count;
        self
    }

    #[must_use]
    pub const fn with_listener_count(mut self, count: u32) -> Self {
        self.listener_count = count;
        self
    }

    #[must_use]
    pub const fn with_threadpool(mut self, threadpool: ThreadpoolConfig) -> Self {
        self.threadpool = threadpool;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Clamps zero subsystem counts to 1, exactly as `bus_init` does in the
    /// reference source. There is nothing else left to validate once the
    /// callbacks are mandatory constructor arguments.
    pub fn validate(&mut self) {
        self.sender_count = self.sender_count.max(1);
        self.listener_count = self.listener_count.max(1);
        self.threadpool.max_threads = self.threadpool.max_threads.max(1);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use bus_types::UnpackOutcome;

    use super::*;

    fn noop_config() -> BusConfig<()> {
        BusConfig::new(
            Arc::new(|buf: &[u8], _udata: &bus_types::AnyUdata| buf.len()),
            Arc::new(|_buf: &[u8], _udata: &bus_types::AnyUdata| UnpackOutcome::NeedMore { expected_total: 0 }),
            Arc::new(|_response: (), _seq_id: i64, _udata: &bus_types::AnyUdata| {}),
        )
    }

    #[test]
    fn validate_clamps_zero_counts_to_one() {
        let mut cfg = noop_config().with_sender_count(0).with_listener_count(0);
        cfg.threadpool.max_threads = 0;
        cfg.validate();
        assert_eq!(cfg.sender_count, 1);
        assert_eq!(cfg.listener_count, 1);
        assert_eq!(cfg.threadpool.max_threads, 1);
    }

    #[test]
    fn builder_leaves_unspecified_fields_at_their_default() {
        let cfg = noop_config();
        assert_eq!(cfg.sender_count, 1);
        assert_eq!(cfg.request_timeout, Duration::from_secs(10));
        assert!(cfg.error.is_none());
    }
}
