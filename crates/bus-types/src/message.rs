use std::time::{Duration, Instant};

use crate::{callbacks::{MsgUdata, ResultCb}, status::Status};

/// A request submitted by the caller through `Bus::send_request`.
///
/// Mirrors `bus_user_msg` from the reference C source. `payload` is owned
/// here rather than a borrowed pointer+length pair: see the ownership Open
/// Question resolution in SPEC_FULL.md §9.
pub struct UserMessage<R> {
    pub fd: i32,
    pub seq_id: i64,
    pub payload: Vec<u8>,
    pub cb: ResultCb<R>,
    pub udata: Option<MsgUdata>,
    pub timeout: Duration,
}

/// Outcome of one request, delivered to the result callback on a threadpool
/// worker.
pub struct MsgResult<R> {
    pub status: Status,
    pub seq_id: i64,
    pub response: Option<R>,
}

impl<R> MsgResult<R> {
    pub const fn undefined(seq_id: i64) -> Self {
        Self { status: Status::Undefined, seq_id, response: None }
    }

    pub fn terminal(status: Status, seq_id: i64) -> Self {
        debug_assert!(status != Status::Undefined, "terminal result must not carry Undefined");
        Self { status, seq_id, response: None }
    }

    pub fn success(seq_id: i64, response: R) -> Self {
        Self { status: Status::Success, seq_id, response: Some(response) }
    }
}

/// The envelope carrying one request through sender → listener → threadpool.
///
/// Owned by exactly one subsystem at a time: the type moves (`Box<BoxedMessage<R>>`)
/// from the façade's submission queue into the sender's in-flight table, then
/// into the listener's `RxInfo` slot, then into a threadpool [`crate::ResultCb`]
/// invocation. No subsystem ever holds a reference to a box another
/// subsystem is concurrently mutating -- the move itself is the invariant,
/// rather than a documented convention as in the C original's `boxed_msg`.
pub struct BoxedMessage<R> {
    pub fd: i32,
    pub out_seq_id: i64,
    pub out_payload: Vec<u8>,
    pub cb: ResultCb<R>,
    pub udata: Option<MsgUdata>,
    pub deadline: Instant,
    pub result: MsgResult<R>,
}

impl<R> BoxedMessage<R> {
    pub fn new(msg: UserMessage<R>, now: Instant) -> Self {
        let seq_id = msg.seq_id;
        Self {
            fd: msg.fd,
            out_seq_id: msg.seq_id,
            out_payload: msg.payload,
            cb: msg.cb,
            udata: msg.udata,
            deadline: now + msg.timeout,
            result: MsgResult::undefined(seq_id),
        }
    }

    /// Overwrites `result` with a terminal status and no response, for the
    /// failure paths (`TxFailure`, `TimedOut`, `Shutdown`, `RxFailure`) that
    /// don't otherwise touch it.
    pub fn fail(&mut self, status: Status) {
        self.result = MsgResult::terminal(status, self.out_seq_id);
    }

    /// Dispatches `self.result` (already populated by whichever subsystem
    /// resolved this request) to the caller-supplied result callback.
    /// Consumes the box: this is the single place a `BoxedMessage` is
    /// destroyed in the happy path.
    pub fn finish(self) {
        debug_assert!(self.result.status != Status::Undefined, "finished a BoxedMessage with no result set");
        (self.cb)(&self.result, self.udata);
    }
}
