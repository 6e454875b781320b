/// Result of invoking the user-supplied `unpack` callback against the bytes
/// currently buffered for a socket.
///
/// `unpack` is pure with respect to the buffer it is given: it must not
/// retain borrows past the call, since the listener may resize or reuse the
/// backing buffer on the next read.
#[derive(Debug)]
pub enum UnpackOutcome<R> {
    /// A complete frame was carved out of the buffer.
    Success {
        seq_id: i64,
        response: R,
        /// Bytes of the buffer consumed by this frame.
        consumed: usize,
    },
    /// Not enough bytes buffered yet; `expected_total` is the total byte
    /// count (header + payload) the listener should wait for before calling
    /// `unpack` again.
    NeedMore { expected_total: usize },
    /// The buffered bytes do not form a valid frame.
    Error(UnpackError),
}

/// Framing error surfaced to the user's `error_cb`. Never reaches the result
/// callback: parse errors are a distinct channel from request outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnpackError {
    #[error("frame header malformed")]
    BadHeader,
    #[error("frame length exceeds configured maximum")]
    FrameTooLarge,
    #[error("unexpected end of stream while framing")]
    Truncated,
    #[error("application-level unpack callback rejected the frame")]
    Rejected,
}
