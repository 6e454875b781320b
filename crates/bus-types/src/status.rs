/// Terminal status of a submitted request, delivered through the result
/// callback.
///
/// `Undefined` is a programming-error sentinel: a [`BoxedMessage`](crate::BoxedMessage)
/// must never reach a user callback while still carrying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Success,
    TxFailure,
    TimedOut,
    Shutdown,
    RxFailure,
    Undefined,
}

impl Status {
    #[must_use]
    pub const fn is_terminal_failure(self) -> bool {
        !matches!(self, Status::Success | Status::Undefined)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Undefined
    }
}
