use thiserror::Error;

/// Failure modes of `Bus::init`, mirroring `BUS_INIT_ERROR_*` in the
/// reference C source.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("sink callback is required")]
    MissingSinkCb,
    #[error("unpack callback is required")]
    MissingUnpackCb,
    #[error("unexpected-message callback is required")]
    MissingUnexpectedMsgCb,
    #[error("failed to spawn a sender thread")]
    SenderInitFail(#[source] std::io::Error),
    #[error("failed to spawn a listener thread")]
    ListenerInitFail(#[source] std::io::Error),
    #[error("failed to initialize the threadpool")]
    ThreadpoolInitFail(#[source] ThreadpoolError),
}

/// Failure modes of `Bus::register_socket` / `Bus::release_socket`.
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("failed to create the acknowledgement pipe")]
    PipeCreateFail(#[source] std::io::Error),
    #[error("listener did not acknowledge before the registration timeout elapsed")]
    AckTimeout,
    #[error("the listener rejected the socket (already registered or at capacity)")]
    Rejected,
    #[error("socket {0} is not registered with this bus")]
    UnknownSocket(i32),
}

/// Failure modes of `Bus::send_request` that are detected synchronously,
/// before the request is handed to the sender.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("file descriptor must be non-zero")]
    InvalidFd,
    #[error("the sender for this socket rejected the request (queue full)")]
    SenderQueueFull,
    #[error("completion pipe creation failed")]
    PipeCreateFail(#[source] std::io::Error),
    #[error("timed out waiting for the sender to acknowledge transmission")]
    CompletionTimeout,
}

/// Failure modes of `Threadpool::init`.
#[derive(Debug, Error)]
pub enum ThreadpoolError {
    #[error("failed to spawn a worker thread")]
    SpawnFail(#[source] std::io::Error),
    #[error("max_threads must be at least 1")]
    ZeroThreads,
}
