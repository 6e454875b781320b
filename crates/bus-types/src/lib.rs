//! Shared data types threaded through the message bus pipeline.
//!
//! Every other crate in the workspace (`bus-threadpool`, `bus-listener`,
//! `bus-sender`, `bus`) depends on this one and none of its types depend
//! back, per the leaves-first dependency order of the bus core.

pub mod assert;
mod callbacks;
mod completion;
mod connection;
mod error;
mod log;
mod message;
mod status;
mod unpack;

pub use callbacks::{AnyUdata, BusCallbacks, ErrorCb, LogCb, MsgUdata, ResultCb, SinkCb, UnexpectedMsgCb, UnpackCb};
pub use completion::{CompletionReader, CompletionWriter, completion_pipe};
pub use connection::SocketType;
pub use error::{InitError, RegisterError, SendError, ThreadpoolError};
pub use log::LogEvent;
pub use message::{BoxedMessage, MsgResult, UserMessage};
pub use status::Status;
pub use unpack::{UnpackError, UnpackOutcome};
