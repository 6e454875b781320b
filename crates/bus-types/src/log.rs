use std::fmt;

/// Stable textual tag for a class of bus log event, mirroring
/// `bus_log_event_str` in the reference C source. Used as a `tracing` field
/// (`event = %kind`) rather than a bespoke formatted string table, so the
/// embedding process's subscriber still does the actual formatting/routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Initialization,
    NewClient,
    SocketRegistered,
    SendingRequest,
    Shutdown,
    Sender,
    Listener,
    Memory,
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogEvent::Initialization => "INITIALIZATION",
            LogEvent::NewClient => "NEW_CLIENT",
            LogEvent::SocketRegistered => "SOCKET_REGISTERED",
            LogEvent::SendingRequest => "SEND_REQUEST",
            LogEvent::Shutdown => "SHUTDOWN",
            LogEvent::Sender => "SENDER",
            LogEvent::Listener => "LISTENER",
            LogEvent::Memory => "MEMORY",
        };
        f.write_str(s)
    }
}
