//! The per-submission completion pipe.
//!
//! `Bus::send_request` blocks the calling thread on this pipe (suspension
//! point 2 in SPEC_FULL.md §5); the owning sender writes a single
//! backpressure-ms payload to it once the request has been handed off.
//! Built on `mio::unix::pipe`, the same primitive `bus-listener`'s doorbell
//! uses, rather than a bespoke eventfd wrapper.

use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, unix::pipe};

/// Writable end, held by the sender until it reports a result.
pub struct CompletionWriter(pipe::Sender);

/// Readable end, held by the submitting thread.
pub struct CompletionReader(pipe::Receiver);

const COMPLETION_TOKEN: Token = Token(0);

/// Creates a completion pipe pair. Both ends are non-blocking, matching
/// every other fd this workspace touches via `mio`.
pub fn completion_pipe() -> io::Result<(CompletionWriter, CompletionReader)> {
    let (tx, rx) = pipe::new()?;
    Ok((CompletionWriter(tx), CompletionReader(rx)))
}

impl CompletionWriter {
    /// Writes the two-byte little-endian backpressure payload. Short writes
    /// retry immediately: two bytes always fit in the pipe's buffer in one
    /// syscall in practice, but we don't assume it.
    pub fn send_backpressure(&mut self, backpressure_ms: u16) -> io::Result<()> {
        let buf = backpressure_ms.to_le_bytes();
        let mut written = 0;
        while written < buf.len() {
            match self.0.write(&buf[written..]) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "completion pipe closed")),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl CompletionReader {
    /// Blocks in `poll` for the backpressure payload, in ten one-second
    /// ticks (per SPEC_FULL.md §5's "ten 1-second ticks" suspension point),
    /// absorbing `WouldBlock`/`Interrupted` and retrying within each tick.
    pub fn recv_backpressure(&mut self, overall_timeout: Duration) -> io::Result<u16> {
        let mut poll = Poll::new()?;
        poll.registry().register(&mut self.0, COMPLETION_TOKEN, Interest::READABLE)?;
        let mut events = Events::with_capacity(4);

        let deadline = Instant::now() + overall_timeout;
        let mut buf = [0u8; 2];
        let mut have = 0;

        while have < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "completion pipe timed out"));
            }
            let tick = remaining.min(Duration::from_secs(1));

            match poll.poll(&mut events, Some(tick)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            if events.is_empty() {
                continue; // tick elapsed with nothing readable yet
            }

            loop {
                match self.0.read(&mut buf[have..]) {
                    Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "completion pipe closed")),
                    Ok(n) => {
                        have += n;
                        if have == buf.len() {
                            return Ok(u16::from_le_bytes(buf));
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(u16::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trips_backpressure_value() {
        let (mut tx, mut rx) = completion_pipe().unwrap();
        tx.send_backpressure(257).unwrap();
        let got = rx.recv_backpressure(Duration::from_secs(1)).unwrap();
        assert_eq!(got, 257);
    }

    #[test]
    fn times_out_with_no_writer_activity() {
        let (_tx, mut rx) = completion_pipe().unwrap();
        let err = rx.recv_backpressure(Duration::from_millis(50)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
