//! Per-registered-socket state owned by a listener thread.

use bus_types::AnyUdata;

/// Parser state plus the read buffer for one socket, mirroring
/// `connection_info` in the reference source. `to_read_size` tracks how many
/// more bytes `unpack` told us to wait for before calling it again; zero
/// means "read whatever's available and try a fresh parse."
pub struct ConnectionInfo {
    pub fd: i32,
    pub udata: AnyUdata,
    buf: Vec<u8>,
    to_read_size: usize,
}

/// Read a peek amount sufficient to let most framing schemes see a header
/// on the first call; grows from there as `unpack` asks for more.
const INITIAL_READ_HINT: usize = 4096;

impl ConnectionInfo {
    pub fn new(fd: i32, udata: AnyUdata) -> Self {
        Self { fd, udata, buf: Vec::with_capacity(INITIAL_READ_HINT), to_read_size: 0 }
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// How many more bytes to try to read before the next `unpack` call.
    pub fn read_hint(&self) -> usize {
        if self.to_read_size == 0 { INITIAL_READ_HINT } else { self.to_read_size.saturating_sub(self.buf.len()) }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn set_need_more(&mut self, expected_total: usize) {
        self.to_read_size = expected_total;
    }

    /// Drops `consumed` bytes off the front of the buffer after a
    /// successful parse, resetting the "need more" state.
    pub fn consume(&mut self, consumed: usize) {
        self.buf.drain(..consumed.min(self.buf.len()));
        self.to_read_size = 0;
    }
}
