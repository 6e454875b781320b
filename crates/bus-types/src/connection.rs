/// How a registered socket's bytes should be interpreted at the transport
/// layer. TLS handshake and record I/O themselves are out of scope for the
/// core (see spec §1); the bus only needs to know whether to wait for a
/// handshake to complete before acknowledging `register_socket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Plain,
    Tls,
}
