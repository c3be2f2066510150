/// Errors surfaced synchronously by the connection API.
///
/// Protocol violations on the wire are never errors in this sense; malformed
/// or unexpected traffic is dropped (and logged) without affecting the
/// connection. Timeout-driven failures are reported through the disconnect
/// and open callbacks instead.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RudpError {
    #[error("connection is closed or closing")]
    Closed,

    #[error("cannot send an empty message")]
    EmptyMessage,

    #[error("sender buffer has no space left")]
    SenderBufferFull,

    /// Message splitting is not implemented, so a message must fit into a
    /// single MTU-sized packet together with its header.
    #[error("message of {size} bytes does not fit into a single packet (max {max})")]
    MessageTooBig { size: usize, max: usize },
}
