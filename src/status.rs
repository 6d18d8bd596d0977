//! Point-to-point receive status.

/// Information about a received message.
///
/// Returned by [`Communicator::recv`](crate::Communicator::recv); useful when
/// the receive used a wildcard or the message was shorter than the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Source rank of the message.
    pub source: i32,
    /// Tag of the message.
    pub tag: i32,
    /// Number of elements in the message.
    pub count: i64,
}
