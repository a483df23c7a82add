//! Priority levels for outbound messages.

/// Priority of a broadcast message.
///
/// Higher value = higher priority. Urgent messages are exempt from
/// per-client backpressure drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Best-effort update (build succeeded, component removed)
    Normal = 0,
    /// Must reach the client (build failure)
    Urgent = 1,
}
