//! Cancellation with an optional deadline.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// A cancellation token paired with a deadline.
///
/// Long-running work (scan batches, compiler subprocesses, client
/// connections) polls [`CancelScope::is_cancelled`] at its queue boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scope driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Child scope: cancelled with the parent, or once `timeout` elapses.
    pub fn child_with_timeout(&self, timeout: Option<Duration>) -> Self {
        let own = timeout.map(|t| Instant::now() + t);
        let deadline = match (self.deadline, own) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// True once cancelled explicitly or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.is_expired()
    }

    /// True only when the deadline (not an explicit cancel) fired.
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent() {
        let parent = CancelScope::new();
        let child = parent.child_with_timeout(None);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(!child.is_expired());
    }

    #[test]
    fn test_deadline_expires() {
        let scope = CancelScope::new().child_with_timeout(Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(scope.is_cancelled());
        assert!(scope.is_expired());
    }

    #[test]
    fn test_child_keeps_earlier_deadline() {
        let outer = CancelScope::new().child_with_timeout(Some(Duration::from_millis(10)));
        let inner = outer.child_with_timeout(Some(Duration::from_secs(60)));
        assert_eq!(inner.deadline(), outer.deadline());
    }
}
