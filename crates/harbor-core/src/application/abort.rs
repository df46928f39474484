//! Two-level cancellation
//!
//! A flow owns one main [`AbortSignal`]; every operation runs under a child of
//! it. Aborting the main signal aborts every child, aborting a child never
//! affects its siblings or its parent. A signal remembers the [`StopReason`]
//! it was aborted with, and a child aborted through its parent reports the
//! parent's reason.

use std::sync::{Arc, OnceLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::domain::flow::StopReason;

/// Cancellation handle carrying the reason it was aborted with
#[derive(Debug, Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    // Own reason first, then the reasons of every ancestor.
    reasons: Vec<Arc<OnceLock<StopReason>>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Create a root signal
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reasons: vec![Arc::new(OnceLock::new())],
        }
    }

    /// Derive a child signal
    ///
    /// A child derived from an already aborted signal starts aborted.
    pub fn child(&self) -> Self {
        let mut reasons = Vec::with_capacity(self.reasons.len() + 1);
        reasons.push(Arc::new(OnceLock::new()));
        reasons.extend(self.reasons.iter().cloned());

        Self {
            token: self.token.child_token(),
            reasons,
        }
    }

    /// Abort this signal and every signal derived from it
    ///
    /// The first reason wins; aborting twice keeps the original reason.
    pub fn abort(&self, reason: StopReason) {
        let _ = self.reasons[0].set(reason);
        self.token.cancel();
    }

    /// Whether the signal has been aborted, directly or through an ancestor
    #[inline]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reason the signal was aborted with, if it was
    pub fn reason(&self) -> Option<StopReason> {
        if !self.is_aborted() {
            return None;
        }
        let reason = self
            .reasons
            .iter()
            .find_map(|reason| reason.get().copied())
            .unwrap_or(StopReason::Unknown);
        Some(reason)
    }

    /// Completes once the signal is aborted
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Underlying cancellation token, handed to runtime calls
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_main_abort_reaches_every_child() {
        let main = AbortSignal::new();
        let a = main.child();
        let b = main.child();

        main.abort(StopReason::Stopped);

        assert_eq!(a.reason(), Some(StopReason::Stopped));
        assert_eq!(b.reason(), Some(StopReason::Stopped));
        assert_eq!(main.reason(), Some(StopReason::Stopped));
    }

    #[test]
    fn test_child_abort_is_isolated() {
        let main = AbortSignal::new();
        let a = main.child();
        let b = main.child();

        a.abort(StopReason::Unknown);

        assert!(a.is_aborted());
        assert!(!b.is_aborted());
        assert!(!main.is_aborted());
        assert_eq!(b.reason(), None);
    }

    #[test]
    fn test_child_of_aborted_signal_starts_aborted() {
        let main = AbortSignal::new();
        main.abort(StopReason::Expired);

        let late = main.child();

        assert!(late.is_aborted());
        assert_eq!(late.reason(), Some(StopReason::Expired));
    }

    #[test]
    fn test_own_reason_wins_over_parent() {
        let main = AbortSignal::new();
        let a = main.child();

        a.abort(StopReason::Unknown);
        main.abort(StopReason::Quit);
        a.abort(StopReason::Stopped);

        assert_eq!(a.reason(), Some(StopReason::Unknown));
        assert_eq!(main.reason(), Some(StopReason::Quit));
    }

    #[tokio::test]
    async fn test_aborted_future_completes() {
        let main = AbortSignal::new();
        let child = main.child();

        let waiter = tokio::spawn(async move {
            child.aborted().await;
            child.reason()
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        main.abort(StopReason::Quit);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, Some(StopReason::Quit));
    }
}
