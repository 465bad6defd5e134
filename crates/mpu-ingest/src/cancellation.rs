//! Cooperative cancellation shared by every pipeline stage.
//!
//! A [`CancellationBus`] is created once per run and cloned into each stage.
//! Any stage (or the process signal handler) may request cancellation; only the
//! first request is recorded, later ones are no-ops. Every blocking handoff on
//! the inter-stage channels goes through [`CancellationBus::send`] or
//! [`CancellationBus::recv`], which race the channel operation against the
//! signal so no stage can stay parked on a channel after shutdown begins.

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a run was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// A stage hit an unrecoverable condition.
    Fatal { stage: &'static str, message: String },
    /// Shutdown requested from outside the pipeline (e.g. Ctrl+C).
    External,
}

impl CancelReason {
    pub fn fatal(stage: &'static str, message: impl Into<String>) -> Self {
        CancelReason::Fatal {
            stage,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, CancelReason::Fatal { .. })
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Fatal { stage, message } => write!(f, "fatal error in {}: {}", stage, message),
            CancelReason::External => write!(f, "external shutdown request"),
        }
    }
}

/// Why a handoff did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    /// Cancellation was requested before or while waiting.
    Cancelled,
    /// The other end of the channel is gone.
    Closed,
}

/// Broadcast-once cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancellationBus {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancellationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    ///
    /// Returns `true` for the request that actually set the signal. The reason
    /// is stored before the token fires, so anyone woken by the signal can
    /// read it.
    pub fn request(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason.clone()).is_ok();
        if first {
            warn!(reason = %reason, "Cancellation requested");
        } else {
            debug!(reason = %reason, "Cancellation already requested, ignoring");
        }
        self.token.cancel();
        first
    }

    /// Shorthand for requesting cancellation with [`CancelReason::Fatal`].
    pub fn fatal(&self, stage: &'static str, message: impl Into<String>) -> bool {
        self.request(CancelReason::fatal(stage, message))
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first request, if any.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }

    /// Hand `item` to the next stage, giving up if cancellation wins the race.
    pub async fn send<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<(), Interrupted> {
        if self.is_requested() {
            return Err(Interrupted::Cancelled);
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            sent = tx.send(item) => sent.map_err(|_| Interrupted::Closed),
        }
    }

    /// Take the next item from the previous stage.
    ///
    /// `None` means either cancellation or end of stream; callers that need to
    /// tell them apart check [`CancellationBus::is_requested`].
    pub async fn recv<T>(&self, rx: &mut mpsc::Receiver<T>) -> Option<T> {
        if self.is_requested() {
            return None;
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            item = rx.recv() => item,
        }
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
    pub async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_first_request_wins() {
        let bus = CancellationBus::new();
        assert!(!bus.is_requested());
        assert_eq!(bus.reason(), None);

        assert!(bus.fatal("source", "bad request"));
        assert!(!bus.request(CancelReason::External));

        assert!(bus.is_requested());
        assert_eq!(bus.reason(), Some(CancelReason::fatal("source", "bad request")));
    }

    #[tokio::test]
    async fn test_concurrent_signalers() {
        let bus = CancellationBus::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let bus = bus.clone();
                tokio::spawn(async move { bus.request(CancelReason::External) })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(bus.is_requested());
    }

    #[tokio::test]
    async fn test_send_unblocks_on_cancel() {
        let bus = CancellationBus::new();
        let (tx, _rx) = mpsc::channel::<u32>(1);
        bus.send(&tx, 1).await.unwrap();

        // Channel is full and nobody reads it.
        let waiter = {
            let bus = bus.clone();
            let tx = tx.clone();
            tokio::spawn(async move { bus.send(&tx, 2).await })
        };

        tokio::task::yield_now().await;
        bus.request(CancelReason::External);

        assert_eq!(waiter.await.unwrap(), Err(Interrupted::Cancelled));
        assert_eq!(bus.send(&tx, 3).await, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_recv_unblocks_on_cancel() {
        let bus = CancellationBus::new();
        let (_tx, mut rx) = mpsc::channel::<u32>(1);

        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.recv(&mut rx).await })
        };

        tokio::task::yield_now().await;
        bus.request(CancelReason::External);

        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_reports_closed_channel() {
        let bus = CancellationBus::new();
        let (tx, rx) = mpsc::channel::<u32>(1);
        drop(rx);

        assert_eq!(bus.send(&tx, 1).await, Err(Interrupted::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_interrupted() {
        let bus = CancellationBus::new();
        assert!(bus.sleep(Duration::from_secs(20)).await);

        bus.request(CancelReason::External);
        assert!(!bus.sleep(Duration::from_secs(20)).await);
    }
}
