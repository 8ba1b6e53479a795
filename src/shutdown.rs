//! Process shutdown coordination.
//!
//! Everything that can end the process (the `/shutdown` route, the idle
//! watchdog, a fatal remote error, a signal) funnels through one
//! coordinator. The first trigger wins; the server drains in-flight
//! responses, the spool directory is purged, and the process exits with the
//! reason's code.

use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A client asked via `GET /shutdown`, or a signal arrived.
    Requested,
    /// No request arrived within the idle window.
    Idle,
    /// An unrecoverable error (credential expiry or any 500-class condition).
    Fatal,
}

impl ShutdownReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownReason::Requested | ShutdownReason::Idle => 0,
            ShutdownReason::Fatal => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ShutdownReason::Requested => "requested",
            ShutdownReason::Idle => "idle",
            ShutdownReason::Fatal => "fatal error",
        }
    }
}

#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Trigger shutdown. Later triggers are ignored so the recorded reason
    /// (and exit code) is the first cause.
    pub fn trigger(&self, reason: ShutdownReason) {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                info!(reason = reason.as_str(), "shutdown triggered");
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    /// The recorded reason, if shutdown has been triggered.
    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.tx.borrow()
    }

    /// Wait until shutdown is triggered.
    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ShutdownReason::Requested;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_trigger_wins() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger(ShutdownReason::Idle);
        coordinator.trigger(ShutdownReason::Fatal);

        assert_eq!(coordinator.reason(), Some(ShutdownReason::Idle));
        assert_eq!(coordinator.wait().await, ShutdownReason::Idle);
    }

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = {
            let c = coordinator.clone();
            tokio::spawn(async move { c.wait().await })
        };
        coordinator.trigger(ShutdownReason::Fatal);

        let reason = waiter.await.unwrap();
        assert_eq!(reason, ShutdownReason::Fatal);
        assert_eq!(reason.exit_code(), 1);
    }
}
