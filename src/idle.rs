//! Idle-timeout watchdog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::info;

use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

/// A renewable one-shot timer that shuts the process down after a window
/// with no requests. Constructed without an interval it is inert.
pub struct IdleWatchdog {
    interval: Option<Duration>,
    activity: Notify,
}

impl IdleWatchdog {
    pub fn new(interval: Option<Duration>) -> Self {
        Self {
            interval,
            activity: Notify::new(),
        }
    }

    /// Record request activity, pushing the deadline out.
    pub fn touch(&self) {
        self.activity.notify_one();
    }

    /// Start the watchdog task. Nothing is spawned when idle shutdown is
    /// disabled, so the timer never keeps a quiescent process alive.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        let Some(interval) = self.interval else {
            return;
        };
        let watchdog = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = sleep(interval) => {
                        info!(idle_secs = interval.as_secs(), "idle timeout reached");
                        shutdown.trigger(ShutdownReason::Idle);
                        break;
                    }
                    () = watchdog.activity.notified() => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_after_quiet_interval() {
        let watchdog = Arc::new(IdleWatchdog::new(Some(Duration::from_millis(30))));
        let shutdown = ShutdownCoordinator::new();
        Arc::clone(&watchdog).spawn(shutdown.clone());

        assert_eq!(shutdown.wait().await, ShutdownReason::Idle);
    }

    #[tokio::test]
    async fn touches_keep_it_quiet() {
        let watchdog = Arc::new(IdleWatchdog::new(Some(Duration::from_millis(50))));
        let shutdown = ShutdownCoordinator::new();
        Arc::clone(&watchdog).spawn(shutdown.clone());

        for _ in 0..5 {
            sleep(Duration::from_millis(20)).await;
            watchdog.touch();
        }
        assert_eq!(shutdown.reason(), None);

        // Stop touching; now it fires.
        assert_eq!(shutdown.wait().await, ShutdownReason::Idle);
    }

    #[tokio::test]
    async fn disabled_watchdog_spawns_nothing() {
        let watchdog = Arc::new(IdleWatchdog::new(None));
        let shutdown = ShutdownCoordinator::new();
        Arc::clone(&watchdog).spawn(shutdown.clone());
        watchdog.touch();

        sleep(Duration::from_millis(30)).await;
        assert_eq!(shutdown.reason(), None);
    }
}
