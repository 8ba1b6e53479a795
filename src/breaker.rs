//! Consecutive-error circuit breaker for remote store access.
//!
//! A caching proxy must prefer "proceed without the cache" over "fail the
//! build": after enough consecutive remote failures the breaker opens and
//! the router answers without contacting the store, until the pause lapses.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::storage::StoreError;

pub struct CircuitBreaker {
    threshold: u32,
    pause: Duration,
    state: Mutex<BreakerState>,
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_errors: u32,
    reopens_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(errors_before_pausing: u32, pause: Duration) -> Self {
        Self {
            threshold: errors_before_pausing,
            pause,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A remote call worked; the error streak is over.
    pub fn on_success(&self) {
        self.lock().consecutive_errors = 0;
    }

    /// A remote call failed. Reaching the threshold while closed opens the
    /// breaker for the configured pause.
    pub fn on_error(&self) {
        let mut state = self.lock();
        state.consecutive_errors += 1;
        if state.consecutive_errors >= self.threshold && state.reopens_at.is_none() {
            state.reopens_at = Some(Instant::now() + self.pause);
            warn!(
                errors = state.consecutive_errors,
                pause_secs = self.pause.as_secs(),
                "pausing remote store access"
            );
        }
    }

    /// Whether remote access is currently short-circuited. A pause whose
    /// deadline has lapsed closes here, so no timer task is needed.
    pub fn is_open(&self) -> bool {
        let mut state = self.lock();
        match state.reopens_at {
            Some(deadline) if Instant::now() >= deadline => {
                state.reopens_at = None;
                state.consecutive_errors = 0;
                info!("resuming remote store access");
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

/// Report one remote-call outcome to the breaker. A missing object means the
/// network worked, so it counts as success; expired credentials are fatal to
/// the process and never counted; a local i/o failure never reached the
/// network.
pub fn observe<T>(circuit: &CircuitBreaker, result: &Result<T, StoreError>) {
    match result {
        Ok(_) | Err(StoreError::NotFound) => circuit.on_success(),
        Err(StoreError::ExpiredCredentials(_)) | Err(StoreError::Local(_)) => {}
        Err(_) => circuit.on_error(),
    }
}
