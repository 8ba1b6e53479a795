//! buildcache — a localhost caching proxy between a build tool's remote-cache
//! protocol (plain `GET`/`PUT`/`HEAD`/`DELETE` on opaque keys) and an
//! S3-compatible object store.
//!
//! Hits are served from a bounded in-memory cache; `PUT` bodies are spooled to
//! disk and uploaded in the background so build latency is decoupled from
//! upload latency; a circuit breaker pauses remote access after consecutive
//! failures so a degraded bucket slows no build down.

pub mod breaker;
pub mod cache;
pub mod config;
pub mod depfile;
pub mod http;
pub mod idle;
pub mod shutdown;
pub mod spool;
pub mod storage;

use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::cache::MemoryCache;
use crate::config::Config;
use crate::idle::IdleWatchdog;
use crate::shutdown::ShutdownCoordinator;
use crate::spool::UploadSpooler;
use crate::storage::ObjectStore;

/// Global state shared across all request handlers and background tasks.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn ObjectStore>,
    pub cache: MemoryCache,
    pub spooler: Arc<UploadSpooler>,
    pub breaker: CircuitBreaker,
    pub idle: Arc<IdleWatchdog>,
    pub shutdown: ShutdownCoordinator,
}
