//! Main axum router and HTTP request handlers for the build-cache proxy.
//!
//! Routes:
//! - `GET  /ping`     - liveness probe
//! - `GET  /shutdown` - respond, then shut the process down
//! - every other path is an opaque cache key, dispatched by method:
//!   `GET`/`HEAD` read through the in-memory cache to the store,
//!   `PUT` spools the body and uploads in the background,
//!   `DELETE` evicts locally and deletes remotely.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::breaker;
use crate::depfile;
use crate::shutdown::ShutdownReason;
use crate::spool::StageOutcome;
use crate::storage::StoreError;
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with the two reserved routes and the catch-all
/// object dispatcher. A non-GET request to a reserved path falls through to
/// the dispatcher, so `ping` and `shutdown` stay usable as cache keys for
/// every method but `GET`.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(handle_ping).fallback(handle_object))
        .route("/shutdown", get(handle_shutdown).fallback(handle_object))
        .fallback(handle_object)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Reserved routes
// ---------------------------------------------------------------------------

/// `GET /ping`
async fn handle_ping(State(state): State<Arc<AppState>>) -> Response {
    state.idle.touch();
    let started = Instant::now();
    finish(
        &state,
        &Method::GET,
        &Uri::from_static("/ping"),
        started,
        Reply::with_body(StatusCode::OK, Bytes::from_static(b"pong")),
    )
}

/// `GET /shutdown`
///
/// The 200 response drains before the server stops; any in-flight background
/// uploads are abandoned.
async fn handle_shutdown(State(state): State<Arc<AppState>>) -> Response {
    state.idle.touch();
    let started = Instant::now();
    state.shutdown.trigger(ShutdownReason::Requested);
    finish(
        &state,
        &Method::GET,
        &Uri::from_static("/shutdown"),
        started,
        Reply::with_body(StatusCode::OK, Bytes::from_static(b"shutting down")),
    )
}

// ---------------------------------------------------------------------------
// Object dispatcher
// ---------------------------------------------------------------------------

/// Catch-all handler: the path (minus the leading `/`) is the cache key.
async fn handle_object(State(state): State<Arc<AppState>>, req: Request) -> Response {
    state.idle.touch();
    let started = Instant::now();

    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let key = uri.path().trim_start_matches('/').to_string();
    let budget = Duration::from_secs(state.config.proxy.socket_timeout_seconds);

    let reply = match method.as_str() {
        "GET" => detached(budget, get_object(Arc::clone(&state), key)).await,
        "HEAD" => detached(budget, head_object(Arc::clone(&state), key)).await,
        "PUT" if key.is_empty() => Reply::new(StatusCode::FORBIDDEN),
        "PUT" => detached(budget, put_object(Arc::clone(&state), key, body)).await,
        "DELETE" => detached(budget, delete_object(Arc::clone(&state), key)).await,
        _ => Reply::new(StatusCode::METHOD_NOT_ALLOWED),
    };

    finish(&state, &method, &uri, started, reply)
}

/// Run a request's work on its own task so an expired time budget does not
/// cancel the underlying remote operation or spool upload.
async fn detached<F>(budget: Duration, work: F) -> Reply
where
    F: Future<Output = Reply> + Send + 'static,
{
    let handle = tokio::spawn(work);
    match tokio::time::timeout(budget, handle).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(err)) => {
            error!(error = %err, "request task aborted");
            Reply::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(_) => {
            warn!(budget_secs = budget.as_secs(), "request timed out");
            Reply::new(StatusCode::NOT_FOUND)
        }
    }
}

// ---------------------------------------------------------------------------
// Method handlers
// ---------------------------------------------------------------------------

/// `GET /<key>`
async fn get_object(state: Arc<AppState>, key: String) -> Reply {
    if let Some(bytes) = state.cache.get(&key) {
        return Reply {
            from_cache: true,
            ..Reply::with_body(StatusCode::OK, bytes)
        };
    }
    if state.breaker.is_open() {
        return Reply {
            paused: true,
            ..Reply::new(StatusCode::NOT_FOUND)
        };
    }

    let round_trip = Instant::now();
    let result = state.store.get_object(&key).await;
    let store_ms = round_trip.elapsed().as_millis() as u64;
    breaker::observe(&state.breaker, &result);

    match result {
        Ok(bytes) => {
            if !state.config.allow_gcc_depfiles && depfile::is_gcc_depfile(&bytes) {
                info!(%key, size = bytes.len(), "(blocked gcc depfile)");
                return Reply {
                    blocked_depfile: true,
                    store_ms: Some(store_ms),
                    ..Reply::new(StatusCode::NOT_FOUND)
                };
            }
            state.cache.maybe_add(&key, bytes.clone());
            Reply {
                store_ms: Some(store_ms),
                ..Reply::with_body(StatusCode::OK, bytes)
            }
        }
        Err(StoreError::NotFound) => Reply {
            store_ms: Some(store_ms),
            ..Reply::new(StatusCode::NOT_FOUND)
        },
        Err(err) => store_error_reply(&state, err, Verb::Read, store_ms),
    }
}

/// `HEAD /<key>`
async fn head_object(state: Arc<AppState>, key: String) -> Reply {
    if state.cache.contains(&key) {
        return Reply {
            from_cache: true,
            ..Reply::new(StatusCode::OK)
        };
    }
    if state.breaker.is_open() {
        return Reply {
            paused: true,
            ..Reply::new(StatusCode::NOT_FOUND)
        };
    }

    let round_trip = Instant::now();
    let result = state.store.head_object(&key).await;
    let store_ms = round_trip.elapsed().as_millis() as u64;
    breaker::observe(&state.breaker, &result);

    match result {
        Ok(()) => Reply {
            store_ms: Some(store_ms),
            ..Reply::new(StatusCode::OK)
        },
        Err(StoreError::NotFound) => Reply {
            store_ms: Some(store_ms),
            ..Reply::new(StatusCode::NOT_FOUND)
        },
        Err(err) => store_error_reply(&state, err, Verb::Read, store_ms),
    }
}

/// `DELETE /<key>`
async fn delete_object(state: Arc<AppState>, key: String) -> Reply {
    // Local eviction happens before the remote delete is dispatched, even
    // when the breaker short-circuits the remote call.
    state.cache.delete(&key);

    if state.breaker.is_open() {
        return Reply {
            paused: true,
            ..Reply::new(StatusCode::OK)
        };
    }

    let round_trip = Instant::now();
    let result = state.store.delete_object(&key).await;
    let store_ms = round_trip.elapsed().as_millis() as u64;
    breaker::observe(&state.breaker, &result);

    match result {
        Ok(()) => Reply {
            store_ms: Some(store_ms),
            ..Reply::new(StatusCode::OK)
        },
        Err(StoreError::NotFound) => Reply {
            store_ms: Some(store_ms),
            ..Reply::new(StatusCode::NOT_FOUND)
        },
        Err(err) => store_error_reply(&state, err, Verb::Write, store_ms),
    }
}

/// `PUT /<key>`
///
/// The body is staged to the spool directory first; every rejection after
/// that still answers 200 so the build keeps moving, and the spool file is
/// removed. An admitted upload runs on its own task; in async mode the 200
/// precedes upload completion and a later failure is logged only.
async fn put_object(state: Arc<AppState>, key: String, body: Body) -> Reply {
    let inline_cap = state.config.memory_cache.max_entry_bytes;
    let staged = match state
        .spooler
        .stage(&key, body.into_data_stream(), inline_cap)
        .await
    {
        Ok(StageOutcome::AlreadyStaging) => {
            debug!(%key, "spool file already exists, upload in flight");
            return Reply::new(StatusCode::OK);
        }
        Ok(StageOutcome::Staged(staged)) => staged,
        Err(err) => {
            warn!(%key, error = %err, "failed to spool request body");
            return Reply::new(StatusCode::OK);
        }
    };

    if state.breaker.is_open() {
        state.spooler.discard(&staged.path).await;
        return Reply {
            paused: true,
            logged_length: Some(staged.size),
            ..Reply::new(StatusCode::OK)
        };
    }

    let max_entry = state.config.max_entry_size_bytes;
    if max_entry > 0 && staged.size > max_entry {
        info!(%key, size = staged.size, max_entry, "upload exceeds max entry size");
        state.spooler.discard(&staged.path).await;
        return Reply::new(StatusCode::OK);
    }

    if !state.spooler.try_admit(staged.size) {
        info!(
            %key,
            size = staged.size,
            pending = state.spooler.pending_bytes(),
            "too many pending uploads"
        );
        state.spooler.discard(&staged.path).await;
        return Reply::new(StatusCode::OK);
    }

    if let Some(bytes) = staged.inline.clone() {
        state.cache.maybe_add(&key, bytes);
    }

    let size = staged.size;
    let async_mode = state.config.async_upload.enabled;
    let upload = {
        let state = Arc::clone(&state);
        let key = key.clone();
        tokio::spawn(async move {
            let result = state
                .spooler
                .upload(state.store.as_ref(), &state.breaker, &key, &staged.path, size)
                .await;
            if let Err(err) = &result {
                warn!(%key, error = %err, "upload failed");
                if async_mode && matches!(err, StoreError::ExpiredCredentials(_)) {
                    error!("Unrecoverable Error, shutting down");
                    state.shutdown.trigger(ShutdownReason::Fatal);
                }
            }
            result
        })
    };

    if async_mode {
        return Reply {
            logged_length: Some(size),
            ..Reply::new(StatusCode::OK)
        };
    }

    let round_trip = Instant::now();
    match upload.await {
        Ok(Ok(())) => Reply {
            store_ms: Some(round_trip.elapsed().as_millis() as u64),
            logged_length: Some(size),
            ..Reply::new(StatusCode::OK)
        },
        Ok(Err(err)) => store_error_reply(
            &state,
            err,
            Verb::Write,
            round_trip.elapsed().as_millis() as u64,
        ),
        Err(err) => {
            error!(error = %err, "upload task aborted");
            Reply::new(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ---------------------------------------------------------------------------
// Error-to-response policy
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
enum Verb {
    Read,
    Write,
}

impl Verb {
    /// The downgraded status used when a transient remote error should not
    /// fail the build: reads miss, writes pretend to succeed.
    fn soft_status(self) -> StatusCode {
        match self {
            Verb::Read => StatusCode::NOT_FOUND,
            Verb::Write => StatusCode::OK,
        }
    }
}

/// Map a classified remote-store failure to a response. Breaker accounting
/// has already happened at the call site.
fn store_error_reply(state: &AppState, err: StoreError, verb: Verb, store_ms: u64) -> Reply {
    let status = match &err {
        StoreError::NotFound => StatusCode::NOT_FOUND,
        StoreError::ExpiredCredentials(msg) => {
            error!(error = %msg, "remote store rejected credentials");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        StoreError::Local(e) => {
            warn!(error = %e, "local i/o error during store operation");
            verb.soft_status()
        }
        StoreError::Retryable(_) | StoreError::Other { .. } => {
            warn!(error = %err, "remote store error");
            if state.config.allow_offline {
                verb.soft_status()
            } else {
                err.http_status()
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::NOT_FOUND)
            }
        }
    };
    Reply {
        store_ms: Some(store_ms),
        ..Reply::new(status)
    }
}

// ---------------------------------------------------------------------------
// Terminal response
// ---------------------------------------------------------------------------

/// Terminal outcome of one request, carried to the central logger.
struct Reply {
    status: StatusCode,
    body: Bytes,
    from_cache: bool,
    paused: bool,
    blocked_depfile: bool,
    store_ms: Option<u64>,
    /// Length to log instead of the response body length (async `PUT` logs
    /// the accepted upload size while answering with an empty body).
    logged_length: Option<u64>,
}

impl Reply {
    fn new(status: StatusCode) -> Self {
        Self {
            status,
            body: Bytes::new(),
            from_cache: false,
            paused: false,
            blocked_depfile: false,
            store_ms: None,
            logged_length: None,
        }
    }

    fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::new(status)
        }
    }
}

/// Log the terminal response and convert it. A 500 means the process cannot
/// usefully continue: the shutdown is triggered here and the response still
/// drains before the server stops.
fn finish(state: &AppState, method: &Method, uri: &Uri, started: Instant, reply: Reply) -> Response {
    let length = reply.logged_length.unwrap_or(reply.body.len() as u64);
    info!(
        method = %method,
        url = %uri,
        status = reply.status.as_u16(),
        length,
        elapsed_ms = started.elapsed().as_millis() as u64,
        store_ms = reply.store_ms.unwrap_or(0),
        from_cache = reply.from_cache,
        aws_paused = reply.paused,
        blocked_gcc_depfile = reply.blocked_depfile,
        "request"
    );

    if reply.status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Unrecoverable Error, shutting down");
        state.shutdown.trigger(ShutdownReason::Fatal);
    }

    (reply.status, reply.body).into_response()
}
