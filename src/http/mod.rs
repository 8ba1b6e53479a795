//! HTTP surface of the proxy.

pub mod handler;

pub use handler::create_router;
