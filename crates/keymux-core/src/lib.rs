//! The keymux proxy pipeline.
//!
//! Ties the key pool, queue and transforms together into the staged request
//! lifecycle, and exposes the axum router for the client-facing surface.

pub mod classify;
pub mod decompress;
pub mod error;
pub mod gcp_oauth;
pub mod handler;
pub mod manager;
pub mod mutate;
pub mod pipeline;
pub mod preprocess;
pub mod request;
pub mod sigv4;
pub mod spoof;
pub mod state;
pub mod tokens;
pub mod upstream;

pub use error::{ErrorKind, ProxyError};
pub use handler::proxy_router;
pub use manager::RequestManager;
pub use request::{ProxyRequest, SignedRequest};
pub use state::ProxyState;
pub use upstream::{
    TransportError, TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamClientConfig,
    UpstreamRequest, UpstreamResponse, WreqUpstreamClient,
};
