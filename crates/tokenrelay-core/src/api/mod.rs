//! Authenticated HTTP call path.
//!
//! This module provides the `ApiClient` and the pieces it is built from:
//! - `RequestInterceptor`: stamps the current access token on each call
//! - `Transport`: sends a request (`ReqwestTransport` by default)
//! - `RefreshCoordinator`: runs one refresh at a time and replays the calls
//!   that failed while it was in flight
//! - `AuthBackend`: exchanges a refresh token for a new pair

pub mod backend;
pub mod client;
pub mod error;
pub mod interceptor;
pub mod refresh;
pub mod request;
pub mod transport;

pub use backend::{AuthBackend, HttpAuthBackend, RefreshGrant};
pub use client::ApiClient;
pub use error::{ApiError, RefreshError};
pub use interceptor::RequestInterceptor;
pub use refresh::{RefreshCoordinator, RefreshState, ReplayPolicy};
pub use request::{ApiRequest, ApiResponse};
pub use transport::{ReqwestTransport, Transport};
