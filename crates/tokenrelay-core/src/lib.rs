//! tokenrelay-core - client-side session handling for bearer-token APIs.
//!
//! Holds the access/refresh token pair, signs outbound calls, and when the
//! API starts answering 401 renews the session exactly once for all the
//! calls that failed together before replaying them.

pub mod api;
pub mod auth;
pub mod config;
pub mod storage;

#[cfg(test)]
mod testing;

pub use api::{ApiClient, ApiError, RefreshError};
pub use auth::{Session, SessionEndNotifier, TokenPair, TokenStore};
pub use config::Config;
