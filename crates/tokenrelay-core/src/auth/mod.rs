//! Authentication state for the client.
//!
//! This module provides:
//! - `TokenStore`: the access/refresh token pair, in memory and on disk
//! - `SessionEndNotifier`: the hook fired when a session cannot be renewed
//! - `Session`: sign-in/sign-out on top of the token store

pub mod notifier;
pub mod session;
pub mod tokens;

pub use notifier::SessionEndNotifier;
pub use session::{Session, SessionUser, UserUpdate};
pub use tokens::{TokenPair, TokenStore};
