//! Durable key-value storage for session state.
//!
//! The token store only needs string get/set/remove, so every backend is a
//! `KeyValueStore`:
//! - `MemoryStore`: process-local map, nothing survives a restart
//! - `FileStore`: a JSON object file in the cache directory
//! - `KeyringStore`: one OS keychain entry per key

pub mod file;
pub mod keychain;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

pub use self::file::FileStore;
pub use self::keychain::KeyringStore;
pub use self::memory::MemoryStore;

/// Key holding the bearer access token
pub const ACCESS_TOKEN_KEY: &str = "auth_token";

/// Key holding the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";

/// Key holding the signed-in user's profile (JSON)
pub const USER_DATA_KEY: &str = "user_data";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Removing a key that does not exist is not an error
    async fn remove(&self, key: &str) -> Result<()>;
}
