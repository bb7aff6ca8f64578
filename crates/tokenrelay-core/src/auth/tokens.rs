use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use crate::storage::{KeyValueStore, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl TokenPair {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

struct Shared {
    pair: RwLock<TokenPair>,
    durable: Arc<dyn KeyValueStore>,
    /// Serializes durable writes
    write_lock: Mutex<()>,
    in_flight: AtomicUsize,
    persisted: Notify,
}

/// Current access/refresh token pair, hot in memory and mirrored to a
/// durable store.
///
/// Memory is the source of truth: `set` and `clear` update it synchronously
/// and push the change to the durable store in the background. Durable
/// failures are logged and never reach the caller. Clone is cheap and every
/// clone sees the same pair.
#[derive(Clone)]
pub struct TokenStore {
    shared: Arc<Shared>,
}

impl TokenStore {
    pub fn new(durable: Arc<dyn KeyValueStore>) -> Self {
        Self {
            shared: Arc::new(Shared {
                pair: RwLock::new(TokenPair::default()),
                durable,
                write_lock: Mutex::new(()),
                in_flight: AtomicUsize::new(0),
                persisted: Notify::new(),
            }),
        }
    }

    pub fn get(&self) -> TokenPair {
        self.shared
            .pair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, pair: TokenPair) {
        *self
            .shared
            .pair
            .write()
            .unwrap_or_else(PoisonError::into_inner) = pair;
        self.schedule_persist();
    }

    pub fn clear(&self) {
        self.set(TokenPair::default());
    }

    /// Read both tokens from the durable store into memory.
    ///
    /// Called once at startup, before any request is signed. A missing or
    /// unreadable value leaves that token empty.
    pub async fn load(&self) {
        let durable = &self.shared.durable;
        let (access, refresh) = futures::join!(
            durable.get(ACCESS_TOKEN_KEY),
            durable.get(REFRESH_TOKEN_KEY)
        );

        let pair = TokenPair {
            access_token: Self::loaded(ACCESS_TOKEN_KEY, access),
            refresh_token: Self::loaded(REFRESH_TOKEN_KEY, refresh),
        };
        debug!(
            has_access = pair.access_token.is_some(),
            has_refresh = pair.refresh_token.is_some(),
            "Tokens loaded from storage"
        );
        *self
            .shared
            .pair
            .write()
            .unwrap_or_else(PoisonError::into_inner) = pair;
    }

    fn loaded(key: &str, result: anyhow::Result<Option<String>>) -> Option<String> {
        match result {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                error!(key, error = %e, "Failed to load token from storage");
                None
            }
        }
    }

    /// Wait until every durable write scheduled so far has finished
    pub async fn wait_persisted(&self) {
        loop {
            let notified = self.shared.persisted.notified();
            if self.shared.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn schedule_persist(&self) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime available, token change not persisted");
                return;
            }
        };

        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        handle.spawn(async move {
            {
                let _guard = shared.write_lock.lock().await;
                // Always write the latest pair so reordered tasks converge
                let snapshot = shared
                    .pair
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                persist(&*shared.durable, ACCESS_TOKEN_KEY, snapshot.access_token.as_deref()).await;
                persist(&*shared.durable, REFRESH_TOKEN_KEY, snapshot.refresh_token.as_deref()).await;
            }
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            shared.persisted.notify_waiters();
        });
    }
}

async fn persist(durable: &dyn KeyValueStore, key: &str, value: Option<&str>) {
    let result = match value {
        Some(value) => durable.set(key, value).await,
        None => durable.remove(key).await,
    };
    if let Err(e) = result {
        error!(key, error = %e, "Failed to persist token");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{FailingStore, GatedStore};

    fn store_with(durable: Arc<MemoryStore>) -> TokenStore {
        TokenStore::new(durable)
    }

    #[tokio::test]
    async fn test_get_sees_set_before_durable_write_completes() {
        let gated = Arc::new(GatedStore::new());
        let store = TokenStore::new(gated.clone());

        store.set(TokenPair::new("A2", "R2"));
        assert_eq!(store.get(), TokenPair::new("A2", "R2"));

        // Durable write is still blocked
        tokio::task::yield_now().await;
        assert_eq!(gated.inner().snapshot(ACCESS_TOKEN_KEY), None);

        gated.open();
        store.wait_persisted().await;
        assert_eq!(gated.inner().snapshot(ACCESS_TOKEN_KEY).as_deref(), Some("A2"));
        assert_eq!(gated.inner().snapshot(REFRESH_TOKEN_KEY).as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_durable_converges_to_last_set() {
        let durable = Arc::new(MemoryStore::new());
        let store = store_with(durable.clone());

        store.set(TokenPair::new("A1", "R1"));
        store.set(TokenPair::new("A2", "R2"));
        store.set(TokenPair::new("A3", "R3"));
        store.wait_persisted().await;

        assert_eq!(durable.snapshot(ACCESS_TOKEN_KEY).as_deref(), Some("A3"));
        assert_eq!(durable.snapshot(REFRESH_TOKEN_KEY).as_deref(), Some("R3"));
    }

    #[tokio::test]
    async fn test_clear_removes_durable_values() {
        let durable = Arc::new(MemoryStore::new());
        let store = store_with(durable.clone());
        store.set(TokenPair::new("A1", "R1"));
        store.wait_persisted().await;

        store.clear();
        assert!(store.get().is_empty());
        store.wait_persisted().await;
        assert_eq!(durable.snapshot(ACCESS_TOKEN_KEY), None);
        assert_eq!(durable.snapshot(REFRESH_TOKEN_KEY), None);
    }

    #[tokio::test]
    async fn test_load_with_partial_durable_state() {
        let durable = Arc::new(MemoryStore::new());
        durable.set(REFRESH_TOKEN_KEY, "R1").await.unwrap();

        let store = store_with(durable);
        store.load().await;
        assert_eq!(
            store.get(),
            TokenPair {
                access_token: None,
                refresh_token: Some("R1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_durable_failures_are_absorbed() {
        let store = TokenStore::new(Arc::new(FailingStore));

        store.load().await;
        assert!(store.get().is_empty());

        store.set(TokenPair::new("A1", "R1"));
        store.wait_persisted().await;
        assert_eq!(store.get(), TokenPair::new("A1", "R1"));
    }

    #[test]
    fn test_set_without_runtime_still_updates_memory() {
        let store = TokenStore::new(Arc::new(MemoryStore::new()));
        store.set(TokenPair::new("A1", "R1"));
        assert_eq!(store.get().access_token.as_deref(), Some("A1"));
    }

    #[test]
    fn test_token_pair_json_shape() {
        let json = serde_json::to_value(TokenPair::new("A1", "R1")).unwrap();
        assert_eq!(json, serde_json::json!({ "accessToken": "A1", "refreshToken": "R1" }));
    }
}
