//! Scripted collaborators shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::watch;

use crate::api::{ApiError, ApiRequest, ApiResponse, AuthBackend, RefreshError, RefreshGrant, Transport};
use crate::storage::{KeyValueStore, MemoryStore};

/// Answers 200 with the request URL as body when the request carries the
/// accepted bearer token, 401 otherwise. Records every request it sees.
pub struct ScriptedTransport {
    accepted: String,
    reject_all: AtomicBool,
    requests: Mutex<Vec<ApiRequest>>,
}

impl ScriptedTransport {
    pub fn accepting(token: &str) -> Self {
        Self {
            accepted: token.to_string(),
            reject_all: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn reject_all(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let authorized =
            !self.reject_all.load(Ordering::SeqCst) && request.bearer() == Some(self.accepted.as_str());
        if authorized {
            Ok(ApiResponse::new(StatusCode::OK, HeaderMap::new(), request.url().as_bytes().to_vec()))
        } else {
            Ok(ApiResponse::new(StatusCode::UNAUTHORIZED, HeaderMap::new(), Vec::new()))
        }
    }
}

/// Refresh backend that holds every call until `open` is called, then
/// answers with the configured outcome.
pub struct GatedBackend {
    outcome: Mutex<Result<RefreshGrant, RefreshError>>,
    gate: watch::Sender<bool>,
    calls: AtomicUsize,
    received: Mutex<Vec<String>>,
}

impl GatedBackend {
    pub fn new(outcome: Result<RefreshGrant, RefreshError>) -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            outcome: Mutex::new(outcome),
            gate,
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    pub fn set_outcome(&self, outcome: Result<RefreshGrant, RefreshError>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl AuthBackend for GatedBackend {
    async fn refresh(&self, refresh_token: &str) -> Result<RefreshGrant, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.received
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(refresh_token.to_string());

        let mut gate = self.gate.subscribe();
        if gate.wait_for(|open| *open).await.is_err() {
            return Err(RefreshError::Interrupted);
        }
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Refresh backend whose refresh panics
#[derive(Default)]
pub struct PanickingBackend {
    calls: AtomicUsize,
}

impl PanickingBackend {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthBackend for PanickingBackend {
    async fn refresh(&self, _refresh_token: &str) -> Result<RefreshGrant, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("refresh backend crashed");
    }
}

/// Memory store whose writes block until `open` is called
pub struct GatedStore {
    inner: MemoryStore,
    gate: watch::Sender<bool>,
}

impl GatedStore {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(false);
        Self {
            inner: MemoryStore::new(),
            gate,
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    async fn wait(&self) -> Result<()> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open)
            .await
            .map(|_| ())
            .map_err(|_| anyhow!("gate dropped"))
    }
}

#[async_trait]
impl KeyValueStore for GatedStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.wait().await?;
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.wait().await?;
        self.inner.remove(key).await
    }
}

/// Every operation fails
pub struct FailingStore;

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(anyhow!("storage unavailable"))
    }

    async fn set(&self, _key: &str, _value: &str) -> Result<()> {
        Err(anyhow!("storage unavailable"))
    }

    async fn remove(&self, _key: &str) -> Result<()> {
        Err(anyhow!("storage unavailable"))
    }
}
