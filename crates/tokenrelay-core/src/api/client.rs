//! API client that signs calls and recovers from expired sessions.
//!
//! Every call goes through the same path: the interceptor stamps the current
//! access token, the transport sends it, and a 401 is handed to the
//! refresh coordinator which replays the call once the session is renewed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;

use super::{
    ApiError, ApiRequest, ApiResponse, AuthBackend, HttpAuthBackend, RefreshCoordinator,
    ReplayPolicy, ReqwestTransport, RequestInterceptor, Transport,
};
use crate::auth::{SessionEndNotifier, TokenStore};
use crate::config::{join_url, Config};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Clone is cheap - all collaborators are shared handles.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    interceptor: RequestInterceptor,
    coordinator: RefreshCoordinator,
}

impl ApiClient {
    /// Create a client for the configured API using reqwest for both the
    /// API calls and the refresh endpoint
    pub fn new(config: &Config, tokens: TokenStore, notifier: SessionEndNotifier) -> Result<Self> {
        let timeout = config.request_timeout();
        let transport = Arc::new(ReqwestTransport::new(timeout)?);
        let backend = Arc::new(HttpAuthBackend::new(config.refresh_url()?, timeout)?);
        Ok(Self::with_parts(
            config.base_url()?,
            transport,
            backend,
            tokens,
            notifier,
            config.replay,
        ))
    }

    pub fn with_parts(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn AuthBackend>,
        tokens: TokenStore,
        notifier: SessionEndNotifier,
        replay: ReplayPolicy,
    ) -> Self {
        let coordinator = RefreshCoordinator::new(
            tokens.clone(),
            backend,
            Arc::clone(&transport),
            notifier,
            replay,
        );
        Self {
            base_url: base_url.into(),
            transport,
            interceptor: RequestInterceptor::new(tokens),
            coordinator,
        }
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send a request, recovering once from an expired access token.
    ///
    /// Statuses other than 401 are returned as-is for the caller to judge.
    pub async fn send(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.interceptor.apply(&mut request);
        let response = self.transport.send(&request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        self.coordinator.recover(request).await
    }

    /// Send with rate-limit backoff, failing on any non-success status
    async fn send_checked(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self.send(request.clone()).await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return response.error_for_status();
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(url = request.url(), retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
            tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            backoff_ms *= 2; // Exponential backoff
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_checked(ApiRequest::get(self.url(path))).await?.json()
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T, ApiError> {
        let request = ApiRequest::post(self.url(path)).json(body)?;
        self.send_checked(request).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.send_checked(ApiRequest::delete(self.url(path))).await?;
        Ok(())
    }
}
