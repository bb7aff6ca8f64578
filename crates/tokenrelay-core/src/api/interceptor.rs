use tracing::warn;

use super::ApiRequest;
use crate::auth::TokenStore;

/// Stamps outbound requests with the current access token.
#[derive(Clone)]
pub struct RequestInterceptor {
    tokens: TokenStore,
}

impl RequestInterceptor {
    pub fn new(tokens: TokenStore) -> Self {
        Self { tokens }
    }

    /// Attach `Authorization: Bearer <access>` when a token is held;
    /// otherwise the request goes out unauthenticated.
    pub fn apply(&self, request: &mut ApiRequest) {
        if let Some(token) = self.tokens.get().access_token {
            if !request.set_bearer(&token) {
                request.clear_bearer();
                warn!(url = request.url(), "Access token is not a valid header value, sending unauthenticated");
            }
        }
    }
}
