//! Single-flight session refresh.
//!
//! When a call comes back 401 the coordinator either starts the one refresh
//! allowed at a time, or parks the call behind the refresh already in
//! flight. Once the refresh settles, every parked call (the one that
//! triggered it first) is replayed with the new token in the order it was
//! parked, or rejected with the refresh failure. A call is only ever parked
//! once: if its replay is rejected again, the 401 goes straight back to the
//! caller.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::{ApiError, ApiRequest, ApiResponse, AuthBackend, RefreshError, Transport};
use crate::auth::{SessionEndNotifier, TokenStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

/// Which parked calls may be re-sent once the session is refreshed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayPolicy {
    /// Replay every call, whatever its method
    #[default]
    All,
    /// Replay only idempotent methods; others fail with `ReplayRefused`
    IdempotentOnly,
}

type Settlement = Result<ApiResponse, ApiError>;

struct PendingCaller {
    request: ApiRequest,
    settle: oneshot::Sender<Settlement>,
}

struct Coordination {
    state: RefreshState,
    queue: VecDeque<PendingCaller>,
}

enum Admission {
    /// This call starts the refresh
    Leader(String),
    /// A refresh is already running; this call waits behind it
    Queued,
    NoRefreshToken,
}

struct Shared {
    coordination: Mutex<Coordination>,
    tokens: TokenStore,
    backend: Arc<dyn AuthBackend>,
    transport: Arc<dyn Transport>,
    notifier: SessionEndNotifier,
    replay: ReplayPolicy,
}

/// Clone is cheap; all clones coordinate through the same state.
#[derive(Clone)]
pub struct RefreshCoordinator {
    shared: Arc<Shared>,
}

impl RefreshCoordinator {
    pub fn new(
        tokens: TokenStore,
        backend: Arc<dyn AuthBackend>,
        transport: Arc<dyn Transport>,
        notifier: SessionEndNotifier,
        replay: ReplayPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                coordination: Mutex::new(Coordination {
                    state: RefreshState::Idle,
                    queue: VecDeque::new(),
                }),
                tokens,
                backend,
                transport,
                notifier,
                replay,
            }),
        }
    }

    pub fn state(&self) -> RefreshState {
        self.lock().state
    }

    /// Number of calls waiting on the refresh in flight
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn lock(&self) -> MutexGuard<'_, Coordination> {
        self.shared
            .coordination
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Recover a call whose response was 401.
    ///
    /// Resolves with the replayed call's own response, or with the error
    /// that ended it: `Unauthorized` if it already had its one retry,
    /// `Refresh(_)` if the session could not be refreshed.
    pub async fn recover(&self, mut request: ApiRequest) -> Result<ApiResponse, ApiError> {
        if request.is_retried() {
            debug!(url = request.url(), "Retried call rejected again, not refreshing");
            return Err(ApiError::Unauthorized);
        }
        request.mark_retried();

        let (settle, settled) = oneshot::channel();
        let admission = {
            let mut coordination = self.lock();
            match coordination.state {
                RefreshState::Refreshing => {
                    debug!(url = request.url(), queued = coordination.queue.len() + 1, "Refresh in flight, queueing call");
                    coordination.queue.push_back(PendingCaller { request, settle });
                    Admission::Queued
                }
                RefreshState::Idle => match self.shared.tokens.get().refresh_token {
                    Some(refresh_token) => {
                        coordination.state = RefreshState::Refreshing;
                        coordination.queue.push_back(PendingCaller { request, settle });
                        Admission::Leader(refresh_token)
                    }
                    None => Admission::NoRefreshToken,
                },
            }
        };

        match admission {
            Admission::NoRefreshToken => {
                warn!("Access token rejected and no refresh token available");
                self.shared.notifier.notify();
                return Err(RefreshError::NoRefreshToken.into());
            }
            Admission::Leader(refresh_token) => {
                // Detached so a dropped caller cannot strand the state in Refreshing
                tokio::spawn(self.clone().run_refresh(refresh_token));
            }
            Admission::Queued => {}
        }

        settled
            .await
            .unwrap_or_else(|_| Err(RefreshError::Interrupted.into()))
    }

    async fn run_refresh(self, refresh_token: String) {
        let mut guard = RefreshGuard {
            coordinator: self.clone(),
            settled: false,
        };

        info!("Access token rejected, refreshing session");
        let outcome = match self.shared.backend.refresh(&refresh_token).await {
            Ok(grant) => grant.into_pair(&refresh_token),
            Err(e) => Err(e),
        };

        // Token update, drain and return to Idle form one critical section
        let batch = {
            let mut coordination = self.lock();
            if let Ok(pair) = &outcome {
                self.shared.tokens.set(pair.clone());
            }
            coordination.state = RefreshState::Idle;
            std::mem::take(&mut coordination.queue)
        };
        guard.settled = true;

        match outcome {
            Ok(pair) => {
                info!(replaying = batch.len(), "Session refreshed");
                let access_token = pair.access_token.unwrap_or_default();
                self.replay_all(batch, &access_token).await;
            }
            Err(err) => {
                warn!(error = %err, rejected = batch.len(), "Session refresh failed");
                for pending in batch {
                    let _ = pending.settle.send(Err(err.clone().into()));
                }
                self.shared.notifier.notify();
            }
        }
    }

    /// Re-send the drained batch from this task. `FuturesUnordered` polls
    /// newly pushed futures in push order, so every `send` starts in queue
    /// order while the calls still run concurrently.
    async fn replay_all(&self, batch: VecDeque<PendingCaller>, access_token: &str) {
        let mut replays = FuturesUnordered::new();
        for PendingCaller { mut request, settle } in batch {
            if self.shared.replay == ReplayPolicy::IdempotentOnly && !request.is_idempotent() {
                debug!(method = %request.method(), url = request.url(), "Not replaying non-idempotent call");
                let _ = settle.send(Err(ApiError::ReplayRefused {
                    method: request.method().to_string(),
                }));
                continue;
            }

            request.set_bearer(access_token);
            let transport = Arc::clone(&self.shared.transport);
            replays.push(async move {
                let result = match transport.send(&request).await {
                    Ok(response) if response.status().as_u16() == 401 => {
                        debug!(url = request.url(), "Replayed call rejected again");
                        Err(ApiError::Unauthorized)
                    }
                    other => other,
                };
                let _ = settle.send(result);
            });
        }
        while replays.next().await.is_some() {}
    }
}

/// Settles the queue if the refresh task ends before it could, e.g. the
/// backend panicked or the runtime shut down.
struct RefreshGuard {
    coordinator: RefreshCoordinator,
    settled: bool,
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let batch = {
            let mut coordination = self.coordinator.lock();
            coordination.state = RefreshState::Idle;
            std::mem::take(&mut coordination.queue)
        };
        warn!(rejected = batch.len(), "Session refresh ended without settling");
        for pending in batch {
            let _ = pending.settle.send(Err(RefreshError::Interrupted.into()));
        }
        self.coordinator.shared.notifier.notify();
    }
}
