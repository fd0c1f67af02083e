//! Single-flight access token refresh.
//!
//! The first caller that observes a 401 becomes the leader and performs the
//! refresh call. Callers arriving while it runs are queued and receive the
//! leader's result in arrival order; they never issue a refresh of their own.
//!
//! A reset ends the current episode: queued callers resolve as cancelled and
//! the running leader's result is discarded. The refresh slot stays taken
//! until that leader returns, so two refresh calls never overlap.

use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
};

use tokio::sync::{broadcast, oneshot};

use crate::{wire::TokenPair, CancelReason, CredentialStore, Outcome, RelayError, Result};

pub(crate) const SESSION_EXPIRED_MESSAGE: &str = "Session expired, please sign in again";
pub(crate) const NO_REFRESH_TOKEN_MESSAGE: &str =
    "No refresh token available, please sign in again";

/// Emitted once per failed refresh episode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionExpired {
    /// Why the refresh failed.
    pub reason: String,
}

/// What a queued caller is told when the slot frees up.
#[derive(Clone)]
enum Handoff {
    Settled(Result<String>),
    Cancelled(CancelReason),
    /// The leader went away without a usable result; contend for the slot
    /// again.
    Retry,
}

type Waiter = oneshot::Sender<Handoff>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    waiters: Vec<Waiter>,
    /// Bumped on every reset so a stale leader cannot settle a newer episode.
    episode: u64,
    reset_reason: Option<CancelReason>,
}

enum Role {
    Leader(u64),
    Waiter(oneshot::Receiver<Handoff>),
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    expired: broadcast::Sender<SessionExpired>,
}

impl Default for RefreshCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        let (expired, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(RefreshState::default()),
            expired,
        }
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionExpired> {
        self.expired.subscribe()
    }

    /// True while a refresh call is outstanding, including one whose episode
    /// was reset.
    pub fn is_refreshing(&self) -> bool {
        self.state().in_flight
    }

    /// Number of callers queued behind the current refresh.
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }

    /// Returns a fresh access token, refreshing it if no refresh is running
    /// or waiting for the running one otherwise.
    ///
    /// `refresh` receives the stored refresh token and performs the network
    /// call. On success both tokens are persisted. On failure the store is
    /// cleared, every waiter is rejected and a [`SessionExpired`] event is
    /// broadcast. If [`reset`](Self::reset) ends the episode first, the
    /// caller gets [`Outcome::Cancelled`] and the store is left untouched.
    pub async fn ensure_fresh_token<F, Fut>(
        &self,
        store: &dyn CredentialStore,
        refresh: F,
    ) -> Result<Outcome<String>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenPair>>,
    {
        let episode = loop {
            let role = {
                let mut state = self.state();
                if state.in_flight {
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push(tx);
                    Role::Waiter(rx)
                } else {
                    state.in_flight = true;
                    Role::Leader(state.episode)
                }
            };
            match role {
                Role::Leader(episode) => break episode,
                Role::Waiter(rx) => match rx.await.unwrap_or(Handoff::Retry) {
                    Handoff::Settled(result) => return result.map(Outcome::Completed),
                    Handoff::Cancelled(reason) => return Ok(Outcome::Cancelled(reason)),
                    Handoff::Retry => continue,
                },
            }
        };

        let mut flight = Flight {
            coordinator: self,
            settled: false,
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("refreshing access token");

        let result = match store.refresh_token() {
            Some(refresh_token) => refresh(refresh_token).await,
            None => Err(RelayError::authentication(NO_REFRESH_TOKEN_MESSAGE)),
        };

        flight.settled = true;
        self.conclude(episode, result, store)
    }

    /// Ends the current episode: queued callers resolve as cancelled with
    /// `reason` and the running leader, if any, has its result discarded.
    pub fn reset(&self, reason: CancelReason) {
        let waiters = {
            let mut state = self.state();
            state.episode += 1;
            state.reset_reason = Some(reason.clone());
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Handoff::Cancelled(reason.clone()));
        }
    }

    /// Settles the leader's episode. Store writes happen under the state lock
    /// so a concurrent reset either precedes them or sees them finished.
    fn conclude(
        &self,
        episode: u64,
        result: Result<TokenPair>,
        store: &dyn CredentialStore,
    ) -> Result<Outcome<String>> {
        let (waiters, handoff, outcome, expired) = {
            let mut state = self.state();
            state.in_flight = false;
            let waiters = std::mem::take(&mut state.waiters);
            if state.episode != episode {
                #[cfg(feature = "tracing")]
                tracing::debug!("discarding refresh result from a reset episode");
                let reason = state.reset_reason.clone().unwrap_or(CancelReason::CancelAll);
                let outcome = Ok(Outcome::Cancelled(reason));
                (waiters, Handoff::Retry, outcome, None)
            } else {
                match result {
                    Ok(tokens) => {
                        store.set_access_token(tokens.access_token.clone());
                        if let Some(refresh_token) = tokens.refresh_token {
                            store.set_refresh_token(refresh_token);
                        }
                        let handoff = Handoff::Settled(Ok(tokens.access_token.clone()));
                        (waiters, handoff, Ok(Outcome::Completed(tokens.access_token)), None)
                    }
                    Err(err) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            reason = %err.message(),
                            "token refresh failed, session expired"
                        );
                        store.clear();
                        let session = RelayError::authentication(SESSION_EXPIRED_MESSAGE);
                        let handoff = Handoff::Settled(Err(session.clone()));
                        let event = SessionExpired {
                            reason: err.message().to_owned(),
                        };
                        (waiters, handoff, Err(session), Some(event))
                    }
                }
            }
        };

        for waiter in waiters {
            let _ = waiter.send(handoff.clone());
        }
        if let Some(event) = expired {
            // no subscribers is fine
            let _ = self.expired.send(event);
        }
        outcome
    }

    /// Frees the slot of a leader that never concluded; one queued caller
    /// takes over.
    fn abandon(&self) {
        let waiters = {
            let mut state = self.state();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        for waiter in waiters {
            let _ = waiter.send(Handoff::Retry);
        }
    }
}

/// Leader's hold on the refresh slot; releases it even if the leader's
/// future is dropped mid-refresh.
struct Flight<'a> {
    coordinator: &'a RefreshCoordinator,
    settled: bool,
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.coordinator.abandon();
        }
    }
}
