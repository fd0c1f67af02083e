use std::{fmt, sync::Arc};

use tokio::sync::watch;

/// Why a request was cancelled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// A newer request with the same fingerprint replaced this one.
    Superseded,
    /// [`RelayClient::cancel_all_requests`](crate::RelayClient::cancel_all_requests) was called.
    CancelAll,
    /// Cancelled through a caller-held [`CancelToken`].
    Caller(String),
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => f.write_str("superseded by an identical request"),
            Self::CancelAll => f.write_str("all requests cancelled"),
            Self::Caller(reason) => f.write_str(reason),
        }
    }
}

/// Cooperative cancellation signal shared between a request and whoever may
/// abort it.
///
/// Cancelling is sticky: the first reason wins and later calls are ignored.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Cancels with a generic caller reason.
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Caller("request cancelled".to_owned()));
    }

    pub fn cancel_with(&self, reason: CancelReason) {
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.state.borrow().clone()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) -> CancelReason {
        let mut rx = self.state.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        match reason {
            Some(reason) => reason,
            // the sender lives as long as `self`, so the channel cannot close
            None => futures::future::pending().await,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish()
    }
}

/// Resolves with the reason of whichever token is cancelled first.
pub(crate) async fn first_cancelled(
    primary: &CancelToken,
    secondary: Option<&CancelToken>,
) -> CancelReason {
    match secondary {
        Some(secondary) => tokio::select! {
            reason = primary.cancelled() => reason,
            reason = secondary.cancelled() => reason,
        },
        None => primary.cancelled().await,
    }
}
