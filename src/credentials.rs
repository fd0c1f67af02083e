use std::{fmt, sync::Mutex};

/// Persistent storage for the access and refresh tokens.
///
/// Implementations only need last-write-wins semantics.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;
    fn set_access_token(&self, token: String);
    fn refresh_token(&self) -> Option<String>;
    fn set_refresh_token(&self, token: String);
    /// Removes both tokens.
    fn clear(&self);
}

#[derive(Default)]
struct Tokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// In-process [`CredentialStore`], used when no other store is supplied.
#[derive(Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<Tokens>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with tokens.
    pub fn with_tokens(access: impl Into<String>, refresh: Option<String>) -> Self {
        Self {
            tokens: Mutex::new(Tokens {
                access: Some(access.into()),
                refresh,
            }),
        }
    }

    fn with_tokens_mut<R>(&self, f: impl FnOnce(&mut Tokens) -> R) -> R {
        let mut tokens = self
            .tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut tokens)
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        self.with_tokens_mut(|tokens| tokens.access.clone())
    }

    fn set_access_token(&self, token: String) {
        self.with_tokens_mut(|tokens| tokens.access = Some(token));
    }

    fn refresh_token(&self) -> Option<String> {
        self.with_tokens_mut(|tokens| tokens.refresh.clone())
    }

    fn set_refresh_token(&self, token: String) {
        self.with_tokens_mut(|tokens| tokens.refresh = Some(token));
    }

    fn clear(&self) {
        self.with_tokens_mut(|tokens| *tokens = Tokens::default());
    }
}

impl fmt::Debug for MemoryCredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialStore")
            .field("tokens", &"<redacted>")
            .finish()
    }
}
