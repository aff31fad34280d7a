//! Signed-in identity.
//!
//! "Not signed in yet" is a normal state, not an error: callers wait on
//! [`wait_for_user`] until an identity shows up.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use tutorlink_shared::Identifier;

/// Source of the current user's identity.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<Identifier>;

    /// Receiver that observes every sign-in and sign-out.
    fn changes(&self) -> watch::Receiver<Option<Identifier>>;
}

/// In-process auth state, shared by cloning.
#[derive(Debug, Clone)]
pub struct SessionAuth {
    tx: Arc<watch::Sender<Option<Identifier>>>,
}

impl SessionAuth {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn signed_in(user: Identifier) -> Self {
        let auth = Self::new();
        auth.sign_in(user);
        auth
    }

    pub fn sign_in(&self, user: Identifier) {
        info!(user = %user, "signed in");
        self.tx.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        if let Some(user) = self.tx.send_replace(None) {
            info!(user = %user, "signed out");
        }
    }
}

impl Default for SessionAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for SessionAuth {
    fn current_user(&self) -> Option<Identifier> {
        self.tx.borrow().clone()
    }

    fn changes(&self) -> watch::Receiver<Option<Identifier>> {
        self.tx.subscribe()
    }
}

/// Resolve once `auth` reports a signed-in user.
///
/// Returns `None` only if the provider went away without ever signing in.
pub async fn wait_for_user<A: AuthProvider + ?Sized>(auth: &A) -> Option<Identifier> {
    let mut rx = auth.changes();
    let user = rx.wait_for(Option::is_some).await.ok()?.clone();
    user
}
