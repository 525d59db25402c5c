//! Credential handles and the reauthorization seam.
//!
//! The core never authenticates anyone itself (see spec Non-goals); it
//! receives an already-authenticated [`Credentials`] handle at service
//! construction, mints derived handles for `open ... user=... password=...`,
//! and pokes a credential store / reauthorization helper through narrow
//! trait seams — mirroring how the teacher crate keeps `AuthManager` and
//! `Password` at arm's length from the session/session-manager code that
//! uses them.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Debug-safe wrapper around a password, grounded on
/// `authenticator::Password`.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Password").field(&"****").finish()
    }
}

/// An authenticated credential handle. Cheaply cloned (`Rc`) since the same
/// handle is shared by every session opened without an explicit
/// `user`/`password`.
#[derive(Clone, Debug)]
pub struct Credentials(Rc<Inner>);

#[derive(Debug)]
struct Inner {
    user: String,
    password: Option<Password>,
    /// The remote-host attribute carried by the service's original
    /// credentials, inherited by any derived per-`open` credentials.
    remote_host: String,
    poisoned: Cell<bool>,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: Option<Password>, remote_host: impl Into<String>) -> Self {
        Self(Rc::new(Inner {
            user: user.into(),
            password,
            remote_host: remote_host.into(),
            poisoned: Cell::new(false),
        }))
    }

    /// Mint a fresh handle for an explicit `open ... user=... password=...`,
    /// inheriting this handle's remote-host attribute.
    pub fn derive(&self, user: impl Into<String>, password: Option<Password>) -> Self {
        Self::new(user, password, self.0.remote_host.clone())
    }

    pub fn user(&self) -> &str {
        &self.0.user
    }

    pub fn password(&self) -> Option<&Password> {
        self.0.password.as_ref()
    }

    pub fn remote_host(&self) -> &str {
        &self.0.remote_host
    }

    pub fn is_poisoned(&self) -> bool {
        self.0.poisoned.get()
    }

    /// Invalidate this credential handle so it can no longer be used to
    /// open new sessions. Called on `logout`.
    pub fn poison(&self) {
        self.0.poisoned.set(true);
    }
}

/// The outcome of extracting an `authorize` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub kind: String,
    pub user: String,
}

/// Seam around the external reauthorization helper library. A real
/// implementation parses the OS-specific challenge format and computes the
/// crypt1 response; tests provide a stub.
pub trait Reauthorizer: Send + Sync {
    /// Extract the challenge kind (e.g. `"crypt1"`) and the user it was
    /// issued for.
    fn extract(&self, challenge: &str) -> Option<Challenge>;
    /// Compute the crypt1 response for `challenge` given the user's
    /// password.
    fn crypt1_response(&self, challenge: &str, password: &Password) -> Option<String>;
}
