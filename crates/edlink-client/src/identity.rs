//! Identity collaborator and connection target construction.
//!
//! The realtime protocol has no post-connect handshake: the user id rides in
//! the URL path and role, area and bearer token ride in the query string.
//! Identity is polled from an [`IdentityProvider`] when the manager starts
//! and when it is re-initialized, never watched.

use std::fmt;

use parking_lot::RwLock;
use thiserror::Error;
use url::Url;

use crate::config::ClientConfig;

/// The logged-in user, as known to the session store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    /// User id, used as the last URL path segment.
    pub id: String,
    /// Clinical role, e.g. `enfermera` or `medico`.
    pub role: Option<String>,
    /// Hospital area, e.g. `emergencia`.
    pub area: Option<String>,
}

impl UserIdentity {
    /// A user with no role or area; the configured defaults apply.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: None,
            area: None,
        }
    }

    /// Set the role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the area.
    #[must_use]
    pub fn with_area(mut self, area: impl Into<String>) -> Self {
        self.area = Some(area.into());
        self
    }
}

/// Bearer token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a raw token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for placing on the wire.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Source of the current user and token.
pub trait IdentityProvider: Send + Sync {
    /// The logged-in user, if any.
    fn current_user(&self) -> Option<UserIdentity>;
    /// The bearer token, if any.
    fn auth_token(&self) -> Option<AuthToken>;
}

/// Read-only identity snapshot taken for one connection attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityContext {
    /// User id.
    pub user_id: String,
    /// Role, defaulted from config when the user has none.
    pub role: String,
    /// Area, defaulted from config when the user has none.
    pub area: String,
    /// Bearer token.
    pub token: AuthToken,
}

impl IdentityContext {
    /// Snapshot the provider. `None` when either user or token is absent,
    /// which means "not logged in yet" rather than an error.
    pub fn resolve(provider: &dyn IdentityProvider, config: &ClientConfig) -> Option<Self> {
        let user = provider.current_user()?;
        let token = provider.auth_token()?;
        if user.id.is_empty() || token.expose().is_empty() {
            return None;
        }
        Some(Self {
            user_id: user.id,
            role: user
                .role
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| config.default_role.clone()),
            area: user
                .area
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| config.default_area.clone()),
            token,
        })
    }
}

/// In-memory [`IdentityProvider`] that can be updated at runtime.
#[derive(Debug, Default)]
pub struct MemoryIdentity {
    inner: RwLock<(Option<UserIdentity>, Option<AuthToken>)>,
}

impl MemoryIdentity {
    /// Provider with a user and token already set.
    #[must_use]
    pub fn new(user: UserIdentity, token: AuthToken) -> Self {
        Self {
            inner: RwLock::new((Some(user), Some(token))),
        }
    }

    /// Provider with nobody logged in.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace the user and token.
    pub fn set(&self, user: UserIdentity, token: AuthToken) {
        *self.inner.write() = (Some(user), Some(token));
    }

    /// Log out.
    pub fn clear(&self) {
        *self.inner.write() = (None, None);
    }
}

impl IdentityProvider for MemoryIdentity {
    fn current_user(&self) -> Option<UserIdentity> {
        self.inner.read().0.clone()
    }

    fn auth_token(&self) -> Option<AuthToken> {
        self.inner.read().1.clone()
    }
}

/// Errors building a [`ConnectionTarget`].
#[derive(Debug, Error)]
pub enum TargetError {
    /// Host or port do not form a valid URL.
    #[error("invalid connection url: {0}")]
    Url(#[from] url::ParseError),
    /// The URL cannot carry path segments.
    #[error("connection url cannot carry a path")]
    NotABase,
}

/// Where to connect: `{ws|wss}://host:port/realtime/ws/{userId}?role=&area=&token=`.
///
/// `Display` and `Debug` mask the token; use [`ConnectionTarget::as_str`]
/// only to hand the URL to the transport.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    url: Url,
}

impl ConnectionTarget {
    /// Build the target for an identity snapshot.
    pub fn build(config: &ClientConfig, identity: &IdentityContext) -> Result<Self, TargetError> {
        let scheme = if config.secure { "wss" } else { "ws" };
        let mut url = Url::parse(&format!("{scheme}://{}:{}/", config.host, config.port))?;
        {
            let mut segments = url.path_segments_mut().map_err(|()| TargetError::NotABase)?;
            let _ = segments
                .pop_if_empty()
                .extend(config.path.split('/').filter(|s| !s.is_empty()))
                .push(&identity.user_id);
        }
        {
            let mut query = url.query_pairs_mut();
            let _ = query
                .append_pair("role", &identity.role)
                .append_pair("area", &identity.area)
                .append_pair("token", identity.token.expose());
        }
        Ok(Self { url })
    }

    /// The full URL, token included.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The full URL as a string, token included.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// The URL with the token value replaced by `***`.
    #[must_use]
    pub fn redacted(&self) -> String {
        let pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .map(|(k, v)| {
                let v = if k == "token" {
                    "***".to_owned()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), v)
            })
            .collect();
        let mut masked = self.url.clone();
        let _ = masked.query_pairs_mut().clear().extend_pairs(pairs);
        masked.to_string()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionTarget")
            .field(&self.redacted())
            .finish()
    }
}
