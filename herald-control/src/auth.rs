//! Authentication and authorization for the control socket
//!
//! Operators present a bearer token with every request. Tokens are configured
//! as SHA-256 hashes, each bound to an actor name (recorded in the audit
//! trail) and the set of permissions that actor holds.

use std::fmt::{self, Display};

use hex::encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Actor recorded for requests when authentication is disabled
pub const LOCAL_ACTOR: &str = "local";

/// Actor recorded for requests that could not be authenticated
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// What a command is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Read statistics, failed jobs and queue metrics
    Read,
    /// Requeue dead jobs and reset the circuit breaker
    Manage,
    /// Publish campaigns and request drafts
    Publish,
}

impl Permission {
    pub const ALL: [Self; 3] = [Self::Read, Self::Manage, Self::Publish];
}

impl Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Manage => "manage",
            Self::Publish => "publish",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication required but no token provided")]
    MissingToken,

    #[error("Invalid authentication token")]
    InvalidToken,

    #[error("{actor} lacks the {permission} permission")]
    Forbidden { actor: String, permission: Permission },
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub actor: String,
    permissions: Vec<Permission>,
}

impl Principal {
    #[must_use]
    pub fn new(actor: impl Into<String>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            actor: actor.into(),
            permissions: permissions.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// Decides who a caller is and whether they may run a command
pub trait Authorizer: Send + Sync {
    /// Resolve a bearer token to a principal
    ///
    /// # Errors
    ///
    /// [`AuthError::MissingToken`] or [`AuthError::InvalidToken`] when the
    /// caller cannot be identified.
    fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError>;

    /// Authenticate and check a single permission
    ///
    /// # Errors
    ///
    /// Any authentication error, or [`AuthError::Forbidden`] when the principal
    /// lacks `permission`.
    fn authorize(&self, token: Option<&str>, permission: Permission) -> Result<Principal, AuthError> {
        let principal = self.authenticate(token)?;
        if principal.allows(permission) {
            Ok(principal)
        } else {
            Err(AuthError::Forbidden {
                actor: principal.actor,
                permission,
            })
        }
    }
}

/// SHA-256 hex digest of a token, as stored in configuration
#[must_use]
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    encode(hasher.finalize())
}

fn all_permissions() -> Vec<Permission> {
    Permission::ALL.to_vec()
}

/// One configured token
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    /// Name written to the audit trail for this token
    pub actor: String,

    /// SHA-256 hash of the token, as 64 hex characters
    pub token_hash: String,

    #[serde(default = "all_permissions")]
    pub permissions: Vec<Permission>,
}

/// Authentication configuration for control socket
///
/// # Example Configuration
///
/// ```ron
/// auth: (
///     enabled: true,
///     tokens: [
///         (
///             actor: "ops",
///             // echo -n "your-secret-token" | sha256sum
///             token_hash: "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8",
///             permissions: [Read, Manage],
///         ),
///     ],
/// )
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ControlAuthConfig {
    /// When disabled, every caller is [`LOCAL_ACTOR`] with all permissions and
    /// access relies on the socket's filesystem permissions
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub tokens: Vec<TokenGrant>,
}

/// [`Authorizer`] backed by hashed tokens from configuration
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    config: ControlAuthConfig,
}

impl TokenAuthorizer {
    #[must_use]
    pub const fn new(config: ControlAuthConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn requires_auth(&self) -> bool {
        self.config.enabled
    }
}

impl Authorizer for TokenAuthorizer {
    fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        if !self.config.enabled {
            return Ok(Principal::new(LOCAL_ACTOR, Permission::ALL));
        }

        let token = token.ok_or(AuthError::MissingToken)?;
        let hash = hash_token(token);

        self.config
            .tokens
            .iter()
            .find(|grant| grant.token_hash.eq_ignore_ascii_case(&hash))
            .map(|grant| Principal::new(grant.actor.clone(), grant.permissions.iter().copied()))
            .ok_or(AuthError::InvalidToken)
    }
}
