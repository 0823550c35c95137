//! Identity and permission resolution at handshake time.
//!
//! The room never authenticates anyone; it receives an [`Identity`] that an
//! [`Authenticator`] resolved from the connection request.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, ConfigError};
use crate::protocol::Permission;

/// Fixed user accepted in development mode when no credentials are sent.
pub const DEV_USER_ID: Uuid = Uuid::from_u128(0x11111111_1111_1111_1111_111111111111);

/// Resolved user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub display_name: String,
    pub permission: Permission,
}

/// Raw credentials extracted from the upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// `token` query parameter
    pub token: Option<String>,
    /// `X-User-ID` header, else `userId` query parameter
    pub user_id: Option<String>,
}

/// Identity/permission collaborator.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, doc_id: Uuid, credentials: &Credentials) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct AuthTable {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    grants: Vec<GrantEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    id: Uuid,
    name: String,
    #[serde(default)]
    tokens: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GrantEntry {
    doc: Uuid,
    user: Uuid,
    permission: Permission,
}

/// Table-driven authenticator.
///
/// Tokens map to users, users to display names, `(doc, user)` pairs to
/// permissions. With development mode enabled, a bare user id is trusted,
/// ungranted users get `view`, and a request without credentials becomes
/// [`DEV_USER_ID`].
#[derive(Debug, Default, Clone)]
pub struct StaticAuthenticator {
    users: HashMap<Uuid, String>,
    tokens: HashMap<String, Uuid>,
    grants: HashMap<(Uuid, Uuid), Permission>,
    dev_mode: bool,
}

impl StaticAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON table:
    ///
    /// ```json
    /// {
    ///   "users": [{ "id": "...", "name": "Alice", "tokens": ["secret"] }],
    ///   "grants": [{ "doc": "...", "user": "...", "permission": "edit" }]
    /// }
    /// ```
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let table: AuthTable =
            serde_json::from_str(json).map_err(|e| ConfigError::InvalidAuthTable(e.to_string()))?;
        let mut auth = Self::new();
        for user in table.users {
            for token in user.tokens {
                auth.add_token(token, user.id);
            }
            auth.add_user(user.id, user.name);
        }
        for grant in table.grants {
            if !auth.users.contains_key(&grant.user) {
                return Err(ConfigError::InvalidAuthTable(format!(
                    "grant for unknown user {}",
                    grant.user
                )));
            }
            auth.grant(grant.doc, grant.user, grant.permission);
        }
        log::info!(
            "Loaded auth table: {} users, {} tokens, {} grants",
            auth.users.len(),
            auth.tokens.len(),
            auth.grants.len()
        );
        Ok(auth)
    }

    pub fn with_dev_mode(mut self, enabled: bool) -> Self {
        self.dev_mode = enabled;
        self
    }

    pub fn add_user(&mut self, user_id: Uuid, display_name: impl Into<String>) {
        self.users.insert(user_id, display_name.into());
    }

    pub fn add_token(&mut self, token: impl Into<String>, user_id: Uuid) {
        self.tokens.insert(token.into(), user_id);
    }

    pub fn grant(&mut self, doc_id: Uuid, user_id: Uuid, permission: Permission) {
        self.grants.insert((doc_id, user_id), permission);
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    fn display_name(&self, user_id: Uuid) -> Result<String, AuthError> {
        match self.users.get(&user_id) {
            Some(name) => Ok(name.clone()),
            None if self.dev_mode && user_id == DEV_USER_ID => Ok("Developer".to_string()),
            None => Err(AuthError::UnknownUser(user_id)),
        }
    }

    fn resolve_token(&self, doc_id: Uuid, token: &str) -> Result<Identity, AuthError> {
        let user_id = *self.tokens.get(token).ok_or(AuthError::InvalidToken)?;
        let display_name = self.display_name(user_id)?;
        let permission = *self
            .grants
            .get(&(doc_id, user_id))
            .ok_or(AuthError::Forbidden { user: user_id, doc: doc_id })?;
        Ok(Identity { user_id, display_name, permission })
    }

    fn resolve_dev(&self, doc_id: Uuid, user_id: Option<&str>) -> Result<Identity, AuthError> {
        let user_id = match user_id.filter(|s| !s.is_empty()) {
            Some(raw) => Uuid::parse_str(raw).map_err(|_| AuthError::InvalidToken)?,
            None => DEV_USER_ID,
        };
        let display_name = self.display_name(user_id)?;
        let permission = self
            .grants
            .get(&(doc_id, user_id))
            .copied()
            .unwrap_or(Permission::View);
        Ok(Identity { user_id, display_name, permission })
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, doc_id: Uuid, credentials: &Credentials) -> Result<Identity, AuthError> {
        if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
            match self.resolve_token(doc_id, token) {
                Ok(identity) => return Ok(identity),
                Err(AuthError::InvalidToken) if self.dev_mode => {
                    log::debug!("Invalid token for document {}, trying development identity", doc_id);
                }
                Err(e) => return Err(e),
            }
        }

        if self.dev_mode {
            return self.resolve_dev(doc_id, credentials.user_id.as_deref());
        }

        if credentials.token.is_none() {
            Err(AuthError::MissingCredentials)
        } else {
            Err(AuthError::InvalidToken)
        }
    }
}
