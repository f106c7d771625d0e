//! Identity provider contract.
//!
//! Resolves a display name (or email) plus secret to an opaque principal with
//! a profile. Display-name and email uniqueness are enforced here, not by the
//! room core.

use crate::error::{Error, IdentityError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub profile: Profile,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.profile.role == Role::Admin
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `identifier` is a display name or an email address.
    async fn authenticate(
        &self,
        identifier: &str,
        secret: &str,
    ) -> std::result::Result<Principal, IdentityError>;

    async fn register(
        &self,
        email: &str,
        display_name: &str,
        secret: &str,
    ) -> std::result::Result<Principal, IdentityError>;
}

/// The locally signed-in user, if any.
#[derive(Debug, Clone, Default)]
pub struct AuthSession {
    principal: Option<Principal>,
}

impl AuthSession {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn signed_in(principal: Principal) -> Self {
        Self {
            principal: Some(principal),
        }
    }

    pub async fn sign_in(
        provider: &dyn IdentityProvider,
        identifier: &str,
        secret: &str,
    ) -> Result<Self> {
        let principal = provider.authenticate(identifier.trim(), secret).await?;
        info!(principal = %principal.id, "signed in");
        Ok(Self::signed_in(principal))
    }

    pub fn sign_out(&mut self) {
        self.principal = None;
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn require(&self) -> Result<&Principal> {
        self.principal.as_ref().ok_or(Error::NotAuthenticated)
    }
}

struct Account {
    principal: Principal,
    email: String,
    secret_hash: String,
}

/// In-process identity provider with bcrypt-hashed secrets.
pub struct MemoryIdentityProvider {
    accounts: Mutex<HashMap<String, Account>>,
    cost: u32,
}

impl Default for MemoryIdentityProvider {
    fn default() -> Self {
        Self::with_cost(bcrypt::DEFAULT_COST)
    }
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower costs keep tests fast; bcrypt's minimum is 4.
    pub fn with_cost(cost: u32) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            cost,
        }
    }

    /// Grants the admin role. Admins are provisioned out of band.
    pub async fn promote(&self, principal_id: &str) -> std::result::Result<Principal, IdentityError> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts
            .get_mut(principal_id)
            .ok_or(IdentityError::NotFound)?;
        account.principal.profile.role = Role::Admin;
        Ok(account.principal.clone())
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn authenticate(
        &self,
        identifier: &str,
        secret: &str,
    ) -> std::result::Result<Principal, IdentityError> {
        let accounts = self.accounts.lock().await;
        let account = accounts
            .values()
            .find(|a| a.principal.profile.display_name == identifier || a.email == identifier)
            .ok_or(IdentityError::NotFound)?;

        let valid = bcrypt::verify(secret, &account.secret_hash)
            .map_err(|e| IdentityError::Backend(e.to_string()))?;
        if !valid {
            debug!(identifier, "credential rejected");
            return Err(IdentityError::InvalidCredential);
        }
        Ok(account.principal.clone())
    }

    async fn register(
        &self,
        email: &str,
        display_name: &str,
        secret: &str,
    ) -> std::result::Result<Principal, IdentityError> {
        let mut accounts = self.accounts.lock().await;
        if accounts
            .values()
            .any(|a| a.principal.profile.display_name == display_name)
        {
            return Err(IdentityError::DuplicateDisplayName(display_name.to_string()));
        }
        if accounts.values().any(|a| a.email.eq_ignore_ascii_case(email)) {
            return Err(IdentityError::DuplicateEmail(email.to_string()));
        }

        let secret_hash =
            bcrypt::hash(secret, self.cost).map_err(|e| IdentityError::Backend(e.to_string()))?;
        let principal = Principal {
            id: uuid::Uuid::new_v4().simple().to_string(),
            profile: Profile {
                display_name: display_name.to_string(),
                role: Role::User,
            },
        };
        accounts.insert(
            principal.id.clone(),
            Account {
                principal: principal.clone(),
                email: email.to_string(),
                secret_hash,
            },
        );
        info!(principal = %principal.id, display_name, "registered");
        Ok(principal)
    }
}
