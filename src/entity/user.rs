//! User Record - experiment owner with a run quota

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Role attached by the identity provider. Stored for attribution only;
/// authorization happens outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Operator with full access
    Admin,
    /// Can create experiments
    Researcher,
    /// Read-only
    Viewer,
}

/// Registered user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRecord {
    user_id: String,
    email: String,
    role: UserRole,
    quota_remaining: u32,
    disabled: bool,
}

impl UserRecord {
    /// Create an enabled user.
    #[must_use]
    pub fn new(user_id: impl Into<String>, email: impl Into<String>, role: UserRole, quota: u32) -> Self {
        Self {
            user_id: user_id.into(),
            email: email.into(),
            role,
            quota_remaining: quota,
            disabled: false,
        }
    }

    /// Get the user ID.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Get the email address.
    #[must_use]
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Get the role.
    #[must_use]
    pub const fn role(&self) -> UserRole {
        self.role
    }

    /// Experiments the user may still create.
    #[must_use]
    pub const fn quota_remaining(&self) -> u32 {
        self.quota_remaining
    }

    /// Whether the account is disabled.
    #[must_use]
    pub const fn disabled(&self) -> bool {
        self.disabled
    }

    /// Return a disabled copy.
    #[must_use]
    pub fn into_disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Take one experiment from the quota.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the user is disabled, a viewer, or out of quota
    pub fn consume_quota(&mut self) -> Result<()> {
        if self.disabled {
            return Err(Error::Validation(format!("user {} is disabled", self.user_id)));
        }
        if self.role == UserRole::Viewer {
            return Err(Error::Validation(format!(
                "user {} is a viewer and cannot create experiments",
                self.user_id
            )));
        }
        if self.quota_remaining == 0 {
            return Err(Error::Validation(format!(
                "user {} has no remaining experiment quota",
                self.user_id
            )));
        }
        self.quota_remaining -= 1;
        Ok(())
    }
}
