//! Caller identity as handed over by the session layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ServiceError;

/// The authenticated user performing an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub is_admin: bool,
}

impl Actor {
    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }

    pub fn require_admin(&self) -> Result<(), ServiceError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(
                "Administrator privileges required".to_string(),
            ))
        }
    }

    /// Passes for the owner of a resource or an administrator.
    pub fn require_owner_or_admin(&self, owner_id: Uuid, what: &str) -> Result<(), ServiceError> {
        if self.user_id == owner_id || self.is_admin {
            Ok(())
        } else {
            Err(ServiceError::Forbidden(format!(
                "Only the owner may modify this {}",
                what
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn admin_check() {
        let id = Uuid::new_v4();
        assert!(Actor::admin(id).require_admin().is_ok());
        assert_matches!(
            Actor::user(id).require_admin(),
            Err(ServiceError::Forbidden(_))
        );
    }

    #[test]
    fn owner_or_admin() {
        let owner = Uuid::new_v4();
        assert!(Actor::user(owner)
            .require_owner_or_admin(owner, "listing")
            .is_ok());
        assert!(Actor::admin(Uuid::new_v4())
            .require_owner_or_admin(owner, "listing")
            .is_ok());
        assert!(Actor::user(Uuid::new_v4())
            .require_owner_or_admin(owner, "listing")
            .is_err());
    }
}
