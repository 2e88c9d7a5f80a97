pub mod value_object;

pub use value_object::{AuthMode, Permissions, Role};

use serde::Serialize;
use serde_json::{Map, Value};

/// Caller resolved by the auth middleware; lives for one request.
#[derive(Clone, Debug, Serialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    pub permissions: Permissions,
    pub auth_mode: AuthMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<Map<String, Value>>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, auth_mode: AuthMode) -> Self {
        let permissions = role.permissions();
        Self {
            user_id: user_id.into(),
            role,
            permissions,
            auth_mode,
            claims: None,
        }
    }

    pub fn local_admin() -> Self {
        Self::new("local", Role::Admin, AuthMode::Local)
    }

    pub fn with_claims(mut self, claims: Map<String, Value>) -> Self {
        self.claims = Some(claims);
        self
    }

    pub fn has(&self, permission: Permissions) -> bool {
        self.permissions.contains(permission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_derives_permissions_from_role() {
        let identity = Identity::new("alice", Role::Operator, AuthMode::ApiKey);
        assert!(identity.has(Permissions::APPROVE_REQUESTS));
        assert!(!identity.has(Permissions::SYSTEM_CONFIG));
        assert!(Identity::local_admin().has(Permissions::SYSTEM_CONFIG));
    }
}
