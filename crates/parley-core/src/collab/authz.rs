use crate::model::{EntityRecord, Principal, Role};

/// Per-entity edit rights, as decided by the host's RBAC rules.
pub trait Authorizer: Send + Sync {
    fn can_edit(&self, principal: &Principal, entity: &EntityRecord) -> bool;
}

/// Host RBAC: admins and managers edit anything in their client; developers
/// and testers edit what is assigned to them; viewers edit nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoleAuthorizer;

impl Authorizer for RoleAuthorizer {
    fn can_edit(&self, principal: &Principal, entity: &EntityRecord) -> bool {
        if !principal.client_ids.iter().any(|c| c == &entity.client_id) {
            return false;
        }
        match principal.role {
            Role::Admin | Role::Manager => true,
            Role::Developer | Role::Tester => {
                entity.assignee.as_deref() == Some(principal.user_id.as_str())
                    || entity.owner.as_deref() == Some(principal.user_id.as_str())
            }
            Role::Viewer => false,
        }
    }
}
