//! Per-request authorization filter derived from the verified principal.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::error::{ParleyError, Result};
use crate::model::{ActionType, EntityType, Principal, Role};

/// The client boundary plus what the caller's role may see and do.
///
/// Built fresh for every request and never stored. Retrieval and action
/// execution take it by reference, so there is no way to call them unscoped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessScope {
    pub client_id: String,
    pub user_id: String,
    pub role: Role,
    pub allowed_entity_types: BTreeSet<EntityType>,
    pub allowed_actions: BTreeSet<ActionType>,
}

impl AccessScope {
    /// Fails closed unless the principal names exactly one client.
    pub fn derive(principal: &Principal) -> Result<Self> {
        let client_id = match principal.client_ids.as_slice() {
            [only] if !only.trim().is_empty() => only.clone(),
            [] | [_] => {
                return Err(ParleyError::AccessDenied(
                    "principal is not bound to a client".into(),
                ))
            }
            _ => {
                return Err(ParleyError::AccessDenied(
                    "principal is bound to more than one client".into(),
                ))
            }
        };
        if principal.user_id.trim().is_empty() {
            return Err(ParleyError::AccessDenied("principal has no user id".into()));
        }

        Ok(Self {
            client_id,
            user_id: principal.user_id.clone(),
            role: principal.role,
            allowed_entity_types: entity_types_for(principal.role),
            allowed_actions: actions_for(principal.role),
        })
    }

    pub fn permits_type(&self, entity_type: EntityType) -> bool {
        self.allowed_entity_types.contains(&entity_type)
    }

    pub fn permits_action(&self, action: ActionType) -> bool {
        self.allowed_actions.contains(&action)
    }

    /// The principal this scope was derived from, narrowed to its one client.
    pub fn principal(&self) -> Principal {
        Principal::new(self.user_id.clone(), self.client_id.clone(), self.role)
    }
}

/// Actions a role may request at all. Per-entity edit rights are checked
/// separately at proposal time.
pub fn actions_for(role: Role) -> BTreeSet<ActionType> {
    use ActionType::*;
    let actions: &[ActionType] = match role {
        Role::Admin | Role::Manager | Role::Developer => &[
            View,
            DeepLink,
            UpdateStatus,
            CreateComment,
            SetReminder,
            LinkCommit,
        ],
        Role::Tester => &[View, DeepLink, UpdateStatus, CreateComment, SetReminder],
        Role::Viewer => &[View, DeepLink],
    };
    actions.iter().copied().collect()
}

pub fn entity_types_for(role: Role) -> BTreeSet<EntityType> {
    use EntityType::*;
    match role {
        Role::Admin | Role::Manager => EntityType::all(),
        Role::Developer | Role::Tester => [Project, Milestone, Task, Bug, Document]
            .into_iter()
            .collect(),
        Role::Viewer => [Project, Task, Document].into_iter().collect(),
    }
}
