//! Propose / confirm / execute workflow for whitelisted writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::access::AccessScope;
use crate::collab::{Authorizer, DataApi, DataApiBackend};
use crate::error::{ParleyError, Result};
use crate::model::{
    classify_action, ActionClass, ActionCommand, ActionProposal, ActionRequest, ActionResult,
    ActionState, Rejection,
};

pub struct ActionExecutor {
    data_api: Arc<DataApiBackend>,
    authorizer: Arc<dyn Authorizer>,
    /// Proposals awaiting confirmation, keyed by id.
    pending: DashMap<Uuid, ActionProposal>,
    ttl: Duration,
}

impl ActionExecutor {
    pub fn new(data_api: Arc<DataApiBackend>, authorizer: Arc<dyn Authorizer>, ttl: Duration) -> Self {
        Self {
            data_api,
            authorizer,
            pending: DashMap::new(),
            ttl,
        }
    }

    /// Build a proposal for `request` and run every check that can reject it.
    ///
    /// A rejection is returned as `Ok` with the proposal in
    /// [`ActionState::Rejected`]; only collaborator failures are `Err`.
    pub async fn propose(
        &self,
        request: &ActionRequest,
        session_id: &str,
        scope: &AccessScope,
    ) -> Result<ActionProposal> {
        let mut proposal = ActionProposal::new(
            session_id,
            scope.user_id.clone(),
            scope.client_id.clone(),
            request.action.clone(),
            request.target_ref.clone(),
            request.parameters.clone(),
        );

        if let Some(rejection) = self.check(&proposal, scope).await? {
            proposal.reject(rejection)?;
            self.finish(&proposal);
            return Ok(proposal);
        }

        tracing::info!(
            proposal_id = %proposal.proposal_id,
            session_id = %proposal.session_id,
            user_id = %proposal.user_id,
            action = %proposal.action,
            "action proposed"
        );
        self.pending.insert(proposal.proposal_id, proposal.clone());
        Ok(proposal)
    }

    async fn check(&self, proposal: &ActionProposal, scope: &AccessScope) -> Result<Option<Rejection>> {
        // Destructive names are refused before anything else is looked at.
        let action_type = match classify_action(&proposal.action) {
            ActionClass::Destructive(_) => return Ok(Some(Rejection::Destructive)),
            ActionClass::Unknown(_) => return Ok(Some(Rejection::NotWhitelisted)),
            ActionClass::Allowed(t) if !t.is_mutating() => {
                return Ok(Some(Rejection::NotWhitelisted))
            }
            ActionClass::Allowed(t) => t,
        };
        if !scope.permits_action(action_type) {
            return Ok(Some(Rejection::InsufficientPermission));
        }
        let Some(target) = &proposal.target else {
            return Ok(Some(Rejection::MissingTarget));
        };
        if !scope.permits_type(target.entity_type) {
            return Ok(Some(Rejection::InsufficientPermission));
        }
        if let Some(missing) = action_type
            .required_parameters()
            .iter()
            .find(|p| proposal.parameters.get(**p).map_or(true, |v| v.trim().is_empty()))
        {
            return Ok(Some(Rejection::MissingParameter((*missing).to_string())));
        }

        let record = match self.data_api.get(&scope.client_id, target).await? {
            Some(r) if r.client_id == scope.client_id => r,
            _ => return Ok(Some(Rejection::TargetNotFound)),
        };
        if !self.authorizer.can_edit(&scope.principal(), &record) {
            return Ok(Some(Rejection::InsufficientPermission));
        }
        Ok(None)
    }

    /// Proposed → Confirmed. Only the session and user that created the
    /// proposal may confirm it, and only by echoing its exact parameters.
    ///
    /// The confirmed proposal leaves the pending set; hand it to
    /// [`execute`](Self::execute).
    pub fn confirm(
        &self,
        proposal_id: Uuid,
        session_id: &str,
        user_id: &str,
        echoed: &BTreeMap<String, String>,
    ) -> Result<ActionProposal> {
        let not_found = || ParleyError::NotFound(format!("proposal {proposal_id}"));
        let (_, mut proposal) = self.pending.remove(&proposal_id).ok_or_else(not_found)?;

        if self.is_stale(&proposal) {
            tracing::debug!(%proposal_id, "confirm: proposal expired");
            return Err(not_found());
        }
        if proposal.session_id != session_id || proposal.user_id != user_id {
            self.pending.insert(proposal_id, proposal);
            return Err(not_found());
        }
        if let Err(e) = proposal.confirm(echoed) {
            self.pending.insert(proposal_id, proposal);
            return Err(e);
        }
        Ok(proposal)
    }

    /// Single attempt against the data API. A failed write is reported with
    /// a retry suggestion and the proposal is not kept.
    pub async fn execute(&self, mut proposal: ActionProposal) -> Result<ActionResult> {
        let (Some(action), Some(target)) = (proposal.action_type, proposal.target.clone()) else {
            return Err(ParleyError::Validation(format!(
                "proposal {} has no executable action",
                proposal.proposal_id
            )));
        };
        if proposal.state != ActionState::Confirmed {
            return Err(ParleyError::Validation(format!(
                "proposal {} is {}, not confirmed",
                proposal.proposal_id, proposal.state
            )));
        }

        let command = ActionCommand {
            action,
            target,
            parameters: proposal.parameters.clone(),
            requested_by: proposal.user_id.clone(),
            proposal_id: proposal.proposal_id,
        };

        let result = match self.data_api.write(&proposal.client_id, &command).await {
            Ok(outcome) => {
                proposal.mark_executed(outcome.message.clone())?;
                ActionResult {
                    proposal,
                    message: outcome.message,
                    retry_suggestion: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    proposal_id = %proposal.proposal_id,
                    action = %proposal.action,
                    error = %e,
                    "action execution failed"
                );
                proposal.mark_failed(e.to_string())?;
                let message = format!("I couldn't complete {}: {e}", proposal.describe());
                ActionResult {
                    proposal,
                    message,
                    retry_suggestion: Some(
                        "Nothing was changed. Ask again to get a fresh proposal once the \
                         service is reachable."
                            .into(),
                    ),
                }
            }
        };
        self.finish(&result.proposal);
        Ok(result)
    }

    /// Withdraw a pending proposal. Same ownership rule as `confirm`.
    pub fn cancel(&self, proposal_id: Uuid, session_id: &str, user_id: &str) -> Result<ActionProposal> {
        let owned = self
            .pending
            .remove_if(&proposal_id, |_, p| {
                p.session_id == session_id && p.user_id == user_id
            });
        let Some((_, mut proposal)) = owned else {
            return Err(ParleyError::NotFound(format!("proposal {proposal_id}")));
        };
        proposal.reject(Rejection::Cancelled)?;
        self.finish(&proposal);
        Ok(proposal)
    }

    /// Drop proposals that outlived the session TTL. Returns how many.
    pub fn prune_expired(&self) -> usize {
        let before = self.pending.len();
        let now = Utc::now();
        self.pending.retain(|_, p| now - p.created_at < self.ttl);
        before.saturating_sub(self.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn is_stale(&self, proposal: &ActionProposal) -> bool {
        Utc::now() - proposal.created_at >= self.ttl
    }

    fn finish(&self, proposal: &ActionProposal) {
        metrics::counter!(
            crate::metrics::ACTIONS_TOTAL,
            "action" => proposal.action.clone(),
            "state" => proposal.state.to_string()
        )
        .increment(1);
        tracing::info!(
            proposal_id = %proposal.proposal_id,
            action = %proposal.action,
            state = %proposal.state,
            reason = proposal.reason.as_deref().unwrap_or(""),
            "action finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{InMemoryDataApi, RoleAuthorizer};
    use crate::model::{EntityRef, Principal, Role};

    fn executor() -> (ActionExecutor, Arc<DataApiBackend>) {
        let data = Arc::new(DataApiBackend::Memory(InMemoryDataApi::demo()));
        let exec = ActionExecutor::new(
            Arc::clone(&data),
            Arc::new(RoleAuthorizer),
            Duration::minutes(30),
        );
        (exec, data)
    }

    fn scope(user: &str, role: Role) -> AccessScope {
        AccessScope::derive(&Principal::new(user, "acme", role)).unwrap()
    }

    fn request(action: &str, target: &str, params: &[(&str, &str)]) -> ActionRequest {
        ActionRequest {
            action: action.into(),
            target_ref: EntityRef::parse(target),
            parameters: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_destructive_rejected_for_every_role() {
        let (exec, _) = executor();
        for role in [Role::Admin, Role::Manager, Role::Developer, Role::Tester, Role::Viewer] {
            for action in ["delete_project", "change_user_role", "remove_team_member"] {
                let p = exec
                    .propose(&request(action, "PRJ-3", &[]), "s1", &scope("alice", role))
                    .await
                    .unwrap();
                assert_eq!(p.state, ActionState::Rejected, "{action} as {role}");
                assert_eq!(p.rejection, Some(Rejection::Destructive));
            }
        }
        assert_eq!(exec.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tester_without_edit_rights_rejected() {
        let (exec, _) = executor();
        // TSK-43 is assigned to bob.
        let p = exec
            .propose(
                &request("update_status", "TSK-43", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Tester),
            )
            .await
            .unwrap();
        assert_eq!(p.state, ActionState::Rejected);
        assert_eq!(p.reason.as_deref(), Some("insufficient permission"));
        assert!(matches!(
            p.rejection.as_ref().and_then(Rejection::as_error),
            Some(ParleyError::AccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_viewer_cannot_write() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("create_comment", "TSK-42", &[("body", "hi")]),
                "s1",
                &scope("alice", Role::Viewer),
            )
            .await
            .unwrap();
        assert_eq!(p.rejection, Some(Rejection::InsufficientPermission));
    }

    #[tokio::test]
    async fn test_other_client_target_not_found() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("update_status", "TSK-900", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Admin),
            )
            .await
            .unwrap();
        assert_eq!(p.rejection, Some(Rejection::TargetNotFound));
    }

    #[tokio::test]
    async fn test_missing_parameter_rejected() {
        let (exec, _) = executor();
        let p = exec
            .propose(&request("create_comment", "TSK-42", &[]), "s1", &scope("alice", Role::Admin))
            .await
            .unwrap();
        assert_eq!(p.rejection, Some(Rejection::MissingParameter("body".into())));
    }

    #[tokio::test]
    async fn test_round_trip_executes_once() {
        let (exec, data) = executor();
        let p = exec
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        assert_eq!(p.state, ActionState::Proposed);

        let confirmed = exec
            .confirm(p.proposal_id, "s1", "alice", &params(&[("status", "done")]))
            .unwrap();
        assert_eq!(confirmed.state, ActionState::Confirmed);

        let result = exec.execute(confirmed).await.unwrap();
        assert_eq!(result.proposal.state, ActionState::Executed);
        assert!(result.retry_suggestion.is_none());

        let memory = data.as_memory().unwrap();
        assert_eq!(memory.writes().len(), 1);
        assert_eq!(memory.writes()[0].proposal_id, p.proposal_id);
        assert_eq!(
            memory.record("acme", "TSK-42").unwrap().status.as_deref(),
            Some("done")
        );

        // Consumed: a second confirm finds nothing.
        assert!(matches!(
            exec.confirm(p.proposal_id, "s1", "alice", &params(&[("status", "done")])),
            Err(ParleyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_requires_matching_parameters() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        let err = exec
            .confirm(p.proposal_id, "s1", "alice", &params(&[("status", "blocked")]))
            .unwrap_err();
        assert!(matches!(err, ParleyError::Validation(_)));
        // Still pending after a bad echo.
        assert_eq!(exec.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_confirm_from_other_session_not_found() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        let echoed = params(&[("status", "done")]);
        assert!(exec.confirm(p.proposal_id, "s2", "alice", &echoed).is_err());
        assert!(exec.confirm(p.proposal_id, "s1", "mallory", &echoed).is_err());
        assert!(exec.confirm(p.proposal_id, "s1", "alice", &echoed).is_ok());
    }

    #[tokio::test]
    async fn test_failed_write_is_discarded_with_suggestion() {
        let (exec, data) = executor();
        data.as_memory().unwrap().set_fail_writes(true);
        let p = exec
            .propose(
                &request("create_comment", "TSK-42", &[("body", "on it")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        let confirmed = exec
            .confirm(p.proposal_id, "s1", "alice", &params(&[("body", "on it")]))
            .unwrap();
        let result = exec.execute(confirmed).await.unwrap();
        assert_eq!(result.proposal.state, ActionState::Failed);
        assert!(result.retry_suggestion.is_some());
        assert_eq!(exec.pending_count(), 0);
        assert!(data.as_memory().unwrap().writes().is_empty());
    }

    #[tokio::test]
    async fn test_execute_requires_confirmation() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        assert!(exec.execute(p).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_prune() {
        let (exec, _) = executor();
        let p = exec
            .propose(
                &request("set_reminder", "TSK-42", &[("remind_at", "2026-11-01T09:00:00Z")]),
                "s1",
                &scope("alice", Role::Developer),
            )
            .await
            .unwrap();
        assert!(exec.cancel(p.proposal_id, "s2", "alice").is_err());
        let cancelled = exec.cancel(p.proposal_id, "s1", "alice").unwrap();
        assert_eq!(cancelled.rejection, Some(Rejection::Cancelled));
        assert!(exec.cancel(p.proposal_id, "s1", "alice").is_err());

        let short = ActionExecutor::new(
            Arc::new(DataApiBackend::Memory(InMemoryDataApi::demo())),
            Arc::new(RoleAuthorizer),
            Duration::zero(),
        );
        short
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Admin),
            )
            .await
            .unwrap();
        assert_eq!(short.prune_expired(), 1);
        assert_eq!(short.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_data_api_outage_propagates() {
        let (exec, data) = executor();
        data.as_memory().unwrap().set_unavailable(true);
        let err = exec
            .propose(
                &request("update_status", "TSK-42", &[("status", "done")]),
                "s1",
                &scope("alice", Role::Admin),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::DownstreamUnavailable(_)));
    }
}
