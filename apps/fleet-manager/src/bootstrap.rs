//! Permission bootstrap: makes sure the engine's session can do what it needs on
//! an instance, provisioning a dedicated role when the panel allows it.
//!
//! ```text
//! UNCHECKED -> SESSION_PERMS_OK -> ROLE_CHECKED -> READY
//!           \-> SESSION_PERMS_MISSING            \-> FAILED
//! ```
//!
//! `READY`, `FAILED` and `SESSION_PERMS_MISSING` are sticky: running the machine
//! again on such an instance makes no remote calls.

use panel_client::models::{
    parse_action_result, parse_bool_result, parse_role_ids, parse_user_info, UserInfo,
};
use panel_client::{ApiError, ApiGateway, InstanceId};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::instance::ManagedInstance;
use crate::metrics;

pub const HAS_PERMISSION_ENDPOINT: &str = "Core/CurrentSessionHasPermission";
pub const ROLE_IDS_ENDPOINT: &str = "Core/GetRoleIds";
pub const USER_INFO_ENDPOINT: &str = "Core/GetAMPUserInfo";
pub const CREATE_ROLE_ENDPOINT: &str = "Core/CreateRole";
pub const ROLE_MEMBERSHIP_ENDPOINT: &str = "Core/SetAMPUserRoleMembership";
pub const ROLE_PERMISSION_ENDPOINT: &str = "Core/SetAMPRolePermission";

/// Endpoints that change remote state. Nothing else in this module writes.
pub const PROVISIONING_ENDPOINTS: &[&str] = &[
    CREATE_ROLE_ENDPOINT,
    ROLE_MEMBERSHIP_ENDPOINT,
    ROLE_PERMISSION_ENDPOINT,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPhase {
    Unchecked,
    SessionPermsOk,
    SessionPermsMissing,
    RoleChecked,
    Ready,
    Failed,
}

impl BootstrapPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapPhase::Unchecked => "unchecked",
            BootstrapPhase::SessionPermsOk => "session_perms_ok",
            BootstrapPhase::SessionPermsMissing => "session_perms_missing",
            BootstrapPhase::RoleChecked => "role_checked",
            BootstrapPhase::Ready => "ready",
            BootstrapPhase::Failed => "failed",
        }
    }

    /// Phases the machine never leaves on its own.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            BootstrapPhase::Ready | BootstrapPhase::Failed | BootstrapPhase::SessionPermsMissing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootstrapState {
    pub instance_id: InstanceId,
    pub phase: BootstrapPhase,
    pub has_required_session_permissions: bool,
    pub role_exists: bool,
    pub role_assigned_to_caller: bool,
    pub role_id: Option<String>,
    pub super_admin_role_id: Option<String>,
    /// First required node the session lacked, when the check failed.
    pub missing_permission: Option<String>,
    /// Operator-facing explanation when `phase` is `Failed`.
    pub failure: Option<String>,
}

impl BootstrapState {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            phase: BootstrapPhase::Unchecked,
            has_required_session_permissions: false,
            role_exists: false,
            role_assigned_to_caller: false,
            role_id: None,
            super_admin_role_id: None,
            missing_permission: None,
            failure: None,
        }
    }

    /// Console streaming needs a ready bootstrap with the session permissions
    /// confirmed.
    pub fn is_streamable(&self) -> bool {
        self.phase == BootstrapPhase::Ready && self.has_required_session_permissions
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("session user {user} lacks {node} on the panel; grant it before starting the manager")]
    CorePermissionMissing { node: String, user: String },
    #[error("panel bootstrap failed: {0}")]
    CoreFailed(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl BootstrapError {
    pub fn is_fatal(&self) -> bool {
        match self {
            BootstrapError::CorePermissionMissing { .. } | BootstrapError::CoreFailed(_) => true,
            BootstrapError::Api(err) => err.is_fatal(),
        }
    }
}

/// Provisioning step that could not complete; becomes a `FAILED` state.
struct StepFailure(String);

#[derive(Clone)]
pub struct PermissionBootstrap {
    gateway: ApiGateway,
    role_name: String,
    super_admin_role_name: String,
    elevated: bool,
}

impl PermissionBootstrap {
    pub fn new(
        gateway: ApiGateway,
        role_name: impl Into<String>,
        super_admin_role_name: impl Into<String>,
        elevated: bool,
    ) -> Self {
        Self {
            gateway,
            role_name: role_name.into(),
            super_admin_role_name: super_admin_role_name.into(),
            elevated,
        }
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    /// Drives the instance to a settled phase and stores the result on it.
    ///
    /// API failures leave the stored state where it was, so an offline instance
    /// stays `UNCHECKED` and is picked up again by a later reconciliation pass.
    /// One unauthorized reply restarts the evaluation from the permission check
    /// with a fresh session; a second is returned to the caller.
    pub async fn run(&self, instance: &ManagedInstance) -> Result<BootstrapState, BootstrapError> {
        let current = instance.bootstrap_state();
        if current.phase.is_settled() {
            debug!(
                instance = %instance.id(),
                phase = current.phase.as_str(),
                "bootstrap already settled"
            );
            return Ok(current);
        }

        if self.elevated {
            let mut state = BootstrapState::new(instance.id().clone());
            state.has_required_session_permissions = true;
            state.phase = BootstrapPhase::Ready;
            self.record(instance, &state);
            info!(instance = %instance.id(), "elevated mode; skipping permission bootstrap");
            return Ok(state);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.evaluate(instance).await {
                Err(BootstrapError::Api(ApiError::Unauthorized { endpoint, .. }))
                    if attempt == 1 =>
                {
                    debug!(
                        instance = %instance.id(),
                        endpoint = %endpoint,
                        "session rejected during bootstrap; re-evaluating"
                    );
                }
                outcome => return outcome,
            }
        }
    }

    /// Puts a settled instance back to `UNCHECKED` so the next
    /// [`PermissionBootstrap::run`] evaluates it from scratch. Used when the
    /// panel keeps refusing a session the machine had already cleared.
    pub fn reopen(instance: &ManagedInstance) {
        let previous = instance.bootstrap_phase();
        let state = BootstrapState::new(instance.id().clone());
        metrics::BOOTSTRAP_OUTCOMES
            .with_label_values(&[state.phase.as_str()])
            .inc();
        instance.set_bootstrap(state);
        info!(
            instance = %instance.id(),
            previous = previous.as_str(),
            "permission bootstrap reopened"
        );
    }

    async fn evaluate(&self, instance: &ManagedInstance) -> Result<BootstrapState, BootstrapError> {
        let mut state = BootstrapState::new(instance.id().clone());
        let username = self.gateway.sessions().username().to_string();

        if let Some(node) = self.first_missing_permission(instance).await? {
            state.phase = BootstrapPhase::SessionPermsMissing;
            state.missing_permission = Some(node.clone());
            self.record(instance, &state);
            if instance.is_core() {
                return Err(BootstrapError::CorePermissionMissing { node, user: username });
            }
            warn!(
                instance = %instance.id(),
                user = %username,
                permission = %node,
                "session lacks a required permission; console streaming disabled for this instance"
            );
            return Ok(state);
        }
        state.has_required_session_permissions = true;
        state.phase = BootstrapPhase::SessionPermsOk;
        debug!(instance = %instance.id(), "session permissions present");

        let roles = parse_role_ids(&self.call(instance, ROLE_IDS_ENDPOINT, Value::Null).await?);
        let find_role = |wanted: &str| {
            roles
                .iter()
                .find(|(_, name)| name.as_str() == wanted)
                .map(|(id, _)| id.clone())
        };
        state.role_id = find_role(&self.role_name);
        state.super_admin_role_id = find_role(&self.super_admin_role_name);
        state.role_exists = state.role_id.is_some();

        let user = parse_user_info(
            &self
                .call(instance, USER_INFO_ENDPOINT, json!({ "Username": username }))
                .await?,
        );
        let holds = |role: &Option<String>| {
            role.as_ref()
                .map(|id| user.roles.iter().any(|held| held == id))
                .unwrap_or(false)
        };
        state.role_assigned_to_caller = holds(&state.role_id);
        let holds_super_admin = holds(&state.super_admin_role_id);
        state.phase = BootstrapPhase::RoleChecked;
        debug!(
            instance = %instance.id(),
            role_exists = state.role_exists,
            role_assigned = state.role_assigned_to_caller,
            super_admin = holds_super_admin,
            "role membership checked"
        );

        let provisioned = match (state.role_id.clone(), state.role_assigned_to_caller) {
            (None, _) if instance.is_core() => {
                self.create_and_provision(instance, &user, &mut state).await?
            }
            (None, _) => Ok(()),
            (Some(_), true) => Ok(()),
            (Some(role_id), false) if holds_super_admin => {
                self.assign_and_provision(instance, &user, &role_id, &mut state).await?
            }
            (Some(_), false) => Err(StepFailure(format!(
                "user '{username}' does not hold role '{}' and is not a member of '{}'; \
                 add the role under Configuration > User Management > {username} > Roles",
                self.role_name, self.super_admin_role_name
            ))),
        };

        match provisioned {
            Ok(()) => {
                state.phase = BootstrapPhase::Ready;
                self.record(instance, &state);
                info!(instance = %instance.id(), role = ?state.role_id, "bootstrap ready");
                Ok(state)
            }
            Err(StepFailure(reason)) => {
                state.phase = BootstrapPhase::Failed;
                state.failure = Some(reason.clone());
                self.record(instance, &state);
                if instance.is_core() {
                    return Err(BootstrapError::CoreFailed(reason));
                }
                warn!(
                    instance = %instance.id(),
                    reason = %reason,
                    "bootstrap failed; instance left without console streaming"
                );
                Ok(state)
            }
        }
    }

    async fn first_missing_permission(
        &self,
        instance: &ManagedInstance,
    ) -> Result<Option<String>, ApiError> {
        for node in instance.behavior().required_permissions() {
            if node.starts_with('-') {
                continue;
            }
            let reply = self
                .call(instance, HAS_PERMISSION_ENDPOINT, json!({ "PermissionNode": node }))
                .await?;
            if !parse_bool_result(&reply) {
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    async fn create_and_provision(
        &self,
        instance: &ManagedInstance,
        user: &UserInfo,
        state: &mut BootstrapState,
    ) -> Result<Result<(), StepFailure>, ApiError> {
        let reply = self
            .call(
                instance,
                CREATE_ROLE_ENDPOINT,
                json!({ "Name": self.role_name, "AsCommonRole": false }),
            )
            .await?;
        let created = parse_action_result(&reply);
        let role_id = match (&created.result, created.is_failure()) {
            (Value::String(id), false) if !id.is_empty() => id.clone(),
            _ => {
                return Ok(Err(StepFailure(format!(
                    "could not create role '{}': {}",
                    self.role_name,
                    created.reason.as_deref().unwrap_or("no role id returned")
                ))))
            }
        };
        info!(
            instance = %instance.id(),
            role = %self.role_name,
            role_id = %role_id,
            "created dedicated role"
        );
        state.role_id = Some(role_id.clone());
        state.role_exists = true;
        self.assign_and_provision(instance, user, &role_id, state).await
    }

    async fn assign_and_provision(
        &self,
        instance: &ManagedInstance,
        user: &UserInfo,
        role_id: &str,
        state: &mut BootstrapState,
    ) -> Result<Result<(), StepFailure>, ApiError> {
        let Some(user_id) = user.id.as_deref() else {
            return Ok(Err(StepFailure(format!(
                "panel did not report an id for user '{}'",
                self.gateway.sessions().username()
            ))));
        };
        let reply = self
            .call(
                instance,
                ROLE_MEMBERSHIP_ENDPOINT,
                json!({ "UserId": user_id, "RoleId": role_id, "IsMember": true }),
            )
            .await?;
        let assigned = parse_action_result(&reply);
        if assigned.is_failure() {
            return Ok(Err(StepFailure(format!(
                "could not assign role '{}': {}",
                self.role_name,
                assigned.reason.as_deref().unwrap_or("refused")
            ))));
        }
        state.role_assigned_to_caller = true;
        info!(
            instance = %instance.id(),
            role_id = %role_id,
            "assigned dedicated role to session user"
        );

        for node in instance.behavior().required_permissions() {
            let (node, enabled) = match node.strip_prefix('-') {
                Some(denied) => (denied.to_string(), false),
                None => (node, true),
            };
            let reply = self
                .call(
                    instance,
                    ROLE_PERMISSION_ENDPOINT,
                    json!({ "RoleId": role_id, "PermissionNode": node, "Enabled": enabled }),
                )
                .await?;
            let outcome = parse_action_result(&reply);
            if outcome.is_failure() {
                return Ok(Err(StepFailure(format!(
                    "could not set {node} on role '{}': {}",
                    self.role_name,
                    outcome.reason.as_deref().unwrap_or("refused")
                ))));
            }
        }
        debug!(instance = %instance.id(), role_id = %role_id, "role permissions provisioned");
        Ok(Ok(()))
    }

    async fn call(
        &self,
        instance: &ManagedInstance,
        endpoint: &str,
        params: Value,
    ) -> Result<Value, ApiError> {
        self.gateway.call(instance.session(), endpoint, params).await
    }

    fn record(&self, instance: &ManagedInstance, state: &BootstrapState) {
        metrics::BOOTSTRAP_OUTCOMES
            .with_label_values(&[state.phase.as_str()])
            .inc();
        instance.set_bootstrap(state.clone());
    }
}
