use std::sync::Arc;
use std::time::Instant;

use panel_client::models::{parse_action_result, ConsoleEntry};
use panel_client::{ApiError, ApiGateway, ConfigurationError, InstanceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::{BootstrapError, BootstrapState, PermissionBootstrap};
use crate::config::EngineSettings;
use crate::console::ConsolePipeline;
use crate::instance::ManagedInstance;
use crate::registry::{InstanceRegistry, Reconciler, RosterEvent, RosterSnapshot};
use crate::store::{InstanceConfigStore, StoreError};
use crate::streaming::{StreamEngine, StreamError, StreamState};
use crate::variants::VariantRegistry;

pub const CONSOLE_INPUT_ENDPOINT: &str = "Core/SendConsoleMessage";
const ROSTER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(
        "discovery listed no instances {attempts} times in a row; \
         check the session user's permissions"
    )]
    DiscoveryStarvation { attempts: u32 },
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),
    #[error("{action} on {instance} was refused: {reason}")]
    ActionRefused {
        instance: InstanceId,
        action: &'static str,
        reason: String,
    },
}

impl FleetError {
    /// Conditions that stop the process rather than one instance.
    pub fn is_fatal(&self) -> bool {
        match self {
            FleetError::Api(err) => err.is_fatal(),
            FleetError::Configuration(_) | FleetError::DiscoveryStarvation { .. } => true,
            FleetError::Bootstrap(err) => err.is_fatal(),
            FleetError::Stream(_)
            | FleetError::Store(_)
            | FleetError::UnknownInstance(_)
            | FleetError::ActionRefused { .. } => false,
        }
    }
}

/// Process-wide stop switch for fatal conditions raised in background tasks.
/// The first recorded cause wins.
#[derive(Clone, Default)]
pub struct HaltSignal {
    token: CancellationToken,
    cause: Arc<Mutex<Option<String>>>,
}

impl HaltSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self, cause: impl Into<String>) {
        let cause = cause.into();
        {
            let mut slot = self.cause.lock();
            if slot.is_some() {
                return;
            }
            error!(cause = %cause, "fatal condition; shutting down");
            *slot = Some(cause);
        }
        self.token.cancel();
    }

    pub fn is_halted(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cause(&self) -> Option<String> {
        self.cause.lock().clone()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationAction {
    Start,
    Stop,
    Restart,
}

impl ApplicationAction {
    pub fn endpoint(self) -> &'static str {
        match self {
            ApplicationAction::Start => "Core/Start",
            ApplicationAction::Stop => "Core/Stop",
            ApplicationAction::Restart => "Core/Restart",
        }
    }

    fn label(self) -> &'static str {
        match self {
            ApplicationAction::Start => "start",
            ApplicationAction::Stop => "stop",
            ApplicationAction::Restart => "restart",
        }
    }
}

/// Everything the engine's tasks share, built once at startup and cloned into
/// each of them.
#[derive(Clone)]
pub struct FleetState {
    start: Instant,
    gateway: ApiGateway,
    core: Arc<ManagedInstance>,
    bootstrap: PermissionBootstrap,
    streams: StreamEngine,
    registry: Arc<InstanceRegistry>,
    reconciler: Arc<Reconciler>,
    roster_tx: broadcast::Sender<RosterEvent>,
    settings: EngineSettings,
    halt: HaltSignal,
}

impl FleetState {
    pub fn new(
        gateway: ApiGateway,
        settings: EngineSettings,
        variants: VariantRegistry,
        store: Arc<dyn InstanceConfigStore>,
    ) -> Self {
        let halt = HaltSignal::new();
        let core = Arc::new(ManagedInstance::core(VariantRegistry::core()));
        let bootstrap = PermissionBootstrap::new(
            gateway.clone(),
            settings.role_name.clone(),
            settings.super_admin_role_name.clone(),
            settings.elevated,
        );
        let streams = StreamEngine::new(
            gateway.clone(),
            ConsolePipeline::new(settings.message_budget, settings.mirror_chat_to_console),
            settings.poll_interval,
            store,
            halt.clone(),
        );
        let registry = Arc::new(InstanceRegistry::new());
        let (roster_tx, _) = broadcast::channel(ROSTER_CHANNEL_CAPACITY);
        let reconciler = Arc::new(Reconciler::new(
            gateway.clone(),
            bootstrap.clone(),
            streams.clone(),
            Arc::new(variants),
            registry.clone(),
            core.clone(),
            settings.clone(),
            roster_tx.clone(),
        ));
        Self {
            start: Instant::now(),
            gateway,
            core,
            bootstrap,
            streams,
            registry,
            reconciler,
            roster_tx,
            settings,
            halt,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn core(&self) -> &Arc<ManagedInstance> {
        &self.core
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Logs into the panel, bootstraps it, and runs the first reconciliation.
    /// Any error here ends the process.
    pub async fn startup(&self) -> Result<RosterSnapshot, FleetError> {
        self.gateway
            .sessions()
            .ensure_logged_in(self.core.session())
            .await
            .map_err(ApiError::from)?;
        let state = self.bootstrap.run(&self.core).await?;
        info!(phase = state.phase.as_str(), "panel bootstrap complete");
        let roster = self.reconcile().await?;
        info!(instances = roster.len(), "initial roster built");
        Ok(roster)
    }

    pub async fn reconcile(&self) -> Result<RosterSnapshot, FleetError> {
        self.reconciler.reconcile().await
    }

    pub fn roster(&self) -> RosterSnapshot {
        self.registry.snapshot()
    }

    pub fn subscribe_roster(&self) -> broadcast::Receiver<RosterEvent> {
        self.roster_tx.subscribe()
    }

    pub fn instance(&self, id: &InstanceId) -> Result<Arc<ManagedInstance>, FleetError> {
        if id.is_core() {
            return Ok(self.core.clone());
        }
        self.registry
            .get(id)
            .ok_or_else(|| FleetError::UnknownInstance(id.clone()))
    }

    pub async fn start_stream(&self, id: &InstanceId) -> Result<StreamState, FleetError> {
        let instance = self.instance(id)?;
        instance.set_stream_held(false);
        Ok(self.streams.start(&instance).await?)
    }

    /// Stops the stream and keeps reconciliation from restarting it until
    /// [`FleetState::start_stream`] is called again.
    pub async fn stop_stream(&self, id: &InstanceId) -> Result<bool, FleetError> {
        let instance = self.instance(id)?;
        instance.set_stream_held(true);
        match self.streams.stop(&instance) {
            Some(handle) => {
                handle.finish().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn drain_plain_queue(&self, id: &InstanceId) -> Result<Option<String>, FleetError> {
        Ok(self.instance(id)?.queues().pop_plain())
    }

    pub fn drain_chat_queue(&self, id: &InstanceId) -> Result<Option<ConsoleEntry>, FleetError> {
        Ok(self.instance(id)?.queues().pop_chat())
    }

    pub fn bootstrap_status(&self, id: &InstanceId) -> Result<BootstrapState, FleetError> {
        Ok(self.instance(id)?.bootstrap_state())
    }

    pub async fn send_console_message(
        &self,
        id: &InstanceId,
        message: &str,
    ) -> Result<(), FleetError> {
        let instance = self.instance(id)?;
        self.gateway
            .call(instance.session(), CONSOLE_INPUT_ENDPOINT, json!({ "message": message }))
            .await?;
        info!(instance = %id, "console command sent");
        Ok(())
    }

    pub async fn application_action(
        &self,
        id: &InstanceId,
        action: ApplicationAction,
    ) -> Result<(), FleetError> {
        let instance = self.instance(id)?;
        let reply = self
            .gateway
            .call(instance.session(), action.endpoint(), json!({}))
            .await?;
        let outcome = parse_action_result(&reply);
        if outcome.is_failure() {
            return Err(FleetError::ActionRefused {
                instance: id.clone(),
                action: action.label(),
                reason: outcome.reason.unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        info!(instance = %id, action = action.label(), "application action accepted");
        Ok(())
    }

    /// Runs reconciliation every `reconcile_interval` until shutdown. Fatal
    /// errors halt the process; anything else is logged and retried next tick.
    pub fn spawn_reconcile_loop(&self) -> JoinHandle<()> {
        let state = self.clone();
        let shutdown = self.halt.token();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(state.settings.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately; startup already reconciled
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match state.reconcile().await {
                    Ok(_) => {}
                    Err(err) if err.is_fatal() => {
                        state.halt(&err);
                        break;
                    }
                    Err(err) => warn!(error = %err, "reconciliation pass failed"),
                }
            }
        })
    }

    pub fn halt(&self, err: &FleetError) {
        self.halt.trigger(err.to_string());
    }

    pub fn halt_signal(&self) -> &HaltSignal {
        &self.halt
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.halt.token()
    }

    /// Stops every poller and waits for them to persist their cursors.
    pub async fn shutdown(&self) {
        let ids = self.registry.ids();
        for id in ids {
            if let Some(instance) = self.registry.get(&id) {
                if let Some(handle) = self.streams.stop(&instance) {
                    handle.finish().await;
                }
            }
        }
    }
}
