//! Instance registry and the reconciler that keeps it in step with discovery.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use panel_client::models::{parse_instance_listing, DiscoveredInstance};
use panel_client::{ApiGateway, InstanceId};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapPhase, PermissionBootstrap};
use crate::config::EngineSettings;
use crate::instance::{InstanceAttributes, InstanceSummary, ManagedInstance};
use crate::log_throttle::{self, LogKind};
use crate::metrics;
use crate::state::FleetError;
use crate::streaming::{StreamEngine, StreamError, StreamState};
use crate::variants::VariantRegistry;

pub const DISCOVERY_ENDPOINT: &str = "ADSModule/GetInstances";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "instance_id", rename_all = "snake_case")]
pub enum RosterEvent {
    Added(InstanceId),
    Removed(InstanceId),
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterSnapshot {
    pub instances: Vec<InstanceSummary>,
}

impl RosterSnapshot {
    pub fn ids(&self) -> BTreeSet<InstanceId> {
        self.instances
            .iter()
            .map(|summary| summary.instance_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Discovered instances keyed by id. Only the reconciler inserts or removes.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Arc<ManagedInstance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<ManagedInstance>> {
        self.instances.read().get(id).cloned()
    }

    pub fn ids(&self) -> BTreeSet<InstanceId> {
        self.instances.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    pub fn snapshot(&self) -> RosterSnapshot {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .values()
            .map(|instance| instance.summary())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        RosterSnapshot { instances }
    }

    fn insert(&self, instance: Arc<ManagedInstance>) {
        self.instances.write().insert(instance.id().clone(), instance);
    }

    fn remove(&self, id: &InstanceId) -> Option<Arc<ManagedInstance>> {
        self.instances.write().remove(id)
    }
}

#[derive(Default)]
struct PassMemo {
    completed_passes: u64,
    /// Set by the first pass whose discovery succeeded, whether or not that
    /// pass went on to complete.
    listed_once: bool,
}

pub struct Reconciler {
    gateway: ApiGateway,
    bootstrap: PermissionBootstrap,
    streams: StreamEngine,
    variants: Arc<VariantRegistry>,
    registry: Arc<InstanceRegistry>,
    core: Arc<ManagedInstance>,
    settings: EngineSettings,
    roster_tx: broadcast::Sender<RosterEvent>,
    /// Serialises passes; held across the whole pass.
    memo: Mutex<PassMemo>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gateway: ApiGateway,
        bootstrap: PermissionBootstrap,
        streams: StreamEngine,
        variants: Arc<VariantRegistry>,
        registry: Arc<InstanceRegistry>,
        core: Arc<ManagedInstance>,
        settings: EngineSettings,
        roster_tx: broadcast::Sender<RosterEvent>,
    ) -> Self {
        Self {
            gateway,
            bootstrap,
            streams,
            variants,
            registry,
            core,
            settings,
            roster_tx,
            memo: Mutex::new(PassMemo::default()),
        }
    }

    pub async fn completed_passes(&self) -> u64 {
        self.memo.lock().await.completed_passes
    }

    /// One reconciliation pass. Removals are diffed against the roster as it
    /// stood before this pass and are skipped on the first pass that got a
    /// listing.
    pub async fn reconcile(&self) -> Result<RosterSnapshot, FleetError> {
        let mut memo = self.memo.lock().await;
        let listing = self.discover().await?;
        let removals = std::mem::replace(&mut memo.listed_once, true);
        let before = self.registry.ids();
        let mut seen = BTreeSet::new();

        for entry in listing.iter().filter(|entry| self.is_managed(entry)) {
            let id = InstanceId::new(entry.instance_id.clone());
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.registry.get(&id) {
                Some(instance) => self.refresh(&instance, entry).await?,
                None => self.add(id, entry).await?,
            }
        }

        if removals {
            for gone in before.difference(&seen) {
                self.remove(gone);
            }
        }

        memo.completed_passes += 1;
        metrics::RECONCILE_PASSES.inc();
        metrics::ROSTER_SIZE.set(self.registry.len() as i64 + 1);
        let snapshot = self.registry.snapshot();
        debug!(
            instances = snapshot.len(),
            pass = memo.completed_passes,
            "reconciliation pass complete"
        );
        Ok(snapshot)
    }

    /// Calls discovery until it lists something, giving up after the configured
    /// number of consecutive empty results.
    async fn discover(&self) -> Result<Vec<DiscoveredInstance>, FleetError> {
        let mut empty = 0u32;
        loop {
            let reply = self
                .gateway
                .call(self.core.session(), DISCOVERY_ENDPOINT, Value::Null)
                .await?;
            let listing = parse_instance_listing(&reply);
            if !listing.is_empty() {
                if empty > 0 {
                    info!(attempts = empty + 1, "discovery recovered");
                }
                return Ok(listing);
            }

            empty += 1;
            if empty >= self.settings.discovery_failure_limit {
                return Err(FleetError::DiscoveryStarvation { attempts: empty });
            }
            if log_throttle::should_log(LogKind::EmptyDiscovery, "discovery") {
                warn!(
                    attempts = empty,
                    limit = self.settings.discovery_failure_limit,
                    "discovery listed no instances; retrying"
                );
            }
            tokio::time::sleep(self.settings.discovery_retry).await;
        }
    }

    fn is_managed(&self, entry: &DiscoveredInstance) -> bool {
        let marker = &self.settings.template_marker;
        if !marker.is_empty()
            && entry
                .display_image_source
                .to_lowercase()
                .contains(marker.as_str())
        {
            return false;
        }
        if entry
            .module
            .eq_ignore_ascii_case(&self.settings.management_module)
        {
            return false;
        }
        !InstanceId::new(entry.instance_id.clone()).is_core()
    }

    async fn add(&self, id: InstanceId, entry: &DiscoveredInstance) -> Result<(), FleetError> {
        let behavior = self.variants.resolve(&entry.display_image_source);
        info!(
            instance = %id,
            name = %entry.friendly_name,
            variant = behavior.name(),
            running = entry.running,
            "instance discovered"
        );
        let instance = Arc::new(
            ManagedInstance::new(
                id.clone(),
                InstanceAttributes::from(entry),
                entry.running,
                behavior,
            )
            .with_queue_capacity(self.settings.queue_capacity),
        );
        self.registry.insert(instance.clone());
        let _ = self.roster_tx.send(RosterEvent::Added(id));
        self.activate(&instance).await
    }

    async fn refresh(
        &self,
        instance: &Arc<ManagedInstance>,
        entry: &DiscoveredInstance,
    ) -> Result<(), FleetError> {
        if instance.refresh_attributes(InstanceAttributes::from(entry)) {
            debug!(instance = %instance.id(), "instance attributes refreshed");
        }
        if instance.instance_running() != entry.running {
            info!(
                instance = %instance.id(),
                running = entry.running,
                "instance running state changed"
            );
        }
        instance.set_instance_running(entry.running);
        if !entry.running {
            instance.set_application_running(false);
            self.streams.pause(instance);
            return Ok(());
        }
        self.activate(instance).await
    }

    /// Bootstraps a running instance if that has not happened yet, probes the
    /// application and starts or resumes its stream when eligible.
    async fn activate(&self, instance: &Arc<ManagedInstance>) -> Result<(), FleetError> {
        if !instance.instance_running() {
            debug!(instance = %instance.id(), "instance not running; bootstrap deferred");
            return Ok(());
        }

        if instance.bootstrap_phase() != BootstrapPhase::Ready {
            match self.bootstrap.run(instance).await {
                Ok(state) if !state.is_streamable() => return Ok(()),
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    if log_throttle::should_log(LogKind::InstanceOffline, instance.id().as_str()) {
                        warn!(
                            instance = %instance.id(),
                            error = %err,
                            "bootstrap deferred to a later pass"
                        );
                    }
                    return Ok(());
                }
            }
        }

        let running = match self.streams.probe_application(instance).await {
            Ok(running) => running,
            Err(err) if err.is_fatal() => return Err(err.into()),
            Err(err) => {
                if log_throttle::should_log(LogKind::InstanceOffline, instance.id().as_str()) {
                    warn!(instance = %instance.id(), error = %err, "status probe failed");
                }
                return Ok(());
            }
        };

        match (running, instance.stream_state()) {
            (false, StreamState::Running) => {
                self.streams.pause(instance);
            }
            (true, StreamState::Paused) => {
                self.streams.resume(instance);
            }
            (true, StreamState::Stopped) if !instance.stream_held() => {
                match self.streams.start(instance).await {
                    Ok(_) => {}
                    Err(StreamError::NotEligible { reason, .. }) => {
                        debug!(instance = %instance.id(), reason, "stream not started");
                    }
                    Err(err) => {
                        warn!(
                            instance = %instance.id(),
                            error = %err,
                            "failed to start console stream"
                        );
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn remove(&self, id: &InstanceId) {
        let Some(instance) = self.registry.remove(id) else {
            return;
        };
        // detached; the poller notices at the top of its next iteration
        drop(self.streams.stop(&instance));
        log_throttle::reset(id.as_str());
        let _ = self.roster_tx.send(RosterEvent::Removed(id.clone()));
        info!(instance = %id, "instance no longer listed; removed from roster");
    }
}
