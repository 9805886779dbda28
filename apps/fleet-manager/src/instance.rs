use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use panel_client::models::DiscoveredInstance;
use panel_client::{InstanceId, InstanceSession};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::bootstrap::{BootstrapPhase, BootstrapState};
use crate::console::{ConsoleCursor, OutboundQueues};
use crate::streaming::{StreamHandle, StreamState};
use crate::variants::ModuleBehavior;

/// Descriptive fields refreshed from every discovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceAttributes {
    pub friendly_name: String,
    pub module_type: String,
    pub display_image_source: String,
}

impl From<&DiscoveredInstance> for InstanceAttributes {
    fn from(entry: &DiscoveredInstance) -> Self {
        let friendly_name = if entry.friendly_name.is_empty() {
            entry.instance_name.clone()
        } else {
            entry.friendly_name.clone()
        };
        Self {
            friendly_name,
            module_type: entry.module.clone(),
            display_image_source: entry.display_image_source.clone(),
        }
    }
}

/// One managed remote application.
///
/// Field ownership: the session slot is written only by the session manager,
/// `bootstrap` only by the bootstrap FSM, `attributes` only by the reconciler.
/// The cursor and queues are shared between the instance's poller and the
/// consumer; their locks are never held across an await.
pub struct ManagedInstance {
    id: InstanceId,
    attributes: RwLock<InstanceAttributes>,
    session: InstanceSession,
    application_running: AtomicBool,
    /// Set when an operator stopped the stream; reconciliation leaves it alone.
    stream_held: AtomicBool,
    bootstrap: RwLock<BootstrapState>,
    behavior: Arc<dyn ModuleBehavior>,
    queues: OutboundQueues,
    cursor: Mutex<ConsoleCursor>,
    stream: Mutex<Option<StreamHandle>>,
}

impl ManagedInstance {
    pub fn new(
        id: InstanceId,
        attributes: InstanceAttributes,
        instance_running: bool,
        behavior: Arc<dyn ModuleBehavior>,
    ) -> Self {
        Self {
            bootstrap: RwLock::new(BootstrapState::new(id.clone())),
            session: InstanceSession::new(id.clone(), instance_running),
            id,
            attributes: RwLock::new(attributes),
            application_running: AtomicBool::new(false),
            stream_held: AtomicBool::new(false),
            behavior,
            queues: OutboundQueues::new(),
            cursor: Mutex::new(ConsoleCursor::default()),
            stream: Mutex::new(None),
        }
    }

    /// Replaces the default outbound queue bound. Only meaningful before the
    /// instance is shared.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queues = OutboundQueues::with_capacity(capacity);
        self
    }

    pub fn core(behavior: Arc<dyn ModuleBehavior>) -> Self {
        Self::new(
            InstanceId::core(),
            InstanceAttributes {
                friendly_name: "Panel".to_string(),
                module_type: "ADS".to_string(),
                display_image_source: String::new(),
            },
            true,
            behavior,
        )
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn is_core(&self) -> bool {
        self.id.is_core()
    }

    pub fn attributes(&self) -> InstanceAttributes {
        self.attributes.read().clone()
    }

    /// Returns true when anything changed.
    pub fn refresh_attributes(&self, attributes: InstanceAttributes) -> bool {
        let mut guard = self.attributes.write();
        if *guard == attributes {
            return false;
        }
        *guard = attributes;
        true
    }

    pub fn session(&self) -> &InstanceSession {
        &self.session
    }

    pub fn instance_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn set_instance_running(&self, running: bool) {
        self.session.set_running(running);
    }

    pub fn application_running(&self) -> bool {
        self.application_running.load(Ordering::Acquire)
    }

    pub fn set_application_running(&self, running: bool) {
        self.application_running.store(running, Ordering::Release);
    }

    pub fn stream_held(&self) -> bool {
        self.stream_held.load(Ordering::Acquire)
    }

    pub fn set_stream_held(&self, held: bool) {
        self.stream_held.store(held, Ordering::Release);
    }

    pub fn behavior(&self) -> &Arc<dyn ModuleBehavior> {
        &self.behavior
    }

    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.read().clone()
    }

    pub fn bootstrap_phase(&self) -> BootstrapPhase {
        self.bootstrap.read().phase
    }

    pub(crate) fn set_bootstrap(&self, state: BootstrapState) {
        *self.bootstrap.write() = state;
    }

    pub fn queues(&self) -> &OutboundQueues {
        &self.queues
    }

    pub(crate) fn cursor(&self) -> &Mutex<ConsoleCursor> {
        &self.cursor
    }

    pub(crate) fn stream_slot(&self) -> &Mutex<Option<StreamHandle>> {
        &self.stream
    }

    pub fn stream_state(&self) -> StreamState {
        self.stream
            .lock()
            .as_ref()
            .map(StreamHandle::state)
            .unwrap_or(StreamState::Stopped)
    }

    pub fn summary(&self) -> InstanceSummary {
        let attributes = self.attributes();
        InstanceSummary {
            instance_id: self.id.clone(),
            friendly_name: attributes.friendly_name,
            module_type: attributes.module_type,
            display_image_source: attributes.display_image_source,
            variant: self.behavior.name(),
            instance_running: self.instance_running(),
            application_running: self.application_running(),
            logged_in: self.session.is_logged_in(),
            bootstrap_phase: self.bootstrap_phase(),
            stream_state: self.stream_state(),
            queued_batches: self.queues.plain_len(),
            queued_chat: self.queues.chat_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceSummary {
    pub instance_id: InstanceId,
    pub friendly_name: String,
    pub module_type: String,
    pub display_image_source: String,
    pub variant: &'static str,
    pub instance_running: bool,
    pub application_running: bool,
    pub logged_in: bool,
    pub bootstrap_phase: BootstrapPhase,
    pub stream_state: StreamState,
    pub queued_batches: usize,
    pub queued_chat: usize,
}
