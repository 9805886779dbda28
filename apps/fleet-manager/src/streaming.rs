//! Console streaming engine: one poller task per instance.
//!
//! A poller is steered through a `watch` channel carrying the wanted
//! [`StreamCommand`]. It reads the command only at the top of each iteration and
//! while sleeping between polls, so a pause or stop never interrupts a cycle half
//! way and never waits on a queue lock.

use std::sync::Arc;
use std::time::Duration;

use panel_client::models::{parse_application_state, parse_console_updates};
use panel_client::{ApiError, ApiGateway, InstanceId};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bootstrap::PermissionBootstrap;
use crate::console::{ConsoleCursor, ConsolePipeline, CycleStats};
use crate::instance::ManagedInstance;
use crate::log_throttle::{self, LogKind};
use crate::metrics;
use crate::state::HaltSignal;
use crate::store::{InstanceConfigStore, StoreError};

pub const UPDATES_ENDPOINT: &str = "Core/GetUpdates";
pub const STATUS_ENDPOINT: &str = "Core/GetStatus";

/// Consecutive unauthorized polls, the first forcing a fresh login, after which
/// the poller hands the instance back to the permission bootstrap.
const SESSION_REFUSAL_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Stopped,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCommand {
    Run,
    Pause,
    Stop,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("instance {instance} cannot stream: {reason}")]
    NotEligible {
        instance: InstanceId,
        reason: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Control side of a running poller, kept in the instance's stream slot.
pub struct StreamHandle {
    control: Arc<watch::Sender<StreamCommand>>,
    task: JoinHandle<()>,
}

impl StreamHandle {
    pub fn state(&self) -> StreamState {
        if self.task.is_finished() {
            return StreamState::Stopped;
        }
        match *self.control.borrow() {
            StreamCommand::Run => StreamState::Running,
            StreamCommand::Pause => StreamState::Paused,
            StreamCommand::Stop => StreamState::Stopped,
        }
    }

    fn signal(&self, command: StreamCommand) {
        self.control.send_replace(command);
    }

    /// Asks the poller to stop and waits for it to leave its loop.
    pub async fn finish(self) {
        self.signal(StreamCommand::Stop);
        if let Err(err) = self.task.await {
            warn!(error = %err, "console poller ended abnormally");
        }
    }
}

#[derive(Clone)]
pub struct StreamEngine {
    gateway: ApiGateway,
    pipeline: ConsolePipeline,
    poll_interval: Duration,
    store: Arc<dyn InstanceConfigStore>,
    halt: HaltSignal,
}

impl StreamEngine {
    pub fn new(
        gateway: ApiGateway,
        pipeline: ConsolePipeline,
        poll_interval: Duration,
        store: Arc<dyn InstanceConfigStore>,
        halt: HaltSignal,
    ) -> Self {
        Self {
            gateway,
            pipeline,
            poll_interval,
            store,
            halt,
        }
    }

    /// Why `instance` may not stream right now, if anything.
    pub fn ineligibility(instance: &ManagedInstance) -> Option<&'static str> {
        if instance.is_core() {
            Some("the panel itself has no console stream")
        } else if !instance.bootstrap_state().is_streamable() {
            Some("permission bootstrap is not ready")
        } else if !instance.session().is_logged_in() {
            Some("not logged in")
        } else if !instance.application_running() {
            Some("application is not running")
        } else {
            None
        }
    }

    /// Starts a stopped stream, or resumes a paused one. The cursor is read back
    /// from the store so a stop/start cycle does not re-deliver history.
    pub async fn start(&self, instance: &Arc<ManagedInstance>) -> Result<StreamState, StreamError> {
        if let Some(reason) = Self::ineligibility(instance) {
            return Err(StreamError::NotEligible {
                instance: instance.id().clone(),
                reason,
            });
        }
        match instance.stream_state() {
            StreamState::Running => return Ok(StreamState::Running),
            StreamState::Paused => {
                self.resume(instance);
                return Ok(StreamState::Running);
            }
            StreamState::Stopped => {}
        }

        let stored = self
            .store
            .get_instance_config(instance.id())
            .await?
            .and_then(|record| record.console_cursor_ms);

        let mut slot = instance.stream_slot().lock();
        if let Some(existing) = slot.as_ref() {
            if existing.state() != StreamState::Stopped {
                return Ok(existing.state());
            }
        }
        {
            let mut cursor = instance.cursor().lock();
            let last_seen = match (cursor.last_seen_ms, stored) {
                (Some(live), Some(saved)) => Some(live.max(saved)),
                (live, saved) => live.or(saved),
            };
            *cursor = ConsoleCursor::resume_from(last_seen);
        }
        let control = Arc::new(watch::Sender::new(StreamCommand::Run));
        let task = tokio::spawn(run_poller(instance.clone(), self.clone(), control.clone()));
        *slot = Some(StreamHandle { control, task });
        info!(instance = %instance.id(), cursor = ?stored, "console stream started");
        Ok(StreamState::Running)
    }

    /// Returns true when a running stream was paused.
    pub fn pause(&self, instance: &ManagedInstance) -> bool {
        let slot = instance.stream_slot().lock();
        match slot.as_ref() {
            Some(handle) if handle.state() == StreamState::Running => {
                handle.signal(StreamCommand::Pause);
                info!(instance = %instance.id(), "console stream paused");
                true
            }
            _ => false,
        }
    }

    /// Returns true when a paused stream was resumed.
    pub fn resume(&self, instance: &ManagedInstance) -> bool {
        let slot = instance.stream_slot().lock();
        match slot.as_ref() {
            Some(handle) if handle.state() == StreamState::Paused => {
                handle.signal(StreamCommand::Run);
                info!(instance = %instance.id(), "console stream resumed");
                true
            }
            _ => false,
        }
    }

    /// Signals the poller to stop and detaches it. The poller persists its
    /// cursor on the way out. Returns the handle so callers that need to wait
    /// can [`StreamHandle::finish`] it.
    pub fn stop(&self, instance: &ManagedInstance) -> Option<StreamHandle> {
        let handle = instance.stream_slot().lock().take()?;
        handle.signal(StreamCommand::Stop);
        info!(instance = %instance.id(), "console stream stopped");
        Some(handle)
    }

    /// Lightweight liveness probe, separate from the console endpoint. Updates
    /// the instance's `application_running` flag.
    pub async fn probe_application(&self, instance: &ManagedInstance) -> Result<bool, ApiError> {
        let reply = self
            .gateway
            .call(instance.session(), STATUS_ENDPOINT, Value::Null)
            .await?;
        let running = parse_application_state(&reply)
            .map(|state| state.is_running())
            .unwrap_or(false);
        if running != instance.application_running() {
            info!(instance = %instance.id(), running, "application state changed");
        }
        instance.set_application_running(running);
        Ok(running)
    }

    async fn persist_cursor(&self, instance: &ManagedInstance) {
        let last_seen = instance.cursor().lock().last_seen_ms;
        let Some(last_seen) = last_seen else {
            return;
        };
        if let Err(err) = self.store.save_console_cursor(instance.id(), last_seen).await {
            warn!(instance = %instance.id(), error = %err, "failed to persist console cursor");
        }
    }

    /// One poll cycle. Every failure is absorbed here; the return value says
    /// what the loop should do next. `refused` counts unauthorized polls in a
    /// row and is owned by the poller.
    async fn poll_once(
        &self,
        instance: &ManagedInstance,
        refused: &mut u32,
    ) -> Option<StreamCommand> {
        let id = instance.id().as_str();
        let reply = match self
            .gateway
            .call(instance.session(), UPDATES_ENDPOINT, Value::Null)
            .await
        {
            Ok(reply) => reply,
            Err(err) => return self.poll_failed(instance, err, refused),
        };
        *refused = 0;

        let Some(updates) = parse_console_updates(&reply) else {
            metrics::POLL_FAILURES.with_label_values(&[id, "malformed"]).inc();
            if log_throttle::should_log(LogKind::PollFailure, id) {
                warn!(instance = %id, "console poll returned no entries field");
            }
            return match self.probe_application(instance).await {
                Ok(false) => {
                    info!(instance = %id, "application not running; pausing console stream");
                    Some(StreamCommand::Pause)
                }
                Ok(true) => None,
                Err(err) => self.poll_failed(instance, err, refused),
            };
        };
        if updates.unreadable > 0 {
            metrics::CONSOLE_ENTRIES
                .with_label_values(&[id, "unreadable"])
                .inc_by(updates.unreadable as u64);
        }

        let output = {
            let mut cursor = instance.cursor().lock();
            self.pipeline
                .process(&mut cursor, &updates.entries, instance.behavior().as_ref())
        };
        record_cycle(id, &output.stats);
        if !output.plain_batches.is_empty() {
            metrics::OUTBOUND_BATCHES
                .with_label_values(&[id, "plain"])
                .inc_by(output.plain_batches.len() as u64);
        }
        if !output.chat_entries.is_empty() {
            metrics::OUTBOUND_BATCHES
                .with_label_values(&[id, "chat"])
                .inc_by(output.chat_entries.len() as u64);
        }
        let evicted = instance.queues().push_plain(output.plain_batches);
        record_evictions(id, "plain", evicted);
        let evicted = instance.queues().push_chat(output.chat_entries);
        record_evictions(id, "chat", evicted);
        log_throttle::reset(id);
        None
    }

    fn poll_failed(
        &self,
        instance: &ManagedInstance,
        err: ApiError,
        refused: &mut u32,
    ) -> Option<StreamCommand> {
        let id = instance.id().as_str();
        if err.is_fatal() {
            self.halt.trigger(format!("console poll for {id}: {err}"));
            return Some(StreamCommand::Stop);
        }
        match err {
            ApiError::Unauthorized { .. } => {
                metrics::POLL_FAILURES
                    .with_label_values(&[id, "unauthorized"])
                    .inc();
                *refused += 1;
                if *refused < SESSION_REFUSAL_LIMIT {
                    if log_throttle::should_log(LogKind::Unauthorized, id) {
                        warn!(
                            instance = %id,
                            "console poll unauthorized; logging in again next cycle"
                        );
                    }
                    return None;
                }
                *refused = 0;
                warn!(
                    instance = %id,
                    "session refused after a fresh login; pausing stream for a permission re-check"
                );
                PermissionBootstrap::reopen(instance);
                Some(StreamCommand::Pause)
            }
            err if err.is_offline() => {
                metrics::POLL_FAILURES.with_label_values(&[id, "offline"]).inc();
                instance.set_application_running(false);
                info!(instance = %id, error = %err, "instance offline; pausing console stream");
                Some(StreamCommand::Pause)
            }
            err => {
                metrics::POLL_FAILURES.with_label_values(&[id, "transient"]).inc();
                if log_throttle::should_log(LogKind::PollFailure, id) {
                    warn!(instance = %id, error = %err, "console poll failed");
                }
                None
            }
        }
    }
}

fn record_evictions(instance: &str, channel: &str, evicted: usize) {
    if evicted == 0 {
        return;
    }
    metrics::OUTBOUND_EVICTIONS
        .with_label_values(&[instance, channel])
        .inc_by(evicted as u64);
    // keyed per channel so a healthy poll's reset does not unthrottle it
    if log_throttle::should_log(LogKind::QueueOverflow, &format!("{instance}:{channel}")) {
        warn!(instance, channel, evicted, "outbound queue full; dropped oldest items");
    }
}

fn record_cycle(instance: &str, stats: &CycleStats) {
    for (outcome, count) in [
        ("emitted", stats.emitted),
        ("duplicate", stats.duplicates),
        ("filtered", stats.filtered),
        ("chat", stats.chat),
        ("dropped", stats.dropped),
    ] {
        if count > 0 {
            metrics::CONSOLE_ENTRIES
                .with_label_values(&[instance, outcome])
                .inc_by(count as u64);
        }
    }
    if stats.dropped > 0 {
        debug!(instance, dropped = stats.dropped, "dropped over-budget lines without delimiter");
    }
}

async fn run_poller(
    instance: Arc<ManagedInstance>,
    engine: StreamEngine,
    control: Arc<watch::Sender<StreamCommand>>,
) {
    let mut commands = control.subscribe();
    let halted = engine.halt.token();
    let mut refused = 0u32;
    debug!(instance = %instance.id(), "console poller running");

    loop {
        let command = *commands.borrow_and_update();
        match command {
            StreamCommand::Stop => break,
            StreamCommand::Pause => {
                tokio::select! {
                    changed = commands.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = halted.cancelled() => break,
                }
                continue;
            }
            StreamCommand::Run => {}
        }

        if let Some(next) = engine.poll_once(&instance, &mut refused).await {
            // no-op when a newer command already superseded this one
            control.send_if_modified(|current| {
                if *current == StreamCommand::Run {
                    *current = next;
                    true
                } else {
                    false
                }
            });
            continue;
        }

        tokio::select! {
            _ = tokio::time::sleep(engine.poll_interval) => {}
            changed = commands.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = halted.cancelled() => break,
        }
    }

    engine.persist_cursor(&instance).await;
    debug!(instance = %instance.id(), "console poller exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{BootstrapPhase, BootstrapState};
    use crate::store::InMemoryInstanceConfigStore;
    use crate::variants::GenericModule;
    use panel_client::{
        ConnectionLatch, Credentials, Dispatcher, MockReply, MockTransport, RetryPolicy,
        SessionManager,
    };
    use serde_json::json;

    struct Harness {
        mock: Arc<MockTransport>,
        engine: StreamEngine,
        store: Arc<InMemoryInstanceConfigStore>,
        instance: Arc<ManagedInstance>,
    }

    async fn harness() -> Harness {
        let mock = Arc::new(MockTransport::new());
        mock.respond(STATUS_ENDPOINT, json!({"result": {"State": 20}}));
        let gateway = ApiGateway::new(SessionManager::new(
            Dispatcher::new(mock.clone(), ConnectionLatch::new(), RetryPolicy::default()),
            Credentials {
                username: "warden".into(),
                password: "hunter2".into(),
                otp: None,
            },
        ));
        let store = InMemoryInstanceConfigStore::new();
        let engine = StreamEngine::new(
            gateway.clone(),
            ConsolePipeline::new(1_500, true),
            Duration::from_secs(1),
            store.clone(),
            HaltSignal::new(),
        );
        let instance = Arc::new(ManagedInstance::new(
            InstanceId::new("a"),
            Default::default(),
            true,
            Arc::new(GenericModule),
        ));
        let mut ready = BootstrapState::new(instance.id().clone());
        ready.phase = BootstrapPhase::Ready;
        ready.has_required_session_permissions = true;
        instance.set_bootstrap(ready);
        gateway.sessions().ensure_logged_in(instance.session()).await.unwrap();
        engine.probe_application(&instance).await.unwrap();
        Harness {
            mock,
            engine,
            store,
            instance,
        }
    }

    fn updates(entries: &[(i64, &str)]) -> Value {
        let entries: Vec<Value> = entries
            .iter()
            .map(|(ts, text)| {
                json!({
                    "Timestamp": format!("/Date({ts})/"),
                    "Source": "Server",
                    "Type": "Console",
                    "Contents": text,
                })
            })
            .collect();
        json!({"result": {"ConsoleEntries": entries}})
    }

    #[tokio::test(start_paused = true)]
    async fn streams_new_lines_after_seeding_cursor() {
        let h = harness().await;
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(1, "history")])));
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(2, "hello"), (3, "world")])));
        h.mock.respond(UPDATES_ENDPOINT, updates(&[]));

        assert_eq!(h.engine.start(&h.instance).await.unwrap(), StreamState::Running);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(h.instance.queues().pop_plain().as_deref(), Some("hello\nworld"));
        assert_eq!(h.instance.queues().pop_plain(), None);

        let handle = h.engine.stop(&h.instance).expect("running");
        handle.finish().await;
        let record = h.store.get_instance_config(h.instance.id()).await.unwrap().unwrap();
        assert_eq!(record.console_cursor_ms, Some(3));
        assert_eq!(h.instance.stream_state(), StreamState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_poll_pauses_when_application_stopped() {
        let h = harness().await;
        h.mock.respond(UPDATES_ENDPOINT, json!({"result": true}));
        h.mock.respond(STATUS_ENDPOINT, json!({"result": {"State": 0}}));

        h.engine.start(&h.instance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(h.instance.stream_state(), StreamState::Paused);
        assert!(!h.instance.application_running());

        let polls = h.mock.calls_to(UPDATES_ENDPOINT).len();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.mock.calls_to(UPDATES_ENDPOINT).len(), polls);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_poll_keeps_polling_while_application_runs() {
        let h = harness().await;
        let malformed = || MockReply::Json(json!({"result": true}));
        h.mock.push(UPDATES_ENDPOINT, malformed());
        h.mock.push(UPDATES_ENDPOINT, malformed());
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(1, "seed")])));
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(2, "after")])));
        h.mock.respond(UPDATES_ENDPOINT, updates(&[]));
        let probes = h.mock.calls_to(STATUS_ENDPOINT).len();

        h.engine.start(&h.instance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(4_500)).await;

        assert_eq!(h.instance.stream_state(), StreamState::Running);
        assert_eq!(h.mock.calls_to(STATUS_ENDPOINT).len(), probes + 2);
        assert_eq!(h.instance.queues().pop_plain().as_deref(), Some("after"));
    }

    #[tokio::test(start_paused = true)]
    async fn single_refusal_is_absorbed_by_a_fresh_login() {
        let h = harness().await;
        let refused = json!({"Title": "Unauthorized Access"});
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(refused));
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(1, "seed")])));
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(2, "after")])));
        h.mock.respond(UPDATES_ENDPOINT, updates(&[]));

        h.engine.start(&h.instance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(h.instance.stream_state(), StreamState::Running);
        assert_eq!(h.instance.bootstrap_phase(), BootstrapPhase::Ready);
        assert_eq!(h.mock.calls_to("Core/Login").len(), 2);
        assert_eq!(h.instance.queues().pop_plain().as_deref(), Some("after"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_refusal_reopens_bootstrap_and_pauses() {
        let h = harness().await;
        h.mock.respond(UPDATES_ENDPOINT, json!({"Title": "Unauthorized Access"}));

        h.engine.start(&h.instance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(h.instance.stream_state(), StreamState::Paused);
        assert_eq!(h.instance.bootstrap_phase(), BootstrapPhase::Unchecked);
        assert!(StreamEngine::ineligibility(&h.instance).is_some());
        let logins = h.mock.calls_to("Core/Login").len();
        assert_eq!(logins, 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.mock.calls_to("Core/Login").len(), logins);
        assert_eq!(h.mock.calls_to(UPDATES_ENDPOINT).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_preserves_cursor_across_resume() {
        let h = harness().await;
        h.mock.push(UPDATES_ENDPOINT, MockReply::Json(updates(&[(5, "seed")])));
        h.mock.respond(UPDATES_ENDPOINT, updates(&[(5, "seed"), (6, "once")]));

        h.engine.start(&h.instance).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(h.engine.pause(&h.instance));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.engine.resume(&h.instance));
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(h.instance.queues().pop_plain().as_deref(), Some("once"));
        assert_eq!(h.instance.queues().pop_plain(), None);
    }

    #[tokio::test]
    async fn refuses_instances_that_are_not_ready() {
        let h = harness().await;
        h.instance.set_bootstrap(BootstrapState::new(h.instance.id().clone()));
        let err = h.engine.start(&h.instance).await.unwrap_err();
        assert!(matches!(err, StreamError::NotEligible { .. }));
        assert_eq!(h.instance.stream_state(), StreamState::Stopped);
    }
}
