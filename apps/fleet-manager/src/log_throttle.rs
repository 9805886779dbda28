//! Keeps per-tick failures from flooding the log.
//!
//! State transitions are always logged by their callers; only conditions that can
//! repeat on every poll or retry go through here.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogKind {
    PollFailure,
    Unauthorized,
    InstanceOffline,
    EmptyDiscovery,
    QueueOverflow,
}

impl LogKind {
    fn interval(self) -> Duration {
        match self {
            LogKind::PollFailure => Duration::from_secs(60),
            LogKind::Unauthorized => Duration::from_secs(30),
            LogKind::InstanceOffline => Duration::from_secs(300),
            LogKind::EmptyDiscovery => Duration::from_secs(10),
            LogKind::QueueOverflow => Duration::from_secs(60),
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: LogKind,
    subject: String,
}

static LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// True when `kind` has not been logged for `subject` within its interval.
pub fn should_log(kind: LogKind, subject: &str) -> bool {
    let mut guard = LOG_MEMORY.lock();
    let key = LogKey {
        kind,
        subject: subject.to_string(),
    };
    let now = Instant::now();
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}

/// Forget throttling state for a subject, e.g. after it recovered, so the next
/// failure is reported immediately.
pub fn reset(subject: &str) {
    LOG_MEMORY.lock().retain(|key, _| key.subject != subject);
}
