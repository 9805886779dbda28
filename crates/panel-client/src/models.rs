//! Typed views over the panel's JSON replies.
//!
//! Most endpoints wrap their payload in a `result` field but a few older ones do
//! not, so every parser starts from [`unwrap_result`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn unwrap_result(reply: &Value) -> &Value {
    match reply.get("result") {
        Some(inner) if !inner.is_null() => inner,
        _ => reply,
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoginReply {
    pub success: bool,
    pub session_id: Option<String>,
    pub result_reason: Option<String>,
    pub user_id: Option<String>,
}

impl LoginReply {
    pub fn from_value(reply: &Value) -> Self {
        let reply = unwrap_result(reply);
        Self {
            success: reply.get("success").and_then(Value::as_bool).unwrap_or(false),
            session_id: reply
                .get("sessionID")
                .and_then(Value::as_str)
                .map(str::to_string),
            result_reason: reply
                .get("resultReason")
                .and_then(Value::as_str)
                .map(str::to_string),
            user_id: reply
                .pointer("/userInfo/ID")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        if !self.success {
            return None;
        }
        self.session_id.as_deref().filter(|id| !id.is_empty())
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.result_reason.clone().filter(|r| !r.is_empty())
    }
}

/// One entry of the discovery listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredInstance {
    #[serde(rename = "InstanceID")]
    pub instance_id: String,
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: String,
    #[serde(rename = "InstanceName", default)]
    pub instance_name: String,
    #[serde(rename = "Module", default)]
    pub module: String,
    #[serde(rename = "Running", default)]
    pub running: bool,
    #[serde(rename = "DisplayImageSource", default)]
    pub display_image_source: String,
}

/// Flattens `ADSModule/GetInstances`: a list of targets, each carrying its
/// `AvailableInstances`. Entries that fail to decode are skipped.
pub fn parse_instance_listing(reply: &Value) -> Vec<DiscoveredInstance> {
    let targets = match unwrap_result(reply) {
        Value::Array(targets) => targets.as_slice(),
        _ => return Vec::new(),
    };
    targets
        .iter()
        .filter_map(|target| target.get("AvailableInstances").and_then(Value::as_array))
        .flatten()
        .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleEntry {
    pub timestamp_ms: i64,
    pub source: String,
    /// Panel-side classification, e.g. `Console` or `Chat`.
    pub kind: String,
    pub contents: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleUpdates {
    pub entries: Vec<ConsoleEntry>,
    /// Entries dropped because their timestamp could not be read.
    pub unreadable: usize,
}

/// Decodes a `Core/GetUpdates` reply. `None` means the reply had no entries
/// field at all (a bare boolean, an empty object), which callers treat as a
/// transient failure rather than "no new lines".
pub fn parse_console_updates(reply: &Value) -> Option<ConsoleUpdates> {
    let raw = unwrap_result(reply).get("ConsoleEntries")?.as_array()?;
    let mut updates = ConsoleUpdates::default();
    for entry in raw {
        let timestamp = entry
            .get("Timestamp")
            .and_then(Value::as_str)
            .and_then(parse_panel_timestamp);
        let Some(timestamp_ms) = timestamp else {
            updates.unreadable += 1;
            continue;
        };
        let text = |key: &str| {
            entry
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        updates.entries.push(ConsoleEntry {
            timestamp_ms,
            source: text("Source"),
            kind: text("Type"),
            contents: text("Contents"),
        });
    }
    Some(updates)
}

/// Parses the panel's `/Date(1700000000000)/` form (an optional `+hhmm` offset
/// suffix is ignored; the number is already UTC milliseconds).
pub fn parse_panel_timestamp(raw: &str) -> Option<i64> {
    let inner = raw.trim().strip_prefix("/Date(")?.strip_suffix(")/")?;
    let end = inner
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '+' || *c == '-')
        .map(|(idx, _)| idx)
        .unwrap_or(inner.len());
    inner[..end].parse().ok()
}

/// Application lifecycle codes reported by `Core/GetStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    Undefined,
    Stopped,
    PreStart,
    Configuring,
    Starting,
    Ready,
    Restarting,
    Stopping,
    PreparingForSleep,
    Sleeping,
    Waiting,
    Installing,
    Updating,
    AwaitingUserInput,
    Failed,
    Suspended,
    Maintenance,
    Indeterminate,
}

impl ApplicationState {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Stopped,
            5 => Self::PreStart,
            7 => Self::Configuring,
            10 => Self::Starting,
            20 => Self::Ready,
            30 => Self::Restarting,
            40 => Self::Stopping,
            45 => Self::PreparingForSleep,
            50 => Self::Sleeping,
            60 => Self::Waiting,
            70 => Self::Installing,
            75 => Self::Updating,
            80 => Self::AwaitingUserInput,
            100 => Self::Failed,
            200 => Self::Suspended,
            250 => Self::Maintenance,
            999 => Self::Indeterminate,
            _ => Self::Undefined,
        }
    }

    pub fn is_running(self) -> bool {
        self == Self::Ready
    }
}

pub fn parse_application_state(reply: &Value) -> Option<ApplicationState> {
    unwrap_result(reply)
        .get("State")
        .and_then(Value::as_i64)
        .map(ApplicationState::from_code)
}

/// `Core/GetRoleIds`: role id to role name.
pub fn parse_role_ids(reply: &Value) -> HashMap<String, String> {
    unwrap_result(reply)
        .as_object()
        .map(|roles| {
            roles
                .iter()
                .filter_map(|(id, name)| name.as_str().map(|n| (id.clone(), n.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Option<String>,
    pub roles: Vec<String>,
}

pub fn parse_user_info(reply: &Value) -> UserInfo {
    let info = unwrap_result(reply);
    UserInfo {
        id: info.get("ID").and_then(Value::as_str).map(str::to_string),
        roles: info
            .get("Roles")
            .and_then(Value::as_array)
            .map(|roles| {
                roles
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Reply shape of provisioning calls (`Status`, `Reason`, `Result`).
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub status: Option<bool>,
    pub reason: Option<String>,
    pub result: Value,
}

impl ActionResult {
    /// Only an explicit `Status: false` counts; some endpoints reply with nothing.
    pub fn is_failure(&self) -> bool {
        self.status == Some(false)
    }
}

pub fn parse_action_result(reply: &Value) -> ActionResult {
    let inner = unwrap_result(reply);
    ActionResult {
        status: inner
            .get("Status")
            .and_then(Value::as_bool)
            .or_else(|| inner.as_bool()),
        reason: inner.get("Reason").and_then(Value::as_str).map(str::to_string),
        result: inner.get("Result").cloned().unwrap_or(Value::Null),
    }
}

pub fn parse_bool_result(reply: &Value) -> bool {
    unwrap_result(reply).as_bool().unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_panel_timestamps() {
        assert_eq!(parse_panel_timestamp("/Date(1700000000123)/"), Some(1_700_000_000_123));
        assert_eq!(parse_panel_timestamp("/Date(1700000000123+0100)/"), Some(1_700_000_000_123));
        assert_eq!(parse_panel_timestamp("2023-11-14T22:13:20Z"), None);
    }

    #[test]
    fn console_updates_need_an_entries_field() {
        assert!(parse_console_updates(&json!(true)).is_none());
        assert!(parse_console_updates(&json!({"result": {}})).is_none());

        let updates = parse_console_updates(&json!({
            "result": {
                "ConsoleEntries": [
                    {"Timestamp": "/Date(10)/", "Source": "Server", "Type": "Console",
                     "Contents": "Done (3.2s)!"},
                    {"Timestamp": "garbage", "Source": "Server", "Type": "Console",
                     "Contents": "lost"},
                    {"Timestamp": "/Date(11)/", "Source": "Steve", "Type": "Chat",
                     "Contents": "hello"}
                ]
            }
        }))
        .expect("entries");
        assert_eq!(updates.entries.len(), 2);
        assert_eq!(updates.unreadable, 1);
        assert_eq!(updates.entries[1].kind, "Chat");
        assert_eq!(updates.entries[1].source, "Steve");
    }

    #[test]
    fn flattens_instance_listing() {
        let listing = parse_instance_listing(&json!({
            "result": [
                {"AvailableInstances": [
                    {"InstanceID": "0a", "FriendlyName": "ADS", "Module": "ADS",
                     "Running": true, "DisplayImageSource": ""},
                    {"InstanceID": "1b", "FriendlyName": "Survival", "Module": "Minecraft",
                     "Running": true, "DisplayImageSource": "internal:MinecraftJava"}
                ]},
                {"AvailableInstances": [{"broken": true}]}
            ]
        }));
        assert_eq!(listing.len(), 2);
        assert_eq!(listing[1].friendly_name, "Survival");
        assert!(parse_instance_listing(&json!({"result": null})).is_empty());
    }

    #[test]
    fn maps_status_codes() {
        let state = parse_application_state(&json!({"result": {"State": 20}})).unwrap();
        assert!(state.is_running());
        let state = parse_application_state(&json!({"State": 0})).unwrap();
        assert_eq!(state, ApplicationState::Stopped);
        assert!(!ApplicationState::from_code(12345).is_running());
    }

    #[test]
    fn reads_roles_and_action_results() {
        let roles =
            parse_role_ids(&json!({"result": {"r1": "Super Admins", "r2": "Fleet Warden"}}));
        assert_eq!(roles.get("r2").map(String::as_str), Some("Fleet Warden"));

        let user = parse_user_info(&json!({"result": {"ID": "u1", "Roles": ["r1"]}}));
        assert_eq!(user.id.as_deref(), Some("u1"));
        assert_eq!(user.roles, vec!["r1".to_string()]);

        let created = parse_action_result(&json!({"result": {"Status": true, "Result": "r9"}}));
        assert_eq!(created.status, Some(true));
        assert_eq!(created.result, json!("r9"));

        let refused =
            parse_action_result(&json!({"result": {"Status": false, "Reason": "denied"}}));
        assert!(refused.is_failure());
        assert!(!parse_action_result(&json!({"result": null})).is_failure());
    }
}
