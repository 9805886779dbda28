#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_manager::config::EngineSettings;
use fleet_manager::state::FleetState;
use fleet_manager::store::InMemoryInstanceConfigStore;
use fleet_manager::variants::VariantRegistry;
use panel_client::{
    ApiGateway, ConnectionLatch, Credentials, Dispatcher, MockTransport, RetryPolicy,
    SessionManager,
};
use serde_json::{json, Value};

pub const DISCOVERY: &str = "ADSModule/GetInstances";
pub const HAS_PERMISSION: &str = "Core/CurrentSessionHasPermission";
pub const ROLE_IDS: &str = "Core/GetRoleIds";
pub const USER_INFO: &str = "Core/GetAMPUserInfo";
pub const STATUS: &str = "Core/GetStatus";
pub const UPDATES: &str = "Core/GetUpdates";

pub struct Fleet {
    pub mock: Arc<MockTransport>,
    pub state: FleetState,
    pub store: Arc<InMemoryInstanceConfigStore>,
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_secs(1),
        reconcile_interval: Duration::from_secs(30),
        ..EngineSettings::default()
    }
}

pub fn fleet(settings: EngineSettings) -> Fleet {
    let mock = Arc::new(MockTransport::new());
    let dispatcher = Dispatcher::new(mock.clone(), ConnectionLatch::new(), RetryPolicy::default());
    let gateway = ApiGateway::new(SessionManager::new(
        dispatcher,
        Credentials {
            username: "warden".into(),
            password: "hunter2".into(),
            otp: None,
        },
    ));
    let store = InMemoryInstanceConfigStore::new();
    let state = FleetState::new(gateway, settings, VariantRegistry::with_defaults(), store.clone());
    Fleet { mock, state, store }
}

/// A panel where the session user already holds the dedicated role everywhere
/// and every application is running.
pub fn healthy_panel(mock: &MockTransport) {
    mock.respond(HAS_PERMISSION, json!({"result": true}));
    mock.respond(ROLE_IDS, json!({"result": {"r1": "Super Admins", "r2": "Fleet Warden"}}));
    mock.respond(USER_INFO, json!({"result": {"ID": "u1", "Roles": ["r2"]}}));
    mock.respond(STATUS, json!({"result": {"State": 20}}));
    mock.respond(UPDATES, json!({"result": {"ConsoleEntries": []}}));
}

pub fn listing(instances: &[(&str, &str, bool)]) -> Value {
    let mut available = vec![
        json!({
            "InstanceID": "ads01",
            "FriendlyName": "ADS",
            "Module": "ADS",
            "Running": true,
            "DisplayImageSource": "",
        }),
        json!({
            "InstanceID": "tmpl",
            "FriendlyName": "Template",
            "Module": "GenericModule",
            "Running": false,
            "DisplayImageSource": "Template:Default",
        }),
    ];
    for (id, image, running) in instances {
        available.push(json!({
            "InstanceID": id,
            "FriendlyName": format!("{id} server"),
            "Module": "GenericModule",
            "Running": running,
            "DisplayImageSource": image,
        }));
    }
    json!({"result": [{"AvailableInstances": available}]})
}

pub fn console(entries: &[(i64, &str, &str)]) -> Value {
    let entries: Vec<Value> = entries
        .iter()
        .map(|(ts, kind, text)| {
            json!({
                "Timestamp": format!("/Date({ts})/"),
                "Source": "Server",
                "Type": kind,
                "Contents": text,
            })
        })
        .collect();
    json!({"result": {"ConsoleEntries": entries}})
}

pub const PROVISIONING: &[&str] = &[
    "Core/CreateRole",
    "Core/SetAMPUserRoleMembership",
    "Core/SetAMPRolePermission",
];

pub fn provisioning_calls(mock: &MockTransport) -> usize {
    PROVISIONING.iter().map(|e| mock.calls_to(e).len()).sum()
}
