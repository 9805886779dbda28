//! Per-game behavior providers, looked up by an instance's display image source.

use std::collections::HashMap;
use std::sync::Arc;

use panel_client::models::ConsoleEntry;

/// Game-specific hooks the engine consults but does not implement itself.
pub trait ModuleBehavior: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_chat_entry(&self, entry: &ConsoleEntry) -> bool;

    fn should_filter(&self, entry: &ConsoleEntry) -> bool;

    /// Permission nodes the session needs on this instance. Nodes starting with
    /// `-` are provisioned as denied and never required.
    fn required_permissions(&self) -> Vec<String>;
}

pub type BehaviorFactory = fn() -> Arc<dyn ModuleBehavior>;

pub struct VariantRegistry {
    factories: HashMap<String, BehaviorFactory>,
    fallback: BehaviorFactory,
}

impl VariantRegistry {
    pub fn new(fallback: BehaviorFactory) -> Self {
        Self {
            factories: HashMap::new(),
            fallback,
        }
    }

    /// Registry with every built-in variant.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new(generic);
        registry.register("internal:MinecraftJava", minecraft);
        registry.register("internal:MinecraftBedrock", minecraft);
        registry
    }

    pub fn register(&mut self, key: &str, factory: BehaviorFactory) {
        self.factories.insert(key.to_ascii_lowercase(), factory);
    }

    /// Unknown keys get the generic variant.
    pub fn resolve(&self, display_image_source: &str) -> Arc<dyn ModuleBehavior> {
        let key = display_image_source.trim().to_ascii_lowercase();
        let factory = self.factories.get(&key).copied().unwrap_or(self.fallback);
        factory()
    }

    pub fn core() -> Arc<dyn ModuleBehavior> {
        Arc::new(PanelCore)
    }
}

impl Default for VariantRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn generic() -> Arc<dyn ModuleBehavior> {
    Arc::new(GenericModule)
}

fn minecraft() -> Arc<dyn ModuleBehavior> {
    Arc::new(MinecraftModule)
}

fn is_panel_chat(entry: &ConsoleEntry) -> bool {
    entry.kind.eq_ignore_ascii_case("chat")
}

fn instance_permissions() -> Vec<String> {
    [
        "Core.AppManagement.StartInstance",
        "Core.AppManagement.StopInstance",
        "Core.AppManagement.RestartInstance",
        "Core.AppManagement.ViewConsole",
        "Core.AppManagement.SendConsoleInput",
        "-Core.AppManagement.UpdateApplication",
        "-LocalFileBackup.*",
    ]
    .iter()
    .map(|node| node.to_string())
    .collect()
}

/// The panel itself. Needs role and user management so it can provision the
/// dedicated role.
pub struct PanelCore;

impl ModuleBehavior for PanelCore {
    fn name(&self) -> &'static str {
        "panel-core"
    }

    fn is_chat_entry(&self, _entry: &ConsoleEntry) -> bool {
        false
    }

    fn should_filter(&self, _entry: &ConsoleEntry) -> bool {
        false
    }

    fn required_permissions(&self) -> Vec<String> {
        [
            "Core.RoleManagement.CreateNewRole",
            "Core.RoleManagement.SetPermissions",
            "Core.RoleManagement.EditRoles",
            "Core.UserManagement.ViewUserInfo",
            "Core.UserManagement.EditUserRoles",
            "ADS.InstanceManagement.ViewInstances",
            "-Core.AuditLog.View",
            "-Core.Scheduler.EditSchedule",
        ]
        .iter()
        .map(|node| node.to_string())
        .collect()
    }
}

pub struct GenericModule;

impl ModuleBehavior for GenericModule {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn is_chat_entry(&self, entry: &ConsoleEntry) -> bool {
        is_panel_chat(entry)
    }

    fn should_filter(&self, entry: &ConsoleEntry) -> bool {
        entry.contents.trim().is_empty()
    }

    fn required_permissions(&self) -> Vec<String> {
        instance_permissions()
    }
}

const MINECRAFT_NOISE: &[&str] = &[
    "Can't keep up! Is the server overloaded?",
    "UUID of player",
    "moved too quickly!",
    "moved wrongly!",
    "Saving the game",
    "Saved the game",
];

pub struct MinecraftModule;

impl ModuleBehavior for MinecraftModule {
    fn name(&self) -> &'static str {
        "minecraft"
    }

    fn is_chat_entry(&self, entry: &ConsoleEntry) -> bool {
        is_panel_chat(entry)
    }

    fn should_filter(&self, entry: &ConsoleEntry) -> bool {
        let contents = entry.contents.trim();
        contents.is_empty() || MINECRAFT_NOISE.iter().any(|noise| contents.contains(noise))
    }

    fn required_permissions(&self) -> Vec<String> {
        let mut nodes = instance_permissions();
        nodes.push("Minecraft.PlayerManagement.*".to_string());
        nodes
    }
}
