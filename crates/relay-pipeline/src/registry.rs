//! Module registry: typed factories and owned module instances.
//!
//! The factory table is keyed by the closed [`ModuleKind`] enum, so a
//! factory can only ever produce the kind it was registered for; there is no
//! stringly-typed dispatch. Providers are owned here and live as long as the
//! registry does.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use relay_types::{
    Compatibility, ModuleKind, ModuleStatus, ProtocolSwitch, Provider, RelayError, Result,
    VirtualModel, Workflow,
};

/// Configuration handed to a module factory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub id: String,
    pub kind: ModuleKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl ModuleConfig {
    pub fn new(id: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            options: HashMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

/// One factory per module kind; the variant ties the produced trait object
/// to the kind it was registered under.
pub enum ModuleFactory {
    ProtocolSwitch(Box<dyn Fn(&ModuleConfig) -> Result<Arc<dyn ProtocolSwitch>> + Send + Sync>),
    Workflow(Box<dyn Fn(&ModuleConfig) -> Result<Arc<dyn Workflow>> + Send + Sync>),
    Compatibility(Box<dyn Fn(&ModuleConfig) -> Result<Arc<dyn Compatibility>> + Send + Sync>),
    Provider(Box<dyn Fn(&ModuleConfig) -> Result<Arc<dyn Provider>> + Send + Sync>),
}

impl ModuleFactory {
    fn kind(&self) -> ModuleKind {
        match self {
            ModuleFactory::ProtocolSwitch(_) => ModuleKind::ProtocolSwitch,
            ModuleFactory::Workflow(_) => ModuleKind::Workflow,
            ModuleFactory::Compatibility(_) => ModuleKind::Compatibility,
            ModuleFactory::Provider(_) => ModuleKind::Provider,
        }
    }
}

/// Registry of module instances, factories, and virtual models.
pub struct ModuleRegistry {
    switches: DashMap<String, Arc<dyn ProtocolSwitch>>,
    workflows: DashMap<String, Arc<dyn Workflow>>,
    compats: DashMap<String, Arc<dyn Compatibility>>,
    providers: DashMap<String, Arc<dyn Provider>>,
    factories: DashMap<ModuleKind, ModuleFactory>,
    virtual_models: DashMap<String, VirtualModel>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            switches: DashMap::new(),
            workflows: DashMap::new(),
            compats: DashMap::new(),
            providers: DashMap::new(),
            factories: DashMap::new(),
            virtual_models: DashMap::new(),
        }
    }

    /// Register the factory for one module kind, replacing any previous one.
    pub fn register_factory(&self, factory: ModuleFactory) {
        let kind = factory.kind();
        info!(kind = kind.as_str(), "registering module factory");
        self.factories.insert(kind, factory);
    }

    /// Build and register a module from its configuration using the factory
    /// table.
    pub fn load(&self, config: &ModuleConfig) -> Result<()> {
        if !config.enabled {
            info!(module_id = %config.id, "module disabled, skipping");
            return Ok(());
        }
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            RelayError::Configuration(format!(
                "no factory registered for module kind '{}'",
                config.kind
            ))
        })?;
        match factory.value() {
            ModuleFactory::ProtocolSwitch(build) => {
                let module = build(config)?;
                self.switches.insert(config.id.clone(), module);
            }
            ModuleFactory::Workflow(build) => {
                let module = build(config)?;
                self.workflows.insert(config.id.clone(), module);
            }
            ModuleFactory::Compatibility(build) => {
                let module = build(config)?;
                self.compats.insert(config.id.clone(), module);
            }
            ModuleFactory::Provider(build) => {
                let module = build(config)?;
                self.providers.insert(config.id.clone(), module);
            }
        }
        info!(module_id = %config.id, kind = config.kind.as_str(), "module loaded");
        Ok(())
    }

    pub fn register_switch(&self, module: Arc<dyn ProtocolSwitch>) {
        self.switches.insert(module.id().to_string(), module);
    }

    pub fn register_workflow(&self, module: Arc<dyn Workflow>) {
        self.workflows.insert(module.id().to_string(), module);
    }

    pub fn register_compatibility(&self, module: Arc<dyn Compatibility>) {
        self.compats.insert(module.id().to_string(), module);
    }

    pub fn register_provider(&self, module: Arc<dyn Provider>) {
        self.providers.insert(module.id().to_string(), module);
    }

    pub fn register_virtual_model(&self, model: VirtualModel) -> Result<()> {
        model.validate()?;
        self.virtual_models.insert(model.id.clone(), model);
        Ok(())
    }

    pub fn switch(&self, id: &str) -> Option<Arc<dyn ProtocolSwitch>> {
        self.switches.get(id).map(|e| e.value().clone())
    }

    pub fn workflow(&self, id: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(id).map(|e| e.value().clone())
    }

    pub fn compatibility(&self, id: &str) -> Option<Arc<dyn Compatibility>> {
        self.compats.get(id).map(|e| e.value().clone())
    }

    pub fn provider(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub fn virtual_model(&self, id: &str) -> Option<VirtualModel> {
        self.virtual_models.get(id).map(|e| e.value().clone())
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn switch_ids(&self) -> Vec<String> {
        self.switches.iter().map(|e| e.key().clone()).collect()
    }

    pub fn workflow_ids(&self) -> Vec<String> {
        self.workflows.iter().map(|e| e.key().clone()).collect()
    }

    pub fn compatibility_ids(&self) -> Vec<String> {
        self.compats.iter().map(|e| e.key().clone()).collect()
    }

    pub fn providers(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn has_module(&self, kind: ModuleKind, id: &str) -> bool {
        match kind {
            ModuleKind::ProtocolSwitch => self.switches.contains_key(id),
            ModuleKind::Workflow => self.workflows.contains_key(id),
            ModuleKind::Compatibility => self.compats.contains_key(id),
            ModuleKind::Provider => self.providers.contains_key(id),
        }
    }

    /// Status of every registered module.
    pub fn module_statuses(&self) -> Vec<ModuleStatus> {
        let mut statuses = Vec::new();
        statuses.extend(self.switches.iter().map(|e| e.value().status()));
        statuses.extend(self.workflows.iter().map(|e| e.value().status()));
        statuses.extend(self.compats.iter().map(|e| e.value().status()));
        statuses.extend(self.providers.iter().map(|e| e.value().status()));
        statuses
    }

    /// Shut every module down, providers last.
    pub async fn shutdown_all(&self) {
        for entry in self.switches.iter() {
            entry.value().shutdown().await;
        }
        for entry in self.workflows.iter() {
            entry.value().shutdown().await;
        }
        for entry in self.compats.iter() {
            entry.value().shutdown().await;
        }
        for entry in self.providers.iter() {
            entry.value().shutdown().await;
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register factories for the built-in module implementations.
pub fn register_builtin_factories(registry: &ModuleRegistry) {
    registry.register_factory(ModuleFactory::ProtocolSwitch(Box::new(|config| {
        Ok(Arc::new(crate::modules::StandardSwitch::new(&config.id))
            as Arc<dyn ProtocolSwitch>)
    })));
    registry.register_factory(ModuleFactory::Workflow(Box::new(|config| {
        Ok(Arc::new(crate::modules::BufferingWorkflow::new(&config.id)) as Arc<dyn Workflow>)
    })));
    registry.register_factory(ModuleFactory::Compatibility(Box::new(|config| {
        let maps = match config.options.get("field_maps") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                RelayError::Configuration(format!("invalid field_maps option: {err}"))
            })?,
            None => HashMap::new(),
        };
        Ok(Arc::new(crate::modules::FieldMapCompatibility::new(&config.id, maps))
            as Arc<dyn Compatibility>)
    })));
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_types::Target;

    #[test]
    fn factory_table_builds_modules_by_kind() {
        let registry = ModuleRegistry::new();
        register_builtin_factories(&registry);

        registry
            .load(&ModuleConfig::new("switch.main", ModuleKind::ProtocolSwitch))
            .unwrap();
        registry
            .load(&ModuleConfig::new("workflow.main", ModuleKind::Workflow))
            .unwrap();
        registry
            .load(&ModuleConfig::new("compat.main", ModuleKind::Compatibility))
            .unwrap();

        assert!(registry.has_module(ModuleKind::ProtocolSwitch, "switch.main"));
        assert!(registry.has_module(ModuleKind::Workflow, "workflow.main"));
        assert!(registry.has_module(ModuleKind::Compatibility, "compat.main"));
    }

    #[test]
    fn missing_factory_is_a_configuration_error() {
        let registry = ModuleRegistry::new();
        let err = registry
            .load(&ModuleConfig::new("p1", ModuleKind::Provider))
            .unwrap_err();
        assert!(matches!(err, RelayError::Configuration(_)));
    }

    #[test]
    fn disabled_module_is_skipped() {
        let registry = ModuleRegistry::new();
        register_builtin_factories(&registry);
        let mut config = ModuleConfig::new("switch.off", ModuleKind::ProtocolSwitch);
        config.enabled = false;
        registry.load(&config).unwrap();
        assert!(!registry.has_module(ModuleKind::ProtocolSwitch, "switch.off"));
    }

    #[test]
    fn virtual_models_must_have_targets() {
        let registry = ModuleRegistry::new();
        assert!(registry
            .register_virtual_model(VirtualModel::new("vm-empty"))
            .is_err());
        registry
            .register_virtual_model(VirtualModel::new("vm-a").with_target(Target::new("p1")))
            .unwrap();
        assert!(registry.virtual_model("vm-a").is_some());
    }
}
