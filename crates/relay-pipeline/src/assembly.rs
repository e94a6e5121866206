//! Pipeline assemblies: immutable wiring descriptions validated at build
//! time.
//!
//! An assembly names its modules and the connections between them. Wiring
//! walks the connection DAG topologically (cycles are rejected outright),
//! checks every referenced module against the registry, and produces the
//! typed handles the executor runs with.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use relay_types::{
    Compatibility, ModuleKind, ProtocolSwitch, RelayError, Result, Workflow,
};

use crate::registry::ModuleRegistry;

/// One module participating in an assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleNode {
    pub id: String,
    pub kind: ModuleKind,
}

/// A directed edge between two modules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub from: String,
    pub to: String,
}

/// Immutable description of a wired pipeline. Built once per reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineAssembly {
    pub id: String,
    pub name: String,
    pub version: String,
    pub modules: Vec<ModuleNode>,
    pub connections: Vec<Connection>,
}

impl PipelineAssembly {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            modules: Vec::new(),
            connections: Vec::new(),
        }
    }

    pub fn with_module(mut self, id: impl Into<String>, kind: ModuleKind) -> Self {
        self.modules.push(ModuleNode {
            id: id.into(),
            kind,
        });
        self
    }

    pub fn with_connection(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.connections.push(Connection {
            from: from.into(),
            to: to.into(),
        });
        self
    }

    /// Kahn's algorithm over the connection DAG. Rejects edges referencing
    /// unknown modules and any cycle.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let known: HashMap<&str, &ModuleNode> =
            self.modules.iter().map(|m| (m.id.as_str(), m)).collect();

        let mut in_degree: HashMap<&str, usize> =
            self.modules.iter().map(|m| (m.id.as_str(), 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

        for connection in &self.connections {
            for endpoint in [&connection.from, &connection.to] {
                if !known.contains_key(endpoint.as_str()) {
                    return Err(RelayError::Configuration(format!(
                        "assembly '{}' references unknown module '{}'",
                        self.id, endpoint
                    )));
                }
            }
            edges
                .entry(connection.from.as_str())
                .or_default()
                .push(connection.to.as_str());
            *in_degree.get_mut(connection.to.as_str()).unwrap() += 1;
        }

        let mut queue: VecDeque<&str> = {
            let mut roots: Vec<&str> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| *id)
                .collect();
            roots.sort_unstable();
            roots.into_iter().collect()
        };

        let mut order = Vec::with_capacity(self.modules.len());
        while let Some(node) = queue.pop_front() {
            order.push(node.to_string());
            for next in edges.get(node).into_iter().flatten().copied() {
                let degree = in_degree.get_mut(next).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != self.modules.len() {
            return Err(RelayError::Configuration(format!(
                "assembly '{}' contains a cycle",
                self.id
            )));
        }
        Ok(order)
    }

    /// Validate the assembly against a registry and produce the typed
    /// handles the executor runs with.
    ///
    /// Exactly one switch, one workflow, and one compatibility module must
    /// be present; providers are resolved per request by the router.
    pub fn wire(&self, registry: &ModuleRegistry) -> Result<WiredPipeline> {
        self.topological_order()?;

        for module in &self.modules {
            if !registry.has_module(module.kind, &module.id) {
                return Err(RelayError::Configuration(format!(
                    "assembly '{}' references unregistered {} '{}'",
                    self.id, module.kind, module.id
                )));
            }
        }

        let switch_id = self.single_module_of(ModuleKind::ProtocolSwitch)?;
        let workflow_id = self.single_module_of(ModuleKind::Workflow)?;
        let compat_id = self.single_module_of(ModuleKind::Compatibility)?;

        Ok(WiredPipeline {
            assembly_id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            switch: registry.switch(&switch_id).expect("checked above"),
            workflow: registry.workflow(&workflow_id).expect("checked above"),
            compat: registry.compatibility(&compat_id).expect("checked above"),
        })
    }

    fn single_module_of(&self, kind: ModuleKind) -> Result<String> {
        let mut matches = self.modules.iter().filter(|m| m.kind == kind);
        let first = matches.next().ok_or_else(|| {
            RelayError::Configuration(format!(
                "assembly '{}' declares no {} module",
                self.id, kind
            ))
        })?;
        if matches.next().is_some() {
            return Err(RelayError::Configuration(format!(
                "assembly '{}' declares more than one {} module",
                self.id, kind
            )));
        }
        Ok(first.id.clone())
    }
}

/// Typed module handles for one validated assembly.
#[derive(Clone)]
pub struct WiredPipeline {
    pub assembly_id: String,
    pub name: String,
    pub version: String,
    pub switch: Arc<dyn ProtocolSwitch>,
    pub workflow: Arc<dyn Workflow>,
    pub compat: Arc<dyn Compatibility>,
}

impl std::fmt::Debug for WiredPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredPipeline")
            .field("assembly_id", &self.assembly_id)
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::{BufferingWorkflow, FieldMapCompatibility, StandardSwitch};
    use std::collections::HashMap as StdHashMap;

    fn assembly() -> PipelineAssembly {
        PipelineAssembly::new("asm-1", "default", "1.0.0")
            .with_module("switch.main", ModuleKind::ProtocolSwitch)
            .with_module("workflow.main", ModuleKind::Workflow)
            .with_module("compat.main", ModuleKind::Compatibility)
            .with_connection("switch.main", "workflow.main")
            .with_connection("workflow.main", "compat.main")
    }

    fn registry() -> ModuleRegistry {
        let registry = ModuleRegistry::new();
        registry.register_switch(Arc::new(StandardSwitch::new("switch.main")));
        registry.register_workflow(Arc::new(BufferingWorkflow::new("workflow.main")));
        registry.register_compatibility(Arc::new(FieldMapCompatibility::new(
            "compat.main",
            StdHashMap::new(),
        )));
        registry
    }

    #[test]
    fn topological_order_follows_connections() {
        let order = assembly().topological_order().unwrap();
        assert_eq!(
            order,
            vec!["switch.main", "workflow.main", "compat.main"]
        );
    }

    #[test]
    fn cycles_are_rejected() {
        let looped = assembly().with_connection("compat.main", "switch.main");
        let err = looped.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_endpoint_is_rejected() {
        let broken = assembly().with_connection("compat.main", "ghost");
        assert!(broken.topological_order().is_err());
    }

    #[test]
    fn wiring_resolves_typed_handles() {
        let wired = assembly().wire(&registry()).unwrap();
        assert_eq!(wired.assembly_id, "asm-1");
        assert_eq!(wired.switch.id(), "switch.main");
        assert_eq!(wired.workflow.id(), "workflow.main");
        assert_eq!(wired.compat.id(), "compat.main");
    }

    #[test]
    fn wiring_requires_registered_modules() {
        let registry = ModuleRegistry::new();
        assert!(assembly().wire(&registry).is_err());
    }

    #[test]
    fn duplicate_kind_is_rejected() {
        let registry = registry();
        registry.register_switch(Arc::new(StandardSwitch::new("switch.extra")));
        let doubled = assembly().with_module("switch.extra", ModuleKind::ProtocolSwitch);
        let err = doubled.wire(&registry).unwrap_err();
        assert!(err.to_string().contains("more than one"));
    }
}
