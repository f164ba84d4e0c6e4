//! Block Registry - Central registry of block definitions
//!
//! This module provides the registry that holds every block definition a graph
//! may instantiate. It supports:
//! - Block registration with definition validation
//! - Block lookup by definition ID
//! - Block discovery by category or search query
//!
//! The registry is populated before it is handed to a graph or simulator. Both
//! hold it behind an `Arc`, so it cannot change while designs reference it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::block::{BlockCategory, BlockMetadata};
use super::constraint::{Capability, CapabilityRequirement, DependencyConstraint};
use super::metrics::MetricDefinition;
use super::parameter::{resolve_parameters, Parameter, ParameterSet};
use super::port::Port;
use crate::categories::BlockKind;

/// Immutable template for a block type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Runtime implementation backing this definition
    pub kind: BlockKind,
    pub metadata: BlockMetadata,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub parameters: Vec<Parameter>,
    /// What must be reachable upstream of an instance
    pub constraints: Vec<DependencyConstraint>,
    /// Lookup capabilities offered to downstream blocks
    pub capabilities: BTreeSet<Capability>,
    /// Capabilities required from the blocks feeding specific inputs
    pub capability_requirements: Vec<CapabilityRequirement>,
    pub metrics: Vec<MetricDefinition>,
    /// Entry blocks receive every workload request directly
    pub entry: bool,
}

impl BlockDefinition {
    /// Definition ID (e.g. `heap_storage`)
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn category(&self) -> BlockCategory {
        self.metadata.category
    }

    pub fn input(&self, port: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.id == port)
    }

    pub fn output(&self, port: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.id == port)
    }

    pub fn offers(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Resolve instance parameters against the declared ones, filling defaults.
    /// Errors carry `(parameter, reason)`.
    pub fn resolve_parameters(&self, overrides: &ParameterSet) -> Result<ParameterSet, (String, String)> {
        resolve_parameters(&self.parameters, overrides)
    }

    /// Structural checks run at registration
    fn check(&self) -> Result<(), String> {
        if self.metadata.id.is_empty() {
            return Err("Block id cannot be empty".into());
        }
        if self.metadata.name.is_empty() {
            return Err("Block name cannot be empty".into());
        }
        if self.metadata.version.is_empty() {
            return Err("Block version cannot be empty".into());
        }

        for ports in [&self.inputs, &self.outputs] {
            let mut seen = BTreeSet::new();
            for port in ports.iter() {
                if !seen.insert(port.id.as_str()) {
                    return Err(format!("Duplicate port '{}' on {}", port.id, self.metadata.id));
                }
            }
        }

        for param in &self.parameters {
            param
                .validate(&param.default_value)
                .map_err(|e| format!("Invalid default for {}: {}", param.id, e))?;
        }

        for req in &self.capability_requirements {
            if self.input(&req.port).is_none() {
                return Err(format!(
                    "Capability requirement names unknown input '{}'",
                    req.port
                ));
            }
        }
        Ok(())
    }
}

/// Registry of block definitions keyed by definition ID
#[derive(Debug, Clone, Default)]
pub struct BlockRegistry {
    definitions: BTreeMap<String, Arc<BlockDefinition>>,
}

impl BlockRegistry {
    /// Create a new empty block registry
    ///
    /// # Example
    /// ```
    /// use db_block_sim::core::registry::BlockRegistry;
    ///
    /// let registry = BlockRegistry::new();
    /// assert_eq!(registry.count(), 0);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in block registered
    pub fn with_builtin_blocks() -> Self {
        let mut registry = Self::new();
        for kind in BlockKind::ALL {
            // Built-in definitions are distinct and well formed.
            if let Err(e) = registry.register(kind.definition()) {
                tracing::warn!(block = ?kind, error = %e, "skipping built-in block");
            }
        }
        registry
    }

    /// Register a new block definition
    ///
    /// # Returns
    /// * `Ok(())` if registration succeeds
    /// * `Err(RegistryError)` if the ID already exists or the definition is malformed
    pub fn register(&mut self, definition: BlockDefinition) -> Result<(), RegistryError> {
        definition.check().map_err(RegistryError::InvalidDefinition)?;

        let id = definition.id().to_string();
        if self.definitions.contains_key(&id) {
            return Err(RegistryError::DuplicateBlockId(id));
        }

        self.definitions.insert(id, Arc::new(definition));
        Ok(())
    }

    /// Get a definition by its ID
    pub fn lookup(&self, id: &str) -> Result<Arc<BlockDefinition>, RegistryError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownBlock(id.to_string()))
    }

    /// All definitions, ordered by ID
    pub fn definitions(&self) -> Vec<Arc<BlockDefinition>> {
        self.definitions.values().cloned().collect()
    }

    /// Definitions filtered by category
    pub fn definitions_by_category(&self, category: BlockCategory) -> Vec<Arc<BlockDefinition>> {
        self.definitions
            .values()
            .filter(|d| d.category() == category)
            .cloned()
            .collect()
    }

    /// Search for definitions by query string
    ///
    /// Searches ID, name and description, case-insensitively.
    pub fn search(&self, query: &str) -> Vec<Arc<BlockDefinition>> {
        let query = query.to_lowercase();

        self.definitions
            .values()
            .filter(|d| {
                let meta = &d.metadata;
                meta.id.to_lowercase().contains(&query)
                    || meta.name.to_lowercase().contains(&query)
                    || meta.description.to_lowercase().contains(&query)
            })
            .cloned()
            .collect()
    }

    /// Get the number of registered definitions
    pub fn count(&self) -> usize {
        self.definitions.len()
    }

    /// Check if a definition with the given ID exists
    pub fn contains(&self, id: &str) -> bool {
        self.definitions.contains_key(id)
    }
}

/// Registry error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Definition with given ID was not found
    #[error("Unknown block: {0}")]
    UnknownBlock(String),

    /// Attempted to register a definition with a duplicate ID
    #[error("Duplicate block ID: {0}")]
    DuplicateBlockId(String),

    /// Definition failed structural checks
    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_creation() {
        let registry = BlockRegistry::new();
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_builtin_blocks_registered() {
        let registry = BlockRegistry::with_builtin_blocks();
        assert_eq!(registry.count(), BlockKind::ALL.len());
        for kind in BlockKind::ALL {
            assert!(registry.contains(kind.definition_id()), "{:?}", kind);
        }
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = BlockRegistry::new();
        registry.register(BlockKind::HeapStorage.definition()).unwrap();

        let result = registry.register(BlockKind::HeapStorage.definition());
        assert_eq!(
            result.unwrap_err(),
            RegistryError::DuplicateBlockId("heap_storage".into())
        );
    }

    #[test]
    fn test_lookup_unknown() {
        let registry = BlockRegistry::with_builtin_blocks();
        assert!(registry.lookup("btree_index").is_ok());
        assert!(matches!(
            registry.lookup("quantum_index").unwrap_err(),
            RegistryError::UnknownBlock(_)
        ));
    }

    #[test]
    fn test_definitions_by_category() {
        let registry = BlockRegistry::with_builtin_blocks();
        let storage: Vec<_> = registry
            .definitions_by_category(BlockCategory::Storage)
            .iter()
            .map(|d| d.id().to_string())
            .collect();
        assert_eq!(storage, vec!["clustered_storage", "heap_storage", "lsm_storage"]);

        assert_eq!(registry.definitions_by_category(BlockCategory::Buffer).len(), 2);
        assert_eq!(registry.definitions_by_category(BlockCategory::Source).len(), 1);
    }

    #[test]
    fn test_search() {
        let registry = BlockRegistry::with_builtin_blocks();
        let hits: Vec<_> = registry.search("JOIN").iter().map(|d| d.id().to_string()).collect();
        assert_eq!(hits, vec!["hash_join", "nested_loop_join"]);
        assert!(registry.search("no-such-thing").is_empty());
    }

    #[test]
    fn test_validation_empty_name() {
        let mut registry = BlockRegistry::new();
        let mut def = BlockKind::Sort.definition();
        def.metadata.name.clear();

        assert!(matches!(
            registry.register(def).unwrap_err(),
            RegistryError::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_validation_duplicate_port() {
        let mut registry = BlockRegistry::new();
        let mut def = BlockKind::Sort.definition();
        let dup = def.outputs[0].clone();
        def.outputs.push(dup);

        assert!(matches!(
            registry.register(def).unwrap_err(),
            RegistryError::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_validation_bad_default() {
        let mut registry = BlockRegistry::new();
        let mut def = BlockKind::HeapStorage.definition();
        def.parameters[0].default_value = 1i64.into();

        assert!(matches!(
            registry.register(def).unwrap_err(),
            RegistryError::InvalidDefinition(_)
        ));
    }

    #[test]
    fn test_registry_shared_across_threads() {
        use std::thread;

        let registry = Arc::new(BlockRegistry::with_builtin_blocks());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || registry.lookup("mvcc").map(|d| d.id().to_string()))
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), "mvcc");
        }
    }
}
