use std::collections::HashMap;
use std::sync::Arc;

use crate::source::Source;

/// Source registry - resolves source identifiers to adapters
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn Source>>,
}

impl SourceRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            sources: HashMap::new(),
        }
    }

    /// Register a source under its own identifier, replacing any previous one
    pub fn register(&mut self, source: Arc<dyn Source>) {
        let source_id = source.source_id().to_string();
        self.sources.insert(source_id, source);
    }

    /// Get a source by identifier
    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(source_id).cloned()
    }

    /// Check if a source is registered
    pub fn is_registered(&self, source_id: &str) -> bool {
        self.sources.contains_key(source_id)
    }

    /// Get all registered source identifiers, sorted
    pub fn source_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sources.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Get count of registered sources
    pub fn count(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
