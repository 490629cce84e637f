//! Model catalog: layer counts and memory requirements per model.

use std::collections::HashMap;

pub const DEFAULT_LAYER_COUNT: u32 = 32;
pub const DEFAULT_MEM_REQ_MB: u64 = 8_000;

/// Per-model layer counts and memory requirements, with fallbacks for
/// models the table doesn't know.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    layers: HashMap<String, u32>,
    mem_req_mb: HashMap<String, u64>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        let mut layers = HashMap::new();
        layers.insert("llama-3-8b".to_string(), 32);
        layers.insert("llama-3-70b".to_string(), 80);
        layers.insert("mistral-7b".to_string(), 32);
        layers.insert("qwen-2-72b".to_string(), 80);

        let mut mem_req_mb = HashMap::new();
        mem_req_mb.insert("llama-3-8b".to_string(), 8_000);
        mem_req_mb.insert("llama-3-70b".to_string(), 40_000);
        mem_req_mb.insert("mistral-7b".to_string(), 8_000);
        mem_req_mb.insert("qwen-2-72b".to_string(), 42_000);

        Self { layers, mem_req_mb }
    }

    /// Override or add a model entry
    pub fn insert(&mut self, model: &str, layers: u32, mem_req_mb: u64) {
        self.layers.insert(model.to_string(), layers);
        self.mem_req_mb.insert(model.to_string(), mem_req_mb);
    }

    pub fn layer_count(&self, model: &str) -> u32 {
        self.layers.get(model).copied().unwrap_or(DEFAULT_LAYER_COUNT)
    }

    pub fn mem_req_mb(&self, model: &str) -> u64 {
        self.mem_req_mb
            .get(model)
            .copied()
            .unwrap_or(DEFAULT_MEM_REQ_MB)
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_model_falls_back() {
        let catalog = ModelCatalog::new();
        assert_eq!(catalog.layer_count("no-such-model"), DEFAULT_LAYER_COUNT);
        assert_eq!(catalog.mem_req_mb("no-such-model"), DEFAULT_MEM_REQ_MB);
    }

    #[test]
    fn insert_overrides() {
        let mut catalog = ModelCatalog::new();
        catalog.insert("custom-20b", 48, 18_000);
        assert_eq!(catalog.layer_count("custom-20b"), 48);
        assert_eq!(catalog.mem_req_mb("custom-20b"), 18_000);
    }
}
