use crate::config::Config;

/// Stands in for the original's model catalog lookups against the wider
/// open-webui model registry (out of scope here — spec.md §7 "Model
/// catalog"). Exposes just enough to validate a request's `model_id` and
/// tell the selector which backends can serve it.
#[derive(Clone)]
pub struct ModelRegistry {
    known_models: Vec<String>,
}

impl ModelRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            known_models: config.model_backend_map.keys().cloned().collect(),
        }
    }

    /// A model not present in `MODEL_BACKEND_MAP` is still accepted — it
    /// just means every configured backend is a candidate (spec.md §5.3).
    pub fn is_known(&self, model_id: &str) -> bool {
        self.known_models.iter().any(|m| m == model_id)
    }
}
