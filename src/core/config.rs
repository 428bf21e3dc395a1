use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Engine-wide tuning knobs. Every field has a working default; a TOML
/// file can override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Primary model identifier handed to the analysis provider.
    pub primary_model: String,
    /// Cheaper/faster model tried after the primary tier is exhausted.
    pub fallback_model: String,
    /// Extra attempts per model tier after the first (total = 1 + max_retries).
    pub max_retries: usize,
    /// Similarity score at or above which two distinct normalized names are
    /// flagged as near-duplicates. Tuning, not correctness: never auto-merged.
    pub fuzzy_threshold: f64,
    /// Events retained per case for late subscribers.
    pub event_buffer_capacity: usize,
    /// Per-subscriber queue depth; a full queue drops events for that
    /// subscriber only.
    pub subscriber_queue_capacity: usize,
    /// Analyst outputs longer than this are truncated before persisting.
    pub output_truncate_limit: usize,
    /// Minimum confidence per analyst kind below which findings are held for
    /// human review. A kind absent from the map is never gated.
    pub review_thresholds: HashMap<String, u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            primary_model: "gpt-4o".to_string(),
            fallback_model: "gpt-4o-mini".to_string(),
            max_retries: 2,
            fuzzy_threshold: 0.85,
            event_buffer_capacity: 100,
            subscriber_queue_capacity: 64,
            output_truncate_limit: 8000,
            review_thresholds: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let cfg: EngineConfig = toml::from_str(&raw)?;
        Ok(cfg)
    }

    /// Load from a file if it exists, otherwise defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(cfg) => cfg,
            Err(_) => Self::default(),
        }
    }
}
