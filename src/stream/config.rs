use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::foundation::error::{TexError, TexResult};
use crate::foundation::memory::MemoryConfig;
use crate::j2c::{FIRST_PACKET_SIZE, J2cConfig};

/// Scheduler tuning. Every field has a default, so a JSON file only needs the overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Entries whose priority is recomputed per frame, before frame-time scaling.
    pub max_priority_updates: usize,
    /// Top-priority entries serviced every frame, before frame-time scaling.
    pub high_priority_count: usize,
    /// Round-robin window serviced per frame, before frame-time scaling.
    pub max_medium_updates: usize,
    /// Round-robin entries serviced before the time budget applies.
    pub min_medium_updates: usize,
    /// Leave zero-priority entries without requests out of the round-robin window.
    pub skip_low_priority: bool,
    /// Idle seconds at zero priority before an entry drops its compressed bytes.
    pub flush_timeout_secs: f32,
    /// Idle seconds at zero priority before an unreferenced entry is removed.
    pub delete_timeout_secs: f32,
    /// Seconds a saved raw copy survives after eviction.
    pub saved_raw_timeout_secs: f32,
    /// Size of the first request for a texture whose header is unknown.
    pub first_fetch_bytes: usize,
    /// Fetch completions applied per frame.
    pub max_fetch_results: usize,
    /// Decode completions applied per frame.
    pub max_decode_results: usize,
    /// Time slice a decode worker spends before re-checking cancellation.
    pub decode_slice_ms: u64,
    /// Decode worker threads, `None` for rayon's default.
    pub decode_threads: Option<usize>,
    /// Entries flushed per frame while over the resident budget.
    pub max_flush_per_frame: usize,
    /// J2C codec settings for fetched textures.
    pub j2c: J2cConfig,
    /// Texture memory settings.
    pub memory: MemoryConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_priority_updates: 32,
            high_priority_count: 32,
            max_medium_updates: 256,
            min_medium_updates: 32,
            skip_low_priority: false,
            flush_timeout_secs: 30.0,
            delete_timeout_secs: 60.0,
            saved_raw_timeout_secs: 20.0,
            first_fetch_bytes: FIRST_PACKET_SIZE,
            max_fetch_results: 64,
            max_decode_results: 32,
            decode_slice_ms: 10,
            decode_threads: None,
            max_flush_per_frame: 16,
            j2c: J2cConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

fn secs(name: &str, v: f32) -> TexResult<()> {
    if !v.is_finite() || v < 0.0 {
        return Err(TexError::config(format!("{name} must be finite and >= 0")));
    }
    Ok(())
}

impl StreamingConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> TexResult<Self> {
        let cfg: Self = serde_json::from_str(s)
            .map_err(|e| TexError::config(format!("invalid streaming config json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: &Path) -> TexResult<Self> {
        let s = std::fs::read_to_string(path)?;
        Self::from_json_str(&s)
    }

    pub fn validate(&self) -> TexResult<()> {
        if self.max_priority_updates == 0 {
            return Err(TexError::config("max_priority_updates must be >= 1"));
        }
        if self.max_medium_updates < self.min_medium_updates {
            return Err(TexError::config(
                "max_medium_updates must be >= min_medium_updates",
            ));
        }
        secs("flush_timeout_secs", self.flush_timeout_secs)?;
        secs("delete_timeout_secs", self.delete_timeout_secs)?;
        secs("saved_raw_timeout_secs", self.saved_raw_timeout_secs)?;
        if self.delete_timeout_secs < self.flush_timeout_secs {
            return Err(TexError::config(
                "delete_timeout_secs must be >= flush_timeout_secs",
            ));
        }
        if self.first_fetch_bytes == 0 {
            return Err(TexError::config("first_fetch_bytes must be > 0"));
        }
        if self.max_fetch_results == 0 || self.max_decode_results == 0 {
            return Err(TexError::config("per-frame result limits must be >= 1"));
        }
        if self.decode_threads == Some(0) {
            return Err(TexError::config("decode_threads must be >= 1 when set"));
        }
        self.j2c.validate()?;
        self.memory.validate()
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.flush_timeout_secs)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.delete_timeout_secs)
    }

    pub fn saved_raw_timeout(&self) -> Duration {
        Duration::from_secs_f32(self.saved_raw_timeout_secs)
    }

    pub fn decode_slice(&self) -> Duration {
        Duration::from_millis(self.decode_slice_ms)
    }
}

/// Per-frame window size `min(n * n * frame_interval + 1, n)`: short frames service fewer
/// entries, long frames catch up to the full `n`.
pub fn frame_window(n: usize, frame_interval: Duration) -> usize {
    let scaled = (n as f64 * n as f64 * frame_interval.as_secs_f64()) as usize;
    scaled.saturating_add(1).min(n)
}

#[cfg(test)]
#[path = "../../tests/unit/stream/config.rs"]
mod tests;
