//! Process-wide image memory accounting and the VRAM-derived texture budget.
//!
//! Raw pixel buffers are allocated on decode workers while formatted buffers are managed on the
//! owning thread, so every counter is an atomic. The process-wide instance is reached through
//! [`global`]; [`MemoryCounters::init`] and [`MemoryCounters::teardown`] bracket its lifetime.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use crate::foundation::error::{TexError, TexResult};

const MIB: i64 = 1024 * 1024;

/// Atomic byte counters for raw, formatted and GL-resident image memory.
#[derive(Debug)]
pub struct MemoryCounters {
    raw_bytes: AtomicI64,
    formatted_bytes: AtomicI64,
    gl_bytes: AtomicI64,
    raw_images: AtomicI64,
    initialized: AtomicBool,
}

/// Point-in-time copy of [`MemoryCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySnapshot {
    /// Bytes held by decoded pixel buffers.
    pub raw_bytes: i64,
    /// Bytes held by compressed buffers.
    pub formatted_bytes: i64,
    /// Bytes considered resident on the GPU.
    pub gl_bytes: i64,
    /// Live pixel buffer count.
    pub raw_images: i64,
}

impl Default for MemoryCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCounters {
    /// Zeroed counters.
    pub const fn new() -> Self {
        Self {
            raw_bytes: AtomicI64::new(0),
            formatted_bytes: AtomicI64::new(0),
            gl_bytes: AtomicI64::new(0),
            raw_images: AtomicI64::new(0),
            initialized: AtomicBool::new(false),
        }
    }

    /// Mark the counters live. Returns `false` if they already were.
    pub fn init(&self) -> bool {
        let first = !self.initialized.swap(true, Ordering::AcqRel);
        if first {
            tracing::debug!("image memory accounting initialized");
        }
        first
    }

    /// Reset every counter and mark the accounting torn down.
    ///
    /// Buffers still alive after teardown keep decrementing, so a non-zero snapshot afterwards
    /// points at leaked owners.
    pub fn teardown(&self) {
        let snap = self.snapshot();
        if snap.raw_bytes != 0 || snap.formatted_bytes != 0 {
            tracing::warn!(?snap, "image memory still accounted at teardown");
        }
        self.raw_bytes.store(0, Ordering::Release);
        self.formatted_bytes.store(0, Ordering::Release);
        self.gl_bytes.store(0, Ordering::Release);
        self.raw_images.store(0, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
    }

    /// True between [`Self::init`] and [`Self::teardown`].
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Apply a signed delta to the raw byte total.
    pub fn add_raw(&self, delta: i64) {
        if delta != 0 {
            self.raw_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Apply a signed delta to the formatted byte total.
    pub fn add_formatted(&self, delta: i64) {
        if delta != 0 {
            self.formatted_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    /// Apply a signed delta to the GL-resident byte total.
    pub fn add_gl(&self, delta: i64) {
        if delta != 0 {
            self.gl_bytes.fetch_add(delta, Ordering::AcqRel);
        }
    }

    pub(crate) fn raw_image_created(&self) {
        self.raw_images.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn raw_image_dropped(&self) {
        self.raw_images.fetch_sub(1, Ordering::AcqRel);
    }

    /// Current raw byte total.
    pub fn raw_bytes(&self) -> i64 {
        self.raw_bytes.load(Ordering::Acquire)
    }

    /// Current formatted byte total.
    pub fn formatted_bytes(&self) -> i64 {
        self.formatted_bytes.load(Ordering::Acquire)
    }

    /// Current GL-resident byte total.
    pub fn gl_bytes(&self) -> i64 {
        self.gl_bytes.load(Ordering::Acquire)
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MemorySnapshot {
        MemorySnapshot {
            raw_bytes: self.raw_bytes(),
            formatted_bytes: self.formatted_bytes(),
            gl_bytes: self.gl_bytes(),
            raw_images: self.raw_images.load(Ordering::Acquire),
        }
    }
}

static GLOBAL: MemoryCounters = MemoryCounters::new();

/// The process-wide counters.
pub fn global() -> &'static MemoryCounters {
    &GLOBAL
}

/// Texture memory settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Floor for the texture memory setting on low-RAM systems, MiB.
    pub min_video_ram_mb: i64,
    /// Ceiling for the texture memory setting, MiB.
    pub max_video_ram_mb: i64,
    /// User-selected texture memory, MiB. `0` picks the recommended default.
    pub texture_memory_mb: i64,
    /// Multiplier applied to the detected maximum (values below 1 shrink the budget).
    pub memory_multiplier: f32,
    /// Hardware detection was skipped at startup.
    pub no_hardware_probe: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_video_ram_mb: 32,
            max_video_ram_mb: 4096,
            texture_memory_mb: 0,
            memory_multiplier: 1.0,
            no_hardware_probe: false,
        }
    }
}

impl MemoryConfig {
    /// Reject inconsistent settings.
    pub fn validate(&self) -> TexResult<()> {
        if self.min_video_ram_mb <= 0 || self.max_video_ram_mb < self.min_video_ram_mb {
            return Err(TexError::config(
                "video ram bounds must satisfy 0 < min <= max",
            ));
        }
        if !self.memory_multiplier.is_finite() || self.memory_multiplier <= 0.0 {
            return Err(TexError::config("memory_multiplier must be finite and > 0"));
        }
        Ok(())
    }
}

/// Detected host capabilities used to size the budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostMemory {
    /// Detected GPU memory, MiB. `None` when detection failed.
    pub vram_mb: Option<i64>,
    /// Physical system memory, MiB.
    pub system_ram_mb: i64,
}

/// Lowest permitted texture memory setting, MiB.
pub fn min_video_ram_mb(host: HostMemory, cfg: &MemoryConfig) -> i64 {
    if host.system_ram_mb > 1500 {
        64
    } else {
        cfg.min_video_ram_mb
    }
}

/// Highest (or recommended) texture memory setting, MiB.
pub fn max_video_ram_mb(host: HostMemory, cfg: &MemoryConfig, recommended: bool) -> i64 {
    let min = min_video_ram_mb(host, cfg);
    let mut max_texmem = match host.vram_mb {
        Some(vram) if vram > 0 => {
            let vram = vram.max(min);
            if recommended { vram } else { vram * 2 }
        }
        _ => {
            let fallback = if !recommended || cfg.no_hardware_probe {
                512
            } else {
                128
            };
            tracing::warn!(fallback, "VRAM amount not detected, using default");
            fallback
        }
    };

    if recommended {
        max_texmem = ((max_texmem as f32 * 0.7) as i64).min(host.system_ram_mb / 2);
    } else {
        max_texmem = max_texmem.min(host.system_ram_mb);
    }

    max_texmem = max_texmem.min((cfg.memory_multiplier * max_texmem as f32) as i64);
    max_texmem.clamp(min, cfg.max_video_ram_mb.max(min))
}

/// Texture memory ceilings derived from the host and settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TextureMemoryBudget {
    /// Effective texture memory setting, MiB.
    pub texture_memory_mb: i64,
    /// Ceiling for all texture memory, MiB.
    pub max_total_mb: i64,
    /// Ceiling for GPU-resident texture memory, MiB.
    pub max_resident_mb: i64,
}

const FRAMEBUFFER_MEM_MIN_MB: i64 = 12;
const FRAMEBUFFER_MEM_MAX_MB: i64 = 512;
const MIN_MEM_FOR_NON_TEXTURE_MB: i64 = 16;

impl TextureMemoryBudget {
    /// Derive the budget. `requested_mb` of `0` uses the configured setting (or the recommended
    /// default when that is unset too); a negative request forces the recommended default.
    pub fn derive(host: HostMemory, cfg: &MemoryConfig, requested_mb: i64) -> Self {
        let default_mem = max_video_ram_mb(host, cfg, true);
        let max_mem = max_video_ram_mb(host, cfg, false);
        let min_mem = min_video_ram_mb(host, cfg);

        let mem = match requested_mb {
            0 if cfg.texture_memory_mb > 0 => cfg.texture_memory_mb,
            m if m <= 0 => default_mem,
            m => m,
        };
        let mem = mem.clamp(min_mem, max_mem.max(min_mem));

        let fb_mem = (mem / 4).clamp(FRAMEBUFFER_MEM_MIN_MB, FRAMEBUFFER_MEM_MAX_MB);
        let misc_mem = (mem / 5).max(MIN_MEM_FOR_NON_TEXTURE_MB);

        let budget = Self {
            texture_memory_mb: mem,
            max_total_mb: (mem - misc_mem).min(max_mem),
            max_resident_mb: (mem - misc_mem - fb_mem).min(max_mem),
        };
        tracing::info!(
            resident_mb = budget.max_resident_mb,
            total_mb = budget.max_total_mb,
            "texture memory budget set"
        );
        budget
    }

    /// Resident ceiling in bytes.
    pub fn max_resident_bytes(&self) -> i64 {
        self.max_resident_mb.max(0) * MIB
    }

    /// Total ceiling in bytes.
    pub fn max_total_bytes(&self) -> i64 {
        self.max_total_mb.max(0) * MIB
    }
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/memory.rs"]
mod tests;
