use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UploadError};

/// Default number of speculative extra shard attempts per slab.
pub const DEFAULT_MAX_OVERDRIVE: u64 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Max in-flight overdrive attempts per slab (0 disables overdrive
    /// regardless of the timeout).
    #[serde(default = "default_max_overdrive")]
    pub max_overdrive: u64,

    /// Idle time before a speculative shard attempt is launched, in
    /// milliseconds. 0 disables overdrive.
    #[serde(default = "default_overdrive_timeout_ms")]
    pub overdrive_timeout_ms: u64,

    /// Min interval between per-uploader statistics recomputes, in
    /// milliseconds (default: 3000).
    #[serde(default)]
    pub stats_recompute_min_interval_ms: Option<u64>,

    /// How long the metadata service locks packed slabs handed out for
    /// upload, in milliseconds (default: 10 min).
    #[serde(default)]
    pub packed_slab_lock_duration_ms: Option<u64>,

    /// Deadline for one packed-slab upload, in milliseconds (default: 10 min).
    #[serde(default)]
    pub packed_slab_upload_timeout_ms: Option<u64>,

    /// Ceiling for in-flight shard memory in MiB (default: 1024, range: 16-65536).
    #[serde(default)]
    pub max_memory_mib: Option<usize>,
}

fn default_max_overdrive() -> u64 {
    DEFAULT_MAX_OVERDRIVE
}

fn default_overdrive_timeout_ms() -> u64 {
    3_000
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            max_overdrive: default_max_overdrive(),
            overdrive_timeout_ms: default_overdrive_timeout_ms(),
            stats_recompute_min_interval_ms: None,
            packed_slab_lock_duration_ms: None,
            packed_slab_upload_timeout_ms: None,
            max_memory_mib: None,
        }
    }
}

impl UploadConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(n) = self.max_memory_mib {
            if !(16..=65536).contains(&n) {
                return Err(UploadError::Config(format!(
                    "upload.max_memory_mib must be in [16, 65536], got {n}"
                )));
            }
        }
        if let Some(0) = self.stats_recompute_min_interval_ms {
            return Err(UploadError::Config(
                "upload.stats_recompute_min_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Effective overdrive timeout; `Duration::ZERO` means disabled.
    pub fn overdrive_timeout(&self) -> Duration {
        Duration::from_millis(self.overdrive_timeout_ms)
    }

    pub fn stats_recompute_min_interval(&self) -> Duration {
        Duration::from_millis(self.stats_recompute_min_interval_ms.unwrap_or(3_000))
    }

    pub fn packed_slab_lock_duration(&self) -> Duration {
        Duration::from_millis(self.packed_slab_lock_duration_ms.unwrap_or(10 * 60 * 1000))
    }

    pub fn packed_slab_upload_timeout(&self) -> Duration {
        Duration::from_millis(self.packed_slab_upload_timeout_ms.unwrap_or(10 * 60 * 1000))
    }

    /// Effective memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_mib.unwrap_or(1024) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = UploadConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.max_overdrive, DEFAULT_MAX_OVERDRIVE);
        assert_eq!(cfg.overdrive_timeout(), Duration::from_secs(3));
        assert_eq!(cfg.stats_recompute_min_interval(), Duration::from_secs(3));
        assert_eq!(cfg.packed_slab_lock_duration(), Duration::from_secs(600));
        assert_eq!(cfg.max_memory_bytes(), 1024 * 1024 * 1024);
    }

    #[test]
    fn zero_overdrive_timeout_is_allowed() {
        let cfg = UploadConfig {
            overdrive_timeout_ms: 0,
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert_eq!(cfg.overdrive_timeout(), Duration::ZERO);
    }

    #[test]
    fn memory_range_enforced() {
        let cfg = UploadConfig {
            max_memory_mib: Some(4),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: UploadConfig = rmp_serde::from_slice(
            &rmp_serde::to_vec_named(&UploadConfig::default()).unwrap(),
        )
        .unwrap();
        assert_eq!(cfg.max_overdrive, DEFAULT_MAX_OVERDRIVE);
    }
}
