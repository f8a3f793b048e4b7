//! Session configuration and resource auto-tuning.
//!
//! Design Notes (replacing "global process state"): the replication-disable
//! flag and the decryption key used to live as module statics. Both are
//! threaded explicitly through [`SessionConfig`], passed once at open time.

use std::path::PathBuf;

use sysinfo::System;

/// 64-byte key supplied at open time. Split internally into an AES-256 key
/// and an HMAC-SHA256 key (see `crate::crypto`).
pub type EncryptionKey = [u8; 64];

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the primary data file.
    pub path: PathBuf,
    /// When set, the arena's raw file is wrapped in the encrypted mapping
    /// layer (C2).
    pub encryption_key: Option<EncryptionKey>,
    /// Skip `msync`/`fsync` calls. Defaults from the `disable_sync_to_disk`
    /// environment variable but is always overridable here.
    pub disable_sync_to_disk: bool,
    /// Arena and commit-log sizing, auto-tuned from `ResourceProfile` unless
    /// overridden.
    pub growth: GrowthPolicy,
}

impl SessionConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let disable_sync_to_disk = std::env::var("disable_sync_to_disk")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            path: path.into(),
            encryption_key: None,
            disable_sync_to_disk,
            growth: GrowthPolicy::auto_tuned(),
        }
    }

    pub fn with_encryption_key(mut self, key: EncryptionKey) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn with_disable_sync_to_disk(mut self, disabled: bool) -> Self {
        self.disable_sync_to_disk = disabled;
        self
    }

    pub fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }
}

/// Doubling-with-cap growth policy for the arena file and commit-log files.
#[derive(Debug, Clone, Copy)]
pub struct GrowthPolicy {
    /// Smallest mapping created for a brand-new file.
    pub initial_size: usize,
    /// Once the file would otherwise double past this size, grow linearly
    /// by `growth_cap` instead.
    pub growth_cap: usize,
    /// Commit-log files start at this size before the first doubling.
    pub log_initial_size: usize,
}

impl GrowthPolicy {
    pub const MIN_SLAB: usize = 16;

    fn detect_system_resources() -> (u64, usize) {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();
        (sys.total_memory(), sys.cpus().len().max(1))
    }

    /// Derives initial sizes and the growth cap from available memory, the
    /// way the teacher repo's `ResourceManager::auto_tune` scales shard and
    /// compaction thresholds from `SystemResources::detect`.
    pub fn auto_tuned() -> Self {
        let (total_kib, _cpus) = Self::detect_system_resources();
        let total_bytes = total_kib.saturating_mul(1024) as usize;

        // Conservative fractions of total memory: a cold-start mapping
        // should never be a meaningful fraction of RAM, but a growth cap
        // can be generous on larger machines.
        let initial_size = (total_bytes / 1_000_000).clamp(1 << 16, 1 << 22);
        let growth_cap = (total_bytes / 64).clamp(1 << 24, 1 << 30);
        let log_initial_size = (total_bytes / 4_000_000).clamp(1 << 14, 1 << 20);

        GrowthPolicy {
            initial_size,
            growth_cap,
            log_initial_size,
        }
    }

    pub fn conservative() -> Self {
        GrowthPolicy {
            initial_size: 1 << 16,
            growth_cap: 1 << 24,
            log_initial_size: 1 << 14,
        }
    }

    /// Next file size for a demand of `needed` bytes beyond `current`.
    pub fn next_size(&self, current: usize, needed_total: usize) -> usize {
        let mut size = current.max(self.initial_size);
        while size < needed_total {
            if size < self.growth_cap {
                size = (size * 2).min(self.growth_cap.max(size * 2));
            } else {
                size += self.growth_cap;
            }
        }
        let page = page_size();
        (size + page - 1) / page * page
    }
}

pub fn page_size() -> usize {
    // SAFETY: `sysconf` with `_SC_PAGESIZE` is always valid to call and
    // returns a small positive constant on every supported platform.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_policy_doubles_then_caps() {
        let policy = GrowthPolicy {
            initial_size: 1024,
            growth_cap: 4096,
            log_initial_size: 1024,
        };
        assert!(policy.next_size(1024, 2000) >= 2000);
        let grown = policy.next_size(4096, 9000);
        assert!(grown >= 9000);
        assert_eq!(grown % page_size(), 0);
    }

    #[test]
    fn session_config_defaults_disable_sync_from_env() {
        std::env::remove_var("disable_sync_to_disk");
        let cfg = SessionConfig::new("/tmp/does-not-matter.db");
        assert!(!cfg.disable_sync_to_disk);
    }
}
