//! Engine configuration: the knobs an embedder sets before accepting
//! connections (`spec.md` §4.8, §4.9, §6; `SPEC_FULL.md` §2).
//!
//! Mirrors the split the teacher draws between `AppConfig` (daemon-wide
//! settings) and per-subcommand CLI args: this crate has no persistent
//! configuration surface to layer from a file, so `EngineConfig` is built
//! either programmatically by an embedder or from `clap`-parsed flags in
//! the standalone binary.

/// How the dispatcher distributes incoming messages to execution
/// contexts (`spec.md` §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The connection's reader task handles each message inline.
    Direct,
    /// A bounded free-list of worker units handles messages, enabling
    /// client->host->client->host re-entrancy without deadlock.
    Pooled {
        /// Maximum number of worker units kept in the free list.
        worker_pool_size: usize,
    },
}

impl DispatchMode {
    /// The feature-flag bit advertised during the handshake (`spec.md`
    /// §6): bit 0 set means pooled/worker mode.
    #[must_use]
    pub const fn feature_flags(self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Pooled { .. } => 0b0000_0001,
        }
    }
}

/// Default recursion depth limit (`spec.md` §4.6).
pub const DEFAULT_RECURSION_DEPTH_LIMIT: u32 = 128;

/// Engine-wide configuration, shared (read-only) across every connection a
/// [`crate::supervisor::ConnectionSupervisor`] accepts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Dispatch mode new connections are constructed with.
    pub dispatch_mode: DispatchMode,
    /// Whether a distinguished global lock is held around value-plane
    /// message handling (`spec.md` §4.9).
    pub global_lock_enabled: bool,
    /// Per-connection synchronous recursion depth limit (`spec.md` §4.6).
    pub recursion_depth_limit: u32,
    /// Whether the shared-memory side channel may be used, subject to the
    /// transport also reporting both peers on the same host (`spec.md`
    /// §4.5, §6).
    pub shared_memory_enabled: bool,
    /// Server name advertised during the handshake (`spec.md` §6).
    pub server_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch_mode: DispatchMode::Direct,
            global_lock_enabled: true,
            recursion_depth_limit: DEFAULT_RECURSION_DEPTH_LIMIT,
            shared_memory_enabled: false,
            server_name: "pjrmi-rs".to_owned(),
        }
    }
}

impl EngineConfig {
    /// Construct a pooled-mode configuration with the given worker pool
    /// size, otherwise using the defaults.
    #[must_use]
    pub fn pooled(worker_pool_size: usize) -> Self {
        Self {
            dispatch_mode: DispatchMode::Pooled { worker_pool_size },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DispatchMode, EngineConfig};

    #[test]
    fn direct_mode_advertises_no_feature_flags() {
        assert_eq!(DispatchMode::Direct.feature_flags(), 0);
    }

    #[test]
    fn pooled_mode_advertises_bit_zero() {
        let mode = DispatchMode::Pooled { worker_pool_size: 4 };
        assert_eq!(mode.feature_flags() & 1, 1);
    }

    #[test]
    fn default_config_is_direct_with_global_lock() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.dispatch_mode, DispatchMode::Direct);
        assert!(cfg.global_lock_enabled);
    }
}
