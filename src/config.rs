//! Crate-wide configuration structs.
//!
//! Mirrors the teacher lineage's `Config`/`BufferPoolConfig` pattern: plain
//! structs with a `Default` impl, constructed either as a struct literal
//! with `..Default::default()` or through the small `Default`-deriving
//! config types consumed by `Pool::new` and `FileStore::create`.

use std::path::PathBuf;

/// Largest encoded-chunk payload a slot must accommodate (§3.1).
pub const SLOT_PAYLOAD_CAPACITY: usize = 320;

/// Build-time cap on the number of concurrently live file-store handles (§6).
pub const FILE_MAX_STORES: usize = 60;

/// Objects per chapter file; wired into the data-id split and must not
/// change without also changing `FileStore`'s `file_id`/`offset` split (§6).
pub const FILE_DATA_COUNT: u32 = 256;

/// Sizes the block pool's arena.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of fixed-size slots to carve the arena into.
    pub slot_count: usize,
    /// Largest payload a slot must accommodate. Must not exceed
    /// `SLOT_PAYLOAD_CAPACITY`, the compile-time size every arena slot is
    /// fixed at (`Pool::new` asserts this); defaults to that same bound.
    pub slot_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { slot_count: 4096, slot_capacity: SLOT_PAYLOAD_CAPACITY }
    }
}

/// Per-handle configuration for the persistent file store (`file_attr` in §6).
#[derive(Debug, Clone)]
pub struct FileStoreAttr {
    pub root_path: PathBuf,
    pub cache_size: usize,
}

impl Default for FileStoreAttr {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from(".pfile"),
            cache_size: 16384,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_config_slot_capacity_matches_the_arena_bound() {
        assert_eq!(PoolConfig::default().slot_capacity, SLOT_PAYLOAD_CAPACITY);
    }
}
