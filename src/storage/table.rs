//! Per-chapter deletion bitmap (§3.3's `free_table`), persisted alongside
//! each chapter's `.dat` as a companion `.tbl` file: `{ u8 freed[256]; i32
//! free_cnt; }`. A missing `.tbl` is equivalent to all zeros (§7: "missing
//! `.tbl` files are silent").

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::config::FILE_DATA_COUNT;
use crate::error::Result;

const TABLE_LEN: usize = FILE_DATA_COUNT as usize;

#[derive(Debug, Clone)]
pub struct FreeTable {
    pub freed: [u8; TABLE_LEN],
    pub free_cnt: i32,
}

impl FreeTable {
    pub fn empty() -> Self {
        Self { freed: [0; TABLE_LEN], free_cnt: 0 }
    }

    /// Load a chapter's table, or an empty one if the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::File::open(path) {
            Ok(mut f) => {
                let mut freed = [0u8; TABLE_LEN];
                f.read_exact(&mut freed)?;
                let mut cnt_buf = [0u8; 4];
                f.read_exact(&mut cnt_buf)?;
                Ok(Self { freed, free_cnt: i32::from_le_bytes(cnt_buf) })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::empty()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut f = fs::File::create(path)?;
        f.write_all(&self.freed)?;
        f.write_all(&self.free_cnt.to_le_bytes())?;
        Ok(())
    }

    /// Mark `offset` freed. Returns `true` if this was a new deletion
    /// (idempotent: re-marking an already-freed offset is a no-op).
    pub fn mark_freed(&mut self, offset: usize) -> bool {
        if self.freed[offset] == 0 {
            self.freed[offset] = 1;
            self.free_cnt += 1;
            true
        } else {
            false
        }
    }

    pub fn is_full(&self) -> bool {
        self.free_cnt as usize >= TABLE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_table_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_0.tbl");
        let t = FreeTable::load(&path).unwrap();
        assert_eq!(t.free_cnt, 0);
        assert!(!t.is_full());
    }

    #[test]
    fn mark_freed_is_idempotent_and_counts_once() {
        let mut t = FreeTable::empty();
        assert!(t.mark_freed(5));
        assert!(!t.mark_freed(5));
        assert_eq!(t.free_cnt, 1);
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0_0.tbl");
        let mut t = FreeTable::empty();
        t.mark_freed(3);
        t.mark_freed(200);
        t.save(&path).unwrap();
        let loaded = FreeTable::load(&path).unwrap();
        assert_eq!(loaded.free_cnt, 2);
        assert_eq!(loaded.freed[3], 1);
        assert_eq!(loaded.freed[200], 1);
    }

    #[test]
    fn full_table_reports_full_at_256() {
        let mut t = FreeTable::empty();
        for i in 0..TABLE_LEN {
            t.mark_freed(i);
        }
        assert!(t.is_full());
    }
}
