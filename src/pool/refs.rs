//! Reference-counted handles onto pool slots.
//!
//! Grounded directly in the teacher's `FrameGuard` (`buffer/page_cache.rs`):
//! a small RAII guard that holds a shared handle to the owning manager plus
//! the target's index, auto-releasing on `Drop`. Here `Refptr` holds an
//! `Arc<Pool>` (so `Pool` is meant to be shared the same way the teacher
//! shares `Arc<Mutex<File>>`/`Arc<BufferFrame>`) and a `SlotIndex`, and its
//! `Drop` calls the same release path `release_light` exposes explicitly —
//! both coexist safely because `release_light` consumes `self`, so a caller
//! that releases explicitly never also pays for it again at scope exit.
//!
//! `make_block_ref` allocates a `Ref`-tagged slot that indirectly targets
//! another block, optionally running a notify closure when the last light
//! reference to it is released — the block-pool analogue of a weak-ref
//! finalizer.

use std::sync::Arc;

use super::block::RefBody;
use super::list::SlotIndex;
use super::Pool;
use crate::error::{BpError, Result};

/// An RAII light reference to a pool slot. Dropping it releases the
/// reference; `release_light` does the same thing early and explicitly.
pub struct Refptr {
    pool: Arc<Pool>,
    slot: SlotIndex,
    released: bool,
}

impl Refptr {
    pub(crate) fn new(pool: Arc<Pool>, slot: SlotIndex) -> Self {
        Self { pool, slot, released: false }
    }

    pub fn slot(&self) -> SlotIndex {
        self.slot
    }

    /// Make a second light reference to the same slot, bumping its
    /// refcount.
    pub fn duplicate_light(&self) -> Result<Refptr> {
        self.pool.bump_refcount(self.slot, 1)?;
        Ok(Refptr::new(self.pool.clone(), self.slot))
    }

    /// Release this light reference early. Consumes `self` so `Drop`
    /// does not fire a second release.
    pub fn release_light(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.drop_refcount(self.slot);
        }
    }
}

impl Drop for Refptr {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for Refptr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Refptr").field("slot", &self.slot).field("released", &self.released).finish()
    }
}

/// Mint a new owning `Refptr` onto `target`, a slot the caller already
/// knows the raw index of but holds no owning reference to (e.g. a
/// back-pointer such as `CanonicalBlock::bundle_ref`) — bumps its refcount
/// by one and hands back a `Refptr` that will drop that count on release.
/// Fails if `target` does not carry a refcounted body (§3.2 tags
/// `CborChunk..=Flow`).
pub fn make_dynamic(pool: &Arc<Pool>, target: SlotIndex) -> Result<Refptr> {
    pool.bump_refcount(target, 1)?;
    Ok(Refptr::new(pool.clone(), target))
}

/// Allocate a standalone `Ref`-tagged slot that indirects to `target`,
/// running `notify(target)` when the ref slot's own last light reference
/// is released (e.g. to tear down an out-of-band subscriber list entry).
pub fn make_block_ref(
    pool: &Arc<Pool>,
    target: SlotIndex,
    notify: Option<Box<dyn FnOnce(SlotIndex) + Send>>,
) -> Result<Refptr> {
    pool.bump_refcount(target, 1)?;
    let slot = pool.alloc_ref_slot(RefBody { target, notify })?;
    Ok(Refptr::new(pool.clone(), slot))
}

/// Resolve the owning block of `idx` (§4.1's `obtain_base`): unwraps a
/// `Ref` indirection by following its `target` one hop, then resolves any
/// secondary-link membership. Since both links live on the same slot
/// (`LinkSel` just picks a field), the secondary-link hop is a no-op here —
/// the owning block's `SlotIndex` is already `idx` itself, unlike the C
/// original's `secondary_link_base + byte_offset` arithmetic. Only the
/// reference-unwrap hop does real work.
pub fn obtain_base(pool: &Pool, idx: SlotIndex) -> Result<SlotIndex> {
    pool.resolve_base(idx)
}

pub(crate) fn invalid_target() -> BpError {
    BpError::invalid_block("target slot does not carry a refcounted body")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[test]
    fn make_dynamic_mints_a_second_owner_for_a_raw_back_pointer() {
        let pool = Pool::new(PoolConfig { slot_count: 4, ..Default::default() });
        let primary = pool.alloc_primary().unwrap();
        let canonical = pool.alloc_canonical().unwrap();
        pool.attach_canonical(primary.slot(), canonical.slot()).unwrap();

        // `bundle_ref` is a raw SlotIndex, not an owning Refptr.
        let bundle_ref = pool.cast_canonical(canonical.slot()).unwrap().bundle_ref.unwrap();
        let dynamic = make_dynamic(&pool, bundle_ref).unwrap();

        // Dropping the original owning Refptr must not recycle the primary
        // while `dynamic` still holds a count on it.
        primary.release_light();
        assert_eq!(pool.maintain(), 0, "primary must survive: make_dynamic holds a second count");

        dynamic.release_light();
        canonical.release_light();
        assert_eq!(pool.maintain(), 2, "primary and canonical both recycle once all owners release");
    }

    #[test]
    fn obtain_base_unwraps_a_block_ref_to_its_target() {
        let pool = Pool::new(PoolConfig { slot_count: 4, ..Default::default() });
        let target = pool.alloc_cbor_chunk(b"payload").unwrap();
        let target_slot = target.slot();
        std::mem::forget(target);

        let block_ref = make_block_ref(&pool, target_slot, None).unwrap();
        assert_ne!(block_ref.slot(), target_slot, "ref slot is distinct from its target");

        let base = obtain_base(&pool, block_ref.slot()).unwrap();
        assert_eq!(base, target_slot, "obtain_base must follow the Ref indirection to its target");

        // A non-Ref slot resolves to itself.
        assert_eq!(obtain_base(&pool, target_slot).unwrap(), target_slot);
    }
}
