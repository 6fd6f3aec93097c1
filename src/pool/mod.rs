//! The intrusive, refcount-managed, typed block-pool allocator (§4.1-§4.2).
//!
//! `Pool` is a fixed-size arena of `Slot`s behind a single `parking_lot::Mutex`
//! (coarse-grained, matching the teacher's `DiskManager`/`BufferPoolManager`
//! locking grain rather than per-slot locks — the arena is small enough and
//! operations short enough that finer-grained locking buys little and costs
//! a lot of complexity). Callers are expected to hold the pool behind an
//! `Arc`, exactly as the teacher holds its buffer manager and disk manager,
//! so that `Refptr` (see `refs.rs`) can carry a cheap, cloneable handle back
//! to it.
//!
//! Allocation takes a slot off `free_list`; dropping the last refcounted
//! reference to a slot moves it onto `recycle_list` rather than freeing it
//! immediately (§4.2's two-phase reclaim — `maintain` does the actual work of
//! resetting a recycled slot's body and returning it to `free_list`, the
//! same deferred-reclaim shape as the teacher's buffer pool clock-sweep).

pub mod block;
pub mod flow;
pub mod list;
pub mod refs;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::{BpError, Result};

pub use block::{
    BlockTag, Body, CanonicalBlock, CborChunk, DeliveryMeta, FlowBlock, HeadBody, Link, PrimaryBlock, RefBody,
    ServiceObject, Slot, SubQueue,
};
pub use list::{foreach, LinkSel, ListHead, SlotIndex};
pub use refs::{make_block_ref, make_dynamic, obtain_base, Refptr};

/// Point-in-time occupancy counters, exposed for diagnostics and tests —
/// an ambient accessor, not a scoped-out feature (§A.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub total_slots: usize,
    pub free_count: usize,
    pub recycle_pending: usize,
    pub active_flow_count: usize,
}

struct PoolInner {
    arena: Vec<Slot>,
    /// Indices of currently-unused slots. A plain stack rather than an
    /// intrusive list: a slot's `link`/`secondary` fields are already
    /// spoken for by whatever structural list it belongs to once
    /// allocated (a primary's `canonical_list`, a canonical's
    /// `chunk_chain`, a flow's `active_flows` membership, ...), and a
    /// slot can be queued for recycle (see `recycle_list`) *while still
    /// a member of one of those* — reusing the same link fields for pool
    /// bookkeeping would silently corrupt whichever structural list got
    /// there first. A side Vec sidesteps that entirely.
    free_list: Vec<SlotIndex>,
    /// Slots whose refcount has hit zero and are awaiting `maintain`.
    recycle_list: Vec<SlotIndex>,
    active_flows: ListHead,
}

/// The block pool. Construct with [`Pool::new`] and share via the returned
/// `Arc`.
pub struct Pool {
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Carve a fresh arena of `config.slot_count` slots, all initially free.
    /// `config.slot_capacity` is asserted against the compile-time
    /// `SLOT_PAYLOAD_CAPACITY` every slot is actually fixed at — misuse
    /// (a caller asking for a bigger slot than the arena can host) is
    /// fatal by design (§7), not a recoverable error.
    pub fn new(config: PoolConfig) -> Arc<Self> {
        assert!(
            config.slot_capacity <= crate::config::SLOT_PAYLOAD_CAPACITY,
            "PoolConfig::slot_capacity ({}) exceeds SLOT_PAYLOAD_CAPACITY ({})",
            config.slot_capacity,
            crate::config::SLOT_PAYLOAD_CAPACITY,
        );
        let mut arena = Vec::with_capacity(config.slot_count);
        for _ in 0..config.slot_count {
            arena.push(Slot::free());
        }
        // Reverse so slot 0 is the first one handed out by `take_free_slot`'s
        // pop-from-the-end; purely cosmetic, allocation order isn't specified.
        let free_list: Vec<SlotIndex> = (0..arena.len() as SlotIndex).rev().collect();
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                arena,
                free_list,
                recycle_list: Vec::new(),
                active_flows: ListHead::default(),
            }),
        })
    }

    fn take_free_slot(inner: &mut PoolInner) -> Result<SlotIndex> {
        inner.free_list.pop().ok_or(BpError::PoolExhausted)
    }

    fn copy_into(data: &[u8], out: &mut [u8]) -> Result<usize> {
        if data.len() > out.len() {
            return Err(BpError::invalid_block("payload exceeds slot capacity"));
        }
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    /// Allocate a primary block (§4.1's `alloc_primary`), refcount starting
    /// at 1.
    pub fn alloc_primary(self: &Arc<Self>) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        inner.arena[idx as usize].body = Body::Primary(PrimaryBlock { refcount: 1, ..Default::default() });
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    /// Allocate a canonical block (`alloc_canonical`).
    pub fn alloc_canonical(self: &Arc<Self>) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        inner.arena[idx as usize].body = Body::Canonical(CanonicalBlock { refcount: 1, ..Default::default() });
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    /// Allocate a cbor-chunk fragment carrying `data` (`alloc_cbor_chunk`).
    pub fn alloc_cbor_chunk(self: &Arc<Self>, data: &[u8]) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        let mut body = CborChunk { refcount: 1, ..Default::default() };
        body.len = Self::copy_into(data, &mut body.data)?;
        inner.arena[idx as usize].body = Body::CborChunk(body);
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    /// Allocate a magic-tagged service object (`alloc_generic(magic,
    /// capacity)`).
    pub fn alloc_generic(self: &Arc<Self>, magic: u32, data: &[u8]) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        let mut body = ServiceObject { refcount: 1, magic, ..Default::default() };
        body.len = Self::copy_into(data, &mut body.data)?;
        inner.arena[idx as usize].body = Body::ServiceObject(body);
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    /// Allocate a flow-extension block (`alloc_flow(magic, capacity)`),
    /// with its sub-queue bounded by `depth_limit` (0 means unbounded).
    pub fn alloc_flow(self: &Arc<Self>, magic: u32, data: &[u8], depth_limit: usize) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        let mut body = FlowBlock { refcount: 1, magic, ..Default::default() };
        body.extra_len = Self::copy_into(data, &mut body.extra)?;
        body.subq.depth_limit = depth_limit;
        inner.arena[idx as usize].body = Body::Flow(body);
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    /// Allocate a standalone list-anchor block (tag `Head`). Not used by
    /// the pool's own lists; available to callers that want a
    /// `SlotIndex`-addressable anchor, for literal parity with the tag
    /// enumeration (§A.5).
    pub fn alloc_head(self: &Arc<Self>) -> Result<Refptr> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        inner.arena[idx as usize].body = Body::Head(HeadBody::default());
        drop(inner);
        Ok(Refptr::new(self.clone(), idx))
    }

    pub(crate) fn alloc_ref_slot(&self, body: RefBody) -> Result<SlotIndex> {
        let mut inner = self.inner.lock();
        let idx = Self::take_free_slot(&mut inner)?;
        inner.arena[idx as usize].body = Body::Ref(body);
        Ok(idx)
    }

    pub(crate) fn bump_refcount(&self, slot: SlotIndex, by: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let rc = inner
            .arena
            .get_mut(slot as usize)
            .and_then(|s| s.body.refcount_mut())
            .ok_or_else(refs::invalid_target)?;
        *rc += by;
        Ok(())
    }

    /// Resolve `idx` to its owning content block (`obtain_base`, §4.1): if
    /// `idx` is a `Ref` indirection, follow its `target` one hop; otherwise
    /// `idx` is already the base (the secondary-link case is a no-op here,
    /// since both links live on the same slot — see `refs::obtain_base`).
    pub(crate) fn resolve_base(&self, idx: SlotIndex) -> Result<SlotIndex> {
        let inner = self.inner.lock();
        match inner.arena.get(idx as usize).map(|s| &s.body) {
            Some(Body::Ref(r)) => Ok(r.target),
            Some(_) => Ok(idx),
            None => Err(BpError::invalid_block("slot index out of range")),
        }
    }

    /// Drop one light reference to `slot`. When the count reaches zero the
    /// slot moves onto `recycle_list`; `maintain` completes the reclaim.
    /// A `Ref` block has no refcount of its own — it represents a single,
    /// non-shared indirection, so releasing it always queues it directly
    /// (§4.1's `notify_fn`/target-release path runs out of `maintain`).
    pub(crate) fn drop_refcount(&self, slot: SlotIndex) {
        let mut inner = self.inner.lock();
        let hit_zero = match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::Ref(_)) => true,
            Some(_) => match inner.arena[slot as usize].body.refcount_mut() {
                Some(rc) => {
                    *rc = rc.saturating_sub(1);
                    *rc == 0
                }
                None => false,
            },
            None => false,
        };
        if hit_zero {
            inner.recycle_list.push(slot);
        }
    }

    /// Attach `canonical` onto `primary`'s canonical-block list and set
    /// `canonical`'s `bundle_ref` back-pointer to `primary`.
    pub fn attach_canonical(&self, primary: SlotIndex, canonical: SlotIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        if !matches!(inner.arena.get(canonical as usize).map(|s| &s.body), Some(Body::Canonical(_))) {
            return Err(BpError::invalid_block("expected a canonical block"));
        }
        let mut list = match inner.arena.get(primary as usize).map(|s| &s.body) {
            Some(Body::Primary(p)) => p.canonical_list,
            _ => return Err(BpError::invalid_block("expected a primary block")),
        };
        list::push_back(&mut inner.arena, &mut list, canonical, LinkSel::Primary);
        match &mut inner.arena[primary as usize].body {
            Body::Primary(p) => p.canonical_list = list,
            _ => unreachable!(),
        }
        match &mut inner.arena[canonical as usize].body {
            Body::Canonical(c) => c.bundle_ref = Some(primary),
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Attach `chunk` onto `canonical`'s cbor-chunk chain.
    pub fn attach_chunk(&self, canonical: SlotIndex, chunk: SlotIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut list = match inner.arena.get(canonical as usize).map(|s| &s.body) {
            Some(Body::Canonical(c)) => c.chunk_chain,
            _ => return Err(BpError::invalid_block("expected a canonical block")),
        };
        list::push_back(&mut inner.arena, &mut list, chunk, LinkSel::Secondary);
        match &mut inner.arena[canonical as usize].body {
            Body::Canonical(c) => c.chunk_chain = list,
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Attach `chunk` onto `primary`'s own encoded-chunk chain (the
    /// primary block's header bytes, distinct from any canonical block's
    /// chunk chain). Uses the chunk's `link` field rather than
    /// `secondary`, which `attach_chunk` reserves for canonical-owned
    /// chunks, so the same cbor-chunk type can serve either role.
    pub fn attach_primary_chunk(&self, primary: SlotIndex, chunk: SlotIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut list = match inner.arena.get(primary as usize).map(|s| &s.body) {
            Some(Body::Primary(p)) => p.chunk_chain,
            _ => return Err(BpError::invalid_block("expected a primary block")),
        };
        list::push_back(&mut inner.arena, &mut list, chunk, LinkSel::Primary);
        match &mut inner.arena[primary as usize].body {
            Body::Primary(p) => p.chunk_chain = list,
            _ => unreachable!(),
        }
        Ok(())
    }

    /// Overwrite a primary block's cached encoded size (§3.1).
    pub fn set_primary_encoded_size(&self, primary: SlotIndex, size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.arena.get_mut(primary as usize).map(|s| &mut s.body) {
            Some(Body::Primary(p)) => {
                p.encoded_size = size;
                Ok(())
            }
            _ => Err(BpError::invalid_block("expected a primary block")),
        }
    }

    /// Overwrite a primary block's delivery metadata (ingress/egress/
    /// storage interface ids, committed sid, retransmit interval,
    /// ingress/egress DTN timestamps — §3.1).
    pub fn set_primary_delivery(&self, primary: SlotIndex, delivery: DeliveryMeta) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.arena.get_mut(primary as usize).map(|s| &mut s.body) {
            Some(Body::Primary(p)) => {
                p.delivery = delivery;
                Ok(())
            }
            _ => Err(BpError::invalid_block("expected a primary block")),
        }
    }

    /// Overwrite a canonical block's cached encoded size (§3.1).
    pub fn set_canonical_encoded_size(&self, canonical: SlotIndex, size: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.arena.get_mut(canonical as usize).map(|s| &mut s.body) {
            Some(Body::Canonical(c)) => {
                c.encoded_size = size;
                Ok(())
            }
            _ => Err(BpError::invalid_block("expected a canonical block")),
        }
    }

    /// Set a canonical block's content offset/length within its chunk
    /// chain's concatenated bytes (§3.1).
    pub fn set_canonical_content(&self, canonical: SlotIndex, offset: usize, len: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        match &mut inner.arena.get_mut(canonical as usize).map(|s| &mut s.body) {
            Some(Body::Canonical(c)) => {
                c.content_offset = offset;
                c.content_len = len;
                Ok(())
            }
            _ => Err(BpError::invalid_block("expected a canonical block")),
        }
    }

    pub fn cast_primary(&self, slot: SlotIndex) -> Result<PrimaryBlock> {
        let inner = self.inner.lock();
        match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::Primary(p)) => Ok(p.clone()),
            _ => Err(BpError::invalid_block("expected a primary block")),
        }
    }

    pub fn cast_canonical(&self, slot: SlotIndex) -> Result<CanonicalBlock> {
        let inner = self.inner.lock();
        match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::Canonical(c)) => Ok(c.clone()),
            _ => Err(BpError::invalid_block("expected a canonical block")),
        }
    }

    pub fn cast_flow(&self, slot: SlotIndex) -> Result<FlowBlock> {
        let inner = self.inner.lock();
        match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::Flow(f)) => Ok(f.clone()),
            _ => Err(BpError::invalid_block("expected a flow block")),
        }
    }

    /// Cast `slot` to a `ServiceObject`, additionally checking that its
    /// stored `magic` matches `magic` (§4.1: "`cast_generic(blk, magic)`
    /// additionally compares the stored magic").
    pub fn cast_generic(&self, slot: SlotIndex, magic: u32) -> Result<ServiceObject> {
        let inner = self.inner.lock();
        match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::ServiceObject(o)) if o.magic == magic => Ok(o.clone()),
            Some(Body::ServiceObject(_)) => Err(BpError::invalid_block("magic mismatch on service object")),
            _ => Err(BpError::invalid_block("expected a service object")),
        }
    }

    pub fn cast_cbor_chunk(&self, slot: SlotIndex) -> Result<CborChunk> {
        let inner = self.inner.lock();
        match inner.arena.get(slot as usize).map(|s| &s.body) {
            Some(Body::CborChunk(c)) => Ok(c.clone()),
            _ => Err(BpError::invalid_block("expected a cbor chunk")),
        }
    }

    /// Thread `flow` onto the active-flow list.
    pub fn mark_flow_active(&self, flow: SlotIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        let PoolInner { arena, active_flows, .. } = &mut *inner;
        flow::mark_flow_active(arena, active_flows, flow)
    }

    /// Remove `flow` from the active-flow list.
    pub fn mark_flow_inactive(&self, flow: SlotIndex) {
        let mut inner = self.inner.lock();
        let PoolInner { arena, active_flows, .. } = &mut *inner;
        flow::mark_flow_inactive(arena, active_flows, flow);
    }

    pub fn append_subq_bundle(&self, flow: SlotIndex, bundle: SlotIndex) -> Result<()> {
        let mut inner = self.inner.lock();
        flow::append_subq_bundle(&mut inner.arena, flow, bundle)
    }

    pub fn shift_subq_bundle(&self, flow: SlotIndex) -> Result<Option<SlotIndex>> {
        let mut inner = self.inner.lock();
        flow::shift_subq_bundle(&mut inner.arena, flow)
    }

    pub fn subq_depth(&self, flow: SlotIndex) -> Result<usize> {
        let inner = self.inner.lock();
        flow::subq_depth(&inner.arena, flow)
    }

    /// A flow's sub-queue running counters (§3.1), for diagnostics.
    pub fn subq_stats(&self, flow: SlotIndex) -> Result<SubQueue> {
        let inner = self.inner.lock();
        match inner.arena.get(flow as usize).map(|s| &s.body) {
            Some(Body::Flow(f)) => Ok(f.subq),
            _ => Err(BpError::invalid_block("expected a flow block")),
        }
    }

    /// Invoke `forwarder` once per currently active flow. The pool lock is
    /// released before each call so a forwarder that re-enters the pool
    /// (e.g. to shift a bundle off the flow it was just handed) cannot
    /// deadlock against this call.
    pub fn process_all_flows(self: &Arc<Self>, mut forwarder: impl FnMut(&Arc<Pool>, SlotIndex)) {
        let snapshot = {
            let inner = self.inner.lock();
            flow::collect_active_flows(&inner.arena, &inner.active_flows)
        };
        for flow in snapshot {
            forwarder(self, flow);
        }
    }

    /// Reset every slot on `recycle_list` back to `Free` and return it to
    /// `free_list`. Returns the number of slots reclaimed. Cascades:
    /// recycling a primary block releases its canonical-block list;
    /// recycling a canonical block releases its cbor-chunk chain;
    /// recycling a flow block drops it off the active-flow list and
    /// drains its sub-queue.
    pub fn maintain(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut pending = std::mem::take(&mut inner.recycle_list);
        let mut reclaimed = 0;
        let mut idx_i = 0;
        while idx_i < pending.len() {
            let idx = pending[idx_i];
            idx_i += 1;
            Self::detach_and_cascade(&mut inner, idx, &mut pending);
            inner.arena[idx as usize].body = Body::Free(block::FreeBody);
            inner.arena[idx as usize].link = Link::default();
            inner.arena[idx as usize].secondary = Link::default();
            inner.free_list.push(idx);
            reclaimed += 1;
        }
        reclaimed
    }

    /// Unlink `idx`'s children and recursively release the references it
    /// held on them, queuing any child that drops to zero onto `pending`
    /// so the caller's `maintain` loop picks it up in the same pass —
    /// recycling a primary cascades into its canonical blocks, recycling
    /// a canonical cascades into its cbor-chunks, and recycling a `Ref`
    /// block fires its notify callback and cascades into its target.
    fn detach_and_cascade(inner: &mut PoolInner, idx: SlotIndex, pending: &mut Vec<SlotIndex>) {
        let release_and_queue = |inner: &mut PoolInner, child: SlotIndex, pending: &mut Vec<SlotIndex>| {
            if let Some(rc) = inner.arena[child as usize].body.refcount_mut() {
                *rc = rc.saturating_sub(1);
                if *rc == 0 {
                    pending.push(child);
                }
            }
        };

        match &inner.arena[idx as usize].body {
            Body::Primary(p) => {
                let canonical_list = p.canonical_list;
                let chunk_chain = p.chunk_chain;
                let members = list::collect_members(&inner.arena, &canonical_list, LinkSel::Primary);
                for m in members {
                    inner.arena[m as usize].link = Link::default();
                    release_and_queue(inner, m, pending);
                }
                let chunks = list::collect_members(&inner.arena, &chunk_chain, LinkSel::Primary);
                for m in chunks {
                    inner.arena[m as usize].link = Link::default();
                    release_and_queue(inner, m, pending);
                }
            }
            Body::Canonical(c) => {
                let chunk_chain = c.chunk_chain;
                let members = list::collect_members(&inner.arena, &chunk_chain, LinkSel::Secondary);
                for m in members {
                    inner.arena[m as usize].secondary = Link::default();
                    release_and_queue(inner, m, pending);
                }
            }
            Body::Flow(_) => {
                let dropped = flow::drain_subq_dropping(&mut inner.arena, idx).unwrap_or_default();
                for m in dropped {
                    release_and_queue(inner, m, pending);
                }
                list::extract(&mut inner.arena, &mut inner.active_flows, idx, LinkSel::Primary);
            }
            Body::Ref(_) => {
                let taken = std::mem::replace(&mut inner.arena[idx as usize].body, Body::Free(block::FreeBody));
                if let Body::Ref(r) = taken {
                    if let Some(notify) = r.notify {
                        notify(r.target);
                    }
                    release_and_queue(inner, r.target, pending);
                }
            }
            _ => {}
        }
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total_slots: inner.arena.len(),
            free_count: inner.free_list.len(),
            recycle_pending: inner.recycle_list.len(),
            active_flow_count: inner.active_flows.len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_pool(slots: usize) -> Arc<Pool> {
        Pool::new(PoolConfig { slot_count: slots, ..Default::default() })
    }

    #[test]
    #[should_panic(expected = "slot_capacity")]
    fn new_rejects_a_slot_capacity_larger_than_the_arena_can_host() {
        Pool::new(PoolConfig {
            slot_count: 1,
            slot_capacity: crate::config::SLOT_PAYLOAD_CAPACITY + 1,
        });
    }

    #[test]
    fn pool_conservation_alloc_and_release_returns_slot() {
        let pool = tiny_pool(4);
        assert_eq!(pool.stats().free_count, 4);
        let r = pool.alloc_primary().unwrap();
        assert_eq!(pool.stats().free_count, 3);
        r.release_light();
        assert_eq!(pool.stats().recycle_pending, 1);
        assert_eq!(pool.maintain(), 1);
        assert_eq!(pool.stats().free_count, 4);
    }

    #[test]
    fn pool_exhausted_when_arena_is_empty() {
        let pool = tiny_pool(1);
        let _r = pool.alloc_primary().unwrap();
        assert!(matches!(pool.alloc_canonical().unwrap_err(), BpError::PoolExhausted));
    }

    #[test]
    fn duplicate_light_keeps_slot_alive_until_all_refs_drop() {
        let pool = tiny_pool(2);
        let r1 = pool.alloc_cbor_chunk(b"hello").unwrap();
        let r2 = r1.duplicate_light().unwrap();
        drop(r1);
        assert_eq!(pool.maintain(), 0, "slot must not recycle while r2 is alive");
        drop(r2);
        assert_eq!(pool.maintain(), 1);
    }

    #[test]
    fn canonical_list_integrity_across_attach_and_cascade_release() {
        let pool = tiny_pool(8);
        let primary = pool.alloc_primary().unwrap();
        let c1 = pool.alloc_canonical().unwrap();
        let c2 = pool.alloc_canonical().unwrap();
        pool.attach_canonical(primary.slot(), c1.slot()).unwrap();
        pool.attach_canonical(primary.slot(), c2.slot()).unwrap();
        let snapshot = pool.cast_primary(primary.slot()).unwrap();
        assert_eq!(snapshot.canonical_list.len, 2);

        c1.release_light();
        c2.release_light();
        pool.maintain();
        primary.release_light();
        assert_eq!(pool.maintain(), 1);
        assert_eq!(pool.stats().free_count, 8);
    }

    #[test]
    fn recycling_a_primary_cascades_into_unreleased_canonical_children() {
        let pool = tiny_pool(4);
        let primary = pool.alloc_primary().unwrap();
        let c1 = pool.alloc_canonical().unwrap();
        pool.attach_canonical(primary.slot(), c1.slot()).unwrap();
        let c1_slot = c1.slot();
        // deliberately forget c1's own handle without releasing it: the
        // primary's cascade must still drop it to zero and recycle it.
        std::mem::forget(c1);

        primary.release_light();
        assert_eq!(pool.maintain(), 2, "primary and its orphaned canonical child both recycle");
        assert_eq!(pool.stats().free_count, 4);
        assert!(matches!(pool.cast_canonical(c1_slot).unwrap_err(), BpError::InvalidBlock(_)));
    }

    #[test]
    fn recycling_a_canonical_cascades_into_its_chunk_chain() {
        let pool = tiny_pool(4);
        let canonical = pool.alloc_canonical().unwrap();
        let chunk = pool.alloc_cbor_chunk(b"data").unwrap();
        pool.attach_chunk(canonical.slot(), chunk.slot()).unwrap();
        std::mem::forget(chunk);

        canonical.release_light();
        assert_eq!(pool.maintain(), 2);
        assert_eq!(pool.stats().free_count, 4);
    }

    #[test]
    fn releasing_a_block_ref_fires_notify_and_cascades_target_release() {
        let pool = tiny_pool(4);
        let target = pool.alloc_cbor_chunk(b"payload").unwrap();
        let target_slot = target.slot();
        std::mem::forget(target);

        let notified = Arc::new(Mutex::new(None));
        let notified_clone = notified.clone();
        let block_ref =
            make_block_ref(&pool, target_slot, Some(Box::new(move |t| *notified_clone.lock() = Some(t)))).unwrap();

        block_ref.release_light();
        assert_eq!(pool.maintain(), 2, "ref slot and its now-zero-refcount target both recycle");
        assert_eq!(*notified.lock(), Some(target_slot));
        assert_eq!(pool.stats().free_count, 4);
    }

    #[test]
    fn subq_tracks_push_pop_and_high_water() {
        let pool = tiny_pool(8);
        let flow = pool.alloc_flow(0, b"", 0).unwrap();
        let b1 = pool.alloc_primary().unwrap();
        let b2 = pool.alloc_primary().unwrap();
        pool.append_subq_bundle(flow.slot(), b1.slot()).unwrap();
        pool.append_subq_bundle(flow.slot(), b2.slot()).unwrap();
        pool.shift_subq_bundle(flow.slot()).unwrap();

        let stats = pool.subq_stats(flow.slot()).unwrap();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.pop_count, 1);
        assert_eq!(stats.high_water, 2);
    }

    #[test]
    fn subq_honors_depth_limit() {
        let pool = tiny_pool(8);
        let flow = pool.alloc_flow(0xA5A5, b"", 1).unwrap();
        let b1 = pool.alloc_primary().unwrap();
        let b2 = pool.alloc_primary().unwrap();
        pool.append_subq_bundle(flow.slot(), b1.slot()).unwrap();
        let err = pool.append_subq_bundle(flow.slot(), b2.slot()).unwrap_err();
        assert!(matches!(err, BpError::PoolExhausted));
        assert_eq!(pool.subq_stats(flow.slot()).unwrap().drop_count, 1);
        assert_eq!(pool.shift_subq_bundle(flow.slot()).unwrap(), Some(b1.slot()));
        assert_eq!(pool.subq_depth(flow.slot()).unwrap(), 0);
    }

    #[test]
    fn process_all_flows_visits_every_active_flow_once() {
        let pool = tiny_pool(8);
        let f1 = pool.alloc_flow(1, b"", 0).unwrap();
        let f2 = pool.alloc_flow(2, b"", 0).unwrap();
        pool.mark_flow_active(f1.slot()).unwrap();
        pool.mark_flow_active(f2.slot()).unwrap();

        let mut visited = Vec::new();
        pool.process_all_flows(|_, idx| visited.push(idx));
        visited.sort();
        let mut expected = vec![f1.slot(), f2.slot()];
        expected.sort();
        assert_eq!(visited, expected);
    }

    #[test]
    fn cast_generic_rejects_a_mismatched_magic() {
        let pool = tiny_pool(2);
        let obj = pool.alloc_generic(0xC0FFEE, b"payload").unwrap();
        assert_eq!(pool.cast_generic(obj.slot(), 0xC0FFEE).unwrap().len, 7);
        assert!(matches!(pool.cast_generic(obj.slot(), 0xBAD).unwrap_err(), BpError::InvalidBlock(_)));
    }

    #[test]
    fn attach_canonical_sets_bundle_ref_back_pointer() {
        let pool = tiny_pool(4);
        let primary = pool.alloc_primary().unwrap();
        let canonical = pool.alloc_canonical().unwrap();
        pool.attach_canonical(primary.slot(), canonical.slot()).unwrap();
        let snapshot = pool.cast_canonical(canonical.slot()).unwrap();
        assert_eq!(snapshot.bundle_ref, Some(primary.slot()));
    }

    #[test]
    fn primary_chunk_chain_is_independent_of_canonical_chunk_chains() {
        let pool = tiny_pool(8);
        let primary = pool.alloc_primary().unwrap();
        let canonical = pool.alloc_canonical().unwrap();
        pool.attach_canonical(primary.slot(), canonical.slot()).unwrap();
        let primary_chunk = pool.alloc_cbor_chunk(b"hdr").unwrap();
        let canonical_chunk = pool.alloc_cbor_chunk(b"content").unwrap();
        pool.attach_primary_chunk(primary.slot(), primary_chunk.slot()).unwrap();
        pool.attach_chunk(canonical.slot(), canonical_chunk.slot()).unwrap();

        assert_eq!(pool.cast_primary(primary.slot()).unwrap().chunk_chain.len, 1);
        assert_eq!(pool.cast_canonical(canonical.slot()).unwrap().chunk_chain.len, 1);

        std::mem::forget(primary_chunk);
        std::mem::forget(canonical_chunk);
        canonical.release_light();
        primary.release_light();
        assert_eq!(pool.maintain(), 4, "primary, canonical and both orphaned chunks all recycle");
        assert_eq!(pool.stats().free_count, 8);
    }

    #[test]
    fn primary_delivery_metadata_and_encoded_sizes_roundtrip() {
        let pool = tiny_pool(2);
        let primary = pool.alloc_primary().unwrap();
        let canonical = pool.alloc_canonical().unwrap();
        pool.set_primary_encoded_size(primary.slot(), 128).unwrap();
        pool.set_primary_delivery(
            primary.slot(),
            DeliveryMeta { ingress_if: 1, egress_if: 2, storage_if: 3, committed_sid: 9, retransmit_interval_ms: 5000, ingress_timestamp: 111, egress_timestamp: 222 },
        )
        .unwrap();
        pool.set_canonical_encoded_size(canonical.slot(), 64).unwrap();
        pool.set_canonical_content(canonical.slot(), 8, 56).unwrap();

        let p = pool.cast_primary(primary.slot()).unwrap();
        assert_eq!(p.encoded_size, 128);
        assert_eq!(p.delivery.committed_sid, 9);
        assert_eq!(p.delivery.retransmit_interval_ms, 5000);

        let c = pool.cast_canonical(canonical.slot()).unwrap();
        assert_eq!(c.encoded_size, 64);
        assert_eq!((c.content_offset, c.content_len), (8, 56));
    }

    #[test]
    fn extract_is_idempotent_on_a_singleton() {
        let pool = tiny_pool(2);
        let flow = pool.alloc_flow(0, b"", 0).unwrap();
        pool.mark_flow_active(flow.slot()).unwrap();
        pool.mark_flow_inactive(flow.slot());
        // second extract on an already-singleton node must not panic or
        // corrupt active_flows' bookkeeping.
        pool.mark_flow_inactive(flow.slot());
        assert_eq!(pool.stats().active_flow_count, 0);
    }
}
