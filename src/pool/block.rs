//! The slot/block data model carved out of the pool's arena.
//!
//! Every allocation hands back exactly one `Slot` from a flat `Vec<Slot>`
//! arena, addressed by its `SlotIndex` rather than a pointer. A slot carries
//! two independent link fields (`link`, `secondary`) so a block can sit on
//! two lists at once — e.g. a canonical block lives on its owning bundle's
//! canonical-block list via `link` while also sitting on a cbor-chunk chain
//! via `secondary` — without the C original's "secondary link lives at
//! `base + offset`" byte arithmetic. `LinkSel` (see `list.rs`) picks which
//! field an operation addresses; recovering "the owning block" from a
//! secondary-list member is therefore free (it already is the same
//! `SlotIndex`), where the C version needed to subtract an offset.

use super::list::{ListHead, SlotIndex};
use crate::config::SLOT_PAYLOAD_CAPACITY;

/// What a slot currently holds. Mirrors the C tag enumeration; tags
/// `CborChunk` (3) through `Flow` (7) are the refcounted range (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    Free = 0,
    Head = 1,
    Ref = 2,
    CborChunk = 3,
    ServiceObject = 4,
    Primary = 5,
    Canonical = 6,
    Flow = 7,
}

/// One node's membership in a list: `None`/`None` means "not linked" (a
/// singleton). See `list.rs` for the operations that maintain this
/// invariant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    pub next: Option<SlotIndex>,
    pub prev: Option<SlotIndex>,
}

/// A standalone, allocatable list anchor (tag `Head`). Not used by the
/// pool's own free/recycle/active-flow lists (those embed a `ListHead`
/// directly in `PoolInner`) but allocatable via `Pool::alloc_head` for
/// callers that want a `SlotIndex`-addressable anchor of their own, the
/// literal reading of the `head` tag in the source enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadBody {
    pub list: ListHead,
}

/// A slot parked on the free list or awaiting recycling. Carries no
/// payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeBody;

/// A lightweight indirection block (tag `Ref`): a `Refptr`'s durable
/// target, optionally carrying a notify closure invoked when the last
/// light reference is released (see `refs.rs::make_block_ref`).
pub struct RefBody {
    pub target: SlotIndex,
    pub notify: Option<Box<dyn FnOnce(SlotIndex) + Send>>,
}

impl std::fmt::Debug for RefBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefBody")
            .field("target", &self.target)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

/// A fragment of CBOR-encoded bundle data (tag `CborChunk`).
#[derive(Debug, Clone)]
pub struct CborChunk {
    pub refcount: u32,
    pub len: usize,
    pub data: [u8; SLOT_PAYLOAD_CAPACITY],
}

impl Default for CborChunk {
    fn default() -> Self {
        Self { refcount: 0, len: 0, data: [0; SLOT_PAYLOAD_CAPACITY] }
    }
}

/// An opaque, magic-tagged application payload (tag `ServiceObject`),
/// the generic shape behind `alloc_generic(magic, capacity)`.
#[derive(Debug, Clone)]
pub struct ServiceObject {
    pub refcount: u32,
    pub magic: u32,
    pub len: usize,
    pub data: [u8; SLOT_PAYLOAD_CAPACITY],
}

impl Default for ServiceObject {
    fn default() -> Self {
        Self { refcount: 0, magic: 0, len: 0, data: [0; SLOT_PAYLOAD_CAPACITY] }
    }
}

/// Delivery-side bookkeeping a primary block carries for the CLA/routing
/// layer (§3.1): which interfaces a bundle arrived/departs on, the sid it
/// was last durably committed under, its retransmit timer, and its
/// ingress/egress DTN timestamps. Grouped the way the spec groups them
/// ("delivery metadata (...)") rather than flattened onto `PrimaryBlock`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryMeta {
    pub ingress_if: i32,
    pub egress_if: i32,
    pub storage_if: i32,
    pub committed_sid: u64,
    pub retransmit_interval_ms: u64,
    pub ingress_timestamp: u64,
    pub egress_timestamp: u64,
}

/// A bundle's primary block (tag `Primary`). `canonical_list` anchors the
/// bundle's canonical blocks in arrival order via `LinkSel::Primary` on
/// each canonical block's `link`; `chunk_chain` anchors the primary
/// block's own encoded header bytes via `LinkSel::Primary` on each
/// cbor-chunk's `link` (a canonical block's chunk chain lives on the
/// chunk's `secondary` link instead, so the same chunk type can hang off
/// either owner without the two roles colliding).
#[derive(Debug, Clone, Default)]
pub struct PrimaryBlock {
    pub refcount: u32,
    pub version: u8,
    pub flags: u32,
    pub crc: u16,
    pub canonical_list: ListHead,
    pub chunk_chain: ListHead,
    pub encoded_size: usize,
    pub delivery: DeliveryMeta,
}

/// A single canonical block (tag `Canonical`), threaded onto its owning
/// primary block's `canonical_list`. `bundle_ref` is the back-pointer to
/// that owning primary (§3.1: "either null or points to a primary block
/// that transitively owns it"). `chunk_chain` anchors this block's own
/// cbor-chunk fragments via `LinkSel::Secondary` on each chunk's
/// `secondary` link, so a canonical block can be a `canonical_list`
/// member (primary link) and a chunk-chain head at the same time without
/// the two roles colliding. `content_offset`/`content_len` locate this
/// block's logical content within that chunk chain's concatenated bytes.
#[derive(Debug, Clone, Default)]
pub struct CanonicalBlock {
    pub refcount: u32,
    pub block_type: u8,
    pub flags: u32,
    pub crc: u16,
    pub bundle_ref: Option<SlotIndex>,
    pub chunk_chain: ListHead,
    pub encoded_size: usize,
    pub content_offset: usize,
    pub content_len: usize,
}

/// A flow-extension block (tag `Flow`): `alloc_flow(magic, capacity)`
/// takes the same magic+capacity shape as `alloc_generic`, so this is
/// modeled as an opaque extension payload analogous to `ServiceObject`,
/// plus the scheduler-facing sub-queue list (see `flow.rs`). Back-
/// referenced by the `Refptr` that represents "the flow itself" per the
/// refcounting range in §3.2.
#[derive(Debug, Clone)]
pub struct FlowBlock {
    pub refcount: u32,
    pub magic: u32,
    pub extra_len: usize,
    pub extra: [u8; SLOT_PAYLOAD_CAPACITY],
    pub subq: SubQueue,
}

impl Default for FlowBlock {
    fn default() -> Self {
        Self {
            refcount: 0,
            magic: 0,
            extra_len: 0,
            extra: [0; SLOT_PAYLOAD_CAPACITY],
            subq: SubQueue::default(),
        }
    }
}

/// A flow's pending-bundle sub-queue, bounded by `depth_limit` (§4.3).
/// Carries running statistics (§3.1: "push/pop counts, high-water") rather
/// than just current depth, mirroring the teacher's `BufferPoolStats`
/// habit of counting past activity alongside present occupancy.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubQueue {
    pub members: ListHead,
    pub depth_limit: usize,
    pub push_count: u64,
    pub pop_count: u64,
    pub drop_count: u64,
    pub high_water: usize,
}

/// The payload carried by a slot, tagged by `BlockTag`.
#[derive(Debug)]
pub enum Body {
    Free(FreeBody),
    Head(HeadBody),
    Ref(RefBody),
    CborChunk(CborChunk),
    ServiceObject(ServiceObject),
    Primary(PrimaryBlock),
    Canonical(CanonicalBlock),
    Flow(FlowBlock),
}

impl Body {
    pub fn tag(&self) -> BlockTag {
        match self {
            Body::Free(_) => BlockTag::Free,
            Body::Head(_) => BlockTag::Head,
            Body::Ref(_) => BlockTag::Ref,
            Body::CborChunk(_) => BlockTag::CborChunk,
            Body::ServiceObject(_) => BlockTag::ServiceObject,
            Body::Primary(_) => BlockTag::Primary,
            Body::Canonical(_) => BlockTag::Canonical,
            Body::Flow(_) => BlockTag::Flow,
        }
    }

    /// The refcount of a refcounted body (tags `CborChunk..=Flow`), if any.
    pub fn refcount(&self) -> Option<u32> {
        match self {
            Body::CborChunk(b) => Some(b.refcount),
            Body::ServiceObject(b) => Some(b.refcount),
            Body::Primary(b) => Some(b.refcount),
            Body::Canonical(b) => Some(b.refcount),
            Body::Flow(b) => Some(b.refcount),
            _ => None,
        }
    }

    pub fn refcount_mut(&mut self) -> Option<&mut u32> {
        match self {
            Body::CborChunk(b) => Some(&mut b.refcount),
            Body::ServiceObject(b) => Some(&mut b.refcount),
            Body::Primary(b) => Some(&mut b.refcount),
            Body::Canonical(b) => Some(&mut b.refcount),
            Body::Flow(b) => Some(&mut b.refcount),
            _ => None,
        }
    }
}

/// One arena entry: the payload plus its two list memberships.
#[derive(Debug)]
pub struct Slot {
    pub body: Body,
    pub link: Link,
    pub secondary: Link,
}

impl Slot {
    pub fn free() -> Self {
        Self { body: Body::Free(FreeBody), link: Link::default(), secondary: Link::default() }
    }

    pub fn tag(&self) -> BlockTag {
        self.body.tag()
    }
}
