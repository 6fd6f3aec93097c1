//! Generic intrusive doubly-linked list operations over arena slots.
//!
//! The C original anchors each list with a slot of its own (tag `head`,
//! self-referencing when empty) so that every position in the structure —
//! head or member — is addressable the same way. A primary or canonical
//! block's "list-head" field, however, is embedded *inside* that block's
//! own slot (the allocator hands out exactly one slot per `alloc_primary`
//! call), so the head can't be a second, independently-tagged slot without
//! contradicting that budget.
//!
//! This rendition keeps every *member* node as a real, `SlotIndex`-addressed
//! arena slot (so `extract`/`obtain_base`/secondary links all still work the
//! way §9's DESIGN NOTES recommend — "arena-index pairs... either is
//! acceptable") but represents a list's *head* as a plain `ListHead { first,
//! last, len }` value living wherever the owning structure puts it: inline
//! inside `PrimaryBlock`/`CanonicalBlock`/`SubQueue`, or inline inside
//! `PoolInner` for the pool-wide free/recycle/active lists. A member's
//! `next`/`prev` are `Option<SlotIndex>`, `None` at both ends of the chain —
//! the direct, idiomatic analogue of the C "a block whose `next == self` is
//! a singleton" trick, without relying on a self-pointer sentinel.
//!
//! `LinkSel` selects which of a slot's two link fields (`link` or
//! `secondary`) an operation addresses, so one node can be a member of two
//! independent lists at once — the safe-Rust equivalent of §3.1's
//! "secondary link" embedded-offset trick, without needing to recover a
//! base pointer from a byte offset (see `obtain_base` in `refs.rs`).

use super::block::{Link, Slot};

pub type SlotIndex = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSel {
    Primary,
    Secondary,
}

/// The anchor of an intrusive list: first/last member and a running count.
/// Never itself a slot; lives inline in whatever structure owns the list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: Option<SlotIndex>,
    pub last: Option<SlotIndex>,
    pub len: usize,
}

impl ListHead {
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

fn link(arena: &[Slot], idx: SlotIndex, sel: LinkSel) -> Link {
    match sel {
        LinkSel::Primary => arena[idx as usize].link,
        LinkSel::Secondary => arena[idx as usize].secondary,
    }
}

fn link_mut(arena: &mut [Slot], idx: SlotIndex, sel: LinkSel) -> &mut Link {
    match sel {
        LinkSel::Primary => &mut arena[idx as usize].link,
        LinkSel::Secondary => &mut arena[idx as usize].secondary,
    }
}

/// A block whose selected link is `(None, None)` belongs to no list.
pub fn is_singleton(arena: &[Slot], idx: SlotIndex, sel: LinkSel) -> bool {
    let l = link(arena, idx, sel);
    l.next.is_none() && l.prev.is_none()
}

/// Reset `h` to the empty list. Does not touch any member's links.
pub fn init_head(h: &mut ListHead) {
    *h = ListHead::default();
}

/// Insert singleton `n` immediately after existing member `p` of `h`.
pub fn insert_after(arena: &mut [Slot], h: &mut ListHead, p: SlotIndex, n: SlotIndex, sel: LinkSel) {
    debug_assert!(is_singleton(arena, n, sel), "insert_after: n must be a singleton");
    let p_next = link(arena, p, sel).next;
    link_mut(arena, n, sel).prev = Some(p);
    link_mut(arena, n, sel).next = p_next;
    match p_next {
        Some(nn) => link_mut(arena, nn, sel).prev = Some(n),
        None => h.last = Some(n),
    }
    link_mut(arena, p, sel).next = Some(n);
    h.len += 1;
}

/// Insert singleton `n` immediately before existing member `p` of `h`.
pub fn insert_before(arena: &mut [Slot], h: &mut ListHead, p: SlotIndex, n: SlotIndex, sel: LinkSel) {
    debug_assert!(is_singleton(arena, n, sel), "insert_before: n must be a singleton");
    let p_prev = link(arena, p, sel).prev;
    link_mut(arena, n, sel).next = Some(p);
    link_mut(arena, n, sel).prev = p_prev;
    match p_prev {
        Some(pp) => link_mut(arena, pp, sel).next = Some(n),
        None => h.first = Some(n),
    }
    link_mut(arena, p, sel).prev = Some(n);
    h.len += 1;
}

/// Push singleton `n` onto the tail of `h`.
pub fn push_back(arena: &mut [Slot], h: &mut ListHead, n: SlotIndex, sel: LinkSel) {
    match h.last {
        Some(last) => insert_after(arena, h, last, n, sel),
        None => {
            debug_assert!(is_singleton(arena, n, sel), "push_back: n must be a singleton");
            h.first = Some(n);
            h.last = Some(n);
            h.len = 1;
        }
    }
}

/// Push singleton `n` onto the head of `h`.
pub fn push_front(arena: &mut [Slot], h: &mut ListHead, n: SlotIndex, sel: LinkSel) {
    match h.first {
        Some(first) => insert_before(arena, h, first, n, sel),
        None => {
            debug_assert!(is_singleton(arena, n, sel), "push_front: n must be a singleton");
            h.first = Some(n);
            h.last = Some(n);
            h.len = 1;
        }
    }
}

/// Remove `n` from `h`, leaving it a singleton. A no-op if `n` is already
/// a singleton — `extract` is idempotent per the pool's list-integrity
/// invariant.
pub fn extract(arena: &mut [Slot], h: &mut ListHead, n: SlotIndex, sel: LinkSel) {
    if is_singleton(arena, n, sel) {
        return;
    }
    let l = link(arena, n, sel);
    match l.prev {
        Some(p) => link_mut(arena, p, sel).next = l.next,
        None => h.first = l.next,
    }
    match l.next {
        Some(nx) => link_mut(arena, nx, sel).prev = l.prev,
        None => h.last = l.prev,
    }
    let node = link_mut(arena, n, sel);
    node.next = None;
    node.prev = None;
    h.len = h.len.saturating_sub(1);
}

/// Splice every member of `src` onto the tail of `dst`; `src` becomes empty.
pub fn merge(arena: &mut [Slot], dst: &mut ListHead, src: &mut ListHead, sel: LinkSel) {
    if let Some(src_first) = src.first {
        match dst.last {
            Some(dst_last) => {
                link_mut(arena, dst_last, sel).next = Some(src_first);
                link_mut(arena, src_first, sel).prev = Some(dst_last);
            }
            None => dst.first = Some(src_first),
        }
        dst.last = src.last;
        dst.len += src.len;
    }
    *src = ListHead::default();
}

/// Snapshot the members of `h` in order, walking the selected link.
pub fn collect_members(arena: &[Slot], h: &ListHead, sel: LinkSel) -> Vec<SlotIndex> {
    let mut members = Vec::with_capacity(h.len);
    let mut cur = h.first;
    while let Some(idx) = cur {
        members.push(idx);
        cur = link(arena, idx, sel).next;
    }
    members
}

/// Visit each member of `h` once. If `always_remove`, the callback is
/// required to re-home (extract, or insert elsewhere) every node it
/// visits — failing to do so leaks the node off the list's bookkeeping
/// while leaving it non-singleton, exactly as the source describes.
pub fn foreach(
    arena: &mut [Slot],
    h: &mut ListHead,
    sel: LinkSel,
    always_remove: bool,
    mut f: impl FnMut(&mut [Slot], &mut ListHead, SlotIndex),
) {
    for n in collect_members(arena, h, sel) {
        f(arena, h, n);
        if always_remove {
            debug_assert!(
                is_singleton(arena, n, sel),
                "foreach(always_remove=true): callback did not re-home node {n}"
            );
        }
    }
}
