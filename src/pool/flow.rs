//! Flow scheduler surface: the active-flow list and per-flow sub-queues
//! (§4.3).
//!
//! A flow is a `FlowBlock` slot; marking it active threads it onto the
//! pool-wide `active_flows` list via `LinkSel::Primary` on the flow slot's
//! own `link` field. Each flow separately owns a `SubQueue` of pending
//! bundles, whose members are primary-block slots threaded via
//! `LinkSel::Secondary` on *their* `secondary` link field — a primary
//! block's `link` field is left free for whatever other list it might sit
//! on (e.g. a delivery queue), exactly the two-independent-lists pattern
//! `Slot` is built for.
//!
//! `process_all_flows` snapshots the active-flow membership before
//! invoking the caller's forwarder, and the pool lock is expected to be
//! released by the caller around the callback (see `Pool::process_all_flows`
//! in `mod.rs`) so a forwarder that calls back into the pool cannot
//! deadlock against the lock it was invoked under.

use super::block::{Body, BlockTag};
use super::list::{self, LinkSel, ListHead, SlotIndex};
use super::Slot;
use crate::error::{BpError, Result};

/// Thread `flow` onto `active_flows`, if it isn't already a member.
pub fn mark_flow_active(arena: &mut [Slot], active_flows: &mut ListHead, flow: SlotIndex) -> Result<()> {
    require_flow(arena, flow)?;
    if list::is_singleton(arena, flow, LinkSel::Primary) {
        list::push_back(arena, active_flows, flow, LinkSel::Primary);
    }
    Ok(())
}

/// Remove `flow` from `active_flows`. Idempotent.
pub fn mark_flow_inactive(arena: &mut [Slot], active_flows: &mut ListHead, flow: SlotIndex) {
    list::extract(arena, active_flows, flow, LinkSel::Primary);
}

/// Snapshot the currently active flows, in activation order.
pub fn collect_active_flows(arena: &[Slot], active_flows: &ListHead) -> Vec<SlotIndex> {
    list::collect_members(arena, active_flows, LinkSel::Primary)
}

/// Append `bundle` onto `flow`'s pending sub-queue, honoring its
/// `depth_limit`. Returns `BpError::PoolExhausted` if the queue is full,
/// after bumping `drop_count` (§4.2: "incrementing drop stats and
/// returning an error if exceeded").
pub fn append_subq_bundle(arena: &mut [Slot], flow: SlotIndex, bundle: SlotIndex) -> Result<()> {
    let limit = flow_subq(arena, flow)?.depth_limit;
    let len = flow_subq(arena, flow)?.members.len;
    if limit > 0 && len >= limit {
        flow_body_mut(arena, flow)?.subq.drop_count += 1;
        return Err(BpError::PoolExhausted);
    }
    let members = &mut flow_body_mut(arena, flow)?.subq.members;
    let mut members_copy = *members;
    list::push_back(arena, &mut members_copy, bundle, LinkSel::Secondary);
    let subq = &mut flow_body_mut(arena, flow)?.subq;
    subq.members = members_copy;
    subq.push_count += 1;
    if members_copy.len > subq.high_water {
        subq.high_water = members_copy.len;
    }
    Ok(())
}

/// Pop the oldest bundle off `flow`'s pending sub-queue, if any.
pub fn shift_subq_bundle(arena: &mut [Slot], flow: SlotIndex) -> Result<Option<SlotIndex>> {
    let mut members = flow_subq(arena, flow)?.members;
    let head = members.first;
    if let Some(n) = head {
        list::extract(arena, &mut members, n, LinkSel::Secondary);
        let subq = &mut flow_body_mut(arena, flow)?.subq;
        subq.members = members;
        subq.pop_count += 1;
    }
    Ok(head)
}

/// Drop every pending bundle off `flow`'s sub-queue without forwarding
/// them, counting each as a drop (used when a flow is torn down with
/// bundles still queued).
pub fn drain_subq_dropping(arena: &mut [Slot], flow: SlotIndex) -> Result<Vec<SlotIndex>> {
    let mut dropped = Vec::new();
    while let Some(member) = shift_subq_bundle(arena, flow)? {
        dropped.push(member);
    }
    let subq = &mut flow_body_mut(arena, flow)?.subq;
    subq.pop_count -= dropped.len() as u64;
    subq.drop_count += dropped.len() as u64;
    Ok(dropped)
}

/// Current depth of `flow`'s pending sub-queue.
pub fn subq_depth(arena: &[Slot], flow: SlotIndex) -> Result<usize> {
    Ok(flow_subq(arena, flow)?.members.len)
}

fn require_flow(arena: &[Slot], flow: SlotIndex) -> Result<()> {
    match arena.get(flow as usize).map(|s| s.tag()) {
        Some(BlockTag::Flow) => Ok(()),
        _ => Err(BpError::invalid_block("expected a flow block")),
    }
}

fn flow_subq(arena: &[Slot], flow: SlotIndex) -> Result<super::block::SubQueue> {
    match &arena.get(flow as usize).ok_or_else(|| BpError::invalid_block("slot index out of range"))?.body {
        Body::Flow(f) => Ok(f.subq),
        _ => Err(BpError::invalid_block("expected a flow block")),
    }
}

fn flow_body_mut(arena: &mut [Slot], flow: SlotIndex) -> Result<&mut super::block::FlowBlock> {
    match &mut arena.get_mut(flow as usize).ok_or_else(|| BpError::invalid_block("slot index out of range"))?.body {
        Body::Flow(f) => Ok(f),
        _ => Err(BpError::invalid_block("expected a flow block")),
    }
}
