//! Queue ordering - pure functions
//!
//! Primary key is priority (descending), secondary is `added_at` (FIFO
//! within a tier). Entries sharing a stack keep their dependency order
//! (base-most first) regardless of priority.

use crate::error::{Error, Result};
use crate::types::{QueueEntry, QueueStatus};
use std::collections::HashMap;

/// Sort entries into canonical queue order (PURE)
///
/// Entries are ordered by priority and admission time; every stack then
/// re-occupies the slots its members landed in, in depth order.
pub fn canonical_order(entries: &mut [QueueEntry]) {
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.added_at.cmp(&b.added_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut slots: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(stack) = &entry.stack {
            slots.entry(stack.id.0.clone()).or_default().push(index);
        }
    }

    for indices in slots.values().filter(|i| i.len() > 1) {
        let mut members: Vec<QueueEntry> = indices.iter().map(|&i| entries[i].clone()).collect();
        members.sort_by(|a, b| {
            let depth = |e: &QueueEntry| e.stack.as_ref().map_or(0, |s| s.depth);
            depth(a)
                .cmp(&depth(b))
                .then_with(|| a.added_at.cmp(&b.added_at))
        });
        for (&slot, member) in indices.iter().zip(members) {
            entries[slot] = member;
        }
    }
}

/// Index at which a new entry should be inserted into an ordered queue
/// without disturbing the relative order of existing entries (PURE)
pub fn insertion_index(active: &[QueueEntry], new: &QueueEntry) -> usize {
    let mut index = active
        .iter()
        .position(|e| e.priority < new.priority)
        .unwrap_or(active.len());

    // Never jump ahead of an in-flight merge
    if let Some(last_merging) = active.iter().rposition(|e| e.status == QueueStatus::Merging) {
        index = index.max(last_merging + 1);
    }

    if let Some(stack) = &new.stack {
        let same_stack = |e: &QueueEntry| e.stack.as_ref().is_some_and(|s| s.id == stack.id);
        if let Some(after) = active
            .iter()
            .rposition(|e| same_stack(e) && e.stack.as_ref().is_some_and(|s| s.depth <= stack.depth))
        {
            index = index.max(after + 1);
        }
        if let Some(before) = active
            .iter()
            .position(|e| same_stack(e) && e.stack.as_ref().is_some_and(|s| s.depth > stack.depth))
        {
            index = index.min(before);
        }
    }

    index
}

/// Verify stack members appear base-most first (PURE)
pub fn validate_stack_order(ordered: &[QueueEntry]) -> Result<()> {
    let mut deepest: HashMap<&str, (u32, u64)> = HashMap::new();
    for entry in ordered {
        let Some(stack) = &entry.stack else {
            continue;
        };
        if let Some(&(depth, number)) = deepest.get(stack.id.0.as_str())
            && stack.depth < depth
        {
            return Err(Error::StackOrderViolation(format!(
                "#{} (depth {}) cannot follow #{number} (depth {depth}) in stack {}",
                entry.change_request, stack.depth, stack.id
            )));
        }
        deepest.insert(stack.id.0.as_str(), (stack.depth, entry.change_request));
    }
    Ok(())
}

/// Assign dense zero-based positions in slice order
pub fn renumber(active: &mut [QueueEntry]) {
    for (position, entry) in active.iter_mut().enumerate() {
        entry.position = Some(position);
    }
}
