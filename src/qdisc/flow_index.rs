use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Unbounded};

use slab::Slab;
use tracing::debug;

use crate::clock::HZ;
use crate::qdisc::flow::{Flow, FlowHandle, FlowId};

/// Max flows reclaimed by one lookup.
pub(crate) const FQ_GC_MAX: usize = 8;
/// Idle age, in jiffies, after which a detached flow may be reclaimed.
pub(crate) const FQ_GC_AGE: u64 = 3 * HZ;
/// Neighbours of the looked-up key inspected on each side during GC.
const FQ_GC_PROBE: usize = 16;

const GOLDEN_RATIO_64: u64 = 0x61C8_8646_80B5_83EB;

pub(crate) fn shard_of(id: &FlowId, log: u8) -> usize {
    (id.hash_word().wrapping_mul(GOLDEN_RATIO_64) >> (64 - u32::from(log))) as usize
}

/// Flow arena plus `1 << log` ordered shards mapping identity to arena slot.
pub(crate) struct FlowIndex<T, K> {
    arena: Slab<Flow<T, K>>,
    shards: Vec<BTreeMap<FlowId, FlowHandle>>,
    log: u8,
    inactive: usize,
    limit: Option<usize>,
}

impl<T, K> FlowIndex<T, K> {
    pub(crate) fn new(log: u8) -> Self {
        Self {
            arena: Slab::new(),
            shards: (0..1usize << log).map(|_| BTreeMap::new()).collect(),
            log,
            inactive: 0,
            limit: None,
        }
    }

    pub(crate) fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub(crate) fn log(&self) -> u8 {
        self.log
    }

    pub(crate) fn flows(&self) -> usize {
        self.arena.len()
    }

    pub(crate) fn inactive(&self) -> usize {
        self.inactive
    }

    #[cfg(test)]
    pub(crate) fn get(&self, handle: FlowHandle) -> Option<&Flow<T, K>> {
        self.arena.get(handle.0)
    }

    pub(crate) fn get_mut(&mut self, handle: FlowHandle) -> Option<&mut Flow<T, K>> {
        self.arena.get_mut(handle.0)
    }

    pub(crate) fn lookup(&self, id: &FlowId) -> Option<FlowHandle> {
        self.shards[shard_of(id, self.log)].get(id).copied()
    }

    /// Lookup-time GC is worth it only when the table is loaded and mostly idle.
    pub(crate) fn wants_gc(&self) -> bool {
        let flows = self.flows();
        flows >= (2usize << self.log) && self.inactive > flows / 2
    }

    /// Reclaims up to [`FQ_GC_MAX`] idle flows next to `id` in its shard.
    /// The flow keyed by `id` itself is never reclaimed here.
    pub(crate) fn gc(&mut self, id: &FlowId, jiffies: u64) -> usize {
        let shard = &self.shards[shard_of(id, self.log)];
        let below = shard.range(..*id).rev().take(FQ_GC_PROBE);
        let above = shard.range((Excluded(*id), Unbounded)).take(FQ_GC_PROBE);

        let mut victims = Vec::with_capacity(FQ_GC_MAX);
        for (fid, &handle) in below.chain(above) {
            let Some(flow) = self.arena.get(handle.0) else {
                continue;
            };
            if flow.is_gc_candidate(jiffies, FQ_GC_AGE) {
                victims.push((*fid, handle));
                if victims.len() == FQ_GC_MAX {
                    break;
                }
            }
        }

        let shard = &mut self.shards[shard_of(id, self.log)];
        for (fid, handle) in &victims {
            shard.remove(fid);
            self.arena.remove(handle.0);
        }
        self.inactive -= victims.len();
        if !victims.is_empty() {
            debug!(count = victims.len(), "collected idle flows");
        }
        victims.len()
    }

    /// Inserts a new flow, `None` when the arena is at its limit.
    pub(crate) fn insert(&mut self, flow: Flow<T, K>) -> Option<FlowHandle> {
        if self.limit.is_some_and(|limit| self.arena.len() >= limit) {
            return None;
        }
        let id = flow.id;
        let detached = flow.detached_since().is_some();
        let handle = FlowHandle(self.arena.insert(flow));
        self.shards[shard_of(&id, self.log)].insert(id, handle);
        if detached {
            self.inactive += 1;
        }
        Some(handle)
    }

    /// Account a state change made by the scheduler.
    pub(crate) fn note_detached(&mut self) {
        self.inactive += 1;
    }

    pub(crate) fn note_attached(&mut self) {
        self.inactive = self.inactive.saturating_sub(1);
    }

    /// Rehashes every surviving flow into `1 << log` shards; idle flows old
    /// enough for GC are dropped on the way. Returns how many were dropped.
    pub(crate) fn resize(&mut self, log: u8, jiffies: u64) -> usize {
        if log == self.log {
            return 0;
        }
        let old = std::mem::replace(
            &mut self.shards,
            (0..1usize << log).map(|_| BTreeMap::new()).collect(),
        );
        let mut dropped = 0;
        for shard in old {
            for (id, handle) in shard {
                let stale = self
                    .arena
                    .get(handle.0)
                    .is_none_or(|flow| flow.is_gc_candidate(jiffies, FQ_GC_AGE));
                if stale {
                    if self.arena.try_remove(handle.0).is_some() {
                        self.inactive -= 1;
                        dropped += 1;
                    }
                    continue;
                }
                self.shards[shard_of(&id, log)].insert(id, handle);
            }
        }
        debug!(from = self.log, to = log, dropped, "resized flow index");
        self.log = log;
        dropped
    }

    /// Removes every flow and hands back their arena entries.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Flow<T, K>> + '_ {
        for shard in &mut self.shards {
            shard.clear();
        }
        self.inactive = 0;
        self.arena.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qdisc::flow::FlowState;

    type Index = FlowIndex<Vec<u8>, ()>;

    fn ids_in_shard(log: u8, shard: usize, n: usize) -> Vec<FlowId> {
        (1u64..)
            .map(FlowId::Socket)
            .filter(|id| shard_of(id, log) == shard)
            .take(n)
            .collect()
    }

    #[test]
    fn shard_of_stays_in_range() {
        for log in 1..=18u8 {
            for raw in [0u64, 1, 42, u64::MAX] {
                assert!(shard_of(&FlowId::Socket(raw), log) < 1 << log);
                assert!(shard_of(&FlowId::Orphan(raw as u32), log) < 1 << log);
            }
        }
    }

    #[test]
    fn insert_then_lookup() {
        let mut index = Index::new(4);
        let id = FlowId::Socket(7);
        assert!(index.lookup(&id).is_none());
        let h = index.insert(Flow::new(id, 100, 0)).unwrap();
        assert_eq!(index.lookup(&id), Some(h));
        assert_eq!(index.flows(), 1);
        assert_eq!(index.inactive(), 1);
        assert!(index.lookup(&FlowId::Orphan(7)).is_none());
    }

    #[test]
    fn limit_refuses_new_flows() {
        let mut index = Index::new(2);
        index.set_limit(Some(1));
        assert!(index.insert(Flow::new(FlowId::Socket(1), 1, 0)).is_some());
        assert!(index.insert(Flow::new(FlowId::Socket(2), 1, 0)).is_none());
    }

    #[test]
    fn gc_reclaims_only_old_detached_neighbours() {
        let mut index = Index::new(1);
        let ids = ids_in_shard(1, 0, 6);
        let handles: Vec<_> = ids
            .iter()
            .map(|id| index.insert(Flow::new(*id, 1, 0)).unwrap())
            .collect();
        // one active flow survives regardless of age
        index.get_mut(handles[1]).unwrap().state = FlowState::Old;
        index.note_attached();

        assert_eq!(index.gc(&ids[0], FQ_GC_AGE), 0);
        let collected = index.gc(&ids[0], FQ_GC_AGE + 1);
        assert_eq!(collected, 4);
        assert!(index.lookup(&ids[0]).is_some());
        assert!(index.lookup(&ids[1]).is_some());
        assert!(index.lookup(&ids[2]).is_none());
        assert_eq!(index.flows(), 2);
        assert_eq!(index.inactive(), 1);
    }

    #[test]
    fn gc_is_batch_limited() {
        let mut index = Index::new(1);
        let ids = ids_in_shard(1, 1, FQ_GC_MAX + 4);
        for id in &ids {
            index.insert(Flow::new(*id, 1, 0)).unwrap();
        }
        let collected = index.gc(&ids[0], FQ_GC_AGE + 1);
        assert_eq!(collected, FQ_GC_MAX);
        assert_eq!(index.flows(), 4);
    }

    #[test]
    fn resize_keeps_live_flows_and_drops_stale_ones() {
        let mut index = Index::new(2);
        let mut live = Vec::new();
        for raw in 0..20u64 {
            let h = index.insert(Flow::new(FlowId::Socket(raw), 1, 0)).unwrap();
            if raw % 2 == 0 {
                index.get_mut(h).unwrap().state = FlowState::New;
                index.note_attached();
                live.push((FlowId::Socket(raw), h));
            }
        }
        let dropped = index.resize(6, FQ_GC_AGE + 1);
        assert_eq!(dropped, 10);
        assert_eq!(index.log(), 6);
        assert_eq!(index.flows(), 10);
        assert_eq!(index.inactive(), 0);
        for (id, h) in live {
            assert_eq!(index.lookup(&id), Some(h));
        }
    }

    #[test]
    fn resize_to_same_log_is_noop() {
        let mut index = Index::new(3);
        index.insert(Flow::new(FlowId::Orphan(3), 1, 0)).unwrap();
        assert_eq!(index.resize(3, u64::MAX), 0);
        assert_eq!(index.flows(), 1);
    }
}
