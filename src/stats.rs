use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic event counters of one scheduler instance. Shared with reporters
/// through an `Arc` and read without taking the scheduler's exclusive section,
/// so a snapshot may be slightly torn.
#[derive(Debug, Default)]
pub struct FqCounters {
    pub(crate) gc_flows: AtomicU64,
    pub(crate) resize_gc_flows: AtomicU64,
    pub(crate) highprio_packets: AtomicU64,
    pub(crate) throttled: AtomicU64,
    pub(crate) flows_plimit: AtomicU64,
    pub(crate) pkts_too_long: AtomicU64,
    pub(crate) allocation_errors: AtomicU64,
    pub(crate) ce_mark: AtomicU64,
    pub(crate) horizon_drops: AtomicU64,
    pub(crate) horizon_caps: AtomicU64,
    pub(crate) queue_limit_drops: AtomicU64,
    pub(crate) dequeued_packets: AtomicU64,
    pub(crate) dequeued_bytes: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl FqCounters {
    pub fn snapshot(&self) -> FqCounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        FqCounterSnapshot {
            gc_flows: get(&self.gc_flows),
            resize_gc_flows: get(&self.resize_gc_flows),
            highprio_packets: get(&self.highprio_packets),
            throttled: get(&self.throttled),
            flows_plimit: get(&self.flows_plimit),
            pkts_too_long: get(&self.pkts_too_long),
            allocation_errors: get(&self.allocation_errors),
            ce_mark: get(&self.ce_mark),
            horizon_drops: get(&self.horizon_drops),
            horizon_caps: get(&self.horizon_caps),
            queue_limit_drops: get(&self.queue_limit_drops),
            dequeued_packets: get(&self.dequeued_packets),
            dequeued_bytes: get(&self.dequeued_bytes),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FqCounterSnapshot {
    /// Flows reclaimed by lookup-time GC or while resizing.
    pub gc_flows: u64,
    /// Subset of `gc_flows` dropped by a resize.
    pub resize_gc_flows: u64,
    /// Packets that went through the internal flow.
    pub highprio_packets: u64,
    /// Times a flow entered the throttled tree.
    pub throttled: u64,
    pub flows_plimit: u64,
    /// Pacing delays clamped to one second.
    pub pkts_too_long: u64,
    pub allocation_errors: u64,
    pub ce_mark: u64,
    pub horizon_drops: u64,
    pub horizon_caps: u64,
    pub queue_limit_drops: u64,
    pub dequeued_packets: u64,
    pub dequeued_bytes: u64,
}

/// Full `dump-stats` view: counters plus gauges read under the exclusive section.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FqStats {
    #[serde(flatten)]
    pub counters: FqCounterSnapshot,
    pub flows: u64,
    pub inactive_flows: u64,
    pub throttled_flows: u64,
    pub qlen: u64,
    pub backlog_bytes: u64,
    pub unthrottle_latency_ns: u64,
    /// Time until the next throttled flow is due (slack included), 0 if none.
    pub time_next_delayed_flow_ns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reads_counters() {
        let c = FqCounters::default();
        bump(&c.ce_mark, 2);
        bump(&c.flows_plimit, 1);
        let s = c.snapshot();
        assert_eq!(s.ce_mark, 2);
        assert_eq!(s.flows_plimit, 1);
        assert_eq!(s.gc_flows, 0);
    }

    #[test]
    fn stats_serialize_flat() {
        let stats = FqStats {
            flows: 3,
            ..Default::default()
        };
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["flows"], 3);
        assert_eq!(json["gc_flows"], 0);
    }
}
