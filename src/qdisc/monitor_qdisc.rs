use chrono::Local;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{DropReason, Dropped};
use crate::packet_context::PacketContext;
use crate::qdisc::Qdisc;
use crate::stats::FqCounters;

// ==========================================
// 1. 按 queue_num 汇总的统计表 (速率 + 积压水位 + 丢包原因)
// ==========================================
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueStats {
    // 每个报告周期清零
    pub in_pkts: u64,
    pub out_pkts: u64,
    pub out_bytes: u64,
    pub drops: HashMap<DropReason, u64>,

    // 积压水位不清零
    pub backlog_pkts: i64,
    pub backlog_bytes: i64,
}

impl QueueStats {
    pub fn drop_pkts(&self) -> u64 {
        self.drops.values().sum()
    }

    fn record_drop(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_default() += 1;
    }

    fn reset_rates(&mut self) {
        self.in_pkts = 0;
        self.out_pkts = 0;
        self.out_bytes = 0;
        self.drops.clear();
    }
}

// ==========================================
// 2. 监控外壳：包一层任意 Qdisc，按入口队列记账并定期打日志
// ==========================================
pub struct MonitorQdisc<T, K> {
    name: String,
    pub inner: Box<dyn Qdisc<T, K>>,
    stats: HashMap<usize, QueueStats>,
    counters: Option<Arc<FqCounters>>,
    report_interval: Duration,
    last_report: Instant,
}

impl<T, K> MonitorQdisc<T, K> {
    pub fn new(name: &str, inner: Box<dyn Qdisc<T, K>>) -> Self {
        Self {
            name: name.to_string(),
            inner,
            stats: HashMap::new(),
            counters: None,
            report_interval: Duration::from_secs(1),
            last_report: Instant::now(),
        }
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    /// Scheduler counters to include in every report.
    pub fn with_counters(mut self, counters: Arc<FqCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    // 内部清出来的包曾经入队成功，要把水位扣回去
    fn account_drops(&mut self, drops: &[Dropped<T, K>]) {
        for dropped in drops {
            let stat = self.stats.entry(dropped.ctx.queue_num).or_default();
            stat.record_drop(dropped.reason);
            stat.backlog_pkts -= 1;
            stat.backlog_bytes -= dropped.ctx.pkt_len as i64;
        }
    }

    fn check_and_report(&mut self) {
        let elapsed = self.last_report.elapsed();
        if elapsed < self.report_interval {
            return;
        }

        let now_str = Local::now().format("%H:%M:%S").to_string();
        let secs = elapsed.as_secs_f64();

        let mut sorted_queues: Vec<_> = self.stats.keys().copied().collect();
        sorted_queues.sort_unstable();

        let mut total_out_bytes = 0u64;
        let mut total_drops = 0u64;
        for q_num in sorted_queues {
            let Some(stat) = self.stats.get_mut(&q_num) else {
                continue;
            };
            let mbps = (stat.out_bytes as f64 * 8.0) / 1_000_000.0 / secs;
            let drop_pkts = stat.drop_pkts();
            info!(
                at = %now_str,
                pipeline = %self.name,
                queue = q_num,
                in_pkts = stat.in_pkts,
                out_pkts = stat.out_pkts,
                drop_pkts,
                mbps = %format!("{mbps:.2}"),
                backlog_pkts = stat.backlog_pkts,
                backlog_kb = %format!("{:.1}", stat.backlog_bytes as f64 / 1024.0),
                "queue report"
            );
            for (reason, n) in &stat.drops {
                if *n > 0 {
                    warn!(queue = q_num, %reason, count = n, "drops");
                }
            }
            total_out_bytes += stat.out_bytes;
            total_drops += drop_pkts;
            stat.reset_rates();
        }

        let total_mbps = (total_out_bytes as f64 * 8.0) / 1_000_000.0 / secs;
        info!(
            at = %now_str,
            pipeline = %self.name,
            mbps = %format!("{total_mbps:.2}"),
            drops = total_drops,
            backlog_pkts = self.inner.len(),
            "pipeline report"
        );

        if let Some(counters) = &self.counters {
            match serde_json::to_string(&counters.snapshot()) {
                Ok(json) => info!(pipeline = %self.name, counters = %json, "scheduler counters"),
                Err(e) => warn!("failed to serialize counters: {e}"),
            }
        }

        self.last_report = Instant::now();
    }
}

// ==========================================
// 3. 实现 Qdisc 接口 (拦截、更新、平账)
// ==========================================
impl<T, K> Qdisc<T, K> for MonitorQdisc<T, K> {
    fn enqueue(&mut self, ctx: PacketContext<T, K>) -> Result<(), Dropped<T, K>> {
        let q_num = ctx.queue_num;
        let len = ctx.pkt_len as i64;

        let result = self.inner.enqueue(ctx);
        let stat = self.stats.entry(q_num).or_default();
        match &result {
            Ok(()) => {
                stat.in_pkts += 1;
                stat.backlog_pkts += 1;
                stat.backlog_bytes += len;
            }
            // 入口直接拒绝，没进过水位
            Err(dropped) => stat.record_drop(dropped.reason),
        }

        self.check_and_report();
        result
    }

    fn dequeue(&mut self) -> Option<PacketContext<T, K>> {
        let result = self.inner.dequeue();

        if let Some(ctx) = &result {
            let stat = self.stats.entry(ctx.queue_num).or_default();
            stat.out_pkts += 1;
            stat.out_bytes += ctx.pkt_len as u64;
            stat.backlog_pkts -= 1;
            stat.backlog_bytes -= ctx.pkt_len as i64;
        }

        self.check_and_report();
        result
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn collect_dropped(&mut self) -> Vec<Dropped<T, K>> {
        let drops = self.inner.collect_dropped();
        self.account_drops(&drops);
        drops
    }

    fn next_wakeup(&self) -> Option<u64> {
        self.inner.next_wakeup()
    }

    fn wakeup_latest(&self) -> Option<u64> {
        self.inner.wakeup_latest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{FqConfig, FqOptions};
    use crate::packet_context::SocketRef;
    use crate::qdisc::FqQdisc;

    fn monitored(limit: u32) -> MonitorQdisc<Vec<u8>, u32> {
        let mut cfg = FqConfig::default();
        cfg.apply(&FqOptions {
            queue_limit: Some(limit),
            rate_enable: Some(false),
            ..Default::default()
        });
        let fq: FqQdisc<Vec<u8>, u32, ManualClock> = FqQdisc::with_clock(cfg, ManualClock::new(1));
        MonitorQdisc::new("test", Box::new(fq)).with_report_interval(Duration::from_secs(3600))
    }

    fn pkt(queue_num: usize, sock: u64) -> PacketContext<Vec<u8>, u32> {
        PacketContext::new(vec![0; 100], 0, 100, queue_num).with_owner(SocketRef::connected(sock))
    }

    #[test]
    fn tracks_backlog_per_queue() {
        let mut m = monitored(100);
        m.enqueue(pkt(0, 1)).unwrap();
        m.enqueue(pkt(0, 1)).unwrap();
        m.enqueue(pkt(3, 2)).unwrap();
        assert!(m.dequeue().is_some());

        let q0 = m.stats.get(&0).unwrap();
        assert_eq!(q0.in_pkts, 2);
        assert_eq!(q0.out_pkts, 1);
        assert_eq!(q0.backlog_pkts, 1);
        assert_eq!(q0.backlog_bytes, 100);
        assert_eq!(m.stats.get(&3).unwrap().backlog_pkts, 1);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn counts_rejections_and_purges_by_reason() {
        let mut m = monitored(2);
        m.enqueue(pkt(1, 1)).unwrap();
        m.enqueue(pkt(1, 2)).unwrap();
        let err = m.enqueue(pkt(1, 3)).unwrap_err();
        assert_eq!(err.reason, DropReason::QueueFull);

        m.reset();
        let purged = m.collect_dropped();
        assert_eq!(purged.len(), 2);

        let q1 = m.stats.get(&1).unwrap();
        assert_eq!(q1.drops.get(&DropReason::QueueFull), Some(&1));
        assert_eq!(q1.drops.get(&DropReason::Purged), Some(&2));
        assert_eq!(q1.drop_pkts(), 3);
        assert_eq!(q1.backlog_pkts, 0);
        assert_eq!(q1.backlog_bytes, 0);
    }
}
