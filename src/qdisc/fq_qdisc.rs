use std::collections::{BTreeMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::FxHasher;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, MonotonicClock, NSEC_PER_SEC, Watchdog};
use crate::config::{FqConfig, FqOptions, MAX_BUCKETS_LOG};
use crate::ecn::EcnMark;
use crate::error::{ConfigError, DropReason, Dropped};
use crate::packet_context::{PacketContext, SocketRef, SocketState};
use crate::qdisc::Qdisc;
use crate::qdisc::flow::{Flow, FlowHandle, FlowId, FlowState};
use crate::qdisc::flow_index::FlowIndex;
use crate::qdisc::flow_queue::FlowQueue;
use crate::stats::{FqCounters, FqStats, bump};

/// Extra nanoseconds to hold a packet back, consulted before the pacing check.
///
/// Called once per packet, the first time the packet reaches the head of its
/// flow; the result is kept with the packet and capped at
/// [`MAX_DEPARTURE_DELAY_NS`].
pub type DepartureHook<T, K> = Box<dyn FnMut(&PacketContext<T, K>) -> u64>;

/// Upper bound on what a departure hook may add, same as the pacing clamp.
pub const MAX_DEPARTURE_DELAY_NS: u64 = NSEC_PER_SEC;

enum Target {
    Internal,
    Flow(FlowHandle),
}

// ==========================================
// 按流公平排队 + EDT 限速调度器
//   - 新流/旧流两条轮转队列
//   - 被限速的流挂在按 time_next_packet 排序的树上
//   - 高优控制报文走内部流，无条件优先
// ==========================================
pub struct FqQdisc<T, K, C = MonotonicClock> {
    config: FqConfig,
    clock: C,

    index: FlowIndex<T, K>,
    internal: FlowQueue<T, K>,

    new_flows: VecDeque<FlowHandle>,
    old_flows: VecDeque<FlowHandle>,
    delayed: BTreeMap<(u64, u64), FlowHandle>,
    delayed_seq: u64,
    time_next_delayed_flow: u64,

    ktime_cache: u64,
    unthrottle_latency_ns: u64,

    qlen: usize,
    backlog: u64,

    counters: Arc<FqCounters>,
    watchdog: Watchdog,
    pending_dropped: Vec<Dropped<T, K>>,
    departure_hook: Option<DepartureHook<T, K>>,
}

impl<T, K> FqQdisc<T, K, MonotonicClock>
where
    T: EcnMark,
    K: Hash,
{
    pub fn new(config: FqConfig) -> Self {
        Self::with_clock(config, MonotonicClock)
    }
}

impl<T, K, C> FqQdisc<T, K, C>
where
    T: EcnMark,
    K: Hash,
    C: Clock,
{
    pub fn with_clock(config: FqConfig, clock: C) -> Self {
        let log = config.buckets_log.clamp(1, MAX_BUCKETS_LOG);
        let mut index = FlowIndex::new(log);
        index.set_limit(config.flow_limit);
        Self {
            config: FqConfig {
                buckets_log: log,
                ..config
            },
            clock,
            index,
            internal: FlowQueue::new(),
            new_flows: VecDeque::new(),
            old_flows: VecDeque::new(),
            delayed: BTreeMap::new(),
            delayed_seq: 0,
            time_next_delayed_flow: u64::MAX,
            ktime_cache: 0,
            unthrottle_latency_ns: 0,
            qlen: 0,
            backlog: 0,
            counters: Arc::new(FqCounters::default()),
            watchdog: Watchdog::default(),
            pending_dropped: Vec::new(),
            departure_hook: None,
        }
    }

    pub fn with_departure_hook(mut self, hook: DepartureHook<T, K>) -> Self {
        self.departure_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &FqConfig {
        &self.config
    }

    /// Current configuration in option form.
    pub fn dump(&self) -> FqOptions {
        FqOptions::from(&self.config)
    }

    /// Counter handle that can be read from another thread.
    pub fn counters(&self) -> Arc<FqCounters> {
        Arc::clone(&self.counters)
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn stats(&self) -> FqStats {
        let time_next_delayed_flow_ns = if self.time_next_delayed_flow == u64::MAX {
            0
        } else {
            (self.time_next_delayed_flow + self.config.timer_slack_ns)
                .saturating_sub(self.clock.now_ns())
        };
        FqStats {
            counters: self.counters.snapshot(),
            flows: self.index.flows() as u64,
            inactive_flows: self.index.inactive() as u64,
            throttled_flows: self.delayed.len() as u64,
            qlen: self.qlen as u64,
            backlog_bytes: self.backlog,
            unthrottle_latency_ns: self.unthrottle_latency_ns,
            time_next_delayed_flow_ns,
        }
    }

    /// Applies a partial configuration. Valid fields always take effect; the
    /// first rejected field is reported. The flow index is only resized when
    /// nothing was rejected. Packets over a lowered `queue_limit` are purged.
    pub fn change(&mut self, opts: &FqOptions) -> Result<(), ConfigError> {
        let (log, mut errors) = self.config.apply(opts);
        self.index.set_limit(self.config.flow_limit);

        if errors.is_empty() {
            self.resize(log)?;
        }

        let mut purged = 0usize;
        while self.qlen > self.config.queue_limit {
            let Some(ctx) = self.dequeue_packet() else {
                break;
            };
            self.pending_dropped
                .push(Dropped::new(DropReason::Purged, ctx));
            purged += 1;
        }
        if purged > 0 {
            debug!(purged, limit = self.config.queue_limit, "trimmed backlog");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.swap_remove(0))
        }
    }

    /// Rehashes the flow index into `1 << log` shards.
    pub fn resize(&mut self, log: u8) -> Result<(), ConfigError> {
        if !(1..=MAX_BUCKETS_LOG).contains(&log) {
            return Err(ConfigError::OutOfRange {
                field: "buckets_log",
                value: u64::from(log),
            });
        }
        let dropped = self.index.resize(log, self.clock.jiffies()) as u64;
        bump(&self.counters.gc_flows, dropped);
        bump(&self.counters.resize_gc_flows, dropped);
        self.config.buckets_log = self.index.log();
        Ok(())
    }

    fn beyond_horizon(&self, tstamp: u64) -> bool {
        tstamp > self.ktime_cache.saturating_add(self.config.horizon_ns)
    }

    fn orphan_id(&self, key: &K) -> FlowId {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        FlowId::Orphan(hasher.finish() as u32 & self.config.orphan_mask)
    }

    fn classify(&mut self, ctx: &mut PacketContext<T, K>) -> Target {
        // 注意：控制报文没有防饿死保护
        if ctx.is_control() {
            return Target::Internal;
        }

        let owner = ctx.owner;
        let id = match owner {
            Some(sk) if sk.state == SocketState::Connected => FlowId::Socket(sk.id),
            // 未连接的 socket 按包 hash 分流，但保留 owner 以便沿用其限速
            Some(sk) if sk.state == SocketState::Closed => self.orphan_id(&ctx.key),
            _ => {
                ctx.owner = None;
                self.orphan_id(&ctx.key)
            }
        };
        let owner = ctx.owner.filter(|sk| FlowId::Socket(sk.id) == id);

        let jiffies = self.clock.jiffies();
        if self.index.wants_gc() {
            let collected = self.index.gc(&id, jiffies);
            bump(&self.counters.gc_flows, collected as u64);
        }

        if let Some(handle) = self.index.lookup(&id) {
            if let Some(sk) = owner {
                self.check_socket_reuse(handle, sk);
            }
            return Target::Flow(handle);
        }

        let mut flow = Flow::new(id, self.config.initial_quantum, jiffies);
        if let Some(sk) = owner {
            flow.socket_hash = sk.hash;
        }
        match self.index.insert(flow) {
            Some(handle) => Target::Flow(handle),
            None => {
                bump(&self.counters.allocation_errors, 1);
                warn!(flows = self.index.flows(), "flow limit reached, using internal flow");
                Target::Internal
            }
        }
    }

    /// A recycled socket object starts over with a fresh budget and no pacing debt.
    fn check_socket_reuse(&mut self, handle: FlowHandle, sk: SocketRef) {
        let Some(flow) = self.index.get_mut(handle) else {
            return;
        };
        if flow.socket_hash == sk.hash {
            return;
        }
        flow.credit = i64::from(self.config.initial_quantum);
        flow.socket_hash = sk.hash;
        if matches!(flow.state, FlowState::Throttled { .. }) {
            self.unset_throttled(handle);
        }
        if let Some(flow) = self.index.get_mut(handle) {
            flow.time_next_packet = 0;
        }
        debug!(?handle, "socket reused, flow state reset");
    }

    fn set_throttled(&mut self, handle: FlowHandle) {
        let Some(flow) = self.index.get_mut(handle) else {
            return;
        };
        let seq = self.delayed_seq;
        self.delayed_seq += 1;
        flow.state = FlowState::Throttled { seq };
        let time_next_packet = flow.time_next_packet;
        self.delayed.insert((time_next_packet, seq), handle);
        bump(&self.counters.throttled, 1);
        self.time_next_delayed_flow = self.time_next_delayed_flow.min(time_next_packet);
        trace!(?handle, time_next_packet, "flow throttled");
    }

    fn unset_throttled(&mut self, handle: FlowHandle) {
        let Some(flow) = self.index.get_mut(handle) else {
            return;
        };
        if let FlowState::Throttled { seq } = flow.state {
            self.delayed.remove(&(flow.time_next_packet, seq));
        }
        flow.state = FlowState::Old;
        self.old_flows.push_back(handle);
    }

    /// Moves every throttled flow that is due back to the old list.
    fn check_throttled(&mut self, now: u64) {
        if self.time_next_delayed_flow > now {
            return;
        }

        // 解除限速延迟的 EWMA (1/8)，用来诊断定时器抖动
        let sample = now - self.time_next_delayed_flow;
        self.unthrottle_latency_ns -= self.unthrottle_latency_ns >> 3;
        self.unthrottle_latency_ns += sample >> 3;

        self.time_next_delayed_flow = u64::MAX;
        while let Some((&(time_next_packet, _), &handle)) = self.delayed.first_key_value() {
            if time_next_packet > now {
                self.time_next_delayed_flow = time_next_packet;
                break;
            }
            self.delayed.pop_first();
            if let Some(flow) = self.index.get_mut(handle) {
                flow.state = FlowState::Old;
            }
            self.old_flows.push_back(handle);
        }
    }

    fn pop_head(&mut self, from_new: bool) {
        if from_new {
            self.new_flows.pop_front();
        } else {
            self.old_flows.pop_front();
        }
    }

    fn account_dequeue(&mut self, ctx: &PacketContext<T, K>) {
        self.qlen -= 1;
        self.backlog = self.backlog.saturating_sub(ctx.pkt_len as u64);
    }

    fn dequeue_packet(&mut self) -> Option<PacketContext<T, K>> {
        if self.qlen == 0 {
            return None;
        }

        if let Some(ctx) = self.internal.pop() {
            self.account_dequeue(&ctx);
            return Some(ctx);
        }

        self.watchdog.cancel();
        let now = self.clock.now_ns();
        self.ktime_cache = now;
        self.check_throttled(now);

        loop {
            let from_new = !self.new_flows.is_empty();
            let head = if from_new {
                self.new_flows.front()
            } else {
                self.old_flows.front()
            };
            let Some(&handle) = head else {
                if self.time_next_delayed_flow != u64::MAX {
                    self.watchdog
                        .schedule_range(self.time_next_delayed_flow, self.config.timer_slack_ns);
                }
                return None;
            };
            let Some(flow) = self.index.get_mut(handle) else {
                self.pop_head(from_new);
                continue;
            };

            if flow.credit <= 0 {
                flow.credit += i64::from(self.config.quantum);
                flow.state = FlowState::Old;
                self.pop_head(from_new);
                self.old_flows.push_back(handle);
                continue;
            }

            let Some(pkt) = flow.queue.peek() else {
                // 新流排空时若旧流非空，先挪到旧流队尾，强制旧流至少轮到一次
                if from_new && !self.old_flows.is_empty() {
                    flow.state = FlowState::Old;
                    self.pop_head(from_new);
                    self.old_flows.push_back(handle);
                } else {
                    flow.state = FlowState::Detached {
                        since: self.clock.jiffies(),
                    };
                    self.pop_head(from_new);
                    self.index.note_detached();
                }
                continue;
            };

            let extra = match (pkt.departure_delay, self.departure_hook.as_mut()) {
                (Some(delay), _) => delay,
                (None, Some(hook)) => {
                    let delay = hook(&*pkt).min(MAX_DEPARTURE_DELAY_NS);
                    pkt.departure_delay = Some(delay);
                    delay
                }
                (None, None) => 0,
            };
            let time_next_packet = pkt
                .time_to_send
                .saturating_add(extra)
                .max(flow.time_next_packet);

            if now < time_next_packet {
                flow.time_next_packet = time_next_packet;
                self.pop_head(from_new);
                self.set_throttled(handle);
                continue;
            }

            let Some(mut ctx) = flow.queue.pop() else {
                continue;
            };
            if now - time_next_packet > self.config.ce_threshold_ns {
                ctx.msg.set_ce();
                bump(&self.counters.ce_mark, 1);
            }

            flow.credit -= ctx.pkt_len as i64;
            if self.config.rate_enable {
                pace(&self.config, &self.counters, flow, &ctx, now);
            }

            self.account_dequeue(&ctx);
            return Some(ctx);
        }
    }
}

/// Sets `time_next_packet` for the flow's next packet from its effective rate.
fn pace<T, K>(
    config: &FqConfig,
    counters: &FqCounters,
    flow: &mut Flow<T, K>,
    ctx: &PacketContext<T, K>,
    now: u64,
) {
    let mut rate = config.flow_max_rate;

    // 带 EDT 时间戳的包只受 flow_max_rate 约束
    if ctx.tstamp.is_none() {
        if let Some(sk_rate) = ctx.owner.and_then(|sk| sk.pacing_rate) {
            rate = Some(rate.map_or(sk_rate, |max| max.min(sk_rate)));
        }
        if rate.is_some_and(|r| r <= config.low_rate_threshold) {
            flow.credit = 0;
        }
    }

    let Some(rate) = rate else {
        return;
    };

    let mut len = ctx.pkt_len as u64 * NSEC_PER_SEC;
    if rate > 0 {
        len /= rate;
    }
    if len > NSEC_PER_SEC {
        len = NSEC_PER_SEC;
        bump(&counters.pkts_too_long, 1);
    }
    // 上一个包出队时的计划时间已过去多久，就少等多久（最多减半）
    if flow.time_next_packet != 0 {
        len -= (len / 2).min(now.saturating_sub(flow.time_next_packet));
    }
    flow.time_next_packet = now + len;
}

impl<T, K, C> Qdisc<T, K> for FqQdisc<T, K, C>
where
    T: EcnMark,
    K: Hash,
    C: Clock,
{
    fn enqueue(&mut self, mut ctx: PacketContext<T, K>) -> Result<(), Dropped<T, K>> {
        if self.qlen >= self.config.queue_limit {
            bump(&self.counters.queue_limit_drops, 1);
            return Err(Dropped::new(DropReason::QueueFull, ctx));
        }

        match ctx.tstamp {
            None => {
                self.ktime_cache = self.clock.now_ns();
                ctx.time_to_send = self.ktime_cache;
            }
            Some(mut tstamp) => {
                // 先用缓存的时间判断，越界了再刷新一次时钟
                if self.beyond_horizon(tstamp) {
                    self.ktime_cache = self.clock.now_ns();
                    if self.beyond_horizon(tstamp) {
                        if self.config.horizon_drop {
                            bump(&self.counters.horizon_drops, 1);
                            return Err(Dropped::new(DropReason::HorizonViolation, ctx));
                        }
                        bump(&self.counters.horizon_caps, 1);
                        tstamp = self.ktime_cache + self.config.horizon_ns;
                        ctx.tstamp = Some(tstamp);
                    }
                }
                ctx.time_to_send = tstamp;
            }
        }

        let pkt_len = ctx.pkt_len as u64;
        let target = match self.classify(&mut ctx) {
            Target::Flow(handle) => self.index.get_mut(handle).map(|flow| (handle, flow)),
            Target::Internal => None,
        };

        match target {
            None => {
                self.internal.push(ctx);
                bump(&self.counters.highprio_packets, 1);
            }
            Some((handle, flow)) => {
                if flow.qlen() >= self.config.flow_packet_limit {
                    bump(&self.counters.flows_plimit, 1);
                    return Err(Dropped::new(DropReason::FlowFull, ctx));
                }

                let detached_since = flow.detached_since();
                if let Some(since) = detached_since {
                    flow.state = FlowState::New;
                    // 闲置够久的流重新激活时，至少补满一个 quantum
                    if self.clock.jiffies() > since + self.config.flow_refill_delay {
                        flow.credit = flow.credit.max(i64::from(self.config.quantum));
                    }
                }
                flow.queue.push(ctx);

                if detached_since.is_some() {
                    self.new_flows.push_back(handle);
                    self.index.note_attached();
                }
            }
        }

        self.qlen += 1;
        self.backlog += pkt_len;
        Ok(())
    }

    fn dequeue(&mut self) -> Option<PacketContext<T, K>> {
        let ctx = self.dequeue_packet()?;
        bump(&self.counters.dequeued_packets, 1);
        bump(&self.counters.dequeued_bytes, ctx.pkt_len as u64);
        Some(ctx)
    }

    fn reset(&mut self) {
        for ctx in self.internal.drain() {
            self.pending_dropped
                .push(Dropped::new(DropReason::Purged, ctx));
        }
        for mut flow in self.index.drain() {
            for ctx in flow.queue.drain() {
                self.pending_dropped
                    .push(Dropped::new(DropReason::Purged, ctx));
            }
        }
        self.new_flows.clear();
        self.old_flows.clear();
        self.delayed.clear();
        self.time_next_delayed_flow = u64::MAX;
        self.qlen = 0;
        self.backlog = 0;
        self.watchdog.cancel();
    }

    fn len(&self) -> usize {
        self.qlen
    }

    fn collect_dropped(&mut self) -> Vec<Dropped<T, K>> {
        std::mem::take(&mut self.pending_dropped)
    }

    fn next_wakeup(&self) -> Option<u64> {
        self.watchdog.deadline()
    }

    fn wakeup_latest(&self) -> Option<u64> {
        self.watchdog.latest()
    }
}
