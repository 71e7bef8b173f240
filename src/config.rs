use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::{NSEC_PER_USEC, jiffies_to_usecs, usecs_to_jiffies};
use crate::error::ConfigError;

/// Link MTU plus the Ethernet header, as the kernel's `psched_mtu()`.
pub const DEFAULT_PSCHED_MTU: u32 = 1514;
pub const MAX_QUANTUM: u32 = 1 << 20;
/// Largest shard table: 256K trees.
pub const MAX_BUCKETS_LOG: u8 = 18;

/// Resolved scheduler parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FqConfig {
    pub queue_limit: usize,
    pub flow_packet_limit: usize,
    pub quantum: u32,
    pub initial_quantum: u32,
    pub rate_enable: bool,
    /// Bytes/s ceiling on any flow, `None` for unlimited.
    pub flow_max_rate: Option<u64>,
    pub low_rate_threshold: u64,
    /// In jiffies.
    pub flow_refill_delay: u64,
    pub orphan_mask: u32,
    pub buckets_log: u8,
    pub timer_slack_ns: u64,
    pub horizon_ns: u64,
    pub horizon_drop: bool,
    pub ce_threshold_ns: u64,
    /// Cap on live flow objects; past it new flows fall back to the internal flow.
    pub flow_limit: Option<usize>,
}

impl Default for FqConfig {
    fn default() -> Self {
        Self::with_mtu(DEFAULT_PSCHED_MTU)
    }
}

impl FqConfig {
    pub fn with_mtu(psched_mtu: u32) -> Self {
        Self {
            queue_limit: 10_000,
            flow_packet_limit: 100,
            quantum: 2 * psched_mtu,
            initial_quantum: 10 * psched_mtu,
            rate_enable: true,
            flow_max_rate: None,
            low_rate_threshold: 550_000 / 8,
            flow_refill_delay: usecs_to_jiffies(40_000),
            orphan_mask: 1024 - 1,
            buckets_log: 10,
            timer_slack_ns: 10 * NSEC_PER_USEC,
            horizon_ns: 10 * 1_000_000 * NSEC_PER_USEC,
            horizon_drop: true,
            ce_threshold_ns: NSEC_PER_USEC * u64::from(u32::MAX),
            flow_limit: None,
        }
    }

    /// Applies every valid field of `opts`. Out-of-range fields keep their
    /// previous value and are reported; `buckets_log` is returned rather than
    /// stored because it only takes effect through a resize.
    pub fn apply(&mut self, opts: &FqOptions) -> (u8, Vec<ConfigError>) {
        let mut errors = Vec::new();
        let mut log = self.buckets_log;

        if let Some(v) = opts.buckets_log {
            if (1..=u32::from(MAX_BUCKETS_LOG)).contains(&v) {
                log = v as u8;
            } else {
                errors.push(out_of_range("buckets_log", v));
            }
        }
        if let Some(v) = opts.queue_limit {
            self.queue_limit = v as usize;
        }
        if let Some(v) = opts.flow_packet_limit {
            self.flow_packet_limit = v as usize;
        }
        if let Some(v) = opts.quantum {
            if v > 0 && v <= MAX_QUANTUM {
                self.quantum = v;
            } else {
                errors.push(out_of_range("quantum", v));
            }
        }
        if let Some(v) = opts.initial_quantum {
            self.initial_quantum = v;
        }
        if let Some(v) = opts.flow_default_rate {
            warn!(rate = v, "flow_default_rate ignored");
        }
        if let Some(v) = opts.flow_max_rate {
            self.flow_max_rate = (v != u32::MAX).then_some(u64::from(v));
        }
        if let Some(v) = opts.low_rate_threshold {
            self.low_rate_threshold = u64::from(v);
        }
        if let Some(v) = opts.rate_enable {
            self.rate_enable = v;
        }
        if let Some(v) = opts.flow_refill_delay_us {
            self.flow_refill_delay = usecs_to_jiffies(u64::from(v));
        }
        if let Some(v) = opts.orphan_mask {
            self.orphan_mask = v;
        }
        if let Some(v) = opts.ce_threshold_us {
            self.ce_threshold_ns = NSEC_PER_USEC * u64::from(v);
        }
        if let Some(v) = opts.timer_slack_ns {
            self.timer_slack_ns = u64::from(v);
        }
        if let Some(v) = opts.horizon_us {
            self.horizon_ns = NSEC_PER_USEC * u64::from(v);
        }
        if let Some(v) = opts.horizon_drop {
            self.horizon_drop = v;
        }
        if let Some(v) = opts.flow_limit {
            self.flow_limit = (v != 0).then_some(v as usize);
        }

        for err in &errors {
            warn!(%err, "rejected scheduler option");
        }
        (log, errors)
    }
}

fn out_of_range(field: &'static str, value: u32) -> ConfigError {
    ConfigError::OutOfRange {
        field,
        value: u64::from(value),
    }
}

/// Partial scheduler configuration: unset fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FqOptions {
    pub queue_limit: Option<u32>,
    pub flow_packet_limit: Option<u32>,
    pub quantum: Option<u32>,
    pub initial_quantum: Option<u32>,
    pub rate_enable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_default_rate: Option<u32>,
    /// `u32::MAX` means unlimited.
    pub flow_max_rate: Option<u32>,
    pub low_rate_threshold: Option<u32>,
    pub flow_refill_delay_us: Option<u32>,
    pub orphan_mask: Option<u32>,
    pub buckets_log: Option<u32>,
    pub timer_slack_ns: Option<u32>,
    pub horizon_us: Option<u32>,
    pub horizon_drop: Option<bool>,
    pub ce_threshold_us: Option<u32>,
    /// 0 means unbounded.
    pub flow_limit: Option<u32>,
}

impl From<&FqConfig> for FqOptions {
    fn from(cfg: &FqConfig) -> Self {
        let clamp = |v: u64| v.min(u64::from(u32::MAX)) as u32;
        Self {
            queue_limit: Some(clamp(cfg.queue_limit as u64)),
            flow_packet_limit: Some(clamp(cfg.flow_packet_limit as u64)),
            quantum: Some(cfg.quantum),
            initial_quantum: Some(cfg.initial_quantum),
            rate_enable: Some(cfg.rate_enable),
            flow_default_rate: None,
            flow_max_rate: Some(cfg.flow_max_rate.map_or(u32::MAX, clamp)),
            low_rate_threshold: Some(clamp(cfg.low_rate_threshold)),
            flow_refill_delay_us: Some(clamp(jiffies_to_usecs(cfg.flow_refill_delay))),
            orphan_mask: Some(cfg.orphan_mask),
            buckets_log: Some(u32::from(cfg.buckets_log)),
            timer_slack_ns: Some(clamp(cfg.timer_slack_ns)),
            horizon_us: Some(clamp(cfg.horizon_ns / NSEC_PER_USEC)),
            horizon_drop: Some(cfg.horizon_drop),
            ce_threshold_us: Some(clamp(cfg.ce_threshold_ns / NSEC_PER_USEC)),
            flow_limit: Some(cfg.flow_limit.map_or(0, |v| clamp(v as u64))),
        }
    }
}

// ==========================================
// 进程级配置 (TOML)：NFQUEUE 队列号 + 调度参数
// ==========================================
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ShaperConfigInput {
    pub queues: Vec<u16>,
    pub queue_max_len: Option<u32>,
    pub psched_mtu: Option<u32>,
    pub idle_sleep_us: Option<u64>,
    pub report_interval_secs: Option<u64>,
    pub fq: FqOptions,
}

#[derive(Debug, Clone)]
pub struct ShaperConfig {
    pub queues: Vec<u16>,
    pub queue_max_len: u32,
    pub psched_mtu: u32,
    pub idle_sleep: Duration,
    pub report_interval: Duration,
    pub fq: FqOptions,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            queues: vec![0],
            queue_max_len: 10_000,
            psched_mtu: DEFAULT_PSCHED_MTU,
            idle_sleep: Duration::from_micros(100),
            report_interval: Duration::from_secs(1),
            fq: FqOptions::default(),
        }
    }
}

impl ShaperConfigInput {
    pub fn resolve(self) -> ShaperConfig {
        let defaults = ShaperConfig::default();
        let mut queues = self.queues;
        queues.sort_unstable();
        queues.dedup();
        if queues.is_empty() {
            queues = defaults.queues;
        }
        ShaperConfig {
            queues,
            queue_max_len: self.queue_max_len.unwrap_or(defaults.queue_max_len),
            psched_mtu: self.psched_mtu.unwrap_or(defaults.psched_mtu),
            idle_sleep: self
                .idle_sleep_us
                .map_or(defaults.idle_sleep, Duration::from_micros),
            report_interval: self
                .report_interval_secs
                .map_or(defaults.report_interval, |s| Duration::from_secs(s.max(1))),
            fq: self.fq,
        }
    }
}

impl ShaperConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let parsed: ShaperConfigInput = toml::from_str(input)?;
        Ok(parsed.resolve())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
