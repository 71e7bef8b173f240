use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const NSEC_PER_USEC: u64 = 1_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Coarse tick rate used for flow ageing.
pub const HZ: u64 = 1000;
pub const NSEC_PER_JIFFY: u64 = NSEC_PER_SEC / HZ;

// ==========================================
// 时钟能力：纳秒单调时钟 + 粗粒度 jiffies
// ==========================================
pub trait Clock {
    /// Monotonic time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Coarse tick counter derived from the same time base.
    fn jiffies(&self) -> u64 {
        self.now_ns() / NSEC_PER_JIFFY
    }
}

pub fn usecs_to_jiffies(usecs: u64) -> u64 {
    (usecs * NSEC_PER_USEC).div_ceil(NSEC_PER_JIFFY)
}

pub fn jiffies_to_usecs(jiffies: u64) -> u64 {
    jiffies * NSEC_PER_JIFFY / NSEC_PER_USEC
}

/// `CLOCK_MONOTONIC`, the same base the kernel uses for EDT stamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
        if rc != 0 {
            return 0;
        }
        ts.tv_sec as u64 * NSEC_PER_SEC + ts.tv_nsec as u64
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ns)),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ns: u64) {
        self.now.fetch_add(delta_ns, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

// ==========================================
// 单次唤醒定时器：调度器只登记“请在 T ± slack 叫醒我”，
// 真正的睡眠/定时由外层循环负责
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watchdog {
    expires: Option<(u64, u64)>,
}

impl Watchdog {
    pub fn schedule_range(&mut self, expires_ns: u64, slack_ns: u64) {
        self.expires = Some((expires_ns, slack_ns));
    }

    pub fn cancel(&mut self) {
        self.expires = None;
    }

    /// Earliest acceptable wake-up time.
    pub fn deadline(&self) -> Option<u64> {
        self.expires.map(|(at, _)| at)
    }

    /// Latest acceptable wake-up time.
    pub fn latest(&self) -> Option<u64> {
        self.expires.map(|(at, slack)| at.saturating_add(slack))
    }
}
