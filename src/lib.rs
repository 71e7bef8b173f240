//! Per-flow fair queueing with earliest-departure-time pacing, in user space.

pub mod clock;
pub mod config;
pub mod ecn;
pub mod error;
pub mod five_tuple;
pub mod nfq_message;
pub mod packet_context;
pub mod qdisc;
pub mod stats;

pub use clock::{Clock, ManualClock, MonotonicClock, Watchdog};
pub use config::{FqConfig, FqOptions, ShaperConfig};
pub use error::{ConfigError, DropReason, Dropped};
pub use packet_context::{PacketContext, SocketRef, SocketState};
pub use qdisc::{FqQdisc, MonitorQdisc, Qdisc};
pub use stats::{FqCounterSnapshot, FqCounters, FqStats};
