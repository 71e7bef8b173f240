use std::fmt;

use thiserror::Error;

use crate::packet_context::PacketContext;

/// Why a packet left the scheduler without being transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DropReason {
    #[error("queue limit reached")]
    QueueFull,
    #[error("per-flow packet limit reached")]
    FlowFull,
    #[error("departure time beyond horizon")]
    HorizonViolation,
    #[error("purged by reset or limit change")]
    Purged,
}

/// A rejected or purged packet, handed back to the caller for verdict/free.
pub struct Dropped<T, K> {
    pub reason: DropReason,
    pub ctx: PacketContext<T, K>,
}

impl<T, K> Dropped<T, K> {
    pub fn new(reason: DropReason, ctx: PacketContext<T, K>) -> Self {
        Self { reason, ctx }
    }
}

impl<T, K> fmt::Debug for Dropped<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dropped")
            .field("reason", &self.reason)
            .field("pkt_len", &self.ctx.pkt_len)
            .field("queue_num", &self.ctx.queue_num)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: u64 },
    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
}
