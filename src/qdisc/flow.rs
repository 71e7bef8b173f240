use crate::qdisc::flow_queue::FlowQueue;

/// Flow identity, the sole index key. Socket-keyed and synthetic orphan
/// identities never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FlowId {
    Socket(u64),
    Orphan(u32),
}

impl FlowId {
    /// Word used to pick the shard; orphans get the low bit set.
    pub(crate) fn hash_word(&self) -> u64 {
        match *self {
            FlowId::Socket(id) => id << 1,
            FlowId::Orphan(hash) => (u64::from(hash) << 1) | 1,
        }
    }
}

/// Where a flow currently lives. Exactly one of: a round-robin list, the
/// throttled tree, or nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// Idle since the given jiffy.
    Detached { since: u64 },
    New,
    Old,
    /// `seq` breaks ties in the throttled tree key `(time_next_packet, seq)`.
    Throttled { seq: u64 },
}

/// Stable arena slot of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowHandle(pub(crate) usize);

pub(crate) struct Flow<T, K> {
    pub(crate) id: FlowId,
    pub(crate) queue: FlowQueue<T, K>,
    pub(crate) socket_hash: u32,
    pub(crate) credit: i64,
    pub(crate) time_next_packet: u64,
    pub(crate) state: FlowState,
}

impl<T, K> Flow<T, K> {
    pub(crate) fn new(id: FlowId, initial_quantum: u32, jiffies: u64) -> Self {
        Self {
            id,
            queue: FlowQueue::new(),
            socket_hash: 0,
            credit: i64::from(initial_quantum),
            time_next_packet: 0,
            state: FlowState::Detached { since: jiffies },
        }
    }

    pub(crate) fn qlen(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn detached_since(&self) -> Option<u64> {
        match self.state {
            FlowState::Detached { since } => Some(since),
            _ => None,
        }
    }

    /// Idle longer than `age` jiffies.
    pub(crate) fn is_gc_candidate(&self, jiffies: u64, age: u64) -> bool {
        self.detached_since()
            .is_some_and(|since| jiffies > since.saturating_add(age))
    }
}
