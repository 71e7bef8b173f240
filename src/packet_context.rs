use std::time::Instant;

/// `TC_PRIO_*` band mask and the control band served ahead of every flow.
pub const TC_PRIO_MAX: u32 = 15;
pub const TC_PRIO_CONTROL: u32 = 7;

/// Connection state of the socket that produced a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Connected socket: its address is the flow identity.
    Connected,
    /// Listener / request socket (e.g. SYNACK): treated as orphaned traffic.
    Listener,
    /// Non-connected socket (UDP `sendto`): hashed per packet but keeps its pacing rate.
    Closed,
}

/// What the scheduler may know about a packet's owning socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketRef {
    /// Stable address-like identity of the socket object.
    pub id: u64,
    /// Changes when the socket object is recycled for another connection.
    pub hash: u32,
    pub state: SocketState,
    /// Advertised pacing rate in bytes/s, `None` when unlimited.
    pub pacing_rate: Option<u64>,
}

impl SocketRef {
    pub fn connected(id: u64) -> Self {
        Self {
            id,
            hash: 0,
            state: SocketState::Connected,
            pacing_rate: None,
        }
    }

    pub fn with_state(mut self, state: SocketState) -> Self {
        self.state = state;
        self
    }

    pub fn with_hash(mut self, hash: u32) -> Self {
        self.hash = hash;
        self
    }

    pub fn with_pacing_rate(mut self, rate: u64) -> Self {
        self.pacing_rate = Some(rate);
        self
    }
}

#[derive(Debug)]
pub struct PacketContext<T, K> {
    // 1. 核心载体
    pub msg: T, // 数据包实体
    pub key: K, // 流标识 (孤儿流靠它做 hash)

    pub pkt_len: usize,

    // 2. 路由归还依据 (为 Verdict 准备)
    pub queue_num: usize,
    pub arrival_time: Instant,

    // 3. 调度元数据
    pub priority: u32,
    /// Earliest departure time requested by the sender (ns, monotonic).
    pub tstamp: Option<u64>,
    pub owner: Option<SocketRef>,

    pub(crate) time_to_send: u64,
    /// Departure hook result, computed on the first visit.
    pub(crate) departure_delay: Option<u64>,
}

impl<T, K> PacketContext<T, K> {
    pub fn new(msg: T, key: K, pkt_len: usize, queue_num: usize) -> Self {
        Self {
            msg,
            key,
            pkt_len,
            queue_num,
            arrival_time: Instant::now(),
            priority: 0,
            tstamp: None,
            owner: None,
            time_to_send: 0,
            departure_delay: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tstamp(mut self, tstamp_ns: u64) -> Self {
        self.tstamp = Some(tstamp_ns);
        self
    }

    pub fn with_owner(mut self, owner: SocketRef) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Departure time resolved at enqueue.
    pub fn time_to_send(&self) -> u64 {
        self.time_to_send
    }

    pub fn is_control(&self) -> bool {
        self.priority & TC_PRIO_MAX == TC_PRIO_CONTROL
    }
}
