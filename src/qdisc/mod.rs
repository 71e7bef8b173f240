use crate::error::Dropped;
use crate::packet_context::PacketContext;

mod flow;
mod flow_index;
mod flow_queue;
mod fq_qdisc;
mod monitor_qdisc;

pub use flow::{FlowHandle, FlowId, FlowState};
pub use fq_qdisc::{DepartureHook, FqQdisc, MAX_DEPARTURE_DELAY_NS};
pub use monitor_qdisc::MonitorQdisc;

pub trait Qdisc<T, K> {
    fn enqueue(&mut self, ctx: PacketContext<T, K>) -> Result<(), Dropped<T, K>>;
    fn dequeue(&mut self) -> Option<PacketContext<T, K>>;
    /// Purges all queued state; purged packets come back through `collect_dropped`.
    fn reset(&mut self);
    /// Packets currently queued.
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn collect_dropped(&mut self) -> Vec<Dropped<T, K>> {
        Vec::new()
    }
    /// When the caller should call `dequeue` again if it returned `None`.
    fn next_wakeup(&self) -> Option<u64> {
        None
    }
    /// Latest acceptable wake-up, `next_wakeup` plus any timer slack.
    fn wakeup_latest(&self) -> Option<u64> {
        self.next_wakeup()
    }
}
