use std::collections::{BTreeMap, VecDeque};

use crate::packet_context::PacketContext;

/// Per-flow packet queue ordered by departure time.
///
/// Packets arriving with non-decreasing `time_to_send` are appended to a
/// plain FIFO in O(1). A packet that would depart before the current tail
/// goes into a time-ordered tree instead; `peek`/`pop` take the earlier of
/// the FIFO head and the tree minimum, preferring the FIFO on ties.
pub(crate) struct FlowQueue<T, K> {
    fifo: VecDeque<PacketContext<T, K>>,
    tree: BTreeMap<(u64, u64), PacketContext<T, K>>,
    seq: u64,
}

#[derive(Clone, Copy)]
enum Head {
    Fifo,
    Tree((u64, u64)),
}

impl<T, K> FlowQueue<T, K> {
    pub(crate) fn new() -> Self {
        Self {
            fifo: VecDeque::new(),
            tree: BTreeMap::new(),
            seq: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.fifo.len() + self.tree.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.fifo.is_empty() && self.tree.is_empty()
    }

    pub(crate) fn push(&mut self, ctx: PacketContext<T, K>) {
        let in_order = self
            .fifo
            .back()
            .is_none_or(|tail| ctx.time_to_send >= tail.time_to_send);
        if in_order {
            self.fifo.push_back(ctx);
            return;
        }
        // 乱序包：按 (时间, 到达序) 插入树，同时间保持 FIFO
        let key = (ctx.time_to_send, self.seq);
        self.seq += 1;
        self.tree.insert(key, ctx);
    }

    fn head(&self) -> Option<Head> {
        match (self.fifo.front(), self.tree.first_key_value()) {
            (None, None) => None,
            (Some(_), None) => Some(Head::Fifo),
            (None, Some((&key, _))) => Some(Head::Tree(key)),
            (Some(front), Some((&key, _))) => {
                if key.0 < front.time_to_send {
                    Some(Head::Tree(key))
                } else {
                    Some(Head::Fifo)
                }
            }
        }
    }

    /// Earliest pending packet.
    pub(crate) fn peek(&mut self) -> Option<&mut PacketContext<T, K>> {
        match self.head()? {
            Head::Fifo => self.fifo.front_mut(),
            Head::Tree(key) => self.tree.get_mut(&key),
        }
    }

    /// Removes the packet `peek` returns.
    pub(crate) fn pop(&mut self) -> Option<PacketContext<T, K>> {
        match self.head()? {
            Head::Fifo => self.fifo.pop_front(),
            Head::Tree(key) => self.tree.remove(&key),
        }
    }

    /// Empties the queue, tree packets first.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PacketContext<T, K>> + '_ {
        let tree = std::mem::take(&mut self.tree);
        tree.into_values().chain(self.fifo.drain(..))
    }
}
