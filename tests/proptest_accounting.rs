//! Property-based tests for backlog accounting and per-flow ordering.
//!
//! A random interleaving of enqueues and dequeues is replayed against a plain
//! per-flow FIFO model; the scheduler may pick any flow but must never lose,
//! duplicate or reorder packets within a flow.

use std::collections::{HashMap, VecDeque};

use fq_pacer::clock::ManualClock;
use fq_pacer::{DropReason, FqConfig, FqOptions, FqQdisc, PacketContext, Qdisc, SocketRef};
use proptest::prelude::*;

const FLOW_LIMIT: usize = 6;
const QUEUE_LIMIT: usize = 20;

#[derive(Debug, Clone)]
enum Op {
    Enqueue { flow: u64, len: usize },
    Dequeue,
    Tick(u64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u64..5, 60usize..1500).prop_map(|(flow, len)| Op::Enqueue { flow, len }),
        3 => Just(Op::Dequeue),
        1 => (1u64..5_000_000).prop_map(Op::Tick),
    ]
}

fn scheduler(rate_enable: bool) -> (FqQdisc<Vec<u8>, u32, ManualClock>, ManualClock) {
    let clock = ManualClock::new(1_000_000_000);
    let mut fq = FqQdisc::with_clock(FqConfig::default(), clock.clone());
    fq.change(&FqOptions {
        queue_limit: Some(QUEUE_LIMIT as u32),
        flow_packet_limit: Some(FLOW_LIMIT as u32),
        quantum: Some(1500),
        initial_quantum: Some(3000),
        rate_enable: Some(rate_enable),
        flow_max_rate: Some(2_000_000),
        ..Default::default()
    })
    .unwrap();
    (fq, clock)
}

fn run(ops: &[Op], rate_enable: bool) -> Result<(), TestCaseError> {
    let (mut fq, clock) = scheduler(rate_enable);
    let mut model: HashMap<u64, VecDeque<u32>> = HashMap::new();
    let mut next_id = 0u32;
    let mut bytes = 0u64;

    for op in ops {
        match *op {
            Op::Enqueue { flow, len } => {
                let id = next_id;
                next_id += 1;
                let ctx = PacketContext::new(id.to_be_bytes().to_vec(), 0, len, 0)
                    .with_owner(SocketRef::connected(flow));
                let queued = model.values().map(VecDeque::len).sum::<usize>();
                let flow_queued = model.get(&flow).map_or(0, VecDeque::len);
                match fq.enqueue(ctx) {
                    Ok(()) => {
                        prop_assert!(queued < QUEUE_LIMIT && flow_queued < FLOW_LIMIT);
                        model.entry(flow).or_default().push_back(id);
                        bytes += len as u64;
                    }
                    Err(dropped) => {
                        let expected = if queued >= QUEUE_LIMIT {
                            DropReason::QueueFull
                        } else {
                            DropReason::FlowFull
                        };
                        prop_assert_eq!(dropped.reason, expected);
                        prop_assert!(queued >= QUEUE_LIMIT || flow_queued >= FLOW_LIMIT);
                    }
                }
            }
            Op::Dequeue => {
                if let Some(ctx) = fq.dequeue() {
                    let flow = ctx.owner.map(|sk| sk.id).unwrap_or(u64::MAX);
                    let id = u32::from_be_bytes([ctx.msg[0], ctx.msg[1], ctx.msg[2], ctx.msg[3]]);
                    let head = model.get_mut(&flow).and_then(VecDeque::pop_front);
                    prop_assert_eq!(head, Some(id));
                    bytes -= ctx.pkt_len as u64;
                } else if !rate_enable {
                    prop_assert!(model.values().all(VecDeque::is_empty));
                }
            }
            Op::Tick(ns) => clock.advance(ns),
        }

        let queued = model.values().map(VecDeque::len).sum::<usize>();
        prop_assert_eq!(fq.len(), queued);
        let stats = fq.stats();
        prop_assert_eq!(stats.qlen as usize, queued);
        prop_assert_eq!(stats.backlog_bytes, bytes);
        prop_assert!(stats.inactive_flows <= stats.flows);
    }
    Ok(())
}

proptest! {
    #[test]
    fn backlog_matches_model_without_pacing(ops in prop::collection::vec(op(), 1..200)) {
        run(&ops, false)?;
    }

    #[test]
    fn backlog_matches_model_with_pacing(ops in prop::collection::vec(op(), 1..200)) {
        run(&ops, true)?;
    }

    #[test]
    fn everything_drains_eventually(
        flows in prop::collection::vec(0u64..8, 1..QUEUE_LIMIT),
    ) {
        let (mut fq, clock) = scheduler(true);
        let mut admitted = 0usize;
        for (i, flow) in flows.iter().enumerate() {
            let ctx = PacketContext::new(vec![i as u8; 4], 0, 1000, 0)
                .with_owner(SocketRef::connected(*flow));
            if fq.enqueue(ctx).is_ok() {
                admitted += 1;
            }
        }
        let mut served = 0usize;
        while served < admitted {
            match fq.dequeue() {
                Some(_) => served += 1,
                None => {
                    let at = fq.next_wakeup();
                    prop_assert!(at.is_some());
                    clock.set(at.unwrap_or_default());
                }
            }
        }
        prop_assert!(fq.is_empty());
        prop_assert_eq!(fq.stats().counters.dequeued_packets as usize, admitted);
    }
}
