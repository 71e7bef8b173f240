use std::time::Duration;

use fq_pacer::clock::{Clock, MonotonicClock};
use fq_pacer::config::{FqConfig, ShaperConfig};
use fq_pacer::five_tuple::FiveTuple;
use fq_pacer::nfq_message::NfqMessage as Message;
use fq_pacer::packet_context::PacketContext;
use fq_pacer::qdisc::{FqQdisc, MonitorQdisc, Qdisc};
use nfq::{Message as InnerMessage, Queue, Verdict};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const BATCH_LIMIT: usize = 10000;

fn make_queue(queue_num: u16, max_len: u32) -> Result<Queue, std::io::Error> {
    let mut q = Queue::open()?;
    q.bind(queue_num)?;
    q.set_copy_range(queue_num, 0xFFFF)?;
    q.set_queue_max_len(queue_num, max_len)?;
    q.set_nonblocking(true);
    Ok(q)
}

fn send_verdict(queues: &mut [Queue], ctx: PacketContext<Message, FiveTuple>, verdict: Verdict) {
    let mut msg: InnerMessage = ctx.msg.into();
    msg.set_verdict(verdict);
    if let Err(e) = queues[ctx.queue_num].verdict(msg) {
        warn!(queue = ctx.queue_num, "verdict failed: {e}");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ShaperConfig::load(&path)?,
        None => ShaperConfig::default(),
    };
    info!(?config, "starting");

    let mut fq: FqQdisc<Message, FiveTuple> = FqQdisc::new(FqConfig::with_mtu(config.psched_mtu));
    fq.change(&config.fq)?;
    info!(options = ?fq.dump(), "scheduler configured");

    let counters = fq.counters();
    let mut pipeline = MonitorQdisc::new("fq", Box::new(fq))
        .with_report_interval(config.report_interval)
        .with_counters(counters);

    let mut queues = config
        .queues
        .iter()
        .map(|&num| make_queue(num, config.queue_max_len))
        .collect::<Result<Vec<_>, _>>()?;

    let clock = MonotonicClock;
    loop {
        let mut working = false;

        let mut packet_count = 0;
        loop {
            if packet_count >= BATCH_LIMIT {
                break;
            }
            let mut no_packet = true;
            for queue_num in 0..queues.len() {
                let Ok(msg) = queues[queue_num].recv() else {
                    continue;
                };
                working = true;
                packet_count += 1;
                no_packet = false;

                let key = FiveTuple::from(&msg);
                let pkt_len = msg.get_payload().len();
                // fwmark 充当 skb->priority
                let priority = msg.get_nfmark();
                let owner = key.socket_ref();

                let mut ctx = PacketContext::new(Message::from(msg), key, pkt_len, queue_num)
                    .with_priority(priority);
                if let Some(sk) = owner {
                    ctx = ctx.with_owner(sk);
                }

                if let Err(dropped) = pipeline.enqueue(ctx) {
                    send_verdict(&mut queues, dropped.ctx, Verdict::Drop);
                }
            }
            if no_packet {
                break;
            }
        }

        while let Some(ctx) = pipeline.dequeue() {
            working = true;
            send_verdict(&mut queues, ctx, Verdict::Accept);
        }

        for dropped in pipeline.collect_dropped() {
            working = true;
            send_verdict(&mut queues, dropped.ctx, Verdict::Drop);
        }

        if !working {
            // 有限速中的流时按 watchdog 醒来 (可晚到 slack 末尾)，否则空转睡眠
            let sleep = match pipeline.wakeup_latest() {
                Some(at) => config
                    .idle_sleep
                    .min(Duration::from_nanos(at.saturating_sub(clock.now_ns()))),
                None => config.idle_sleep,
            };
            std::thread::sleep(sleep);
        }
    }
}
