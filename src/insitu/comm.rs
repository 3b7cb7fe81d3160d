//! Cross-rank ray transport.

use crate::cluster::Cluster;
use crate::common::MsgWord;
use crate::error::{Error, Result};
use crate::work_stats::WorkStats;
use mpi::traits::*;
use std::collections::VecDeque;

/// Wire tag of radiance ray messages.
pub const SEND_RADIANCE_RAYS: i32 = 1;

/// Wire tag of shadow ray messages.
pub const SEND_SHADOW_RAYS: i32 = 2;

/// One encoded outgoing message.
pub struct SendItem {
    /// Wire tag.
    pub tag: i32,

    /// Destination rank.
    pub dest: i32,

    /// Encoded header and payload.
    pub words: Vec<MsgWord>,
}

/// Non-blocking send driver with a probe-driven receive loop.
///
/// Outgoing messages are queued during the send phase and posted as
/// immediate sends while `run` drains the predicted number of inbound
/// messages for this depth. All posted sends complete before `run` returns:
/// every peer sits in its own `run` posting matching receives, so waiting
/// here cannot deadlock, and the depth barrier that follows observes a quiet
/// wire.
pub struct Comm {
    send_q: VecDeque<SendItem>,
}

impl Comm {
    /// Create the driver.
    pub fn new() -> Self {
        Self {
            send_q: VecDeque::new(),
        }
    }

    /// Queue an outgoing message.
    ///
    /// * `item` - The encoded message.
    pub fn push_send_q(&mut self, item: SendItem) {
        self.send_q.push_back(item);
    }

    /// Returns true if no outgoing messages are queued.
    pub fn empty_send_q(&self) -> bool {
        self.send_q.is_empty()
    }

    /// Drive the wire until this rank has received every message predicted
    /// by the work-stats reduce and the outgoing queue is drained. Received
    /// payloads are routed onto the radiance or shadow queue by tag.
    ///
    /// * `cluster`    - The process context.
    /// * `work_stats` - Reduced counters predicting inbound messages.
    /// * `recv_rq`    - Received radiance messages, in arrival order.
    /// * `recv_sq`    - Received shadow messages, in arrival order.
    pub fn run(
        &mut self,
        cluster: &Cluster,
        work_stats: &WorkStats,
        recv_rq: &mut VecDeque<Vec<MsgWord>>,
        recv_sq: &mut VecDeque<Vec<MsgWord>>,
    ) -> Result<()> {
        let outgoing: Vec<SendItem> = self.send_q.drain(..).collect();
        let world = cluster.world();

        let mut num_blocks_recved = 0;
        let mut recv_done = work_stats.recv_done(num_blocks_recved);
        let mut result = Ok(());

        mpi::request::scope(|scope| {
            let mut requests = Vec::with_capacity(outgoing.len());
            let mut next_send = 0;

            loop {
                if !recv_done {
                    if let Some((msg, status)) = world.any_process().immediate_matched_probe() {
                        let count = status.count(MsgWord::equivalent_datatype()) as usize;
                        let mut words = vec![0 as MsgWord; count];
                        msg.matched_receive_into(&mut words[..]);
                        match status.tag() {
                            SEND_RADIANCE_RAYS => recv_rq.push_back(words),
                            SEND_SHADOW_RAYS => recv_sq.push_back(words),
                            // record the fault but keep draining so posted
                            // sends still complete before the scope closes
                            tag => result = Err(Error::Mpi(format!("unexpected message tag {tag}"))),
                        }
                        num_blocks_recved += 1;
                        recv_done = work_stats.recv_done(num_blocks_recved);
                    }
                }

                if next_send < outgoing.len() {
                    let item = &outgoing[next_send];
                    requests.push(world.process_at_rank(item.dest).immediate_send_with_tag(
                        scope,
                        &item.words[..],
                        item.tag,
                    ));
                    next_send += 1;
                } else if recv_done {
                    break;
                }
            }

            for request in requests {
                request.wait();
            }
        });

        result
    }

    /// Barrier point for in-flight sends. Sends are completed inside
    /// [`run`](Self::run); this remains the explicit synchronization hook at
    /// termination and asserts the queue is quiet.
    pub fn wait_for_send(&mut self) {
        debug_assert!(self.send_q.is_empty());
    }
}

impl Default for Comm {
    fn default() -> Self {
        Self::new()
    }
}
