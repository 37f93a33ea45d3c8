//! The seam between the CTP stack and the external optimistic simulator.
//!
//! The stack never calls into an event queue directly; every delay and
//! every cross-node interaction goes through [`Kernel::schedule`], and all
//! randomness is drawn from the kernel so state rollback stays
//! reproducible.

use crate::packet::{Beacon, DataPacket, FrameId, Packet};
use crate::NodeId;

/// Events dispatched to a node. Frames travel inside the event payload,
/// so handlers never share memory across nodes.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Bootstrap: create state, start timers.
    Init,

    /// Periodic route re-evaluation.
    UpdateRouteTimerFired,
    /// A beacon is due within the current Trickle interval.
    SendBeaconsTimerFired,
    /// Start of the next Trickle interval.
    SetBeaconsTimer,
    /// Periodic local data production.
    SendPacketTimerFired,

    /// A beacon survived reception arbitration and reached the stack.
    BeaconReceived(Beacon),
    /// A data packet survived reception arbitration and reached the stack.
    DataPacketReceived(DataPacket),

    /// Retry the head of the forwarding queue.
    RetransmitDataPacket,
    /// Backstop timeout for the acknowledgement of the named frame.
    CheckAckReceived(FrameId),
    /// The recipient acknowledged a data packet.
    AckReceived(DataPacket),

    /// Carrier-sense sample point during CSMA backoff.
    CheckChannelFree,
    /// Backoff complete, radio turned around; push the frame to the air.
    StartFrameTransmission,
    /// The local radio finished transmitting the outgoing frame.
    FrameTransmitted,

    /// A neighbor's beacon transmission starts reaching this node.
    BeaconTransmissionStarted(Beacon),
    /// A neighbor's data transmission starts reaching this node.
    DataTransmissionStarted(DataPacket),
    /// An in-flight transmission stopped reaching this node.
    TransmissionFinished(Packet),
}

/// Services the external simulator provides to a node's handlers.
///
/// There is no state-registration call: the host owns every node's state
/// object and hands out `&mut` per event, which is what lets an
/// optimistic scheduler snapshot and roll nodes back.
pub trait Kernel {
    /// Deliver `event` to node `dest` at virtual time `time` (absolute,
    /// seconds).
    fn schedule(&mut self, dest: NodeId, time: f64, event: Event);

    /// Uniform draw from `[0, 1)`.
    fn random(&mut self) -> f64;

    /// Uniform draw from `[lo, hi)`.
    fn random_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.random()
    }
}

#[cfg(any(test, feature = "mocks"))]
pub mod mock {
    use super::*;

    use std::cmp::Ordering;
    use std::collections::BinaryHeap;

    use rand_core::RngCore;

    /// Recording kernel for unit tests: captures scheduled events for
    /// inspection instead of running them.
    pub struct MockKernel<R> {
        rng: R,
        pub scheduled: Vec<(NodeId, f64, Event)>,
    }

    impl<R: RngCore> MockKernel<R> {
        pub fn new(rng: R) -> Self {
            Self {
                rng,
                scheduled: Vec::new(),
            }
        }

        /// Drain everything scheduled so far.
        pub fn take_scheduled(&mut self) -> Vec<(NodeId, f64, Event)> {
            std::mem::take(&mut self.scheduled)
        }
    }

    impl<R: RngCore> Kernel for MockKernel<R> {
        fn schedule(&mut self, dest: NodeId, time: f64, event: Event) {
            self.scheduled.push((dest, time, event));
        }

        fn random(&mut self) -> f64 {
            self.rng.next_u32() as f64 / (u32::MAX as f64 + 1.0)
        }
    }

    struct Scheduled {
        time: f64,
        seq: u64,
        dest: NodeId,
        event: Event,
    }

    impl PartialEq for Scheduled {
        fn eq(&self, other: &Self) -> bool {
            self.time == other.time && self.seq == other.seq
        }
    }

    impl Eq for Scheduled {}

    impl PartialOrd for Scheduled {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }

    impl Ord for Scheduled {
        // Reversed: BinaryHeap is a max-heap, we pop earliest-first.
        // Insertion order breaks virtual-time ties.
        fn cmp(&self, other: &Self) -> Ordering {
            other
                .time
                .total_cmp(&self.time)
                .then(other.seq.cmp(&self.seq))
        }
    }

    /// Sequential event loop: a deterministic stand-in for the optimistic
    /// scheduler, used by the end-to-end scenario tests.
    pub struct EventLoop<R> {
        rng: R,
        heap: BinaryHeap<Scheduled>,
        seq: u64,
        now: f64,
    }

    impl<R: RngCore> EventLoop<R> {
        pub fn new(rng: R) -> Self {
            Self {
                rng,
                heap: BinaryHeap::new(),
                seq: 0,
                now: 0.0,
            }
        }

        /// Current virtual time: the timestamp of the last popped event.
        pub fn now(&self) -> f64 {
            self.now
        }

        pub fn pending(&self) -> usize {
            self.heap.len()
        }

        /// Pop the earliest event, advancing virtual time.
        pub fn step(&mut self) -> Option<(NodeId, f64, Event)> {
            let s = self.heap.pop()?;
            self.now = s.time;
            Some((s.dest, s.time, s.event))
        }
    }

    impl<R: RngCore> Kernel for EventLoop<R> {
        fn schedule(&mut self, dest: NodeId, time: f64, event: Event) {
            let seq = self.seq;
            self.seq += 1;
            self.heap.push(Scheduled {
                time,
                seq,
                dest,
                event,
            });
        }

        fn random(&mut self) -> f64 {
            self.rng.next_u32() as f64 / (u32::MAX as f64 + 1.0)
        }
    }

    #[cfg(test)]
    mod test {
        use super::*;
        use rand_core::SeedableRng;

        #[test]
        fn events_pop_in_time_order() {
            let mut k = EventLoop::new(rand::rngs::SmallRng::seed_from_u64(1));

            k.schedule(0, 2.0, Event::Init);
            k.schedule(1, 1.0, Event::Init);
            k.schedule(2, 1.0, Event::FrameTransmitted);

            assert_eq!(k.step().map(|(d, t, _)| (d, t)), Some((1, 1.0)));
            // Tie at t=1.0 resolves in insertion order
            assert_eq!(k.step().map(|(d, t, _)| (d, t)), Some((2, 1.0)));
            assert_eq!(k.step().map(|(d, t, _)| (d, t)), Some((0, 2.0)));
            assert_eq!(k.now(), 2.0);
            assert!(k.step().is_none());
        }

        #[test]
        fn random_range_stays_in_bounds() {
            let mut k = EventLoop::new(rand::rngs::SmallRng::seed_from_u64(7));

            for _ in 0..1000 {
                let v = k.random_range(0.5, 2.5);
                assert!(v >= 0.5 && v < 2.5);
            }
        }
    }
}
