//! Forwarding engine: queueing, duplicate suppression, retransmission,
//! loop detection and congestion signalling for data packets.
//!
//! Entries live in a fixed arena addressed by small indices. The pool is a
//! free-list of indices, the FIFO is a ring of indices, and one dedicated
//! slot carries the node's own packet so local production can never starve
//! forwarding (and vice versa).

use log::{debug, info, trace, warn};

use crate::config::CtpConfig;
use crate::estimator::LinkEstimator;
use crate::kernel::{Event, Kernel};
use crate::link::LinkLayer;
use crate::node::NodeFlags;
use crate::packet::{DataHeader, DataPacket, FrameId, LinkHeader, Packet, CTP_CONGESTED, CTP_PULL};
use crate::router::RoutingEngine;
use crate::{NodeId, INVALID_ADDRESS};

pub const FORWARDING_QUEUE_DEPTH: usize = 13;
pub const FORWARDING_POOL_DEPTH: usize = 13;
pub const CACHE_SIZE: usize = 4;
pub const MAX_RETRIES: u8 = 30;

/// Arena index reserved for the node's own packet.
const LOCAL_SLOT: u8 = FORWARDING_POOL_DEPTH as u8;

/// One queued data packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueEntry {
    pub packet: DataPacket,
    pub retries: u8,
    pub is_local: bool,
}

/// Ring FIFO of arena indices. `count` equals `tail - head mod capacity`;
/// the head advances only on dequeue.
#[derive(Debug)]
pub struct ForwardingQueue {
    slots: [u8; FORWARDING_QUEUE_DEPTH],
    head: usize,
    count: usize,
}

impl ForwardingQueue {
    pub fn new() -> Self {
        Self {
            slots: [0; FORWARDING_QUEUE_DEPTH],
            head: 0,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == FORWARDING_QUEUE_DEPTH
    }

    /// Append an index. True on success.
    pub fn enqueue(&mut self, idx: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.slots[(self.head + self.count) % FORWARDING_QUEUE_DEPTH] = idx;
        self.count += 1;
        true
    }

    pub fn dequeue(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let idx = self.slots[self.head];
        self.head = (self.head + 1) % FORWARDING_QUEUE_DEPTH;
        self.count -= 1;
        Some(idx)
    }

    pub fn peek(&self) -> Option<u8> {
        if self.count == 0 {
            None
        } else {
            Some(self.slots[self.head])
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..self.count).map(move |i| self.slots[(self.head + i) % FORWARDING_QUEUE_DEPTH])
    }
}

/// Free-list of arena indices.
#[derive(Debug)]
struct EntryPool {
    free: [u8; FORWARDING_POOL_DEPTH],
    head: usize,
    count: usize,
}

impl EntryPool {
    fn new() -> Self {
        let mut free = [0u8; FORWARDING_POOL_DEPTH];
        for (i, f) in free.iter_mut().enumerate() {
            *f = i as u8;
        }
        Self {
            free,
            head: 0,
            count: FORWARDING_POOL_DEPTH,
        }
    }

    fn acquire(&mut self) -> Option<u8> {
        if self.count == 0 {
            return None;
        }
        let idx = self.free[self.head];
        self.head = (self.head + 1) % FORWARDING_POOL_DEPTH;
        self.count -= 1;
        Some(idx)
    }

    fn release(&mut self, idx: u8) {
        if self.count == FORWARDING_POOL_DEPTH {
            // Double release would corrupt the ring
            return;
        }
        self.free[(self.head + self.count) % FORWARDING_POOL_DEPTH] = idx;
        self.count += 1;
    }

    fn available(&self) -> usize {
        self.count
    }
}

/// LRU cache of recently transmitted frames, most recent last.
#[derive(Debug)]
pub struct DuplicateCache {
    entries: [Option<FrameId>; CACHE_SIZE],
    len: usize,
}

impl DuplicateCache {
    pub fn new() -> Self {
        Self {
            entries: [None; CACHE_SIZE],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, id: &FrameId) -> bool {
        self.entries[..self.len].iter().any(|e| e.as_ref() == Some(id))
    }

    fn position(&self, id: &FrameId) -> Option<usize> {
        self.entries[..self.len].iter().position(|e| e.as_ref() == Some(id))
    }

    fn remove(&mut self, offset: usize) {
        if offset >= self.len {
            return;
        }
        // Shift left to preserve recency order
        for i in offset..self.len - 1 {
            self.entries[i] = self.entries[i + 1];
        }
        self.len -= 1;
        self.entries[self.len] = None;
    }

    /// Insert `id` as most recent, refreshing it if already present and
    /// displacing the oldest entry when full.
    pub fn insert(&mut self, id: FrameId) {
        if let Some(pos) = self.position(&id) {
            self.remove(pos);
        } else if self.len == CACHE_SIZE {
            self.remove(0);
        }

        self.entries[self.len] = Some(id);
        self.len += 1;
    }

    pub fn most_recent(&self) -> Option<&FrameId> {
        if self.len == 0 {
            None
        } else {
            self.entries[self.len - 1].as_ref()
        }
    }
}

/// Per-node forwarding engine.
#[derive(Debug)]
pub struct ForwardingEngine {
    id: NodeId,
    is_root: bool,
    config: CtpConfig,

    arena: [Option<QueueEntry>; FORWARDING_POOL_DEPTH + 1],
    pool: EntryPool,
    queue: ForwardingQueue,
    cache: DuplicateCache,

    /// Sequence number for locally produced packets.
    seq_no: u16,
    /// Identity and recipient of the frame awaiting an ack.
    in_flight: Option<(FrameId, NodeId)>,

    /// Non-duplicate packets delivered to the collector (root only).
    collected: u32,
}

impl ForwardingEngine {
    pub fn new(id: NodeId, is_root: bool, config: CtpConfig) -> Self {
        Self {
            id,
            is_root,
            config,
            arena: [None; FORWARDING_POOL_DEPTH + 1],
            pool: EntryPool::new(),
            queue: ForwardingQueue::new(),
            cache: DuplicateCache::new(),
            seq_no: 0,
            in_flight: None,
            collected: 0,
        }
    }

    /// Arm the local production timer; called from `Init`. The root only
    /// collects.
    pub fn start<K: Kernel>(&mut self, now: f64, k: &mut K) {
        if !self.is_root {
            k.schedule(
                self.id,
                now + self.config.send_packet_period,
                Event::SendPacketTimerFired,
            );
        }
    }

    /// More than half the queue in use.
    pub fn is_congested(&self) -> bool {
        self.queue.len() > FORWARDING_QUEUE_DEPTH / 2
    }

    pub fn collected(&self) -> u32 {
        self.collected
    }

    pub fn reached_goal(&self) -> bool {
        self.collected >= self.config.collection_goal
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    fn queue_lookup(&self, id: &FrameId) -> bool {
        self.queue
            .iter()
            .filter_map(|i| self.arena[i as usize].as_ref())
            .any(|e| e.packet.id() == *id)
    }

    fn release_entry(&mut self, idx: u8, flags: &mut NodeFlags) {
        self.arena[idx as usize] = None;
        if idx == LOCAL_SLOT {
            flags.remove(NodeFlags::SENDING);
        } else {
            self.pool.release(idx);
        }
    }

    /// Drain the queue as far as the protocol allows.
    pub fn pump<K: Kernel>(
        &mut self,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        while self.send_data_packet(now, router, est, link, flags, k) {}
    }

    /// Periodic local production.
    pub fn on_send_packet_timer<K: Kernel>(
        &mut self,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        k.schedule(
            self.id,
            now + self.config.send_packet_period,
            Event::SendPacketTimerFired,
        );

        if flags.contains(NodeFlags::SENDING) {
            // Previous local packet still in the queue: nudge it along
            self.send_data_packet(now, router, est, link, flags, k);
            return;
        }

        let payload =
            k.random_range(self.config.min_payload as f64, self.config.max_payload as f64) as f32;
        let seq_no = self.seq_no;
        self.seq_no = self.seq_no.wrapping_add(1);

        if self.queue.is_full() {
            trace!("node {}: queue full, local packet {} dropped", self.id, seq_no);
            return;
        }

        let packet = DataPacket {
            link: LinkHeader {
                src: self.id,
                sink: INVALID_ADDRESS,
                gain: 0.0,
                duration: 0.0,
            },
            header: DataHeader {
                options: 0,
                thl: 0,
                etx: 0,
                origin: self.id,
                seq_no,
            },
            payload,
        };

        self.arena[LOCAL_SLOT as usize] = Some(QueueEntry {
            packet,
            retries: MAX_RETRIES,
            is_local: true,
        });

        if self.queue.enqueue(LOCAL_SLOT) {
            flags.insert(NodeFlags::SENDING);
            trace!("node {}: produced packet {}", self.id, seq_no);
            self.pump(now, router, est, link, flags, k);
        } else {
            self.arena[LOCAL_SLOT as usize] = None;
        }
    }

    /// A data packet arrived from the link layer.
    pub fn receive<K: Kernel>(
        &mut self,
        mut packet: DataPacket,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        packet.header.thl = packet.header.thl.wrapping_add(1);
        let id = packet.id();

        if self.cache.contains(&id) || self.queue_lookup(&id) {
            trace!(
                "node {}: duplicate {:?} from {} dropped",
                self.id,
                id,
                packet.link.src
            );
            return;
        }

        if self.is_root {
            self.collected += 1;
            self.cache.insert(id);
            info!(
                "root {}: collected packet {} from origin {} ({} total)",
                self.id, packet.header.seq_no, packet.header.origin, self.collected
            );
            return;
        }

        let idx = match self.pool.acquire() {
            Some(i) => i,
            None => {
                warn!("node {}: forwarding pool exhausted, packet dropped", self.id);
                return;
            }
        };

        self.arena[idx as usize] = Some(QueueEntry {
            packet,
            retries: MAX_RETRIES,
            is_local: false,
        });

        if !self.queue.enqueue(idx) {
            self.arena[idx as usize] = None;
            self.pool.release(idx);
            return;
        }

        if let Some(our_etx) = router.get_etx(est) {
            if packet.header.etx <= our_etx {
                // The sender believes it is closer to the root than we
                // are: routing loop
                debug!(
                    "node {}: loop detected (received etx {} <= ours {})",
                    self.id, packet.header.etx, our_etx
                );
                router.reset_beacon_interval(now, k);
                k.schedule(self.id, now + self.config.loop_offset, Event::RetransmitDataPacket);
                return;
            }
        }

        if flags.contains(NodeFlags::ACK_PENDING) {
            return;
        }

        self.pump(now, router, est, link, flags, k);
    }

    /// Try to push the queue head to the link layer. True means the caller
    /// should call again (a slot was freed without transmitting).
    pub fn send_data_packet<K: Kernel>(
        &mut self,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) -> bool {
        let head = match self.queue.peek() {
            Some(h) => h,
            None => return false,
        };

        let our_etx = match router.get_etx(est) {
            Some(e) => e,
            None => {
                trace!("node {}: no route, retrying later", self.id);
                k.schedule(
                    self.id,
                    now + self.config.no_route_offset,
                    Event::RetransmitDataPacket,
                );
                return false;
            }
        };

        if flags.contains(NodeFlags::ACK_PENDING) {
            return false;
        }

        let congested = self.is_congested();

        let entry = match self.arena[head as usize].as_mut() {
            Some(e) => e,
            None => {
                // Index without an entry: drop the slot and move on
                warn!("node {}: dangling queue index {}", self.id, head);
                self.queue.dequeue();
                return true;
            }
        };

        if self.cache.contains(&entry.packet.id()) {
            self.queue.dequeue();
            self.release_entry(head, flags);
            return true;
        }

        // `get_etx` succeeded, so a parent exists
        let parent = match router.get_parent() {
            Some(p) => p,
            None => return false,
        };

        entry.packet.header.etx = our_etx;
        entry.packet.header.options &= !CTP_PULL;
        if congested {
            entry.packet.header.options |= CTP_CONGESTED;
        } else {
            entry.packet.header.options &= !CTP_CONGESTED;
        }
        entry.packet.link.src = self.id;
        entry.packet.link.sink = parent;

        let packet = entry.packet;
        if link.send(Packet::Data(packet), now, k) {
            flags.insert(NodeFlags::ACK_PENDING);
            self.in_flight = Some((packet.id(), parent));
            trace!(
                "node {}: sent {:?} to parent {}",
                self.id,
                packet.id(),
                parent
            );
        }

        false
    }

    /// The link layer finished with our frame. On success, arm the ack
    /// backstop; a CSMA drop counts as an unacknowledged send.
    pub fn transmitted_data_packet<K: Kernel>(
        &mut self,
        success: bool,
        sent: &DataPacket,
        now: f64,
        ack_wait: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        if !flags.contains(NodeFlags::ACK_PENDING) {
            return;
        }
        let (fid, _) = match self.in_flight {
            Some(v) => v,
            None => return,
        };
        if fid != sent.id() {
            return;
        }

        if success {
            k.schedule(self.id, now + ack_wait, Event::CheckAckReceived(fid));
        } else {
            self.receive_ack(false, now, router, est, link, flags, k);
        }
    }

    /// Explicit acknowledgement from the physical layer: ground truth.
    pub fn on_ack_received<K: Kernel>(
        &mut self,
        ack: &DataPacket,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        if !flags.contains(NodeFlags::ACK_PENDING) {
            return;
        }
        let (fid, _) = match self.in_flight {
            Some(v) => v,
            None => return,
        };

        self.receive_ack(ack.id() == fid, now, router, est, link, flags, k);
    }

    /// Backstop timeout: only meaningful while the named frame is still
    /// unacknowledged.
    pub fn on_check_ack<K: Kernel>(
        &mut self,
        fid: FrameId,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        if !flags.contains(NodeFlags::ACK_PENDING) {
            return;
        }
        match self.in_flight {
            Some((pending, _)) if pending == fid => {}
            _ => return,
        }

        debug!("node {}: ack timeout for {:?}", self.id, fid);
        self.receive_ack(false, now, router, est, link, flags, k);
    }

    /// Scheduled retry (retransmission, no-route backoff, loop settle).
    pub fn on_retransmit<K: Kernel>(
        &mut self,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        self.pump(now, router, est, link, flags, k);
    }

    fn receive_ack<K: Kernel>(
        &mut self,
        acked: bool,
        now: f64,
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        link: &mut LinkLayer,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        let (fid, dst) = match self.in_flight {
            Some(v) => v,
            None => return,
        };

        est.check_if_ack_received(dst, acked);

        if acked {
            if let Some(head) = self.queue.dequeue() {
                if let Some(entry) = self.arena[head as usize] {
                    if !entry.is_local {
                        self.cache.insert(entry.packet.id());
                    }
                }
                self.release_entry(head, flags);
            }

            flags.remove(NodeFlags::ACK_PENDING);
            self.in_flight = None;
            self.pump(now, router, est, link, flags, k);
            return;
        }

        // The outgoing estimate moved; the parent choice may follow
        router.update_route(est, now, k);

        let head = match self.queue.peek() {
            Some(h) => h,
            None => {
                flags.remove(NodeFlags::ACK_PENDING);
                self.in_flight = None;
                return;
            }
        };

        let retries = match self.arena[head as usize].as_mut() {
            Some(e) => {
                if e.retries > 0 {
                    e.retries -= 1;
                    Some(e.retries)
                } else {
                    None
                }
            }
            None => None,
        };

        flags.remove(NodeFlags::ACK_PENDING);
        self.in_flight = None;

        match retries {
            Some(left) => {
                trace!("node {}: retrying {:?}, {} retries left", self.id, fid, left);
                k.schedule(
                    self.id,
                    now + self.config.retransmission_offset,
                    Event::RetransmitDataPacket,
                );
            }
            None => {
                debug!("node {}: retries exhausted for {:?}, dropping", self.id, fid);
                self.queue.dequeue();
                self.release_entry(head, flags);
                self.pump(now, router, est, link, flags, k);
            }
        }
    }
}
