//! Link estimator: per-neighbor 1-hop ETX from beacon sequence gaps and
//! data acknowledgements.
//!
//! Ingoing quality is a windowed delivery ratio over received beacon
//! sequence numbers; outgoing quality is a windowed ack ratio over data
//! transmissions. Both feed an exponentially smoothed 1-hop ETX, scaled by
//! 10 to keep precision under integer arithmetic.

use bitflags::bitflags;
use heapless::Vec as BoundedVec;
use log::{debug, trace, warn};

use crate::kernel::Kernel;
use crate::link::LinkLayer;
use crate::packet::{Beacon, EstimatorFrame, LinkHeader, Packet, RoutingFrame};
use crate::router::RoutingEngine;
use crate::{NodeId, BROADCAST_ADDRESS};

pub const NEIGHBOR_TABLE_SIZE: usize = 10;

/// ETX of an unusable link.
pub const VERY_LARGE_ETX: u16 = 0xFFFF;

/// Sequence gap beyond which an entry's history is discarded.
pub const MAX_PKT_GAP: u16 = 10;

/// Beacons per ingoing-quality window.
pub const BLQ_PKT_WINDOW: u16 = 3;

/// Data transmissions per outgoing-quality window.
pub const DLQ_PKT_WINDOW: u16 = 5;

/// Exponential smoothing weight (out of 10) on the previous estimate.
pub const ALPHA: u32 = 9;

/// A mature entry at least this bad is the first eviction candidate.
pub const EVICT_WORST_ETX_THRESHOLD: u16 = 65;

bitflags! {
    /// Neighbor entry lifecycle flags. Presence in the table is validity.
    pub struct EntryFlags: u8 {
        /// No quality window completed yet.
        const INIT   = 0x01;
        /// At least one quality window completed; the estimate is usable.
        const MATURE = 0x02;
        /// Entry is the current parent (or a root) and is never evicted.
        const PINNED = 0x04;
    }
}

/// Per-neighbor estimator state.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborEntry {
    pub id: NodeId,
    pub coords: (i32, i32),
    pub flags: EntryFlags,

    pub last_seq: u16,
    pub beacons_received: u16,
    pub beacons_missed: u16,

    pub data_sent: u16,
    pub data_acknowledged: u16,

    /// Windowed beacon delivery ratio, 0..=250.
    pub ingoing_quality: u16,
    /// Smoothed 1-hop ETX, scaled by 10.
    pub one_hop_etx: u16,
}

impl NeighborEntry {
    fn fresh(id: NodeId, coords: (i32, i32), seq: u16) -> Self {
        Self {
            id,
            coords,
            flags: EntryFlags::INIT,
            last_seq: seq,
            beacons_received: 0,
            beacons_missed: 0,
            data_sent: 0,
            data_acknowledged: 0,
            ingoing_quality: 0,
            one_hop_etx: 0,
        }
    }
}

/// Outcome of feeding a received beacon through the estimator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeaconIngest {
    /// The sender now has a neighbor entry; the beacon may proceed to the
    /// routing engine.
    pub tracked: bool,
    /// A neighbor was displaced to make room.
    pub evicted: Option<NodeId>,
}

/// ETX from an ingoing quality, scaled by 10.
pub fn compute_etx(quality: u16) -> u16 {
    if quality == 0 {
        return VERY_LARGE_ETX;
    }

    let etx = 2500 / quality;
    if etx > 250 {
        VERY_LARGE_ETX
    } else {
        etx
    }
}

fn smooth(old: u16, raw: u16) -> u16 {
    ((ALPHA * old as u32 + (10 - ALPHA) * raw as u32) / 10).min(VERY_LARGE_ETX as u32) as u16
}

/// Per-node link estimator.
#[derive(Debug)]
pub struct LinkEstimator {
    id: NodeId,
    table: BoundedVec<NeighborEntry, NEIGHBOR_TABLE_SIZE>,
    beacon_seq: u16,
}

impl LinkEstimator {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            table: BoundedVec::new(),
            beacon_seq: 0,
        }
    }

    fn find(&self, id: NodeId) -> Option<usize> {
        self.table.iter().position(|e| e.id == id)
    }

    pub fn entry(&self, id: NodeId) -> Option<&NeighborEntry> {
        self.find(id).map(|i| &self.table[i])
    }

    /// 1-hop ETX towards `id`, or [`VERY_LARGE_ETX`] for unknown
    /// neighbors.
    pub fn one_hop_etx(&self, id: NodeId) -> u16 {
        match self.entry(id) {
            Some(e) => e.one_hop_etx,
            None => VERY_LARGE_ETX,
        }
    }

    pub fn coordinates(&self, id: NodeId) -> Option<(i32, i32)> {
        self.entry(id).map(|e| e.coords)
    }

    pub fn pin(&mut self, id: NodeId) {
        if let Some(i) = self.find(id) {
            self.table[i].flags.insert(EntryFlags::PINNED);
        }
    }

    pub fn unpin(&mut self, id: NodeId) {
        if let Some(i) = self.find(id) {
            self.table[i].flags.remove(EntryFlags::PINNED);
        }
    }

    /// Forget the outgoing-quality window of `id` (used when a node is
    /// promoted to parent).
    pub fn clear_data_link_quality(&mut self, id: NodeId) {
        if let Some(i) = self.find(id) {
            self.table[i].data_sent = 0;
            self.table[i].data_acknowledged = 0;
        }
    }

    /// Feed a received beacon through the sequence-gap window, creating or
    /// displacing entries as the table allows.
    pub fn receive_beacon<K: Kernel>(
        &mut self,
        beacon: &Beacon,
        coords: (i32, i32),
        router: &RoutingEngine,
        k: &mut K,
    ) -> BeaconIngest {
        let from = beacon.link.src;
        let seq = beacon.estimator.seq;

        if let Some(i) = self.find(from) {
            self.update_ingoing(i, seq);
            return BeaconIngest {
                tracked: true,
                evicted: None,
            };
        }

        if !self.table.is_full() {
            self.insert_fresh(from, coords, seq);
            return BeaconIngest {
                tracked: true,
                evicted: None,
            };
        }

        // Full table: displace the worst mature entry past the threshold,
        // or a random immature one when the routing engine vouches for the
        // newcomer.
        let victim = self
            .worst_mature_victim()
            .or_else(|| {
                if router.is_neighbor_worth_inserting(beacon) {
                    self.random_immature_victim(k)
                } else {
                    None
                }
            });

        let victim_idx = match victim {
            Some(i) => i,
            None => {
                trace!("node {}: neighbor table full, beacon from {} dropped", self.id, from);
                return BeaconIngest {
                    tracked: false,
                    evicted: None,
                };
            }
        };

        let evicted = self.table[victim_idx].id;
        debug!("node {}: evicting neighbor {} for {}", self.id, evicted, from);
        self.table.swap_remove(victim_idx);
        self.insert_fresh(from, coords, seq);

        BeaconIngest {
            tracked: true,
            evicted: Some(evicted),
        }
    }

    fn insert_fresh(&mut self, id: NodeId, coords: (i32, i32), seq: u16) {
        let entry = NeighborEntry::fresh(id, coords, seq);
        // Capacity was checked or made by the caller
        if self.table.push(entry).is_err() {
            warn!("node {}: neighbor table overflow inserting {}", self.id, id);
            return;
        }
        let i = self.table.len() - 1;
        self.update_ingoing(i, seq);
    }

    fn worst_mature_victim(&self) -> Option<usize> {
        self.table
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.flags.contains(EntryFlags::MATURE)
                    && !e.flags.contains(EntryFlags::PINNED)
                    && e.one_hop_etx >= EVICT_WORST_ETX_THRESHOLD
            })
            .max_by_key(|(_, e)| e.one_hop_etx)
            .map(|(i, _)| i)
    }

    fn random_immature_victim<K: Kernel>(&self, k: &mut K) -> Option<usize> {
        let candidates: Vec<usize> = self
            .table
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                !e.flags.contains(EntryFlags::MATURE) && !e.flags.contains(EntryFlags::PINNED)
            })
            .map(|(i, _)| i)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let pick = (k.random() * candidates.len() as f64) as usize;
        Some(candidates[pick.min(candidates.len() - 1)])
    }

    fn update_ingoing(&mut self, i: usize, seq: u16) {
        let e = &mut self.table[i];

        let gap = seq.wrapping_sub(e.last_seq);
        e.last_seq = seq;
        e.beacons_received += 1;
        if gap > 1 {
            e.beacons_missed = e.beacons_missed.saturating_add(gap - 1);
        }

        if gap > MAX_PKT_GAP {
            // Too much history lost; start the window over
            trace!("node {}: neighbor {} gap {}, window reset", self.id, e.id, gap);
            let pinned = e.flags.contains(EntryFlags::PINNED);
            *e = NeighborEntry::fresh(e.id, e.coords, seq);
            e.beacons_received = 1;
            if pinned {
                e.flags.insert(EntryFlags::PINNED);
            }
            return;
        }

        if e.beacons_received + e.beacons_missed >= BLQ_PKT_WINDOW || gap >= BLQ_PKT_WINDOW {
            let raw = 250 * e.beacons_received / (e.beacons_received + e.beacons_missed);

            if !e.flags.contains(EntryFlags::MATURE) {
                e.flags.insert(EntryFlags::MATURE);
                e.flags.remove(EntryFlags::INIT);
                e.ingoing_quality = raw;
                e.one_hop_etx = compute_etx(raw);
            }

            e.ingoing_quality = smooth(e.ingoing_quality, raw);
            e.one_hop_etx = smooth(e.one_hop_etx, compute_etx(e.ingoing_quality));

            e.beacons_received = 0;
            e.beacons_missed = 0;

            trace!(
                "node {}: neighbor {} quality {} etx {}",
                self.id,
                e.id,
                e.ingoing_quality,
                e.one_hop_etx
            );
        }
    }

    /// Fold one data-transmission outcome towards `id` into the outgoing
    /// quality window.
    pub fn check_if_ack_received(&mut self, id: NodeId, acked: bool) {
        let i = match self.find(id) {
            Some(i) => i,
            None => {
                trace!("node {}: ack outcome for unknown neighbor {}", self.id, id);
                return;
            }
        };
        let e = &mut self.table[i];

        e.data_sent += 1;
        if acked {
            e.data_acknowledged += 1;
        }

        if e.data_sent >= DLQ_PKT_WINDOW {
            let raw = if e.data_acknowledged == 0 {
                // Escalating penalty until something gets through
                (10 * e.data_sent).min(VERY_LARGE_ETX)
            } else {
                let r = 10 * e.data_sent / e.data_acknowledged;
                e.data_sent = 0;
                e.data_acknowledged = 0;
                r
            };

            e.one_hop_etx = smooth(e.one_hop_etx, raw);

            debug!(
                "node {}: neighbor {} outgoing raw {} etx {}",
                self.id, e.id, raw, e.one_hop_etx
            );
        }
    }

    /// Guarantee a pinned entry for a root announcement, displacing an
    /// unpinned neighbor if the table is full. Returns the displaced id.
    pub fn force_insert_pinned(&mut self, id: NodeId, coords: (i32, i32), seq: u16) -> Option<NodeId> {
        if let Some(i) = self.find(id) {
            self.table[i].flags.insert(EntryFlags::PINNED);
            return None;
        }

        let mut evicted = None;
        if self.table.is_full() {
            let victim = self
                .table
                .iter()
                .position(|e| !e.flags.contains(EntryFlags::PINNED))?;
            evicted = Some(self.table[victim].id);
            self.table.swap_remove(victim);
        }

        self.insert_fresh(id, coords, seq);
        self.pin(id);
        evicted
    }

    /// Stamp the next beacon sequence number and hand the beacon to the
    /// link layer as a broadcast.
    pub fn send_routing_packet<K: Kernel>(
        &mut self,
        routing: RoutingFrame,
        now: f64,
        link: &mut LinkLayer,
        k: &mut K,
    ) -> bool {
        let beacon = Packet::Beacon(Beacon {
            link: LinkHeader {
                src: self.id,
                sink: BROADCAST_ADDRESS,
                gain: 0.0,
                duration: 0.0,
            },
            estimator: EstimatorFrame {
                seq: self.beacon_seq,
            },
            routing,
        });

        if link.send(beacon, now, k) {
            self.beacon_seq = self.beacon_seq.wrapping_add(1);
            true
        } else {
            trace!("node {}: beacon skipped, link busy", self.id);
            false
        }
    }
}
