//! Additive-interference physical layer.
//!
//! A transmission fans out as one in-flight record per reachable neighbor.
//! Every record reaching a node contributes its power to that node's
//! perceived channel for as long as it is on the air; whether the node can
//! actually lock onto a record is decided against the concurrent power sum
//! plus a capture margin.

use log::{trace, warn};

use heapless::Vec as BoundedVec;

use crate::config::PhyConfig;
use crate::kernel::{Event, Kernel};
use crate::node::NodeFlags;
use crate::packet::Packet;
use crate::topology::{NoiseEntry, Topology};
use crate::NodeId;

/// Upper bound on concurrent in-flight receptions at one node.
pub const MAX_PENDING_TRANSMISSIONS: usize = 32;

pub fn dbm_to_mw(dbm: f64) -> f64 {
    10f64.powf(dbm / 10.0)
}

pub fn mw_to_dbm(mw: f64) -> f64 {
    10.0 * mw.log10()
}

/// One in-flight transmission currently reaching this node.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransmission {
    pub packet: Packet,
    /// Received signal power in dBm (the link gain).
    pub power_dbm: f64,
    /// Set when reception can no longer succeed.
    pub lost: bool,
    /// This record is the one the radio locked onto.
    locked: bool,
}

/// Per-node physical layer state.
#[derive(Debug)]
pub struct Phy {
    id: NodeId,
    config: PhyConfig,
    noise: NoiseEntry,

    pending: BoundedVec<PendingTransmission, MAX_PENDING_TRANSMISSIONS>,
    /// Sum of 10^(power/10) over the pending records, in mW.
    pending_power_mw: f64,
}

impl Phy {
    pub fn new(id: NodeId, config: PhyConfig, noise: NoiseEntry) -> Self {
        Self {
            id,
            config,
            noise,
            pending: BoundedVec::new(),
            pending_power_mw: 0.0,
        }
    }

    /// Total power currently perceived, in dBm: noise floor, a fresh
    /// white-noise draw, and every in-flight transmission.
    pub fn channel_strength<K: Kernel>(&self, k: &mut K) -> f64 {
        let noise = self.noise.floor_dbm
            + self.config.white_noise_mean
            + k.random_range(-self.noise.range_dbm, self.noise.range_dbm);

        mw_to_dbm(dbm_to_mw(noise) + self.pending_power_mw)
    }

    /// Carrier-sense verdict for the CSMA layer.
    pub fn is_channel_free<K: Kernel>(&self, k: &mut K) -> bool {
        self.channel_strength(k) < self.config.channel_free_threshold
    }

    /// Accumulated in-flight power in mW.
    pub fn pending_power_mw(&self) -> f64 {
        self.pending_power_mw
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fan a frame out to every neighbor the gain table reaches. Each
    /// neighbor sees the frame with its own link gain stamped, first as a
    /// transmission start and, one on-air duration later, as its end.
    pub fn fan_out<K: Kernel>(&self, packet: &Packet, now: f64, topo: &Topology, k: &mut K) {
        let duration = packet.link().duration;

        for entry in topo.gains_from(self.id) {
            let mut copy = *packet;
            copy.link_mut().gain = entry.gain_dbm;

            let started = match copy {
                Packet::Beacon(b) => Event::BeaconTransmissionStarted(b),
                Packet::Data(d) => Event::DataTransmissionStarted(d),
            };

            k.schedule(entry.sink, now, started);
            k.schedule(entry.sink, now + duration, Event::TransmissionFinished(copy));
        }
    }

    /// A neighbor's transmission starts reaching this node.
    ///
    /// The record always joins the pending set and raises the perceived
    /// floor; the radio locks onto it only when running, neither
    /// transmitting nor already receiving, and the new signal clears the
    /// current channel power by the capture margin. Any weaker reception
    /// already in progress is wiped by the new arrival.
    pub fn transmission_started<K: Kernel>(
        &mut self,
        packet: Packet,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        let power = packet.link().gain;

        let accept = flags.contains(NodeFlags::RUNNING)
            && !flags.contains(NodeFlags::RADIO_TRANSMITTING)
            && !flags.contains(NodeFlags::RADIO_RECEIVING)
            && self.channel_strength(k) + self.config.sensitivity < power;

        for rec in self.pending.iter_mut() {
            if rec.power_dbm - self.config.sensitivity < power && !rec.lost {
                trace!(
                    "node {}: reception from {} wiped by stronger arrival",
                    self.id,
                    rec.packet.link().src
                );
                rec.lost = true;
            }
        }

        let rec = PendingTransmission {
            packet,
            power_dbm: power,
            lost: !accept,
            locked: accept,
        };

        if self.pending.push(rec).is_err() {
            warn!("node {}: pending transmission list full, arrival not tracked", self.id);
            return;
        }

        if accept {
            flags.insert(NodeFlags::RADIO_RECEIVING);
        }

        self.pending_power_mw += dbm_to_mw(power);
    }

    /// A transmission stops reaching this node: drop its record, settle
    /// its fate, and deliver upward when it survived.
    ///
    /// Delivery means scheduling the matching `*Received` event to this
    /// node; a delivered data packet addressed to us is acknowledged back
    /// to the sender immediately unless the radio is busy transmitting.
    pub fn transmission_finished<K: Kernel>(
        &mut self,
        packet: &Packet,
        now: f64,
        flags: &mut NodeFlags,
        k: &mut K,
    ) {
        let idx = match self.pending.iter().position(|r| r.packet == *packet) {
            Some(i) => i,
            None => {
                warn!("node {}: finish for untracked transmission from {}", self.id, packet.link().src);
                return;
            }
        };

        let mut rec = self.pending.swap_remove(idx);

        self.pending_power_mw -= dbm_to_mw(rec.power_dbm);
        if self.pending.is_empty() {
            // Re-anchor the accumulator so float drift cannot survive an
            // idle channel
            self.pending_power_mw = 0.0;
        }

        // A newer overlapping transmission may have out-powered this one
        // after it locked
        for other in self.pending.iter() {
            if rec.power_dbm - self.config.sensitivity < other.power_dbm {
                rec.lost = true;
            }
        }

        if rec.locked {
            flags.remove(NodeFlags::RADIO_RECEIVING);
        }

        if rec.lost {
            trace!("node {}: transmission from {} lost", self.id, rec.packet.link().src);
            return;
        }

        match rec.packet {
            Packet::Beacon(b) => {
                k.schedule(self.id, now, Event::BeaconReceived(b));
            }
            Packet::Data(d) => {
                if d.link.sink != self.id {
                    // Unicast overheard in passing
                    return;
                }

                k.schedule(self.id, now, Event::DataPacketReceived(d));

                if !flags.contains(NodeFlags::RADIO_TRANSMITTING) {
                    k.schedule(d.link.src, now, Event::AckReceived(d));
                }
            }
        }
    }
}
