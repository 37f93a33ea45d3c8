//! CSMA/CA link layer.
//!
//! One outgoing frame at a time: a send request pins the frame into the
//! outgoing slot, then carrier sense runs as a chain of scheduled
//! `CheckChannelFree` samples with randomized backoff between them. Once
//! the channel has stayed free for the configured number of samples the
//! radio turns around and the frame fans out through the physical layer.

use log::{debug, trace, warn};

use crate::config::CsmaConfig;
use crate::kernel::{Event, Kernel};
use crate::node::NodeFlags;
use crate::packet::Packet;
use crate::phy::Phy;
use crate::topology::Topology;
use crate::NodeId;

/// Per-node CSMA/CA state.
#[derive(Debug)]
pub struct LinkLayer {
    id: NodeId,
    config: CsmaConfig,

    /// Frame currently being serialized, if any.
    outgoing: Option<Packet>,

    /// Free samples still required before transmitting.
    free_channel_count: u8,
    /// Carrier-sense rounds performed for the current frame.
    backoff_count: u32,
}

impl LinkLayer {
    pub fn new(id: NodeId, config: CsmaConfig) -> Self {
        Self {
            id,
            config,
            outgoing: None,
            free_channel_count: 0,
            backoff_count: 0,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.outgoing.is_some()
    }

    pub fn config(&self) -> &CsmaConfig {
        &self.config
    }

    /// Accept a frame for transmission. Returns false while a previous
    /// frame still occupies the outgoing slot.
    pub fn send<K: Kernel>(&mut self, packet: Packet, now: f64, k: &mut K) -> bool {
        if self.outgoing.is_some() {
            trace!("node {}: link busy, send refused", self.id);
            return false;
        }

        self.free_channel_count = self.config.min_free_samples;
        self.backoff_count = 0;
        self.outgoing = Some(packet);

        let backoff = k.random_range(self.config.init_low as f64, self.config.init_high as f64);
        let delay = backoff * self.config.symbol_period();

        trace!("node {}: initial backoff {:.0} symbols", self.id, backoff);
        k.schedule(self.id, now + delay, Event::CheckChannelFree);

        true
    }

    /// One carrier-sense sample. Returns the dropped frame when the
    /// backoff cap is exhausted, so the caller can notify the sender.
    pub fn on_check_channel_free<K: Kernel>(
        &mut self,
        now: f64,
        phy: &Phy,
        flags: &mut NodeFlags,
        k: &mut K,
    ) -> Option<Packet> {
        if self.outgoing.is_none() {
            // Stale sample after a drop
            return None;
        }

        self.backoff_count += 1;

        if phy.is_channel_free(k) {
            self.free_channel_count = self.free_channel_count.saturating_sub(1);
        } else {
            self.free_channel_count = self.config.min_free_samples;
        }

        if self.free_channel_count == 0 {
            flags.insert(NodeFlags::RADIO_TRANSMITTING);
            k.schedule(self.id, now + self.config.turnaround(), Event::StartFrameTransmission);
            return None;
        }

        if self.config.max_free_samples == 0 || self.backoff_count <= self.config.max_free_samples {
            let backoff = k.random_range(0.0, self.config.backoff_window(self.backoff_count));
            k.schedule(
                self.id,
                now + backoff * self.config.symbol_period(),
                Event::CheckChannelFree,
            );
            return None;
        }

        warn!(
            "node {}: backoff cap exceeded after {} rounds, dropping frame",
            self.id, self.backoff_count
        );
        self.outgoing.take()
    }

    /// Turnaround finished: stamp the on-air duration and push the frame
    /// to the channel.
    pub fn on_start_frame_transmission<K: Kernel>(
        &mut self,
        now: f64,
        topo: &Topology,
        phy: &Phy,
        k: &mut K,
    ) {
        let packet = match self.outgoing.as_mut() {
            Some(p) => p,
            None => return,
        };

        let duration = self
            .config
            .frame_duration(packet.bits(), packet.is_data());
        packet.link_mut().duration = duration;

        debug!(
            "node {}: transmitting {} bytes for {:.6} s at {:.6} s",
            self.id,
            packet.encoded_len(),
            duration,
            now
        );

        phy.fan_out(packet, now, topo, k);

        k.schedule(
            self.id,
            now + duration + self.config.turnaround(),
            Event::FrameTransmitted,
        );
    }

    /// Radio done: free the outgoing slot and hand the sent frame back to
    /// the dispatcher for upper-layer notification.
    pub fn on_frame_transmitted(&mut self, flags: &mut NodeFlags) -> Option<Packet> {
        flags.remove(NodeFlags::RADIO_TRANSMITTING);
        self.outgoing.take()
    }
}
