//! Per-node state and the event dispatcher.
//!
//! A [`Node`] owns every mutable piece of one simulated sensor: the
//! physical layer, the CSMA link layer, the link estimator, the routing
//! engine and the forwarding engine. The external scheduler drives it
//! exclusively through [`Node::handle_event`]; optimistic rollback can
//! therefore snapshot and restore the whole object.

use bitflags::bitflags;
use log::{info, trace};

use crate::config::{CsmaConfig, CtpConfig, PhyConfig};
use crate::estimator::LinkEstimator;
use crate::forward::ForwardingEngine;
use crate::kernel::{Event, Kernel};
use crate::link::LinkLayer;
use crate::packet::Packet;
use crate::phy::Phy;
use crate::router::RoutingEngine;
use crate::topology::Topology;
use crate::NodeId;

bitflags! {
    /// Busy flags shared across the stack's layers.
    pub struct NodeFlags: u8 {
        /// The node finished `Init` and participates in the network.
        const RUNNING            = 0x01;
        /// A locally produced packet is still in the forwarding queue.
        const SENDING            = 0x02;
        /// A transmitted data packet awaits its acknowledgement.
        const ACK_PENDING        = 0x04;
        /// The radio is pushing a frame onto the channel.
        const RADIO_TRANSMITTING = 0x08;
        /// The radio is locked onto an incoming transmission.
        const RADIO_RECEIVING    = 0x10;
    }
}

/// One simulated node: identity plus the full CTP stack.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    coords: (i32, i32),
    is_root: bool,

    /// Local virtual time, updated on every dispatched event.
    now: f64,
    flags: NodeFlags,
    ctp: CtpConfig,

    phy: Phy,
    link: LinkLayer,
    estimator: LinkEstimator,
    router: RoutingEngine,
    forwarder: ForwardingEngine,
}

impl Node {
    /// Build the state object for node `id`. The id must belong to the
    /// topology.
    pub fn new(
        id: NodeId,
        is_root: bool,
        topo: &Topology,
        csma: CsmaConfig,
        phy: PhyConfig,
        ctp: CtpConfig,
    ) -> Self {
        let coords = topo.coordinates(id).unwrap_or((0, 0));
        let noise = *topo.noise(id);

        Self {
            id,
            coords,
            is_root,
            now: 0.0,
            flags: NodeFlags::empty(),
            ctp: ctp.clone(),

            phy: Phy::new(id, phy, noise),
            link: LinkLayer::new(id, csma),
            estimator: LinkEstimator::new(id),
            router: RoutingEngine::new(id, is_root, ctp.clone()),
            forwarder: ForwardingEngine::new(id, is_root, ctp),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn coordinates(&self) -> (i32, i32) {
        self.coords
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn local_time(&self) -> f64 {
        self.now
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Current parent choice, if any.
    pub fn parent(&self) -> Option<NodeId> {
        self.router.get_parent()
    }

    /// The parent's coordinates as the link estimator learned them.
    pub fn parent_coordinates(&self) -> Option<(i32, i32)> {
        self.router
            .get_parent()
            .and_then(|p| self.estimator.coordinates(p))
    }

    /// Current multi-hop ETX, if routed.
    pub fn etx(&self) -> Option<u16> {
        self.router.get_etx(&self.estimator)
    }

    /// Packets delivered to the collector. Meaningful at the root.
    pub fn collected(&self) -> u32 {
        self.forwarder.collected()
    }

    /// Termination check for the simulator's GVT hook: true once the root
    /// has collected its goal.
    pub fn on_gvt(&self) -> bool {
        self.is_root && self.forwarder.reached_goal()
    }

    /// Dispatch one event at virtual time `time`.
    pub fn handle_event<K: Kernel>(
        &mut self,
        time: f64,
        event: Event,
        topo: &Topology,
        k: &mut K,
    ) {
        self.now = time;
        trace!("node {}: {:?} at {:.6} s", self.id, event, time);

        match event {
            Event::Init => {
                self.flags.insert(NodeFlags::RUNNING);
                info!(
                    "node {} up at ({}, {}){}",
                    self.id,
                    self.coords.0,
                    self.coords.1,
                    if self.is_root { " [root]" } else { "" }
                );

                k.schedule(
                    self.id,
                    time + self.ctp.update_route_period,
                    Event::UpdateRouteTimerFired,
                );
                self.router.start(time, k);
                self.forwarder.start(time, k);
            }

            Event::UpdateRouteTimerFired => {
                self.router.update_route(&mut self.estimator, time, k);
                k.schedule(
                    self.id,
                    time + self.ctp.update_route_period,
                    Event::UpdateRouteTimerFired,
                );
            }

            Event::SetBeaconsTimer => {
                self.router.on_set_beacons_timer(time, k);
            }

            Event::SendBeaconsTimerFired => {
                let frame = self
                    .router
                    .build_beacon(&self.estimator, self.forwarder.is_congested());
                self.estimator
                    .send_routing_packet(frame, time, &mut self.link, k);
            }

            Event::SendPacketTimerFired => {
                self.forwarder.on_send_packet_timer(
                    time,
                    &mut self.router,
                    &mut self.estimator,
                    &mut self.link,
                    &mut self.flags,
                    k,
                );
            }

            Event::BeaconReceived(beacon) => {
                let coords = topo.coordinates(beacon.link.src).unwrap_or((0, 0));

                let ingest = self
                    .estimator
                    .receive_beacon(&beacon, coords, &self.router, k);

                if let Some(victim) = ingest.evicted {
                    if self.router.neighbor_evicted(victim) {
                        self.router.update_route(&mut self.estimator, time, k);
                    }
                }

                // The routing engine sees every beacon; senders the
                // estimator refused stay out of the routing table through
                // the 1-hop ETX requirement, unless a root announcement
                // forces them in
                self.router
                    .receive_beacon(&beacon, coords, &mut self.estimator, time, k);
            }

            Event::DataPacketReceived(packet) => {
                self.forwarder.receive(
                    packet,
                    time,
                    &mut self.router,
                    &mut self.estimator,
                    &mut self.link,
                    &mut self.flags,
                    k,
                );
            }

            Event::RetransmitDataPacket => {
                self.forwarder.on_retransmit(
                    time,
                    &mut self.router,
                    &mut self.estimator,
                    &mut self.link,
                    &mut self.flags,
                    k,
                );
            }

            Event::CheckAckReceived(fid) => {
                self.forwarder.on_check_ack(
                    fid,
                    time,
                    &mut self.router,
                    &mut self.estimator,
                    &mut self.link,
                    &mut self.flags,
                    k,
                );
            }

            Event::AckReceived(ack) => {
                self.forwarder.on_ack_received(
                    &ack,
                    time,
                    &mut self.router,
                    &mut self.estimator,
                    &mut self.link,
                    &mut self.flags,
                    k,
                );
            }

            Event::CheckChannelFree => {
                if let Some(dropped) =
                    self.link
                        .on_check_channel_free(time, &self.phy, &mut self.flags, k)
                {
                    if let Packet::Data(d) = dropped {
                        let ack_wait = self.link.config().ack_wait();
                        self.forwarder.transmitted_data_packet(
                            false,
                            &d,
                            time,
                            ack_wait,
                            &mut self.router,
                            &mut self.estimator,
                            &mut self.link,
                            &mut self.flags,
                            k,
                        );
                    }
                }
            }

            Event::StartFrameTransmission => {
                self.link
                    .on_start_frame_transmission(time, topo, &self.phy, k);
            }

            Event::FrameTransmitted => {
                if let Some(sent) = self.link.on_frame_transmitted(&mut self.flags) {
                    if let Packet::Data(d) = sent {
                        let ack_wait = self.link.config().ack_wait();
                        self.forwarder.transmitted_data_packet(
                            true,
                            &d,
                            time,
                            ack_wait,
                            &mut self.router,
                            &mut self.estimator,
                            &mut self.link,
                            &mut self.flags,
                            k,
                        );
                    }
                }

                // The link is free again: drain whatever queued up behind
                // it
                if !self.flags.contains(NodeFlags::ACK_PENDING) {
                    self.forwarder.pump(
                        time,
                        &mut self.router,
                        &mut self.estimator,
                        &mut self.link,
                        &mut self.flags,
                        k,
                    );
                }
            }

            Event::BeaconTransmissionStarted(beacon) => {
                self.phy
                    .transmission_started(Packet::Beacon(beacon), &mut self.flags, k);
            }

            Event::DataTransmissionStarted(packet) => {
                self.phy
                    .transmission_started(Packet::Data(packet), &mut self.flags, k);
            }

            Event::TransmissionFinished(packet) => {
                self.phy
                    .transmission_finished(&packet, time, &mut self.flags, k);
            }
        }
    }
}
