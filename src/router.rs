//! Routing engine: parent selection over advertised multi-hop ETX and
//! Trickle-timed beaconing.
//!
//! The routing table caches each neighbor's advertisement (parent, ETX,
//! congestion). Parent selection minimizes advertised ETX plus the 1-hop
//! ETX from the link estimator, with hysteresis so marginal improvements
//! do not thrash the tree.

use heapless::Vec as BoundedVec;
use log::{debug, info, trace};

use crate::config::CtpConfig;
use crate::estimator::LinkEstimator;
use crate::kernel::{Event, Kernel};
use crate::packet::{Beacon, RoutingFrame, CTP_CONGESTED, CTP_PULL, INFINITE_ETX};
use crate::{NodeId, INVALID_ADDRESS};

pub const ROUTING_TABLE_SIZE: usize = 10;

/// Links at or past this 1-hop ETX are not trusted for routing.
pub const MAX_ONE_HOP_ETX: u16 = 50;

/// A candidate must undercut the current path by this much to displace
/// the parent.
pub const PARENT_SWITCH_THRESHOLD: u16 = 15;

/// Advertised-ETX margin for vouching a newcomer into the neighbor table.
pub const EVICT_BEST_ETX_THRESHOLD: u16 = 10;

/// Safety margin against adopting a descendant while escaping congestion.
const CONGESTED_SWITCH_MARGIN: u16 = 10;

/// One neighbor's last advertisement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingEntry {
    pub id: NodeId,
    /// The neighbor's advertised parent.
    pub parent: NodeId,
    /// The neighbor's advertised multi-hop ETX, scaled by 10.
    pub etx: u16,
    pub congested: bool,
}

/// The node's current route summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteInfo {
    pub parent: NodeId,
    /// The parent's advertised ETX at selection time, scaled by 10.
    pub etx: u16,
    pub congested: bool,
}

impl RouteInfo {
    fn none() -> Self {
        Self {
            parent: INVALID_ADDRESS,
            etx: INFINITE_ETX,
            congested: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.parent != INVALID_ADDRESS
    }
}

/// Per-node routing engine.
#[derive(Debug)]
pub struct RoutingEngine {
    id: NodeId,
    is_root: bool,
    config: CtpConfig,

    table: BoundedVec<RoutingEntry, ROUTING_TABLE_SIZE>,
    route: RouteInfo,

    /// Current Trickle interval, seconds.
    beacon_interval: f64,
}

impl RoutingEngine {
    pub fn new(id: NodeId, is_root: bool, config: CtpConfig) -> Self {
        let beacon_interval = config.min_beacon_interval;
        Self {
            id,
            is_root,
            config,
            table: BoundedVec::new(),
            route: RouteInfo::none(),
            beacon_interval,
        }
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    pub fn route(&self) -> &RouteInfo {
        &self.route
    }

    pub fn beacon_interval(&self) -> f64 {
        self.beacon_interval
    }

    /// Current parent, if any.
    pub fn get_parent(&self) -> Option<NodeId> {
        if self.route.is_valid() {
            Some(self.route.parent)
        } else {
            None
        }
    }

    /// This node's multi-hop ETX: 0 at the root, the parent's advertised
    /// ETX plus the 1-hop link otherwise. `None` without a valid parent.
    pub fn get_etx(&self, est: &LinkEstimator) -> Option<u16> {
        if self.is_root {
            return Some(0);
        }
        if !self.route.is_valid() {
            return None;
        }
        Some(
            self.route
                .etx
                .saturating_add(est.one_hop_etx(self.route.parent)),
        )
    }

    /// Kick off the Trickle chain; called from `Init`.
    pub fn start<K: Kernel>(&mut self, now: f64, k: &mut K) {
        k.schedule(self.id, now, Event::SetBeaconsTimer);
    }

    /// Start of a Trickle interval: pick a beacon instant inside
    /// `[I/2, I]`, arm the next interval, and double up to the ceiling.
    pub fn on_set_beacons_timer<K: Kernel>(&mut self, now: f64, k: &mut K) {
        let i = self.beacon_interval;
        let fire = k.random_range(i / 2.0, i);

        k.schedule(self.id, now + fire, Event::SendBeaconsTimerFired);
        k.schedule(self.id, now + i, Event::SetBeaconsTimer);

        self.beacon_interval = (i * 2.0).min(self.config.max_beacon_interval);
    }

    /// Collapse the Trickle interval to the floor and redraw immediately.
    /// Invoked on PULL receipt and on loop detection.
    pub fn reset_beacon_interval<K: Kernel>(&mut self, now: f64, k: &mut K) {
        if self.beacon_interval == self.config.min_beacon_interval {
            return;
        }

        self.beacon_interval = self.config.min_beacon_interval;
        let i = self.beacon_interval;
        let fire = k.random_range(i / 2.0, i);

        trace!("node {}: beacon interval reset", self.id);
        k.schedule(self.id, now + fire, Event::SendBeaconsTimerFired);
    }

    /// Assemble the routing frame for the next beacon.
    pub fn build_beacon(&self, est: &LinkEstimator, congested: bool) -> RoutingFrame {
        let mut options = 0u8;
        if congested {
            options |= CTP_CONGESTED;
        }

        if self.is_root {
            return RoutingFrame {
                options,
                parent: self.id,
                etx: 0,
            };
        }

        if !self.route.is_valid() {
            return RoutingFrame {
                options: options | CTP_PULL,
                parent: INVALID_ADDRESS,
                etx: self.route.etx,
            };
        }

        RoutingFrame {
            options,
            parent: self.route.parent,
            etx: self
                .route
                .etx
                .saturating_add(est.one_hop_etx(self.route.parent)),
        }
    }

    /// Should the estimator displace an immature neighbor for the sender
    /// of this beacon? Yes when the table is empty, or when the
    /// advertisement undercuts some non-parent entry by the vouching
    /// margin.
    pub fn is_neighbor_worth_inserting(&self, beacon: &Beacon) -> bool {
        if self.table.is_empty() {
            return true;
        }

        self.table.iter().any(|e| {
            e.id != self.route.parent
                && beacon.routing.etx.saturating_add(EVICT_BEST_ETX_THRESHOLD) <= e.etx
        })
    }

    /// The estimator dropped `id`. Returns true when that was the parent
    /// and a re-route is needed.
    pub fn neighbor_evicted(&mut self, id: NodeId) -> bool {
        if let Some(i) = self.table.iter().position(|e| e.id == id) {
            self.table.swap_remove(i);
        }

        if self.route.parent == id {
            debug!("node {}: parent {} evicted", self.id, id);
            self.route = RouteInfo::none();
            true
        } else {
            false
        }
    }

    /// Ingest a beacon that already passed the link estimator.
    pub fn receive_beacon<K: Kernel>(
        &mut self,
        beacon: &Beacon,
        coords: (i32, i32),
        est: &mut LinkEstimator,
        now: f64,
        k: &mut K,
    ) {
        let from = beacon.link.src;
        let routing = &beacon.routing;

        if routing.etx == 0 && routing.parent != INVALID_ADDRESS {
            // Root announcement: the sender must survive in the neighbor
            // table no matter what
            if let Some(victim) = est.force_insert_pinned(from, coords, beacon.estimator.seq) {
                if self.neighbor_evicted(victim) {
                    self.update_route(est, now, k);
                }
            }
        }

        if routing.parent != INVALID_ADDRESS {
            self.update_routing_table(from, routing.parent, routing.etx, est);
            self.update_neighbor_congested(
                from,
                routing.options & CTP_CONGESTED != 0,
                est,
                now,
                k,
            );
        }

        if routing.options & CTP_PULL != 0 {
            self.reset_beacon_interval(now, k);
        }

        self.update_route(est, now, k);
    }

    /// Insert or refresh the sender's advertisement. Writes go through the
    /// slot the lookup selected.
    fn update_routing_table(
        &mut self,
        from: NodeId,
        parent: NodeId,
        etx: u16,
        est: &LinkEstimator,
    ) {
        if let Some(i) = self.table.iter().position(|e| e.id == from) {
            self.table[i].parent = parent;
            self.table[i].etx = etx;
            return;
        }

        if est.one_hop_etx(from) >= MAX_ONE_HOP_ETX {
            trace!("node {}: link to {} too weak for the routing table", self.id, from);
            return;
        }

        let entry = RoutingEntry {
            id: from,
            parent,
            etx,
            congested: false,
        };
        if self.table.push(entry).is_err() {
            trace!("node {}: routing table full, advertisement from {} dropped", self.id, from);
        }
    }

    /// Track a neighbor's congestion bit, re-routing when it affects the
    /// current path.
    fn update_neighbor_congested<K: Kernel>(
        &mut self,
        from: NodeId,
        congested: bool,
        est: &mut LinkEstimator,
        now: f64,
        k: &mut K,
    ) {
        let i = match self.table.iter().position(|e| e.id == from) {
            Some(i) => i,
            None => return,
        };
        self.table[i].congested = congested;

        if congested && self.route.parent == from {
            self.update_route(est, now, k);
        } else if !congested && self.route.congested {
            self.update_route(est, now, k);
        }
    }

    /// Re-evaluate the parent choice against the routing table.
    pub fn update_route<K: Kernel>(&mut self, est: &mut LinkEstimator, _now: f64, _k: &mut K) {
        if self.is_root {
            return;
        }

        let mut best: Option<(RoutingEntry, u32)> = None;
        let mut actual: Option<u32> = None;

        for e in self.table.iter() {
            // Entries advertising no parent are useless; entries advertising
            // us are our own children
            if e.parent == INVALID_ADDRESS || e.parent == self.id {
                continue;
            }

            let one_hop = est.one_hop_etx(e.id);

            if e.id == self.route.parent {
                actual = Some(one_hop as u32 + e.etx as u32);
            }

            if e.congested {
                continue;
            }
            if one_hop >= MAX_ONE_HOP_ETX {
                continue;
            }

            let candidate = one_hop as u32 + e.etx as u32;
            match best {
                Some((_, b)) if b <= candidate => {}
                _ => best = Some((*e, candidate)),
            }
        }

        let (entry, best_etx) = match best {
            Some(b) => b,
            None => return,
        };

        let switch = !self.route.is_valid()
            || (self.route.congested
                && best_etx < self.route.etx as u32 + CONGESTED_SWITCH_MARGIN as u32)
            || (best_etx + PARENT_SWITCH_THRESHOLD as u32) < actual.unwrap_or(u32::MAX);

        if switch && entry.id != self.route.parent {
            if self.route.is_valid() {
                est.unpin(self.route.parent);
            }
            est.pin(entry.id);
            est.clear_data_link_quality(entry.id);

            info!(
                "node {}: parent {} -> {} (etx {})",
                self.id,
                self.route.parent,
                entry.id,
                best_etx
            );

            self.route = RouteInfo {
                parent: entry.id,
                etx: entry.etx,
                congested: entry.congested,
            };
            return;
        }

        // Keeping the parent: track its latest advertisement
        if self.route.is_valid() {
            if let Some(e) = self.table.iter().find(|e| e.id == self.route.parent) {
                self.route.etx = e.etx;
                self.route.congested = e.congested;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::estimator::LinkEstimator;
    use crate::kernel::mock::MockKernel;
    use crate::packet::{EstimatorFrame, LinkHeader};
    use crate::BROADCAST_ADDRESS;
    use rand::rngs::SmallRng;
    use rand_core::SeedableRng;

    fn kernel() -> MockKernel<SmallRng> {
        MockKernel::new(SmallRng::seed_from_u64(11))
    }

    fn beacon(src: NodeId, seq: u16, parent: NodeId, etx: u16, options: u8) -> Beacon {
        Beacon {
            link: LinkHeader {
                src,
                sink: BROADCAST_ADDRESS,
                gain: -60.0,
                duration: 0.005,
            },
            estimator: EstimatorFrame { seq },
            routing: RoutingFrame {
                options,
                parent,
                etx,
            },
        }
    }

    /// Feed a beacon through estimator and router the way the dispatcher
    /// does.
    fn ingest<K: Kernel>(
        router: &mut RoutingEngine,
        est: &mut LinkEstimator,
        b: &Beacon,
        now: f64,
        k: &mut K,
    ) {
        let ingest = est.receive_beacon(b, (0, 0), router, k);
        if let Some(victim) = ingest.evicted {
            if router.neighbor_evicted(victim) {
                router.update_route(est, now, k);
            }
        }
        router.receive_beacon(b, (0, 0), est, now, k);
    }

    #[test]
    fn single_root_beacon_establishes_route() {
        let mut router = RoutingEngine::new(1, false, CtpConfig::default());
        let mut est = LinkEstimator::new(1);
        let mut k = kernel();

        ingest(&mut router, &mut est, &beacon(0, 0, 0, 0, 0), 0.0, &mut k);

        assert_eq!(router.get_parent(), Some(0));
        assert_eq!(router.get_etx(&est), Some(0));
        // Root neighbors are pinned on announcement
        assert!(est
            .entry(0)
            .unwrap()
            .flags
            .contains(crate::estimator::EntryFlags::PINNED));
    }

    #[test]
    fn root_reports_zero_etx() {
        let router = RoutingEngine::new(0, true, CtpConfig::default());
        let est = LinkEstimator::new(0);
        assert_eq!(router.get_etx(&est), Some(0));
    }

    #[test]
    fn no_route_without_beacons() {
        let router = RoutingEngine::new(1, false, CtpConfig::default());
        let est = LinkEstimator::new(1);
        assert_eq!(router.get_etx(&est), None);
        assert_eq!(router.get_parent(), None);
    }

    #[test]
    fn parent_switch_needs_threshold() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        // Parent 1 advertises etx 40; immature 1-hop is 0
        ingest(&mut router, &mut est, &beacon(1, 0, 0, 40, 0), 0.0, &mut k);
        assert_eq!(router.get_parent(), Some(1));

        // Candidate 2 at etx 30 does not clear 30 + 15 < 40
        ingest(&mut router, &mut est, &beacon(2, 0, 0, 30, 0), 0.1, &mut k);
        assert_eq!(router.get_parent(), Some(1));

        // Candidate 3 at etx 20 does: 20 + 15 < 40
        ingest(&mut router, &mut est, &beacon(3, 0, 0, 20, 0), 0.2, &mut k);
        assert_eq!(router.get_parent(), Some(3));
        assert_eq!(router.route().etx, 20);

        // Pin moved with the parent
        use crate::estimator::EntryFlags;
        assert!(!est.entry(1).unwrap().flags.contains(EntryFlags::PINNED));
        assert!(est.entry(3).unwrap().flags.contains(EntryFlags::PINNED));
    }

    #[test]
    fn refresh_tracks_parent_advertisement() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        ingest(&mut router, &mut est, &beacon(1, 0, 0, 40, 0), 0.0, &mut k);
        ingest(&mut router, &mut est, &beacon(1, 1, 0, 35, 0), 0.1, &mut k);

        assert_eq!(router.get_parent(), Some(1));
        assert_eq!(router.route().etx, 35);
    }

    #[test]
    fn congested_parent_triggers_escape() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        ingest(&mut router, &mut est, &beacon(1, 0, 0, 30, 0), 0.0, &mut k);
        // Sibling at the same advertised etx: within the one-hop margin
        ingest(&mut router, &mut est, &beacon(2, 0, 0, 30, 0), 0.1, &mut k);
        assert_eq!(router.get_parent(), Some(1));

        // Parent turns congested
        ingest(
            &mut router,
            &mut est,
            &beacon(1, 1, 0, 30, CTP_CONGESTED),
            0.2,
            &mut k,
        );

        assert_eq!(router.get_parent(), Some(2));
    }

    #[test]
    fn parentless_sender_does_not_enter_table() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        ingest(
            &mut router,
            &mut est,
            &beacon(2, 0, INVALID_ADDRESS, 77, CTP_PULL),
            0.0,
            &mut k,
        );

        assert_eq!(router.get_parent(), None);
        assert!(router.table.is_empty());
        // The estimator still tracked the beacon
        assert!(est.entry(2).is_some());
    }

    #[test]
    fn pull_resets_trickle_interval() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        // Grow the interval past the floor
        router.on_set_beacons_timer(0.0, &mut k);
        router.on_set_beacons_timer(0.125, &mut k);
        assert!(router.beacon_interval() > CtpConfig::default().min_beacon_interval);
        k.take_scheduled();

        ingest(
            &mut router,
            &mut est,
            &beacon(2, 0, INVALID_ADDRESS, 77, CTP_PULL),
            1.0,
            &mut k,
        );

        assert_eq!(
            router.beacon_interval(),
            CtpConfig::default().min_beacon_interval
        );
        // An immediate beacon was drawn
        assert!(k
            .take_scheduled()
            .iter()
            .any(|(_, _, e)| matches!(e, Event::SendBeaconsTimerFired)));
    }

    #[test]
    fn trickle_interval_doubles_to_ceiling() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut k = kernel();
        let cfg = CtpConfig::default();

        let mut expect = cfg.min_beacon_interval;
        for _ in 0..20 {
            assert_eq!(router.beacon_interval(), expect);
            router.on_set_beacons_timer(0.0, &mut k);
            expect = (expect * 2.0).min(cfg.max_beacon_interval);
        }
        assert_eq!(router.beacon_interval(), cfg.max_beacon_interval);

        // Every interval schedules the fire inside [I/2, I] and the next
        // interval start at I
        let scheduled = k.take_scheduled();
        assert_eq!(scheduled.len(), 40);
    }

    #[test]
    fn beacon_shapes() {
        let est = LinkEstimator::new(0);

        let root = RoutingEngine::new(0, true, CtpConfig::default());
        let f = root.build_beacon(&est, false);
        assert_eq!(f.etx, 0);
        assert_eq!(f.parent, 0);
        assert_eq!(f.options, 0);

        let mut lost = RoutingEngine::new(3, false, CtpConfig::default());
        lost.route = RouteInfo::none();
        let f = lost.build_beacon(&est, true);
        assert_eq!(f.options, CTP_PULL | CTP_CONGESTED);
        assert_eq!(f.parent, INVALID_ADDRESS);
        assert_eq!(f.etx, INFINITE_ETX);
    }

    #[test]
    fn worth_inserting_wants_a_margin() {
        let mut router = RoutingEngine::new(5, false, CtpConfig::default());
        let mut est = LinkEstimator::new(5);
        let mut k = kernel();

        // Empty table vouches for anyone
        assert!(router.is_neighbor_worth_inserting(&beacon(9, 0, 0, 100, 0)));

        ingest(&mut router, &mut est, &beacon(1, 0, 0, 40, 0), 0.0, &mut k);
        // Parent entries don't count towards vouching
        assert!(!router.is_neighbor_worth_inserting(&beacon(9, 0, 0, 10, 0)));

        ingest(&mut router, &mut est, &beacon(2, 0, 0, 50, 0), 0.1, &mut k);
        assert!(router.is_neighbor_worth_inserting(&beacon(9, 0, 0, 40, 0)));
        assert!(!router.is_neighbor_worth_inserting(&beacon(9, 0, 0, 45, 0)));
    }
}
