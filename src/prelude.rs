

pub use crate::{NodeId, BROADCAST_ADDRESS, INVALID_ADDRESS};

pub use crate::packet::{Beacon, DataPacket, FrameId, Packet};

pub use crate::config::{CsmaConfig, CtpConfig, PhyConfig};
pub use crate::error::TopologyError;
pub use crate::topology::Topology;

pub use crate::kernel::{Event, Kernel};
pub use crate::node::{Node, NodeFlags};
