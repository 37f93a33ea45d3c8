
use byteorder::{ByteOrder, LittleEndian};

use crate::NodeId;

/// Beacon option bit: the sender has no route and asks neighbors to
/// advertise more often.
pub const CTP_PULL: u8 = 0x80;

/// Beacon/data option bit: the sender's forwarding queue is more than
/// half full.
pub const CTP_CONGESTED: u8 = 0x40;

/// ETX advertised by a node with no path to the root.
pub const INFINITE_ETX: u16 = 0xFFFF;

/// Link-layer header shared by both frame kinds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkHeader {
    pub src: NodeId,
    pub sink: NodeId,
    /// Gain of the link towards the receiving node in dBm, stamped by the
    /// physical layer on fan-out.
    pub gain: f64,
    /// On-air duration in seconds, stamped by the link layer before
    /// transmission starts.
    pub duration: f64,
}

/// Link-estimator portion of a beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EstimatorFrame {
    /// Beacon sequence number, stamped by the link estimator on egress.
    pub seq: u16,
}

/// Routing portion of a beacon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingFrame {
    pub options: u8,
    /// The sender's current parent.
    pub parent: NodeId,
    /// The sender's advertised multi-hop ETX, scaled by 10.
    pub etx: u16,
}

/// Periodic broadcast advertising the sender's route.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beacon {
    pub link: LinkHeader,
    pub estimator: EstimatorFrame,
    pub routing: RoutingFrame,
}

/// Header of a data frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataHeader {
    pub options: u8,
    /// Times Has Lived: hop counter, incremented on every forwarding hop.
    pub thl: u8,
    /// ETX of the sender at transmission time, scaled by 10.
    pub etx: u16,
    /// Node that produced the payload.
    pub origin: NodeId,
    /// Sequence number assigned by the origin.
    pub seq_no: u16,
}

/// Unicast frame carrying one sensor sample towards the root.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataPacket {
    pub link: LinkHeader,
    pub header: DataHeader,
    pub payload: f32,
}

/// Identity of a data frame within its lifetime. Duplicates share all
/// three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId {
    pub origin: NodeId,
    pub seq_no: u16,
    pub thl: u8,
}

impl DataPacket {
    pub fn id(&self) -> FrameId {
        FrameId {
            origin: self.header.origin,
            seq_no: self.header.seq_no,
            thl: self.header.thl,
        }
    }
}

/// A frame on the air is either a beacon or a data packet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    Beacon(Beacon),
    Data(DataPacket),
}

const KIND_BEACON: u8 = 0;
const KIND_DATA: u8 = 1;

const LINK_HEADER_LEN: usize = 2 + 2 + 8 + 8;
const BEACON_LEN: usize = 1 + LINK_HEADER_LEN + 2 + 1 + 2 + 2;
const DATA_LEN: usize = 1 + LINK_HEADER_LEN + 1 + 1 + 2 + 2 + 2 + 4;

/// Frame decoding errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    NotEnoughBytes,
    UnknownKind(u8),
}

impl LinkHeader {
    fn encode(&self, buf: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buf[0..2], self.src);
        LittleEndian::write_u16(&mut buf[2..4], self.sink);
        LittleEndian::write_f64(&mut buf[4..12], self.gain);
        LittleEndian::write_f64(&mut buf[12..20], self.duration);
        LINK_HEADER_LEN
    }

    fn decode(buf: &[u8]) -> Self {
        Self {
            src: LittleEndian::read_u16(&buf[0..2]),
            sink: LittleEndian::read_u16(&buf[2..4]),
            gain: LittleEndian::read_f64(&buf[4..12]),
            duration: LittleEndian::read_f64(&buf[12..20]),
        }
    }
}

impl Packet {
    pub fn link(&self) -> &LinkHeader {
        match self {
            Packet::Beacon(b) => &b.link,
            Packet::Data(d) => &d.link,
        }
    }

    pub fn link_mut(&mut self) -> &mut LinkHeader {
        match self {
            Packet::Beacon(b) => &mut b.link,
            Packet::Data(d) => &mut d.link,
        }
    }

    pub fn is_data(&self) -> bool {
        match self {
            Packet::Data(_) => true,
            _ => false,
        }
    }

    /// Encoded length in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            Packet::Beacon(_) => BEACON_LEN,
            Packet::Data(_) => DATA_LEN,
        }
    }

    /// Encoded length in bits, used for on-air duration computation.
    pub fn bits(&self) -> u32 {
        (self.encoded_len() * 8) as u32
    }

    /// Write the frame into `buf`, returning the number of bytes used.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let mut len = 0;

        match self {
            Packet::Beacon(b) => {
                buf[len] = KIND_BEACON;
                len += 1;

                len += b.link.encode(&mut buf[len..]);

                LittleEndian::write_u16(&mut buf[len..len + 2], b.estimator.seq);
                len += 2;

                buf[len] = b.routing.options;
                len += 1;
                LittleEndian::write_u16(&mut buf[len..len + 2], b.routing.parent);
                len += 2;
                LittleEndian::write_u16(&mut buf[len..len + 2], b.routing.etx);
                len += 2;
            }
            Packet::Data(d) => {
                buf[len] = KIND_DATA;
                len += 1;

                len += d.link.encode(&mut buf[len..]);

                buf[len] = d.header.options;
                len += 1;
                buf[len] = d.header.thl;
                len += 1;
                LittleEndian::write_u16(&mut buf[len..len + 2], d.header.etx);
                len += 2;
                LittleEndian::write_u16(&mut buf[len..len + 2], d.header.origin);
                len += 2;
                LittleEndian::write_u16(&mut buf[len..len + 2], d.header.seq_no);
                len += 2;
                LittleEndian::write_f32(&mut buf[len..len + 4], d.payload);
                len += 4;
            }
        }

        len
    }

    /// Parse a frame from `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.is_empty() {
            return Err(DecodeError::NotEnoughBytes);
        }

        match buf[0] {
            KIND_BEACON => {
                if buf.len() < BEACON_LEN {
                    return Err(DecodeError::NotEnoughBytes);
                }
                let link = LinkHeader::decode(&buf[1..]);
                let p = 1 + LINK_HEADER_LEN;

                Ok(Packet::Beacon(Beacon {
                    link,
                    estimator: EstimatorFrame {
                        seq: LittleEndian::read_u16(&buf[p..p + 2]),
                    },
                    routing: RoutingFrame {
                        options: buf[p + 2],
                        parent: LittleEndian::read_u16(&buf[p + 3..p + 5]),
                        etx: LittleEndian::read_u16(&buf[p + 5..p + 7]),
                    },
                }))
            }
            KIND_DATA => {
                if buf.len() < DATA_LEN {
                    return Err(DecodeError::NotEnoughBytes);
                }
                let link = LinkHeader::decode(&buf[1..]);
                let p = 1 + LINK_HEADER_LEN;

                Ok(Packet::Data(DataPacket {
                    link,
                    header: DataHeader {
                        options: buf[p],
                        thl: buf[p + 1],
                        etx: LittleEndian::read_u16(&buf[p + 2..p + 4]),
                        origin: LittleEndian::read_u16(&buf[p + 4..p + 6]),
                        seq_no: LittleEndian::read_u16(&buf[p + 6..p + 8]),
                    },
                    payload: LittleEndian::read_f32(&buf[p + 8..p + 12]),
                }))
            }
            k => Err(DecodeError::UnknownKind(k)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::BROADCAST_ADDRESS;

    fn beacon() -> Packet {
        Packet::Beacon(Beacon {
            link: LinkHeader {
                src: 3,
                sink: BROADCAST_ADDRESS,
                gain: -61.25,
                duration: 0.004,
            },
            estimator: EstimatorFrame { seq: 0x1234 },
            routing: RoutingFrame {
                options: CTP_PULL | CTP_CONGESTED,
                parent: 7,
                etx: 43,
            },
        })
    }

    fn data() -> Packet {
        Packet::Data(DataPacket {
            link: LinkHeader {
                src: 5,
                sink: 2,
                gain: -80.0,
                duration: 0.0051,
            },
            header: DataHeader {
                options: CTP_CONGESTED,
                thl: 3,
                etx: 27,
                origin: 9,
                seq_no: 0xBEEF,
            },
            payload: 21.5,
        })
    }

    #[test]
    fn beacon_roundtrip() {
        let p = beacon();
        let mut buf = [0u8; 64];
        let n = p.encode(&mut buf);

        assert_eq!(n, p.encoded_len());
        assert_eq!(Packet::decode(&buf[..n]), Ok(p));
    }

    #[test]
    fn data_roundtrip() {
        let p = data();
        let mut buf = [0u8; 64];
        let n = p.encode(&mut buf);

        assert_eq!(n, p.encoded_len());
        assert_eq!(Packet::decode(&buf[..n]), Ok(p));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_eq!(Packet::decode(&[]), Err(DecodeError::NotEnoughBytes));
        assert_eq!(Packet::decode(&[7]), Err(DecodeError::UnknownKind(7)));
        assert_eq!(Packet::decode(&[KIND_DATA, 0, 0]), Err(DecodeError::NotEnoughBytes));
    }

    #[test]
    fn frame_id_identifies_duplicates() {
        let d = match data() {
            Packet::Data(d) => d,
            _ => unreachable!(),
        };

        let mut dup = d.clone();
        dup.link.gain = -10.0;
        dup.payload = 99.0;
        assert_eq!(d.id(), dup.id());

        let mut hop = d.clone();
        hop.header.thl += 1;
        assert_ne!(d.id(), hop.id());
    }
}
