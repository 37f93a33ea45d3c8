
use core::fmt;

use crate::NodeId;

/// Which bootstrap input a [`TopologyError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TopologyFile {
    Coordinates,
    Links,
}

impl fmt::Display for TopologyFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TopologyFile::Coordinates => write!(f, "coordinates file"),
            TopologyFile::Links => write!(f, "links file"),
        }
    }
}

/// Fatal bootstrap errors. Anything that parses is validated for
/// completeness before the simulation starts; nothing here is recoverable.
#[derive(Debug)]
pub enum TopologyError {
    /// An input file could not be read.
    Io(TopologyFile, std::io::Error),

    /// A line did not match the expected syntax.
    Malformed {
        file: TopologyFile,
        line: usize,
        reason: String,
    },

    /// The coordinates file contained no nodes.
    NoNodes,

    /// A node has no outgoing gain entry.
    MissingGain(NodeId),

    /// A node has no noise entry.
    MissingNoise(NodeId),

    /// A gain or noise line names a node outside the coordinate list.
    UnknownNode {
        file: TopologyFile,
        line: usize,
        id: u32,
    },
}

impl fmt::Display for TopologyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TopologyError::Io(file, e) => write!(f, "failed to read {}: {}", file, e),
            TopologyError::Malformed { file, line, reason } => {
                write!(f, "{} line {}: {}", file, line, reason)
            }
            TopologyError::NoNodes => write!(f, "coordinates file declares no nodes"),
            TopologyError::MissingGain(id) => {
                write!(f, "node {} has no outgoing gain entry", id)
            }
            TopologyError::MissingNoise(id) => write!(f, "node {} has no noise entry", id),
            TopologyError::UnknownNode { file, line, id } => {
                write!(f, "{} line {}: unknown node {}", file, line, id)
            }
        }
    }
}

impl std::error::Error for TopologyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TopologyError::Io(_, e) => Some(e),
            _ => None,
        }
    }
}
