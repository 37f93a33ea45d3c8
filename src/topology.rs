//! Read-only bootstrap tables: node coordinates, per-link gains and
//! per-node noise parameters.
//!
//! Two plain-text inputs describe a deployment. The coordinates file has
//! one `x,y` line per node, in node-ID order. The links file mixes
//! `gain <src> <sink> <dBm>` lines (one per directed edge) with
//! `noise <node> <floor> <range>` lines (one per node). Every node needs
//! at least one outgoing gain entry and exactly one noise entry.
//!
//! The tables are populated once at bootstrap and only read afterwards, so
//! they can be shared across worker threads by reference.

use std::fs;
use std::path::Path;

use log::info;

use crate::error::{TopologyError, TopologyFile};
use crate::NodeId;

/// A directed radio link and its gain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainEntry {
    pub sink: NodeId,
    pub gain_dbm: f64,
}

/// Noise-floor parameters of one node's receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoiseEntry {
    pub floor_dbm: f64,
    /// Half-width of the uniform white-noise band around the mean.
    pub range_dbm: f64,
}

/// Immutable deployment description shared by all nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    coords: Vec<(i32, i32)>,
    gains: Vec<Vec<GainEntry>>,
    noise: Vec<NoiseEntry>,
}

impl Topology {
    /// Read and parse the two topology files.
    pub fn load<P: AsRef<Path>>(coords_path: P, links_path: P) -> Result<Self, TopologyError> {
        let coords = fs::read_to_string(coords_path)
            .map_err(|e| TopologyError::Io(TopologyFile::Coordinates, e))?;
        let links = fs::read_to_string(links_path)
            .map_err(|e| TopologyError::Io(TopologyFile::Links, e))?;

        Self::parse(&coords, &links)
    }

    /// Parse topology text. Fails on the first malformed line, identifying
    /// it in the error.
    pub fn parse(coords_text: &str, links_text: &str) -> Result<Self, TopologyError> {
        let coords = parse_coordinates(coords_text)?;
        if coords.is_empty() {
            return Err(TopologyError::NoNodes);
        }

        let n = coords.len();
        let mut gains: Vec<Vec<GainEntry>> = vec![Vec::new(); n];
        let mut noise: Vec<Option<NoiseEntry>> = vec![None; n];

        parse_links(links_text, &mut gains, &mut noise)?;

        // Completeness: every node radiates somewhere and has a noise model
        for (id, g) in gains.iter().enumerate() {
            if g.is_empty() {
                return Err(TopologyError::MissingGain(id as NodeId));
            }
        }
        let noise = noise
            .into_iter()
            .enumerate()
            .map(|(id, e)| e.ok_or(TopologyError::MissingNoise(id as NodeId)))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Loaded topology: {} nodes, {} directed links",
            n,
            gains.iter().map(|g| g.len()).sum::<usize>()
        );

        Ok(Self { coords, gains, noise })
    }

    pub fn node_count(&self) -> usize {
        self.coords.len()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        (id as usize) < self.coords.len()
    }

    /// Coordinates of `id`. Returns `None` for addresses outside the
    /// deployment (e.g. `INVALID_ADDRESS`).
    pub fn coordinates(&self, id: NodeId) -> Option<(i32, i32)> {
        self.coords.get(id as usize).copied()
    }

    /// Outgoing links of `id`, the fan-out set of its transmissions.
    pub fn gains_from(&self, id: NodeId) -> &[GainEntry] {
        &self.gains[id as usize]
    }

    pub fn noise(&self, id: NodeId) -> &NoiseEntry {
        &self.noise[id as usize]
    }
}

fn parse_coordinates(text: &str) -> Result<Vec<(i32, i32)>, TopologyError> {
    let mut coords = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = |reason: &str| TopologyError::Malformed {
            file: TopologyFile::Coordinates,
            line: idx + 1,
            reason: reason.to_string(),
        };

        let mut parts = line.splitn(2, ',');
        let x = parts
            .next()
            .ok_or_else(|| malformed("expected `x,y`"))?
            .trim()
            .parse::<i32>()
            .map_err(|_| malformed("x is not a signed integer"))?;
        let y = parts
            .next()
            .ok_or_else(|| malformed("expected `x,y`"))?
            .trim()
            .parse::<i32>()
            .map_err(|_| malformed("y is not a signed integer"))?;

        coords.push((x, y));
    }

    Ok(coords)
}

fn parse_links(
    text: &str,
    gains: &mut [Vec<GainEntry>],
    noise: &mut [Option<NoiseEntry>],
) -> Result<(), TopologyError> {
    let n = gains.len() as u32;

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let lineno = idx + 1;
        let malformed = |reason: String| TopologyError::Malformed {
            file: TopologyFile::Links,
            line: lineno,
            reason,
        };

        let mut fields = line.split_whitespace();
        let keyword = fields.next().unwrap_or("");

        match keyword {
            "gain" => {
                let src = parse_field::<u32>(fields.next(), "src", lineno)?;
                let sink = parse_field::<u32>(fields.next(), "sink", lineno)?;
                let dbm = parse_field::<f64>(fields.next(), "gain_dBm", lineno)?;

                if src >= n {
                    return Err(TopologyError::UnknownNode {
                        file: TopologyFile::Links,
                        line: lineno,
                        id: src,
                    });
                }
                if sink >= n {
                    return Err(TopologyError::UnknownNode {
                        file: TopologyFile::Links,
                        line: lineno,
                        id: sink,
                    });
                }
                if src == sink {
                    return Err(malformed(format!("self-link on node {}", src)));
                }

                gains[src as usize].push(GainEntry {
                    sink: sink as NodeId,
                    gain_dbm: dbm,
                });
            }
            "noise" => {
                let id = parse_field::<u32>(fields.next(), "node", lineno)?;
                let floor = parse_field::<f64>(fields.next(), "noise_floor", lineno)?;
                let range = parse_field::<f64>(fields.next(), "white_noise_range", lineno)?;

                if id >= n {
                    return Err(TopologyError::UnknownNode {
                        file: TopologyFile::Links,
                        line: lineno,
                        id,
                    });
                }

                noise[id as usize] = Some(NoiseEntry {
                    floor_dbm: floor,
                    range_dbm: range,
                });
            }
            other => {
                return Err(malformed(format!("unknown keyword `{}`", other)));
            }
        }

        if let Some(extra) = fields.next() {
            return Err(malformed(format!("trailing field `{}`", extra)));
        }
    }

    Ok(())
}

fn parse_field<T: std::str::FromStr>(
    field: Option<&str>,
    name: &str,
    line: usize,
) -> Result<T, TopologyError> {
    field
        .ok_or_else(|| TopologyError::Malformed {
            file: TopologyFile::Links,
            line,
            reason: format!("missing field `{}`", name),
        })?
        .parse::<T>()
        .map_err(|_| TopologyError::Malformed {
            file: TopologyFile::Links,
            line,
            reason: format!("field `{}` is not a number", name),
        })
}
