pub mod messages;
pub use messages::*;

pub mod codec;

pub mod error;

use serde::{Deserialize, Serialize};

use std::fmt::Debug;
use std::fmt::Display;

/// Index of a layer. Raft and support layers below the model may be negative.
pub type LayerIndex = i32;

/// Index of an extruder train.
pub type ExtruderIndex = i32;

/// Number of engine units (micrometres) in one millimetre.
pub const UNITS_PER_MM: f32 = 1000.0;

/// Converts an engine integer length (micrometres) to millimetres.
#[inline]
pub fn int_to_mm(value: i64) -> f32 {
    value as f32 / UNITS_PER_MM
}

#[derive(Serialize, Deserialize, Clone)]
/// [`NetworkPacket`]s are untyped packets to be sent over the wire
///
/// The packet carries the full type name of the payload (for debugging) and
/// a schema hash of the short type name, so a front-end can route it without
/// knowing the module layout of the engine.
pub struct NetworkPacket {
    /// Full type name including module path
    /// Example: "slicelink_common::messages::OptimizedLayer"
    pub type_name: String,
    /// Schema hash computed from the short type name
    pub schema_hash: u64,
    /// The serialized message data from bincode
    pub data: Vec<u8>,
}

impl Debug for NetworkPacket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPacket")
            .field("type_name", &self.type_name)
            .field("schema_hash", &format_args!("0x{:016x}", self.schema_hash))
            .field("data_len", &self.data.len())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Default)]
/// A [`JobId`] denotes one group of meshes sliced together
pub struct JobId {
    /// The key of the job.
    pub id: u32,
}

impl JobId {
    /// Creates a job id from its raw key.
    pub const fn new(id: u32) -> Self {
        Self { id }
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Job with ID={0}", self.id))
    }
}

/// A point in the engine's integer coordinate space (micrometres).
#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub struct IntPoint {
    pub x: i64,
    pub y: i64,
}

impl IntPoint {
    pub const fn new(x: i64, y: i64) -> Self {
        Self { x, y }
    }

    /// Converts to physical units.
    pub fn to_mm(self) -> PointMm {
        PointMm {
            x: int_to_mm(self.x),
            y: int_to_mm(self.y),
        }
    }
}

/// A point in millimetres, as it crosses the wire.
#[derive(Serialize, Deserialize, PartialEq, Clone, Copy, Debug, Default)]
pub struct PointMm {
    pub x: f32,
    pub y: f32,
}

impl PointMm {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_micrometres_to_millimetres() {
        assert_eq!(int_to_mm(1500), 1.5);
        assert_eq!(IntPoint::new(-2000, 250).to_mm(), PointMm::new(-2.0, 0.25));
    }

    #[test]
    fn packet_debug_hides_payload() {
        let packet = NetworkPacket {
            type_name: "Progress".to_string(),
            schema_hash: 0xab,
            data: vec![0; 32],
        };
        let text = format!("{:?}", packet);
        assert!(text.contains("data_len: 32"));
        assert!(text.contains("0x00000000000000ab"));
    }
}
