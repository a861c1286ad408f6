use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::BridgeError;
use crate::{ExtruderIndex, IntPoint, JobId, LayerIndex, NetworkPacket, PointMm, int_to_mm};

static SHORT_NAMES: OnceLock<Mutex<HashMap<TypeId, &'static str>>> = OnceLock::new();
static SCHEMA_HASHES: OnceLock<Mutex<HashMap<TypeId, u64>>> = OnceLock::new();

fn cached<V: Copy>(
    cache: &'static OnceLock<Mutex<HashMap<TypeId, V>>>,
    key: TypeId,
    make: impl FnOnce() -> V,
) -> V {
    let cache = cache.get_or_init(|| Mutex::new(HashMap::new()));
    let mut guard = cache.lock().unwrap_or_else(PoisonError::into_inner);
    *guard.entry(key).or_insert_with(make)
}

/// Message that can cross the wire to the front-end.
///
/// Implemented for every `Serialize + DeserializeOwned + Send + Sync + 'static`
/// type. The schema hash is computed from the short type name, so it stays
/// stable when the type moves between modules.
pub trait WireMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Full type name, including the module path.
    fn type_name() -> &'static str {
        type_name::<Self>()
    }

    /// Just the type name, without module path.
    ///
    /// Example: `"OptimizedLayer"` (from `"slicelink_common::messages::OptimizedLayer"`)
    fn short_name() -> &'static str {
        cached(&SHORT_NAMES, TypeId::of::<Self>(), || {
            let full = Self::type_name();
            full.rsplit("::").next().unwrap_or(full)
        })
    }

    /// Hash of [`WireMessage::short_name`].
    fn schema_hash() -> u64 {
        cached(&SCHEMA_HASHES, TypeId::of::<Self>(), || {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            Self::short_name().hash(&mut hasher);
            hasher.finish()
        })
    }
}

impl<T> WireMessage for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl NetworkPacket {
    /// Wraps a message into an untyped packet.
    pub fn from_message<T: WireMessage>(message: &T) -> Result<Self, BridgeError> {
        Ok(Self {
            type_name: T::type_name().to_string(),
            schema_hash: T::schema_hash(),
            data: bincode::serde::encode_to_vec(message, bincode::config::standard())
                .map_err(|_| BridgeError::Serialization)?,
        })
    }

    /// True if this packet carries a `T`.
    pub fn is<T: WireMessage>(&self) -> bool {
        self.type_name == T::type_name() || self.schema_hash == T::schema_hash()
    }

    /// Decodes the payload as a `T`.
    pub fn decode_message<T: WireMessage>(&self) -> Result<T, BridgeError> {
        if !self.is::<T>() {
            return Err(BridgeError::Serialization);
        }
        bincode::serde::decode_from_slice(&self.data, bincode::config::standard())
            .map(|(message, _)| message)
            .map_err(|_| BridgeError::Serialization)
    }
}

/// Functional category of a printed line segment.
///
/// The discriminants are part of the front-end contract and fit in one byte.
#[derive(Serialize, Deserialize, Hash, PartialEq, Eq, Clone, Copy, Debug, Default)]
#[repr(u8)]
pub enum PrintFeatureType {
    /// Travel or any other non-printing move.
    #[default]
    NoneType = 0,
    OuterWall = 1,
    InnerWall = 2,
    Skin = 3,
    Support = 4,
    SkirtBrim = 5,
    Infill = 6,
    SupportInfill = 7,
    MoveCombing = 8,
    MoveRetraction = 9,
    SupportInterface = 10,
    PrimeTower = 11,
}

/// One continuous path on one extruder.
///
/// Segment `i` runs from `points[i]` to `points[i + 1]`; the four attribute
/// vectors are one shorter than `points`.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PathSegment {
    pub extruder: ExtruderIndex,
    pub points: Vec<PointMm>,
    pub line_type: Vec<PrintFeatureType>,
    pub line_width: Vec<f32>,
    pub line_thickness: Vec<f32>,
    pub line_feedrate: Vec<f32>,
}

impl PathSegment {
    pub fn new(extruder: ExtruderIndex) -> Self {
        Self {
            extruder,
            ..Default::default()
        }
    }

    /// Number of line segments in the path.
    pub fn segment_count(&self) -> usize {
        self.line_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.line_type.is_empty()
    }

    /// Appends a line from the current end point to `to`.
    pub fn push_line(
        &mut self,
        line_type: PrintFeatureType,
        to: PointMm,
        width: f32,
        thickness: f32,
        feedrate: f32,
    ) {
        self.points.push(to);
        self.line_type.push(line_type);
        self.line_width.push(width);
        self.line_thickness.push(thickness);
        self.line_feedrate.push(feedrate);
    }

    /// Appends `other` to the end of this path, inserting a travel move when
    /// `other` does not start where this path ends.
    pub fn extend_path(&mut self, other: PathSegment) {
        let Some((&start, rest)) = other.points.split_first() else {
            return;
        };
        match self.points.last() {
            None => self.points.push(start),
            Some(&end) if end != start => {
                self.push_line(PrintFeatureType::NoneType, start, 0.0, 0.0, 0.0)
            }
            Some(_) => {}
        }
        self.points.extend_from_slice(rest);
        self.line_type.extend(other.line_type);
        self.line_width.extend(other.line_width);
        self.line_thickness.extend(other.line_thickness);
        self.line_feedrate.extend(other.line_feedrate);
    }
}

/// A closed polygon of the unoptimized layer data.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct Polygon {
    pub line_type: PrintFeatureType,
    pub points: Vec<PointMm>,
    pub line_width: f32,
    pub line_thickness: f32,
    pub line_feedrate: f32,
}

/// Unoptimized layer data, as produced by the slicing stage.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct Layer {
    pub id: LayerIndex,
    /// Z of the top of the layer, millimetres.
    pub height: f32,
    /// Millimetres.
    pub thickness: f32,
    pub polygons: Vec<Polygon>,
}

impl Layer {
    pub fn new(id: LayerIndex) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Sets height and thickness from engine units.
    pub fn with_dimensions(mut self, height: i64, thickness: i64) -> Self {
        self.height = int_to_mm(height);
        self.thickness = int_to_mm(thickness);
        self
    }

    /// Adds a polygon given in engine units.
    pub fn push_polygon(
        &mut self,
        line_type: PrintFeatureType,
        points: &[IntPoint],
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        if points.is_empty() {
            return;
        }
        self.polygons.push(Polygon {
            line_type,
            points: points.iter().map(|p| p.to_mm()).collect(),
            line_width: int_to_mm(width),
            line_thickness: int_to_mm(thickness),
            line_feedrate: feedrate,
        });
    }
}

/// Layer data after path optimization: the actual tool paths in print order.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct LayerOptimized {
    pub id: LayerIndex,
    pub height: f32,
    pub thickness: f32,
    pub path_segments: Vec<PathSegment>,
}

impl LayerOptimized {
    pub fn new(id: LayerIndex) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Total number of line segments over all paths.
    pub fn segment_count(&self) -> usize {
        self.path_segments.iter().map(PathSegment::segment_count).sum()
    }
}

/// Sent once a job has been queued.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct JobAccepted {
    pub job_id: JobId,
    pub layer_count: usize,
}

/// Unoptimized data for one layer of a job.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct RawLayer {
    pub job_id: JobId,
    pub layer: Arc<Layer>,
}

/// Optimized tool paths for one layer of a job.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct OptimizedLayer {
    pub job_id: JobId,
    pub layer: Arc<LayerOptimized>,
}

/// Slicing progress in permille.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub struct Progress {
    pub permille: u16,
}

/// Header of the generated G-code, sent once its placeholders are known.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct GCodePrefix {
    pub job_id: JobId,
    pub text: String,
}

/// A chunk of generated G-code text.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub struct GCodeChunk {
    pub job_id: JobId,
    pub text: String,
}

/// Estimated print time per feature and material use per extruder.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct PrintEstimates {
    pub job_id: JobId,
    /// Seconds spent on each feature type.
    pub time_per_feature: Vec<(PrintFeatureType, f32)>,
    /// Filament volume in mm³, indexed by extruder.
    pub material_per_extruder: Vec<f32>,
}

/// Terminal marker: nothing more will be sent for this job.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub struct SlicingFinished {
    pub job_id: JobId,
}

/// Everything the bridge sends to the front-end, in emission order.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug)]
pub enum BridgeMessage {
    JobAccepted(JobAccepted),
    RawLayer(RawLayer),
    OptimizedLayer(OptimizedLayer),
    Progress(Progress),
    GCodePrefix(GCodePrefix),
    GCodeChunk(GCodeChunk),
    PrintEstimates(PrintEstimates),
    SlicingFinished(SlicingFinished),
}

impl BridgeMessage {
    /// Wraps the payload in a [`NetworkPacket`] named after the payload type.
    pub fn to_packet(&self) -> Result<NetworkPacket, BridgeError> {
        match self {
            BridgeMessage::JobAccepted(m) => NetworkPacket::from_message(m),
            BridgeMessage::RawLayer(m) => NetworkPacket::from_message(m),
            BridgeMessage::OptimizedLayer(m) => NetworkPacket::from_message(m),
            BridgeMessage::Progress(m) => NetworkPacket::from_message(m),
            BridgeMessage::GCodePrefix(m) => NetworkPacket::from_message(m),
            BridgeMessage::GCodeChunk(m) => NetworkPacket::from_message(m),
            BridgeMessage::PrintEstimates(m) => NetworkPacket::from_message(m),
            BridgeMessage::SlicingFinished(m) => NetworkPacket::from_message(m),
        }
    }

    /// Reverses [`BridgeMessage::to_packet`].
    pub fn from_packet(packet: &NetworkPacket) -> Result<Self, BridgeError> {
        if packet.is::<JobAccepted>() {
            packet.decode_message().map(BridgeMessage::JobAccepted)
        } else if packet.is::<RawLayer>() {
            packet.decode_message().map(BridgeMessage::RawLayer)
        } else if packet.is::<OptimizedLayer>() {
            packet.decode_message().map(BridgeMessage::OptimizedLayer)
        } else if packet.is::<Progress>() {
            packet.decode_message().map(BridgeMessage::Progress)
        } else if packet.is::<GCodePrefix>() {
            packet.decode_message().map(BridgeMessage::GCodePrefix)
        } else if packet.is::<GCodeChunk>() {
            packet.decode_message().map(BridgeMessage::GCodeChunk)
        } else if packet.is::<PrintEstimates>() {
            packet.decode_message().map(BridgeMessage::PrintEstimates)
        } else if packet.is::<SlicingFinished>() {
            packet.decode_message().map(BridgeMessage::SlicingFinished)
        } else {
            Err(BridgeError::Serialization)
        }
    }

    /// The job this message belongs to, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            BridgeMessage::JobAccepted(m) => Some(m.job_id),
            BridgeMessage::RawLayer(m) => Some(m.job_id),
            BridgeMessage::OptimizedLayer(m) => Some(m.job_id),
            BridgeMessage::Progress(_) => None,
            BridgeMessage::GCodePrefix(m) => Some(m.job_id),
            BridgeMessage::GCodeChunk(m) => Some(m.job_id),
            BridgeMessage::PrintEstimates(m) => Some(m.job_id),
            BridgeMessage::SlicingFinished(m) => Some(m.job_id),
        }
    }
}
