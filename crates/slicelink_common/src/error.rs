use thiserror::Error;

use crate::{ExtruderIndex, JobId, LayerIndex};

/// Everything that can go wrong between the slicing pipeline and the front-end.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An outbound write was attempted after shutdown, or the consumer went away.
    #[error("outbound channel is closed")]
    ChannelClosed,
    /// A layer index was published twice.
    #[error("layer {layer} was already finalized")]
    OutOfOrderInsert { layer: LayerIndex },
    /// A path accumulator was torn down while still holding segments.
    #[error(
        "path accumulator dropped with {segments} unflushed segments (layer {layer}, extruder {extruder})"
    )]
    UnflushedDataLoss {
        layer: LayerIndex,
        extruder: ExtruderIndex,
        segments: usize,
    },
    /// A job was submitted to a session that is already closed.
    #[error("session is closed, job rejected")]
    SessionClosed,
    /// The job is not the one currently being sliced.
    #[error("{0} is not the active job")]
    UnknownJob(JobId),
    /// The layer does not belong to the job.
    #[error("layer {layer} is not part of {job}")]
    UnknownLayer { job: JobId, layer: LayerIndex },
    /// The job was finished before every layer had been sent.
    #[error("{job} finished with {missing} layers still unsent")]
    IncompleteJob { job: JobId, missing: usize },
    /// Encoding or decoding a packet failed.
    #[error("could not serialize or deserialize packet")]
    Serialization,
    /// A frame exceeded the configured maximum packet length.
    #[error("packet of {len} bytes exceeds the limit of {max} bytes")]
    PacketTooLarge { len: usize, max: usize },
    /// Connecting to the front-end failed.
    #[error("could not connect to front-end: {0}")]
    Connection(#[source] std::io::Error),
    /// Reading or writing the transport failed.
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
