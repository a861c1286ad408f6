use std::ops::Range;
use std::sync::Arc;

use slicelink_common::{JobId, LayerIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting behind another job.
    Queued,
    /// Front of the queue; its layers are being streamed.
    Slicing,
    Done,
}

/// One group of meshes sliced together, with the layers it will produce.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    layers: Arc<[LayerIndex]>,
    state: JobState,
}

impl Job {
    /// Creates a job producing `layers`. Order and duplicates do not matter;
    /// layers are always emitted in ascending index order.
    pub fn new(id: JobId, layers: impl IntoIterator<Item = LayerIndex>) -> Self {
        let mut layers: Vec<LayerIndex> = layers.into_iter().collect();
        layers.sort_unstable();
        layers.dedup();
        Self {
            id,
            layers: layers.into(),
            state: JobState::Queued,
        }
    }

    /// Creates a job producing every layer in `range`.
    pub fn with_layer_range(id: JobId, range: Range<LayerIndex>) -> Self {
        Self::new(id, range)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Layer indices in emission order.
    pub fn layers(&self) -> &[LayerIndex] {
        &self.layers
    }

    pub(crate) fn shared_layers(&self) -> Arc<[LayerIndex]> {
        Arc::clone(&self.layers)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn contains_layer(&self, layer: LayerIndex) -> bool {
        self.layers.binary_search(&layer).is_ok()
    }
}
