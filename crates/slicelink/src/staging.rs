use dashmap::DashMap;
use slicelink_common::{LayerIndex, LayerOptimized, PathSegment, int_to_mm};
use tracing::trace;

use crate::accumulator::FlushSink;

/// Optimized layers still being assembled from accumulator flushes.
///
/// Nothing here is visible to the front-end until the session moves the
/// layer into its [`LayerStore`](crate::LayerStore).
#[derive(Debug, Default)]
pub struct LayerStaging {
    layers: DashMap<LayerIndex, LayerOptimized>,
}

impl LayerStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records height and thickness (engine units) for `layer`.
    pub fn set_dimensions(&self, layer: LayerIndex, height: i64, thickness: i64) {
        let mut staged = self
            .layers
            .entry(layer)
            .or_insert_with(|| LayerOptimized::new(layer));
        staged.height = int_to_mm(height);
        staged.thickness = int_to_mm(thickness);
    }

    /// Removes and returns the staged layer, or an empty one if nothing was
    /// drawn on it.
    pub fn take(&self, layer: LayerIndex) -> LayerOptimized {
        self.take_staged(layer)
            .unwrap_or_else(|| LayerOptimized::new(layer))
    }

    /// Removes and returns the staged layer, if any.
    pub fn take_staged(&self, layer: LayerIndex) -> Option<LayerOptimized> {
        self.layers.remove(&layer).map(|(_, staged)| staged)
    }

    pub fn is_staged(&self, layer: LayerIndex) -> bool {
        self.layers.contains_key(&layer)
    }

    pub fn clear(&self) {
        self.layers.clear();
    }
}

impl FlushSink for LayerStaging {
    /// Appends `path` to the layer's last path when it is on the same
    /// extruder, otherwise starts a new path.
    fn deliver(&self, layer: LayerIndex, path: PathSegment) {
        let mut staged = self
            .layers
            .entry(layer)
            .or_insert_with(|| LayerOptimized::new(layer));
        trace!(
            "Staging {} segments on layer {} ({} paths staged)",
            path.segment_count(),
            layer,
            staged.path_segments.len()
        );
        match staged.path_segments.last_mut() {
            Some(last) if last.extruder == path.extruder => last.extend_path(path),
            _ => staged.path_segments.push(path),
        }
    }
}
