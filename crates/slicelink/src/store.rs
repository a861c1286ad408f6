use std::fmt::Debug;
use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use slicelink_common::{LayerIndex, error::BridgeError};
use tracing::{error, trace};

/// Finalized layer messages keyed by layer index.
///
/// Workers publish layers in whatever order they finish them. Once a layer is
/// in the store it never changes, so readers either see the whole message or
/// nothing.
pub struct LayerStore<M> {
    layers: DashMap<LayerIndex, Arc<M>>,
}

impl<M> Debug for LayerStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LayerStore [{} layers]", self.layers.len())
    }
}

impl<M> Default for LayerStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> LayerStore<M> {
    pub fn new() -> Self {
        Self {
            layers: DashMap::new(),
        }
    }

    /// Stores the finalized message for `layer`.
    ///
    /// Different layers may be inserted from different threads at the same
    /// time. A second insert for the same layer is refused and the stored
    /// message is kept.
    pub fn insert(&self, layer: LayerIndex, message: M) -> Result<(), BridgeError> {
        match self.layers.entry(layer) {
            Entry::Occupied(_) => {
                error!("Layer {} was finalized twice, keeping the first message", layer);
                Err(BridgeError::OutOfOrderInsert { layer })
            }
            Entry::Vacant(slot) => {
                trace!("Stored layer {}", layer);
                slot.insert(Arc::new(message));
                Ok(())
            }
        }
    }

    /// The message for `layer`, or `None` if it is not finalized yet. Never blocks
    /// on other layers.
    pub fn get(&self, layer: LayerIndex) -> Option<Arc<M>> {
        self.layers.get(&layer).map(|entry| Arc::clone(entry.value()))
    }

    /// True once `layer` has been inserted.
    #[inline(always)]
    pub fn is_complete(&self, layer: LayerIndex) -> bool {
        self.layers.contains_key(&layer)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Drops every stored layer.
    pub fn clear(&self) {
        self.layers.clear();
    }
}
