//! Turns plotter-style "move to / draw to" calls into compact [`PathSegment`]s.

use std::sync::Arc;

use slicelink_common::{
    ExtruderIndex, IntPoint, LayerIndex, PathSegment, PrintFeatureType, error::BridgeError,
    int_to_mm,
};
use tracing::{error, trace};

/// Receives the paths a [`PathAccumulator`] flushes.
pub trait FlushSink {
    /// Takes ownership of a finished path for `layer`.
    fn deliver(&self, layer: LayerIndex, path: PathSegment);
}

impl<S: FlushSink + ?Sized> FlushSink for &S {
    fn deliver(&self, layer: LayerIndex, path: PathSegment) {
        (**self).deliver(layer, path)
    }
}

impl<S: FlushSink + ?Sized> FlushSink for Arc<S> {
    fn deliver(&self, layer: LayerIndex, path: PathSegment) {
        (**self).deliver(layer, path)
    }
}

/// Buffers one continuous path for one (layer, extruder) context.
///
/// Coordinates are converted to millimetres as they are buffered. Changing
/// the layer or extruder flushes the buffer to the sink first. Not thread
/// safe: concurrent producers each use their own accumulator.
///
/// Call [`PathAccumulator::finish`] when done. Dropping an accumulator that
/// still holds segments flushes them too, but logs it as a contract violation.
pub struct PathAccumulator<S: FlushSink> {
    sink: S,
    layer: LayerIndex,
    extruder: ExtruderIndex,
    path: PathSegment,
    last_point: IntPoint,
    flushes: usize,
}

impl<S: FlushSink> std::fmt::Debug for PathAccumulator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathAccumulator")
            .field("layer", &self.layer)
            .field("extruder", &self.extruder)
            .field("segments", &self.path.segment_count())
            .field("flushes", &self.flushes)
            .finish()
    }
}

impl<S: FlushSink> PathAccumulator<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            layer: 0,
            extruder: 0,
            path: PathSegment::new(0),
            last_point: IntPoint::default(),
            flushes: 0,
        }
    }

    pub fn layer(&self) -> LayerIndex {
        self.layer
    }

    pub fn extruder(&self) -> ExtruderIndex {
        self.extruder
    }

    /// The buffered, not yet flushed path.
    pub fn pending(&self) -> &PathSegment {
        &self.path
    }

    /// Number of flushes that delivered a path so far.
    pub fn flush_count(&self) -> usize {
        self.flushes
    }

    /// Selects the layer the following paths belong to.
    pub fn set_layer(&mut self, layer: LayerIndex) {
        if self.layer != layer {
            self.flush();
            self.layer = layer;
        }
    }

    /// Selects the extruder printing the following paths.
    pub fn set_extruder(&mut self, extruder: ExtruderIndex) {
        if self.extruder != extruder {
            self.flush();
            self.extruder = extruder;
            self.path.extruder = extruder;
        }
    }

    /// Moves the pen to `point`.
    ///
    /// Starts the path if nothing is buffered; otherwise a move to a new
    /// position is recorded as a zero-width travel segment.
    pub fn move_to(&mut self, point: IntPoint) {
        if self.path.points.is_empty() {
            self.start_at(point);
        } else if point != self.last_point {
            self.push_line(PrintFeatureType::NoneType, point, 0, 0, 0.0);
        }
    }

    /// Draws a line from the current pen position to `point`.
    ///
    /// `width` and `thickness` are in engine units, `feedrate` in mm/s.
    pub fn draw_to(
        &mut self,
        feature: PrintFeatureType,
        point: IntPoint,
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        if self.path.points.is_empty() {
            self.start_at(self.last_point);
        }
        self.push_line(feature, point, width, thickness, feedrate);
    }

    /// Draws the closed outline of `points`.
    pub fn draw_polygon(
        &mut self,
        feature: PrintFeatureType,
        points: &[IntPoint],
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        let Some((&first, rest)) = points.split_first() else {
            return;
        };
        self.move_to(first);
        for &point in rest {
            self.draw_to(feature, point, width, thickness, feedrate);
        }
        self.draw_to(feature, first, width, thickness, feedrate);
    }

    /// Hands the buffered path to the sink. Returns false if nothing was buffered.
    pub fn flush(&mut self) -> bool {
        if self.path.is_empty() {
            self.path.points.clear();
            return false;
        }
        let path = std::mem::replace(&mut self.path, PathSegment::new(self.extruder));
        trace!(
            "Flushing {} segments for layer {} extruder {}",
            path.segment_count(),
            self.layer,
            self.extruder
        );
        self.sink.deliver(self.layer, path);
        self.flushes += 1;
        true
    }

    /// Flushes what is left and tears the accumulator down.
    pub fn finish(mut self) -> bool {
        self.flush()
    }

    fn start_at(&mut self, point: IntPoint) {
        self.path.points.push(point.to_mm());
        self.last_point = point;
    }

    fn push_line(
        &mut self,
        feature: PrintFeatureType,
        point: IntPoint,
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        self.path.push_line(
            feature,
            point.to_mm(),
            int_to_mm(width),
            int_to_mm(thickness),
            feedrate,
        );
        self.last_point = point;
    }
}

impl<S: FlushSink> Drop for PathAccumulator<S> {
    fn drop(&mut self) {
        if self.path.is_empty() {
            return;
        }
        let violation = BridgeError::UnflushedDataLoss {
            layer: self.layer,
            extruder: self.extruder,
            segments: self.path.segment_count(),
        };
        error!("{}, flushing on drop", violation);
        self.flush();
    }
}
