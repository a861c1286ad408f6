#![deny(
    trivial_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

/*!
Streams the output of a running slicer to a front-end.

Slicing workers finish layers in whatever order the worker pool schedules
them. The front-end, however, draws layers as they arrive and expects them in
ascending order. A [`CommunicationSession`] sits between the two: workers
trace tool paths into a [`PathAccumulator`], publish finished layers into a
[`LayerStore`], and the session forwards each layer as soon as every layer
below it has gone out.

```rust,no_run
use slicelink::{BridgeSettings, CommunicationSession, IntPoint, Job, JobId, PrintFeatureType};
use slicelink::error::BridgeError;

let (session, messages) = CommunicationSession::open(BridgeSettings::default());
let job = JobId::new(1);
session.enqueue_job(Job::with_layer_range(job, 0..2))?;

std::thread::scope(|s| {
    for layer in [1, 0] {
        let session = &session;
        s.spawn(move || -> Result<(), BridgeError> {
            let mut paths = session.path_accumulator();
            paths.set_layer(layer);
            paths.move_to(IntPoint::new(0, 0));
            paths.draw_to(PrintFeatureType::OuterWall, IntPoint::new(10_000, 0), 400, 200, 30.0);
            paths.finish();
            session.finalize_layer(job, layer)
        });
    }
});

session.finish_job(job)?;
session.close()?;
// `messages` now holds JobAccepted, layer 0, layer 1 and SlicingFinished.
# drop(messages);
# Ok::<(), BridgeError>(())
```

With the `tcp` feature, [`tcp::TcpTransport`] forwards the outbound channel to
a front-end socket.
*/

mod accumulator;
mod job;
/// Deduplication of progress notifications.
pub mod progress;
mod session;
mod settings;
mod staging;
mod store;

pub use accumulator::{FlushSink, PathAccumulator};
pub use job::{Job, JobState};
pub use progress::ProgressReporter;
pub use session::{CommunicationSession, SessionAccumulator};
pub use settings::BridgeSettings;
pub use staging::LayerStaging;
pub use store::LayerStore;

pub use async_channel;
pub use slicelink_common::*;

#[cfg(feature = "tcp")]
/// Sends the outbound stream to a front-end over TCP.
pub mod tcp;
