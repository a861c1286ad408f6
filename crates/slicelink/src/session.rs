use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender, TrySendError, bounded};
use async_io::Timer;
use futures_lite::{FutureExt, future};
use slicelink_common::{
    BridgeMessage, ExtruderIndex, GCodeChunk, GCodePrefix, IntPoint, JobAccepted, JobId, Layer,
    LayerIndex, LayerOptimized, OptimizedLayer, PrintEstimates, PrintFeatureType, Progress,
    RawLayer, SlicingFinished, error::BridgeError,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    BridgeSettings, Job, JobState, LayerStore, PathAccumulator, ProgressReporter,
    progress::fraction_to_permille, staging::LayerStaging,
};

/// Accumulator type handed out by [`CommunicationSession::path_accumulator`].
pub type SessionAccumulator = PathAccumulator<Arc<LayerStaging>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Position of the emission drain within the active job's layer list.
#[derive(Debug, Default)]
struct EmitCursor {
    job: Option<JobId>,
    raw_next: usize,
    optimized_next: usize,
}

impl EmitCursor {
    fn for_job(job: JobId) -> Self {
        Self {
            job: Some(job),
            ..Default::default()
        }
    }
}

/// How long a write to the outbound channel may wait for room.
#[derive(Clone, Copy, Debug)]
enum Wait {
    /// Only what fits right now.
    Never,
    Forever,
    Until(Instant),
}

enum Delivery {
    Sent,
    Full(BridgeMessage),
}

/// State shared between the session handle and its drain thread.
struct Shared {
    settings: BridgeSettings,
    jobs: Mutex<VecDeque<Job>>,
    raw_layers: LayerStore<Layer>,
    optimized_layers: LayerStore<LayerOptimized>,
    staging: Arc<LayerStaging>,
    paths: Mutex<SessionAccumulator>,
    progress: ProgressReporter,
    outbox: Mutex<VecDeque<BridgeMessage>>,
    cursor: Mutex<EmitCursor>,
    drain_requested: AtomicBool,
    gcode: Mutex<String>,
    outbound: Sender<BridgeMessage>,
    wake: Sender<()>,
    abort: Sender<()>,
    abort_signal: Receiver<()>,
    closed: AtomicBool,
}

/// The bridge between one slicing run and one front-end.
///
/// Slicing workers publish layers in any order; the session hands them to
/// the outbound channel in ascending layer order, per variant, as soon as
/// every lower layer of the active job has gone out.
///
/// A worker that publishes a layer sends whatever fits in the channel and
/// returns. Waiting for room happens on the session's own drain thread, so
/// a slow front-end never holds up geometry work.
pub struct CommunicationSession {
    shared: Arc<Shared>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for CommunicationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CommunicationSession [{} pending jobs, {} optimized layers stored{}]",
            lock(&self.shared.jobs).len(),
            self.shared.optimized_layers.len(),
            if self.is_closed() { ", closed" } else { "" }
        )
    }
}

impl CommunicationSession {
    /// Opens a session together with the receiving end of its outbound channel.
    pub fn open(settings: BridgeSettings) -> (Self, Receiver<BridgeMessage>) {
        let (outbound, messages) = bounded(settings.channel_capacity.max(1));
        (Self::open_with_channel(settings, outbound), messages)
    }

    /// Opens a session that writes into an existing channel.
    pub fn open_with_channel(settings: BridgeSettings, outbound: Sender<BridgeMessage>) -> Self {
        let staging = Arc::new(LayerStaging::new());
        let (abort, abort_signal) = bounded(1);
        let (wake, wake_signal) = bounded(1);
        debug!("Opened session with {:?}", settings);
        let shared = Arc::new(Shared {
            settings,
            jobs: Mutex::new(VecDeque::new()),
            raw_layers: LayerStore::new(),
            optimized_layers: LayerStore::new(),
            paths: Mutex::new(PathAccumulator::new(Arc::clone(&staging))),
            staging,
            progress: ProgressReporter::new(),
            outbox: Mutex::new(VecDeque::new()),
            cursor: Mutex::new(EmitCursor::default()),
            drain_requested: AtomicBool::new(false),
            gcode: Mutex::new(String::new()),
            outbound,
            wake,
            abort,
            abort_signal,
            closed: AtomicBool::new(false),
        });

        let drain_shared = Arc::clone(&shared);
        let drain_thread = std::thread::Builder::new()
            .name("slicelink-drain".to_string())
            .spawn(move || run_drain(&drain_shared, &wake_signal));
        let drain_thread = match drain_thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Dropping the closure closed the wake channel; workers
                // fall back to blocking sends.
                error!("Could not start drain thread, sending inline: {}", err);
                None
            }
        };

        Self {
            shared,
            drain_thread: Mutex::new(drain_thread),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.shared.settings
    }

    #[inline(always)]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// True while there are jobs left to slice.
    pub fn has_pending_work(&self) -> bool {
        !lock(&self.shared.jobs).is_empty()
    }

    /// The job whose layers are currently being streamed.
    pub fn active_job(&self) -> Option<JobId> {
        lock(&self.shared.jobs).front().map(Job::id)
    }

    /// Queues a job and acknowledges it to the front-end.
    pub fn enqueue_job(&self, mut job: Job) -> Result<(), BridgeError> {
        if self.is_closed() {
            warn!("Rejecting {} because the session is closed", job.id());
            return Err(BridgeError::SessionClosed);
        }
        let accepted = JobAccepted {
            job_id: job.id(),
            layer_count: job.layer_count(),
        };
        {
            let mut jobs = lock(&self.shared.jobs);
            if jobs.is_empty() {
                job.set_state(JobState::Slicing);
            }
            info!("Queued {} with {} layers", job.id(), job.layer_count());
            jobs.push_back(job);
        }
        self.shared.queue(BridgeMessage::JobAccepted(accepted))
    }

    /// Sends a progress update if `permille` is higher than anything sent so far.
    ///
    /// Returns whether an update was queued.
    pub fn report_progress(&self, permille: u16) -> Result<bool, BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        {
            // accepting and queueing under one lock keeps the stream increasing
            let mut outbox = lock(&self.shared.outbox);
            if !self.shared.progress.offer(permille) {
                return Ok(false);
            }
            outbox.push_back(BridgeMessage::Progress(Progress { permille }));
        }
        self.shared.request_drain()?;
        Ok(true)
    }

    /// [`report_progress`](Self::report_progress) for a fraction in `0.0..=1.0`.
    pub fn report_progress_fraction(&self, fraction: f32) -> Result<bool, BridgeError> {
        self.report_progress(fraction_to_permille(fraction))
    }

    /// Hands out an accumulator for a concurrent producer. Its flushes land in
    /// the same staging area as the session's own accumulator.
    pub fn path_accumulator(&self) -> SessionAccumulator {
        PathAccumulator::new(Arc::clone(&self.shared.staging))
    }

    pub fn set_layer(&self, layer: LayerIndex) {
        lock(&self.shared.paths).set_layer(layer);
    }

    pub fn set_extruder(&self, extruder: ExtruderIndex) {
        lock(&self.shared.paths).set_extruder(extruder);
    }

    pub fn move_to(&self, point: IntPoint) {
        lock(&self.shared.paths).move_to(point);
    }

    pub fn draw_to(
        &self,
        feature: PrintFeatureType,
        point: IntPoint,
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        lock(&self.shared.paths).draw_to(feature, point, width, thickness, feedrate);
    }

    pub fn draw_polygon(
        &self,
        feature: PrintFeatureType,
        points: &[IntPoint],
        width: i64,
        thickness: i64,
        feedrate: f32,
    ) {
        lock(&self.shared.paths).draw_polygon(feature, points, width, thickness, feedrate);
    }

    /// Flushes the session's own accumulator into staging.
    pub fn flush_paths(&self) -> bool {
        lock(&self.shared.paths).flush()
    }

    /// Records the height and thickness (engine units) of an optimized layer.
    pub fn set_layer_dimensions(&self, layer: LayerIndex, height: i64, thickness: i64) {
        self.shared.staging.set_dimensions(layer, height, thickness);
    }

    /// Publishes the optimized data of `layer` and sends whatever became
    /// contiguous.
    pub fn finalize_layer(&self, job: JobId, layer: LayerIndex) -> Result<(), BridgeError> {
        let shared = &self.shared;
        shared.check_layer(job, layer)?;
        {
            let mut paths = lock(&shared.paths);
            if paths.layer() == layer {
                paths.flush();
            }
        }
        let staged = shared.staging.take(layer);
        debug!(
            "Finalized layer {} of {} ({} segments)",
            layer,
            job,
            staged.segment_count()
        );
        shared.optimized_layers.insert(layer, staged)?;
        shared.request_drain()
    }

    /// Publishes the unoptimized data of one layer.
    pub fn send_raw_layer(&self, job: JobId, layer: Layer) -> Result<(), BridgeError> {
        let shared = &self.shared;
        shared.check_layer(job, layer.id)?;
        trace!("Raw layer {} of {} complete", layer.id, job);
        shared.raw_layers.insert(layer.id, layer)?;
        shared.request_drain()
    }

    /// Appends generated G-code to the output buffer.
    pub fn write_gcode(&self, text: &str) {
        lock(&self.shared.gcode).push_str(text);
    }

    /// Sends the buffered G-code as one chunk.
    pub fn flush_gcode(&self, job: JobId) -> Result<(), BridgeError> {
        self.shared.check_job(job)?;
        let text = std::mem::take(&mut *lock(&self.shared.gcode));
        if text.is_empty() {
            return Ok(());
        }
        self.shared
            .queue(BridgeMessage::GCodeChunk(GCodeChunk { job_id: job, text }))
    }

    pub fn send_gcode_prefix(&self, job: JobId, text: String) -> Result<(), BridgeError> {
        self.shared.check_job(job)?;
        self.shared
            .queue(BridgeMessage::GCodePrefix(GCodePrefix { job_id: job, text }))
    }

    pub fn send_print_estimates(&self, estimates: PrintEstimates) -> Result<(), BridgeError> {
        self.shared.check_job(estimates.job_id)?;
        self.shared.queue(BridgeMessage::PrintEstimates(estimates))
    }

    /// Completes the active job.
    ///
    /// Every optimized layer of the job must have been sent. Raw layers are
    /// optional, but once the job has published any, all of them must have
    /// been sent too. Sends the remaining G-code and the job's
    /// [`SlicingFinished`], then makes the next job active.
    ///
    /// Unlike the per-layer calls this waits for room in the outbound channel.
    pub fn finish_job(&self, job: JobId) -> Result<(), BridgeError> {
        let shared = &self.shared;
        shared.check_job(job)?;
        lock(&shared.paths).flush();
        {
            let mut cursor = lock(&shared.cursor);
            shared.drain_locked(&mut cursor, Wait::Forever)?;

            let layer_count = lock(&shared.jobs).front().map_or(0, Job::layer_count);
            let missing = layer_count.saturating_sub(cursor.optimized_next);
            if missing > 0 {
                warn!("{} cannot finish, {} optimized layers are unsent", job, missing);
                return Err(BridgeError::IncompleteJob { job, missing });
            }
            let missing_raw = layer_count.saturating_sub(cursor.raw_next);
            if !shared.raw_layers.is_empty() && missing_raw > 0 {
                warn!("{} cannot finish, {} raw layers are unsent", job, missing_raw);
                return Err(BridgeError::IncompleteJob {
                    job,
                    missing: missing_raw,
                });
            }

            let text = std::mem::take(&mut *lock(&shared.gcode));
            if !text.is_empty() {
                shared.send(BridgeMessage::GCodeChunk(GCodeChunk { job_id: job, text }), None)?;
            }
            shared.send(
                BridgeMessage::SlicingFinished(SlicingFinished { job_id: job }),
                None,
            )?;

            let mut jobs = lock(&shared.jobs);
            if let Some(mut done) = jobs.pop_front() {
                done.set_state(JobState::Done);
            }
            if let Some(next) = jobs.front_mut() {
                next.set_state(JobState::Slicing);
            }
            drop(jobs);

            shared.raw_layers.clear();
            shared.optimized_layers.clear();
            shared.staging.clear();
            shared.progress.reset();
            *cursor = EmitCursor::default();
            info!("Finished {}", job);
        }
        shared.request_drain()
    }

    /// Shuts the session down.
    ///
    /// Flushes the session's accumulator, sends the layers of the active job
    /// that are ready and in order, marks every job done and closes the
    /// outbound channel. If output is still blocked after
    /// [`BridgeSettings::close_timeout`], in-flight writes are aborted and the
    /// rest is discarded; that case returns [`BridgeError::ChannelClosed`].
    pub fn close(&self) -> Result<(), BridgeError> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = &self.shared;
        shared.closed.store(true, Ordering::Release);
        info!("Closing session");

        let deadline = Instant::now() + shared.settings.close_timeout;
        if lock(&shared.paths).flush() {
            debug!("Flushed pending paths on close");
        }

        let mut cursor = shared.lock_cursor_until(deadline);

        let active = lock(&shared.jobs).front().map(|job| (job.id(), job.shared_layers()));
        if let Some((_, layers)) = &active {
            for &layer in layers.iter() {
                if let Some(staged) = shared.staging.take_staged(layer)
                    && let Err(err) = shared.optimized_layers.insert(layer, staged)
                {
                    warn!("Discarding staged layer {} on close: {}", layer, err);
                }
            }
        }
        let mut result = shared
            .drain_locked(&mut cursor, Wait::Until(deadline))
            .map(|_| ());

        if let Some((job, _)) = active {
            let text = std::mem::take(&mut *lock(&shared.gcode));
            if result.is_ok() && !text.is_empty() {
                result = shared.send(
                    BridgeMessage::GCodeChunk(GCodeChunk { job_id: job, text }),
                    Some(deadline),
                );
            }
        }

        let jobs: Vec<Job> = lock(&shared.jobs).drain(..).collect();
        for mut job in jobs {
            job.set_state(JobState::Done);
            if result.is_ok() {
                result = shared.send(
                    BridgeMessage::SlicingFinished(SlicingFinished { job_id: job.id() }),
                    Some(deadline),
                );
            } else {
                debug!("Dropping {} without notifying the front-end", job.id());
            }
        }

        lock(&shared.outbox).clear();
        shared.raw_layers.clear();
        shared.optimized_layers.clear();
        shared.staging.clear();
        *cursor = EmitCursor::default();

        shared.abort.close();
        shared.outbound.close();
        shared.wake.close();
        drop(cursor);

        if let Some(handle) = lock(&self.drain_thread).take()
            && handle.join().is_err()
        {
            error!("Drain thread panicked");
        }

        match &result {
            Ok(()) => info!("Session closed"),
            Err(err) => warn!("Session closed with unsent output: {}", err),
        }
        result
    }
}

impl Drop for CommunicationSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!("Session dropped with unsent output: {}", err);
        }
    }
}

/// Body of the drain thread: waits for hand-offs from workers that found the
/// outbound channel full, and sends the rest, blocking for room.
fn run_drain(shared: &Shared, wake: &Receiver<()>) {
    trace!("Drain thread started");
    while wake.recv_blocking().is_ok() {
        loop {
            let mut cursor = lock(&shared.cursor);
            if shared.is_closed() {
                break;
            }
            while shared.drain_requested.swap(false, Ordering::AcqRel) {
                if let Err(err) = shared.drain_locked(&mut cursor, Wait::Forever) {
                    debug!("Drain thread stopping: {}", err);
                    return;
                }
            }
            drop(cursor);
            if !shared.drain_requested.load(Ordering::Acquire) {
                break;
            }
        }
    }
    trace!("Drain thread stopped");
}

impl Shared {
    #[inline(always)]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn check_job(&self, job: JobId) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        match lock(&self.jobs).front() {
            Some(active) if active.id() == job => Ok(()),
            _ => Err(BridgeError::UnknownJob(job)),
        }
    }

    fn check_layer(&self, job: JobId, layer: LayerIndex) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::ChannelClosed);
        }
        match lock(&self.jobs).front() {
            Some(active) if active.id() == job => {
                if active.contains_layer(layer) {
                    Ok(())
                } else {
                    Err(BridgeError::UnknownLayer { job, layer })
                }
            }
            _ => Err(BridgeError::UnknownJob(job)),
        }
    }

    fn queue(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        lock(&self.outbox).push_back(message);
        self.request_drain()
    }

    /// Makes one non-blocking pass over what is ready.
    ///
    /// If another thread holds the drain, that thread picks the request up.
    /// If the channel fills up, or more work arrived during the pass, the
    /// request goes to the drain thread and the caller returns.
    fn request_drain(&self) -> Result<(), BridgeError> {
        self.drain_requested.store(true, Ordering::Release);
        let mut cursor = match self.cursor.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        self.drain_requested.store(false, Ordering::Release);
        let caught_up = self.drain_locked(&mut cursor, Wait::Never)?;
        drop(cursor);

        if caught_up && !self.drain_requested.load(Ordering::Acquire) {
            return Ok(());
        }
        self.drain_requested.store(true, Ordering::Release);
        if self.wake_drain_thread() {
            return Ok(());
        }

        let mut cursor = lock(&self.cursor);
        while self.drain_requested.swap(false, Ordering::AcqRel) {
            self.drain_locked(&mut cursor, Wait::Forever)?;
        }
        Ok(())
    }

    /// False when there is no drain thread to wake.
    fn wake_drain_thread(&self) -> bool {
        !matches!(self.wake.try_send(()), Err(TrySendError::Closed(_)))
    }

    /// Sends queued control messages, then every layer that is contiguous
    /// with what was already sent.
    ///
    /// Returns false if it stopped early because the channel was full, which
    /// only happens with [`Wait::Never`].
    fn drain_locked(&self, cursor: &mut EmitCursor, wait: Wait) -> Result<bool, BridgeError> {
        loop {
            let next = lock(&self.outbox).pop_front();
            let Some(message) = next else { break };
            if let Delivery::Full(message) = self.deliver(message, wait)? {
                lock(&self.outbox).push_front(message);
                return Ok(false);
            }
        }

        let active = lock(&self.jobs).front().map(|job| (job.id(), job.shared_layers()));
        let Some((job_id, layers)) = active else {
            return Ok(true);
        };
        if cursor.job != Some(job_id) {
            *cursor = EmitCursor::for_job(job_id);
        }

        while let Some(&index) = layers.get(cursor.raw_next) {
            let Some(layer) = self.raw_layers.get(index) else { break };
            let message = BridgeMessage::RawLayer(RawLayer { job_id, layer });
            if let Delivery::Full(_) = self.deliver(message, wait)? {
                return Ok(false);
            }
            cursor.raw_next += 1;
        }
        while let Some(&index) = layers.get(cursor.optimized_next) {
            let Some(layer) = self.optimized_layers.get(index) else { break };
            trace!("Sending optimized layer {} of {}", index, job_id);
            let message = BridgeMessage::OptimizedLayer(OptimizedLayer { job_id, layer });
            if let Delivery::Full(_) = self.deliver(message, wait)? {
                return Ok(false);
            }
            cursor.optimized_next += 1;
        }
        Ok(true)
    }

    fn deliver(&self, message: BridgeMessage, wait: Wait) -> Result<Delivery, BridgeError> {
        match wait {
            Wait::Never => match self.outbound.try_send(message) {
                Ok(()) => {
                    self.warn_on_depth();
                    Ok(Delivery::Sent)
                }
                Err(TrySendError::Full(message)) => Ok(Delivery::Full(message)),
                Err(TrySendError::Closed(_)) => Err(self.fail(BridgeError::ChannelClosed)),
            },
            Wait::Forever => self.send(message, None).map(|()| Delivery::Sent),
            Wait::Until(deadline) => self.send(message, Some(deadline)).map(|()| Delivery::Sent),
        }
    }

    /// Writes one message to the outbound channel, blocking while it is full.
    ///
    /// Gives up when the channel closes, when the session aborts output, or at
    /// `deadline`. Any failure closes the session.
    fn send(&self, message: BridgeMessage, deadline: Option<Instant>) -> Result<(), BridgeError> {
        let send = async {
            self.outbound
                .send(message)
                .await
                .map_err(|_| BridgeError::ChannelClosed)
        };
        let aborted = async {
            let _ = self.abort_signal.recv().await;
            Err::<(), _>(BridgeError::ChannelClosed)
        };
        let result = match deadline {
            Some(deadline) => future::block_on(send.or(aborted).or(async {
                Timer::at(deadline).await;
                Err(BridgeError::ChannelClosed)
            })),
            None => future::block_on(send.or(aborted)),
        };

        match result {
            Ok(()) => {
                self.warn_on_depth();
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn fail(&self, err: BridgeError) -> BridgeError {
        if !self.closed.swap(true, Ordering::AcqRel) {
            error!("Front-end channel failed, closing session: {}", err);
        }
        err
    }

    fn warn_on_depth(&self) {
        if let Some(capacity) = self.outbound.capacity() {
            let depth = self.outbound.len();
            let depth_percentage = depth * 100 / capacity.max(1);
            if depth_percentage >= usize::from(self.settings.channel_warning_threshold) {
                warn!(
                    "Channel depth at {}% ({}/{} messages). Front-end may be too slow to keep up!",
                    depth_percentage, depth, capacity
                );
            }
        }
    }

    /// Takes the drain lock, waiting at most until `deadline` for a blocked
    /// writer before aborting it.
    fn lock_cursor_until(&self, deadline: Instant) -> MutexGuard<'_, EmitCursor> {
        loop {
            match self.cursor.try_lock() {
                Ok(guard) => return guard,
                Err(TryLockError::Poisoned(poisoned)) => return poisoned.into_inner(),
                Err(TryLockError::WouldBlock) if Instant::now() >= deadline => {
                    warn!("Output still blocked at close deadline, aborting in-flight writes");
                    self.abort.close();
                    return lock(&self.cursor);
                }
                Err(TryLockError::WouldBlock) => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }
}
