use std::sync::Arc;
use std::time::{Duration, Instant};

use slicelink::{
    BridgeSettings, CommunicationSession, Job,
    async_channel::Receiver,
};
use slicelink_common::{
    BridgeMessage, GCodeChunk, GCodePrefix, IntPoint, JobId, Layer, LayerIndex, PrintEstimates,
    PrintFeatureType, SlicingFinished, error::BridgeError,
};

const JOB: JobId = JobId::new(1);

// Everything currently queued, without waiting
fn drain(messages: &Receiver<BridgeMessage>) -> Vec<BridgeMessage> {
    std::iter::from_fn(|| messages.try_recv().ok()).collect()
}

fn optimized_ids(messages: &[BridgeMessage]) -> Vec<LayerIndex> {
    messages
        .iter()
        .filter_map(|m| match m {
            BridgeMessage::OptimizedLayer(l) => Some(l.layer.id),
            _ => None,
        })
        .collect()
}

fn raw_ids(messages: &[BridgeMessage]) -> Vec<LayerIndex> {
    messages
        .iter()
        .filter_map(|m| match m {
            BridgeMessage::RawLayer(l) => Some(l.layer.id),
            _ => None,
        })
        .collect()
}

fn trace_square(session: &CommunicationSession, layer: LayerIndex, size: i64) {
    session.set_layer(layer);
    session.draw_polygon(
        PrintFeatureType::OuterWall,
        &[
            IntPoint::new(0, 0),
            IntPoint::new(size, 0),
            IntPoint::new(size, size),
            IntPoint::new(0, size),
        ],
        400,
        200,
        30.0,
    );
}

#[test]
fn out_of_order_layers_are_sent_in_order() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..3)).unwrap();
    drain(&messages);

    session.finalize_layer(JOB, 2).unwrap();
    assert!(drain(&messages).is_empty());

    session.finalize_layer(JOB, 0).unwrap();
    assert_eq!(optimized_ids(&drain(&messages)), vec![0]);

    session.finalize_layer(JOB, 1).unwrap();
    assert_eq!(optimized_ids(&drain(&messages)), vec![1, 2]);

    session.finish_job(JOB).unwrap();
    assert_eq!(
        drain(&messages),
        vec![BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB })]
    );
    assert!(!session.has_pending_work());
}

#[test]
fn raft_layers_come_first() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, -2..2)).unwrap();
    for layer in [1, 0, -1, -2] {
        session.finalize_layer(JOB, layer).unwrap();
    }
    assert_eq!(optimized_ids(&drain(&messages)), vec![-2, -1, 0, 1]);
}

#[test]
fn traced_paths_end_up_in_their_layer() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..2)).unwrap();

    trace_square(&session, 0, 10_000);
    session.set_layer_dimensions(0, 200, 200);
    session.move_to(IntPoint::new(20_000, 20_000));
    session.set_extruder(1);
    session.draw_to(PrintFeatureType::Support, IntPoint::new(30_000, 20_000), 400, 200, 50.0);
    session.finalize_layer(JOB, 0).unwrap();

    let sent = drain(&messages);
    let layer = sent
        .iter()
        .find_map(|m| match m {
            BridgeMessage::OptimizedLayer(l) => Some(Arc::clone(&l.layer)),
            _ => None,
        })
        .unwrap();

    assert_eq!(layer.id, 0);
    assert_eq!(layer.height, 0.2);
    assert_eq!(layer.path_segments.len(), 2);
    let wall = &layer.path_segments[0];
    assert_eq!(wall.extruder, 0);
    // square plus the trailing travel to the support start
    assert_eq!(wall.segment_count(), 5);
    assert_eq!(wall.line_type[4], PrintFeatureType::NoneType);
    let support = &layer.path_segments[1];
    assert_eq!(support.extruder, 1);
    assert_eq!(support.segment_count(), 1);
    for path in &layer.path_segments {
        assert_eq!(path.points.len(), path.segment_count() + 1);
        assert_eq!(path.line_width.len(), path.segment_count());
    }
}

#[test]
fn raw_and_optimized_streams_are_independent() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..2)).unwrap();

    let mut raw = Layer::new(1).with_dimensions(400, 200);
    raw.push_polygon(
        PrintFeatureType::Infill,
        &[IntPoint::new(0, 0), IntPoint::new(1_000, 0), IntPoint::new(0, 1_000)],
        400,
        200,
        60.0,
    );
    session.send_raw_layer(JOB, raw).unwrap();
    session.finalize_layer(JOB, 0).unwrap();

    let sent = drain(&messages);
    assert!(raw_ids(&sent).is_empty());
    assert_eq!(optimized_ids(&sent), vec![0]);

    session.send_raw_layer(JOB, Layer::new(0)).unwrap();
    assert_eq!(raw_ids(&drain(&messages)), vec![0, 1]);

    assert!(matches!(
        session.send_raw_layer(JOB, Layer::new(0)),
        Err(BridgeError::OutOfOrderInsert { layer: 0 })
    ));
}

#[test]
fn concurrent_workers_keep_layer_order() {
    const LAYERS: LayerIndex = 64;
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..LAYERS)).unwrap();

    std::thread::scope(|s| {
        for worker in 0..8 {
            let session = &session;
            s.spawn(move || {
                // each worker walks its layers back to front
                let mut mine: Vec<LayerIndex> = (worker..LAYERS).step_by(8).collect();
                mine.reverse();
                for layer in mine {
                    let mut paths = session.path_accumulator();
                    paths.set_layer(layer);
                    paths.move_to(IntPoint::new(0, 0));
                    paths.draw_to(
                        PrintFeatureType::Infill,
                        IntPoint::new(i64::from(layer) * 100, 100),
                        400,
                        200,
                        80.0,
                    );
                    paths.finish();
                    session.finalize_layer(JOB, layer).unwrap();
                }
            });
        }
    });

    // finishing waits for anything the drain thread still holds
    session.finish_job(JOB).unwrap();
    let sent = drain(&messages);
    assert_eq!(optimized_ids(&sent), (0..LAYERS).collect::<Vec<_>>());
    for message in &sent {
        if let BridgeMessage::OptimizedLayer(l) = message {
            assert_eq!(l.layer.segment_count(), 1);
        }
    }
}

#[test]
fn backpressure_blocks_instead_of_dropping() {
    const LAYERS: LayerIndex = 40;
    let settings = BridgeSettings::default().with_channel_capacity(2);
    let (session, messages) = CommunicationSession::open(settings);
    session.enqueue_job(Job::with_layer_range(JOB, 0..LAYERS)).unwrap();

    let consumer = std::thread::spawn(move || {
        let mut received = Vec::new();
        while let Ok(message) = messages.recv_blocking() {
            std::thread::sleep(Duration::from_micros(200));
            received.push(message);
        }
        received
    });

    std::thread::scope(|s| {
        for worker in 0..4 {
            let session = &session;
            s.spawn(move || {
                for layer in (worker..LAYERS).step_by(4) {
                    session.finalize_layer(JOB, layer).unwrap();
                }
            });
        }
    });
    session.finish_job(JOB).unwrap();
    session.close().unwrap();

    let received = consumer.join().unwrap();
    assert_eq!(optimized_ids(&received), (0..LAYERS).collect::<Vec<_>>());
    assert_eq!(
        received.last(),
        Some(&BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB }))
    );
}

#[test]
fn close_flushes_pending_paths_once() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::new(JOB, [0, 1])).unwrap();

    trace_square(&session, 0, 5_000);
    session.close().unwrap();

    let sent = drain(&messages);
    assert_eq!(optimized_ids(&sent), vec![0]);
    let BridgeMessage::OptimizedLayer(layer) = &sent[1] else {
        panic!("expected layer 0 after the acknowledgement, got {:?}", sent);
    };
    assert_eq!(layer.layer.path_segments.len(), 1);
    assert_eq!(layer.layer.segment_count(), 4);
    assert_eq!(
        sent.last(),
        Some(&BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB }))
    );
    assert!(messages.is_closed());
    assert!(!session.has_pending_work());

    // closing twice is harmless
    session.close().unwrap();
}

#[test]
fn close_marks_every_job_done() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::new(JobId::new(1), [0])).unwrap();
    session.enqueue_job(Job::new(JobId::new(2), [0])).unwrap();
    session.close().unwrap();

    let finished: Vec<JobId> = drain(&messages)
        .into_iter()
        .filter_map(|m| match m {
            BridgeMessage::SlicingFinished(f) => Some(f.job_id),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![JobId::new(1), JobId::new(2)]);
    assert!(matches!(
        session.finalize_layer(JobId::new(1), 0),
        Err(BridgeError::ChannelClosed)
    ));
}

#[test]
fn close_aborts_a_blocked_writer() {
    let settings = BridgeSettings::default()
        .with_channel_capacity(1)
        .with_close_timeout(Duration::from_millis(50));
    let (session, messages) = CommunicationSession::open(settings);
    // fills the channel; nobody reads
    session.enqueue_job(Job::with_layer_range(JOB, 0..2)).unwrap();

    std::thread::scope(|s| {
        let worker = s.spawn(|| session.finalize_layer(JOB, 0));
        // the layer is left waiting on the drain thread
        assert!(matches!(worker.join().unwrap(), Ok(())));
    });

    let started = Instant::now();
    assert!(matches!(session.close(), Err(BridgeError::ChannelClosed)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(session.is_closed());
    assert_eq!(drain(&messages).len(), 1);
}

#[test]
fn full_channel_does_not_hold_up_workers() {
    let settings = BridgeSettings::default().with_channel_capacity(1);
    let (session, messages) = CommunicationSession::open(settings);
    let session = Arc::new(session);
    // the acknowledgement fills the channel and nobody reads yet
    session.enqueue_job(Job::with_layer_range(JOB, 0..3)).unwrap();

    let worker = {
        let session = Arc::clone(&session);
        std::thread::spawn(move || {
            for layer in [1, 0, 2] {
                session.finalize_layer(JOB, layer)?;
            }
            Ok::<_, BridgeError>(())
        })
    };
    let started = Instant::now();
    while !worker.is_finished() && started.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert!(worker.is_finished(), "worker waited for the front-end");
    worker.join().unwrap().unwrap();

    // the drain thread delivers once the front-end starts reading
    let received: Vec<BridgeMessage> = (0..4)
        .map(|_| messages.recv_blocking().unwrap())
        .collect();
    assert!(matches!(received[0], BridgeMessage::JobAccepted(_)));
    assert_eq!(optimized_ids(&received), vec![0, 1, 2]);

    session.finish_job(JOB).unwrap();
    assert_eq!(
        messages.recv_blocking().unwrap(),
        BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB })
    );
}

#[test]
fn concurrent_progress_stays_increasing() {
    let settings = BridgeSettings::default().with_channel_capacity(16);
    let (session, messages) = CommunicationSession::open(settings);
    session.enqueue_job(Job::new(JOB, [0])).unwrap();

    let consumer = std::thread::spawn(move || {
        let mut received = Vec::new();
        while let Ok(message) = messages.recv_blocking() {
            received.push(message);
        }
        received
    });

    std::thread::scope(|s| {
        for source in 0..4u16 {
            let session = &session;
            s.spawn(move || {
                for permille in (source..=1000).step_by(4) {
                    session.report_progress(permille).unwrap();
                }
            });
        }
    });
    session.close().unwrap();

    let permilles: Vec<u16> = consumer
        .join()
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            BridgeMessage::Progress(p) => Some(p.permille),
            _ => None,
        })
        .collect();
    for pair in permilles.windows(2) {
        assert!(pair[0] < pair[1], "progress went from {} to {}", pair[0], pair[1]);
    }
    assert_eq!(permilles.last(), Some(&1000));
}

#[test]
fn finishing_early_reports_missing_layers() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..3)).unwrap();
    session.finalize_layer(JOB, 0).unwrap();
    session.finalize_layer(JOB, 2).unwrap();

    assert!(matches!(
        session.finish_job(JOB),
        Err(BridgeError::IncompleteJob { missing: 2, .. })
    ));
    assert!(session.has_pending_work());

    session.finalize_layer(JOB, 1).unwrap();
    session.finish_job(JOB).unwrap();
    assert_eq!(optimized_ids(&drain(&messages)), vec![0, 1, 2]);
}

#[test]
fn partial_raw_layers_block_completion() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::with_layer_range(JOB, 0..3)).unwrap();
    for layer in 0..3 {
        session.finalize_layer(JOB, layer).unwrap();
    }
    session.send_raw_layer(JOB, Layer::new(0)).unwrap();
    session.send_raw_layer(JOB, Layer::new(2)).unwrap();

    assert!(matches!(
        session.finish_job(JOB),
        Err(BridgeError::IncompleteJob { missing: 2, .. })
    ));
    assert_eq!(session.active_job(), Some(JOB));

    session.send_raw_layer(JOB, Layer::new(1)).unwrap();
    session.finish_job(JOB).unwrap();
    let sent = drain(&messages);
    assert_eq!(raw_ids(&sent), vec![0, 1, 2]);
    assert_eq!(
        sent.last(),
        Some(&BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB }))
    );
}

#[test]
fn jobs_without_raw_layers_finish() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::new(JOB, [0, 1])).unwrap();
    session.finalize_layer(JOB, 0).unwrap();
    session.finalize_layer(JOB, 1).unwrap();
    session.finish_job(JOB).unwrap();
    assert!(raw_ids(&drain(&messages)).is_empty());
}

#[test]
fn gcode_and_estimates_precede_completion() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    session.enqueue_job(Job::new(JOB, [0])).unwrap();
    session.report_progress_fraction(0.5).unwrap();
    session.finalize_layer(JOB, 0).unwrap();

    session.write_gcode(";LAYER:0\nG1 X10 Y0 E0.5\n");
    session.flush_gcode(JOB).unwrap();
    session.write_gcode("M107\n");
    session
        .send_gcode_prefix(JOB, ";FLAVOR:Marlin\n;PRINT.TIME:120\n".to_string())
        .unwrap();
    session
        .send_print_estimates(PrintEstimates {
            job_id: JOB,
            time_per_feature: vec![(PrintFeatureType::OuterWall, 120.0)],
            material_per_extruder: vec![42.5],
        })
        .unwrap();
    session.finish_job(JOB).unwrap();

    let sent = drain(&messages);
    let tail: Vec<&BridgeMessage> = sent
        .iter()
        .skip_while(|m| !matches!(m, BridgeMessage::GCodeChunk(_)))
        .collect();
    assert_eq!(
        tail[0],
        &BridgeMessage::GCodeChunk(GCodeChunk {
            job_id: JOB,
            text: ";LAYER:0\nG1 X10 Y0 E0.5\n".to_string()
        })
    );
    assert_eq!(
        tail[1],
        &BridgeMessage::GCodePrefix(GCodePrefix {
            job_id: JOB,
            text: ";FLAVOR:Marlin\n;PRINT.TIME:120\n".to_string()
        })
    );
    assert!(matches!(tail[2], BridgeMessage::PrintEstimates(_)));
    assert_eq!(
        tail[3],
        &BridgeMessage::GCodeChunk(GCodeChunk {
            job_id: JOB,
            text: "M107\n".to_string()
        })
    );
    assert_eq!(
        tail[4],
        &BridgeMessage::SlicingFinished(SlicingFinished { job_id: JOB })
    );
    assert!(sent.iter().any(|m| matches!(m, BridgeMessage::Progress(p) if p.permille == 500)));
}

#[test]
fn next_job_starts_fresh() {
    let (session, messages) = CommunicationSession::open(BridgeSettings::default());
    let second = JobId::new(2);
    session.enqueue_job(Job::new(JOB, [0, 1])).unwrap();
    session.enqueue_job(Job::new(second, [0, 1])).unwrap();
    session.report_progress(900).unwrap();

    session.finalize_layer(JOB, 1).unwrap();
    session.finalize_layer(JOB, 0).unwrap();
    session.finish_job(JOB).unwrap();
    assert_eq!(session.active_job(), Some(second));

    // progress and layer indices start over for the second job
    assert!(session.report_progress(100).unwrap());
    session.finalize_layer(second, 0).unwrap();
    session.finalize_layer(second, 1).unwrap();
    session.finish_job(second).unwrap();

    let sent = drain(&messages);
    let layers: Vec<(JobId, LayerIndex)> = sent
        .iter()
        .filter_map(|m| match m {
            BridgeMessage::OptimizedLayer(l) => Some((l.job_id, l.layer.id)),
            _ => None,
        })
        .collect();
    assert_eq!(layers, vec![(JOB, 0), (JOB, 1), (second, 0), (second, 1)]);
}
