//! End-to-end checks of the engine running real render threads against the
//! in-memory capture backend.

use parking_lot::Mutex;
use pcm_channels::{AudioEngine, CaptureBackend, EngineConfig, EngineError, Frame, StereoVolume};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn paced_backend() -> CaptureBackend {
    CaptureBackend::new().with_pacing(Duration::from_micros(500))
}

/// Poll `condition` for up to two seconds
fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn test_aligned_capacity_for_hints() {
    init_logging();
    let backend = paced_backend();

    let mut engine = AudioEngine::with_defaults(512, 1, &backend).unwrap();
    assert_eq!(engine.capacity(), 576);
    assert_eq!(engine.aligned_capacity(), 512);
    engine.shutdown();

    let mut engine = AudioEngine::with_defaults(500, 1, &backend).unwrap();
    assert_eq!(engine.capacity(), 576);
    assert_eq!(engine.aligned_capacity(), 512);
    engine.shutdown();

    let engine = AudioEngine::with_defaults(0, 1, &backend).unwrap();
    assert_eq!(engine.aligned_capacity(), 512);
}

#[test]
fn test_threaded_output_has_no_loss_or_duplication() {
    init_logging();
    let backend = paced_backend();
    let mut engine = AudioEngine::with_defaults(500, 1, &backend).unwrap();

    let emitted = Arc::new(Mutex::new(Vec::new()));
    {
        let emitted = Arc::clone(&emitted);
        let lengths = [100usize, 0, 37, 476, 63, 511, 1, 64, 200, 5];
        let mut call = 0usize;
        let mut value = 0i32;
        engine
            .set_callback(0, move |out: &mut [Frame]| {
                let wanted = lengths[call % lengths.len()].min(out.len());
                call += 1;
                let mut emitted = emitted.lock();
                for frame in out[..wanted].iter_mut() {
                    value += 1;
                    let sample = (value % 20_000 + 1) as i16;
                    *frame = Frame::new(sample, sample / 2 + 1);
                    emitted.push(*frame);
                }
                wanted
            })
            .unwrap();
    }

    assert!(wait_for(|| emitted.lock().len() > 5_000));
    engine.shutdown();

    let produced = emitted.lock().clone();
    let dispatched = backend.captured_frames(0);
    let first_sound = dispatched
        .iter()
        .position(|frame| !frame.is_silent())
        .expect("producer output reached the line");
    let sounded = &dispatched[first_sound..];

    assert!(sounded.len() <= produced.len());
    assert!(produced.len() - sounded.len() < 64);
    assert_eq!(sounded, &produced[..sounded.len()]);
    for dispatch in backend.dispatches(0) {
        assert_eq!(dispatch.frames.len() % 64, 0);
    }
}

#[test]
fn test_silence_without_producer() {
    init_logging();
    let backend = paced_backend();
    let mut engine = AudioEngine::with_defaults(500, 1, &backend).unwrap();

    assert!(wait_for(|| backend.dispatch_count(0) >= 3));
    engine.shutdown();

    for dispatch in backend.dispatches(0) {
        assert_eq!(dispatch.frames.len(), 512);
        assert!(dispatch.frames.iter().all(Frame::is_silent));
    }
}

#[test]
fn test_allocation_failure_leaves_nothing_reserved() {
    init_logging();
    let backend = paced_backend();

    let result = AudioEngine::with_defaults(usize::MAX / 8, 2, &backend);
    assert!(matches!(result, Err(EngineError::Allocation { .. })));

    let result = AudioEngine::with_defaults(usize::MAX - 3, 2, &backend);
    assert!(matches!(
        result,
        Err(EngineError::Allocation { source: None, .. })
    ));

    assert_eq!(backend.total_reservations(), 0);
    assert_eq!(backend.active_lines(), 0);
}

#[test]
fn test_reservation_failure_releases_reserved_lines() {
    init_logging();
    let backend = paced_backend().with_max_lines(1);

    let result = AudioEngine::with_defaults(512, 2, &backend);
    assert!(matches!(
        result,
        Err(EngineError::HardwareReservation { channel: 1, .. })
    ));
    assert_eq!(backend.total_reservations(), 1);
    assert_eq!(backend.active_lines(), 0);
    assert_eq!(backend.dispatch_count(0), 0);
}

#[test]
fn test_invalid_config_rejected_before_reserving() {
    let backend = paced_backend();
    assert!(matches!(
        AudioEngine::with_defaults(512, 0, &backend),
        Err(EngineError::Config(_))
    ));
    assert_eq!(backend.total_reservations(), 0);
}

#[test]
fn test_volume_clamp_on_running_channel() {
    init_logging();
    let backend = paced_backend().with_max_volume(100);
    let engine = AudioEngine::with_defaults(512, 1, &backend).unwrap();

    assert_eq!(engine.volume(0).unwrap(), StereoVolume { left: 100, right: 100 });
    let stored = engine.set_volume(0, -5, 9999).unwrap();
    assert_eq!(stored, StereoVolume { left: 0, right: 100 });
    assert_eq!(engine.volume(0).unwrap(), stored);
    assert_eq!(engine.max_volume(), 100);

    let before = backend.dispatch_count(0);
    assert!(wait_for(|| backend.dispatch_count(0) > before + 1));
    let last = backend.dispatches(0).pop().unwrap();
    assert_eq!(last.volume, stored);
}

#[test]
fn test_volume_is_never_torn() {
    init_logging();
    let backend = CaptureBackend::new().with_pacing(Duration::from_micros(100));
    let mut engine = AudioEngine::with_defaults(64, 1, &backend).unwrap();

    for step in 0..500 {
        let level = (step * 61) % 0x8000;
        engine.set_volume(0, level, level).unwrap();
        if step % 50 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
    }
    engine.shutdown();

    for dispatch in backend.dispatches(0) {
        assert_eq!(dispatch.volume.left, dispatch.volume.right);
    }
}

#[test]
fn test_producer_swaps_while_rendering() {
    init_logging();
    let backend = CaptureBackend::new().with_pacing(Duration::from_micros(200));
    let mut engine = AudioEngine::with_defaults(128, 1, &backend).unwrap();
    let first = Frame::new(1, 1);
    let second = Frame::new(2, 2);

    for round in 0..200 {
        let frame = if round % 2 == 0 { first } else { second };
        engine
            .set_callback(0, move |out: &mut [Frame]| {
                out.fill(frame);
                out.len()
            })
            .unwrap();
        if round % 3 == 0 {
            engine.clear_callback(0).unwrap();
        }
        thread::sleep(Duration::from_micros(150));
    }
    engine.shutdown();

    let frames = backend.captured_frames(0);
    assert!(!frames.is_empty());
    assert!(frames
        .iter()
        .all(|frame| frame.is_silent() || *frame == first || *frame == second));
}

#[test]
fn test_pause_keeps_producer() {
    init_logging();
    let backend = paced_backend();
    let engine = AudioEngine::with_defaults(128, 1, &backend).unwrap();
    engine
        .set_callback(0, |out: &mut [Frame]| {
            out.fill(Frame::mono(7));
            out.len()
        })
        .unwrap();

    assert!(wait_for(|| backend
        .captured_frames(0)
        .contains(&Frame::mono(7))));

    engine.pause(0).unwrap();
    assert!(engine.is_paused(0).unwrap());
    assert!(engine.has_callback(0).unwrap());

    // One cycle may already hold the producer; after that only silence
    let paused_at = backend.dispatch_count(0) + 1;
    assert!(wait_for(|| backend.dispatch_count(0) > paused_at + 3));
    let dispatches = backend.dispatches(0);
    assert!(dispatches[paused_at..]
        .iter()
        .all(|dispatch| dispatch.frames.iter().all(Frame::is_silent)));

    engine.resume(0).unwrap();
    let resumed_at = backend.dispatch_count(0) + 1;
    assert!(wait_for(|| backend.dispatch_count(0) > resumed_at + 1));
    assert!(backend.dispatches(0)[resumed_at..]
        .iter()
        .any(|dispatch| dispatch.frames.contains(&Frame::mono(7))));
}

#[test]
fn test_channels_are_independent() {
    init_logging();
    let backend = paced_backend();
    let mut engine = AudioEngine::init(&EngineConfig::new(256, 2), &backend).unwrap();
    assert_eq!(engine.channel_count(), 2);
    assert_eq!(backend.active_lines(), 2);

    engine
        .set_callback(1, |out: &mut [Frame]| {
            out.fill(Frame::new(3, -3));
            out.len()
        })
        .unwrap();
    engine.set_volume(0, 10, 20).unwrap();

    assert!(wait_for(|| backend
        .captured_frames(1)
        .contains(&Frame::new(3, -3))));
    engine.shutdown();

    assert!(backend.captured_frames(0).iter().all(Frame::is_silent));
    assert_eq!(engine.has_callback(1).unwrap_err().to_string(), "Audio engine has been shut down");
}

#[test]
fn test_shutdown_is_idempotent_and_releases_lines() {
    init_logging();
    let backend = paced_backend();
    let mut engine = AudioEngine::with_defaults(512, 2, &backend).unwrap();
    assert!(engine.is_running());

    engine.shutdown();
    assert!(!engine.is_running());
    assert_eq!(backend.active_lines(), 0);
    assert_eq!(backend.released_lines(), 2);

    engine.shutdown();
    drop(engine);
    assert_eq!(backend.released_lines(), 2);

    let settled = backend.dispatch_count(0);
    thread::sleep(Duration::from_millis(10));
    assert_eq!(backend.dispatch_count(0), settled);
}

#[test]
fn test_drop_shuts_down() {
    init_logging();
    let backend = paced_backend();
    let engine = AudioEngine::with_defaults(512, 1, &backend).unwrap();
    assert_eq!(backend.active_lines(), 1);
    drop(engine);
    assert_eq!(backend.active_lines(), 0);
}

#[test]
fn test_invalid_channel() {
    let backend = paced_backend();
    let engine = AudioEngine::with_defaults(512, 1, &backend).unwrap();

    let err = engine.set_volume(3, 0, 0).unwrap_err();
    assert!(matches!(err, EngineError::InvalidChannel { channel: 3, count: 1 }));
    assert!(engine.clear_callback(1).is_err());
}

#[test]
fn test_channel_survives_panicking_producer() {
    init_logging();
    let backend = paced_backend();
    let mut engine = AudioEngine::with_defaults(64, 1, &backend).unwrap();
    let fired = Arc::new(AtomicBool::new(false));
    {
        let fired = Arc::clone(&fired);
        engine
            .set_callback(0, move |_: &mut [Frame]| -> usize {
                fired.store(true, Ordering::Release);
                panic!("producer failure");
            })
            .unwrap();
    }

    assert!(wait_for(|| fired.load(Ordering::Acquire)));
    assert!(wait_for(|| !engine.has_callback(0).unwrap()));
    assert!(engine.is_running());
    assert_eq!(backend.active_lines(), 1);

    // Silence keeps the line fed
    let detached_at = backend.dispatch_count(0);
    assert!(wait_for(|| backend.dispatch_count(0) > detached_at + 3));
    assert!(backend.dispatches(0)[detached_at..]
        .iter()
        .all(|dispatch| dispatch.frames.iter().all(Frame::is_silent)));

    engine
        .set_callback(0, |out: &mut [Frame]| {
            out.fill(Frame::mono(5));
            out.len()
        })
        .unwrap();
    assert!(wait_for(|| backend
        .captured_frames(0)
        .contains(&Frame::mono(5))));

    engine.shutdown();
    assert_eq!(backend.active_lines(), 0);
    assert_eq!(backend.released_lines(), 1);
}
