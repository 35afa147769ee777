//! Exposure sequences against the simulated driver.

mod common;

use common::{connected_camera, wait_until, SETTLE};
use indi_camera::{CameraError, ExposureState, Frame, SequenceProgress};
use parking_lot::Mutex;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collects frame indices and completion reports from the callbacks.
struct Recorder {
    frames: Arc<Mutex<Vec<u32>>>,
    completions: mpsc::Receiver<bool>,
}

fn record(camera: &indi_camera::Camera) -> Recorder {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let (tx, completions) = mpsc::channel();

    let sink = Arc::clone(&frames);
    camera.set_frame_callback(Arc::new(move |index: u32, frame: Arc<Frame>| {
        assert!(frame.size() > 0);
        sink.lock().push(index);
    }));
    let tx = Mutex::new(tx);
    camera.set_completion_callback(Arc::new(move |success: bool| {
        let _ = tx.lock().send(success);
    }));
    Recorder { frames, completions }
}

#[test]
fn test_three_frame_sequence_completes() {
    let (_simulator, camera) = connected_camera();
    let recorder = record(&camera);

    camera.start_sequence(3, 1.0, 0.5).unwrap();
    assert!(camera.is_sequence_running());

    let success = recorder.completions.recv_timeout(SETTLE).unwrap();
    assert!(success);
    assert_eq!(*recorder.frames.lock(), vec![1, 2, 3]);

    let progress = camera.sequence_progress();
    assert_eq!((progress.completed, progress.total), (3, 3));
    assert!(wait_until(SETTLE, || !camera.is_sequence_running()));
    assert_eq!(camera.exposure().exposure_count(), 3);

    // reported exactly once
    assert!(recorder.completions.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_progress_reported_in_order() {
    let (_simulator, camera) = connected_camera();
    let progress = camera.sequence().subscribe_progress();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (tx, completions) = mpsc::channel();

    // progress is published before the frame callback runs
    let sink = Arc::clone(&seen);
    let progress = Mutex::new(progress);
    camera.set_frame_callback(Arc::new(move |index: u32, _frame: Arc<Frame>| {
        let current = *progress.lock().borrow_and_update();
        sink.lock().push((index, current));
    }));
    let tx = Mutex::new(tx);
    camera.set_completion_callback(Arc::new(move |success: bool| {
        let _ = tx.lock().send(success);
    }));

    camera.start_sequence(3, 1.0, 0.1).unwrap();
    assert!(completions.recv_timeout(SETTLE).unwrap());

    let expected: Vec<(u32, SequenceProgress)> = (1..=3)
        .map(|i| (i, SequenceProgress { completed: i, total: 3 }))
        .collect();
    assert_eq!(*seen.lock(), expected);
}

#[test]
fn test_stop_during_interval_starts_no_frame() {
    let (_simulator, camera) = connected_camera();
    let recorder = record(&camera);

    // 10 ms frames, 2 s pause between them
    camera.start_sequence(3, 1.0, 2.0).unwrap();
    assert!(wait_until(SETTLE, || recorder.frames.lock().len() == 1));
    assert!(wait_until(SETTLE, || camera.exposure_state() == ExposureState::Idle));
    let cycles = camera.exposure().cycles_started();

    camera.stop_sequence().unwrap();
    assert!(!camera.is_exposing());
    assert!(!recorder.completions.recv_timeout(SETTLE).unwrap());

    std::thread::sleep(Duration::from_millis(200));
    assert!(!camera.is_exposing());
    assert_eq!(camera.exposure().cycles_started(), cycles);
    assert_eq!(camera.exposure().exposure_count(), 1);
    assert_eq!(*recorder.frames.lock(), vec![1]);
}

#[test]
fn test_second_sequence_rejected() {
    let (_simulator, camera) = connected_camera();
    camera.start_sequence(2, 10.0, 0.0).unwrap();
    assert!(matches!(
        camera.start_sequence(2, 1.0, 0.0),
        Err(CameraError::AlreadyInProgress(_))
    ));
    camera.stop_sequence().unwrap();
}

#[test]
fn test_stop_during_second_frame() {
    let (_simulator, camera) = connected_camera();
    let recorder = record(&camera);

    // 300 ms per frame at the test time scale
    camera.start_sequence(5, 30.0, 0.0).unwrap();
    assert!(wait_until(SETTLE, || recorder.frames.lock().len() == 1));
    assert!(wait_until(SETTLE, || camera.is_exposing()));

    let started = Instant::now();
    camera.stop_sequence().unwrap();
    let latency = started.elapsed();
    // polling runs every 5 ms here; the bound leaves room for the abort round trip
    assert!(latency < Duration::from_millis(150), "stop took {latency:?}");

    assert!(!camera.is_sequence_running());
    assert!(!recorder.completions.recv_timeout(SETTLE).unwrap());
    assert!(recorder.completions.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(*recorder.frames.lock(), vec![1]);
    assert_eq!(camera.sequence_progress().completed, 1);

    assert!(wait_until(SETTLE, || camera.exposure_state() == ExposureState::Idle));
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(camera.exposure().exposure_count(), 1);
}

#[test]
fn test_session_lost_mid_sequence() {
    let (simulator, camera) = connected_camera();
    let recorder = record(&camera);

    camera.start_sequence(5, 30.0, 0.0).unwrap();
    assert!(wait_until(SETTLE, || recorder.frames.lock().len() == 1));

    simulator.drop_session(-1);

    assert!(!recorder.completions.recv_timeout(SETTLE).unwrap());
    assert!(wait_until(SETTLE, || !camera.is_sequence_running()));
    assert!(!camera.is_connected());
    assert!(!camera.is_exposing());
    assert_eq!(camera.hub().last_close_code(), -1);
    assert!(recorder.frames.lock().len() < 5);
    assert!(matches!(
        camera.start_exposure(1.0),
        Err(CameraError::NotConnected)
    ));
}

#[test]
fn test_panicking_frame_callback_does_not_stop_sequence() {
    let (_simulator, camera) = connected_camera();
    let (tx, completions) = mpsc::channel();
    let tx = Mutex::new(tx);

    camera.set_frame_callback(Arc::new(|index: u32, _frame: Arc<Frame>| {
        if index == 1 {
            panic!("consumer bug");
        }
    }));
    camera.set_completion_callback(Arc::new(move |success: bool| {
        let _ = tx.lock().send(success);
    }));

    camera.start_sequence(2, 1.0, 0.0).unwrap();
    assert!(completions.recv_timeout(SETTLE).unwrap());
    assert_eq!(camera.sequence_progress().completed, 2);
}
