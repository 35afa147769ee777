//! Exposure cycle against the simulated driver.
//!
//! Covers the complete request → busy → ok → attachment round-trip, abort,
//! device-side failures and unusable attachments.

mod common;

use common::{connected_camera, connected_camera_with, fast_config, wait_until, SETTLE};
use indi_camera::{CameraError, ExposureOutcome, ExposureState, FrameFormat};
use std::time::Duration;

#[test]
fn test_exposure_round_trip() {
    let (simulator, camera) = connected_camera();
    assert!(camera.is_ready());
    assert_eq!(camera.driver_info().map(|d| d.name), Some("CCD Simulator".to_string()));

    camera.start_exposure(1.0).unwrap();
    assert!(camera.is_exposing());

    assert!(wait_until(SETTLE, || camera.exposure().exposure_count() == 1));
    assert!(!camera.is_exposing());
    assert_eq!(camera.exposure_state(), ExposureState::Idle);

    let result = camera.exposure_result().expect("cycle should have finished");
    assert_eq!(result.outcome, ExposureOutcome::Completed);
    assert_eq!(result.duration_s, 1.0);

    let frame = camera.current_frame().expect("frame should be stored");
    assert_eq!(frame.format, FrameFormat::Fits);
    assert_eq!(frame.exposure_s, 1.0);

    // bias 1000 plus 50 ADU of dark signal, noise is +/-20
    let stats = camera.image().frame_statistics().unwrap();
    let (width, height) = simulator.sensor_size();
    assert_eq!(stats.samples, (width * height) as usize);
    assert!((1020.0..1080.0).contains(&stats.mean), "mean was {}", stats.mean);
}

#[test]
fn test_second_exposure_rejected_while_running() {
    let (_simulator, camera) = connected_camera();
    camera.start_exposure(10.0).unwrap();

    let err = camera.start_exposure(1.0).unwrap_err();
    assert!(matches!(err, CameraError::AlreadyInProgress(_)));
    assert_eq!(camera.last_error().unwrap().kind, "already_in_progress");
    assert_eq!(camera.exposure().cycles_started(), 1);

    assert!(wait_until(SETTLE, || camera.exposure().exposure_count() == 1));
}

#[test]
fn test_abort_returns_to_idle_without_frame() {
    let (_simulator, camera) = connected_camera();
    camera.start_exposure(20.0).unwrap();
    camera.abort_exposure().unwrap();
    assert_eq!(camera.exposure_result().unwrap().outcome, ExposureOutcome::Aborted);

    // the device acknowledges asynchronously; let its events drain
    assert!(wait_until(SETTLE, || {
        camera.exposure_state() == ExposureState::Idle && !camera.is_exposing()
    }));

    // the 200 ms exposure would have delivered by now
    std::thread::sleep(Duration::from_millis(400));
    assert_eq!(camera.exposure_state(), ExposureState::Idle);
    assert_eq!(camera.exposure_result().unwrap().outcome, ExposureOutcome::Aborted);
    assert_eq!(camera.exposure_progress(), 0.0);
    assert_eq!(camera.exposure().exposure_count(), 0);
    assert!(camera.current_frame().is_none());
}

#[test]
fn test_device_alert_fails_cycle() {
    let (simulator, camera) = connected_camera();
    simulator.fail_next_exposure();
    camera.start_exposure(1.0).unwrap();

    assert!(wait_until(SETTLE, || camera.exposure_result().is_some()));
    assert!(matches!(
        camera.exposure_result().unwrap().outcome,
        ExposureOutcome::Failed(_)
    ));
    assert_eq!(camera.exposure_state(), ExposureState::Idle);
    assert_eq!(camera.exposure().last_error().unwrap().kind, "protocol_alert");

    // the camera stays usable
    camera.start_exposure(1.0).unwrap();
    assert!(wait_until(SETTLE, || camera.exposure().exposure_count() == 1));
}

#[test]
fn test_empty_attachment_is_discarded() {
    let (simulator, camera) = connected_camera_with(fast_config());
    simulator.send_empty_next_attachment();
    camera.start_exposure(1.0).unwrap();

    assert!(wait_until(SETTLE, || !camera.is_exposing()));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(camera.exposure().exposure_count(), 0);
    assert!(camera.current_frame().is_none());

    // download grace (300 ms) expires and the machine goes back to idle
    assert!(wait_until(SETTLE, || camera.exposure_state() == ExposureState::Idle));
    assert!(matches!(
        camera.exposure_result().unwrap().outcome,
        ExposureOutcome::Failed(_)
    ));
    assert!(matches!(camera.save_image("/nonexistent/frame.fits"), Err(CameraError::NoFrame)));
}

#[test]
fn test_save_image_writes_payload() {
    let (_simulator, camera) = connected_camera();
    camera.start_exposure(1.0).unwrap();
    assert!(wait_until(SETTLE, || camera.current_frame().is_some()));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("light.fits");
    camera.save_image(&path).unwrap();

    let written = std::fs::read(&path).unwrap();
    assert_eq!(written.len(), camera.current_frame().unwrap().size());
    assert!(written.starts_with(b"SIMPLE"));
}

#[test]
fn test_progress_is_monotonic_and_bounded() {
    let (_simulator, camera) = connected_camera();

    // 300 ms at the test time scale
    camera.start_exposure(30.0).unwrap();
    let mut samples = Vec::new();
    while camera.is_exposing() {
        let progress = camera.exposure_progress();
        let remaining = camera.exposure_remaining();
        // keep only readings taken while the exposure was still running
        if camera.is_exposing() {
            samples.push((progress, remaining));
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(samples.len() > 5, "only {} samples", samples.len());
    for pair in samples.windows(2) {
        let ((p0, r0), (p1, r1)) = (pair[0], pair[1]);
        assert!(p1 >= p0, "progress went from {p0} to {p1}");
        assert!(r1 <= r0, "remaining went from {r0} to {r1}");
    }
    for &(progress, remaining) in &samples {
        assert!((0.0..=1.0).contains(&progress));
        assert!((0.0..=30.0).contains(&remaining));
    }
    assert!(wait_until(SETTLE, || camera.exposure().exposure_count() == 1));
}

#[test]
fn test_exposure_requires_connection() {
    let (_simulator, camera) = connected_camera();
    camera.disconnect().unwrap();
    assert!(!camera.is_connected());
    assert!(matches!(camera.start_exposure(1.0), Err(CameraError::NotConnected)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_state_changes_are_observable() {
    let (_simulator, camera) = connected_camera();
    let mut states = camera.subscribe_exposure_state();
    assert_eq!(*states.borrow_and_update(), ExposureState::Idle);

    camera.start_exposure(10.0).unwrap();
    assert_eq!(*states.borrow_and_update(), ExposureState::Exposing);

    let settled = tokio::time::timeout(SETTLE, async {
        while *states.borrow_and_update() != ExposureState::Idle {
            states.changed().await.unwrap();
        }
    })
    .await;
    assert!(settled.is_ok());
    assert_eq!(camera.exposure().exposure_count(), 1);
}
