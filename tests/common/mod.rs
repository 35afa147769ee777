//! Common test utilities for indi_camera integration tests
//!
//! This module provides reusable test helpers for:
//! - Building a camera over the in-process simulated driver
//! - Polling for asynchronous conditions with a bound

#![allow(dead_code)] // Utilities may not all be used by every test binary

use indi_camera::config::SequenceConfig;
use indi_camera::{Camera, CameraConfig, SimulatedCamera};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Device name used by every scenario.
pub const DEVICE: &str = "CCD Simulator";

/// Simulated delays run at 1% of real time: a 1 s exposure takes 10 ms.
pub const TIME_SCALE: f64 = 0.01;

/// Generous bound for conditions that normally settle within milliseconds.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Configuration with fast polling, suitable for scaled simulator time.
pub fn fast_config() -> CameraConfig {
    let mut config = CameraConfig::default();
    config.device.name = DEVICE.to_string();
    config.device.connect_timeout_ms = 1000;
    config.device.max_retries = 0;
    config.exposure.download_grace_ms = 300;
    config.sequence = SequenceConfig {
        start_timeout_ms: 2000,
        start_poll_ms: 5,
        finish_poll_ms: 5,
        frame_grace_ms: 1000,
        interval_chunk_ms: 10,
    };
    config
}

/// Simulator plus a connected camera using [`fast_config`].
pub fn connected_camera() -> (SimulatedCamera, Camera) {
    connected_camera_with(fast_config())
}

/// Simulator plus a connected camera using `config`.
pub fn connected_camera_with(config: CameraConfig) -> (SimulatedCamera, Camera) {
    let simulator = SimulatedCamera::new(DEVICE).with_time_scale(TIME_SCALE);
    let camera = Camera::new(Arc::new(simulator.clone()), config).expect("camera should build");
    camera.connect().expect("connect request should succeed");
    camera
        .wait_connected(SETTLE)
        .expect("simulated device should connect");
    (simulator, camera)
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
///
/// Returns whether the condition held.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}
