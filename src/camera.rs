//! Camera facade.
//!
//! [`Camera`] is the composition root: it builds the session hub over a transport,
//! creates every component, attaches them to the router and exposes the outward
//! operations in one place.
//!
//! # Example
//!
//! ```no_run
//! use indi_camera::{Camera, CameraConfig, SimulatedCamera};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = CameraConfig::default();
//! let camera = Camera::new(Arc::new(SimulatedCamera::new("CCD Simulator")), config)?;
//! camera.connect()?;
//! camera.wait_connected(Duration::from_secs(5))?;
//! camera.start_exposure(1.0)?;
//! # Ok::<(), indi_camera::CameraError>(())
//! ```

use crate::components::{
    Component, ExposureComponent, ExposureResult, ExposureState, HardwareComponent, ImageComponent,
    SequenceOrchestrator, SequenceProgress, SequenceTiming, TemperatureComponent, VideoComponent,
};
use crate::components::sequence::{CompletionCallback, FrameCallback};
use crate::config::CameraConfig;
use crate::error::{AppResult, ErrorRecord, LastError};
use crate::frame::Frame;
use crate::session::{DriverInfo, SessionHub};
use crate::transport::Transport;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A camera session with all components wired up.
pub struct Camera {
    config: CameraConfig,
    hub: Arc<SessionHub>,
    exposure: Arc<ExposureComponent>,
    sequence: Arc<SequenceOrchestrator>,
    hardware: Arc<HardwareComponent>,
    temperature: Arc<TemperatureComponent>,
    video: Arc<VideoComponent>,
    image: Arc<ImageComponent>,
    components: Vec<Arc<dyn Component>>,
    last_error: LastError,
}

impl Camera {
    /// Build and wire a camera over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: CameraConfig) -> AppResult<Self> {
        config.validate()?;

        let hub = SessionHub::new(transport);
        let exposure = Arc::new(ExposureComponent::new(Arc::clone(&hub), config.download_grace()));
        let sequence = Arc::new(SequenceOrchestrator::new(SequenceTiming::from(&config.sequence)));
        sequence.set_exposure_component(Arc::clone(&exposure));
        let hardware = Arc::new(HardwareComponent::new(Arc::clone(&hub)));
        let temperature = Arc::new(TemperatureComponent::new(Arc::clone(&hub)));
        let video = Arc::new(VideoComponent::new(Arc::clone(&hub)));
        let image = Arc::new(ImageComponent::new(Arc::clone(&hub)));

        let components: Vec<Arc<dyn Component>> = vec![
            exposure.clone(),
            sequence.clone(),
            hardware.clone(),
            temperature.clone(),
            video.clone(),
            image.clone(),
        ];
        for component in &components {
            component.initialize()?;
            hub.router().attach(component);
        }
        tracing::debug!(
            components = components.len(),
            device = %config.device.name,
            "Camera assembled"
        );

        Ok(Self {
            config,
            hub,
            exposure,
            sequence,
            hardware,
            temperature,
            video,
            image,
            components,
            last_error: LastError::default(),
        })
    }

    /// Load configuration (defaults, optional TOML file, environment) and build a camera.
    pub fn from_config<P: AsRef<Path>>(
        transport: Arc<dyn Transport>,
        path: Option<P>,
    ) -> AppResult<Self> {
        Self::new(transport, CameraConfig::load(path)?)
    }

    /// Configuration the camera was built with.
    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    /// Underlying session hub.
    pub fn hub(&self) -> &Arc<SessionHub> {
        &self.hub
    }

    /// Exposure state machine.
    pub fn exposure(&self) -> &Arc<ExposureComponent> {
        &self.exposure
    }

    /// Sequence orchestrator.
    pub fn sequence(&self) -> &Arc<SequenceOrchestrator> {
        &self.sequence
    }

    /// Sensor settings and optional peripherals.
    pub fn hardware(&self) -> &Arc<HardwareComponent> {
        &self.hardware
    }

    /// Cooling control.
    pub fn temperature(&self) -> &Arc<TemperatureComponent> {
        &self.temperature
    }

    /// Video streaming and recording.
    pub fn video(&self) -> &Arc<VideoComponent> {
        &self.video
    }

    /// Image delivery settings and statistics.
    pub fn image(&self) -> &Arc<ImageComponent> {
        &self.image
    }

    /// Most recent failure of any facade operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    fn track<T>(&self, result: AppResult<T>) -> AppResult<T> {
        self.last_error.track(result)
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to the configured device.
    pub fn connect(&self) -> AppResult<()> {
        let device = self.config.device.name.clone();
        self.connect_to(&device)
    }

    /// Connect to a named device using the configured timeout and retries.
    pub fn connect_to(&self, device: &str) -> AppResult<()> {
        self.track(self.hub.connect(
            device,
            self.config.connect_timeout(),
            self.config.device.max_retries,
        ))
    }

    /// Block until the device confirms the connection.
    pub fn wait_connected(&self, timeout: Duration) -> AppResult<()> {
        self.track(self.hub.wait_for_connection(timeout))
    }

    /// Stop any sequence and disconnect the device.
    pub fn disconnect(&self) -> AppResult<()> {
        if self.sequence.is_sequence_running() {
            self.track(self.sequence.stop_sequence())?;
        }
        self.track(self.hub.disconnect())
    }

    /// Disconnect and close the transport session.
    pub fn shutdown(&self) -> AppResult<()> {
        self.disconnect()?;
        self.track(self.hub.shutdown())
    }

    /// Whether the device reports a live connection.
    pub fn is_connected(&self) -> bool {
        self.hub.is_connected()
    }

    /// `true` once every component has what it needs from the device.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.components.iter().all(|c| c.is_ready())
    }

    /// Driver identification from `DRIVER_INFO`.
    pub fn driver_info(&self) -> Option<DriverInfo> {
        self.hub.driver_info()
    }

    // =========================================================================
    // Exposure
    // =========================================================================

    /// Start a single exposure of `duration_s` seconds.
    pub fn start_exposure(&self, duration_s: f64) -> AppResult<()> {
        self.track(self.exposure.start_exposure(duration_s))
    }

    /// Abort the running exposure.
    pub fn abort_exposure(&self) -> AppResult<()> {
        self.track(self.exposure.abort_exposure())
    }

    /// Whether an exposure is running.
    pub fn is_exposing(&self) -> bool {
        self.exposure.is_exposing()
    }

    /// Current exposure cycle state.
    pub fn exposure_state(&self) -> ExposureState {
        self.exposure.state()
    }

    /// Fraction of the running exposure elapsed.
    pub fn exposure_progress(&self) -> f64 {
        self.exposure.progress()
    }

    /// Seconds left in the running exposure.
    pub fn exposure_remaining(&self) -> f64 {
        self.exposure.remaining()
    }

    /// Outcome of the last finished exposure cycle.
    pub fn exposure_result(&self) -> Option<ExposureResult> {
        self.exposure.last_result()
    }

    /// Observe exposure state transitions.
    pub fn subscribe_exposure_state(&self) -> watch::Receiver<ExposureState> {
        self.exposure.subscribe_state()
    }

    /// Most recently received frame.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.hub.current_frame()
    }

    /// Write the current frame to `path` unchanged.
    pub fn save_image(&self, path: impl AsRef<Path>) -> AppResult<()> {
        self.track(self.exposure.save_image(path))
    }

    // =========================================================================
    // Sequences
    // =========================================================================

    /// Callback invoked for every captured sequence frame.
    pub fn set_frame_callback(&self, callback: FrameCallback) {
        self.sequence.set_frame_callback(callback);
    }

    /// Callback invoked once when a sequence ends.
    pub fn set_completion_callback(&self, callback: CompletionCallback) {
        self.sequence.set_completion_callback(callback);
    }

    /// Capture `count` frames of `exposure_s` seconds, `interval_s` apart.
    pub fn start_sequence(&self, count: u32, exposure_s: f64, interval_s: f64) -> AppResult<()> {
        self.track(self.sequence.start_sequence(count, exposure_s, interval_s))
    }

    /// Stop the running sequence.
    pub fn stop_sequence(&self) -> AppResult<()> {
        self.track(self.sequence.stop_sequence())
    }

    /// Whether a sequence is running.
    pub fn is_sequence_running(&self) -> bool {
        self.sequence.is_sequence_running()
    }

    /// `(completed, total)` of the current or last sequence.
    pub fn sequence_progress(&self) -> SequenceProgress {
        SequenceProgress {
            completed: self.sequence.current_frame(),
            total: self.sequence.total_frames(),
        }
    }

    // =========================================================================
    // Peripheral shortcuts
    // =========================================================================

    /// Request a sensor gain.
    pub fn set_gain(&self, gain: f64) -> AppResult<()> {
        self.track(self.hardware.set_gain(gain))
    }

    /// Last known sensor gain.
    pub fn gain(&self) -> Option<f64> {
        self.hardware.gain()
    }

    /// Request a sensor offset.
    pub fn set_offset(&self, offset: f64) -> AppResult<()> {
        self.track(self.hardware.set_offset(offset))
    }

    /// Last known sensor offset.
    pub fn offset(&self) -> Option<f64> {
        self.hardware.offset()
    }

    /// Request pixel binning.
    pub fn set_binning(&self, horizontal: u32, vertical: u32) -> AppResult<()> {
        self.track(self.hardware.set_binning(horizontal, vertical))
    }

    /// Request a sensor setpoint in degrees Celsius.
    pub fn set_temperature(&self, celsius: f64) -> AppResult<()> {
        self.track(self.temperature.set_temperature(celsius))
    }

    /// Last reported sensor temperature.
    pub fn sensor_temperature(&self) -> Option<f64> {
        self.temperature.temperature()
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if self.sequence.is_sequence_running() {
            if let Err(e) = self.sequence.stop_sequence() {
                tracing::warn!(error = %e, "Failed to stop sequence on drop");
            }
        }
        for component in &self.components {
            if let Err(e) = component.destroy() {
                tracing::warn!(
                    component = component.name(),
                    error = %e,
                    "Component teardown failed"
                );
            }
            self.hub.router().unregister(component);
        }
        if let Err(e) = self.hub.shutdown() {
            tracing::warn!(error = %e, "Session shutdown failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = CameraConfig::default();
        config.device.name = String::new();
        assert!(Camera::new(Arc::new(MockTransport::new()), config).is_err());
    }

    #[test]
    fn test_components_registered() {
        let camera = Camera::new(Arc::new(MockTransport::new()), CameraConfig::default()).unwrap();
        let router = camera.hub().router();
        assert_eq!(router.subscriber_count("CCD_EXPOSURE"), 1);
        assert_eq!(router.subscriber_count("CCD1"), 2);
        assert_eq!(router.subscriber_count("CCD_GAIN"), 1);
        assert!(!camera.is_ready());
    }

    #[test]
    fn test_operations_fail_before_connect() {
        let camera = Camera::new(Arc::new(MockTransport::new()), CameraConfig::default()).unwrap();
        assert!(camera.start_exposure(1.0).is_err());
        assert_eq!(camera.last_error().unwrap().kind, "not_connected");
        assert!(camera.set_gain(1.0).is_err());
        assert!(camera.disconnect().is_ok());
    }
}
