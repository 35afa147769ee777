//! Video streaming control.
//!
//! Covers the stream switch, per-frame exposure and gain, server-side recording
//! (`RECORD_STREAM`) and frame-rate monitoring. Empty attachments that arrive
//! while streaming are counted as dropped frames.

use super::{
    ensure_connected, number_setting, send_exclusive_switch, send_numbers, send_text, Component,
};
use crate::error::{AppResult, CameraError, ErrorRecord, LastError};
use crate::property::Property;
use crate::session::{PropertyEvent, SessionHub};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const STREAM: &str = "CCD_VIDEO_STREAM";
const STREAM_EXPOSURE: &str = "STREAMING_EXPOSURE_TIME";
const STREAM_EXPOSURE_ELEMENT: &str = "STREAMING_EXPOSURE_VALUE";
const FPS: &str = "FPS";
const IMAGE: &str = "CCD1";
const RECORD: &str = "RECORD_STREAM";
const RECORD_FILE: &str = "RECORD_FILE";
const RECORD_FILE_NAME: &str = "RECORD_FILE_NAME";
const GAIN: &str = "CCD_GAIN";
const GAIN_ELEMENT: &str = "GAIN";

#[derive(Debug, Default, Clone, Copy)]
struct FrameRate {
    estimated: f64,
    average: f64,
}

/// Video stream control and frame-rate monitoring.
pub struct VideoComponent {
    hub: Arc<SessionHub>,
    running: AtomicBool,
    recording: AtomicBool,
    recording_file: RwLock<Option<String>>,
    streamed_frames: AtomicU64,
    dropped_frames: AtomicU64,
    exposure: RwLock<Option<f64>>,
    gain: RwLock<Option<f64>>,
    fps: RwLock<Option<FrameRate>>,
    last_error: LastError,
}

impl VideoComponent {
    /// Component bound to `hub`.
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self {
            hub,
            running: AtomicBool::new(false),
            recording: AtomicBool::new(false),
            recording_file: RwLock::new(None),
            streamed_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            exposure: RwLock::new(None),
            gain: RwLock::new(None),
            fps: RwLock::new(None),
            last_error: LastError::default(),
        }
    }

    /// Switch the stream on and restart the frame counters.
    pub fn start_video(&self) -> AppResult<()> {
        let result = send_exclusive_switch(&self.hub, STREAM, "STREAM_ON").map(|()| {
            self.running.store(true, Ordering::SeqCst);
            self.streamed_frames.store(0, Ordering::SeqCst);
            self.dropped_frames.store(0, Ordering::SeqCst);
            tracing::info!("Video stream started");
        });
        self.last_error.track(result)
    }

    /// Switch the stream off.
    pub fn stop_video(&self) -> AppResult<()> {
        let result = send_exclusive_switch(&self.hub, STREAM, "STREAM_OFF").map(|()| {
            self.running.store(false, Ordering::SeqCst);
            tracing::info!(frames = self.streamed_frames(), "Video stream stopped");
        });
        self.last_error.track(result)
    }

    /// Whether the stream is on.
    pub fn is_video_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Per-frame exposure while streaming, in seconds.
    pub fn set_video_exposure(&self, seconds: f64) -> AppResult<()> {
        self.last_error.track(self.try_set_exposure(seconds))
    }

    fn try_set_exposure(&self, seconds: f64) -> AppResult<()> {
        if !(seconds.is_finite() && seconds > 0.0) {
            return Err(CameraError::InvalidArgument(format!(
                "streaming exposure must be positive, got {seconds}"
            )));
        }
        ensure_connected(&self.hub)?;
        let current = self.hub.require_property(STREAM_EXPOSURE)?;
        if let Some(setting) = number_setting(&current, STREAM_EXPOSURE_ELEMENT) {
            setting.validate("streaming exposure", seconds)?;
        }
        send_numbers(&self.hub, STREAM_EXPOSURE, &[(STREAM_EXPOSURE_ELEMENT, seconds)])?;
        *self.exposure.write() = Some(seconds);
        Ok(())
    }

    /// Per-frame streaming exposure, in seconds.
    pub fn video_exposure(&self) -> Option<f64> {
        *self.exposure.read()
    }

    /// Gain applied while streaming. Written through `CCD_GAIN`.
    pub fn set_video_gain(&self, gain: f64) -> AppResult<()> {
        self.last_error.track(self.try_set_gain(gain))
    }

    fn try_set_gain(&self, gain: f64) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        let current = self.hub.require_property(GAIN)?;
        if let Some(setting) = number_setting(&current, GAIN_ELEMENT) {
            setting.validate("video gain", gain)?;
        }
        send_numbers(&self.hub, GAIN, &[(GAIN_ELEMENT, gain)])?;
        *self.gain.write() = Some(gain);
        Ok(())
    }

    /// Last requested streaming gain.
    pub fn video_gain(&self) -> Option<f64> {
        *self.gain.read()
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Start server-side recording of the stream into `file_name`.
    ///
    /// The name is written to `RECORD_FILE` when the device offers it.
    pub fn start_video_recording(&self, file_name: &str) -> AppResult<()> {
        self.last_error.track(self.try_start_recording(file_name))
    }

    fn try_start_recording(&self, file_name: &str) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        if self.is_video_recording() {
            return Err(CameraError::AlreadyInProgress("Video recording"));
        }
        self.hub.require_property(RECORD)?;
        if self.hub.property(RECORD_FILE).is_some() {
            send_text(&self.hub, RECORD_FILE, RECORD_FILE_NAME, file_name)?;
        }
        send_exclusive_switch(&self.hub, RECORD, "RECORD_ON")?;
        self.recording.store(true, Ordering::SeqCst);
        *self.recording_file.write() = Some(file_name.to_string());
        tracing::info!(file_name, "Video recording started");
        Ok(())
    }

    /// Stop recording. Does nothing when no recording is running.
    pub fn stop_video_recording(&self) -> AppResult<()> {
        if !self.is_video_recording() {
            tracing::debug!("No video recording to stop");
            return Ok(());
        }
        let result = send_exclusive_switch(&self.hub, RECORD, "RECORD_OFF").map(|()| {
            self.recording.store(false, Ordering::SeqCst);
            tracing::info!("Video recording stopped");
        });
        self.last_error.track(result)
    }

    /// Whether the device is recording the stream.
    pub fn is_video_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// File name of the current or last recording.
    pub fn recording_file(&self) -> Option<String> {
        self.recording_file.read().clone()
    }

    /// Estimated frames per second reported by the device.
    pub fn fps(&self) -> Option<f64> {
        self.fps.read().map(|f| f.estimated)
    }

    /// Running average frames per second.
    pub fn average_fps(&self) -> Option<f64> {
        self.fps.read().map(|f| f.average)
    }

    /// Attachments received since the stream was started.
    pub fn streamed_frames(&self) -> u64 {
        self.streamed_frames.load(Ordering::SeqCst)
    }

    /// Empty attachments received since the stream was started.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::SeqCst)
    }

    /// Most recent failure of a caller-facing operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    fn refresh(&self, property: &Property) {
        match property.name.as_str() {
            STREAM => {
                if let Some(on) = property.switch("STREAM_ON") {
                    self.running.store(on, Ordering::SeqCst);
                }
            }
            STREAM_EXPOSURE => *self.exposure.write() = property.number(STREAM_EXPOSURE_ELEMENT),
            FPS => {
                *self.fps.write() = Some(FrameRate {
                    estimated: property.number("EST_FPS").unwrap_or(0.0),
                    average: property.number("AVG_FPS").unwrap_or(0.0),
                });
            }
            RECORD => {
                let on = property.active_switch().is_some_and(|e| e != "RECORD_OFF");
                self.recording.store(on, Ordering::SeqCst);
            }
            IMAGE if self.is_video_running() => {
                if property.first_blob().is_some_and(|b| !b.is_empty()) {
                    self.streamed_frames.fetch_add(1, Ordering::SeqCst);
                } else {
                    let dropped = self.dropped_frames.fetch_add(1, Ordering::SeqCst) + 1;
                    tracing::warn!(dropped, "Empty video frame dropped");
                }
            }
            _ => {}
        }
    }
}

impl Component for VideoComponent {
    fn name(&self) -> &str {
        "VideoComponent"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[STREAM, STREAM_EXPOSURE, FPS, IMAGE, RECORD]
    }

    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()> {
        match event {
            PropertyEvent::Removed(p) => match p.name.as_str() {
                STREAM => self.running.store(false, Ordering::SeqCst),
                RECORD => self.recording.store(false, Ordering::SeqCst),
                STREAM_EXPOSURE => *self.exposure.write() = None,
                FPS => *self.fps.write() = None,
                _ => {}
            },
            PropertyEvent::Defined(p) | PropertyEvent::Updated(p) => self.refresh(p),
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.hub.property(STREAM).is_some()
    }

    fn on_session_lost(&self, _code: i32) {
        self.running.store(false, Ordering::SeqCst);
        self.recording.store(false, Ordering::SeqCst);
        *self.fps.write() = None;
        *self.exposure.write() = None;
    }
}
