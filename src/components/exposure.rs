//! Exposure control.
//!
//! Drives one exposure cycle at a time through the device's `CCD_EXPOSURE`
//! property and collects the resulting frame from the `CCD1` attachment.
//!
//! ```text
//!            start / Busy             Ok                attachment
//!   Idle ──────────────────► Exposing ───► Downloading ────────────► Idle
//!    ▲                          │  │            │
//!    │          abort           │  │ Alert      │ Alert
//!    └──── Aborted ◄────────────┘  └──► Error ◄─┘
//!                                        │
//!                                        └──────────────────────────► Idle
//! ```
//!
//! `Aborted` and `Error` are passed through on the way back to `Idle`; observers
//! subscribed via [`ExposureComponent::subscribe_state`] see them.
//!
//! A cycle stuck in `Downloading` (attachment never arrived) is treated as idle
//! once the configured download grace has passed.

use super::{ensure_connected, Component};
use crate::error::{AppResult, CameraError, ErrorRecord, LastError};
use crate::frame::Frame;
use crate::property::PropertyState;
use crate::session::{PropertyEvent, SessionHub};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Exposure request and status property.
pub const EXPOSURE_PROPERTY: &str = "CCD_EXPOSURE";
/// Duration element of [`EXPOSURE_PROPERTY`].
pub const EXPOSURE_ELEMENT: &str = "CCD_EXPOSURE_VALUE";
/// Abort switch property.
pub const ABORT_PROPERTY: &str = "CCD_ABORT_EXPOSURE";
/// Switch element of [`ABORT_PROPERTY`].
pub const ABORT_ELEMENT: &str = "ABORT";
/// Attachment property carrying frames.
pub const IMAGE_PROPERTY: &str = "CCD1";

/// Exposure cycle state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum ExposureState {
    /// No cycle running.
    #[default]
    Idle,
    /// Sensor is integrating.
    Exposing,
    /// Exposure finished; waiting for the attachment.
    Downloading,
    /// Cycle was aborted.
    Aborted,
    /// Cycle failed.
    Error,
}

impl ExposureState {
    /// `true` while a cycle occupies the device.
    pub fn is_active(self) -> bool {
        matches!(self, ExposureState::Exposing | ExposureState::Downloading)
    }
}

/// How a cycle ended.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ExposureOutcome {
    /// A frame was received.
    Completed,
    /// Aborted by the caller or the device.
    Aborted,
    /// Failed with the given reason.
    Failed(String),
}

/// Summary of the most recent finished cycle.
#[derive(Clone, Debug, Serialize)]
pub struct ExposureResult {
    /// How the cycle ended.
    pub outcome: ExposureOutcome,
    /// Requested duration in seconds.
    pub duration_s: f64,
    /// Frame captured by the cycle, if it completed.
    #[serde(skip)]
    pub frame: Option<Arc<Frame>>,
    /// When the cycle ended.
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct ExposureSession {
    state: ExposureState,
    duration_s: f64,
    started_at: Option<Instant>,
    downloading_since: Option<Instant>,
}

/// Exposure state machine bound to the session hub.
pub struct ExposureComponent {
    hub: Arc<SessionHub>,
    session: Mutex<ExposureSession>,
    exposing: AtomicBool,
    frames_received: AtomicU64,
    /// `frames_received` at the last counter reset.
    count_base: AtomicU64,
    cycles: AtomicU64,
    last_duration: Mutex<f64>,
    last_result: Mutex<Option<ExposureResult>>,
    download_grace: Duration,
    state_tx: watch::Sender<ExposureState>,
    last_error: LastError,
}

impl ExposureComponent {
    /// State machine bound to `hub`. A download that sees no attachment within
    /// `download_grace` is abandoned.
    pub fn new(hub: Arc<SessionHub>, download_grace: Duration) -> Self {
        let (state_tx, _) = watch::channel(ExposureState::Idle);
        Self {
            hub,
            session: Mutex::new(ExposureSession::default()),
            exposing: AtomicBool::new(false),
            frames_received: AtomicU64::new(0),
            count_base: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            last_duration: Mutex::new(0.0),
            last_result: Mutex::new(None),
            download_grace,
            state_tx,
            last_error: LastError::default(),
        }
    }

    /// Begin an exposure of `duration_s` seconds.
    pub fn start_exposure(&self, duration_s: f64) -> AppResult<()> {
        self.last_error.track(self.try_start(duration_s))
    }

    fn try_start(&self, duration_s: f64) -> AppResult<()> {
        if !(duration_s.is_finite() && duration_s > 0.0) {
            return Err(CameraError::InvalidArgument(format!(
                "exposure duration must be positive, got {duration_s}"
            )));
        }
        ensure_connected(&self.hub)?;

        let current = self.hub.require_property(EXPOSURE_PROPERTY)?;
        if let Some(max) = current.element(EXPOSURE_ELEMENT).and_then(|e| e.max) {
            if max > 0.0 && duration_s > max {
                return Err(CameraError::InvalidArgument(format!(
                    "exposure duration {duration_s} exceeds device maximum {max}"
                )));
            }
        }
        let request = current
            .with_number(EXPOSURE_ELEMENT, duration_s)
            .ok_or_else(|| {
                CameraError::PropertyNotFound(format!("{EXPOSURE_PROPERTY}.{EXPOSURE_ELEMENT}"))
            })?;

        let cycle = {
            let mut session = self.session.lock();
            self.settle(&mut session);
            if session.state.is_active() {
                return Err(CameraError::AlreadyInProgress("Exposure"));
            }
            self.begin(&mut session, duration_s)
        };

        // The lock is released before sending: a transport may deliver the
        // acknowledgement on this very thread.
        if let Err(e) = self.hub.send_mutation(request) {
            let mut session = self.session.lock();
            if self.cycles.load(Ordering::SeqCst) == cycle
                && session.state == ExposureState::Exposing
            {
                self.exposing.store(false, Ordering::SeqCst);
                self.transition(&mut session, ExposureState::Idle);
            }
            return Err(e);
        }

        tracing::info!(duration_s, "Exposure started");
        Ok(())
    }

    /// Abort the running exposure.
    ///
    /// The state moves to `Idle` right away; the device acknowledgement is not awaited.
    pub fn abort_exposure(&self) -> AppResult<()> {
        self.last_error.track(self.try_abort())
    }

    fn try_abort(&self) -> AppResult<()> {
        ensure_connected(&self.hub)?;

        let sent = self
            .hub
            .require_property(ABORT_PROPERTY)
            .and_then(|p| {
                p.with_switch(ABORT_ELEMENT, true)
                    .ok_or_else(|| {
                        CameraError::PropertyNotFound(format!("{ABORT_PROPERTY}.{ABORT_ELEMENT}"))
                    })
            })
            .and_then(|request| self.hub.send_mutation(request));

        {
            let mut session = self.session.lock();
            if session.state.is_active() {
                self.exposing.store(false, Ordering::SeqCst);
                self.transition(&mut session, ExposureState::Aborted);
                self.finish(&mut session, ExposureOutcome::Aborted, None);
                tracing::info!("Exposure aborted");
            }
        }

        sent
    }

    /// Whether an exposure is running (lock-free).
    pub fn is_exposing(&self) -> bool {
        self.exposing.load(Ordering::SeqCst)
    }

    /// Current cycle state.
    pub fn state(&self) -> ExposureState {
        let mut session = self.session.lock();
        self.settle(&mut session);
        session.state
    }

    /// Fraction of the running exposure elapsed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        let session = self.session.lock();
        match (session.state, session.started_at) {
            (ExposureState::Exposing, Some(started)) if session.duration_s > 0.0 => {
                (started.elapsed().as_secs_f64() / session.duration_s).clamp(0.0, 1.0)
            }
            _ => 0.0,
        }
    }

    /// Seconds left in the running exposure, never negative.
    pub fn remaining(&self) -> f64 {
        let session = self.session.lock();
        match (session.state, session.started_at) {
            (ExposureState::Exposing, Some(started)) => {
                (session.duration_s - started.elapsed().as_secs_f64()).max(0.0)
            }
            _ => 0.0,
        }
    }

    /// Number of frames received since creation or the last
    /// [`reset_exposure_count`](Self::reset_exposure_count).
    pub fn exposure_count(&self) -> u64 {
        let received = self.frames_received.load(Ordering::SeqCst);
        received.saturating_sub(self.count_base.load(Ordering::SeqCst))
    }

    /// Restart [`exposure_count`](Self::exposure_count) from zero.
    pub fn reset_exposure_count(&self) {
        let received = self.frames_received.load(Ordering::SeqCst);
        self.count_base.store(received, Ordering::SeqCst);
        tracing::debug!(received, "Exposure count reset");
    }

    /// Frames received since creation; never reset.
    pub(crate) fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::SeqCst)
    }

    /// Duration of the last completed exposure, in seconds.
    pub fn last_exposure_duration(&self) -> f64 {
        *self.last_duration.lock()
    }

    /// Outcome of the most recent finished cycle.
    pub fn last_result(&self) -> Option<ExposureResult> {
        self.last_result.lock().clone()
    }

    /// Number of cycles started since creation, including external ones.
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Observe state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ExposureState> {
        self.state_tx.subscribe()
    }

    /// Most recent failure of a caller-facing operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    /// Write the current frame's payload to `path`, bytes unchanged.
    pub fn save_image(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let path = path.as_ref();
        let result = self
            .hub
            .current_frame()
            .ok_or(CameraError::NoFrame)
            .and_then(|frame| {
                std::fs::write(path, &frame.payload)?;
                tracing::info!(path = %path.display(), bytes = frame.size(), "Frame saved");
                Ok(())
            });
        self.last_error.track(result)
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    fn begin(&self, session: &mut ExposureSession, duration_s: f64) -> u64 {
        session.duration_s = duration_s;
        session.started_at = Some(Instant::now());
        session.downloading_since = None;
        self.exposing.store(true, Ordering::SeqCst);
        self.transition(session, ExposureState::Exposing);
        self.cycles.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn transition(&self, session: &mut ExposureSession, next: ExposureState) {
        if session.state != next {
            tracing::debug!(from = ?session.state, to = ?next, "Exposure state");
        }
        session.state = next;
        self.state_tx.send_replace(next);
    }

    /// Record the cycle outcome and return to `Idle`.
    fn finish(
        &self,
        session: &mut ExposureSession,
        outcome: ExposureOutcome,
        frame: Option<Arc<Frame>>,
    ) {
        *self.last_result.lock() = Some(ExposureResult {
            outcome,
            duration_s: session.duration_s,
            frame,
            finished_at: Utc::now(),
        });
        session.started_at = None;
        session.downloading_since = None;
        self.transition(session, ExposureState::Idle);
    }

    /// Apply the download grace to a cycle whose attachment never came.
    fn settle(&self, session: &mut ExposureSession) {
        if session.state != ExposureState::Downloading {
            return;
        }
        if let Some(since) = session.downloading_since {
            if since.elapsed() > self.download_grace {
                tracing::warn!("No attachment received after exposure, returning to idle");
                self.finish(
                    session,
                    ExposureOutcome::Failed("attachment not received".into()),
                    None,
                );
            }
        }
    }

    fn fail(&self, session: &mut ExposureSession, err: CameraError) {
        tracing::error!(error = %err, "Exposure failed");
        self.exposing.store(false, Ordering::SeqCst);
        self.last_error.record(&err);
        self.transition(session, ExposureState::Error);
        self.finish(session, ExposureOutcome::Failed(err.to_string()), None);
    }

    fn on_exposure_property(&self, event: &PropertyEvent) {
        if !event.is_live() {
            return;
        }
        let property = event.property();
        let mut session = self.session.lock();

        match property.state {
            PropertyState::Busy if session.state != ExposureState::Exposing => {
                let duration = property.number(EXPOSURE_ELEMENT).unwrap_or(0.0);
                tracing::info!(duration_s = duration, "Exposure started by device");
                self.begin(&mut session, duration);
            }
            PropertyState::Ok if session.state == ExposureState::Exposing => {
                self.exposing.store(false, Ordering::SeqCst);
                session.downloading_since = Some(Instant::now());
                self.transition(&mut session, ExposureState::Downloading);
            }
            PropertyState::Alert if session.state.is_active() => {
                self.fail(&mut session, CameraError::ProtocolAlert(EXPOSURE_PROPERTY.into()));
            }
            PropertyState::Idle if session.state == ExposureState::Exposing => {
                tracing::info!("Exposure cancelled by device");
                self.exposing.store(false, Ordering::SeqCst);
                self.transition(&mut session, ExposureState::Aborted);
                self.finish(&mut session, ExposureOutcome::Aborted, None);
            }
            _ => {}
        }
    }

    fn on_attachment(&self, event: &PropertyEvent) -> AppResult<()> {
        if !event.is_live() {
            return Ok(());
        }
        let payload = match event.property().first_blob() {
            Some(payload) if !payload.is_empty() => payload.clone(),
            _ => {
                return Err(CameraError::MalformedAttachment(format!(
                    "{} carried no data",
                    event.name()
                )))
            }
        };

        let mut session = self.session.lock();
        let duration = if session.duration_s > 0.0 {
            session.duration_s
        } else {
            self.hub
                .property(EXPOSURE_PROPERTY)
                .and_then(|p| p.number(EXPOSURE_ELEMENT))
                .unwrap_or(0.0)
        };

        let frame = Arc::new(Frame::new(payload, duration));
        tracing::info!(
            bytes = frame.size(),
            format = ?frame.format,
            duration_s = duration,
            "Frame received"
        );
        self.hub.set_current_frame(Arc::clone(&frame));
        *self.last_duration.lock() = duration;
        self.frames_received.fetch_add(1, Ordering::SeqCst);
        self.exposing.store(false, Ordering::SeqCst);
        session.duration_s = duration;
        self.finish(&mut session, ExposureOutcome::Completed, Some(frame));
        Ok(())
    }
}

impl Component for ExposureComponent {
    fn name(&self) -> &str {
        "ExposureComponent"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[EXPOSURE_PROPERTY, ABORT_PROPERTY, IMAGE_PROPERTY]
    }

    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()> {
        match event.name() {
            EXPOSURE_PROPERTY => {
                self.on_exposure_property(event);
                Ok(())
            }
            IMAGE_PROPERTY => self.on_attachment(event),
            _ => Ok(()),
        }
    }

    fn is_ready(&self) -> bool {
        self.hub.property(EXPOSURE_PROPERTY).is_some()
    }

    fn on_session_lost(&self, code: i32) {
        let mut session = self.session.lock();
        if session.state.is_active() {
            self.fail(&mut session, CameraError::SessionLost(code));
        }
    }
}
