//! Image delivery settings and frame statistics.
//!
//! Controls how the device packages frames (`CCD_TRANSFER_FORMAT`,
//! `CCD_COMPRESSION`) and where it sends them (`UPLOAD_MODE`). The quality
//! summary of the most recent frame is available through
//! [`ImageComponent::frame_statistics`].

use super::{send_exclusive_switch, Component};
use crate::error::{AppResult, ErrorRecord, LastError};
use crate::frame::{FrameFormat, QualitySummary};
use crate::property::Property;
use crate::session::{PropertyEvent, SessionHub};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

const TRANSFER_FORMAT: &str = "CCD_TRANSFER_FORMAT";
const COMPRESSION: &str = "CCD_COMPRESSION";
const UPLOAD_MODE: &str = "UPLOAD_MODE";

/// Encoding the device uses for attachments.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TransferFormat {
    /// FITS images.
    Fits,
    /// Camera-native (often JPEG or raw) output.
    Native,
    /// XISF images.
    Xisf,
}

impl TransferFormat {
    fn element(self) -> &'static str {
        match self {
            TransferFormat::Fits => "FORMAT_FITS",
            TransferFormat::Native => "FORMAT_NATIVE",
            TransferFormat::Xisf => "FORMAT_XISF",
        }
    }

    fn from_element(name: &str) -> Option<Self> {
        match name {
            "FORMAT_FITS" => Some(TransferFormat::Fits),
            "FORMAT_NATIVE" => Some(TransferFormat::Native),
            "FORMAT_XISF" => Some(TransferFormat::Xisf),
            _ => None,
        }
    }
}

/// Where the device delivers frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum UploadMode {
    /// Attachments are pushed to the client.
    Client,
    /// Frames are written on the server host only.
    Local,
    /// Delivered to the client and written locally.
    Both,
}

impl UploadMode {
    fn element(self) -> &'static str {
        match self {
            UploadMode::Client => "UPLOAD_CLIENT",
            UploadMode::Local => "UPLOAD_LOCAL",
            UploadMode::Both => "UPLOAD_BOTH",
        }
    }

    fn from_element(name: &str) -> Option<Self> {
        match name {
            "UPLOAD_CLIENT" => Some(UploadMode::Client),
            "UPLOAD_LOCAL" => Some(UploadMode::Local),
            "UPLOAD_BOTH" => Some(UploadMode::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ImageSettings {
    format: Option<TransferFormat>,
    compression: Option<bool>,
    upload: Option<UploadMode>,
}

/// Transfer format, compression, upload mode and frame statistics.
pub struct ImageComponent {
    hub: Arc<SessionHub>,
    settings: RwLock<ImageSettings>,
    last_error: LastError,
}

impl ImageComponent {
    /// Component bound to `hub`.
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self {
            hub,
            settings: RwLock::new(ImageSettings::default()),
            last_error: LastError::default(),
        }
    }

    /// Select the attachment encoding.
    pub fn set_transfer_format(&self, format: TransferFormat) -> AppResult<()> {
        let result = send_exclusive_switch(&self.hub, TRANSFER_FORMAT, format.element())
            .map(|()| self.settings.write().format = Some(format));
        self.last_error.track(result)
    }

    /// Current attachment encoding.
    pub fn transfer_format(&self) -> Option<TransferFormat> {
        self.settings.read().format
    }

    /// Enable or disable attachment compression.
    pub fn set_compression(&self, enabled: bool) -> AppResult<()> {
        let element = if enabled { "INDI_ENABLED" } else { "INDI_DISABLED" };
        let result = send_exclusive_switch(&self.hub, COMPRESSION, element)
            .map(|()| self.settings.write().compression = Some(enabled));
        self.last_error.track(result)
    }

    /// `false` when unknown.
    pub fn is_compression_enabled(&self) -> bool {
        self.settings.read().compression.unwrap_or(false)
    }

    /// Select where frames are delivered.
    pub fn set_upload_mode(&self, mode: UploadMode) -> AppResult<()> {
        let result = send_exclusive_switch(&self.hub, UPLOAD_MODE, mode.element())
            .map(|()| self.settings.write().upload = Some(mode));
        if result.is_ok() && mode == UploadMode::Local {
            tracing::warn!("Upload mode is local; frames will not reach this client");
        }
        self.last_error.track(result)
    }

    /// Current delivery target.
    pub fn upload_mode(&self) -> Option<UploadMode> {
        self.settings.read().upload
    }

    /// Statistics of the current frame, when its format is understood.
    pub fn frame_statistics(&self) -> Option<QualitySummary> {
        self.hub.current_frame().and_then(|f| f.quality)
    }

    /// Detected format of the current frame.
    pub fn last_frame_format(&self) -> Option<FrameFormat> {
        self.hub.current_frame().map(|f| f.format)
    }

    /// Most recent failure of a caller-facing operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    fn refresh(&self, property: &Property) {
        let active = property.active_switch();
        let mut settings = self.settings.write();
        match property.name.as_str() {
            TRANSFER_FORMAT => settings.format = active.and_then(TransferFormat::from_element),
            COMPRESSION => settings.compression = property.switch("INDI_ENABLED"),
            UPLOAD_MODE => settings.upload = active.and_then(UploadMode::from_element),
            _ => {}
        }
    }

    fn forget(&self, name: &str) {
        let mut settings = self.settings.write();
        match name {
            TRANSFER_FORMAT => settings.format = None,
            COMPRESSION => settings.compression = None,
            UPLOAD_MODE => settings.upload = None,
            _ => {}
        }
    }
}

impl Component for ImageComponent {
    fn name(&self) -> &str {
        "ImageComponent"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[TRANSFER_FORMAT, COMPRESSION, UPLOAD_MODE]
    }

    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()> {
        match event {
            PropertyEvent::Removed(p) => self.forget(&p.name),
            PropertyEvent::Defined(p) | PropertyEvent::Updated(p) => self.refresh(p),
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.hub.property(UPLOAD_MODE).is_some()
    }

    fn on_session_lost(&self, _code: i32) {
        *self.settings.write() = ImageSettings::default();
    }
}
