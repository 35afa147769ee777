//! Custom error types for the camera session.
//!
//! This module defines the primary error type, `CameraError`, for the whole crate.
//! Built on `thiserror`, it gives every layer (session hub, property router,
//! components, facade) one consistent failure vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`NotConnected`**: an operation needs a connected device and there is none.
//! - **`AlreadyInProgress`**: an exposure or a sequence is already running; new requests
//!   are rejected, never queued.
//! - **`InvalidArgument`**: non-positive durations or counts, or a setting outside the
//!   range the device advertised.
//! - **`ProtocolAlert`**: the server flagged a property with the `Alert` state.
//! - **`MalformedAttachment`**: a binary attachment was empty or unusable.
//! - **`Timeout`**: something did not happen within its bound (for example an exposure
//!   that never started).
//! - **`SessionLost`**: the transport closed the session.
//! - **`PropertyNotFound`**: the device never defined the property a write needs.
//! - **`NoFrame`**: an image operation ran before any frame was captured.
//! - **`Io`**, **`Config`**, **`Transport`**: wrapped errors from `std::io`, `figment`
//!   and the transport collaborator.
//!
//! Caller-facing operations return [`AppResult`] and also record the failure in a
//! last-error slot, so facades that only want a boolean can still ask for the reason.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, CameraError>;

/// Every failure the camera session can report.
#[derive(Error, Debug)]
pub enum CameraError {
    /// The device is not connected.
    #[error("Device is not connected")]
    NotConnected,

    /// An exclusive operation is already running.
    #[error("{0} already in progress")]
    AlreadyInProgress(&'static str),

    /// A request was rejected before anything was sent.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The device reported `Alert` on a property.
    #[error("Server reported alert on property {0}")]
    ProtocolAlert(String),

    /// A binary attachment could not be used.
    #[error("Malformed binary attachment: {0}")]
    MalformedAttachment(String),

    /// A bounded wait ran out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The transport session closed with the given code.
    #[error("Session lost (code {0})")]
    SessionLost(i32),

    /// The device has not defined a required property or element.
    #[error("Property {0} not defined by device")]
    PropertyNotFound(String),

    /// No frame has been received yet.
    #[error("No frame available")]
    NoFrame,

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),
}

impl CameraError {
    /// Short, stable identifier of the error category (used in structured logs).
    pub fn kind(&self) -> &'static str {
        match self {
            CameraError::NotConnected => "not_connected",
            CameraError::AlreadyInProgress(_) => "already_in_progress",
            CameraError::InvalidArgument(_) => "invalid_argument",
            CameraError::ProtocolAlert(_) => "protocol_alert",
            CameraError::MalformedAttachment(_) => "malformed_attachment",
            CameraError::Timeout(_) => "timeout",
            CameraError::SessionLost(_) => "session_lost",
            CameraError::PropertyNotFound(_) => "property_not_found",
            CameraError::NoFrame => "no_frame",
            CameraError::Io(_) => "io",
            CameraError::Config(_) => "config",
            CameraError::Transport(_) => "transport",
        }
    }
}

/// Holder for the most recent failure of a component's caller-facing operations.
///
/// Errors are kept as rendered messages plus their kind, since the wrapped
/// sources (`std::io::Error`, `figment::Error`) are not `Clone`.
#[derive(Debug, Default)]
pub struct LastError {
    slot: parking_lot::Mutex<Option<ErrorRecord>>,
}

/// A recorded failure: category and rendered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Value of [`CameraError::kind`].
    pub kind: &'static str,
    /// `Display` rendering of the error.
    pub message: String,
}

impl LastError {
    /// Record `err` as the latest failure.
    pub fn record(&self, err: &CameraError) {
        *self.slot.lock() = Some(ErrorRecord {
            kind: err.kind(),
            message: err.to_string(),
        });
    }

    /// Pass a result through, recording its error if any.
    pub fn track<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if let Err(err) = &result {
            self.record(err);
        }
        result
    }

    /// The latest recorded failure.
    pub fn get(&self) -> Option<ErrorRecord> {
        self.slot.lock().clone()
    }

    /// Forget the recorded failure.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CameraError::AlreadyInProgress("Exposure");
        assert_eq!(err.to_string(), "Exposure already in progress");

        let err = CameraError::SessionLost(-1);
        assert_eq!(err.to_string(), "Session lost (code -1)");
    }

    #[test]
    fn test_last_error_tracks_failures_only() {
        let last = LastError::default();
        assert!(last.track::<()>(Ok(())).is_ok());
        assert!(last.get().is_none());

        let _ = last.track::<()>(Err(CameraError::NotConnected));
        let record = last.get().unwrap();
        assert_eq!(record.kind, "not_connected");
        assert_eq!(record.message, "Device is not connected");

        last.clear();
        assert!(last.get().is_none());
    }

    #[test]
    fn test_transport_error_from_anyhow() {
        let err: CameraError = anyhow::anyhow!("socket closed").into();
        assert_eq!(err.kind(), "transport");
        assert!(err.to_string().contains("socket closed"));
    }
}
