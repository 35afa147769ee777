//! Core library for the indi_camera client.
//!
//! This library drives a single astronomical camera over an INDI-style push
//! protocol: a session hub keeps the property cache and fans events out to
//! camera components (exposure, sequencing, hardware settings, cooling, video,
//! image delivery), and the [`Camera`] facade wires them together.
//!
//! The wire protocol itself sits behind the [`transport::Transport`] trait;
//! [`SimulatedCamera`] and [`MockTransport`] implement it in-process.

pub mod camera;
pub mod components;
pub mod config;
pub mod error;
pub mod frame;
pub mod logging;
pub mod property;
pub mod session;
pub mod transport;

pub use camera::Camera;
pub use components::{
    Component, ExposureOutcome, ExposureResult, ExposureState, FrameType, SequenceProgress,
    TransferFormat, UploadMode,
};
pub use config::CameraConfig;
pub use error::{AppResult, CameraError, ErrorRecord};
pub use frame::{Frame, FrameFormat, QualitySummary};
pub use property::{Element, ElementValue, Property, PropertyKind, PropertyState};
pub use session::{PropertyEvent, SessionHub};
pub use transport::{EventSink, MockTransport, SimulatedCamera, Transport};
