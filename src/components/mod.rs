//! Camera components.
//!
//! Each component owns one concern of the camera (exposure control, hardware
//! settings, cooling, ...). Components subscribe to the properties they care
//! about, keep a typed cache updated from property events, and turn caller
//! requests into property mutations sent through the session hub.
//!
//! The session hub is shared (`Arc<SessionHub>`) and components are registered
//! with its router by the composition root; nothing here reaches back into the
//! hub's internals.

use crate::error::{AppResult, CameraError};
use crate::property::{Element, Property};
use crate::session::{PropertyEvent, SessionHub};
use serde::Serialize;

pub mod exposure;
pub mod hardware;
pub mod image;
pub mod sequence;
pub mod temperature;
pub mod video;

pub use exposure::{ExposureComponent, ExposureOutcome, ExposureResult, ExposureState};
pub use hardware::{BayerPattern, Binning, FrameGeometry, FrameType, HardwareComponent, SensorInfo};
pub use image::{ImageComponent, TransferFormat, UploadMode};
pub use sequence::{SequenceOrchestrator, SequenceProgress, SequenceTiming};
pub use temperature::{TemperatureComponent, TemperatureRamp};
pub use video::VideoComponent;

/// Contract every camera component satisfies.
pub trait Component: Send + Sync {
    /// Stable human-readable name.
    fn name(&self) -> &str;

    /// Called once by the composition root before the component is attached.
    fn initialize(&self) -> AppResult<()> {
        Ok(())
    }

    /// Called once on teardown.
    fn destroy(&self) -> AppResult<()> {
        Ok(())
    }

    /// Property names this component wants to receive.
    fn subscriptions(&self) -> &'static [&'static str];

    /// Handle one property event. Errors are logged by the router.
    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()>;

    /// Whether the device has defined what this component needs.
    fn is_ready(&self) -> bool;

    /// The session closed. Runs on the delivery thread.
    fn on_session_lost(&self, _code: i32) {}
}

/// Cached numeric value with its advertised range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct NumberSetting {
    /// Current value.
    pub value: f64,
    /// Advertised minimum.
    pub min: Option<f64>,
    /// Advertised maximum.
    pub max: Option<f64>,
    /// Advertised step.
    pub step: Option<f64>,
}

impl NumberSetting {
    /// Read value and range metadata from a numeric element.
    pub fn from_element(element: &Element) -> Option<Self> {
        Some(Self {
            value: element.as_number()?,
            min: element.min,
            max: element.max,
            step: element.step,
        })
    }

    /// `(min, max)` if the device advertised both.
    pub fn range(&self) -> Option<(f64, f64)> {
        Some((self.min?, self.max?))
    }

    /// Check `value` against the advertised range.
    ///
    /// Bounds the device did not advertise are not enforced. A `min == max == 0`
    /// range is treated as unadvertised.
    pub fn validate(&self, what: &str, value: f64) -> AppResult<()> {
        if !value.is_finite() {
            return Err(CameraError::InvalidArgument(format!("{what} must be finite")));
        }
        if let Some((min, max)) = self.range() {
            if min == 0.0 && max == 0.0 {
                return Ok(());
            }
            if value < min || value > max {
                return Err(CameraError::InvalidArgument(format!(
                    "{what} {value} outside [{min}, {max}]"
                )));
            }
        }
        Ok(())
    }
}

/// Fail with `NotConnected` unless the device is connected.
pub(crate) fn ensure_connected(hub: &SessionHub) -> AppResult<()> {
    if hub.is_connected() {
        Ok(())
    } else {
        Err(CameraError::NotConnected)
    }
}

/// Send a mutation replacing numeric elements of a cached property.
pub(crate) fn send_numbers(
    hub: &SessionHub,
    property: &str,
    values: &[(&str, f64)],
) -> AppResult<()> {
    ensure_connected(hub)?;
    let current = hub.require_property(property)?;
    let request = current
        .with_numbers(values)
        .ok_or_else(|| missing_element(&current, values.first().map_or("", |(e, _)| *e)))?;
    hub.send_mutation(request)
}

/// Send a one-of-many switch mutation.
pub(crate) fn send_exclusive_switch(
    hub: &SessionHub,
    property: &str,
    element: &str,
) -> AppResult<()> {
    ensure_connected(hub)?;
    let current = hub.require_property(property)?;
    let request = current
        .with_exclusive_switch(element)
        .ok_or_else(|| missing_element(&current, element))?;
    hub.send_mutation(request)
}

/// Send a mutation replacing one text element of a cached property.
pub(crate) fn send_text(
    hub: &SessionHub,
    property: &str,
    element: &str,
    value: &str,
) -> AppResult<()> {
    ensure_connected(hub)?;
    let current = hub.require_property(property)?;
    let request = current
        .with_text(element, value)
        .ok_or_else(|| missing_element(&current, element))?;
    hub.send_mutation(request)
}

fn missing_element(property: &Property, element: &str) -> CameraError {
    CameraError::PropertyNotFound(format!("{}.{}", property.name, element))
}

/// Read a numeric element as a [`NumberSetting`].
pub(crate) fn number_setting(property: &Property, element: &str) -> Option<NumberSetting> {
    property.element(element).and_then(NumberSetting::from_element)
}
