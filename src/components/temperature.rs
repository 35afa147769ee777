//! Sensor cooling.
//!
//! Tracks `CCD_TEMPERATURE`, the cooler switch, cooler power and the optional
//! temperature ramp. The device reports `Busy` on `CCD_TEMPERATURE` while it is
//! still moving towards the requested setpoint.

use super::{
    ensure_connected, number_setting, send_exclusive_switch, send_numbers, Component, NumberSetting,
};
use crate::error::{AppResult, CameraError, ErrorRecord, LastError};
use crate::property::{Property, PropertyState};
use crate::session::{PropertyEvent, SessionHub};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

const TEMPERATURE: &str = "CCD_TEMPERATURE";
const TEMPERATURE_ELEMENT: &str = "CCD_TEMPERATURE_VALUE";
const COOLER: &str = "CCD_COOLER";
const COOLER_POWER: &str = "CCD_COOLER_POWER";
const TEMP_RAMP: &str = "CCD_TEMP_RAMP";

/// Cooling ramp parameters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct TemperatureRamp {
    /// Maximum change in °C per minute (0 = unlimited).
    pub slope: f64,
    /// Tolerance in °C at which the setpoint counts as reached.
    pub threshold: f64,
}

#[derive(Debug, Default)]
struct CoolingState {
    current: Option<NumberSetting>,
    target: Option<f64>,
    settling: bool,
    cooler_on: Option<bool>,
    power: Option<f64>,
    ramp: Option<TemperatureRamp>,
}

/// Cooler control and temperature monitoring.
pub struct TemperatureComponent {
    hub: Arc<SessionHub>,
    state: RwLock<CoolingState>,
    last_error: LastError,
}

impl TemperatureComponent {
    /// Component bound to `hub`.
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self {
            hub,
            state: RwLock::new(CoolingState::default()),
            last_error: LastError::default(),
        }
    }

    /// Request a sensor setpoint in °C.
    pub fn set_temperature(&self, celsius: f64) -> AppResult<()> {
        self.last_error.track(self.try_set_temperature(celsius))
    }

    fn try_set_temperature(&self, celsius: f64) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        let current = self.hub.require_property(TEMPERATURE)?;
        let setting = number_setting(&current, TEMPERATURE_ELEMENT)
            .ok_or_else(|| {
                CameraError::PropertyNotFound(format!("{TEMPERATURE}.{TEMPERATURE_ELEMENT}"))
            })?;
        setting.validate("temperature", celsius)?;

        send_numbers(&self.hub, TEMPERATURE, &[(TEMPERATURE_ELEMENT, celsius)])?;
        let mut state = self.state.write();
        state.target = Some(celsius);
        state.settling = true;
        tracing::info!(celsius, "Temperature setpoint requested");
        Ok(())
    }

    /// Last reported sensor temperature.
    pub fn temperature(&self) -> Option<f64> {
        self.state.read().current.map(|t| t.value)
    }

    /// Setpoint most recently requested through this component.
    pub fn target_temperature(&self) -> Option<f64> {
        self.state.read().target
    }

    /// `(min, max)` setpoint range.
    pub fn temperature_range(&self) -> Option<(f64, f64)> {
        self.state.read().current.and_then(|t| t.range())
    }

    /// `true` while the device is still moving to the setpoint.
    pub fn is_settling(&self) -> bool {
        self.state.read().settling
    }

    /// Switch the cooler on.
    pub fn start_cooling(&self) -> AppResult<()> {
        self.switch_cooler(true)
    }

    /// Switch the cooler off.
    pub fn stop_cooling(&self) -> AppResult<()> {
        self.switch_cooler(false)
    }

    fn switch_cooler(&self, on: bool) -> AppResult<()> {
        let element = if on { "COOLER_ON" } else { "COOLER_OFF" };
        let result = send_exclusive_switch(&self.hub, COOLER, element).map(|()| {
            self.state.write().cooler_on = Some(on);
            tracing::info!(on, "Cooler switched");
        });
        self.last_error.track(result)
    }

    /// `false` when unknown.
    pub fn is_cooler_on(&self) -> bool {
        self.state.read().cooler_on.unwrap_or(false)
    }

    /// Whether the device exposes a cooler switch at all.
    pub fn has_cooler(&self) -> bool {
        self.hub.property(COOLER).is_some()
    }

    /// Cooler duty in percent.
    pub fn cooling_power(&self) -> Option<f64> {
        self.state.read().power
    }

    /// Set the ramp slope (degrees per minute) and threshold.
    pub fn set_temperature_ramp(&self, slope: f64, threshold: f64) -> AppResult<()> {
        self.last_error.track(self.try_set_ramp(slope, threshold))
    }

    fn try_set_ramp(&self, slope: f64, threshold: f64) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        let current = self.hub.require_property(TEMP_RAMP)?;
        for (element, value) in [("RAMP_SLOPE", slope), ("RAMP_THRESHOLD", threshold)] {
            if let Some(setting) = number_setting(&current, element) {
                setting.validate(element, value)?;
            }
        }
        send_numbers(
            &self.hub,
            TEMP_RAMP,
            &[("RAMP_SLOPE", slope), ("RAMP_THRESHOLD", threshold)],
        )?;
        self.state.write().ramp = Some(TemperatureRamp { slope, threshold });
        Ok(())
    }

    /// Current ramp settings.
    pub fn temperature_ramp(&self) -> Option<TemperatureRamp> {
        self.state.read().ramp
    }

    /// Most recent failure of a caller-facing operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    fn refresh(&self, property: &Property) {
        let mut state = self.state.write();
        match property.name.as_str() {
            TEMPERATURE => {
                state.current = number_setting(property, TEMPERATURE_ELEMENT);
                match property.state {
                    PropertyState::Busy => state.settling = true,
                    PropertyState::Ok | PropertyState::Idle => state.settling = false,
                    PropertyState::Alert => {
                        state.settling = false;
                        tracing::error!("Device reported cooling alert");
                        self.last_error.record(&CameraError::ProtocolAlert(TEMPERATURE.into()));
                    }
                }
            }
            COOLER => state.cooler_on = property.switch("COOLER_ON"),
            COOLER_POWER => state.power = property.number("CCD_COOLER_VALUE"),
            TEMP_RAMP => {
                if let (Some(slope), Some(threshold)) =
                    (property.number("RAMP_SLOPE"), property.number("RAMP_THRESHOLD"))
                {
                    state.ramp = Some(TemperatureRamp { slope, threshold });
                }
            }
            _ => {}
        }
    }

    fn forget(&self, name: &str) {
        let mut state = self.state.write();
        match name {
            TEMPERATURE => {
                state.current = None;
                state.settling = false;
            }
            COOLER => state.cooler_on = None,
            COOLER_POWER => state.power = None,
            TEMP_RAMP => state.ramp = None,
            _ => {}
        }
    }
}

impl Component for TemperatureComponent {
    fn name(&self) -> &str {
        "TemperatureComponent"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[TEMPERATURE, COOLER, COOLER_POWER, TEMP_RAMP]
    }

    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()> {
        match event {
            PropertyEvent::Removed(p) => self.forget(&p.name),
            PropertyEvent::Defined(p) | PropertyEvent::Updated(p) => self.refresh(p),
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.hub.property(TEMPERATURE).is_some()
    }

    fn on_session_lost(&self, _code: i32) {
        *self.state.write() = CoolingState::default();
    }
}
