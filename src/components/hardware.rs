//! Sensor hardware settings: gain, offset, region of interest, binning, frame
//! type and static sensor information, plus the optional shutter, fan and
//! colour filter array.
//!
//! Writes validate against the range the device advertised, send a mutation and
//! then record the requested value in the cache. The next device update replaces
//! it with the acknowledged value.

use super::{
    ensure_connected, number_setting, send_exclusive_switch, send_numbers, Component, NumberSetting,
};
use crate::error::{AppResult, CameraError, ErrorRecord, LastError};
use crate::property::Property;
use crate::session::{PropertyEvent, SessionHub};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

const GAIN: &str = "CCD_GAIN";
const OFFSET: &str = "CCD_OFFSET";
const FRAME: &str = "CCD_FRAME";
const BINNING: &str = "CCD_BINNING";
const INFO: &str = "CCD_INFO";
const FRAME_TYPE: &str = "CCD_FRAME_TYPE";
const SHUTTER: &str = "CCD_SHUTTER";
const FAN: &str = "CCD_FAN";
const CFA: &str = "CCD_CFA";

/// Region of interest in unbinned sensor pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameGeometry {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Pixel binning factors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Binning {
    /// Horizontal factor.
    pub horizontal: u32,
    /// Vertical factor.
    pub vertical: u32,
}

impl Default for Binning {
    fn default() -> Self {
        Self {
            horizontal: 1,
            vertical: 1,
        }
    }
}

/// Static sensor description from `CCD_INFO`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SensorInfo {
    /// Sensor width in pixels.
    pub max_x: u32,
    /// Sensor height in pixels.
    pub max_y: u32,
    /// Pixel size in micrometres.
    pub pixel_size: f64,
    /// Pixel width in micrometres.
    pub pixel_size_x: f64,
    /// Pixel height in micrometres.
    pub pixel_size_y: f64,
    /// Bits per pixel.
    pub bits_per_pixel: u32,
}

impl Default for SensorInfo {
    fn default() -> Self {
        Self {
            max_x: 0,
            max_y: 0,
            pixel_size: 0.0,
            pixel_size_x: 0.0,
            pixel_size_y: 0.0,
            bits_per_pixel: 16,
        }
    }
}

/// Kind of calibration or science frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FrameType {
    /// Science frame.
    #[default]
    Light,
    /// Zero-length calibration frame.
    Bias,
    /// Shutter-closed calibration frame.
    Dark,
    /// Flat-field calibration frame.
    Flat,
}

impl FrameType {
    fn element(self) -> &'static str {
        match self {
            FrameType::Light => "FRAME_LIGHT",
            FrameType::Bias => "FRAME_BIAS",
            FrameType::Dark => "FRAME_DARK",
            FrameType::Flat => "FRAME_FLAT",
        }
    }

    fn from_element(name: &str) -> Option<Self> {
        match name {
            "FRAME_LIGHT" => Some(FrameType::Light),
            "FRAME_BIAS" => Some(FrameType::Bias),
            "FRAME_DARK" => Some(FrameType::Dark),
            "FRAME_FLAT" => Some(FrameType::Flat),
            _ => None,
        }
    }
}

/// Colour filter array layout of the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum BayerPattern {
    /// No colour filter.
    Mono,
    /// Red, green / green, blue.
    Rggb,
    /// Blue, green / green, red.
    Bggr,
    /// Green, red / blue, green.
    Grbg,
    /// Green, blue / red, green.
    Gbrg,
}

impl BayerPattern {
    /// Parse the `CFA_TYPE` text a driver advertises. An empty value means mono.
    pub fn from_cfa(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "" | "MONO" => Some(BayerPattern::Mono),
            "RGGB" => Some(BayerPattern::Rggb),
            "BGGR" => Some(BayerPattern::Bggr),
            "GRBG" => Some(BayerPattern::Grbg),
            "GBRG" => Some(BayerPattern::Gbrg),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct HardwareSettings {
    gain: Option<NumberSetting>,
    offset: Option<NumberSetting>,
    frame: Option<FrameGeometry>,
    binning: Option<Binning>,
    max_binning: Option<Binning>,
    info: Option<SensorInfo>,
    frame_type: Option<FrameType>,
    shutter_open: Option<bool>,
    fan: Option<NumberSetting>,
    bayer: Option<BayerPattern>,
}

/// Gain, offset, ROI, binning, sensor information and optional peripherals.
pub struct HardwareComponent {
    hub: Arc<SessionHub>,
    settings: RwLock<HardwareSettings>,
    last_error: LastError,
}

impl HardwareComponent {
    /// Component bound to `hub`; the cache fills from device events.
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self {
            hub,
            settings: RwLock::new(HardwareSettings::default()),
            last_error: LastError::default(),
        }
    }

    // =========================================================================
    // Gain / offset
    // =========================================================================

    /// Request a gain within the advertised range.
    pub fn set_gain(&self, gain: f64) -> AppResult<()> {
        let result = self.write_number(GAIN, "GAIN", "gain", gain, |s| &mut s.gain);
        self.last_error.track(result)
    }

    /// Last known gain.
    pub fn gain(&self) -> Option<f64> {
        self.settings.read().gain.map(|g| g.value)
    }

    /// `(min, max)` advertised for gain.
    pub fn gain_range(&self) -> Option<(f64, f64)> {
        self.settings.read().gain.and_then(|g| g.range())
    }

    /// Request an offset within the advertised range.
    pub fn set_offset(&self, offset: f64) -> AppResult<()> {
        let result = self.write_number(OFFSET, "OFFSET", "offset", offset, |s| &mut s.offset);
        self.last_error.track(result)
    }

    /// Last known offset.
    pub fn offset(&self) -> Option<f64> {
        self.settings.read().offset.map(|o| o.value)
    }

    /// `(min, max)` advertised for offset.
    pub fn offset_range(&self) -> Option<(f64, f64)> {
        self.settings.read().offset.and_then(|o| o.range())
    }

    fn write_number(
        &self,
        property: &str,
        element: &str,
        what: &str,
        value: f64,
        slot: impl FnOnce(&mut HardwareSettings) -> &mut Option<NumberSetting>,
    ) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        let current = self.hub.require_property(property)?;
        let setting = number_setting(&current, element)
            .ok_or_else(|| CameraError::PropertyNotFound(format!("{property}.{element}")))?;
        setting.validate(what, value)?;

        send_numbers(&self.hub, property, &[(element, value)])?;
        let mut settings = self.settings.write();
        *slot(&mut *settings) = Some(NumberSetting { value, ..setting });
        tracing::debug!(property, value, "Setting requested");
        Ok(())
    }

    // =========================================================================
    // Region of interest / binning
    // =========================================================================

    /// Set the region of interest, validated against the sensor size.
    pub fn set_resolution(&self, x: u32, y: u32, width: u32, height: u32) -> AppResult<()> {
        self.last_error.track(self.try_set_resolution(x, y, width, height))
    }

    fn try_set_resolution(&self, x: u32, y: u32, width: u32, height: u32) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        if width == 0 || height == 0 {
            return Err(CameraError::InvalidArgument(
                "frame width and height must be positive".into(),
            ));
        }
        if let Some((max_x, max_y)) = self.max_resolution() {
            if x as u64 + width as u64 > max_x as u64 || y as u64 + height as u64 > max_y as u64 {
                return Err(CameraError::InvalidArgument(format!(
                    "frame {width}x{height}+{x}+{y} exceeds sensor {max_x}x{max_y}"
                )));
            }
        }

        send_numbers(
            &self.hub,
            FRAME,
            &[
                ("X", x as f64),
                ("Y", y as f64),
                ("WIDTH", width as f64),
                ("HEIGHT", height as f64),
            ],
        )?;
        self.settings.write().frame = Some(FrameGeometry { x, y, width, height });
        Ok(())
    }

    /// Current region of interest.
    pub fn resolution(&self) -> Option<FrameGeometry> {
        self.settings.read().frame
    }

    /// Sensor size in pixels, from `CCD_INFO`.
    pub fn max_resolution(&self) -> Option<(u32, u32)> {
        self.settings
            .read()
            .info
            .filter(|i| i.max_x > 0 && i.max_y > 0)
            .map(|i| (i.max_x, i.max_y))
    }

    /// Request binning, bounded by the advertised maximum.
    pub fn set_binning(&self, horizontal: u32, vertical: u32) -> AppResult<()> {
        self.last_error.track(self.try_set_binning(horizontal, vertical))
    }

    fn try_set_binning(&self, horizontal: u32, vertical: u32) -> AppResult<()> {
        ensure_connected(&self.hub)?;
        if horizontal == 0 || vertical == 0 {
            return Err(CameraError::InvalidArgument("binning must be at least 1".into()));
        }
        if let Some(max) = self.settings.read().max_binning {
            if horizontal > max.horizontal || vertical > max.vertical {
                return Err(CameraError::InvalidArgument(format!(
                    "binning {horizontal}x{vertical} exceeds {}x{}",
                    max.horizontal, max.vertical
                )));
            }
        }

        send_numbers(
            &self.hub,
            BINNING,
            &[("HOR_BIN", horizontal as f64), ("VER_BIN", vertical as f64)],
        )?;
        self.settings.write().binning = Some(Binning {
            horizontal,
            vertical,
        });
        Ok(())
    }

    /// Current binning.
    pub fn binning(&self) -> Option<Binning> {
        self.settings.read().binning
    }

    // =========================================================================
    // Sensor info / frame type
    // =========================================================================

    /// Static sensor description.
    pub fn sensor_info(&self) -> Option<SensorInfo> {
        self.settings.read().info
    }

    /// Pixel size in micrometres.
    pub fn pixel_size(&self) -> Option<f64> {
        self.settings.read().info.map(|i| i.pixel_size)
    }

    /// Bits per pixel.
    pub fn bit_depth(&self) -> Option<u32> {
        self.settings.read().info.map(|i| i.bits_per_pixel)
    }

    /// Select the kind of frame the next exposures produce.
    pub fn set_frame_type(&self, frame_type: FrameType) -> AppResult<()> {
        let result = send_exclusive_switch(&self.hub, FRAME_TYPE, frame_type.element()).map(|()| {
            self.settings.write().frame_type = Some(frame_type);
        });
        self.last_error.track(result)
    }

    /// Current frame type.
    pub fn frame_type(&self) -> Option<FrameType> {
        self.settings.read().frame_type
    }

    // =========================================================================
    // Shutter / fan / colour filter array
    // =========================================================================

    /// Whether the connected device exposes a mechanical shutter.
    pub fn has_shutter(&self) -> bool {
        self.hub.is_connected() && self.hub.property(SHUTTER).is_some()
    }

    /// Open or close the shutter.
    pub fn set_shutter(&self, open: bool) -> AppResult<()> {
        let element = if open { "SHUTTER_OPEN" } else { "SHUTTER_CLOSE" };
        let result = send_exclusive_switch(&self.hub, SHUTTER, element).map(|()| {
            self.settings.write().shutter_open = Some(open);
            tracing::debug!(open, "Shutter requested");
        });
        self.last_error.track(result)
    }

    /// `Some(true)` when the shutter is open.
    pub fn shutter_open(&self) -> Option<bool> {
        self.settings.read().shutter_open
    }

    /// Whether the connected device exposes fan control.
    pub fn has_fan(&self) -> bool {
        self.hub.is_connected() && self.hub.property(FAN).is_some()
    }

    /// Request a fan speed within the advertised range.
    pub fn set_fan_speed(&self, speed: f64) -> AppResult<()> {
        let result = self.write_number(FAN, "FAN_SPEED", "fan speed", speed, |s| &mut s.fan);
        self.last_error.track(result)
    }

    /// Last known fan speed.
    pub fn fan_speed(&self) -> Option<f64> {
        self.settings.read().fan.map(|f| f.value)
    }

    /// Colour filter layout, from `CCD_CFA` or a local override.
    pub fn bayer_pattern(&self) -> Option<BayerPattern> {
        self.settings.read().bayer
    }

    /// Override the colour filter layout. The next `CCD_CFA` update replaces it.
    pub fn set_bayer_pattern(&self, pattern: BayerPattern) {
        self.settings.write().bayer = Some(pattern);
    }

    /// `true` for sensors with a colour filter array.
    pub fn is_color(&self) -> bool {
        self.bayer_pattern().is_some_and(|p| p != BayerPattern::Mono)
    }

    /// Most recent failure of a caller-facing operation.
    pub fn last_error(&self) -> Option<ErrorRecord> {
        self.last_error.get()
    }

    fn refresh(&self, property: &Property) {
        let mut settings = self.settings.write();
        match property.name.as_str() {
            GAIN => settings.gain = number_setting(property, "GAIN"),
            OFFSET => settings.offset = number_setting(property, "OFFSET"),
            FRAME => {
                let n = |e: &str| property.number(e).map(|v| v.max(0.0) as u32);
                if let (Some(x), Some(y), Some(width), Some(height)) =
                    (n("X"), n("Y"), n("WIDTH"), n("HEIGHT"))
                {
                    settings.frame = Some(FrameGeometry { x, y, width, height });
                }
            }
            BINNING => {
                let h = number_setting(property, "HOR_BIN");
                let v = number_setting(property, "VER_BIN");
                if let (Some(h), Some(v)) = (h, v) {
                    settings.binning = Some(Binning {
                        horizontal: h.value.max(1.0) as u32,
                        vertical: v.value.max(1.0) as u32,
                    });
                    settings.max_binning = match (h.max, v.max) {
                        (Some(mh), Some(mv)) if mh >= 1.0 && mv >= 1.0 => Some(Binning {
                            horizontal: mh as u32,
                            vertical: mv as u32,
                        }),
                        _ => None,
                    };
                }
            }
            INFO => {
                let n = |e: &str| property.number(e);
                let defaults = SensorInfo::default();
                let pixel_size = n("CCD_PIXEL_SIZE").unwrap_or(defaults.pixel_size);
                settings.info = Some(SensorInfo {
                    max_x: n("CCD_MAX_X").map_or(0, |v| v.max(0.0) as u32),
                    max_y: n("CCD_MAX_Y").map_or(0, |v| v.max(0.0) as u32),
                    pixel_size,
                    pixel_size_x: n("CCD_PIXEL_SIZE_X").unwrap_or(pixel_size),
                    pixel_size_y: n("CCD_PIXEL_SIZE_Y").unwrap_or(pixel_size),
                    bits_per_pixel: n("CCD_BITSPERPIXEL")
                        .map_or(defaults.bits_per_pixel, |v| v as u32),
                });
            }
            FRAME_TYPE => {
                settings.frame_type = property.active_switch().and_then(FrameType::from_element);
            }
            SHUTTER => settings.shutter_open = property.switch("SHUTTER_OPEN"),
            FAN => settings.fan = number_setting(property, "FAN_SPEED"),
            CFA => {
                let cfa = property.text("CFA_TYPE").unwrap_or_default();
                settings.bayer = BayerPattern::from_cfa(cfa);
                if settings.bayer.is_none() {
                    tracing::warn!(cfa, "Unrecognised colour filter layout");
                }
            }
            _ => {}
        }
    }

    fn forget(&self, name: &str) {
        let mut settings = self.settings.write();
        match name {
            GAIN => settings.gain = None,
            OFFSET => settings.offset = None,
            FRAME => settings.frame = None,
            BINNING => {
                settings.binning = None;
                settings.max_binning = None;
            }
            INFO => settings.info = None,
            FRAME_TYPE => settings.frame_type = None,
            SHUTTER => settings.shutter_open = None,
            FAN => settings.fan = None,
            CFA => settings.bayer = None,
            _ => {}
        }
    }
}

impl Component for HardwareComponent {
    fn name(&self) -> &str {
        "HardwareComponent"
    }

    fn subscriptions(&self) -> &'static [&'static str] {
        &[GAIN, OFFSET, FRAME, BINNING, INFO, FRAME_TYPE, SHUTTER, FAN, CFA]
    }

    fn handle_event(&self, event: &PropertyEvent) -> AppResult<()> {
        match event {
            PropertyEvent::Removed(p) => self.forget(&p.name),
            PropertyEvent::Defined(p) | PropertyEvent::Updated(p) => self.refresh(p),
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.hub.property(INFO).is_some()
    }

    fn on_session_lost(&self, _code: i32) {
        *self.settings.write() = HardwareSettings::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Element, PropertyKind, PropertyState};
    use crate::transport::MockTransport;
    use std::time::Duration;

    const DEVICE: &str = "CCD Simulator";

    fn fixture() -> (MockTransport, Arc<HardwareComponent>) {
        let transport = MockTransport::new();
        let hub = SessionHub::new(Arc::new(transport.clone()));
        let hardware = Arc::new(HardwareComponent::new(hub.clone()));
        let component: Arc<dyn Component> = hardware.clone();
        hub.router().attach(&component);
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();

        transport.emit_define(
            Property::new(DEVICE, "CONNECTION", PropertyKind::Switch)
                .with_state(PropertyState::Ok)
                .with_element(Element::switch("CONNECT", true)),
        );
        transport.emit_define(
            Property::new(DEVICE, GAIN, PropertyKind::Number)
                .with_element(Element::number_with_range("GAIN", 10.0, 0.0, 100.0, 1.0)),
        );
        transport.emit_define(
            Property::new(DEVICE, BINNING, PropertyKind::Number)
                .with_element(Element::number_with_range("HOR_BIN", 1.0, 1.0, 4.0, 1.0))
                .with_element(Element::number_with_range("VER_BIN", 1.0, 1.0, 4.0, 1.0)),
        );
        transport.emit_define(
            Property::new(DEVICE, FRAME, PropertyKind::Number)
                .with_element(Element::number("X", 0.0))
                .with_element(Element::number("Y", 0.0))
                .with_element(Element::number("WIDTH", 640.0))
                .with_element(Element::number("HEIGHT", 480.0)),
        );
        transport.emit_define(
            Property::new(DEVICE, INFO, PropertyKind::Number)
                .with_element(Element::number("CCD_MAX_X", 640.0))
                .with_element(Element::number("CCD_MAX_Y", 480.0))
                .with_element(Element::number("CCD_PIXEL_SIZE", 3.75))
                .with_element(Element::number("CCD_BITSPERPIXEL", 12.0)),
        );
        transport.emit_define(
            Property::new(DEVICE, FRAME_TYPE, PropertyKind::Switch)
                .with_element(Element::switch("FRAME_LIGHT", true))
                .with_element(Element::switch("FRAME_DARK", false)),
        );
        (transport, hardware)
    }

    #[test]
    fn test_cache_follows_device() {
        let (_transport, hw) = fixture();
        assert_eq!(hw.gain(), Some(10.0));
        assert_eq!(hw.gain_range(), Some((0.0, 100.0)));
        assert_eq!(hw.binning(), Some(Binning::default()));
        assert_eq!(hw.max_resolution(), Some((640, 480)));
        assert_eq!(hw.pixel_size(), Some(3.75));
        assert_eq!(hw.sensor_info().unwrap().pixel_size_x, 3.75);
        assert_eq!(hw.bit_depth(), Some(12));
        assert_eq!(hw.frame_type(), Some(FrameType::Light));
        assert!(hw.offset().is_none());
        assert!(hw.is_ready());
    }

    #[test]
    fn test_set_gain_validates_and_sends() {
        let (transport, hw) = fixture();
        hw.set_gain(42.0).unwrap();
        assert_eq!(transport.last_sent(GAIN).unwrap().number("GAIN"), Some(42.0));
        assert_eq!(hw.gain(), Some(42.0));

        transport.clear_sent();
        assert!(matches!(hw.set_gain(101.0), Err(CameraError::InvalidArgument(_))));
        assert!(transport.sent().is_empty());
        assert_eq!(hw.gain(), Some(42.0));
        assert_eq!(hw.last_error().unwrap().kind, "invalid_argument");
    }

    #[test]
    fn test_set_offset_requires_property() {
        let (_transport, hw) = fixture();
        assert!(matches!(hw.set_offset(5.0), Err(CameraError::PropertyNotFound(_))));
    }

    #[test]
    fn test_resolution_and_binning_limits() {
        let (transport, hw) = fixture();
        hw.set_resolution(10, 10, 320, 240).unwrap();
        let sent = transport.last_sent(FRAME).unwrap();
        assert_eq!(sent.number("WIDTH"), Some(320.0));
        assert_eq!(hw.resolution().unwrap().x, 10);

        assert!(hw.set_resolution(400, 0, 320, 240).is_err());
        assert!(hw.set_resolution(0, 0, 0, 240).is_err());

        hw.set_binning(2, 2).unwrap();
        assert_eq!(hw.binning(), Some(Binning { horizontal: 2, vertical: 2 }));
        assert!(hw.set_binning(8, 1).is_err());
    }

    #[test]
    fn test_frame_type_switch() {
        let (transport, hw) = fixture();
        hw.set_frame_type(FrameType::Dark).unwrap();
        let sent = transport.last_sent(FRAME_TYPE).unwrap();
        assert_eq!(sent.active_switch(), Some("FRAME_DARK"));
        assert_eq!(hw.frame_type(), Some(FrameType::Dark));

        // FRAME_FLAT is not advertised by this device
        assert!(hw.set_frame_type(FrameType::Flat).is_err());
    }

    #[test]
    fn test_writes_require_connection() {
        let (transport, hw) = fixture();
        transport.close_session(-1);
        assert!(matches!(hw.set_gain(1.0), Err(CameraError::NotConnected)));
        assert!(hw.gain().is_none());
    }

    #[test]
    fn test_shutter_and_fan() {
        let (transport, hw) = fixture();
        assert!(!hw.has_shutter());
        assert!(!hw.has_fan());
        assert!(matches!(hw.set_shutter(true), Err(CameraError::PropertyNotFound(_))));

        transport.emit_define(
            Property::new(DEVICE, SHUTTER, PropertyKind::Switch)
                .with_element(Element::switch("SHUTTER_OPEN", false))
                .with_element(Element::switch("SHUTTER_CLOSE", true)),
        );
        transport.emit_define(
            Property::new(DEVICE, FAN, PropertyKind::Number)
                .with_element(Element::number_with_range("FAN_SPEED", 20.0, 0.0, 100.0, 1.0)),
        );
        assert!(hw.has_shutter());
        assert_eq!(hw.shutter_open(), Some(false));
        assert_eq!(hw.fan_speed(), Some(20.0));

        hw.set_shutter(true).unwrap();
        assert_eq!(transport.last_sent(SHUTTER).unwrap().active_switch(), Some("SHUTTER_OPEN"));
        assert_eq!(hw.shutter_open(), Some(true));

        hw.set_fan_speed(80.0).unwrap();
        assert_eq!(transport.last_sent(FAN).unwrap().number("FAN_SPEED"), Some(80.0));
        assert_eq!(hw.fan_speed(), Some(80.0));
        assert!(matches!(hw.set_fan_speed(150.0), Err(CameraError::InvalidArgument(_))));

        transport.close_session(-1);
        assert!(!hw.has_shutter());
        assert!(hw.shutter_open().is_none());
    }

    #[test]
    fn test_bayer_pattern_from_device_and_override() {
        let (transport, hw) = fixture();
        assert!(!hw.is_color());
        assert!(hw.bayer_pattern().is_none());

        let cfa = |layout: &str| {
            Property::new(DEVICE, CFA, PropertyKind::Text)
                .with_element(Element::text("CFA_OFFSET_X", "0"))
                .with_element(Element::text("CFA_OFFSET_Y", "0"))
                .with_element(Element::text("CFA_TYPE", layout))
        };
        transport.emit_define(cfa("GRBG"));
        assert_eq!(hw.bayer_pattern(), Some(BayerPattern::Grbg));
        assert!(hw.is_color());

        hw.set_bayer_pattern(BayerPattern::Mono);
        assert!(!hw.is_color());

        transport.emit_update(cfa("rggb"));
        assert_eq!(hw.bayer_pattern(), Some(BayerPattern::Rggb));

        transport.emit_update(cfa("CYGM"));
        assert!(hw.bayer_pattern().is_none());
        assert!(!hw.is_color());
    }

    #[test]
    fn test_bayer_pattern_parsing() {
        assert_eq!(BayerPattern::from_cfa(""), Some(BayerPattern::Mono));
        assert_eq!(BayerPattern::from_cfa(" bggr "), Some(BayerPattern::Bggr));
        assert_eq!(BayerPattern::from_cfa("GBRG"), Some(BayerPattern::Gbrg));
        assert_eq!(BayerPattern::from_cfa("XYZ"), None);
    }

    #[test]
    fn test_removed_property_clears_cache() {
        let (transport, hw) = fixture();
        transport.emit_remove(DEVICE, GAIN);
        assert!(hw.gain().is_none());
    }
}
