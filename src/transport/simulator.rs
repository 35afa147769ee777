//! Simulated CCD driver
//!
//! `SimulatedCamera` is an in-process stand-in for a device server hosting one CCD.
//! It behaves like a real driver as seen from the client:
//!
//! - `watch_device` announces the device with `CONNECTION` and `DRIVER_INFO`
//! - switching `CONNECTION` on defines the camera properties, then reports Ok
//! - exposures go Busy, then Ok after the (scaled) duration, then deliver a FITS
//!   frame on `CCD1`
//! - abort cancels the pending frame
//!
//! All events reach the sink on one delivery thread, in emission order.
//! `time_scale` shrinks every simulated delay (0.01 turns a 1 s exposure into 10 ms).

use super::{EventSink, Transport};
use crate::frame::encode_fits_u16;
use crate::property::{Element, ElementValue, Property, PropertyKind, PropertyState};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sensor bias level in ADU.
const BIAS_ADU: f64 = 1000.0;
/// Dark signal accumulated per second of exposure, in ADU.
const DARK_ADU_PER_S: f64 = 50.0;
/// Simulated cooler settle time before scaling.
const COOLER_SETTLE: Duration = Duration::from_millis(200);

enum SimEvent {
    Appeared(String),
    Defined(Property),
    Updated(Property),
    Removed(String, String),
    Closed(i32),
}

/// In-process simulated camera driver.
#[derive(Clone)]
pub struct SimulatedCamera {
    state: Arc<SimState>,
}

struct SimState {
    device: String,
    time_scale: f64,
    live: AtomicBool,
    device_connected: AtomicBool,
    properties: Mutex<Vec<Property>>,
    outbox: Mutex<Option<mpsc::Sender<SimEvent>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
    exposure_generation: AtomicU64,
    fail_next_exposure: AtomicBool,
    empty_next_attachment: AtomicBool,
}

impl SimulatedCamera {
    /// Simulated 64x48 sensor named `device`, real-time delays.
    pub fn new(device: impl Into<String>) -> Self {
        Self::with_options(device, 64, 48, 1.0)
    }

    /// Fully parameterised constructor.
    pub fn with_options(
        device: impl Into<String>,
        width: u32,
        height: u32,
        time_scale: f64,
    ) -> Self {
        let device = device.into();
        let properties = initial_properties(&device, width, height);
        Self {
            state: Arc::new(SimState {
                device,
                time_scale: time_scale.max(0.0),
                live: AtomicBool::new(false),
                device_connected: AtomicBool::new(false),
                properties: Mutex::new(properties),
                outbox: Mutex::new(None),
                delivery: Mutex::new(None),
                exposure_generation: AtomicU64::new(0),
                fail_next_exposure: AtomicBool::new(false),
                empty_next_attachment: AtomicBool::new(false),
            }),
        }
    }

    /// Builder: scale all simulated delays.
    pub fn with_time_scale(self, time_scale: f64) -> Self {
        let (width, height) = self.sensor_size();
        Self::with_options(self.state.device.clone(), width, height, time_scale)
    }

    /// Device name this driver answers to.
    pub fn device(&self) -> &str {
        &self.state.device
    }

    /// Sensor dimensions as advertised in `CCD_INFO`.
    pub fn sensor_size(&self) -> (u32, u32) {
        let props = self.state.properties.lock();
        let info = props.iter().find(|p| p.name == "CCD_INFO");
        let dim = |e: &str| info.and_then(|p| p.number(e)).unwrap_or(0.0) as u32;
        (dim("CCD_MAX_X"), dim("CCD_MAX_Y"))
    }

    /// The next exposure ends with an `Alert` instead of a frame.
    pub fn fail_next_exposure(&self) {
        self.state.fail_next_exposure.store(true, Ordering::SeqCst);
    }

    /// The next exposure delivers an empty attachment.
    pub fn send_empty_next_attachment(&self) {
        self.state.empty_next_attachment.store(true, Ordering::SeqCst);
    }

    /// Push an arbitrary property update, as a driver would on its own.
    pub fn push_update(&self, property: Property) {
        self.state.store(&property);
        self.state.emit(SimEvent::Updated(property));
    }

    /// Drop the session as if the server died.
    pub fn drop_session(&self, code: i32) {
        tracing::info!(code, "Simulated server dropping session");
        self.state.live.store(false, Ordering::SeqCst);
        self.state.device_connected.store(false, Ordering::SeqCst);
        self.state.exposure_generation.fetch_add(1, Ordering::SeqCst);
        self.state.emit(SimEvent::Closed(code));
        self.state.outbox.lock().take();
    }
}

impl SimState {
    fn emit(&self, event: SimEvent) {
        if let Some(tx) = self.outbox.lock().as_ref() {
            // receiver gone means the session ended
            let _ = tx.send(event);
        }
    }

    fn scaled(&self, d: Duration) -> Duration {
        d.mul_f64(self.time_scale)
    }

    fn snapshot(&self, name: &str) -> Option<Property> {
        self.properties.lock().iter().find(|p| p.name == name).cloned()
    }

    fn store(&self, property: &Property) {
        let mut props = self.properties.lock();
        match props.iter_mut().find(|p| p.name == property.name) {
            Some(existing) => *existing = property.clone(),
            None => props.push(property.clone()),
        }
    }

    /// Apply `f` to the stored property and emit the result as an update.
    fn update(&self, name: &str, f: impl FnOnce(&mut Property)) {
        let updated = {
            let mut props = self.properties.lock();
            let Some(prop) = props.iter_mut().find(|p| p.name == name) else {
                return;
            };
            f(prop);
            prop.clone()
        };
        self.emit(SimEvent::Updated(updated));
    }

    fn connect_device(&self) {
        if self.device_connected.swap(true, Ordering::SeqCst) {
            self.update("CONNECTION", |p| p.state = PropertyState::Ok);
            return;
        }
        let defined: Vec<Property> = self
            .properties
            .lock()
            .iter()
            .filter(|p| !is_base_property(&p.name))
            .cloned()
            .collect();
        for prop in defined {
            self.emit(SimEvent::Defined(prop));
        }
        self.update("CONNECTION", |p| {
            set_exclusive(p, "CONNECT");
            p.state = PropertyState::Ok;
        });
        tracing::debug!(device = %self.device, "Simulated device connected");
    }

    fn disconnect_device(&self) {
        self.exposure_generation.fetch_add(1, Ordering::SeqCst);
        let was_connected = self.device_connected.swap(false, Ordering::SeqCst);
        self.update("CONNECTION", |p| {
            set_exclusive(p, "DISCONNECT");
            p.state = PropertyState::Idle;
        });
        if !was_connected {
            return;
        }
        let names: Vec<String> = self
            .properties
            .lock()
            .iter()
            .filter(|p| !is_base_property(&p.name))
            .map(|p| p.name.clone())
            .collect();
        for name in names {
            self.emit(SimEvent::Removed(self.device.clone(), name));
        }
    }

    fn apply(self: &Arc<Self>, request: &Property) {
        if request.name == "CONNECTION" {
            if request.switch("CONNECT") == Some(true) {
                self.connect_device();
            } else {
                self.disconnect_device();
            }
            return;
        }

        if !self.device_connected.load(Ordering::SeqCst) {
            tracing::warn!(property = %request.name, "Simulated device not connected, ignoring");
            return;
        }

        match request.name.as_str() {
            "CCD_EXPOSURE" => {
                let duration = request.number("CCD_EXPOSURE_VALUE").unwrap_or(0.0);
                self.start_exposure(duration);
            }
            "CCD_ABORT_EXPOSURE" => self.abort_exposure(),
            "CCD_TEMPERATURE" => {
                let target = request.number("CCD_TEMPERATURE_VALUE").unwrap_or(0.0);
                self.ramp_temperature(target);
            }
            "CCD_VIDEO_STREAM" => {
                let on = request.switch("STREAM_ON") == Some(true);
                self.merge(request);
                let exposure = self
                    .snapshot("STREAMING_EXPOSURE_TIME")
                    .and_then(|p| p.number("STREAMING_EXPOSURE_VALUE"))
                    .filter(|v| *v > 0.0)
                    .unwrap_or(1.0);
                let fps = if on { 1.0 / exposure } else { 0.0 };
                self.update("FPS", |p| {
                    set_number(p, "EST_FPS", fps);
                    set_number(p, "AVG_FPS", fps);
                    p.state = PropertyState::Ok;
                });
            }
            _ => self.merge(request),
        }
    }

    /// Copy request values into the stored property and acknowledge.
    fn merge(&self, request: &Property) {
        if self.snapshot(&request.name).is_none() {
            tracing::warn!(property = %request.name, "Simulated device has no such property");
            return;
        }
        self.update(&request.name, |p| {
            for incoming in &request.elements {
                if let Some(e) = p.elements.iter_mut().find(|e| e.name == incoming.name) {
                    e.value = incoming.value.clone();
                }
            }
            p.state = PropertyState::Ok;
        });
    }

    fn start_exposure(self: &Arc<Self>, duration: f64) {
        let generation = self.exposure_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update("CCD_EXPOSURE", |p| {
            set_number(p, "CCD_EXPOSURE_VALUE", duration);
            p.state = PropertyState::Busy;
        });

        let state = Arc::clone(self);
        let delay = self.scaled(Duration::from_secs_f64(duration.max(0.0)));
        let spawned = thread::Builder::new()
            .name("sim-exposure".into())
            .spawn(move || state.finish_exposure(generation, duration, delay));
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn simulated exposure");
        }
    }

    fn finish_exposure(&self, generation: u64, duration: f64, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            if self.exposure_generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("Simulated exposure cancelled");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }

        if self.fail_next_exposure.swap(false, Ordering::SeqCst) {
            self.update("CCD_EXPOSURE", |p| p.state = PropertyState::Alert);
            return;
        }

        self.update("CCD_EXPOSURE", |p| {
            set_number(p, "CCD_EXPOSURE_VALUE", 0.0);
            p.state = PropertyState::Ok;
        });

        let payload = if self.empty_next_attachment.swap(false, Ordering::SeqCst) {
            Vec::new()
        } else {
            self.render_frame(duration)
        };
        self.update("CCD1", |p| {
            for e in &mut p.elements {
                e.value = ElementValue::Bytes(payload.clone().into());
            }
            p.state = PropertyState::Ok;
        });
    }

    fn abort_exposure(&self) {
        self.exposure_generation.fetch_add(1, Ordering::SeqCst);
        self.update("CCD_EXPOSURE", |p| {
            set_number(p, "CCD_EXPOSURE_VALUE", 0.0);
            p.state = PropertyState::Idle;
        });
        self.update("CCD_ABORT_EXPOSURE", |p| {
            set_switch(p, "ABORT", false);
            p.state = PropertyState::Ok;
        });
    }

    fn ramp_temperature(self: &Arc<Self>, target: f64) {
        self.update("CCD_TEMPERATURE", |p| p.state = PropertyState::Busy);

        let state = Arc::clone(self);
        let settle = self.scaled(COOLER_SETTLE);
        let spawned = thread::Builder::new()
            .name("sim-cooler".into())
            .spawn(move || {
                thread::sleep(settle);
                state.update("CCD_TEMPERATURE", |p| {
                    set_number(p, "CCD_TEMPERATURE_VALUE", target);
                    p.state = PropertyState::Ok;
                });
            });
        if let Err(e) = spawned {
            tracing::error!(error = %e, "Failed to spawn simulated cooler");
        }
    }

    fn render_frame(&self, duration: f64) -> Vec<u8> {
        let frame = self.snapshot("CCD_FRAME");
        let binning = self.snapshot("CCD_BINNING");
        let dim = |p: &Option<Property>, e: &str, default: f64| {
            p.as_ref().and_then(|p| p.number(e)).unwrap_or(default).max(1.0)
        };
        let width = (dim(&frame, "WIDTH", 1.0) / dim(&binning, "HOR_BIN", 1.0)) as usize;
        let height = (dim(&frame, "HEIGHT", 1.0) / dim(&binning, "VER_BIN", 1.0)) as usize;

        let level = BIAS_ADU + DARK_ADU_PER_S * duration;
        let mut rng = rand::thread_rng();
        let pixels: Vec<u16> = (0..width * height)
            .map(|_| (level + rng.gen_range(-20.0..20.0)).clamp(0.0, u16::MAX as f64) as u16)
            .collect();
        encode_fits_u16(width, height, &pixels)
    }
}

fn is_base_property(name: &str) -> bool {
    matches!(name, "CONNECTION" | "DRIVER_INFO")
}

fn set_number(p: &mut Property, element: &str, value: f64) {
    if let Some(e) = p.elements.iter_mut().find(|e| e.name == element) {
        e.value = ElementValue::Number(value);
    }
}

fn set_switch(p: &mut Property, element: &str, on: bool) {
    if let Some(e) = p.elements.iter_mut().find(|e| e.name == element) {
        e.value = ElementValue::Bool(on);
    }
}

fn set_exclusive(p: &mut Property, element: &str) {
    for e in &mut p.elements {
        e.value = ElementValue::Bool(e.name == element);
    }
}

fn deliver(rx: mpsc::Receiver<SimEvent>, sink: Weak<dyn EventSink>) {
    while let Ok(event) = rx.recv() {
        let Some(sink) = sink.upgrade() else {
            break;
        };
        match event {
            SimEvent::Appeared(device) => sink.on_device_appeared(&device),
            SimEvent::Defined(p) => sink.on_property_defined(p),
            SimEvent::Updated(p) => sink.on_property_updated(p),
            SimEvent::Removed(device, name) => sink.on_property_removed(&device, &name),
            SimEvent::Closed(code) => {
                sink.on_session_closed(code);
                break;
            }
        }
    }
    tracing::debug!("Simulated delivery thread exiting");
}

impl Transport for SimulatedCamera {
    fn connect_session(&self, sink: Weak<dyn EventSink>, timeout: Duration) -> Result<()> {
        if self.state.live.load(Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(timeout_ms = timeout.as_millis() as u64, "Simulated session connecting");

        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("sim-delivery".into())
            .spawn(move || deliver(rx, sink))
            .context("spawning simulated delivery thread")?;

        *self.state.outbox.lock() = Some(tx);
        *self.state.delivery.lock() = Some(handle);
        self.state.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect_session(&self) -> Result<()> {
        if !self.state.live.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.state.device_connected.store(false, Ordering::SeqCst);
        self.state.exposure_generation.fetch_add(1, Ordering::SeqCst);
        self.state.emit(SimEvent::Closed(0));
        self.state.outbox.lock().take();

        let handle = self.state.delivery.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                handle
                    .join()
                    .map_err(|_| anyhow!("simulated delivery thread panicked"))?;
            }
        }
        Ok(())
    }

    fn watch_device(&self, device: &str) -> Result<()> {
        if device != self.state.device {
            tracing::warn!(device, "Simulated server does not host this device");
            return Ok(());
        }
        self.state.emit(SimEvent::Appeared(device.to_string()));
        for name in ["CONNECTION", "DRIVER_INFO"] {
            if let Some(prop) = self.state.snapshot(name) {
                self.state.emit(SimEvent::Defined(prop));
            }
        }
        if self.state.device_connected.load(Ordering::SeqCst) {
            self.state.connect_device();
        }
        Ok(())
    }

    fn send_mutation(&self, property: &Property) -> Result<()> {
        if !self.state.live.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated session is not live"));
        }
        if property.device != self.state.device {
            return Err(anyhow!("unknown device '{}'", property.device));
        }
        self.state.apply(property);
        Ok(())
    }

    fn is_session_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }
}

fn number(name: &str, value: f64, min: f64, max: f64, step: f64) -> Element {
    Element::number_with_range(name, value, min, max, step)
}

fn switches(device: &str, name: &str, elements: &[(&str, bool)]) -> Property {
    elements.iter().fold(
        Property::new(device, name, PropertyKind::Switch),
        |p, (e, on)| p.with_element(Element::switch(*e, *on)),
    )
}

fn numbers(device: &str, name: &str, elements: Vec<Element>) -> Property {
    elements.into_iter().fold(
        Property::new(device, name, PropertyKind::Number),
        Property::with_element,
    )
}

fn initial_properties(device: &str, width: u32, height: u32) -> Vec<Property> {
    let (w, h) = (width.max(1) as f64, height.max(1) as f64);
    vec![
        switches(device, "CONNECTION", &[("CONNECT", false), ("DISCONNECT", true)]),
        Property::new(device, "DRIVER_INFO", PropertyKind::Text)
            .with_element(Element::text("DRIVER_NAME", "CCD Simulator"))
            .with_element(Element::text("DRIVER_EXEC", "indi_simulator_ccd"))
            .with_element(Element::text("DRIVER_VERSION", "1.0"))
            .with_element(Element::text("DRIVER_INTERFACE", "2")),
        numbers(
            device,
            "CCD_EXPOSURE",
            vec![number("CCD_EXPOSURE_VALUE", 1.0, 0.001, 3600.0, 0.001)],
        ),
        switches(device, "CCD_ABORT_EXPOSURE", &[("ABORT", false)]),
        Property::new(device, "CCD1", PropertyKind::BinaryAttachment)
            .with_element(Element::blob("CCD1", Vec::new())),
        numbers(device, "CCD_GAIN", vec![number("GAIN", 0.0, 0.0, 100.0, 1.0)]),
        numbers(device, "CCD_OFFSET", vec![number("OFFSET", 0.0, 0.0, 100.0, 1.0)]),
        numbers(
            device,
            "CCD_FRAME",
            vec![
                number("X", 0.0, 0.0, w - 1.0, 1.0),
                number("Y", 0.0, 0.0, h - 1.0, 1.0),
                number("WIDTH", w, 1.0, w, 1.0),
                number("HEIGHT", h, 1.0, h, 1.0),
            ],
        ),
        numbers(
            device,
            "CCD_BINNING",
            vec![
                number("HOR_BIN", 1.0, 1.0, 4.0, 1.0),
                number("VER_BIN", 1.0, 1.0, 4.0, 1.0),
            ],
        ),
        numbers(
            device,
            "CCD_INFO",
            vec![
                Element::number("CCD_MAX_X", w),
                Element::number("CCD_MAX_Y", h),
                Element::number("CCD_PIXEL_SIZE", 5.2),
                Element::number("CCD_PIXEL_SIZE_X", 5.2),
                Element::number("CCD_PIXEL_SIZE_Y", 5.2),
                Element::number("CCD_BITSPERPIXEL", 16.0),
            ],
        ),
        switches(
            device,
            "CCD_FRAME_TYPE",
            &[
                ("FRAME_LIGHT", true),
                ("FRAME_BIAS", false),
                ("FRAME_DARK", false),
                ("FRAME_FLAT", false),
            ],
        ),
        numbers(
            device,
            "CCD_TEMPERATURE",
            vec![number("CCD_TEMPERATURE_VALUE", 20.0, -50.0, 50.0, 0.1)],
        ),
        switches(device, "CCD_COOLER", &[("COOLER_ON", false), ("COOLER_OFF", true)]),
        numbers(
            device,
            "CCD_COOLER_POWER",
            vec![number("CCD_COOLER_VALUE", 0.0, 0.0, 100.0, 1.0)],
        ),
        numbers(
            device,
            "CCD_TEMP_RAMP",
            vec![
                number("RAMP_SLOPE", 0.0, 0.0, 30.0, 1.0),
                number("RAMP_THRESHOLD", 0.2, 0.1, 2.0, 0.1),
            ],
        ),
        switches(device, "CCD_VIDEO_STREAM", &[("STREAM_ON", false), ("STREAM_OFF", true)]),
        numbers(
            device,
            "STREAMING_EXPOSURE_TIME",
            vec![
                number("STREAMING_EXPOSURE_VALUE", 0.1, 0.000001, 60.0, 0.001),
                number("STREAMING_DIVISOR_VALUE", 1.0, 1.0, 15.0, 1.0),
            ],
        ),
        numbers(
            device,
            "FPS",
            vec![Element::number("EST_FPS", 0.0), Element::number("AVG_FPS", 0.0)],
        ),
        switches(
            device,
            "CCD_TRANSFER_FORMAT",
            &[
                ("FORMAT_FITS", true),
                ("FORMAT_NATIVE", false),
                ("FORMAT_XISF", false),
            ],
        ),
        switches(
            device,
            "CCD_COMPRESSION",
            &[("INDI_ENABLED", false), ("INDI_DISABLED", true)],
        ),
        switches(
            device,
            "UPLOAD_MODE",
            &[
                ("UPLOAD_CLIENT", true),
                ("UPLOAD_LOCAL", false),
                ("UPLOAD_BOTH", false),
            ],
        ),
        switches(device, "CCD_SHUTTER", &[("SHUTTER_OPEN", false), ("SHUTTER_CLOSE", true)]),
        numbers(device, "CCD_FAN", vec![number("FAN_SPEED", 0.0, 0.0, 100.0, 1.0)]),
        Property::new(device, "CCD_CFA", PropertyKind::Text)
            .with_element(Element::text("CFA_OFFSET_X", "0"))
            .with_element(Element::text("CFA_OFFSET_Y", "0"))
            .with_element(Element::text("CFA_TYPE", "RGGB")),
        switches(device, "RECORD_STREAM", &[("RECORD_ON", false), ("RECORD_OFF", true)]),
        Property::new(device, "RECORD_FILE", PropertyKind::Text)
            .with_element(Element::text("RECORD_FILE_DIR", "/tmp"))
            .with_element(Element::text("RECORD_FILE_NAME", "indi_record_")),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::{Receiver, Sender};

    /// Sink forwarding everything into a channel as (kind, name, state).
    struct ChannelSink(Mutex<Sender<(String, String, PropertyState)>>);

    impl ChannelSink {
        fn send(&self, kind: &str, name: &str, state: PropertyState) {
            let _ = self.0.lock().send((kind.into(), name.into(), state));
        }
    }

    impl EventSink for ChannelSink {
        fn on_device_appeared(&self, device: &str) {
            self.send("appeared", device, PropertyState::Idle);
        }
        fn on_device_removed(&self, device: &str) {
            self.send("device_removed", device, PropertyState::Idle);
        }
        fn on_property_defined(&self, p: Property) {
            self.send("defined", &p.name, p.state);
        }
        fn on_property_updated(&self, p: Property) {
            self.send("updated", &p.name, p.state);
        }
        fn on_property_removed(&self, _device: &str, name: &str) {
            self.send("removed", name, PropertyState::Idle);
        }
        fn on_session_closed(&self, _code: i32) {
            self.send("closed", "", PropertyState::Idle);
        }
    }

    fn session(
        sim: &SimulatedCamera,
    ) -> (Arc<ChannelSink>, Receiver<(String, String, PropertyState)>) {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(ChannelSink(Mutex::new(tx)));
        let weak: Weak<dyn EventSink> = Arc::downgrade(&sink) as Weak<dyn EventSink>;
        sim.connect_session(weak, Duration::from_secs(1)).unwrap();
        (sink, rx)
    }

    fn wait_for(
        rx: &Receiver<(String, String, PropertyState)>,
        kind: &str,
        name: &str,
    ) -> PropertyState {
        loop {
            let (k, n, s) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            if k == kind && n == name {
                return s;
            }
        }
    }

    fn connect_request(sim: &SimulatedCamera) -> Property {
        sim.state
            .snapshot("CONNECTION")
            .unwrap()
            .with_exclusive_switch("CONNECT")
            .unwrap()
    }

    #[test]
    fn test_watch_announces_base_properties_only() {
        let sim = SimulatedCamera::new("CCD Simulator");
        let (_sink, rx) = session(&sim);
        sim.watch_device("CCD Simulator").unwrap();

        wait_for(&rx, "appeared", "CCD Simulator");
        wait_for(&rx, "defined", "CONNECTION");
        wait_for(&rx, "defined", "DRIVER_INFO");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_connect_defines_camera_then_acknowledges() {
        let sim = SimulatedCamera::new("CCD Simulator");
        let (_sink, rx) = session(&sim);
        sim.watch_device("CCD Simulator").unwrap();
        sim.send_mutation(&connect_request(&sim)).unwrap();

        wait_for(&rx, "defined", "CCD_EXPOSURE");
        assert_eq!(wait_for(&rx, "updated", "CONNECTION"), PropertyState::Ok);
    }

    #[test]
    fn test_exposure_delivers_frame() {
        let sim = SimulatedCamera::new("CCD Simulator").with_time_scale(0.01);
        let (_sink, rx) = session(&sim);
        sim.send_mutation(&connect_request(&sim)).unwrap();

        let request = sim
            .state
            .snapshot("CCD_EXPOSURE")
            .unwrap()
            .with_number("CCD_EXPOSURE_VALUE", 1.0)
            .unwrap();
        sim.send_mutation(&request).unwrap();

        assert_eq!(wait_for(&rx, "updated", "CCD_EXPOSURE"), PropertyState::Busy);
        assert_eq!(wait_for(&rx, "updated", "CCD_EXPOSURE"), PropertyState::Ok);
        wait_for(&rx, "updated", "CCD1");

        let blob = sim.state.snapshot("CCD1").unwrap();
        assert!(blob.first_blob().unwrap().starts_with(b"SIMPLE"));
    }

    #[test]
    fn test_abort_cancels_pending_frame() {
        let sim = SimulatedCamera::new("CCD Simulator").with_time_scale(0.05);
        let (_sink, rx) = session(&sim);
        sim.send_mutation(&connect_request(&sim)).unwrap();

        let exposure = sim.state.snapshot("CCD_EXPOSURE").unwrap();
        sim.send_mutation(&exposure.with_number("CCD_EXPOSURE_VALUE", 2.0).unwrap())
            .unwrap();
        let abort = sim
            .state
            .snapshot("CCD_ABORT_EXPOSURE")
            .unwrap()
            .with_switch("ABORT", true)
            .unwrap();
        sim.send_mutation(&abort).unwrap();

        wait_for(&rx, "updated", "CCD_ABORT_EXPOSURE");
        thread::sleep(Duration::from_millis(150));
        while let Ok((kind, name, _)) = rx.try_recv() {
            assert!(!(kind == "updated" && name == "CCD1"));
        }
    }

    #[test]
    fn test_send_without_session_fails() {
        let sim = SimulatedCamera::new("CCD Simulator");
        let request = connect_request(&sim);
        assert!(sim.send_mutation(&request).is_err());
    }
}
