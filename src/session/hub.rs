//! Session hub.
//!
//! The hub is the single owner of the transport and of the property cache. It
//! implements [`EventSink`]: the transport's delivery thread calls into it, the hub
//! updates its cache under a short write lock, releases the lock, and then hands
//! the event to the [`PropertyRouter`].
//!
//! ## Connection lifecycle
//!
//! ```text
//! connect(device) ──► transport session up ──► watch_device
//!        │
//!        ▼
//! CONNECTION defined ──► CONNECT=on requested ──► CONNECTION Ok ──► connected
//! ```
//!
//! Only events of the target device reach components; watchers see every device.
//! When the session closes, the cache is cleared and every component is told via
//! `on_session_lost`.

use super::router::{PropertyEvent, PropertyRouter, WatchId};
use crate::error::{AppResult, CameraError, LastError};
use crate::frame::Frame;
use crate::property::{Property, PropertyState};
use crate::transport::{EventSink, Transport};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Name of the connection switch property.
pub const CONNECTION_PROPERTY: &str = "CONNECTION";
/// Name of the driver information text property.
pub const DRIVER_INFO_PROPERTY: &str = "DRIVER_INFO";

/// Polling period of [`SessionHub::wait_for_connection`].
const CONNECTION_POLL: Duration = Duration::from_millis(10);

/// Driver identification reported by the device.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    /// Driver name.
    pub name: String,
    /// Driver executable.
    pub exec: String,
    /// Driver version.
    pub version: String,
    /// Interface bitmask as advertised.
    pub interface: String,
}

impl DriverInfo {
    fn from_property(p: &Property) -> Self {
        let text = |e: &str| p.text(e).unwrap_or_default().to_string();
        Self {
            name: text("DRIVER_NAME"),
            exec: text("DRIVER_EXEC"),
            version: text("DRIVER_VERSION"),
            interface: text("DRIVER_INTERFACE"),
        }
    }
}

#[derive(Debug)]
struct Device {
    live: bool,
    properties: HashMap<String, Arc<Property>>,
}

impl Device {
    fn new() -> Self {
        Self {
            live: true,
            properties: HashMap::new(),
        }
    }
}

/// Owner of the transport session and the property cache.
pub struct SessionHub {
    self_ref: Weak<SessionHub>,
    transport: Arc<dyn Transport>,
    router: PropertyRouter,
    devices: RwLock<HashMap<String, Device>>,
    target: RwLock<Option<String>>,
    session_live: AtomicBool,
    pending_connect: AtomicBool,
    connected: watch::Sender<bool>,
    close_code: AtomicI32,
    current_frame: Mutex<Option<Arc<Frame>>>,
    driver_info: RwLock<Option<DriverInfo>>,
    last_error: LastError,
}

impl SessionHub {
    /// Create a hub over `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            transport,
            router: PropertyRouter::new(),
            devices: RwLock::new(HashMap::new()),
            target: RwLock::new(None),
            session_live: AtomicBool::new(false),
            pending_connect: AtomicBool::new(false),
            connected,
            close_code: AtomicI32::new(0),
            current_frame: Mutex::new(None),
            driver_info: RwLock::new(None),
            last_error: LastError::default(),
        })
    }

    /// Event fan-out table.
    pub fn router(&self) -> &PropertyRouter {
        &self.router
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Start connecting to `device`.
    ///
    /// Opens the transport session (retrying up to `max_retries` extra times),
    /// asks the server to report the device and requests `CONNECT` as soon as the
    /// device's `CONNECTION` property is known. Returns once the request is
    /// under way; use [`wait_for_connection`](Self::wait_for_connection) to block
    /// until the device confirms.
    pub fn connect(&self, device: &str, timeout: Duration, max_retries: u32) -> AppResult<()> {
        self.last_error
            .track(self.try_connect(device, timeout, max_retries))
    }

    fn try_connect(&self, device: &str, timeout: Duration, max_retries: u32) -> AppResult<()> {
        if device.is_empty() {
            return Err(CameraError::InvalidArgument("device name is empty".into()));
        }
        if self.is_connected() && self.target_device().as_deref() == Some(device) {
            return Err(CameraError::AlreadyInProgress("Connection"));
        }

        *self.target.write() = Some(device.to_string());
        self.pending_connect.store(true, Ordering::SeqCst);

        if let Err(e) = self.ensure_session(timeout, max_retries) {
            self.pending_connect.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if let Err(e) = self.transport.watch_device(device) {
            self.pending_connect.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        // Already known device: the define event will not come again.
        if self.property(CONNECTION_PROPERTY).is_some() {
            self.request_connection()?;
        }

        tracing::info!(device, "Connecting to device");
        Ok(())
    }

    fn ensure_session(&self, timeout: Duration, max_retries: u32) -> AppResult<()> {
        if self.is_session_live() {
            return Ok(());
        }

        let sink: Weak<dyn EventSink> = self.self_ref.clone();
        let mut attempt = 0;
        loop {
            match self.transport.connect_session(sink.clone(), timeout) {
                Ok(()) => {
                    self.session_live.store(true, Ordering::SeqCst);
                    tracing::debug!(attempt, "Transport session established");
                    return Ok(());
                }
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries,
                        error = %e,
                        "Session connect failed, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session connect failed, giving up");
                    return Err(e.into());
                }
            }
        }
    }

    fn request_connection(&self) -> AppResult<()> {
        let Some(connection) = self.property(CONNECTION_PROPERTY) else {
            return Ok(());
        };
        if connection.switch("CONNECT") == Some(true) && connection.state == PropertyState::Ok {
            return Ok(());
        }
        let request = connection
            .with_exclusive_switch("CONNECT")
            .ok_or_else(|| CameraError::PropertyNotFound("CONNECTION.CONNECT".into()))?;
        tracing::debug!(device = %connection.device, "Requesting device connection");
        self.send_mutation(request)
    }

    /// Block until the device reports connected, or `timeout` passes.
    pub fn wait_for_connection(&self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            if !self.is_session_live() && !self.pending_connect.load(Ordering::SeqCst) {
                return Err(CameraError::NotConnected);
            }
            if Instant::now() >= deadline {
                return Err(CameraError::Timeout(format!(
                    "device did not connect within {} ms",
                    timeout.as_millis()
                )));
            }
            std::thread::sleep(CONNECTION_POLL);
        }
        Ok(())
    }

    /// Ask the device to disconnect. Idempotent; the transport session stays up.
    pub fn disconnect(&self) -> AppResult<()> {
        let was_pending = self.pending_connect.swap(false, Ordering::SeqCst);
        if !self.is_connected() && !was_pending {
            return Ok(());
        }
        self.set_connected(false);

        if let Some(connection) = self.property(CONNECTION_PROPERTY) {
            if let Some(request) = connection.with_exclusive_switch("DISCONNECT") {
                self.last_error.track(self.send_mutation(request))?;
            }
        }
        tracing::info!(device = ?self.target_device(), "Disconnected from device");
        Ok(())
    }

    /// Close the transport session altogether.
    pub fn shutdown(&self) -> AppResult<()> {
        self.disconnect()?;
        if self.session_live.swap(false, Ordering::SeqCst) {
            self.last_error
                .track(self.transport.disconnect_session().map_err(CameraError::from))?;
        }
        Ok(())
    }

    /// Whether the target device reported connected.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Observe the connected flag.
    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn set_connected(&self, connected: bool) {
        let previous = self.connected.send_replace(connected);
        if previous != connected {
            tracing::info!(connected, device = ?self.target_device(), "Device connection changed");
        }
    }

    /// Whether the transport session is up.
    pub fn is_session_live(&self) -> bool {
        self.session_live.load(Ordering::SeqCst)
    }

    /// Device the session is focused on.
    pub fn target_device(&self) -> Option<String> {
        self.target.read().clone()
    }

    /// Code of the last session close (0 if none).
    pub fn last_close_code(&self) -> i32 {
        self.close_code.load(Ordering::SeqCst)
    }

    /// Most recent failure of a hub operation.
    pub fn last_error(&self) -> Option<crate::error::ErrorRecord> {
        self.last_error.get()
    }

    // =========================================================================
    // Mutations and cache access
    // =========================================================================

    /// Forward a mutation request to the transport.
    ///
    /// Fails with `SessionLost` (and logs) when the session is down.
    pub fn send_mutation(&self, property: Property) -> AppResult<()> {
        if !self.is_session_live() {
            tracing::warn!(property = %property.name, "Dropping mutation, session not live");
            return Err(CameraError::SessionLost(self.last_close_code()));
        }
        tracing::debug!(property = %property.name, device = %property.device, "Sending mutation");
        self.transport.send_mutation(&property).map_err(|e| {
            tracing::warn!(property = %property.name, error = %e, "Transport rejected mutation");
            CameraError::from(e)
        })
    }

    /// Cached snapshot of `name` on the target device.
    pub fn property(&self, name: &str) -> Option<Arc<Property>> {
        let device = self.target_device()?;
        self.property_of(&device, name)
    }

    /// Cached snapshot of `name` on `device`.
    pub fn property_of(&self, device: &str, name: &str) -> Option<Arc<Property>> {
        self.devices
            .read()
            .get(device)
            .and_then(|d| d.properties.get(name))
            .cloned()
    }

    /// Like [`property`](Self::property) but fails with `PropertyNotFound`.
    pub fn require_property(&self, name: &str) -> AppResult<Arc<Property>> {
        self.property(name)
            .ok_or_else(|| CameraError::PropertyNotFound(name.to_string()))
    }

    /// Names of all known devices.
    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.devices.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `device` is currently announced by the server.
    pub fn is_device_live(&self, device: &str) -> bool {
        self.devices.read().get(device).is_some_and(|d| d.live)
    }

    /// All cached properties of `device`, sorted by name.
    pub fn properties_of(&self, device: &str) -> Vec<Arc<Property>> {
        let mut props: Vec<Arc<Property>> = self
            .devices
            .read()
            .get(device)
            .map(|d| d.properties.values().cloned().collect())
            .unwrap_or_default();
        props.sort_by(|a, b| a.name.cmp(&b.name));
        props
    }

    /// Driver identification, once `DRIVER_INFO` was received.
    pub fn driver_info(&self) -> Option<DriverInfo> {
        self.driver_info.read().clone()
    }

    /// Most recently captured frame.
    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.current_frame.lock().clone()
    }

    /// Replace the current frame.
    pub fn set_current_frame(&self, frame: Arc<Frame>) {
        *self.current_frame.lock() = Some(frame);
    }

    /// Block until property `name` of the target device reaches `state`.
    ///
    /// Must not be called from the delivery thread.
    pub fn wait_for_state(
        &self,
        name: &str,
        state: PropertyState,
        timeout: Duration,
    ) -> AppResult<Arc<Property>> {
        let device = self.target_device().ok_or(CameraError::NotConnected)?;
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let watch_id: WatchId = self.router.watch(
            device.clone(),
            name,
            Arc::new(move |event: &PropertyEvent| {
                if event.is_live() && event.property().state == state {
                    let _ = tx.lock().send(Arc::clone(event.property()));
                }
            }),
        );

        let result = match self.property_of(&device, name) {
            Some(p) if p.state == state => Ok(p),
            _ => rx.recv_timeout(timeout).map_err(|_| {
                CameraError::Timeout(format!(
                    "{name} did not reach {state} within {} ms",
                    timeout.as_millis()
                ))
            }),
        };
        self.router.unwatch(watch_id);
        result
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    fn is_target(&self, device: &str) -> bool {
        self.target.read().as_deref() == Some(device)
    }

    fn route(&self, event: PropertyEvent) {
        if self.is_target(&event.property().device) {
            self.router.dispatch(&event);
        } else {
            self.router.notify_watchers(&event);
        }
    }

    /// Store a snapshot; returns the previous one.
    fn store(&self, property: Arc<Property>) -> Option<Arc<Property>> {
        let mut devices = self.devices.write();
        let device = devices
            .entry(property.device.clone())
            .or_insert_with(Device::new);
        device.properties.insert(property.name.clone(), property)
    }

    /// Session-level reaction to properties the hub itself tracks.
    fn observe(&self, property: &Property, defined: bool) {
        if !self.is_target(&property.device) {
            return;
        }
        match property.name.as_str() {
            CONNECTION_PROPERTY => {
                let on = property.switch("CONNECT") == Some(true);
                if on && property.state != PropertyState::Alert {
                    self.pending_connect.store(false, Ordering::SeqCst);
                    self.set_connected(true);
                } else if property.state == PropertyState::Alert {
                    tracing::error!(device = %property.device, "Device refused connection");
                    self.last_error
                        .record(&CameraError::ProtocolAlert(CONNECTION_PROPERTY.into()));
                    self.pending_connect.store(false, Ordering::SeqCst);
                    self.set_connected(false);
                } else if !on {
                    self.set_connected(false);
                    if defined && self.pending_connect.load(Ordering::SeqCst) {
                        if let Err(e) = self.request_connection() {
                            tracing::warn!(error = %e, "Could not request device connection");
                        }
                    }
                }
            }
            DRIVER_INFO_PROPERTY => {
                let info = DriverInfo::from_property(property);
                tracing::info!(driver = %info.name, version = %info.version, "Driver identified");
                *self.driver_info.write() = Some(info);
            }
            _ => {}
        }
    }
}

impl EventSink for SessionHub {
    fn on_device_appeared(&self, device: &str) {
        self.devices
            .write()
            .entry(device.to_string())
            .or_insert_with(Device::new)
            .live = true;
        tracing::debug!(device, "Device appeared");
    }

    fn on_device_removed(&self, device: &str) {
        let Some(removed) = self.devices.write().remove(device) else {
            return;
        };
        tracing::info!(device, "Device removed");

        if self.is_target(device) {
            self.set_connected(false);
            *self.driver_info.write() = None;
        }
        for property in removed.properties.into_values() {
            self.route(PropertyEvent::Removed(property));
        }
    }

    fn on_property_defined(&self, property: Property) {
        let property = Arc::new(property);
        tracing::trace!(device = %property.device, property = %property.name, "Property defined");
        self.store(Arc::clone(&property));
        self.observe(&property, true);
        self.route(PropertyEvent::Defined(property));
    }

    fn on_property_updated(&self, property: Property) {
        let property = Arc::new(property);
        tracing::trace!(
            device = %property.device,
            property = %property.name,
            state = %property.state,
            "Property updated"
        );
        self.store(Arc::clone(&property));
        self.observe(&property, false);
        self.route(PropertyEvent::Updated(property));
    }

    fn on_property_removed(&self, device: &str, name: &str) {
        let removed = self
            .devices
            .write()
            .get_mut(device)
            .and_then(|d| d.properties.remove(name));
        if let Some(property) = removed {
            tracing::debug!(device, property = name, "Property removed");
            self.route(PropertyEvent::Removed(property));
        }
    }

    fn on_session_closed(&self, code: i32) {
        tracing::warn!(code, "Session closed");
        self.close_code.store(code, Ordering::SeqCst);
        self.session_live.store(false, Ordering::SeqCst);
        self.pending_connect.store(false, Ordering::SeqCst);
        self.set_connected(false);
        self.devices.write().clear();
        *self.driver_info.write() = None;
        self.router.notify_session_lost(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::property::{Element, PropertyKind};
    use crate::transport::MockTransport;

    const DEVICE: &str = "CCD Simulator";

    fn connection(connected: bool, state: PropertyState) -> Property {
        Property::new(DEVICE, CONNECTION_PROPERTY, PropertyKind::Switch)
            .with_state(state)
            .with_element(Element::switch("CONNECT", connected))
            .with_element(Element::switch("DISCONNECT", !connected))
    }

    fn hub() -> (MockTransport, Arc<SessionHub>) {
        let transport = MockTransport::new();
        let hub = SessionHub::new(Arc::new(transport.clone()));
        (transport, hub)
    }

    #[test]
    fn test_connect_requests_connect_when_connection_defined() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(100), 0).unwrap();
        assert_eq!(transport.watched(), vec![DEVICE.to_string()]);
        assert!(!hub.is_connected());

        transport.emit_device(DEVICE);
        transport.emit_define(connection(false, PropertyState::Idle));
        let request = transport.last_sent(CONNECTION_PROPERTY).unwrap();
        assert_eq!(request.switch("CONNECT"), Some(true));
        assert_eq!(request.switch("DISCONNECT"), Some(false));

        transport.emit_update(connection(true, PropertyState::Ok));
        assert!(hub.is_connected());
        assert!(hub.wait_for_connection(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn test_connect_retries_then_fails() {
        let (transport, hub) = hub();
        transport.fail_next_connects(2);
        assert!(hub.connect(DEVICE, Duration::from_millis(10), 2).is_ok());

        let (transport, hub) = super::tests::hub();
        transport.fail_next_connects(3);
        let err = hub.connect(DEVICE, Duration::from_millis(10), 1).unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(hub.last_error().unwrap().kind, "transport");
        assert!(!hub.is_session_live());
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (transport, hub) = hub();
        assert!(hub.disconnect().is_ok());

        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();
        transport.emit_define(connection(true, PropertyState::Ok));
        assert!(hub.is_connected());

        hub.disconnect().unwrap();
        assert!(!hub.is_connected());
        let request = transport.last_sent(CONNECTION_PROPERTY).unwrap();
        assert_eq!(request.switch("DISCONNECT"), Some(true));

        transport.clear_sent();
        hub.disconnect().unwrap();
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_cache_replace_and_remove() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();

        let gain = |v: f64| {
            Property::new(DEVICE, "CCD_GAIN", PropertyKind::Number)
                .with_element(Element::number("GAIN", v))
        };
        transport.emit_define(gain(1.0));
        let first = hub.property("CCD_GAIN").unwrap();
        transport.emit_update(gain(2.0));

        assert_eq!(first.number("GAIN"), Some(1.0));
        assert_eq!(hub.property("CCD_GAIN").unwrap().number("GAIN"), Some(2.0));

        transport.emit_remove(DEVICE, "CCD_GAIN");
        assert!(hub.property("CCD_GAIN").is_none());
        assert!(matches!(
            hub.require_property("CCD_GAIN"),
            Err(CameraError::PropertyNotFound(_))
        ));
    }

    #[test]
    fn test_session_closed_clears_state() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();
        transport.emit_device(DEVICE);
        transport.emit_define(connection(true, PropertyState::Ok));
        assert!(hub.is_connected());

        transport.close_session(-1);
        assert!(!hub.is_connected());
        assert!(!hub.is_session_live());
        assert!(hub.device_names().is_empty());
        assert_eq!(hub.last_close_code(), -1);

        let err = hub
            .send_mutation(connection(true, PropertyState::Idle))
            .unwrap_err();
        assert!(matches!(err, CameraError::SessionLost(-1)));
    }

    #[test]
    fn test_driver_info_cached() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();
        transport.emit_define(
            Property::new(DEVICE, DRIVER_INFO_PROPERTY, PropertyKind::Text)
                .with_element(Element::text("DRIVER_NAME", "CCD Simulator"))
                .with_element(Element::text("DRIVER_VERSION", "1.0")),
        );
        let info = hub.driver_info().unwrap();
        assert_eq!(info.name, "CCD Simulator");
        assert_eq!(info.version, "1.0");
        assert_eq!(info.exec, "");
    }

    #[test]
    fn test_wait_for_state_sees_current_value() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();
        transport.emit_define(connection(true, PropertyState::Ok));

        let p = hub
            .wait_for_state(CONNECTION_PROPERTY, PropertyState::Ok, Duration::from_millis(10))
            .unwrap();
        assert_eq!(p.switch("CONNECT"), Some(true));

        let err = hub
            .wait_for_state(CONNECTION_PROPERTY, PropertyState::Busy, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, CameraError::Timeout(_)));
    }

    #[test]
    fn test_other_devices_are_cached_but_not_targeted() {
        let (transport, hub) = hub();
        hub.connect(DEVICE, Duration::from_millis(10), 0).unwrap();
        transport.emit_define(
            Property::new("Focuser", "ABS_FOCUS_POSITION", PropertyKind::Number)
                .with_element(Element::number("FOCUS_ABSOLUTE_POSITION", 100.0)),
        );
        assert!(hub.property("ABS_FOCUS_POSITION").is_none());
        assert!(hub.property_of("Focuser", "ABS_FOCUS_POSITION").is_some());
        assert_eq!(hub.device_names(), vec!["Focuser".to_string()]);
    }
}
