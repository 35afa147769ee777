//! Mock transport for testing
//!
//! This transport provides a scripted wire for tests without a device server. It
//! provides:
//! - Controllable connect failure injection
//! - A log of every outbound mutation for verification
//! - Hand-driven event delivery through the registered sink
//!
//! Events are delivered synchronously on the calling thread, so tests see
//! deterministic ordering.

use super::{EventSink, Transport};
use crate::property::Property;
use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Mock transport for testing
///
/// # Example
///
/// ```
/// use indi_camera::transport::{MockTransport, Transport};
///
/// let transport = MockTransport::new();
/// transport.fail_next_connects(1);
/// assert!(!transport.is_session_live());
/// ```
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

#[derive(Default)]
struct MockInner {
    live: AtomicBool,
    failing_connects: AtomicU32,
    fail_sends: AtomicBool,
    sink: Mutex<Option<Weak<dyn EventSink>>>,
    sent: Mutex<Vec<Property>>,
    watched: Mutex<Vec<String>>,
    call_log: Mutex<Vec<String>>,
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` session connects fail
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.failing_connects.store(n, Ordering::SeqCst);
    }

    /// Make every `send_mutation` fail until reset
    pub fn set_fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// All mutations sent so far, oldest first
    pub fn sent(&self) -> Vec<Property> {
        self.inner.sent.lock().clone()
    }

    /// Most recent mutation of the named property
    pub fn last_sent(&self, name: &str) -> Option<Property> {
        self.inner
            .sent
            .lock()
            .iter()
            .rev()
            .find(|p| p.name == name)
            .cloned()
    }

    /// Forget recorded mutations
    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    /// Devices passed to `watch_device`
    pub fn watched(&self) -> Vec<String> {
        self.inner.watched.lock().clone()
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.inner.call_log.lock().clone()
    }

    fn log_call(&self, call: String) {
        self.inner.call_log.lock().push(call);
    }

    fn sink(&self) -> Option<Arc<dyn EventSink>> {
        self.inner.sink.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Deliver a device appearance
    pub fn emit_device(&self, device: &str) {
        if let Some(sink) = self.sink() {
            sink.on_device_appeared(device);
        }
    }

    /// Deliver a property definition
    pub fn emit_define(&self, property: Property) {
        if let Some(sink) = self.sink() {
            sink.on_property_defined(property);
        }
    }

    /// Deliver a property update
    pub fn emit_update(&self, property: Property) {
        if let Some(sink) = self.sink() {
            sink.on_property_updated(property);
        }
    }

    /// Deliver a property removal
    pub fn emit_remove(&self, device: &str, name: &str) {
        if let Some(sink) = self.sink() {
            sink.on_property_removed(device, name);
        }
    }

    /// Deliver a device removal
    pub fn emit_device_removed(&self, device: &str) {
        if let Some(sink) = self.sink() {
            sink.on_device_removed(device);
        }
    }

    /// Drop the session as if the server went away
    pub fn close_session(&self, code: i32) {
        self.inner.live.store(false, Ordering::SeqCst);
        if let Some(sink) = self.sink() {
            sink.on_session_closed(code);
        }
    }
}

impl Transport for MockTransport {
    fn connect_session(&self, sink: Weak<dyn EventSink>, timeout: Duration) -> Result<()> {
        self.log_call(format!("connect_session: {}ms", timeout.as_millis()));

        let remaining = self.inner.failing_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .failing_connects
                .store(remaining - 1, Ordering::SeqCst);
            return Err(anyhow!("Injected connect failure"));
        }

        *self.inner.sink.lock() = Some(sink);
        self.inner.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect_session(&self) -> Result<()> {
        self.log_call("disconnect_session".to_string());
        self.inner.live.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn watch_device(&self, device: &str) -> Result<()> {
        self.log_call(format!("watch_device: {device}"));
        self.inner.watched.lock().push(device.to_string());
        Ok(())
    }

    fn send_mutation(&self, property: &Property) -> Result<()> {
        self.log_call(format!("send_mutation: {}", property.name));

        if !self.inner.live.load(Ordering::SeqCst) {
            return Err(anyhow!("Session not live"));
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("Injected send failure"));
        }

        self.inner.sent.lock().push(property.clone());
        Ok(())
    }

    fn is_session_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }
}
