//! Transport collaborator boundary.
//!
//! The transport owns the wire: it connects to the device server, decodes pushed
//! frames into [`Property`] snapshots and encodes outbound mutation requests. The
//! session hub never talks to a socket directly; it owns a `dyn Transport` and
//! receives events through the [`EventSink`] it hands over at connect time.
//!
//! # Delivery contract
//!
//! All `EventSink` callbacks for one session are delivered on a single thread, in
//! protocol arrival order. Sinks must not block that thread.
//!
//! Two implementations ship with the crate:
//!
//! - [`mock::MockTransport`]: records mutations, lets tests drive events by hand
//! - [`simulator::SimulatedCamera`]: an in-process CCD driver with its own delivery thread

use crate::property::Property;
use anyhow::Result;
use std::sync::Weak;
use std::time::Duration;

pub mod mock;
pub mod simulator;

pub use mock::MockTransport;
pub use simulator::SimulatedCamera;

/// Receiver of protocol events (implemented by the session hub).
pub trait EventSink: Send + Sync {
    /// A device became available on the server.
    fn on_device_appeared(&self, device: &str);

    /// A device went away; its properties are gone with it.
    fn on_device_removed(&self, device: &str);

    /// First snapshot of a property.
    fn on_property_defined(&self, property: Property);

    /// Replacement snapshot of an already defined property.
    fn on_property_updated(&self, property: Property);

    /// A property was deleted by the server.
    fn on_property_removed(&self, device: &str, name: &str);

    /// The session ended. No further events follow.
    fn on_session_closed(&self, code: i32);
}

/// Capability set the session hub needs from the wire layer.
pub trait Transport: Send + Sync {
    /// Open the session to the server. Events go to `sink` from now on.
    fn connect_session(&self, sink: Weak<dyn EventSink>, timeout: Duration) -> Result<()>;

    /// Close the session.
    fn disconnect_session(&self) -> Result<()>;

    /// Ask the server to report `device` (appearance plus all its properties).
    fn watch_device(&self, device: &str) -> Result<()>;

    /// Forward a property mutation request.
    fn send_mutation(&self, property: &Property) -> Result<()>;

    /// Transport-level liveness.
    fn is_session_live(&self) -> bool;
}
