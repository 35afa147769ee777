//! Session layer: the property cache and event fan-out between the transport and
//! the camera components.

pub mod hub;
pub mod router;

pub use hub::{DriverInfo, SessionHub};
pub use router::{PropertyEvent, PropertyRouter, WatchCallback, WatchId};
