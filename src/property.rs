//! Device property model.
//!
//! Properties are immutable snapshots pushed by the device server. The session hub
//! replaces whole snapshots on update; components only read them and build new
//! mutation *requests* from them (see [`Property::with_number`] and friends).
//!
//! # Wire shape
//!
//! ```text
//! { device, name, kind, state, elements: [{ name, value, min?, max?, step? }] }
//! ```
//!
//! `ElementValue` serializes as `{"number": 1.0}`, `{"text": "..."}`, `{"bool": true}`
//! or `{"bytes": [..]}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Enums
// =============================================================================

/// Value family carried by every element of a property.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Numeric elements with optional min/max/step.
    Number,
    /// Free-text elements.
    Text,
    /// On/off switch elements.
    Switch,
    /// Read-only status lights.
    Light,
    /// Binary attachment (image payloads).
    BinaryAttachment,
}

/// Server-side state of a property.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PropertyState {
    /// Nothing happening.
    #[default]
    Idle,
    /// Last request completed.
    Ok,
    /// Request in progress.
    Busy,
    /// Request failed or device fault.
    Alert,
}

impl fmt::Display for PropertyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PropertyState::Idle => "Idle",
            PropertyState::Ok => "Ok",
            PropertyState::Busy => "Busy",
            PropertyState::Alert => "Alert",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Elements
// =============================================================================

/// Typed value of a single element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementValue {
    /// Numeric value.
    Number(f64),
    /// Text value.
    Text(String),
    /// Switch or light state (`true` = on / lit).
    Bool(bool),
    /// Binary payload.
    Bytes(#[serde(with = "bytes_as_vec")] Bytes),
}

/// A single named value within a property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Element {
    /// Element name (e.g. `CCD_EXPOSURE_VALUE`).
    pub name: String,
    /// Current value.
    pub value: ElementValue,
    /// Lower bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Upper bound for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Step for numbers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl Element {
    /// Unbounded numeric element.
    pub fn number(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: ElementValue::Number(value),
            min: None,
            max: None,
            step: None,
        }
    }

    /// Numeric element with range metadata.
    pub fn number_with_range(
        name: impl Into<String>,
        value: f64,
        min: f64,
        max: f64,
        step: f64,
    ) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            step: Some(step),
            ..Self::number(name, value)
        }
    }

    /// Text element.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: ElementValue::Text(value.into()),
            min: None,
            max: None,
            step: None,
        }
    }

    /// Switch (or light) element.
    pub fn switch(name: impl Into<String>, on: bool) -> Self {
        Self {
            name: name.into(),
            value: ElementValue::Bool(on),
            min: None,
            max: None,
            step: None,
        }
    }

    /// Binary attachment element.
    pub fn blob(name: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: ElementValue::Bytes(payload.into()),
            min: None,
            max: None,
            step: None,
        }
    }

    /// Numeric value, if this is a number element.
    pub fn as_number(&self) -> Option<f64> {
        match self.value {
            ElementValue::Number(v) => Some(v),
            _ => None,
        }
    }

    /// Text value, if this is a text element.
    pub fn as_text(&self) -> Option<&str> {
        match &self.value {
            ElementValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Switch state, if this is a switch element.
    pub fn as_switch(&self) -> Option<bool> {
        match self.value {
            ElementValue::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Payload, if this is an attachment element.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match &self.value {
            ElementValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

// =============================================================================
// Property
// =============================================================================

/// Immutable snapshot of a device property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Property {
    /// Owning device name.
    pub device: String,
    /// Property name (e.g. `CCD_EXPOSURE`).
    pub name: String,
    /// Value family of all elements.
    pub kind: PropertyKind,
    /// Server-side state.
    pub state: PropertyState,
    /// Ordered elements.
    pub elements: Vec<Element>,
}

impl Property {
    /// Create an empty property snapshot.
    pub fn new(device: impl Into<String>, name: impl Into<String>, kind: PropertyKind) -> Self {
        Self {
            device: device.into(),
            name: name.into(),
            kind,
            state: PropertyState::Idle,
            elements: Vec::new(),
        }
    }

    /// Builder: set state.
    pub fn with_state(mut self, state: PropertyState) -> Self {
        self.state = state;
        self
    }

    /// Builder: append an element.
    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    /// Look up an element by name.
    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.iter().find(|e| e.name == name)
    }

    /// Numeric value of the named element.
    pub fn number(&self, element: &str) -> Option<f64> {
        self.element(element).and_then(Element::as_number)
    }

    /// Text value of the named element.
    pub fn text(&self, element: &str) -> Option<&str> {
        self.element(element).and_then(Element::as_text)
    }

    /// Switch state of the named element.
    pub fn switch(&self, element: &str) -> Option<bool> {
        self.element(element).and_then(Element::as_switch)
    }

    /// Name of the first switch element that is on.
    pub fn active_switch(&self) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| e.as_switch() == Some(true))
            .map(|e| e.name.as_str())
    }

    /// First binary payload carried by this property.
    pub fn first_blob(&self) -> Option<&Bytes> {
        self.elements.iter().find_map(Element::as_bytes)
    }

    /// Mutation request derived from this snapshot with one numeric element replaced.
    ///
    /// Returns `None` when the element does not exist.
    pub fn with_number(&self, element: &str, value: f64) -> Option<Property> {
        self.with_numbers(&[(element, value)])
    }

    /// Mutation request with several numeric elements replaced.
    pub fn with_numbers(&self, values: &[(&str, f64)]) -> Option<Property> {
        let mut request = self.clone();
        for (name, value) in values {
            let element = request.elements.iter_mut().find(|e| e.name == *name)?;
            element.value = ElementValue::Number(*value);
        }
        Some(request)
    }

    /// Mutation request for a one-of-many switch: `element` on, all others off.
    pub fn with_exclusive_switch(&self, element: &str) -> Option<Property> {
        self.element(element)?;
        let mut request = self.clone();
        for e in &mut request.elements {
            e.value = ElementValue::Bool(e.name == element);
        }
        Some(request)
    }

    /// Mutation request with one text element replaced.
    pub fn with_text(&self, element: &str, value: &str) -> Option<Property> {
        let mut request = self.clone();
        let target = request.elements.iter_mut().find(|e| e.name == element)?;
        target.value = ElementValue::Text(value.to_string());
        Some(request)
    }

    /// Mutation request with one switch element set, others untouched.
    pub fn with_switch(&self, element: &str, on: bool) -> Option<Property> {
        let mut request = self.clone();
        let target = request.elements.iter_mut().find(|e| e.name == element)?;
        target.value = ElementValue::Bool(on);
        Some(request)
    }
}

mod bytes_as_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        Vec::<u8>::deserialize(deserializer).map(Bytes::from)
    }
}
