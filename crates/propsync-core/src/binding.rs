//! # Binding Model
//!
//! A [`FeatureTable`] is the declarative description of one accessory: a
//! list of [`Binding`]s, each projecting a value source onto a single
//! accessory attribute. Sources are fixed values, locally computed values,
//! or named device properties with optional read/write transforms, write
//! hooks, and a history tag.
//!
//! Tables are plain data until handed to the engine; nothing here talks to
//! a device or a host.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::hooks::{AfterWrite, BeforeWrite};

/// Transform applied to a raw device reading before it reaches the host.
pub type ReadTransform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Transform applied to a requested attribute value before it reaches the
/// device.
pub type WriteTransform = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Producer for locally computed attribute values.
pub type ComputedFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Identifies one attribute of the accessory.
///
/// The service/characteristic pair addresses the attribute; the optional
/// subtype distinguishes multiple instances of the same service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeId {
    /// Service the attribute belongs to, e.g. `humidifier`.
    pub service: String,
    /// Instance discriminator for repeated services.
    pub subtype: Option<String>,
    /// Characteristic name within the service, e.g. `target-humidity`.
    pub characteristic: String,
}

impl AttributeId {
    /// Builds an id without a subtype.
    pub fn new(service: impl Into<String>, characteristic: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            subtype: None,
            characteristic: characteristic.into(),
        }
    }

    /// Builds an id for a repeated service instance.
    pub fn with_subtype(
        service: impl Into<String>,
        subtype: impl Into<String>,
        characteristic: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            subtype: Some(subtype.into()),
            characteristic: characteristic.into(),
        }
    }
}

impl fmt::Display for AttributeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.subtype {
            Some(subtype) => write!(f, "{}.{}/{}", self.service, subtype, self.characteristic),
            None => write!(f, "{}/{}", self.service, self.characteristic),
        }
    }
}

/// What the accessory host needs to materialize one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    /// The attribute being materialized.
    pub attribute: AttributeId,
    /// Human-readable label, if the binding carries one.
    pub display_name: Option<String>,
    /// Whether external writes are accepted for this attribute.
    pub writable: bool,
}

/// Routes a recorded reading into the history log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTag {
    /// Channel (one time series) the reading belongs to.
    pub channel: String,
    /// Field name within the channel's entries.
    pub field: String,
}

/// Write half of a device-backed binding.
#[derive(Clone)]
pub struct WriteSpec {
    /// Device-side call used to apply the value.
    pub call: String,
    /// Converts the requested attribute value into the device's domain.
    pub transform: Option<WriteTransform>,
    /// Runs before the device call; may take over the write entirely.
    pub before: Option<Arc<dyn BeforeWrite>>,
    /// Runs after the device call (or after a skip), e.g. to adjust
    /// related attributes.
    pub after: Option<Arc<dyn AfterWrite>>,
}

impl WriteSpec {
    /// Applies the write transform, or passes the request through untouched.
    #[must_use]
    pub fn device_value(&self, requested: &Value) -> Value {
        match &self.transform {
            Some(f) => f(requested),
            None => requested.clone(),
        }
    }
}

impl fmt::Debug for WriteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteSpec")
            .field("call", &self.call)
            .field("transform", &self.transform.is_some())
            .field("before", &self.before.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Device-property half of a binding.
#[derive(Clone)]
pub struct DeviceBinding {
    /// Device property the attribute reads from.
    pub property: String,
    /// Converts raw device readings into attribute values.
    pub read: Option<ReadTransform>,
    /// Present when the attribute accepts external writes.
    pub write: Option<WriteSpec>,
}

impl DeviceBinding {
    /// Applies the read transform, or passes the raw reading through.
    #[must_use]
    pub fn attribute_value(&self, raw: &Value) -> Value {
        match &self.read {
            Some(f) => f(raw),
            None => raw.clone(),
        }
    }
}

impl fmt::Debug for DeviceBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBinding")
            .field("property", &self.property)
            .field("read", &self.read.is_some())
            .field("write", &self.write)
            .finish()
    }
}

/// Where a binding's value comes from.
#[derive(Clone)]
pub enum Source {
    /// A fixed value pushed once at registration.
    Static(Value),
    /// A locally computed value, evaluated on demand.
    Computed(ComputedFn),
    /// A named device property, refreshed by the poll cycle.
    Device(DeviceBinding),
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(v) => f.debug_tuple("Static").field(v).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
            Self::Device(d) => f.debug_tuple("Device").field(d).finish(),
        }
    }
}

/// One row of a feature table: a value source projected onto one attribute.
///
/// Built with [`Binding::fixed`], [`Binding::computed`], or
/// [`Binding::device`] and refined with the chained builder methods. The
/// read/write/hook methods only have an effect on device-backed bindings.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Attribute this binding feeds.
    pub attribute: AttributeId,
    /// Optional display label forwarded to the host.
    pub display_name: Option<String>,
    /// Value source.
    pub source: Source,
    /// Routes readings into the history log when present.
    pub history: Option<HistoryTag>,
}

impl Binding {
    /// A binding that always reports `value`.
    #[must_use]
    pub fn fixed(attribute: AttributeId, value: Value) -> Self {
        Self {
            attribute,
            display_name: None,
            source: Source::Static(value),
            history: None,
        }
    }

    /// A binding computed locally, without any device property.
    #[must_use]
    pub fn computed(
        attribute: AttributeId,
        f: impl Fn() -> Value + Send + Sync + 'static,
    ) -> Self {
        Self {
            attribute,
            display_name: None,
            source: Source::Computed(Arc::new(f)),
            history: None,
        }
    }

    /// A binding backed by the named device property.
    #[must_use]
    pub fn device(attribute: AttributeId, property: impl Into<String>) -> Self {
        Self {
            attribute,
            display_name: None,
            source: Source::Device(DeviceBinding {
                property: property.into(),
                read: None,
                write: None,
            }),
            history: None,
        }
    }

    /// Sets the display label forwarded to the host.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Sets the read transform. No effect on fixed or computed bindings.
    #[must_use]
    pub fn read(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        if let Source::Device(d) = &mut self.source {
            d.read = Some(Arc::new(f));
        }
        self
    }

    /// Accepts external writes through the named device call, forwarding the
    /// requested value untransformed.
    #[must_use]
    pub fn write(self, call: impl Into<String>) -> Self {
        self.write_spec(call.into(), None)
    }

    /// Accepts external writes through the named device call, converting the
    /// requested value with `f` first.
    #[must_use]
    pub fn write_with(
        self,
        call: impl Into<String>,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.write_spec(call.into(), Some(Arc::new(f) as WriteTransform))
    }

    fn write_spec(mut self, call: String, transform: Option<WriteTransform>) -> Self {
        if let Source::Device(d) = &mut self.source {
            d.write = Some(WriteSpec {
                call,
                transform,
                before: None,
                after: None,
            });
        }
        self
    }

    /// Installs a before-write hook. No effect unless a write call is set.
    #[must_use]
    pub fn before_write(mut self, hook: Arc<dyn BeforeWrite>) -> Self {
        if let Source::Device(DeviceBinding {
            write: Some(spec), ..
        }) = &mut self.source
        {
            spec.before = Some(hook);
        }
        self
    }

    /// Installs an after-write hook. No effect unless a write call is set.
    #[must_use]
    pub fn after_write(mut self, hook: Arc<dyn AfterWrite>) -> Self {
        if let Source::Device(DeviceBinding {
            write: Some(spec), ..
        }) = &mut self.source
        {
            spec.after = Some(hook);
        }
        self
    }

    /// Records this binding's readings under `channel`/`field` in history.
    #[must_use]
    pub fn history(mut self, channel: impl Into<String>, field: impl Into<String>) -> Self {
        self.history = Some(HistoryTag {
            channel: channel.into(),
            field: field.into(),
        });
        self
    }

    /// Device property this binding polls, if device-backed.
    #[must_use]
    pub fn property(&self) -> Option<&str> {
        match &self.source {
            Source::Device(d) => Some(&d.property),
            _ => None,
        }
    }

    /// Device half of the binding, if device-backed.
    #[must_use]
    pub fn device_binding(&self) -> Option<&DeviceBinding> {
        match &self.source {
            Source::Device(d) => Some(d),
            _ => None,
        }
    }

    /// Whether external writes are accepted.
    #[must_use]
    pub fn is_writable(&self) -> bool {
        matches!(
            &self.source,
            Source::Device(DeviceBinding { write: Some(_), .. })
        )
    }

    /// The host-facing description of this binding's attribute.
    #[must_use]
    pub fn spec(&self) -> AttributeSpec {
        AttributeSpec {
            attribute: self.attribute.clone(),
            display_name: self.display_name.clone(),
            writable: self.is_writable(),
        }
    }
}

/// The full declarative description of one accessory.
#[derive(Debug, Clone, Default)]
pub struct FeatureTable {
    bindings: Vec<Binding>,
}

impl FeatureTable {
    /// Wraps a list of bindings into a table.
    #[must_use]
    pub fn new(bindings: Vec<Binding>) -> Self {
        Self { bindings }
    }

    /// The table's bindings, in declaration order.
    #[must_use]
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Consumes the table, yielding its bindings.
    #[must_use]
    pub fn into_bindings(self) -> Vec<Binding> {
        self.bindings
    }

    /// Number of bindings in the table.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Whether the table has no bindings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Distinct history channels referenced by the table, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        let channels: BTreeSet<&str> = self
            .bindings
            .iter()
            .filter_map(|b| b.history.as_ref().map(|tag| tag.channel.as_str()))
            .collect();
        channels.into_iter().map(str::to_owned).collect()
    }

    /// Checks the table for configuration mistakes.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: a duplicate attribute id, an invalid
    /// identifier segment, an empty device property or write call name, or
    /// an incomplete history tag.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for binding in &self.bindings {
            let id = &binding.attribute;
            check_segment(&id.service)?;
            if let Some(subtype) = &id.subtype {
                check_segment(subtype)?;
            }
            check_segment(&id.characteristic)?;

            if !seen.insert(id.to_string()) {
                return Err(ConfigError::DuplicateAttribute(id.to_string()));
            }

            if let Source::Device(d) = &binding.source {
                if d.property.is_empty() {
                    return Err(ConfigError::EmptyProperty {
                        attribute: id.to_string(),
                    });
                }
                if let Some(spec) = &d.write {
                    if spec.call.is_empty() {
                        return Err(ConfigError::EmptyCall {
                            attribute: id.to_string(),
                        });
                    }
                }
            }

            if let Some(tag) = &binding.history {
                if tag.channel.is_empty() || tag.field.is_empty() {
                    return Err(ConfigError::EmptyHistoryTag {
                        attribute: id.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl From<Vec<Binding>> for FeatureTable {
    fn from(bindings: Vec<Binding>) -> Self {
        Self::new(bindings)
    }
}

// Identifier segments travel in topic paths and display strings, so the
// separator characters are banned outright.
fn check_segment(segment: &str) -> Result<(), ConfigError> {
    if segment.is_empty() {
        return Err(ConfigError::BadSegment {
            segment: segment.to_string(),
            reason: "empty",
        });
    }
    if segment
        .chars()
        .any(|c| matches!(c, '/' | '+' | '#' | '.') || c.is_whitespace())
    {
        return Err(ConfigError::BadSegment {
            segment: segment.to_string(),
            reason: "contains a separator or whitespace character",
        });
    }
    Ok(())
}

/// A mistake in a feature table, detected before registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Two bindings target the same attribute.
    #[error("duplicate attribute: {0}")]
    DuplicateAttribute(String),

    /// An identifier segment is empty or contains reserved characters.
    #[error("invalid identifier segment {segment:?}: {reason}")]
    BadSegment {
        /// The offending segment.
        segment: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A device-backed binding names no property.
    #[error("attribute {attribute}: device property name is empty")]
    EmptyProperty {
        /// Attribute whose binding is broken.
        attribute: String,
    },

    /// A writable binding names no device call.
    #[error("attribute {attribute}: write call name is empty")]
    EmptyCall {
        /// Attribute whose binding is broken.
        attribute: String,
    },

    /// A history tag is missing its channel or field.
    #[error("attribute {attribute}: history tag is incomplete")]
    EmptyHistoryTag {
        /// Attribute whose binding is broken.
        attribute: String,
    },
}
