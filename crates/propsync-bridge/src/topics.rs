//! MQTT topic scheme for the accessory surface.
//!
//! Topic structure:
//! `propsync/v1/{accessory}/{service[.subtype]}/{characteristic}/{leaf}`
//!
//! Leaves:
//! - `state`: retained, the attribute's latest value
//! - `set`: inbound write commands
//! - `config`: retained, the attribute's metadata

use propsync_core::AttributeId;

/// Protocol version for the topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Topic scheme configuration.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    /// Accessory identifier segment
    pub accessory: String,
    /// Topic prefix (default: "propsync")
    pub prefix: String,
}

impl TopicScheme {
    /// Create a new topic scheme for the given accessory.
    #[must_use]
    pub fn new(accessory: impl Into<String>) -> Self {
        Self {
            accessory: accessory.into(),
            prefix: "propsync".to_string(),
        }
    }

    /// Build the base topic path.
    fn base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.accessory)
    }

    /// The service segment, with the subtype folded in when present.
    fn segment(id: &AttributeId) -> String {
        match &id.subtype {
            Some(subtype) => format!("{}.{}", id.service, subtype),
            None => id.service.clone(),
        }
    }

    /// Topic carrying the attribute's current value.
    #[must_use]
    pub fn state(&self, id: &AttributeId) -> String {
        format!("{}/{}/{}/state", self.base(), Self::segment(id), id.characteristic)
    }

    /// Topic accepting write commands for the attribute.
    #[must_use]
    pub fn command(&self, id: &AttributeId) -> String {
        format!("{}/{}/{}/set", self.base(), Self::segment(id), id.characteristic)
    }

    /// Topic carrying the attribute's metadata.
    #[must_use]
    pub fn config(&self, id: &AttributeId) -> String {
        format!("{}/{}/{}/config", self.base(), Self::segment(id), id.characteristic)
    }

    /// Wildcard subscription matching every command topic of the accessory.
    #[must_use]
    pub fn command_wildcard(&self) -> String {
        format!("{}/+/+/set", self.base())
    }

    /// Parse a command topic back into the attribute it addresses.
    ///
    /// Returns `None` for topics outside this accessory's command space.
    #[must_use]
    pub fn parse_command(&self, topic: &str) -> Option<AttributeId> {
        let expected_prefix = format!("{}/", self.base());
        let remainder = topic.strip_prefix(&expected_prefix)?;

        let parts: Vec<&str> = remainder.split('/').collect();
        if parts.len() != 3 || parts[2] != "set" {
            return None;
        }

        let characteristic = parts[1];
        if characteristic.is_empty() {
            return None;
        }

        match parts[0].split_once('.') {
            Some((service, subtype)) => {
                if service.is_empty() || subtype.is_empty() {
                    return None;
                }
                Some(AttributeId::with_subtype(service, subtype, characteristic))
            }
            None => {
                if parts[0].is_empty() {
                    return None;
                }
                Some(AttributeId::new(parts[0], characteristic))
            }
        }
    }
}

/// Reduce a display name to a topic-safe accessory identifier.
///
/// Lowercases ASCII alphanumerics and collapses everything else into
/// single dashes; an unusable name falls back to `accessory`.
#[must_use]
pub fn accessory_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "accessory".to_string()
    } else {
        slug.to_string()
    }
}
