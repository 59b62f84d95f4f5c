//! # Accessory Host
//!
//! The engine's view of whatever surfaces the accessory to users: a
//! smart-home hub, an MQTT topic tree, a test double. The host owns the
//! attribute lifecycle (create, remove, enumerate) and receives value
//! pushes; inbound writes travel outside this trait, from the host's
//! command layer into [`SyncEngine::write_attribute`].
//!
//! [`SyncEngine::write_attribute`]: crate::engine::SyncEngine::write_attribute

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::binding::{AttributeId, AttributeSpec};

/// Surface the accessory's attributes are published on.
#[async_trait]
pub trait AccessoryHost: Send + Sync {
    /// Creates the attribute if missing, or updates its metadata in place.
    ///
    /// # Errors
    ///
    /// Fails when the host backend rejects the attribute.
    async fn ensure_attribute(&self, spec: &AttributeSpec) -> Result<(), HostError>;

    /// Removes an attribute the accessory no longer declares.
    ///
    /// # Errors
    ///
    /// Fails when the host backend cannot remove it.
    async fn remove_attribute(&self, id: &AttributeId) -> Result<(), HostError>;

    /// Enumerates the attributes currently materialized on the host.
    ///
    /// # Errors
    ///
    /// Fails when the host backend cannot be queried.
    async fn attributes(&self) -> Result<Vec<AttributeId>, HostError>;

    /// Publishes the attribute's current value.
    ///
    /// # Errors
    ///
    /// Fails when the host backend rejects the publish.
    async fn push_value(&self, id: &AttributeId, value: &Value) -> Result<(), HostError>;
}

/// Failure on the accessory host surface.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    /// The host backend (broker, hub bridge) failed.
    #[error("host backend error: {0}")]
    Backend(String),

    /// The attribute is not materialized on the host.
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),
}
