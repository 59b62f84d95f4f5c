//! MQTT accessory host.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde_json::Value;
use url::Url;

use propsync_core::{AccessoryHost, AttributeId, AttributeSpec, HostError};

use crate::topics::TopicScheme;

/// Accessory host that materializes attributes as retained MQTT topics.
///
/// Each attribute owns a retained `config` topic (metadata) and a retained
/// `state` topic (latest value); commands arrive on the matching `set`
/// topic. Removal publishes empty retained payloads, which clears the
/// topics on the broker.
///
/// The attribute registry is session-local: it enumerates what this
/// process has registered, not what a previous run left retained.
pub struct MqttHost {
    client: AsyncClient,
    scheme: TopicScheme,
    attrs: Mutex<HashMap<AttributeId, bool>>,
}

impl MqttHost {
    /// Create a host connected to the broker.
    ///
    /// The returned event loop must be polled by the caller; inbound
    /// command dispatch happens there.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker URL cannot be parsed.
    pub fn new(
        broker: &str,
        client_id: &str,
        scheme: TopicScheme,
    ) -> Result<(Self, EventLoop), HostSetupError> {
        let (host, port) = parse_mqtt_url(broker)?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                scheme,
                attrs: Mutex::new(HashMap::new()),
            },
            eventloop,
        ))
    }

    /// Subscribe to the accessory's command topics.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription fails.
    pub async fn subscribe_commands(&self) -> Result<(), HostError> {
        let topic = self.scheme.command_wildcard();

        tracing::info!(topic, "Subscribing to command topics");

        self.client
            .subscribe(&topic, QoS::AtLeastOnce)
            .await
            .map_err(backend)
    }

    fn attrs(&self) -> MutexGuard<'_, HashMap<AttributeId, bool>> {
        self.attrs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl AccessoryHost for MqttHost {
    async fn ensure_attribute(&self, spec: &AttributeSpec) -> Result<(), HostError> {
        let topic = self.scheme.config(&spec.attribute);
        let payload = serde_json::to_vec(spec).map_err(|e| HostError::Backend(e.to_string()))?;

        tracing::debug!(attribute = %spec.attribute, topic, "Publishing attribute config");

        self.client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(backend)?;

        self.attrs().insert(spec.attribute.clone(), spec.writable);
        Ok(())
    }

    async fn remove_attribute(&self, id: &AttributeId) -> Result<(), HostError> {
        for topic in [self.scheme.config(id), self.scheme.state(id)] {
            self.client
                .publish(&topic, QoS::AtLeastOnce, true, Vec::new())
                .await
                .map_err(backend)?;
        }

        self.attrs().remove(id);
        tracing::info!(attribute = %id, "Cleared attribute topics");
        Ok(())
    }

    async fn attributes(&self) -> Result<Vec<AttributeId>, HostError> {
        Ok(self.attrs().keys().cloned().collect())
    }

    async fn push_value(&self, id: &AttributeId, value: &Value) -> Result<(), HostError> {
        if !self.attrs().contains_key(id) {
            return Err(HostError::UnknownAttribute(id.to_string()));
        }

        let topic = self.scheme.state(id);
        let payload =
            serde_json::to_vec(value).map_err(|e| HostError::Backend(e.to_string()))?;

        tracing::debug!(attribute = %id, topic, "Publishing state");

        self.client
            .publish(&topic, QoS::AtLeastOnce, true, payload)
            .await
            .map_err(backend)
    }
}

fn backend(e: rumqttc::ClientError) -> HostError {
    HostError::Backend(e.to_string())
}

/// Parse an MQTT broker URL into host and port.
fn parse_mqtt_url(input: &str) -> Result<(String, u16), HostSetupError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| HostSetupError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(HostSetupError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| HostSetupError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(1883);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| HostSetupError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => 1883,
        Some(port) => port.parse().map_err(|_| {
            HostSetupError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(HostSetupError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}

/// Errors raised while setting up the MQTT host.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HostSetupError {
    /// Invalid MQTT broker URL
    #[error("invalid MQTT broker URL: {0}")]
    InvalidBrokerUrl(String),
}
