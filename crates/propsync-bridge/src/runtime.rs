//! Bridge assembly and main loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rumqttc::{Event, Packet};
use uuid::Uuid;

use propsync_adapter_http::{HttpDevice, HttpDeviceConfig};
use propsync_core::SyncEngine;
use propsync_history::SqliteHistory;

use crate::config::BridgeConfig;
use crate::host::MqttHost;
use crate::tables;
use crate::topics::{accessory_slug, TopicScheme};

/// Wires the device adapter, engine, history log and MQTT host together.
pub struct Bridge {
    config: BridgeConfig,
}

impl Bridge {
    /// Create a bridge from its configuration.
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Run the bridge until Ctrl+C.
    ///
    /// Spawns the poll loop, then drives the MQTT event loop on the
    /// current task, dispatching inbound commands to the engine.
    ///
    /// # Errors
    ///
    /// Returns an error if a component fails to initialize or the
    /// accessory cannot be registered.
    pub async fn run(self) -> anyhow::Result<()> {
        let device = HttpDevice::new(HttpDeviceConfig {
            base_url: self.config.device.base_url.clone(),
            token: self.config.device.token.clone(),
            ..HttpDeviceConfig::default()
        })
        .context("failed to create device client")?;

        let rollover =
            i64::try_from(self.config.history.rollover.as_secs()).unwrap_or(i64::MAX);
        let history = SqliteHistory::open(&self.config.history.db_path)
            .context("failed to open history database")?
            .with_rollover(rollover);

        let scheme = TopicScheme::new(accessory_slug(&self.config.accessory.name));
        let client_id = format!("propsync-{}", Uuid::new_v4());
        let (host, mut eventloop) =
            MqttHost::new(&self.config.mqtt.broker, &client_id, scheme.clone())
                .context("failed to set up MQTT host")?;
        let host = Arc::new(host);

        let engine = Arc::new(SyncEngine::new(
            Arc::new(device),
            host.clone(),
            Arc::new(history),
        ));

        let table = tables::feature_table(&self.config.accessory)
            .context("failed to build feature table")?;
        engine
            .configure(table)
            .await
            .context("failed to register accessory attributes")?;
        host.subscribe_commands()
            .await
            .context("failed to subscribe to command topics")?;

        let poll_engine = engine.clone();
        let poll_interval = self.config.device.poll_interval;
        tokio::spawn(async move {
            loop {
                if let Err(err) = poll_engine.refresh().await {
                    tracing::debug!(error = %err, "Poll cycle failed");
                }
                tokio::time::sleep(poll_interval).await;
            }
        });

        tracing::info!("Bridge running, press Ctrl+C to stop");

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(attribute) = scheme.parse_command(&publish.topic) else {
                            continue;
                        };
                        let value = match serde_json::from_slice(&publish.payload) {
                            Ok(value) => value,
                            Err(err) => {
                                tracing::warn!(
                                    topic = %publish.topic,
                                    error = %err,
                                    "Ignoring command with malformed payload"
                                );
                                continue;
                            }
                        };
                        let engine = engine.clone();
                        tokio::spawn(async move {
                            match engine.write_attribute(&attribute, value).await {
                                Ok(()) => {
                                    tracing::info!(attribute = %attribute, "Write applied");
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        attribute = %attribute,
                                        error = %err,
                                        "Write failed"
                                    );
                                }
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::error!(error = %err, "MQTT connection error, retrying");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                },
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        tracing::info!("Bridge stopped");
        Ok(())
    }
}
