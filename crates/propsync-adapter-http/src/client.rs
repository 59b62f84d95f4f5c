//! HTTP RPC client for LAN appliances.
//!
//! One endpoint, one envelope: every exchange is a `POST {base_url}/rpc`
//! with `{"id", "method", "params"}`, answered by `{"result"}` or
//! `{"error": {"code", "message"}}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use propsync_core::{DeviceError, DeviceProtocol};

/// Error code devices use for a rejected token.
const AUTH_ERROR_CODE: i64 = -32001;

/// HTTP device adapter configuration.
#[derive(Debug, Clone)]
pub struct HttpDeviceConfig {
    /// Base URL of the appliance (e.g., <http://192.168.4.1>)
    pub base_url: String,
    /// Optional bearer token for authentication
    pub token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for HttpDeviceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.4.1".to_string(),
            token: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// [`DeviceProtocol`] implementation over the HTTP RPC endpoint.
pub struct HttpDevice {
    client: Client,
    config: HttpDeviceConfig,
    next_id: AtomicU64,
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    result: Option<Value>,
    error: Option<RpcFault>,
}

#[derive(Deserialize)]
struct RpcFault {
    code: i64,
    message: String,
}

impl HttpDevice {
    /// Create a new HTTP device adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL has no `http`/`https` scheme or
    /// the HTTP client cannot be created.
    pub fn new(config: HttpDeviceConfig) -> Result<Self, HttpDeviceError> {
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(HttpDeviceError::InvalidBaseUrl(config.base_url));
        }

        let mut builder = Client::builder().timeout(config.timeout);
        if config.base_url.starts_with("https://") {
            builder = builder.use_rustls_tls();
        }
        let client = builder
            .build()
            .map_err(|e| HttpDeviceError::Init(e.to_string()))?;

        Ok(Self {
            client,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    fn rpc_url(&self) -> String {
        format!("{}/rpc", self.config.base_url.trim_end_matches('/'))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, DeviceError> {
        let url = self.rpc_url();
        let body = RpcRequest {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let mut request = self.client.post(&url).json(&body);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DeviceError::Io(e.to_string()))?;

        if !status.is_success() {
            return Err(classify_status(status, &text));
        }
        decode_envelope(&text)
    }
}

#[async_trait]
impl DeviceProtocol for HttpDevice {
    async fn get_properties(&self, keys: &[String]) -> Result<HashMap<String, Value>, DeviceError> {
        tracing::debug!(count = keys.len(), "POST get_props");
        let result = self.call("get_props", json!({ "keys": keys })).await?;
        into_property_map(result)
    }

    async fn set_property(&self, key: &str, call: &str, value: &Value) -> Result<(), DeviceError> {
        tracing::debug!(key, method = call, "POST property write");
        self.call(call, Value::Array(vec![value.clone()])).await?;
        Ok(())
    }
}

/// Maps a non-success HTTP status onto the engine's error taxonomy.
///
/// `401`/`403` mean the token is wrong, server errors are worth retrying
/// next cycle, and anything else points at a misconfigured endpoint.
fn classify_status(status: StatusCode, body: &str) -> DeviceError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        DeviceError::InvalidCredential(format!("device returned {status}"))
    } else if status.is_server_error() {
        DeviceError::Io(format!("device returned {status}"))
    } else {
        DeviceError::Protocol(format!("unexpected status {status}: {body}"))
    }
}

fn decode_envelope(body: &str) -> Result<Value, DeviceError> {
    let envelope: RpcEnvelope = serde_json::from_str(body)
        .map_err(|e| DeviceError::Protocol(format!("malformed response: {e}")))?;

    if let Some(fault) = envelope.error {
        if fault.code == AUTH_ERROR_CODE {
            return Err(DeviceError::InvalidCredential(fault.message));
        }
        return Err(DeviceError::Call {
            code: fault.code,
            message: fault.message,
        });
    }

    envelope
        .result
        .ok_or_else(|| DeviceError::Protocol("response carries neither result nor error".into()))
}

fn into_property_map(result: Value) -> Result<HashMap<String, Value>, DeviceError> {
    match result {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(DeviceError::Protocol(format!(
            "get_props result is not an object: {other}"
        ))),
    }
}

/// Errors raised while constructing the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpDeviceError {
    /// The base URL does not start with `http://` or `https://`
    #[error("device base URL must use http or https: {0}")]
    InvalidBaseUrl(String),
    /// Client initialization failed
    #[error("client init error: {0}")]
    Init(String),
}
