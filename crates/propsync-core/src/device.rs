//! # Device Protocol
//!
//! The engine's view of the appliance: batched property reads and single
//! property writes. Transport details (HTTP, token handshakes, local
//! protocol quirks) live behind this trait in adapter crates.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Transport-agnostic access to a networked appliance.
#[async_trait]
pub trait DeviceProtocol: Send + Sync {
    /// Fetches current values for the given property keys in one batched
    /// request.
    ///
    /// # Errors
    ///
    /// Fails when the device is unreachable, rejects the credential, or
    /// answers with something unintelligible.
    async fn get_properties(&self, keys: &[String]) -> Result<HashMap<String, Value>, DeviceError>;

    /// Applies `value` to the property `key` through the device-side call
    /// named `call`.
    ///
    /// # Errors
    ///
    /// Fails when the device is unreachable, rejects the credential, or
    /// rejects the call itself.
    async fn set_property(&self, key: &str, call: &str, value: &Value) -> Result<(), DeviceError>;
}

/// Failure talking to the device.
#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    /// The device is reachable but rejects the configured credential.
    /// Retrying without operator action will not help.
    #[error("invalid device credential: {0}")]
    InvalidCredential(String),

    /// Transient transport failure (connect, timeout, reset). The next
    /// poll cycle retries.
    #[error("device i/o error: {0}")]
    Io(String),

    /// The device answered but rejected the operation in-band.
    #[error("device call failed (code {code}): {message}")]
    Call {
        /// Device-reported error code.
        code: i64,
        /// Device-reported error message.
        message: String,
    },

    /// The device answered with a payload the adapter could not interpret.
    #[error("device protocol error: {0}")]
    Protocol(String),
}

impl DeviceError {
    /// Whether this failure is a credential rejection.
    ///
    /// Credential failures are reported louder than transient ones, since
    /// they persist until an operator replaces the token.
    #[must_use]
    pub fn is_credential(&self) -> bool {
        matches!(self, Self::InvalidCredential(_))
    }
}
