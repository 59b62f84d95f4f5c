//! # Write Hooks
//!
//! Hooks let a feature table wrap extra behaviour around the write path
//! without the engine knowing anything device-specific: a before-write hook
//! can redirect the write to a different device call (and skip the default
//! one), an after-write hook can fan out to related attributes once the
//! value is applied.
//!
//! Hooks receive a [`WriteContext`] with borrowed handles to the device and
//! host, so they can issue their own calls with `?` on failure.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::binding::AttributeId;
use crate::device::{DeviceError, DeviceProtocol};
use crate::host::{AccessoryHost, HostError};

/// Verdict of a before-write hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    /// Continue with the binding's own device call.
    Proceed,
    /// The hook applied the value itself; skip the binding's device call.
    SkipDeviceCall,
}

/// Everything a hook can see about the write in progress.
pub struct WriteContext<'a> {
    /// The value the external caller asked for, in the attribute's domain.
    pub requested: &'a Value,
    /// The device-domain value. `None` in before-write hooks (it has not
    /// been computed yet); always set in after-write hooks, even when the
    /// device call was skipped.
    pub device_value: Option<&'a Value>,
    /// Attribute being written.
    pub attribute: &'a AttributeId,
    /// Device handle for issuing additional calls.
    pub device: &'a dyn DeviceProtocol,
    /// Host handle for adjusting related attributes.
    pub host: &'a dyn AccessoryHost,
}

/// Runs before the binding's device call.
#[async_trait]
pub trait BeforeWrite: Send + Sync {
    /// Inspects or redirects the write.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the write; the binding's device call and
    /// the after-write hook do not run.
    async fn run(&self, cx: WriteContext<'_>) -> Result<WriteAction, HookError>;
}

/// Runs after the binding's device call (or after a skip).
#[async_trait]
pub trait AfterWrite: Send + Sync {
    /// Reacts to the applied write.
    ///
    /// # Errors
    ///
    /// Returning an error fails the write from the caller's point of view,
    /// although the device call has already been made.
    async fn run(&self, cx: WriteContext<'_>) -> Result<(), HookError>;
}

/// Failure raised by a write hook.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
    /// Wraps an arbitrary message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<DeviceError> for HookError {
    fn from(err: DeviceError) -> Self {
        Self(err.to_string())
    }
}

impl From<HostError> for HookError {
    fn from(err: HostError) -> Self {
        Self(err.to_string())
    }
}
