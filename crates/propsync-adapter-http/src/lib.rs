//! # HTTP Device Adapter
//!
//! Implements [`propsync_core::DeviceProtocol`] over the JSON-RPC style
//! endpoint many LAN appliances expose: a single `POST {base_url}/rpc`
//! route, batched `get_props` reads, and one method per settable property.
//!
//! Credential rejections are mapped onto
//! [`propsync_core::DeviceError::InvalidCredential`] so the engine can
//! report them louder than ordinary network hiccups.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;

pub use client::{HttpDevice, HttpDeviceConfig, HttpDeviceError};
