//! # propsync Core
//!
//! Binding model, collaborator traits, and synchronization engine for
//! propsync: a bridge that projects a networked appliance's properties
//! onto smart-home accessory attributes.
//!
//! This crate provides:
//! - A declarative binding model (feature tables) mapping device
//!   properties, fixed values, and computed values onto attributes
//! - Collaborator traits for the device protocol, the accessory host,
//!   and the history log
//! - The synchronization engine: poll cycle, cached reads, hooked
//!   writes, and opportunistic history recording

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binding;
pub mod device;
pub mod engine;
pub mod history;
pub mod hooks;
pub mod host;
pub mod value;

pub use binding::{
    AttributeId, AttributeSpec, Binding, ConfigError, FeatureTable, HistoryTag, Source,
};
pub use device::{DeviceError, DeviceProtocol};
pub use engine::{RegisterError, SyncEngine, WriteError};
pub use history::{HistoryEntry, HistoryError, HistoryLog};
pub use hooks::{AfterWrite, BeforeWrite, HookError, WriteAction, WriteContext};
pub use host::{AccessoryHost, HostError};
pub use value::PropertyMap;
