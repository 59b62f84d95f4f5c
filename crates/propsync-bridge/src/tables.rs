//! Built-in device model tables.
//!
//! One feature table per supported appliance model. Flags in the
//! accessory configuration switch the optional blocks on and off; the
//! tables themselves stay declarative and feed straight into the engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use propsync_core::{
    AfterWrite, AttributeId, BeforeWrite, Binding, FeatureTable, HookError, WriteAction,
    WriteContext,
};

use crate::config::AccessoryConfig;

/// Build the feature table for the configured device model.
///
/// # Errors
///
/// Returns an error for device models this bridge does not know.
pub fn feature_table(accessory: &AccessoryConfig) -> Result<FeatureTable, TableError> {
    match accessory.model.as_str() {
        "humidifier-h1" => Ok(humidifier_h1(accessory)),
        "climate-sensor-c1" => Ok(climate_sensor_c1(accessory)),
        other => Err(TableError::UnknownModel(other.to_string())),
    }
}

/// Errors raised while building a feature table.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TableError {
    /// The configured device model has no table
    #[error("unknown device model: {0}")]
    UnknownModel(String),
}

fn humidifier_h1(accessory: &AccessoryConfig) -> FeatureTable {
    let mut bindings = vec![
        Binding::device(AttributeId::new("humidifier", "active"), "power")
            .read(on_off_to_bit)
            .write_with("set_power", bit_to_on_off),
        Binding::device(AttributeId::new("humidifier", "mode"), "mode").write("set_mode"),
        target_humidity(accessory),
        Binding::device(AttributeId::new("humidifier", "current-humidity"), "hum")
            .history("climate", "humidity"),
        Binding::device(AttributeId::new("humidifier", "water-level"), "depth")
            .read(water_percent),
        Binding::fixed(AttributeId::new("info", "model"), json!(accessory.model)),
        identity(accessory),
    ];

    if let Some(serial) = &accessory.serial {
        bindings.push(Binding::fixed(
            AttributeId::new("info", "serial"),
            json!(serial),
        ));
    }

    if accessory.features.temperature {
        bindings.push(temperature(accessory));
    }

    if accessory.features.child_lock {
        bindings.push(
            Binding::device(
                AttributeId::with_subtype("switch", "child-lock", "active"),
                "child_lock",
            )
            .read(on_off_to_bit)
            .write_with("set_child_lock", bit_to_on_off)
            .named("Child Lock"),
        );
    }

    FeatureTable::new(bindings)
}

fn climate_sensor_c1(accessory: &AccessoryConfig) -> FeatureTable {
    let mut bindings = vec![
        temperature(accessory),
        Binding::device(AttributeId::new("sensor", "humidity"), "hum")
            .history("climate", "humidity"),
        Binding::device(AttributeId::new("battery", "level"), "battery"),
        Binding::device(AttributeId::new("battery", "low"), "battery").read(low_battery),
        Binding::fixed(AttributeId::new("info", "model"), json!(accessory.model)),
        identity(accessory),
    ];

    if let Some(serial) = &accessory.serial {
        bindings.push(Binding::fixed(
            AttributeId::new("info", "serial"),
            json!(serial),
        ));
    }

    FeatureTable::new(bindings)
}

/// The target-humidity setpoint, with the optional write hooks attached.
fn target_humidity(accessory: &AccessoryConfig) -> Binding {
    let mut binding = Binding::device(
        AttributeId::new("humidifier", "target-humidity"),
        "target_hum",
    )
    .write("set_target_hum");

    if accessory.features.limit_lock {
        binding = binding.before_write(Arc::new(LimitLockHook));
    }
    if accessory.features.auto_mode {
        binding = binding.after_write(Arc::new(AutoModeHook {
            mode_attribute: AttributeId::new("humidifier", "mode"),
        }));
    }
    binding
}

fn temperature(accessory: &AccessoryConfig) -> Binding {
    let mut binding = Binding::device(AttributeId::new("sensor", "temperature"), "temp_dec")
        .read(tenths)
        .history("climate", "temp");
    if let Some(name) = &accessory.temperature_name {
        binding = binding.named(name.clone());
    }
    binding
}

fn identity(accessory: &AccessoryConfig) -> Binding {
    let identity = format!("{}:{}", accessory.model, accessory.name);
    Binding::computed(AttributeId::new("info", "identity"), move || {
        json!(identity)
    })
}

/// Redirects a setpoint write to the device's limit call.
///
/// With the limit lock engaged the appliance chases its own sensor, so
/// the setpoint call would be rejected; the limit call carries the same
/// percentage and sticks.
struct LimitLockHook;

#[async_trait]
impl BeforeWrite for LimitLockHook {
    async fn run(&self, cx: WriteContext<'_>) -> Result<WriteAction, HookError> {
        cx.device
            .set_property("limit_hum", "set_limit_hum", cx.requested)
            .await?;
        tracing::debug!(attribute = %cx.attribute, "Applied humidity limit; skipping setpoint call");
        Ok(WriteAction::SkipDeviceCall)
    }
}

/// Re-asserts auto mode after a setpoint write.
///
/// The appliance drops to manual mode whenever a setpoint is written;
/// this hook switches it straight back and reflects the change on the
/// mode attribute without waiting for the next poll.
struct AutoModeHook {
    mode_attribute: AttributeId,
}

#[async_trait]
impl AfterWrite for AutoModeHook {
    async fn run(&self, cx: WriteContext<'_>) -> Result<(), HookError> {
        cx.device
            .set_property("mode", "set_mode", &json!("auto"))
            .await?;
        cx.host
            .push_value(&self.mode_attribute, &json!("auto"))
            .await?;
        tracing::debug!(attribute = %cx.attribute, "Re-asserted auto mode");
        Ok(())
    }
}

fn on_off_to_bit(v: &Value) -> Value {
    match v.as_str() {
        Some("on") => json!(1),
        Some("off") => json!(0),
        _ => Value::Null,
    }
}

fn bit_to_on_off(v: &Value) -> Value {
    let on = v.as_bool().unwrap_or(v.as_i64() == Some(1));
    json!(if on { "on" } else { "off" })
}

fn tenths(v: &Value) -> Value {
    v.as_f64().map_or(Value::Null, |n| json!(n / 10.0))
}

/// Tank depth in millimeters (0..=120) to a fill percentage.
#[allow(clippy::cast_possible_truncation)]
fn water_percent(v: &Value) -> Value {
    v.as_f64().map_or(Value::Null, |depth| {
        json!((depth / 1.2).round().clamp(0.0, 100.0) as i64)
    })
}

fn low_battery(v: &Value) -> Value {
    v.as_f64().map_or(Value::Null, |level| json!(level < 20.0))
}
