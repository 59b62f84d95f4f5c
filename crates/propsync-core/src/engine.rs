//! # Synchronization Engine
//!
//! The engine owns the property cache and drives the four operations that
//! make a feature table live:
//!
//! - **configure** registers the table's attributes on the host and builds
//!   the property index,
//! - **refresh** runs one poll cycle: batched device fetch, wholesale cache
//!   swap, value projection, and opportunistic history recording,
//! - **read_attribute** answers reads from the cache alone,
//! - **write_attribute** runs the hook/transform/device-call write path.
//!
//! The engine never schedules itself. The embedding runtime calls
//! [`SyncEngine::refresh`] on its own cadence, and awaiting one refresh
//! before sleeping is what keeps poll cycles from overlapping. Internally
//! no lock is held across an `await`, so reads and writes stay responsive
//! while a cycle runs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::binding::{
    AttributeId, Binding, ConfigError, DeviceBinding, FeatureTable, HistoryTag, ReadTransform,
    Source,
};
use crate::device::{DeviceError, DeviceProtocol};
use crate::history::{HistoryEntry, HistoryError, HistoryLog};
use crate::hooks::{HookError, WriteAction, WriteContext};
use crate::host::{AccessoryHost, HostError};
use crate::value::{coerce_integer, is_falsy, PropertyMap};

/// Registration failure; the feature table was not installed.
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The table failed validation.
    #[error("invalid feature table: {0}")]
    Config(#[from] ConfigError),

    /// The accessory host rejected an attribute operation.
    #[error("attribute registration failed: {0}")]
    Host(#[from] HostError),
}

/// Failure of one external write.
#[derive(Debug, Error)]
pub enum WriteError {
    /// No binding targets this attribute.
    #[error("unknown attribute: {0}")]
    UnknownAttribute(String),

    /// The attribute exists but accepts no writes.
    #[error("attribute is read-only: {0}")]
    NotWritable(String),

    /// A write hook failed; see [`crate::hooks`] for which side effects may
    /// already have happened.
    #[error("write hook failed: {0}")]
    Hook(#[from] HookError),

    /// The device rejected the call or was unreachable.
    #[error("device write failed: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Default)]
struct EngineState {
    bindings: Vec<Binding>,
    by_attribute: HashMap<AttributeId, usize>,
    /// Property name -> indices of bindings that read it.
    index: HashMap<String, Vec<usize>>,
    channels: Vec<String>,
}

/// Work item for one binding during a poll cycle, cloned out of the state
/// lock so projection can run without holding it.
struct Projection {
    attribute: AttributeId,
    property: String,
    read: Option<ReadTransform>,
    history: Option<HistoryTag>,
}

/// Drives one accessory's feature table against a device, a host, and a
/// history log.
pub struct SyncEngine {
    device: Arc<dyn DeviceProtocol>,
    host: Arc<dyn AccessoryHost>,
    history: Arc<dyn HistoryLog>,
    state: RwLock<EngineState>,
    /// Latest device snapshot, replaced wholesale after each successful
    /// poll. Readers clone the `Arc` and keep a consistent view even while
    /// the next cycle swaps in a new one.
    cache: RwLock<Arc<PropertyMap>>,
}

impl SyncEngine {
    /// Creates an engine with an empty feature table.
    #[must_use]
    pub fn new(
        device: Arc<dyn DeviceProtocol>,
        host: Arc<dyn AccessoryHost>,
        history: Arc<dyn HistoryLog>,
    ) -> Self {
        Self {
            device,
            host,
            history,
            state: RwLock::new(EngineState::default()),
            cache: RwLock::new(Arc::new(PropertyMap::new())),
        }
    }

    /// Installs a feature table: validates it, materializes its attributes
    /// on the host, removes host attributes the table no longer declares,
    /// rebuilds the property index, and pushes fixed/computed values once.
    ///
    /// Device-backed attributes report their null sentinel until the first
    /// successful [`refresh`](Self::refresh).
    ///
    /// # Errors
    ///
    /// Fails on an invalid table or when the host rejects an attribute
    /// operation; the previous table stays installed in that case.
    pub async fn configure(&self, table: FeatureTable) -> Result<(), RegisterError> {
        table.validate()?;

        let desired: HashSet<AttributeId> = table
            .bindings()
            .iter()
            .map(|b| b.attribute.clone())
            .collect();

        for binding in table.bindings() {
            self.host.ensure_attribute(&binding.spec()).await?;
        }

        for id in self.host.attributes().await? {
            if !desired.contains(&id) {
                tracing::info!(attribute = %id, "Removing stale attribute");
                self.host.remove_attribute(&id).await?;
            }
        }

        let channels = table.channels();
        let bindings = table.into_bindings();
        let mut by_attribute = HashMap::with_capacity(bindings.len());
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, binding) in bindings.iter().enumerate() {
            by_attribute.insert(binding.attribute.clone(), i);
            if let Some(property) = binding.property() {
                index.entry(property.to_string()).or_default().push(i);
            }
        }

        tracing::info!(
            attributes = bindings.len(),
            properties = index.len(),
            channels = ?channels,
            "Accessory configured"
        );

        let initial: Vec<(AttributeId, Value)> = bindings
            .iter()
            .filter_map(|b| match &b.source {
                Source::Static(v) => Some((b.attribute.clone(), v.clone())),
                Source::Computed(f) => Some((b.attribute.clone(), f())),
                Source::Device(_) => None,
            })
            .collect();

        {
            let mut state = self.state_mut();
            *state = EngineState {
                bindings,
                by_attribute,
                index,
                channels,
            };
        }

        for (id, value) in initial {
            if let Err(err) = self.host.push_value(&id, &value).await {
                tracing::warn!(attribute = %id, error = %err, "Failed to push initial value");
            }
        }
        Ok(())
    }

    /// Runs one poll cycle.
    ///
    /// Fetches every indexed property in a single batched call, swaps the
    /// snapshot into the cache, pushes every bound attribute's (possibly
    /// transformed) value to the host, and records history-tagged readings.
    /// Values are pushed even when unchanged; stale-value suppression is
    /// the host's business.
    ///
    /// # Errors
    ///
    /// Fails only when the device fetch fails; the previous cache snapshot
    /// and host values are left untouched then. Host push and history
    /// failures are logged and do not fail the cycle.
    pub async fn refresh(&self) -> Result<(), DeviceError> {
        let keys = self.polled_properties();
        if keys.is_empty() {
            tracing::debug!("No device-backed bindings; nothing to poll");
            return Ok(());
        }

        let fetched = match self.device.get_properties(&keys).await {
            Ok(values) => values,
            Err(err) => {
                if err.is_credential() {
                    tracing::error!(error = %err, "Device rejected the configured credential");
                } else {
                    tracing::warn!(error = %err, "Poll failed; keeping the previous snapshot");
                }
                return Err(err);
            }
        };

        let snapshot = Arc::new(fetched);
        {
            let mut cache = self.cache_mut();
            *cache = Arc::clone(&snapshot);
        }
        tracing::debug!(properties = snapshot.len(), "Device snapshot refreshed");

        let plan: Vec<Projection> = {
            let state = self.state();
            let mut plan = Vec::new();
            for key in &keys {
                let Some(indices) = state.index.get(key) else {
                    continue;
                };
                for &i in indices {
                    let binding = &state.bindings[i];
                    let Some(d) = binding.device_binding() else {
                        continue;
                    };
                    plan.push(Projection {
                        attribute: binding.attribute.clone(),
                        property: d.property.clone(),
                        read: d.read.clone(),
                        history: binding.history.clone(),
                    });
                }
            }
            plan
        };

        let mut recordings: BTreeMap<String, BTreeMap<String, i64>> = BTreeMap::new();
        for item in plan {
            let raw = snapshot.get(&item.property).cloned().unwrap_or(Value::Null);
            let value = match &item.read {
                Some(f) => f(&raw),
                None => raw,
            };

            if let Err(err) = self.host.push_value(&item.attribute, &value).await {
                tracing::warn!(attribute = %item.attribute, error = %err, "Failed to push value");
            }

            if let Some(tag) = item.history {
                if is_falsy(&value) {
                    continue;
                }
                if let Some(n) = coerce_integer(&value) {
                    recordings.entry(tag.channel).or_default().insert(tag.field, n);
                } else {
                    tracing::debug!(
                        attribute = %item.attribute,
                        "Reading has no integer form; not recorded"
                    );
                }
            }
        }

        let now = Utc::now().timestamp();
        for (channel, fields) in recordings {
            if let Err(err) = self.record(&channel, now, fields).await {
                tracing::warn!(channel = %channel, error = %err, "Failed to record history entry");
            }
        }
        Ok(())
    }

    /// Answers a read from the cache alone; never contacts the device.
    ///
    /// Before the first successful poll, device-backed attributes see a
    /// null sentinel run through their read transform. Returns `None` for
    /// attributes no binding targets.
    #[must_use]
    pub fn read_attribute(&self, id: &AttributeId) -> Option<Value> {
        let state = self.state();
        let &i = state.by_attribute.get(id)?;
        let value = match &state.bindings[i].source {
            Source::Static(v) => v.clone(),
            Source::Computed(f) => f(),
            Source::Device(d) => {
                let cache = self.cache_snapshot();
                let raw = cache.get(&d.property).cloned().unwrap_or(Value::Null);
                d.attribute_value(&raw)
            }
        };
        Some(value)
    }

    /// Applies one external write: before-write hook, write transform,
    /// device call (unless the hook skipped it), after-write hook.
    ///
    /// The after-write hook runs even when the device call was skipped; it
    /// receives the device-domain value that would have been sent.
    ///
    /// # Errors
    ///
    /// Fails for unknown or read-only attributes, when a hook errors, or
    /// when the device rejects the call. A before-write hook error aborts
    /// the write before any device call.
    pub async fn write_attribute(
        &self,
        id: &AttributeId,
        requested: Value,
    ) -> Result<(), WriteError> {
        let (property, spec) = {
            let state = self.state();
            let Some(&i) = state.by_attribute.get(id) else {
                return Err(WriteError::UnknownAttribute(id.to_string()));
            };
            match &state.bindings[i].source {
                Source::Device(DeviceBinding {
                    property,
                    write: Some(spec),
                    ..
                }) => (property.clone(), spec.clone()),
                _ => return Err(WriteError::NotWritable(id.to_string())),
            }
        };

        let mut action = WriteAction::Proceed;
        if let Some(before) = &spec.before {
            action = before
                .run(WriteContext {
                    requested: &requested,
                    device_value: None,
                    attribute: id,
                    device: self.device.as_ref(),
                    host: self.host.as_ref(),
                })
                .await?;
        }

        let device_value = spec.device_value(&requested);

        match action {
            WriteAction::Proceed => {
                self.device
                    .set_property(&property, &spec.call, &device_value)
                    .await
                    .map_err(|err| {
                        if err.is_credential() {
                            tracing::error!(error = %err, "Device rejected the configured credential");
                        }
                        err
                    })?;
                tracing::debug!(attribute = %id, call = %spec.call, "Write applied");
            }
            WriteAction::SkipDeviceCall => {
                tracing::debug!(attribute = %id, "Before-write hook took over; device call skipped");
            }
        }

        if let Some(after) = &spec.after {
            after
                .run(WriteContext {
                    requested: &requested,
                    device_value: Some(&device_value),
                    attribute: id,
                    device: self.device.as_ref(),
                    host: self.host.as_ref(),
                })
                .await?;
        }
        Ok(())
    }

    /// Property keys the poll cycle fetches, sorted.
    #[must_use]
    pub fn polled_properties(&self) -> Vec<String> {
        let state = self.state();
        let mut keys: Vec<String> = state.index.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// History channels the installed table records into, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.state().channels.clone()
    }

    /// Folds this cycle's fields into the channel's open entry and hands it
    /// back to the log, stamped with the cycle's time.
    async fn record(
        &self,
        channel: &str,
        now: i64,
        fields: BTreeMap<String, i64>,
    ) -> Result<(), HistoryError> {
        let mut entry = self
            .history
            .current_entry(channel)
            .await?
            .unwrap_or_else(|| HistoryEntry::new(now));
        entry.time = now;
        for (field, value) in fields {
            entry.fields.insert(field, value);
        }
        self.history.append_or_update(channel, &entry).await
    }

    fn state(&self) -> RwLockReadGuard<'_, EngineState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, EngineState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_snapshot(&self) -> Arc<PropertyMap> {
        Arc::clone(&self.cache.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn cache_mut(&self) -> RwLockWriteGuard<'_, Arc<PropertyMap>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::AttributeSpec;
    use crate::hooks::{AfterWrite, BeforeWrite};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeDevice {
        values: Mutex<PropertyMap>,
        fail_polls: AtomicBool,
        fail_sets: AtomicBool,
        polls: AtomicUsize,
        set_calls: Mutex<Vec<(String, String, Value)>>,
    }

    impl FakeDevice {
        fn with_values(pairs: &[(&str, Value)]) -> Arc<Self> {
            let device = Self::default();
            device.set_values(pairs);
            Arc::new(device)
        }

        fn set_values(&self, pairs: &[(&str, Value)]) {
            *self.values.lock().unwrap() = pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect();
        }

        fn calls(&self) -> Vec<(String, String, Value)> {
            self.set_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceProtocol for FakeDevice {
        async fn get_properties(
            &self,
            keys: &[String],
        ) -> Result<HashMap<String, Value>, DeviceError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            if self.fail_polls.load(Ordering::SeqCst) {
                return Err(DeviceError::Io("link down".into()));
            }
            let values = self.values.lock().unwrap();
            Ok(keys
                .iter()
                .filter_map(|k| values.get(k).map(|v| (k.clone(), v.clone())))
                .collect())
        }

        async fn set_property(
            &self,
            key: &str,
            call: &str,
            value: &Value,
        ) -> Result<(), DeviceError> {
            if self.fail_sets.load(Ordering::SeqCst) {
                return Err(DeviceError::Call {
                    code: -1,
                    message: "busy".into(),
                });
            }
            self.set_calls
                .lock()
                .unwrap()
                .push((key.to_string(), call.to_string(), value.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeHost {
        attrs: Mutex<HashMap<AttributeId, bool>>,
        pushes: Mutex<Vec<(AttributeId, Value)>>,
    }

    impl FakeHost {
        fn latest(&self, id: &AttributeId) -> Option<Value> {
            self.pushes
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(pushed, _)| pushed == id)
                .map(|(_, v)| v.clone())
        }

        fn clear_pushes(&self) {
            self.pushes.lock().unwrap().clear();
        }

        fn push_count(&self) -> usize {
            self.pushes.lock().unwrap().len()
        }

        fn has_attribute(&self, id: &AttributeId) -> bool {
            self.attrs.lock().unwrap().contains_key(id)
        }
    }

    #[async_trait]
    impl AccessoryHost for FakeHost {
        async fn ensure_attribute(&self, spec: &AttributeSpec) -> Result<(), HostError> {
            self.attrs
                .lock()
                .unwrap()
                .insert(spec.attribute.clone(), spec.writable);
            Ok(())
        }

        async fn remove_attribute(&self, id: &AttributeId) -> Result<(), HostError> {
            self.attrs.lock().unwrap().remove(id);
            Ok(())
        }

        async fn attributes(&self) -> Result<Vec<AttributeId>, HostError> {
            Ok(self.attrs.lock().unwrap().keys().cloned().collect())
        }

        async fn push_value(&self, id: &AttributeId, value: &Value) -> Result<(), HostError> {
            self.pushes.lock().unwrap().push((id.clone(), value.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeHistory {
        entries: Mutex<HashMap<String, HistoryEntry>>,
        appends: AtomicUsize,
    }

    impl FakeHistory {
        fn entry(&self, channel: &str) -> Option<HistoryEntry> {
            self.entries.lock().unwrap().get(channel).cloned()
        }
    }

    #[async_trait]
    impl HistoryLog for FakeHistory {
        async fn current_entry(&self, channel: &str) -> Result<Option<HistoryEntry>, HistoryError> {
            Ok(self.entries.lock().unwrap().get(channel).cloned())
        }

        async fn append_or_update(
            &self,
            channel: &str,
            entry: &HistoryEntry,
        ) -> Result<(), HistoryError> {
            self.appends.fetch_add(1, Ordering::SeqCst);
            self.entries
                .lock()
                .unwrap()
                .insert(channel.to_string(), entry.clone());
            Ok(())
        }
    }

    struct Rig {
        device: Arc<FakeDevice>,
        host: Arc<FakeHost>,
        history: Arc<FakeHistory>,
        engine: SyncEngine,
    }

    fn rig(device: Arc<FakeDevice>) -> Rig {
        let host = Arc::new(FakeHost::default());
        let history = Arc::new(FakeHistory::default());
        let engine = SyncEngine::new(device.clone(), host.clone(), history.clone());
        Rig {
            device,
            host,
            history,
            engine,
        }
    }

    fn attr(service: &str, characteristic: &str) -> AttributeId {
        AttributeId::new(service, characteristic)
    }

    fn tenths(v: &Value) -> Value {
        v.as_f64().map_or(Value::Null, |n| json!(n / 10.0))
    }

    struct SkippingBefore;

    #[async_trait]
    impl BeforeWrite for SkippingBefore {
        async fn run(&self, cx: WriteContext<'_>) -> Result<WriteAction, HookError> {
            cx.device
                .set_property("limit_hum", "set_limit_hum", cx.requested)
                .await?;
            Ok(WriteAction::SkipDeviceCall)
        }
    }

    struct FailingBefore;

    #[async_trait]
    impl BeforeWrite for FailingBefore {
        async fn run(&self, _cx: WriteContext<'_>) -> Result<WriteAction, HookError> {
            Err(HookError::new("refused"))
        }
    }

    #[derive(Default)]
    struct RecordingAfter {
        seen: Mutex<Option<(Value, Option<Value>)>>,
    }

    #[async_trait]
    impl AfterWrite for RecordingAfter {
        async fn run(&self, cx: WriteContext<'_>) -> Result<(), HookError> {
            *self.seen.lock().unwrap() = Some((cx.requested.clone(), cx.device_value.cloned()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn index_tracks_only_device_backed_bindings() {
        let device = FakeDevice::with_values(&[("hum", json!(40)), ("temp_dec", json!(215))]);
        let r = rig(device);
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(attr("humidifier", "current-humidity"), "hum"),
                Binding::device(attr("humidifier", "target-humidity"), "hum").write("set_target_hum"),
                Binding::device(attr("sensor", "temperature"), "temp_dec"),
                Binding::fixed(attr("info", "model"), json!("H1")),
                Binding::computed(attr("info", "serial"), || json!("sn-1234")),
            ]))
            .await
            .unwrap();

        assert_eq!(
            r.engine.polled_properties(),
            vec!["hum".to_string(), "temp_dec".to_string()]
        );
    }

    #[tokio::test]
    async fn poll_projects_values_through_read_transforms() {
        let device = FakeDevice::with_values(&[("hum", json!(40)), ("temp_dec", json!(215))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        let temperature = attr("sensor", "temperature");
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(humidity.clone(), "hum"),
                Binding::device(temperature.clone(), "temp_dec").read(tenths),
            ]))
            .await
            .unwrap();

        r.engine.refresh().await.unwrap();

        assert_eq!(r.host.latest(&humidity), Some(json!(40)));
        assert_eq!(r.host.latest(&temperature), Some(json!(21.5)));
    }

    #[tokio::test]
    async fn poll_failure_keeps_cache_and_host_values() {
        let device = FakeDevice::with_values(&[("hum", json!(47))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                humidity.clone(),
                "hum",
            )]))
            .await
            .unwrap();
        r.engine.refresh().await.unwrap();
        assert_eq!(r.engine.read_attribute(&humidity), Some(json!(47)));

        r.device.set_values(&[("hum", json!(90))]);
        r.device.fail_polls.store(true, Ordering::SeqCst);
        r.host.clear_pushes();

        let err = r.engine.refresh().await.unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
        assert_eq!(r.host.push_count(), 0);
        assert_eq!(r.engine.read_attribute(&humidity), Some(json!(47)));
    }

    #[tokio::test]
    async fn reads_come_from_cache_never_from_the_device() {
        let device = FakeDevice::with_values(&[("hum", json!(47))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        let level = attr("humidifier", "water-level");
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(humidity.clone(), "hum"),
                Binding::device(level.clone(), "depth")
                    .read(|v| if v.is_null() { json!(0) } else { v.clone() }),
            ]))
            .await
            .unwrap();

        // Before any poll: the null sentinel, run through the transform.
        assert_eq!(r.engine.read_attribute(&humidity), Some(Value::Null));
        assert_eq!(r.engine.read_attribute(&level), Some(json!(0)));
        assert_eq!(r.device.polls.load(Ordering::SeqCst), 0);

        r.engine.refresh().await.unwrap();
        assert_eq!(r.engine.read_attribute(&humidity), Some(json!(47)));
        assert_eq!(r.engine.read_attribute(&level), Some(json!(0)));
        assert_eq!(r.device.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_transforms_then_calls_the_device() {
        let device = FakeDevice::with_values(&[("power", json!("off"))]);
        let r = rig(device);
        let active = attr("humidifier", "active");
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                active.clone(),
                "power",
            )
            .write_with("set_power", |v| {
                json!(if v.as_i64() == Some(1) { "on" } else { "off" })
            })]))
            .await
            .unwrap();

        r.engine.write_attribute(&active, json!(1)).await.unwrap();

        assert_eq!(
            r.device.calls(),
            vec![("power".to_string(), "set_power".to_string(), json!("on"))]
        );
    }

    #[tokio::test]
    async fn skipped_write_still_runs_after_hook() {
        let device = FakeDevice::with_values(&[("target_hum", json!(40))]);
        let r = rig(device);
        let target = attr("humidifier", "target-humidity");
        let after = Arc::new(RecordingAfter::default());
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                target.clone(),
                "target_hum",
            )
            .write_with("set_target_hum", |v| json!(v.as_i64().unwrap_or(0) * 10))
            .before_write(Arc::new(SkippingBefore))
            .after_write(after.clone())]))
            .await
            .unwrap();

        r.engine.write_attribute(&target, json!(6)).await.unwrap();

        // The hook's own call is the only one the device saw.
        assert_eq!(
            r.device.calls(),
            vec![(
                "limit_hum".to_string(),
                "set_limit_hum".to_string(),
                json!(6)
            )]
        );
        // The after-write hook still ran, with the unapplied device value.
        assert_eq!(
            *after.seen.lock().unwrap(),
            Some((json!(6), Some(json!(60))))
        );
    }

    #[tokio::test]
    async fn before_hook_error_aborts_the_write() {
        let device = FakeDevice::with_values(&[("target_hum", json!(40))]);
        let r = rig(device);
        let target = attr("humidifier", "target-humidity");
        let after = Arc::new(RecordingAfter::default());
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                target.clone(),
                "target_hum",
            )
            .write("set_target_hum")
            .before_write(Arc::new(FailingBefore))
            .after_write(after.clone())]))
            .await
            .unwrap();

        let err = r.engine.write_attribute(&target, json!(55)).await.unwrap_err();

        assert!(matches!(err, WriteError::Hook(_)));
        assert!(r.device.calls().is_empty());
        assert!(after.seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_to_unknown_or_read_only_attributes_fail() {
        let device = FakeDevice::with_values(&[("hum", json!(40))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(humidity.clone(), "hum"),
                Binding::fixed(attr("info", "model"), json!("H1")),
            ]))
            .await
            .unwrap();

        let missing = r
            .engine
            .write_attribute(&attr("sensor", "temperature"), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(missing, WriteError::UnknownAttribute(_)));

        let read_only = r.engine.write_attribute(&humidity, json!(1)).await.unwrap_err();
        assert!(matches!(read_only, WriteError::NotWritable(_)));

        let fixed = r
            .engine
            .write_attribute(&attr("info", "model"), json!("X"))
            .await
            .unwrap_err();
        assert!(matches!(fixed, WriteError::NotWritable(_)));
    }

    #[tokio::test]
    async fn device_rejection_surfaces_as_write_error() {
        let device = FakeDevice::with_values(&[("power", json!("off"))]);
        let r = rig(device);
        let active = attr("humidifier", "active");
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                active.clone(),
                "power",
            )
            .write("set_power")]))
            .await
            .unwrap();

        r.device.fail_sets.store(true, Ordering::SeqCst);
        let err = r.engine.write_attribute(&active, json!("on")).await.unwrap_err();
        assert!(matches!(
            err,
            WriteError::Device(DeviceError::Call { code: -1, .. })
        ));
    }

    #[tokio::test]
    async fn climate_readings_merge_into_one_entry() {
        let device = FakeDevice::with_values(&[("temp_dec", json!(213)), ("hum", json!(55))]);
        let r = rig(device);
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(attr("sensor", "temperature"), "temp_dec")
                    .read(tenths)
                    .history("climate", "temp"),
                Binding::device(attr("humidifier", "current-humidity"), "hum")
                    .history("climate", "humidity"),
            ]))
            .await
            .unwrap();

        assert_eq!(r.engine.channels(), vec!["climate".to_string()]);

        let before = Utc::now().timestamp();
        r.engine.refresh().await.unwrap();

        assert_eq!(r.history.appends.load(Ordering::SeqCst), 1);
        let entry = r.history.entry("climate").unwrap();
        assert_eq!(entry.fields.get("temp"), Some(&21));
        assert_eq!(entry.fields.get("humidity"), Some(&55));
        assert!(entry.time >= before && entry.time <= Utc::now().timestamp());
    }

    #[tokio::test]
    async fn falsy_and_non_numeric_readings_are_not_recorded() {
        let device = FakeDevice::with_values(&[
            ("hum", json!(0)),
            ("temp_dec", json!(213)),
            ("mode", json!("auto")),
        ]);
        let r = rig(device);
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(attr("humidifier", "current-humidity"), "hum")
                    .history("climate", "humidity"),
                Binding::device(attr("sensor", "temperature"), "temp_dec")
                    .read(tenths)
                    .history("climate", "temp"),
                Binding::device(attr("humidifier", "mode"), "mode").history("climate", "mode"),
            ]))
            .await
            .unwrap();

        r.engine.refresh().await.unwrap();

        let entry = r.history.entry("climate").unwrap();
        assert_eq!(entry.fields.get("temp"), Some(&21));
        assert!(!entry.fields.contains_key("humidity"));
        assert!(!entry.fields.contains_key("mode"));
    }

    #[tokio::test]
    async fn later_cycles_update_the_open_entry() {
        let device = FakeDevice::with_values(&[("hum", json!(55))]);
        let r = rig(device);
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                attr("humidifier", "current-humidity"),
                "hum",
            )
            .history("climate", "humidity")]))
            .await
            .unwrap();

        r.engine.refresh().await.unwrap();
        r.device.set_values(&[("hum", json!(60))]);
        r.engine.refresh().await.unwrap();

        assert_eq!(r.history.appends.load(Ordering::SeqCst), 2);
        let entry = r.history.entry("climate").unwrap();
        assert_eq!(entry.fields.get("humidity"), Some(&60));
    }

    #[tokio::test]
    async fn reconfigure_removes_stale_attributes() {
        let device = FakeDevice::with_values(&[("hum", json!(40)), ("temp_dec", json!(213))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        let temperature = attr("sensor", "temperature");
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::device(humidity.clone(), "hum"),
                Binding::device(temperature.clone(), "temp_dec"),
            ]))
            .await
            .unwrap();
        assert!(r.host.has_attribute(&temperature));

        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                humidity.clone(),
                "hum",
            )]))
            .await
            .unwrap();

        assert!(r.host.has_attribute(&humidity));
        assert!(!r.host.has_attribute(&temperature));
        assert_eq!(r.engine.polled_properties(), vec!["hum".to_string()]);
    }

    #[tokio::test]
    async fn fixed_and_computed_values_push_at_registration() {
        let device = FakeDevice::with_values(&[]);
        let r = rig(device);
        let model = attr("info", "model");
        let serial = attr("info", "serial");
        r.engine
            .configure(FeatureTable::new(vec![
                Binding::fixed(model.clone(), json!("H1")),
                Binding::computed(serial.clone(), || json!("sn-1234")),
            ]))
            .await
            .unwrap();

        assert_eq!(r.host.latest(&model), Some(json!("H1")));
        assert_eq!(r.host.latest(&serial), Some(json!("sn-1234")));
        assert_eq!(r.device.polls.load(Ordering::SeqCst), 0);
        assert!(r.engine.channels().is_empty());
    }

    #[tokio::test]
    async fn poll_is_skipped_when_nothing_is_device_backed() {
        let device = FakeDevice::with_values(&[]);
        let r = rig(device);
        r.engine
            .configure(FeatureTable::new(vec![Binding::fixed(
                attr("info", "model"),
                json!("H1"),
            )]))
            .await
            .unwrap();

        r.engine.refresh().await.unwrap();
        assert_eq!(r.device.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn humidity_reading_flows_to_host_and_history() {
        let device = FakeDevice::with_values(&[("humidity", json!(47))]);
        let r = rig(device);
        let humidity = attr("humidifier", "current-humidity");
        r.engine
            .configure(FeatureTable::new(vec![Binding::device(
                humidity.clone(),
                "humidity",
            )
            .history("climate", "humidity")]))
            .await
            .unwrap();

        r.engine.refresh().await.unwrap();

        assert_eq!(r.host.latest(&humidity), Some(json!(47)));
        assert_eq!(r.engine.read_attribute(&humidity), Some(json!(47)));
        let entry = r.history.entry("climate").unwrap();
        assert_eq!(entry.fields.get("humidity"), Some(&47));
    }
}
