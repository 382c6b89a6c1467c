//! In-memory provider hosting plain structure records.
//!
//! The test/demo data source: records hold a structure value behind a
//! mutex, writes are applied verbatim, process bumps nothing by default,
//! and every update fans out to the subscribed monitor sinks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pva_proto::{BitSet, PvStructure, PvValue, Status, StructDesc};

use crate::provider::{ChannelRecord, MonitorSink, Provider};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A record backed by an in-memory structure.
pub struct MemoryRecord {
    desc: Arc<StructDesc>,
    value: Mutex<PvStructure>,
    sinks: Mutex<HashMap<u64, MonitorSink>>,
}

impl MemoryRecord {
    /// A zero-initialized record of the given type.
    pub fn new(desc: Arc<StructDesc>) -> Arc<Self> {
        let value = PvStructure::new(desc.clone());
        Arc::new(Self { desc, value: Mutex::new(value), sinks: Mutex::new(HashMap::new()) })
    }

    /// Replace fields and notify monitors. The mask is in the record's
    /// offset space; an empty mask means "everything".
    pub fn post(&self, update: impl FnOnce(&mut PvStructure), changed: BitSet) {
        let snapshot = {
            let mut value = lock(&self.value);
            update(&mut value);
            value.clone()
        };
        let changed = if changed.is_empty() { BitSet::from_bits([0]) } else { changed };
        let overrun = BitSet::new();
        let sinks: Vec<MonitorSink> = lock(&self.sinks).values().cloned().collect();
        for sink in sinks {
            sink(&snapshot, &changed, &overrun);
        }
    }

    /// Set one field by path and notify monitors.
    pub fn post_field(&self, path: &str, value: PvValue) -> Status {
        let offset = match self.desc.offset_of(path) {
            Some(offset) => offset,
            None => return Status::error(format!("no field '{path}'")),
        };
        let mut failed = None;
        self.post(
            |s| {
                if let Err(e) = s.set(path, value) {
                    failed = Some(Status::error(e.to_string()));
                }
            },
            BitSet::from_bits([offset]),
        );
        failed.unwrap_or_else(Status::ok)
    }

    /// Snapshot the current value.
    pub fn snapshot(&self) -> PvStructure {
        lock(&self.value).clone()
    }
}

#[async_trait]
impl ChannelRecord for MemoryRecord {
    fn descriptor(&self) -> Arc<StructDesc> {
        self.desc.clone()
    }

    fn read(&self) -> (PvStructure, BitSet) {
        let value = lock(&self.value).clone();
        let mask = BitSet::all(self.desc.slot_count());
        (value, mask)
    }

    fn write(&self, value: &PvStructure, changed: &BitSet) -> Status {
        {
            let mut current = lock(&self.value);
            for offset in changed.iter() {
                if offset == 0 {
                    *current = value.clone();
                    break;
                }
                if let (Some(src), Some(dst)) =
                    (value.value_at_offset(offset), current.value_at_offset_mut(offset))
                {
                    *dst = src.clone();
                }
            }
        }
        // a write is an update like any other
        let snapshot = lock(&self.value).clone();
        let sinks: Vec<MonitorSink> = lock(&self.sinks).values().cloned().collect();
        let overrun = BitSet::new();
        for sink in sinks {
            sink(&snapshot, changed, &overrun);
        }
        Status::ok()
    }

    async fn process(&self) -> Status {
        // nothing to compute for a plain memory record
        Status::ok()
    }

    fn subscribe(&self, id: u64, sink: MonitorSink) {
        lock(&self.sinks).insert(id, sink);
    }

    fn unsubscribe(&self, id: u64) {
        lock(&self.sinks).remove(&id);
    }
}

/// A provider over a fixed map of in-memory records.
pub struct MemoryProvider {
    name: String,
    records: Mutex<HashMap<String, Arc<MemoryRecord>>>,
}

impl MemoryProvider {
    /// An empty provider.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), records: Mutex::new(HashMap::new()) })
    }

    /// Host a record under a channel name, replacing any previous one.
    pub fn insert(&self, channel: impl Into<String>, record: Arc<MemoryRecord>) {
        lock(&self.records).insert(channel.into(), record);
    }

    /// The record behind a channel name.
    pub fn record(&self, channel: &str) -> Option<Arc<MemoryRecord>> {
        lock(&self.records).get(channel).cloned()
    }

    /// Hosted channel names.
    pub fn channel_names(&self) -> Vec<String> {
        lock(&self.records).keys().cloned().collect()
    }
}

impl Provider for MemoryProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, channel: &str) -> Option<Arc<dyn ChannelRecord>> {
        lock(&self.records).get(channel).cloned().map(|r| r as Arc<dyn ChannelRecord>)
    }
}

#[cfg(test)]
mod tests {
    use pva_proto::{FieldDesc, ScalarKind};

    use super::*;

    fn int_record() -> Arc<MemoryRecord> {
        MemoryRecord::new(
            StructDesc::builder("counter_t")
                .field("value", FieldDesc::scalar(ScalarKind::I32))
                .build(),
        )
    }

    #[test]
    fn write_applies_masked_fields() {
        let record = int_record();
        let mut update = PvStructure::new(record.descriptor());
        update.set("value", 5i32.into()).unwrap();

        let status = record.write(&update, &BitSet::from_bits([1]));
        assert!(status.is_success());
        assert_eq!(record.snapshot().get("value").and_then(PvValue::as_i32), Some(5));
    }

    #[test]
    fn post_notifies_subscribers() {
        let record = int_record();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        record.subscribe(
            1,
            Arc::new(move |value, changed, _overrun| {
                let v = value.get("value").and_then(PvValue::as_i32);
                lock(&seen2).push((v, changed.clone()));
            }),
        );

        let status = record.post_field("value", 7i32.into());
        assert!(status.is_success());
        assert_eq!(lock(&seen).as_slice(), &[(Some(7), BitSet::from_bits([1]))]);

        record.unsubscribe(1);
        record.post_field("value", 8i32.into());
        assert_eq!(lock(&seen).len(), 1);
    }

    #[test]
    fn provider_lookup() {
        let provider = MemoryProvider::new("memory");
        provider.insert("int1", int_record());
        assert!(provider.lookup("int1").is_some());
        assert!(provider.lookup("other").is_none());
    }

    #[test]
    fn post_field_rejects_unknown_paths() {
        let record = int_record();
        assert!(!record.post_field("bogus", 1i32.into()).is_success());
    }
}
