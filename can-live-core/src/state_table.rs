//! Signal state table
//!
//! Latest value of every signal in the active schema. The ingest thread is
//! the only writer; it applies one decoded frame at a time and then
//! publishes a new immutable [`TableSnapshot`]. Readers load the published
//! snapshot without locking, so they never see half of a frame.
//!
//! Validity is not stored. It is derived on read from the age of the last
//! update, which keeps it deterministic for a given `now`.

use crate::message_decoder::DecodedSignal;
use crate::signals::SignalSchema;
use crate::types::{PhysicalValue, RangeWarning, SignalValue, Validity};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-signal storage, indexed by the schema's global signal index
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Slot {
    raw: i64,
    physical: f64,
    timestamp: Option<Instant>,
    sequence: u64,
    warning: Option<RangeWarning>,
    cycle_time: Option<Duration>,
    update_count: u64,
}

/// Immutable view of the whole table at one point of the ingest stream
#[derive(Debug)]
pub struct TableSnapshot {
    schema: Arc<SignalSchema>,
    slots: Vec<Slot>,
    staleness_window: Duration,
    /// Sequence number of the last frame applied
    sequence: u64,
}

impl TableSnapshot {
    /// Schema the snapshot was built against
    pub fn schema(&self) -> &Arc<SignalSchema> {
        &self.schema
    }

    /// Sequence number of the last frame applied to the table
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Number of entries (equal to the schema's signal count)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Validity of the signal at `index` as of `now`
    pub fn validity(&self, index: usize, now: Instant) -> Validity {
        match self.slots.get(index).and_then(|s| s.timestamp) {
            None => Validity::Unknown,
            Some(ts) if now.saturating_duration_since(ts) > self.staleness_window => {
                Validity::Stale
            }
            Some(_) => Validity::Fresh,
        }
    }

    /// Current value of one signal, `None` if the schema has no such name
    pub fn get(&self, name: &str, now: Instant) -> Option<SignalValue> {
        self.schema.index_of(name).and_then(|index| self.value_at(index, now))
    }

    /// Current value of the signal at a global index
    pub fn value_at(&self, index: usize, now: Instant) -> Option<SignalValue> {
        let slot = self.slots.get(index)?;
        let signal = self.schema.signal(index)?;
        let message_key = self.schema.signal_message_key(index)?;

        let value = slot.timestamp.map(|_| {
            match signal.value_table.as_ref().and_then(|t| t.get(&slot.raw)) {
                Some(label) => PhysicalValue::State {
                    raw: slot.raw,
                    label: label.clone(),
                },
                None => PhysicalValue::Numeric(slot.physical),
            }
        });

        Some(SignalValue {
            name: signal.name.clone(),
            message_key,
            raw_value: slot.timestamp.map(|_| slot.raw),
            value,
            unit: signal.unit.clone(),
            timestamp: slot.timestamp,
            sequence: slot.sequence,
            validity: self.validity(index, now),
            warning: slot.warning,
            cycle_time: slot.cycle_time,
            update_count: slot.update_count,
        })
    }

    /// Every entry, in schema index order
    pub fn values(&self, now: Instant) -> Vec<SignalValue> {
        (0..self.slots.len())
            .filter_map(|index| self.value_at(index, now))
            .collect()
    }
}

/// Writer side of the state table (owned by the ingest thread)
pub struct SignalStateTable {
    schema: Arc<SignalSchema>,
    slots: Vec<Slot>,
    staleness_window: Duration,
    sequence: u64,
    published: Arc<ArcSwap<TableSnapshot>>,
}

impl SignalStateTable {
    /// Create a table with one Unknown entry per schema signal
    pub fn new(schema: Arc<SignalSchema>, staleness_window: Duration) -> Self {
        let slots = vec![Slot::default(); schema.signal_count()];
        let published = Arc::new(ArcSwap::from_pointee(TableSnapshot {
            schema: schema.clone(),
            slots: slots.clone(),
            staleness_window,
            sequence: 0,
        }));
        Self {
            schema,
            slots,
            staleness_window,
            sequence: 0,
            published,
        }
    }

    /// Schema the table is currently bound to
    pub fn schema(&self) -> &Arc<SignalSchema> {
        &self.schema
    }

    /// Switch to a new schema
    ///
    /// Entries whose name exists in both schemas with an identical
    /// definition keep their value; everything else starts Unknown.
    /// Signals absent from the new schema disappear.
    pub fn rebind(&mut self, schema: Arc<SignalSchema>) {
        let mut slots = vec![Slot::default(); schema.signal_count()];
        let mut kept = 0usize;
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(signal) = schema.signal(index) else {
                continue;
            };
            let previous = self
                .schema
                .index_of(&signal.name)
                .filter(|&old| self.schema.signal(old) == Some(signal));
            if let Some(old) = previous {
                *slot = self.slots[old];
                kept += 1;
            }
        }
        log::info!(
            "State table rebound to {}: {} signals, {} carried over",
            schema.source(),
            schema.signal_count(),
            kept
        );
        self.schema = schema;
        self.slots = slots;
        self.publish();
    }

    /// Apply the signals of one decoded frame and publish them together
    pub fn update(&mut self, timestamp: Instant, sequence: u64, values: &[DecodedSignal]) {
        for decoded in values {
            let Some(slot) = self.slots.get_mut(decoded.index) else {
                log::debug!("Dropping value for unbound signal index {}", decoded.index);
                continue;
            };
            slot.cycle_time = slot
                .timestamp
                .map(|previous| timestamp.saturating_duration_since(previous));
            slot.raw = decoded.raw_value;
            slot.physical = decoded.physical;
            slot.timestamp = Some(timestamp);
            slot.sequence = sequence;
            slot.warning = decoded.warning;
            slot.update_count += 1;
        }
        self.sequence = sequence;
        self.publish();
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.published.load_full()
    }

    /// Current value of one signal
    pub fn get(&self, name: &str) -> Option<SignalValue> {
        self.snapshot().get(name, Instant::now())
    }

    /// Read-only handle for consumers on other threads
    pub fn reader(&self) -> TableReader {
        TableReader {
            published: self.published.clone(),
        }
    }

    fn publish(&self) {
        self.published.store(Arc::new(TableSnapshot {
            schema: self.schema.clone(),
            slots: self.slots.clone(),
            staleness_window: self.staleness_window,
            sequence: self.sequence,
        }));
    }
}

/// Read-only access to the published table
#[derive(Clone)]
pub struct TableReader {
    published: Arc<ArcSwap<TableSnapshot>>,
}

impl TableReader {
    pub fn snapshot(&self) -> Arc<TableSnapshot> {
        self.published.load_full()
    }

    pub fn get(&self, name: &str) -> Option<SignalValue> {
        self.snapshot().get(name, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::{MessageDefinition, SignalDefinition};
    use std::collections::BTreeMap;

    fn schema(speed_factor: f64) -> Arc<SignalSchema> {
        let mut gear_table = BTreeMap::new();
        gear_table.insert(3, "D".to_string());
        let messages = vec![
            MessageDefinition {
                id: 0x100,
                is_extended: false,
                name: "Vehicle".to_string(),
                size: 8,
                sender: None,
                signals: vec![
                    SignalDefinition::new("Speed", 0, 16).with_scaling(speed_factor, 0.0),
                    SignalDefinition::new("Gear", 16, 3).with_value_table(gear_table),
                ],
                is_multiplexed: false,
                multiplexer_signal: None,
            },
            MessageDefinition {
                id: 0x200,
                is_extended: false,
                name: "Battery".to_string(),
                size: 4,
                sender: None,
                signals: vec![SignalDefinition::new("PackVoltage", 0, 32)],
                is_multiplexed: false,
                multiplexer_signal: None,
            },
        ];
        Arc::new(SignalSchema::from_messages(messages, "test").unwrap())
    }

    fn decoded(index: usize, name: &str, raw: i64, physical: f64) -> DecodedSignal {
        DecodedSignal {
            index,
            name: Arc::from(name),
            raw_value: raw,
            physical,
            value: PhysicalValue::Numeric(physical),
            warning: None,
        }
    }

    #[test]
    fn test_every_signal_starts_unknown() {
        let table = SignalStateTable::new(schema(0.01), Duration::from_millis(500));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 3);
        let now = Instant::now();
        for value in snapshot.values(now) {
            assert_eq!(value.validity, Validity::Unknown);
            assert!(value.value.is_none());
        }
        assert!(snapshot.get("Missing", now).is_none());
    }

    #[test]
    fn test_staleness_transitions() {
        let mut table = SignalStateTable::new(schema(0.01), Duration::from_millis(500));
        let t0 = Instant::now();
        table.update(t0, 1, &[decoded(0, "Speed", 100, 1.0)]);

        let snapshot = table.snapshot();
        let speed = snapshot.get("Speed", t0 + Duration::from_millis(200)).unwrap();
        assert_eq!(speed.validity, Validity::Fresh);
        assert_eq!(speed.value, Some(PhysicalValue::Numeric(1.0)));
        assert_eq!(
            snapshot.get("Speed", t0 + Duration::from_millis(501)).unwrap().validity,
            Validity::Stale
        );

        let t1 = t0 + Duration::from_millis(800);
        table.update(t1, 2, &[decoded(0, "Speed", 200, 2.0)]);
        let speed = table.snapshot().get("Speed", t1).unwrap();
        assert_eq!(speed.validity, Validity::Fresh);
        assert_eq!(speed.timestamp, Some(t1));
        assert_eq!(speed.cycle_time, Some(Duration::from_millis(800)));
        assert_eq!(speed.update_count, 2);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_updates() {
        let mut table = SignalStateTable::new(schema(0.01), Duration::from_millis(500));
        let reader = table.reader();
        let t0 = Instant::now();
        table.update(t0, 1, &[decoded(0, "Speed", 100, 1.0), decoded(1, "Gear", 3, 3.0)]);
        let before = reader.snapshot();

        table.update(t0, 2, &[decoded(0, "Speed", 500, 5.0)]);
        assert_eq!(before.sequence(), 1);
        assert_eq!(before.get("Speed", t0).unwrap().value, Some(PhysicalValue::Numeric(1.0)));
        assert_eq!(reader.snapshot().sequence(), 2);
        assert_eq!(
            reader.snapshot().get("Gear", t0).unwrap().value,
            Some(PhysicalValue::State {
                raw: 3,
                label: "D".to_string()
            })
        );
    }

    #[test]
    fn test_rebind_keeps_unchanged_signals() {
        let mut table = SignalStateTable::new(schema(0.01), Duration::from_millis(500));
        let t0 = Instant::now();
        table.update(
            t0,
            1,
            &[decoded(0, "Speed", 100, 1.0), decoded(2, "PackVoltage", 400, 400.0)],
        );

        // Speed changes scaling, PackVoltage is identical
        table.rebind(schema(0.1));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.get("Speed", t0).unwrap().validity, Validity::Unknown);
        assert_eq!(
            snapshot.get("PackVoltage", t0).unwrap().value,
            Some(PhysicalValue::Numeric(400.0))
        );
    }
}
