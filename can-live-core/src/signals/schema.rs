//! Signal schema
//!
//! In-memory form of a loaded CAN database. A schema is validated once when
//! it is built and is immutable afterwards; reloading produces a new schema
//! that replaces the old one as a whole.

use crate::message_decoder::MessageDecoder;
use crate::types::{format_key, lookup_key, Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Highest bit position a CAN-FD payload can hold
const MAX_PAYLOAD_BITS: usize = 64 * 8;

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq)]
pub struct MessageDefinition {
    /// CAN message ID (without the extended flag)
    pub id: u32,
    /// True if the message uses a 29-bit identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Sender ECU name (optional)
    pub sender: Option<String>,
    /// All signals in this message
    pub signals: Vec<SignalDefinition>,
    /// True if this message has multiplexed signals
    pub is_multiplexed: bool,
    /// Multiplexer signal name (if multiplexed)
    pub multiplexer_signal: Option<String>,
}

impl MessageDefinition {
    /// Key of this message in the schema
    pub fn key(&self) -> u32 {
        lookup_key(self.id, self.is_extended)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDefinition {
    /// Signal name, unique within the schema
    pub name: Arc<str>,
    /// Start bit in the CAN frame (DBC numbering)
    pub start_bit: u16,
    /// Length in bits
    pub length: u16,
    /// Byte order of the bit field
    pub byte_order: ByteOrder,
    /// Value type (signed/unsigned)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value
    pub min: f64,
    /// Maximum physical value
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "°C", "V")
    pub unit: Option<Arc<str>>,
    /// Free-text comment from the database
    pub comment: Option<String>,
    /// Value table for enum-like values (raw_value -> description)
    pub value_table: Option<BTreeMap<i64, String>>,
    /// Multiplexer info (None if not multiplexed)
    pub multiplexer_info: Option<MultiplexerInfo>,
}

impl SignalDefinition {
    /// Plain unsigned little-endian signal without range or unit
    pub fn new(name: &str, start_bit: u16, length: u16) -> Self {
        Self {
            name: Arc::from(name),
            start_bit,
            length,
            byte_order: ByteOrder::LittleEndian,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            comment: None,
            value_table: None,
            multiplexer_info: None,
        }
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(Arc::from(unit));
        self
    }

    pub fn with_value_table(mut self, table: BTreeMap<i64, String>) -> Self {
        self.value_table = Some(table);
        self
    }

    /// True if the database declares a usable physical range
    pub fn has_range(&self) -> bool {
        self.min < self.max
    }

    /// Number of payload bytes needed to hold this signal
    pub fn required_bytes(&self) -> usize {
        MessageDecoder::required_bytes(
            self.start_bit as usize,
            self.length as usize,
            self.byte_order,
        )
    }

    /// True if this signal and `other` can appear in the same frame
    fn coexists_with(&self, other: &SignalDefinition) -> bool {
        match (&self.multiplexer_info, &other.multiplexer_info) {
            (Some(a), Some(b)) => a
                .multiplexer_values
                .iter()
                .any(|v| b.multiplexer_values.contains(v)),
            _ => true,
        }
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Little-endian (Intel format)
    LittleEndian,
    /// Big-endian (Motorola format)
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Signed integer
    Signed,
    /// Unsigned integer
    Unsigned,
}

/// Multiplexer information for multiplexed signals
#[derive(Debug, Clone, PartialEq)]
pub struct MultiplexerInfo {
    /// Name of the multiplexer signal that controls this signal
    pub multiplexer_signal: String,
    /// Multiplexer value(s) for which this signal is active
    pub multiplexer_values: Vec<u64>,
}

/// Validated, immutable signal schema
///
/// Signals get a dense global index. The signals of one message occupy a
/// contiguous index range, in message key order, so the decoder can address
/// the state table without name lookups.
#[derive(Debug, Default)]
pub struct SignalSchema {
    /// Message definitions by lookup key
    messages: HashMap<u32, MessageDefinition>,
    /// First global signal index of each message
    offsets: HashMap<u32, usize>,
    /// Global index -> (message key, position in the message)
    signal_index: Vec<(u32, usize)>,
    /// Signal name -> global index
    signal_lookup: HashMap<Arc<str>, usize>,
    /// Where the schema came from (file path or "<memory>")
    source: String,
}

impl SignalSchema {
    /// Create an empty schema (no messages, nothing decodes)
    pub fn empty() -> Self {
        Self {
            source: "<empty>".to_string(),
            ..Default::default()
        }
    }

    /// Validate message definitions and build a schema from them
    ///
    /// Fails when two messages share a key, a signal does not fit its
    /// message, or two signals that can be present together overlap.
    /// Signal names repeated across messages are qualified as
    /// `Message.Signal`.
    pub fn from_messages(
        messages: Vec<MessageDefinition>,
        source: impl Into<String>,
    ) -> Result<Self> {
        let mut by_key: BTreeMap<u32, MessageDefinition> = BTreeMap::new();
        for message in messages {
            validate_message(&message)?;
            let key = message.key();
            if let Some(existing) = by_key.get(&key) {
                return Err(Error::InvalidSignalDefinition(format!(
                    "messages '{}' and '{}' share ID {}",
                    existing.name,
                    message.name,
                    format_key(key)
                )));
            }
            by_key.insert(key, message);
        }

        // Names used by more than one message get qualified
        let mut name_uses: HashMap<Arc<str>, usize> = HashMap::new();
        for message in by_key.values() {
            for signal in &message.signals {
                *name_uses.entry(signal.name.clone()).or_insert(0) += 1;
            }
        }
        for message in by_key.values_mut() {
            let message_name = message.name.clone();
            let qualify = |name: &str| -> Option<String> {
                (name_uses.get(name).copied().unwrap_or(0) > 1)
                    .then(|| format!("{}.{}", message_name, name))
            };
            // Multiplexer references follow the renamed switch signal
            if let Some(qualified) = message.multiplexer_signal.as_deref().and_then(qualify) {
                message.multiplexer_signal = Some(qualified);
            }
            for signal in &mut message.signals {
                if let Some(info) = signal.multiplexer_info.as_mut() {
                    if let Some(qualified) = qualify(&info.multiplexer_signal) {
                        info.multiplexer_signal = qualified;
                    }
                }
                if let Some(qualified) = qualify(&signal.name) {
                    log::debug!("Signal '{}' renamed to '{}'", signal.name, qualified);
                    signal.name = Arc::from(qualified);
                }
            }
        }

        let mut schema = SignalSchema {
            source: source.into(),
            ..Default::default()
        };
        for (key, message) in by_key {
            schema.offsets.insert(key, schema.signal_index.len());
            for (position, signal) in message.signals.iter().enumerate() {
                let index = schema.signal_index.len();
                if schema.signal_lookup.insert(signal.name.clone(), index).is_some() {
                    return Err(Error::InvalidSignalDefinition(format!(
                        "signal name '{}' is not unique",
                        signal.name
                    )));
                }
                schema.signal_index.push((key, position));
            }
            schema.messages.insert(key, message);
        }

        log::debug!(
            "Built schema from {}: {} messages, {} signals",
            schema.source,
            schema.messages.len(),
            schema.signal_index.len()
        );
        Ok(schema)
    }

    /// Get the message definition for a lookup key
    pub fn message(&self, key: u32) -> Option<&MessageDefinition> {
        self.messages.get(&key)
    }

    /// First global signal index of a message
    pub fn signal_offset(&self, key: u32) -> Option<usize> {
        self.offsets.get(&key).copied()
    }

    /// Get a signal by global index
    pub fn signal(&self, index: usize) -> Option<&SignalDefinition> {
        let (key, position) = self.signal_index.get(index)?;
        self.messages.get(key).and_then(|m| m.signals.get(*position))
    }

    /// Key of the message owning the signal at `index`
    pub fn signal_message_key(&self, index: usize) -> Option<u32> {
        self.signal_index.get(index).map(|(key, _)| *key)
    }

    /// Global index of a signal name
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.signal_lookup.get(name).copied()
    }

    /// Find a signal by name
    pub fn signal_by_name(&self, name: &str) -> Option<&SignalDefinition> {
        self.index_of(name).and_then(|index| self.signal(index))
    }

    /// Total number of signals
    pub fn signal_count(&self) -> usize {
        self.signal_index.len()
    }

    /// All signal names in global index order
    pub fn signal_names(&self) -> impl Iterator<Item = &Arc<str>> + '_ {
        (0..self.signal_index.len()).filter_map(move |i| self.signal(i).map(|s| &s.name))
    }

    /// Get all message keys, sorted
    pub fn message_keys(&self) -> Vec<u32> {
        let mut keys: Vec<u32> = self.messages.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get schema statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.signal_index.len(),
        }
    }
}

/// Schema statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
}

fn validate_message(message: &MessageDefinition) -> Result<()> {
    let mut masks: Vec<(usize, Vec<u64>)> = Vec::with_capacity(message.signals.len());

    for (i, signal) in message.signals.iter().enumerate() {
        if signal.length == 0 || signal.length > 64 {
            return Err(Error::InvalidSignalDefinition(format!(
                "{}.{}: length {} is outside 1..=64",
                message.name, signal.name, signal.length
            )));
        }
        if !signal.factor.is_finite() || signal.factor == 0.0 || !signal.offset.is_finite() {
            return Err(Error::InvalidSignalDefinition(format!(
                "{}.{}: invalid scaling ({}, {})",
                message.name, signal.name, signal.factor, signal.offset
            )));
        }
        if signal.required_bytes() > message.size {
            return Err(Error::InvalidSignalDefinition(format!(
                "{}.{}: needs {} bytes but message is {} bytes",
                message.name,
                signal.name,
                signal.required_bytes(),
                message.size
            )));
        }
        if message.signals[..i].iter().any(|other| other.name == signal.name) {
            return Err(Error::InvalidSignalDefinition(format!(
                "{}: signal '{}' defined twice",
                message.name, signal.name
            )));
        }

        let mut mask = vec![0u64; MAX_PAYLOAD_BITS / 64];
        for bit in MessageDecoder::bit_positions(signal) {
            if bit >= MAX_PAYLOAD_BITS {
                return Err(Error::InvalidSignalDefinition(format!(
                    "{}.{}: bit {} is outside the payload",
                    message.name, signal.name, bit
                )));
            }
            mask[bit / 64] |= 1u64 << (bit % 64);
        }

        for (j, other_mask) in &masks {
            let other = &message.signals[*j];
            if !signal.coexists_with(other) {
                continue;
            }
            if mask.iter().zip(other_mask).any(|(a, b)| a & b != 0) {
                return Err(Error::InvalidSignalDefinition(format!(
                    "{}: signals '{}' and '{}' overlap",
                    message.name, other.name, signal.name
                )));
            }
        }
        masks.push((i, mask));
    }
    Ok(())
}
