//! Message Decoding Engine
//!
//! Extracts signal values from raw CAN payloads based on signal definitions
//! from the signal schema. Handles bit extraction, endianness, multiplexing,
//! and physical value conversion. The encoder is the exact inverse and is
//! what test fixtures use to build frames.

use crate::signals::schema::{ByteOrder, MessageDefinition, SignalDefinition, ValueType};
use crate::types::{Error, PhysicalValue, RangeWarning, Result};
use std::sync::Arc;

/// One signal successfully extracted from a frame
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSignal {
    /// Global index of the signal in the schema it was decoded against
    pub index: usize,
    /// Signal name
    pub name: Arc<str>,
    /// Raw value after sign extension, before scaling
    pub raw_value: i64,
    /// `raw * factor + offset`
    pub physical: f64,
    /// Scaled value, or the value table entry for `raw_value`
    pub value: PhysicalValue,
    /// Set when the scaled value leaves the database range
    pub warning: Option<RangeWarning>,
}

impl DecodedSignal {
    /// Scaled numeric value, ignoring any value table
    pub fn physical(&self) -> f64 {
        self.physical
    }
}

/// Result of decoding one message payload
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageDecodeResult {
    /// Signals that fit the payload, in definition order
    pub signals: Vec<DecodedSignal>,
    /// Signals whose bit span lies beyond the payload
    pub truncated: Vec<Arc<str>>,
    /// Active multiplexer value (if message is multiplexed)
    pub multiplexer_value: Option<u64>,
}

/// Message decoder - extracts signals from CAN payloads
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode every applicable signal of a message
    ///
    /// `first_index` is the global schema index of the message's first
    /// signal. Each signal is decoded on its own, so a payload that is too
    /// short for one signal still yields the others.
    pub fn decode_message(
        data: &[u8],
        message_def: &MessageDefinition,
        first_index: usize,
    ) -> MessageDecodeResult {
        let mut result = MessageDecodeResult::default();

        // For multiplexed messages, first extract the multiplexer signal value
        if message_def.is_multiplexed {
            if let Some(ref mux_signal_name) = message_def.multiplexer_signal {
                if let Some(mux_signal) = message_def
                    .signals
                    .iter()
                    .find(|s| s.name.as_ref() == mux_signal_name)
                {
                    result.multiplexer_value =
                        Self::extract_signal_value(data, mux_signal).map(|v| v as u64);
                }
            }
        }

        for (position, signal) in message_def.signals.iter().enumerate() {
            // Check if signal should be decoded based on multiplexer
            if let Some(ref mux_info) = signal.multiplexer_info {
                match result.multiplexer_value {
                    Some(current) if mux_info.multiplexer_values.contains(&current) => {}
                    _ => continue,
                }
            }

            match Self::decode_signal(data, signal, first_index + position) {
                Some(decoded) => result.signals.push(decoded),
                None => result.truncated.push(signal.name.clone()),
            }
        }

        result
    }

    /// Decode a single signal from frame data
    pub fn decode_signal(
        data: &[u8],
        signal: &SignalDefinition,
        index: usize,
    ) -> Option<DecodedSignal> {
        let raw_value = Self::extract_signal_value(data, signal)?;
        let physical = Self::to_physical(signal, raw_value);

        let warning = if signal.has_range() && physical < signal.min {
            Some(RangeWarning::BelowMin { min: signal.min })
        } else if signal.has_range() && physical > signal.max {
            Some(RangeWarning::AboveMax { max: signal.max })
        } else {
            None
        };

        // Look up value description from value table
        let value = match signal.value_table.as_ref().and_then(|t| t.get(&raw_value)) {
            Some(label) => PhysicalValue::State {
                raw: raw_value,
                label: label.clone(),
            },
            None => PhysicalValue::Numeric(physical),
        };

        Some(DecodedSignal {
            index,
            name: signal.name.clone(),
            raw_value,
            physical,
            value,
            warning,
        })
    }

    /// Apply factor and offset
    pub fn to_physical(signal: &SignalDefinition, raw_value: i64) -> f64 {
        raw_value as f64 * signal.factor + signal.offset
    }

    /// Extract raw signal value from frame data
    ///
    /// Returns `None` when the payload is shorter than the signal's span.
    pub fn extract_signal_value(data: &[u8], signal: &SignalDefinition) -> Option<i64> {
        let start_bit = signal.start_bit as usize;
        let length = signal.length as usize;

        let required_bytes = Self::required_bytes(start_bit, length, signal.byte_order);
        if required_bytes > data.len() {
            log::trace!(
                "Signal '{}' requires {} bytes but frame only has {} bytes",
                signal.name,
                required_bytes,
                data.len()
            );
            return None;
        }

        let raw_value = match signal.byte_order {
            ByteOrder::LittleEndian => Self::extract_little_endian(data, start_bit, length),
            ByteOrder::BigEndian => Self::extract_big_endian(data, start_bit, length),
        };

        Some(match signal.value_type {
            ValueType::Unsigned => raw_value as i64,
            ValueType::Signed => Self::sign_extend(raw_value, length),
        })
    }

    /// Number of payload bytes a bit field touches
    pub fn required_bytes(start_bit: usize, length: usize, byte_order: ByteOrder) -> usize {
        if length == 0 {
            return 0;
        }
        match byte_order {
            ByteOrder::LittleEndian => (start_bit + length + 7) / 8,
            ByteOrder::BigEndian => {
                // The MSB byte holds bits start%8 down to 0, later bytes are full
                let in_first = start_bit % 8 + 1;
                let first_byte = start_bit / 8;
                if length <= in_first {
                    first_byte + 1
                } else {
                    first_byte + 1 + (length - in_first + 7) / 8
                }
            }
        }
    }

    /// Absolute bit positions (byte * 8 + bit) a signal occupies, MSB last
    /// for Intel and MSB first for Motorola
    pub fn bit_positions(signal: &SignalDefinition) -> Vec<usize> {
        let start = signal.start_bit as usize;
        let length = signal.length as usize;
        match signal.byte_order {
            ByteOrder::LittleEndian => (start..start + length).collect(),
            ByteOrder::BigEndian => {
                let mut positions = Vec::with_capacity(length);
                let mut pos = start;
                for _ in 0..length {
                    positions.push(pos);
                    pos = Self::next_motorola_bit(pos);
                }
                positions
            }
        }
    }

    /// Next less significant bit in DBC Motorola numbering
    fn next_motorola_bit(pos: usize) -> usize {
        if pos % 8 == 0 {
            pos + 15
        } else {
            pos - 1
        }
    }

    /// Extract signal with little-endian (Intel) byte order
    ///
    /// Little-endian format:
    /// - Start bit points to the LSB (least significant bit)
    /// - Bits are numbered from LSB to MSB within each byte
    /// - Byte 0 is the first byte in the CAN frame
    fn extract_little_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;

        for i in 0..length {
            let bit_pos = start_bit + i;
            let byte_idx = bit_pos / 8;
            let bit_in_byte = bit_pos % 8;

            if byte_idx < data.len() {
                let bit_value = (data[byte_idx] >> bit_in_byte) & 0x01;
                result |= (bit_value as u64) << i;
            }
        }

        result
    }

    /// Extract signal with big-endian (Motorola) byte order
    ///
    /// - Start bit is the MSB of the signal, in the same per-byte numbering
    ///   as Intel signals (bit 0 = LSB of byte 0)
    /// - Walking towards the LSB goes down within a byte, then continues at
    ///   bit 7 of the next byte
    fn extract_big_endian(data: &[u8], start_bit: usize, length: usize) -> u64 {
        let mut result: u64 = 0;
        let mut pos = start_bit;

        for _ in 0..length {
            let byte_idx = pos / 8;
            let bit_value = if byte_idx < data.len() {
                (data[byte_idx] >> (pos % 8)) & 0x01
            } else {
                0
            };
            result = (result << 1) | bit_value as u64;
            pos = Self::next_motorola_bit(pos);
        }

        result
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    fn sign_extend(value: u64, bit_length: usize) -> i64 {
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }

    /// Write a physical value into a payload
    ///
    /// The value is converted back to raw with the signal's scaling and
    /// rounded to the nearest step. Fails if the raw value does not fit the
    /// bit length or the payload is too short.
    pub fn encode_signal(data: &mut [u8], signal: &SignalDefinition, physical: f64) -> Result<()> {
        let raw = ((physical - signal.offset) / signal.factor).round();
        let length = signal.length as u32;
        let (min_raw, max_raw) = match signal.value_type {
            ValueType::Unsigned => (0.0, 2f64.powi(length as i32) - 1.0),
            ValueType::Signed => (
                -(2f64.powi(length as i32 - 1)),
                2f64.powi(length as i32 - 1) - 1.0,
            ),
        };
        if !raw.is_finite() || raw < min_raw || raw > max_raw {
            return Err(Error::InvalidData(format!(
                "value {} does not fit signal '{}'",
                physical, signal.name
            )));
        }
        Self::encode_raw(data, signal, raw as i64)
    }

    /// Write a raw value into a payload (two's complement for signed signals)
    pub fn encode_raw(data: &mut [u8], signal: &SignalDefinition, raw: i64) -> Result<()> {
        let required = signal.required_bytes();
        if required > data.len() {
            return Err(Error::InvalidData(format!(
                "signal '{}' needs {} bytes, buffer has {}",
                signal.name,
                required,
                data.len()
            )));
        }

        let length = signal.length as usize;
        let bits = if length >= 64 {
            raw as u64
        } else {
            (raw as u64) & ((1u64 << length) - 1)
        };

        for (i, pos) in Self::bit_positions(signal).into_iter().enumerate() {
            // Intel positions run LSB first, Motorola positions MSB first
            let value_bit = match signal.byte_order {
                ByteOrder::LittleEndian => i,
                ByteOrder::BigEndian => length - 1 - i,
            };
            let bit = ((bits >> value_bit) & 0x01) as u8;
            let byte = &mut data[pos / 8];
            *byte = (*byte & !(1 << (pos % 8))) | (bit << (pos % 8));
        }
        Ok(())
    }
}
