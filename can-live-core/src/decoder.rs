//! Main decoder API
//!
//! The [`Decoder`] owns the active signal schema and turns raw frames into
//! decoded signal values. The schema sits behind an atomic pointer so a
//! reload can happen while the ingest thread keeps decoding: each frame is
//! decoded against exactly one schema, either the old or the new one.

use crate::message_decoder::{DecodedSignal, MessageDecoder};
use crate::signals::{DatabaseStats, SignalSchema};
use crate::types::{Error, RawFrame, Result, EXTENDED_ID_FLAG};
use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

/// What decoding one frame produced
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    /// Every applicable signal of the message was decoded
    Decoded {
        message_key: u32,
        values: Vec<DecodedSignal>,
    },
    /// The schema has no message for this key
    Unknown(u32),
    /// The payload is shorter than some signals need; `values` holds the
    /// signals that did fit
    Malformed {
        message_key: u32,
        reason: String,
        values: Vec<DecodedSignal>,
    },
}

impl DecodeOutcome {
    /// Signals that can be applied to the state table
    pub fn values(&self) -> &[DecodedSignal] {
        match self {
            DecodeOutcome::Decoded { values, .. }
            | DecodeOutcome::Malformed { values, .. } => values,
            DecodeOutcome::Unknown(_) => &[],
        }
    }

    /// The error this outcome stands for, `None` when fully decoded
    pub fn error(&self) -> Option<Error> {
        match self {
            DecodeOutcome::Decoded { .. } => None,
            DecodeOutcome::Unknown(key) => Some(Error::UnknownMessageId(key & !EXTENDED_ID_FLAG)),
            DecodeOutcome::Malformed {
                message_key,
                reason,
                ..
            } => Some(Error::DecodeMalformed {
                can_id: message_key & !EXTENDED_ID_FLAG,
                reason: reason.clone(),
            }),
        }
    }
}

/// Decode one frame against a schema
///
/// Pure function of its inputs: the same frame and schema always give the
/// same outcome.
pub fn decode_frame(frame: &RawFrame, schema: &SignalSchema) -> DecodeOutcome {
    let key = frame.key();
    let (message, first_index) = match (schema.message(key), schema.signal_offset(key)) {
        (Some(message), Some(offset)) => (message, offset),
        _ => return DecodeOutcome::Unknown(key),
    };

    let result = MessageDecoder::decode_message(&frame.data, message, first_index);

    if result.truncated.is_empty() {
        DecodeOutcome::Decoded {
            message_key: key,
            values: result.signals,
        }
    } else {
        let names: Vec<&str> = result.truncated.iter().map(|n| n.as_ref()).collect();
        let reason = format!(
            "{} byte payload of {} too short for {}",
            frame.data.len(),
            message.name,
            names.join(", ")
        );
        DecodeOutcome::Malformed {
            message_key: key,
            reason,
            values: result.signals,
        }
    }
}

/// The main decoder struct - holds the active schema
///
/// Cloning is cheap; clones share the same schema slot, so a reload through
/// one clone is seen by all of them.
#[derive(Clone)]
pub struct Decoder {
    schema: Arc<ArcSwap<SignalSchema>>,
}

impl Decoder {
    /// Create a decoder with an empty schema
    pub fn new() -> Self {
        Self::with_schema(SignalSchema::empty())
    }

    /// Create a decoder from an already built schema
    pub fn with_schema(schema: SignalSchema) -> Self {
        Self {
            schema: Arc::new(ArcSwap::from_pointee(schema)),
        }
    }

    /// Load a DBC file and make it the active schema
    ///
    /// # Arguments
    /// * `path` - Path to the DBC file
    ///
    /// # Returns
    /// * `Result<DatabaseStats>` - message and signal counts of the new
    ///   schema. On error the previous schema stays active.
    ///
    /// # Example
    /// ```no_run
    /// use can_live_core::Decoder;
    /// use std::path::Path;
    ///
    /// let decoder = Decoder::new();
    /// let stats = decoder.load_dbc(Path::new("powertrain.dbc")).unwrap();
    /// println!("{} signals", stats.num_signals);
    /// ```
    pub fn load_dbc(&self, path: &Path) -> Result<DatabaseStats> {
        log::info!("Loading DBC file: {:?}", path);
        match crate::signals::load_schema(path) {
            Ok(schema) => {
                let stats = schema.stats();
                self.replace_schema(schema);
                log::info!("DBC file loaded successfully: {:?}", path);
                Ok(stats)
            }
            Err(e) => {
                log::warn!("Keeping previous schema: {}", e);
                Err(e)
            }
        }
    }

    /// Swap in a new schema atomically
    pub fn replace_schema(&self, schema: SignalSchema) {
        self.schema.store(Arc::new(schema));
    }

    /// The schema currently in use
    pub fn schema(&self) -> Arc<SignalSchema> {
        self.schema.load_full()
    }

    /// Decode a frame against the current schema
    pub fn decode(&self, frame: &RawFrame) -> DecodeOutcome {
        decode_frame(frame, &self.schema.load())
    }

    /// Get statistics about the loaded schema
    pub fn database_stats(&self) -> DatabaseStats {
        self.schema.load().stats()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::schema_from_str;
    use crate::types::PhysicalValue;

    const DBC: &str = r#"
VERSION ""

NS_ :

BS_:

BU_: VCU BMS

BO_ 256 VehicleSpeed: 2 VCU
 SG_ Speed : 0|16@1+ (0.01,0) [0|300] "km/h" BMS

BO_ 512 Battery: 4 BMS
 SG_ PackVoltage : 0|32@1+ (0.001,0) [0|1000] "V" VCU

BO_ 768 Gear: 1 VCU
 SG_ GearPos : 0|3@1+ (1,0) [0|5] "" BMS

BO_ 1024 Mux: 3 VCU
 SG_ Mode M : 0|8@1+ (1,0) [0|1] "" BMS
 SG_ SignalA m0 : 8|16@1+ (0.1,0) [0|1000] "" BMS
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "" BMS

VAL_ 768 GearPos 0 "P" 1 "R" 2 "N" 3 "D" ;
"#;

    fn names(outcome: &DecodeOutcome) -> Vec<&str> {
        outcome.values().iter().map(|v| v.name.as_ref()).collect()
    }

    fn decoder() -> Decoder {
        Decoder::with_schema(schema_from_str(DBC, "<test>").unwrap())
    }

    #[test]
    fn test_decode_known_frame() {
        let outcome = decoder().decode(&RawFrame::new(0x100, vec![0x64, 0x00]));
        match outcome {
            DecodeOutcome::Decoded { message_key, values } => {
                assert_eq!(message_key, 0x100);
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].name.as_ref(), "Speed");
                assert!((values[0].physical() - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_id() {
        let outcome = decoder().decode(&RawFrame::new(0x7FF, vec![0; 8]));
        assert_eq!(outcome, DecodeOutcome::Unknown(0x7FF));
        assert!(outcome.values().is_empty());
    }

    #[test]
    fn test_short_payload_is_malformed() {
        let outcome = decoder().decode(&RawFrame::new(0x200, vec![0x01, 0x02]));
        match outcome {
            DecodeOutcome::Malformed { message_key, values, reason } => {
                assert_eq!(message_key, 0x200);
                assert!(values.is_empty());
                assert!(reason.contains("PackVoltage"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_value_table_yields_state() {
        let outcome = decoder().decode(&RawFrame::new(0x300, vec![0x03]));
        assert_eq!(
            outcome.values()[0].value,
            PhysicalValue::State {
                raw: 3,
                label: "D".to_string()
            }
        );
    }

    #[test]
    fn test_replace_schema_is_seen_by_clones() {
        let decoder = Decoder::new();
        let other = decoder.clone();
        assert!(matches!(
            other.decode(&RawFrame::new(0x100, vec![0x64, 0x00])),
            DecodeOutcome::Unknown(_)
        ));

        decoder.replace_schema(schema_from_str(DBC, "<test>").unwrap());
        assert_eq!(other.database_stats().num_messages, 4);
        assert!(matches!(
            other.decode(&RawFrame::new(0x100, vec![0x64, 0x00])),
            DecodeOutcome::Decoded { .. }
        ));
    }

    #[test]
    fn test_failed_load_keeps_schema() {
        let decoder = decoder();
        let before = decoder.schema();
        assert!(decoder.load_dbc(Path::new("/nonexistent/missing.dbc")).is_err());
        assert!(Arc::ptr_eq(&before, &decoder.schema()));
    }

    #[test]
    fn test_multiplexer_selects_active_signal() {
        let decoder = decoder();

        let outcome = decoder.decode(&RawFrame::new(0x400, vec![0x00, 0x10, 0x00]));
        assert!(matches!(outcome, DecodeOutcome::Decoded { .. }));
        assert_eq!(names(&outcome), vec!["Mode", "SignalA"]);
        assert!((outcome.values()[1].physical() - 1.6).abs() < 1e-9);

        let outcome = decoder.decode(&RawFrame::new(0x400, vec![0x01, 0x20, 0x00]));
        assert!(matches!(outcome, DecodeOutcome::Decoded { .. }));
        assert_eq!(names(&outcome), vec!["Mode", "SignalB"]);
        assert!((outcome.values()[1].physical() - 3.2).abs() < 1e-9);

        // No signal is defined for this switch value
        let outcome = decoder.decode(&RawFrame::new(0x400, vec![0x02, 0x20, 0x00]));
        assert_eq!(names(&outcome), vec!["Mode"]);
    }

    #[test]
    fn test_multiplexed_short_payload() {
        let decoder = decoder();

        // Too short for the switch itself: nothing is decoded
        let outcome = decoder.decode(&RawFrame::new(0x400, vec![]));
        match &outcome {
            DecodeOutcome::Malformed { values, reason, .. } => {
                assert!(values.is_empty());
                assert!(reason.contains("Mode"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        // Switch fits, the selected signal does not
        let outcome = decoder.decode(&RawFrame::new(0x400, vec![0x00, 0x10]));
        match &outcome {
            DecodeOutcome::Malformed { values, reason, .. } => {
                assert_eq!(values.len(), 1);
                assert_eq!(values[0].name.as_ref(), "Mode");
                assert!(reason.contains("SignalA"));
                assert!(!reason.contains("SignalB"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_outcome_error() {
        let decoder = decoder();
        assert!(decoder
            .decode(&RawFrame::new(0x100, vec![0x64, 0x00]))
            .error()
            .is_none());

        let unknown = decoder.decode(&RawFrame::new(0x7FF, vec![0; 8])).error();
        assert!(matches!(unknown, Some(Error::UnknownMessageId(0x7FF))));

        let extended = RawFrame::new(0x1ABC_DEF0, vec![0; 8]).with_extended(true);
        let unknown = decoder.decode(&extended).error();
        assert!(matches!(unknown, Some(Error::UnknownMessageId(0x1ABC_DEF0))));

        match decoder.decode(&RawFrame::new(0x200, vec![0x01])).error() {
            Some(Error::DecodeMalformed { can_id, reason }) => {
                assert_eq!(can_id, 0x200);
                assert!(reason.contains("Battery"));
                assert!(reason.contains("PackVoltage"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
