//! DBC file loader
//!
//! Parses Vector DBC files with the `can-dbc` crate and converts them into a
//! validated [`SignalSchema`]. Every failure is reported as a single
//! `SchemaLoadFailed` error; the grammar itself is the crate's business.

use crate::signals::schema::{
    ByteOrder, MessageDefinition, MultiplexerInfo, SignalDefinition, SignalSchema, ValueType,
};
use crate::types::{Error, Result, EXTENDED_ID_FLAG};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Parse a DBC file and build a signal schema from it
pub fn load_schema(path: &Path) -> Result<SignalSchema> {
    log::info!("Parsing DBC file: {:?}", path);
    let load_failed = |reason: String| Error::SchemaLoadFailed {
        path: path.display().to_string(),
        reason,
    };

    // Read the DBC file as bytes first (handle non-UTF8 encodings)
    let bytes =
        std::fs::read(path).map_err(|e| load_failed(format!("failed to read file: {}", e)))?;
    let dbc_content = decode_text(bytes);

    let schema = schema_from_str(&dbc_content, &path.display().to_string())?;

    let stats = schema.stats();
    log::info!(
        "Parsed {} messages / {} signals from {:?}",
        stats.num_messages,
        stats.num_signals,
        path
    );
    Ok(schema)
}

/// Build a signal schema from DBC text already in memory
pub fn schema_from_str(content: &str, source: &str) -> Result<SignalSchema> {
    let load_failed = |reason: String| Error::SchemaLoadFailed {
        path: source.to_string(),
        reason,
    };
    let messages = parse_dbc_str(content).map_err(load_failed)?;
    SignalSchema::from_messages(messages, source).map_err(|e| load_failed(e.to_string()))
}

/// Try UTF-8 first, then fall back to Latin-1/Windows-1252
fn decode_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("DBC file is not UTF-8, trying Latin-1 encoding");
            e.into_bytes().iter().map(|&b| b as char).collect()
        }
    }
}

/// Parse DBC text into message definitions
fn parse_dbc_str(content: &str) -> std::result::Result<Vec<MessageDefinition>, String> {
    let dbc = can_dbc::DBC::from_slice(content.as_bytes())
        .map_err(|e| format!("failed to parse DBC: {:?}", e))?;

    dbc.messages()
        .iter()
        .map(|dbc_msg| convert_message(&dbc, dbc_msg))
        .collect()
}

/// Convert a can-dbc message to our MessageDefinition
fn convert_message(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
) -> std::result::Result<MessageDefinition, String> {
    let mut is_multiplexed = false;
    let mut multiplexer_signal_name: Option<String> = None;

    // First pass: identify multiplexer signal
    for dbc_sig in dbc_msg.signals() {
        match dbc_sig.multiplexer_indicator() {
            can_dbc::MultiplexIndicator::Multiplexor => {
                is_multiplexed = true;
                multiplexer_signal_name = Some(dbc_sig.name().to_string());
            }
            can_dbc::MultiplexIndicator::MultiplexedSignal(_) => is_multiplexed = true,
            _ => {}
        }
    }

    // Second pass: convert all signals
    let signals = dbc_msg
        .signals()
        .iter()
        .map(|dbc_sig| convert_signal(dbc, dbc_msg, dbc_sig, multiplexer_signal_name.as_deref()))
        .collect::<std::result::Result<Vec<_>, String>>()?;

    let raw_id = dbc_msg.message_id().0;
    Ok(MessageDefinition {
        id: raw_id & !EXTENDED_ID_FLAG,
        is_extended: raw_id & EXTENDED_ID_FLAG != 0,
        name: dbc_msg.message_name().to_string(),
        size: *dbc_msg.message_size() as usize,
        sender: match dbc_msg.transmitter() {
            can_dbc::Transmitter::NodeName(name) => Some(name.to_string()),
            _ => None,
        },
        signals,
        is_multiplexed,
        multiplexer_signal: multiplexer_signal_name,
    })
}

/// Convert a can-dbc signal to our SignalDefinition
fn convert_signal(
    dbc: &can_dbc::DBC,
    dbc_msg: &can_dbc::Message,
    dbc_sig: &can_dbc::Signal,
    multiplexer_signal_name: Option<&str>,
) -> std::result::Result<SignalDefinition, String> {
    let byte_order = match *dbc_sig.byte_order() {
        can_dbc::ByteOrder::LittleEndian => ByteOrder::LittleEndian,
        can_dbc::ByteOrder::BigEndian => ByteOrder::BigEndian,
    };

    let value_type = match *dbc_sig.value_type() {
        can_dbc::ValueType::Signed => ValueType::Signed,
        can_dbc::ValueType::Unsigned => ValueType::Unsigned,
    };

    let value_table = dbc
        .value_descriptions_for_signal(dbc_msg.message_id().clone(), dbc_sig.name())
        .filter(|descriptions| !descriptions.is_empty())
        .map(|descriptions| {
            descriptions
                .iter()
                .map(|d| (*d.a() as i64, d.b().to_string()))
                .collect::<BTreeMap<i64, String>>()
        });

    let multiplexer_info = match *dbc_sig.multiplexer_indicator() {
        can_dbc::MultiplexIndicator::MultiplexedSignal(switch_value) => Some(MultiplexerInfo {
            multiplexer_signal: multiplexer_signal_name
                .ok_or_else(|| {
                    format!(
                        "multiplexed signal '{}' but no multiplexer found",
                        dbc_sig.name()
                    )
                })?
                .to_string(),
            multiplexer_values: vec![switch_value as u64],
        }),
        _ => None,
    };

    Ok(SignalDefinition {
        name: Arc::from(dbc_sig.name().as_str()),
        start_bit: *dbc_sig.start_bit() as u16,
        length: *dbc_sig.signal_size() as u16,
        byte_order,
        value_type,
        factor: *dbc_sig.factor(),
        offset: *dbc_sig.offset(),
        min: *dbc_sig.min(),
        max: *dbc_sig.max(),
        unit: if dbc_sig.unit().is_empty() {
            None
        } else {
            Some(Arc::from(dbc_sig.unit().as_str()))
        },
        comment: dbc
            .signal_comment(dbc_msg.message_id().clone(), dbc_sig.name())
            .map(|c| c.to_string()),
        value_table,
        multiplexer_info,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const DBC_HEADER: &str = r#"
VERSION ""

NS_ :
    NS_DESC_
    CM_
    BA_DEF_
    BA_
    VAL_

BS_:

BU_: ECU1 ECU2
"#;

    fn write_dbc(body: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(DBC_HEADER.as_bytes()).unwrap();
        temp_file.write_all(body.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_parse_simple_dbc() {
        let file = write_dbc(
            r#"
BO_ 291 EngineData: 8 ECU1
 SG_ EngineSpeed : 0|16@1+ (1,0) [0|8000] "rpm" ECU2
 SG_ EngineTemp : 16|8@1+ (1,-40) [-40|215] "C" ECU2

BO_ 512 BatteryStatus: 8 ECU1
 SG_ BatteryVoltage : 0|16@1+ (0.01,0) [0|16] "V" ECU2
"#,
        );

        let schema = load_schema(file.path()).unwrap();
        let stats = schema.stats();
        assert_eq!(stats.num_messages, 2);
        assert_eq!(stats.num_signals, 3);

        let msg = schema.message(291).unwrap();
        assert_eq!(msg.name, "EngineData");
        assert_eq!(msg.size, 8);
        assert_eq!(msg.sender, Some("ECU1".to_string()));

        let sig = schema.signal_by_name("EngineSpeed").unwrap();
        assert_eq!(sig.start_bit, 0);
        assert_eq!(sig.length, 16);
        assert_eq!(sig.byte_order, ByteOrder::LittleEndian);
        assert_eq!(sig.unit.as_deref(), Some("rpm"));

        let temp = schema.signal_by_name("EngineTemp").unwrap();
        assert_eq!(temp.offset, -40.0);
        assert_eq!(temp.min, -40.0);
    }

    #[test]
    fn test_parse_multiplexed_signals() {
        let file = write_dbc(
            r#"
BO_ 512 MultiplexedMsg: 8 ECU1
 SG_ Mode M : 0|8@1+ (1,0) [0|3] "" ECU1
 SG_ SignalA m0 : 8|16@1+ (1,0) [0|100] "%" ECU1
 SG_ SignalB m1 : 8|16@1+ (0.1,0) [0|1000] "mV" ECU1
"#,
        );

        let schema = load_schema(file.path()).unwrap();
        let msg = schema.message(512).unwrap();
        assert!(msg.is_multiplexed);
        assert_eq!(msg.multiplexer_signal, Some("Mode".to_string()));

        let sig_a = schema.signal_by_name("SignalA").unwrap();
        let mux = sig_a.multiplexer_info.as_ref().unwrap();
        assert_eq!(mux.multiplexer_signal, "Mode");
        assert_eq!(mux.multiplexer_values, vec![0]);
    }

    #[test]
    fn test_value_table_and_extended_id() {
        let file = write_dbc(
            r#"
BO_ 2566844672 BmsStatus: 8 ECU1
 SG_ ChgStatus : 0|2@1+ (1,0) [0|3] "" ECU2

VAL_ 2566844672 ChgStatus 0 "Idle" 1 "Charging" 2 "Fault" ;
"#,
        );

        let schema = load_schema(file.path()).unwrap();
        let msg = schema.message(2566844672).unwrap();
        assert!(msg.is_extended);
        assert_eq!(msg.id, 0x18FEF100);

        let sig = schema.signal_by_name("ChgStatus").unwrap();
        let table = sig.value_table.as_ref().unwrap();
        assert_eq!(table.get(&1).map(String::as_str), Some("Charging"));
    }

    #[test]
    fn test_missing_file_is_schema_load_failure() {
        let result = load_schema(Path::new("/nonexistent/powertrain.dbc"));
        assert!(matches!(result, Err(Error::SchemaLoadFailed { .. })));
    }

    #[test]
    fn test_overlapping_definitions_fail_to_load() {
        let file = write_dbc(
            r#"
BO_ 256 Broken: 8 ECU1
 SG_ A : 0|16@1+ (1,0) [0|0] "" ECU2
 SG_ B : 8|16@1+ (1,0) [0|0] "" ECU2
"#,
        );
        let result = load_schema(file.path());
        assert!(matches!(result, Err(Error::SchemaLoadFailed { .. })));
    }
}
