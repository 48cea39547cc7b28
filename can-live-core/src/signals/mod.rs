//! Signal schema and DBC loader
//!
//! This module contains the DBC loader and the validated, immutable signal
//! schema the decoder works against.

pub mod dbc;
pub mod schema;

// Re-export key types for convenience
pub use dbc::{load_schema, schema_from_str};
pub use schema::{
    ByteOrder, DatabaseStats, MessageDefinition, MultiplexerInfo, SignalDefinition,
    SignalSchema, ValueType,
};
