//! Live view rendering
//!
//! Turns a table snapshot and the bus health into the text tables or the
//! JSON document printed on every refresh: one row per signal, and one row
//! per received message ID for the raw frame monitor.

use anyhow::Result;
use can_live_core::{format_key, BusHealth, IdStats, SignalSchema, SignalValue, TableSnapshot};
use serde::Serialize;
use std::fmt::Write;
use std::time::{Duration, Instant};

/// One line of the live table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub message_id: String,
    pub message: String,
    pub signal: String,
    pub value: Option<String>,
    pub unit: String,
    pub cycle_ms: Option<f64>,
    pub count: u64,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// One line of the raw frame monitor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRow {
    pub message_id: String,
    pub message: String,
    pub dlc: usize,
    pub data: String,
    pub cycle_ms: Option<f64>,
    pub min_cycle_ms: Option<f64>,
    pub mean_cycle_ms: Option<f64>,
    pub max_cycle_ms: Option<f64>,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSummary {
    pub link: String,
    pub bus_loss: bool,
    pub total_frames: u64,
    pub frames_per_second: f64,
    pub unknown_frames: u64,
    pub malformed_frames: u64,
    pub overruns: u64,
}

#[derive(Debug, Serialize)]
struct Document<'a> {
    health: &'a HealthSummary,
    signals: &'a [Row],
    frames: &'a [FrameRow],
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn format_ms(value: Option<f64>) -> String {
    value
        .map(|c| format!("{:.1}", c))
        .unwrap_or_else(|| "-".to_string())
}

pub fn health_summary(health: &BusHealth) -> HealthSummary {
    HealthSummary {
        link: health.link.to_string(),
        bus_loss: health.loss_flag,
        total_frames: health.total_frames,
        frames_per_second: health.frames_per_second,
        unknown_frames: health.unknown_frames,
        malformed_frames: health.malformed_frames,
        overruns: health.overruns,
    }
}

fn row(snapshot: &TableSnapshot, value: SignalValue) -> Row {
    let message = snapshot
        .schema()
        .message(value.message_key)
        .map(|m| m.name.clone())
        .unwrap_or_default();
    Row {
        message_id: format_key(value.message_key),
        message,
        signal: value.name.to_string(),
        value: value.value.as_ref().map(|v| v.to_string()),
        unit: value.unit.as_deref().unwrap_or("").to_string(),
        cycle_ms: value.cycle_time.map(millis),
        count: value.update_count,
        state: value.validity.to_string(),
        warning: value.warning.map(|w| w.to_string()),
    }
}

/// Rows for every signal, in schema order
pub fn rows(snapshot: &TableSnapshot, now: Instant) -> Vec<Row> {
    snapshot
        .values(now)
        .into_iter()
        .map(|value| row(snapshot, value))
        .collect()
}

fn frame_row(schema: &SignalSchema, key: u32, stats: &IdStats) -> FrameRow {
    FrameRow {
        message_id: format_key(key),
        message: schema
            .message(key)
            .map(|m| m.name.clone())
            .unwrap_or_default(),
        dlc: stats.dlc,
        data: stats
            .last_data
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" "),
        cycle_ms: stats.last_cycle.map(millis),
        min_cycle_ms: stats.min_cycle.map(millis),
        mean_cycle_ms: stats.mean_cycle().map(millis),
        max_cycle_ms: stats.max_cycle.map(millis),
        count: stats.count,
    }
}

/// Rows for every message key seen since the last reset, by key
pub fn frame_rows(schema: &SignalSchema, health: &BusHealth) -> Vec<FrameRow> {
    health
        .frames_per_id
        .iter()
        .map(|(&key, stats)| frame_row(schema, key, stats))
        .collect()
}

pub fn render_text(rows: &[Row], frames: &[FrameRow], health: &HealthSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Link: {} | Bus loss: {} | Frames: {} ({:.0}/s) | Unknown: {} | Malformed: {} | \
         Overruns: {}",
        health.link,
        if health.bus_loss { "YES" } else { "no" },
        health.total_frames,
        health.frames_per_second,
        health.unknown_frames,
        health.malformed_frames,
        health.overruns
    );
    let _ = writeln!(
        out,
        "{:<18} {:<20} {:<28} {:>14} {:<8} {:>10} {:>8}  {}",
        "Message ID", "Message", "Signal", "Value", "Unit", "Cycle (ms)", "Count", "State"
    );
    for row in rows {
        let cycle = format_ms(row.cycle_ms);
        let mut state = row.state.clone();
        if let Some(warning) = &row.warning {
            let _ = write!(state, " ({})", warning);
        }
        let _ = writeln!(
            out,
            "{:<18} {:<20} {:<28} {:>14} {:<8} {:>10} {:>8}  {}",
            row.message_id,
            row.message,
            row.signal,
            row.value.as_deref().unwrap_or("-"),
            row.unit,
            cycle,
            row.count,
            state
        );
    }

    let _ = writeln!(
        out,
        "\n{:<18} {:<20} {:>3}  {:<24} {:>10} {:>8} {:>8} {:>8} {:>8}",
        "Message ID", "Message", "DLC", "Data", "Cycle (ms)", "Min", "Mean", "Max", "Count"
    );
    for frame in frames {
        let _ = writeln!(
            out,
            "{:<18} {:<20} {:>3}  {:<24} {:>10} {:>8} {:>8} {:>8} {:>8}",
            frame.message_id,
            frame.message,
            frame.dlc,
            frame.data,
            format_ms(frame.cycle_ms),
            format_ms(frame.min_cycle_ms),
            format_ms(frame.mean_cycle_ms),
            format_ms(frame.max_cycle_ms),
            frame.count
        );
    }
    out
}

pub fn render_json(rows: &[Row], frames: &[FrameRow], health: &HealthSummary) -> Result<String> {
    Ok(serde_json::to_string(&Document {
        health,
        signals: rows,
        frames,
    })?)
}
