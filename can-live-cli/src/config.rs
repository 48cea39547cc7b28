//! Persisted application settings
//!
//! Stored as TOML. Read at startup, merged with command-line overrides and
//! written back on request, so the next run starts where the last one left
//! off.

use anyhow::{Context, Result};
use can_live_core::{BusParams, PipelineConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application settings (loaded from can-live.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppSettings {
    #[serde(default)]
    pub schema: SchemaSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub recording: RecordingSettings,
    #[serde(default)]
    pub view: ViewSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SchemaSettings {
    /// Last DBC file that loaded successfully
    pub last_dbc: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct BusSettings {
    #[serde(default)]
    pub backend: BackendKind,
    /// candump log for the replay backend
    pub replay_file: Option<PathBuf>,
    #[serde(default)]
    pub params: BusParams,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Dummy bus, no frames
    #[default]
    Null,
    /// Replay a candump log
    Replay,
}

/// Recording selection; the interval is `pipeline.recording_interval_ms`
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RecordingSettings {
    /// Signals to record; empty disables recording
    #[serde(default)]
    pub signals: Vec<String>,
    pub output: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ViewSettings {
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_refresh_ms() -> u64 {
    500
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh_ms(),
            format: OutputFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Load settings from a TOML file; a missing file gives the defaults
pub fn load_settings(path: &Path) -> Result<AppSettings> {
    if !path.exists() {
        log::info!("No settings at {:?}, using defaults", path);
        return Ok(AppSettings::default());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file: {:?}", path))?;

    let settings: AppSettings = toml::from_str(&content)
        .with_context(|| format!("Failed to parse settings file: {:?}", path))?;

    settings
        .pipeline
        .validate()
        .with_context(|| format!("Invalid pipeline settings in {:?}", path))?;
    Ok(settings)
}

/// Write settings to a TOML file, creating parent directories
pub fn save_settings(path: &Path, settings: &AppSettings) -> Result<()> {
    let content = toml::to_string_pretty(settings).context("Failed to serialize settings")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write settings file: {:?}", path))?;
    log::info!("Settings saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_deserialization() {
        let toml_content = r#"
            [schema]
            last_dbc = "powertrain.dbc"

            [bus]
            backend = "replay"
            replay_file = "drive.log"

            [bus.params]
            channel = "vcan0"
            bitrate = 250000

            [pipeline]
            staleness_window_ms = 300

            [recording]
            signals = ["EngineSpeed", "VehicleSpeed"]
        "#;

        let settings: AppSettings = toml::from_str(toml_content).unwrap();
        assert_eq!(settings.schema.last_dbc, Some(PathBuf::from("powertrain.dbc")));
        assert_eq!(settings.bus.backend, BackendKind::Replay);
        assert_eq!(settings.bus.params.bitrate, 250_000);
        assert!(!settings.bus.params.fd_mode);
        assert_eq!(settings.pipeline.staleness_window_ms, 300);
        assert_eq!(settings.pipeline.bus_loss_window_ms, 1000);
        assert_eq!(settings.recording.signals.len(), 2);
        assert_eq!(settings.pipeline.recording_interval_ms, 100);
        assert_eq!(settings.view.format, OutputFormat::Text);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("can-live.toml");

        let mut settings = AppSettings::default();
        settings.schema.last_dbc = Some(PathBuf::from("/data/body.dbc"));
        settings.bus.params = BusParams::new("vcan1", 500_000).with_fd(2_000_000);
        settings.pipeline.message_filter = Some(vec![0x100, 0x200]);
        settings.recording.signals = vec!["Speed".to_string()];
        settings.view.format = OutputFormat::Json;

        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn test_invalid_pipeline_settings_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[pipeline]\nstaleness_window_ms = 0\n").unwrap();
        assert!(load_settings(&path).is_err());
    }
}
