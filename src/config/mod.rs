use crate::processing::triggers::{Colour, TriggerType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// Persisted configuration: analysis window, trigger conditions, and display
// preferences. Missing attributes fall back to the documented defaults, so a
// truncated or hand-edited file still loads.

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PsthConfig {
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub window: WindowConfig,
    #[serde(default)]
    pub trigger_sources: Vec<TriggerSourceConfig>,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub enable_debug_logging: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WindowConfig {
    #[serde(default = "default_pre_ms")]
    pub pre_ms: u32,
    #[serde(default = "default_post_ms")]
    pub post_ms: u32,
    #[serde(default = "default_bin_size_ms")]
    pub bin_size_ms: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            pre_ms: default_pre_ms(),
            post_ms: default_post_ms(),
            bin_size_ms: default_bin_size_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TriggerSourceConfig {
    /// Empty means the registry assigns a default "Condition N" name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub line: i32,
    #[serde(default = "default_trigger_type")]
    pub trigger_type: TriggerType,
    /// Absent means the registry assigns a palette colour.
    #[serde(default)]
    pub colour: Option<Colour>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlotType {
    Histogram,
    Raster,
    HistogramRaster,
    Line,
    LineRaster,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DisplayConfig {
    #[serde(default = "default_plot_type")]
    pub plot_type: PlotType,
    #[serde(default = "default_num_columns")]
    pub num_columns: u32,
    #[serde(default = "default_row_height")]
    pub row_height: u32,
    #[serde(default)]
    pub overlay_conditions: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            plot_type: default_plot_type(),
            num_columns: default_num_columns(),
            row_height: default_row_height(),
            overlay_conditions: false,
        }
    }
}

fn default_pre_ms() -> u32 {
    500
}

fn default_post_ms() -> u32 {
    500
}

fn default_bin_size_ms() -> u32 {
    10
}

fn default_trigger_type() -> TriggerType {
    TriggerType::Ttl
}

fn default_plot_type() -> PlotType {
    PlotType::Histogram
}

fn default_num_columns() -> u32 {
    1
}

fn default_row_height() -> u32 {
    100
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<PsthConfig, String> {
    let config_str =
        fs::read_to_string(path).map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_yaml::from_str(&config_str).map_err(|e| format!("Failed to parse config file: {}", e))
}

pub fn save_config<P: AsRef<Path>>(config: &PsthConfig, path: P) -> Result<(), String> {
    let yaml =
        serde_yaml::to_string(config).map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(path, yaml).map_err(|e| format!("Failed to write config file: {}", e))
}
