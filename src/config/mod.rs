// src/config/mod.rs
use crate::processing::filters::bandpass::BandPassFilterConfig;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub application: ApplicationConfig,
    pub stream: StreamConfig,
    pub conditioner: ConditionerConfig,
    pub characterization: CharacterizationConfig,
    pub recruitment: RecruitmentConfig,
    pub conditioning: ConditioningConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Session file root. Falls back to the platform user data directory.
    pub data_dir: Option<PathBuf>,
    /// File under `logs/` that operator messages are appended to.
    pub message_log: Option<String>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "PCMS".to_string(),
            data_dir: None,
            message_log: Some("session_messages.log".to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub data_endpoint: String,
    pub control_endpoint: String,
    /// Name sent with heartbeats and events.
    pub application_name: String,
    pub expected_channel_count: usize,
    /// Open Ephys prepends an envelope frame before the JSON header.
    pub envelope_frame: bool,
    pub poll_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub reconnect_timeout_ms: u64,
    pub partial_frame_timeout_ms: u64,
    pub socket_timeout_ms: u64,
    /// Conditioned frames held for the consumer before the oldest is dropped.
    pub handoff_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            data_endpoint: "tcp://127.0.0.1:5556".to_string(),
            control_endpoint: "tcp://127.0.0.1:5557".to_string(),
            application_name: "TxBDC PCMS".to_string(),
            expected_channel_count: 2,
            envelope_frame: true,
            poll_timeout_ms: 1,
            heartbeat_interval_ms: 2000,
            reconnect_timeout_ms: 10000,
            partial_frame_timeout_ms: 500,
            socket_timeout_ms: 2000,
            handoff_capacity: 64,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConditionerConfig {
    pub fs: f64,
    pub channel_a: usize,
    pub channel_b: usize,
    pub bandpass: BandPassFilterConfig,
}

impl Default for ConditionerConfig {
    fn default() -> Self {
        Self {
            fs: 5000.0,
            channel_a: 0,
            channel_b: 1,
            bandpass: BandPassFilterConfig::default(),
        }
    }
}

/// Timing shared by every trial-detecting stage.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct InitiationConfig {
    pub sample_rate: f64,
    pub bin_duration_ms: u32,
    pub phase_min_ms: u32,
    pub phase_max_ms: u32,
    pub phase_granularity_ms: u32,
}

impl Default for InitiationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 5000.0,
            bin_duration_ms: 50,
            phase_min_ms: 2200,
            phase_max_ms: 2700,
            phase_granularity_ms: 50,
        }
    }
}

impl InitiationConfig {
    pub fn samples_for_ms(&self, ms: u32) -> usize {
        (ms as f64 / 1000.0 * self.sample_rate).round() as usize
    }

    pub fn bin_sample_count(&self) -> usize {
        self.samples_for_ms(self.bin_duration_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CharacterizationConfig {
    pub stage_name: String,
    pub stage_description: String,
    pub initiation: InitiationConfig,
    pub initiation_min_uv: f64,
    pub initiation_max_uv: f64,
}

impl Default for CharacterizationConfig {
    fn default() -> Self {
        Self {
            stage_name: "S1".to_string(),
            stage_description: "EMG Characterization".to_string(),
            initiation: InitiationConfig::default(),
            initiation_min_uv: 15.0,
            initiation_max_uv: 300.0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RecruitmentConfig {
    pub stage_name: String,
    pub stage_description: String,
    pub initiation: InitiationConfig,
    pub post_trial_ms: u32,
    pub target_trials_per_hour: f64,
    pub min_intertrial_ms: u64,
    /// Multiplier applied to the one-percentile step on each adjustment.
    pub threshold_step_multiplier: f64,
    pub auto_threshold: bool,
    pub amplitude_min_ma: f64,
    pub amplitude_max_ma: f64,
    pub amplitude_step_ma: f64,
    pub stimulator_index: usize,
}

impl Default for RecruitmentConfig {
    fn default() -> Self {
        Self {
            stage_name: "S2".to_string(),
            stage_description: "Mh Recruitment Curve".to_string(),
            initiation: InitiationConfig::default(),
            post_trial_ms: 100,
            target_trials_per_hour: 150.0,
            min_intertrial_ms: 10000,
            threshold_step_multiplier: 50.0,
            auto_threshold: false,
            amplitude_min_ma: 0.0,
            amplitude_max_ma: 2.0,
            amplitude_step_ma: 0.1,
            stimulator_index: 0,
        }
    }
}

/// Timed stimulation without trial detection: every `interval_sec` the listed
/// stimulators fire in order, until `duration_min` or `max_trials` runs out.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConditioningConfig {
    pub stage_name: String,
    pub stage_description: String,
    pub interval_sec: f64,
    pub duration_min: f64,
    pub stim_indices: Vec<usize>,
    pub amplitude_ma: f64,
    /// Pause between consecutive stimulators of one pairing.
    pub pairing_gap_ms: u64,
    pub max_trials: Option<usize>,
    /// Store the chunk that arrived with each pairing.
    pub record_chunk: bool,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            stage_name: "S3".to_string(),
            stage_description: "PCMS Conditioning".to_string(),
            interval_sec: 5.0,
            duration_min: 30.0,
            stim_indices: vec![0, 1],
            amplitude_ma: 0.8,
            pairing_gap_ms: 10,
            max_trials: None,
            record_chunk: false,
        }
    }
}

impl ConditioningConfig {
    /// Repeated nerve stimulation for F-wave latency and PCT.
    pub fn f_wave_latency() -> Self {
        Self {
            stage_name: "S0a".to_string(),
            stage_description: "F-wave Latency and PCT".to_string(),
            stim_indices: vec![1],
            max_trials: Some(10),
            record_chunk: true,
            ..Self::default()
        }
    }

    /// Repeated brain stimulation for MEP latency and CCT.
    pub fn mep_latency() -> Self {
        Self {
            stage_name: "S0b".to_string(),
            stage_description: "MEP Latency and CCT".to_string(),
            stim_indices: vec![0],
            max_trials: Some(10),
            record_chunk: true,
            ..Self::default()
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, String> {
    let config_str = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;

    serde_yaml::from_str(&config_str)
        .map_err(|e| format!("Failed to parse config file: {}", e))
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<(), String> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(path, yaml)
        .map_err(|e| format!("Failed to write config file: {}", e))
}
