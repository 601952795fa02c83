use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, RhythmSyncError};

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub clock: ClockConfig,
    pub sync: SyncConfig,
    pub calibration: CalibrationConfig,
    pub scoring: ScoringConfig,
}

impl AppConfig {
    /// Parses a configuration from a JSON document. Missing fields fall back
    /// to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Checks every range constraint the components rely on.
    pub fn validate(&self) -> Result<()> {
        self.clock.validate()?;
        self.sync.validate()?;
        self.calibration.validate()?;
        self.scoring.individual.validate("scoring.individual")?;
        self.scoring.team.validate("scoring.team")?;
        Ok(())
    }
}

/// Settings for the local beat clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Where the upbeat falls within a beat, as a fraction of the period.
    pub swing_fraction: f64,
    /// Manual bias applied to the perceived beat phase.
    pub offset_ms: i32,
    /// Sample rate assumed when the audio source reports none.
    pub sample_rate: u32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            swing_fraction: 0.5,
            offset_ms: 0,
            sample_rate: 48_000,
        }
    }
}

impl ClockConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.swing_fraction) {
            return Err(RhythmSyncError::invalid(
                "clock.swing_fraction",
                format!("{} is outside [0, 1]", self.swing_fraction),
            ));
        }
        if self.sample_rate == 0 {
            return Err(RhythmSyncError::invalid(
                "clock.sample_rate",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Settings for host/client timeline agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Drift below this is left alone.
    pub drift_tolerance_ms: f64,
    /// How far ahead the host stamps its broadcast position.
    pub network_anticipation_ms: i32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drift_tolerance_ms: 30.0,
            network_anticipation_ms: 25,
        }
    }
}

impl SyncConfig {
    fn validate(&self) -> Result<()> {
        if !self.drift_tolerance_ms.is_finite() || self.drift_tolerance_ms < 0.0 {
            return Err(RhythmSyncError::invalid(
                "sync.drift_tolerance_ms",
                format!("{} must be a non-negative number", self.drift_tolerance_ms),
            ));
        }
        if self.network_anticipation_ms < 0 {
            return Err(RhythmSyncError::invalid(
                "sync.network_anticipation_ms",
                "must not be negative",
            ));
        }
        Ok(())
    }
}

/// Settings for per-player latency calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// When disabled, scoring ignores calibrated offsets entirely.
    pub enabled: bool,
    /// EWMA weight given to each new sample.
    pub latency_smoothing_alpha: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            latency_smoothing_alpha: 0.5,
        }
    }
}

impl CalibrationConfig {
    fn validate(&self) -> Result<()> {
        let alpha = self.latency_smoothing_alpha;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(RhythmSyncError::invalid(
                "calibration.latency_smoothing_alpha",
                format!("{alpha} is outside (0, 1)"),
            ));
        }
        Ok(())
    }
}

/// Accuracy thresholds for individual hits and for team synchrony.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub individual: ScoreThresholds,
    pub team: ScoreThresholds,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            individual: ScoreThresholds::new(40.0, 80.0, 130.0),
            team: ScoreThresholds::new(60.0, 120.0, 200.0),
        }
    }
}

/// Upper bounds, in milliseconds, of the Perfect, Great and OK tiers.
/// Anything beyond `ok_ms` is Bad.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub perfect_ms: f64,
    pub great_ms: f64,
    pub ok_ms: f64,
}

impl Default for ScoreThresholds {
    fn default() -> Self {
        ScoringConfig::default().individual
    }
}

impl ScoreThresholds {
    pub const fn new(perfect_ms: f64, great_ms: f64, ok_ms: f64) -> Self {
        Self {
            perfect_ms,
            great_ms,
            ok_ms,
        }
    }

    pub fn validate(&self, field: &'static str) -> Result<()> {
        let ascending = self.perfect_ms >= 0.0
            && self.perfect_ms <= self.great_ms
            && self.great_ms <= self.ok_ms;
        if !ascending {
            return Err(RhythmSyncError::invalid(
                field,
                format!(
                    "thresholds must ascend from zero (perfect {} <= great {} <= ok {})",
                    self.perfect_ms, self.great_ms, self.ok_ms
                ),
            ));
        }
        Ok(())
    }
}
