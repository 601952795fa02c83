use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{clock::BeatClock, config::CalibrationConfig};

/// Stable identifier of a connected player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayerId(pub u32);

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

/// Smoothed timing bias of one player. Positive means the player tends to
/// hit late.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyProfile {
    pub player: PlayerId,
    pub smoothed_latency_sec: f64,
    pub samples: u32,
}

/// Next exponentially-weighted moving average of `average` given a new
/// data point.
pub fn ewma(average: f64, next: f64, alpha: f64) -> f64 {
    next * alpha + average * (1.0 - alpha)
}

/// Keeps one latency estimate per player.
#[derive(Debug, Clone)]
pub struct LatencyCalibrator {
    alpha: f64,
    enabled: bool,
    profiles: HashMap<PlayerId, LatencyProfile>,
}

impl Default for LatencyCalibrator {
    fn default() -> Self {
        Self::new(&CalibrationConfig::default())
    }
}

impl LatencyCalibrator {
    pub fn new(config: &CalibrationConfig) -> Self {
        let alpha = config.latency_smoothing_alpha;
        let alpha = if alpha > 0.0 && alpha < 1.0 {
            alpha
        } else {
            let fallback = CalibrationConfig::default().latency_smoothing_alpha;
            tracing::warn!(alpha, fallback, "smoothing alpha outside (0, 1), using fallback");
            fallback
        };

        Self {
            alpha,
            enabled: config.enabled,
            profiles: HashMap::new(),
        }
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Folds a measured latency into the player's estimate. The first sample
    /// becomes the estimate as-is.
    pub fn record_sample(&mut self, player: PlayerId, measured_latency_sec: f64) {
        if !measured_latency_sec.is_finite() {
            tracing::warn!(%player, "discarding non-finite calibration sample");
            return;
        }

        let alpha = self.alpha;
        let profile = self
            .profiles
            .entry(player)
            .and_modify(|profile| {
                profile.smoothed_latency_sec =
                    ewma(profile.smoothed_latency_sec, measured_latency_sec, alpha);
                profile.samples += 1;
            })
            .or_insert(LatencyProfile {
                player,
                smoothed_latency_sec: measured_latency_sec,
                samples: 1,
            });

        tracing::debug!(
            %player,
            sample = measured_latency_sec,
            estimate = profile.smoothed_latency_sec,
            "calibration sample recorded"
        );
    }

    /// Measures a calibration tap against the beat grid and records it.
    /// Returns the measured latency.
    pub fn record_tap(&mut self, player: PlayerId, clock: &BeatClock, timestamp: f64) -> f64 {
        let measured = clock.latency(timestamp);
        self.record_sample(player, measured);
        measured
    }

    /// Calibrated bias in seconds. Zero for anonymous or unknown players and
    /// while calibration is disabled.
    pub fn estimate(&self, player: Option<PlayerId>) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        player
            .and_then(|p| self.profiles.get(&p))
            .map(|profile| profile.smoothed_latency_sec)
            .unwrap_or(0.0)
    }

    pub fn profile(&self, player: PlayerId) -> Option<&LatencyProfile> {
        self.profiles.get(&player)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &LatencyProfile> {
        self.profiles.values()
    }

    /// Returns the player to the uncalibrated state.
    pub fn reset(&mut self, player: PlayerId) {
        if self.profiles.remove(&player).is_some() {
            tracing::info!(%player, "calibration reset");
        }
    }
}
