//! Grading of hits against the beat, and team synchrony across players.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    calibration::{LatencyCalibrator, PlayerId},
    clock::BeatClock,
    config::{ScoreThresholds, ScoringConfig},
};

/// Accuracy tier, ordered from worst to best.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScoreClass {
    Bad,
    Ok,
    Great,
    Perfect,
}

impl ScoreClass {
    /// Classifies the magnitude of `error_sec`; its sign is ignored.
    pub fn classify(error_sec: f64, thresholds: &ScoreThresholds) -> Self {
        let error_ms = error_sec.abs() * 1000.0;
        if error_ms <= thresholds.perfect_ms {
            Self::Perfect
        } else if error_ms <= thresholds.great_ms {
            Self::Great
        } else if error_ms <= thresholds.ok_ms {
            Self::Ok
        } else {
            Self::Bad
        }
    }
}

impl fmt::Display for ScoreClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Bad => "Bad",
            Self::Ok => "OK",
            Self::Great => "Great",
            Self::Perfect => "Perfect",
        };
        f.write_str(label)
    }
}

/// Which side of the beat a hit landed on, for accuracy displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HitTiming {
    Early,
    OnBeat,
    Late,
}

/// Result of grading one hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Raw DSP-time timestamp of the input.
    pub timestamp: f64,
    pub beat_index: i64,
    /// Signed error after calibration; negative is early.
    pub latency_sec: f64,
    pub class: ScoreClass,
    pub player: Option<PlayerId>,
}

impl ScoreRecord {
    pub fn timing(&self) -> HitTiming {
        if self.latency_sec < 0.0 {
            HitTiming::Early
        } else if self.latency_sec > 0.0 {
            HitTiming::Late
        } else {
            HitTiming::OnBeat
        }
    }
}

impl fmt::Display for ScoreRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let who = self
            .player
            .map(|p| p.to_string())
            .unwrap_or_else(|| "anonymous".to_string());
        write!(
            f,
            "{who} hit beat {}: {:+.0}ms {}",
            self.beat_index,
            self.latency_sec * 1000.0,
            self.class
        )
    }
}

/// Emitted when every active player hit nearest the same beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamScore {
    /// Mean of the contributing timestamps.
    pub timestamp: f64,
    pub beat_index: i64,
    /// Population standard deviation of the contributing timestamps.
    pub spread_sec: f64,
    pub class: ScoreClass,
    pub players: Vec<PlayerId>,
}

/// Everything one hit produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    pub record: ScoreRecord,
    pub team: Option<TeamScore>,
}

/// Grades hits and watches for team-wide synchronized hits.
#[derive(Debug, Clone)]
pub struct ScoreEvaluator {
    individual: ScoreThresholds,
    team: ScoreThresholds,
    active_players: BTreeSet<PlayerId>,
    window: BTreeMap<PlayerId, f64>,
    /// Beat the open window collects hits for.
    window_beat: Option<i64>,
}

impl ScoreEvaluator {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            individual: config.individual,
            team: config.team,
            active_players: BTreeSet::new(),
            window: BTreeMap::new(),
            window_beat: None,
        }
    }

    pub fn add_player(&mut self, player: PlayerId) {
        self.active_players.insert(player);
    }

    pub fn remove_player(&mut self, player: PlayerId) {
        self.active_players.remove(&player);
        self.window.remove(&player);
    }

    pub fn active_players(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.active_players.iter().copied()
    }

    /// Players who already hit in the current window.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Grades a hit. The player's calibrated bias is removed before
    /// measuring against the beat, so habitual lateness is not punished.
    /// Team synchrony uses the raw timestamp.
    pub fn score(
        &mut self,
        clock: &BeatClock,
        calibrator: &LatencyCalibrator,
        timestamp: f64,
        player: Option<PlayerId>,
    ) -> ScoreOutcome {
        let adjusted = timestamp - calibrator.estimate(player);
        let latency_sec = clock.latency(adjusted);
        let record = ScoreRecord {
            timestamp,
            beat_index: clock.beat_index_at(adjusted),
            latency_sec,
            class: ScoreClass::classify(latency_sec, &self.individual),
            player,
        };
        tracing::debug!(%record, "hit scored");

        let team = player.and_then(|p| self.record_team_hit(clock, p, timestamp));
        ScoreOutcome { record, team }
    }

    /// Beat index the current window belongs to, if any hit opened one.
    pub fn window_beat(&self) -> Option<i64> {
        self.window_beat
    }

    /// Hits are grouped by their nearest beat, so early and late hits on
    /// the same beat share a window. A hit nearest another beat discards
    /// the open window.
    fn record_team_hit(
        &mut self,
        clock: &BeatClock,
        player: PlayerId,
        timestamp: f64,
    ) -> Option<TeamScore> {
        if !self.active_players.contains(&player) {
            return None;
        }

        let beat_index = clock.beat_index_at(timestamp);
        if self.window_beat != Some(beat_index) {
            if !self.window.is_empty() {
                tracing::debug!(
                    stale = self.window.len(),
                    beat_index,
                    "team window moved to a new beat"
                );
            }
            self.window.clear();
            self.window_beat = Some(beat_index);
        }
        self.window.entry(player).or_insert(timestamp);

        if self.active_players.len() < 2 || self.window.len() < self.active_players.len() {
            return None;
        }

        let timestamps: Vec<f64> = self.window.values().copied().collect();
        let (mean, spread_sec) = mean_and_std_dev(&timestamps);
        let score = TeamScore {
            timestamp: mean,
            beat_index: clock.beat_index_at(mean),
            spread_sec,
            class: ScoreClass::classify(spread_sec, &self.team),
            players: self.window.keys().copied().collect(),
        };
        self.window.clear();

        tracing::info!(
            players = score.players.len(),
            spread_ms = spread_sec * 1000.0,
            class = %score.class,
            "team hit"
        );
        Some(score)
    }
}

fn mean_and_std_dev(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}
