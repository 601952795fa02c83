//! Core library of the rhythm timing and synchronization engine.
//!
//! Each module owns a distinct subsystem: the audio timeline feed, the beat
//! clock derived from it, host/client timeline agreement, per-player latency
//! calibration and hit scoring. [`engine::RhythmEngine`] composes them into
//! one per-tick update.

pub mod audio;
pub mod calibration;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod scoring;
pub mod sync;
pub mod timeline;

pub use audio::{AudioSource, DspClock, PlayState, SimulatedTrack};
pub use calibration::{LatencyCalibrator, LatencyProfile, PlayerId};
pub use clock::{BeatClock, BeatEvent, BeatSubscription};
pub use config::{AppConfig, CalibrationConfig, ClockConfig, ScoreThresholds, ScoringConfig, SyncConfig};
pub use engine::{RhythmEngine, TickReport};
pub use error::{Result, RhythmSyncError};
pub use scoring::{ScoreClass, ScoreEvaluator, ScoreRecord, TeamScore};
pub use sync::{
    LocalHub, ManualNetworkClock, NetworkClock, NetworkTimelineSync, SyncPacket, SyncRole,
    SyncTransport, TimelineSyncMessage,
};
pub use timeline::{timeline_channel, TimelinePublisher, TimelineReceiver, TimelineSnapshot};
