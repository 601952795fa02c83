//! Hand-off between the audio engine's callback context and the main loop.
//!
//! The audio engine calls into a [`TimelinePublisher`] from whatever thread
//! it mixes on. Every notification becomes an immutable [`TimelineEvent`]
//! pushed through a bounded channel; nothing on that side blocks or
//! allocates beyond the event itself. Once per tick the main loop calls
//! [`TimelineReceiver::poll`], which folds the pending events into the
//! [`TimelineSnapshot`] it owns. Consumers only ever see the snapshot by
//! shared reference.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Audio engines number beats within a bar from one.
pub const FIRST_BEAT_INDEX: i32 = 1;

const DEFAULT_CAPACITY: usize = 256;

/// Latest known state of the playing track, as reported by the audio engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineSnapshot {
    pub current_bar: i32,
    pub current_beat: i32,
    /// Track position of the most recently reported beat.
    pub beat_position_ms: i32,
    pub tempo_bpm: f32,
    pub previous_tempo_bpm: f32,
    /// Live playback position sampled at the last poll.
    pub track_position_ms: i32,
    pub track_length_ms: i32,
    pub last_marker_name: String,
}

/// A single notification produced in the audio callback context.
#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    Beat {
        bar: i32,
        beat: i32,
        position_ms: i32,
        tempo_bpm: f32,
    },
    Marker {
        name: String,
        position_ms: i32,
    },
    TrackLength(i32),
}

/// A marker the track passed since the previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerCrossing {
    pub name: String,
    pub position_ms: i32,
}

/// Discrete happenings gathered by one [`TimelineReceiver::poll`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelinePoll {
    /// Markers in the order the audio engine reported them.
    pub markers: Vec<MarkerCrossing>,
    /// Bars whose first beat was reported.
    pub bars_started: Vec<i32>,
    /// Number of beat notifications folded into the snapshot.
    pub beats_reported: usize,
}

/// Creates a connected publisher/receiver pair with the default capacity.
pub fn timeline_channel() -> (TimelinePublisher, TimelineReceiver) {
    timeline_channel_with_capacity(DEFAULT_CAPACITY)
}

/// Creates a connected publisher/receiver pair. Events beyond `capacity`
/// that have not been polled are dropped rather than blocking the producer.
pub fn timeline_channel_with_capacity(capacity: usize) -> (TimelinePublisher, TimelineReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        TimelinePublisher {
            tx,
            dropped: dropped.clone(),
        },
        TimelineReceiver {
            rx,
            dropped,
            snapshot: TimelineSnapshot::default(),
        },
    )
}

/// Producer side, safe to hand to an audio callback on another thread.
#[derive(Debug, Clone)]
pub struct TimelinePublisher {
    tx: Sender<TimelineEvent>,
    dropped: Arc<AtomicU64>,
}

impl TimelinePublisher {
    /// Pushes an event without blocking. Returns `false` if the event was
    /// dropped because the queue is full or the receiver is gone.
    pub fn publish(&self, event: TimelineEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn beat(&self, bar: i32, beat: i32, position_ms: i32, tempo_bpm: f32) -> bool {
        self.publish(TimelineEvent::Beat {
            bar,
            beat,
            position_ms,
            tempo_bpm,
        })
    }

    pub fn marker(&self, name: impl Into<String>, position_ms: i32) -> bool {
        self.publish(TimelineEvent::Marker {
            name: name.into(),
            position_ms,
        })
    }

    pub fn track_length(&self, length_ms: i32) -> bool {
        self.publish(TimelineEvent::TrackLength(length_ms))
    }
}

/// Consumer side, owned by the main loop.
#[derive(Debug)]
pub struct TimelineReceiver {
    rx: Receiver<TimelineEvent>,
    dropped: Arc<AtomicU64>,
    snapshot: TimelineSnapshot,
}

impl TimelineReceiver {
    /// Drains every pending event into the snapshot and records the live
    /// playback position.
    pub fn poll(&mut self, track_position_ms: i32) -> TimelinePoll {
        let mut poll = TimelinePoll::default();

        for event in self.rx.try_iter() {
            match event {
                TimelineEvent::Beat {
                    bar,
                    beat,
                    position_ms,
                    tempo_bpm,
                } => {
                    let snapshot = &mut self.snapshot;
                    snapshot.current_bar = bar;
                    snapshot.current_beat = beat;
                    snapshot.beat_position_ms = position_ms;
                    if snapshot.tempo_bpm != tempo_bpm {
                        snapshot.previous_tempo_bpm = snapshot.tempo_bpm;
                        snapshot.tempo_bpm = tempo_bpm;
                    }
                    poll.beats_reported += 1;
                    if beat == FIRST_BEAT_INDEX {
                        poll.bars_started.push(bar);
                    }
                }
                TimelineEvent::Marker { name, position_ms } => {
                    self.snapshot.last_marker_name.clone_from(&name);
                    poll.markers.push(MarkerCrossing { name, position_ms });
                }
                TimelineEvent::TrackLength(length_ms) => {
                    self.snapshot.track_length_ms = length_ms;
                }
            }
        }

        self.snapshot.track_position_ms = track_position_ms;
        poll
    }

    pub fn snapshot(&self) -> &TimelineSnapshot {
        &self.snapshot
    }

    /// Events the producer had to discard because nobody polled in time.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Forgets everything learned about the current track.
    pub fn reset(&mut self) {
        for _ in self.rx.try_iter() {}
        self.snapshot = TimelineSnapshot::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_beats_into_snapshot() {
        let (publisher, mut receiver) = timeline_channel();
        publisher.beat(1, 1, 0, 120.0);
        publisher.beat(1, 2, 500, 120.0);

        let poll = receiver.poll(510);
        let snapshot = receiver.snapshot();

        assert_eq!(poll.beats_reported, 2);
        assert_eq!(poll.bars_started, vec![1]);
        assert_eq!(snapshot.current_beat, 2);
        assert_eq!(snapshot.beat_position_ms, 500);
        assert_eq!(snapshot.track_position_ms, 510);
        assert_eq!(snapshot.tempo_bpm, 120.0);
        assert_eq!(snapshot.previous_tempo_bpm, 0.0);
    }

    #[test]
    fn remembers_previous_tempo() {
        let (publisher, mut receiver) = timeline_channel();
        publisher.beat(1, 1, 0, 120.0);
        publisher.beat(1, 2, 500, 140.0);
        receiver.poll(500);

        assert_eq!(receiver.snapshot().tempo_bpm, 140.0);
        assert_eq!(receiver.snapshot().previous_tempo_bpm, 120.0);
    }

    #[test]
    fn markers_are_reported_in_order() {
        let (publisher, mut receiver) = timeline_channel();
        publisher.marker("intro", 100);
        publisher.marker("swing=0.6", 200);

        let poll = receiver.poll(250);
        let names: Vec<_> = poll.markers.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["intro", "swing=0.6"]);
        assert_eq!(receiver.snapshot().last_marker_name, "swing=0.6");

        assert!(receiver.poll(260).markers.is_empty());
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (publisher, mut receiver) = timeline_channel_with_capacity(2);
        assert!(publisher.beat(1, 1, 0, 120.0));
        assert!(publisher.beat(1, 2, 500, 120.0));
        assert!(!publisher.beat(1, 3, 1000, 120.0));

        assert_eq!(receiver.dropped_events(), 1);
        assert_eq!(receiver.poll(1000).beats_reported, 2);
    }

    #[test]
    fn publisher_works_across_threads() {
        let (publisher, mut receiver) = timeline_channel();
        let handle = std::thread::spawn(move || {
            for beat in 1..=4 {
                publisher.beat(1, beat, (beat - 1) * 500, 120.0);
            }
        });
        handle.join().unwrap();

        assert_eq!(receiver.poll(2000).beats_reported, 4);
        assert_eq!(receiver.snapshot().current_beat, 4);
    }
}
