//! The audio engine seam.
//!
//! [`AudioSource`] is everything the timing core needs from whatever plays
//! the music. [`SimulatedTrack`] is a deterministic implementation used by
//! the command line front end and by tests; it reports beats and markers
//! through a [`TimelinePublisher`] just like a real engine callback would.

use crate::timeline::{TimelinePublisher, FIRST_BEAT_INDEX};

/// Playback state reported by the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

/// Sample-accurate time source of the audio engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DspClock {
    pub samples: u64,
    pub sample_rate: u32,
}

impl DspClock {
    pub fn new(samples: u64, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Converts the sample count to seconds. `None` while no sample rate
    /// is known.
    pub fn seconds(&self) -> Option<f64> {
        if self.sample_rate == 0 {
            None
        } else {
            Some(self.samples as f64 / self.sample_rate as f64)
        }
    }
}

/// What the timing core consumes from the audio engine.
pub trait AudioSource {
    /// False while banks or sample data are still loading.
    fn is_ready(&self) -> bool;
    fn play_state(&self) -> PlayState;
    /// Current playback position in milliseconds.
    fn position_ms(&self) -> i32;
    /// Seeks playback to the given position.
    fn set_position_ms(&mut self, position_ms: i32);
    fn dsp_clock(&self) -> DspClock;
    fn track_length_ms(&self) -> i32;
}

/// A stretch of the track played at a constant tempo.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoSection {
    pub start_ms: i32,
    pub tempo_bpm: f32,
    pub beats_per_bar: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BeatMark {
    position_ms: f64,
    bar: i32,
    beat: i32,
    tempo_bpm: f32,
}

#[derive(Debug, Clone, PartialEq)]
struct MarkerMark {
    position_ms: i32,
    name: String,
}

/// Deterministic, software-only stand-in for a streaming audio engine.
#[derive(Debug)]
pub struct SimulatedTrack {
    publisher: TimelinePublisher,
    sample_rate: u32,
    length_ms: i32,
    sections: Vec<TempoSection>,
    markers: Vec<MarkerMark>,
    beats: Vec<BeatMark>,
    looping: bool,
    pitch: f64,
    loading_remaining_sec: f64,
    ready: bool,
    state: PlayState,
    position_ms: f64,
    dsp_samples: u64,
    dsp_remainder: f64,
    next_beat: usize,
    next_marker: usize,
}

impl SimulatedTrack {
    /// Creates a stopped, already loaded track of the given length with a
    /// single constant-tempo section.
    pub fn new(publisher: TimelinePublisher, tempo_bpm: f32, length_ms: i32) -> Self {
        let mut track = Self {
            publisher,
            sample_rate: 48_000,
            length_ms: length_ms.max(0),
            sections: vec![TempoSection {
                start_ms: 0,
                tempo_bpm,
                beats_per_bar: 4,
            }],
            markers: Vec::new(),
            beats: Vec::new(),
            looping: false,
            pitch: 1.0,
            loading_remaining_sec: 0.0,
            ready: true,
            state: PlayState::Stopped,
            position_ms: 0.0,
            dsp_samples: 0,
            dsp_remainder: 0.0,
            next_beat: 0,
            next_marker: 0,
        };
        track.rebuild_beat_grid();
        track
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_beats_per_bar(mut self, beats_per_bar: i32) -> Self {
        if let Some(first) = self.sections.first_mut() {
            first.beats_per_bar = beats_per_bar;
        }
        self.rebuild_beat_grid();
        self
    }

    /// Adds a tempo change starting at `start_ms`.
    pub fn with_section(mut self, start_ms: i32, tempo_bpm: f32, beats_per_bar: i32) -> Self {
        self.sections.retain(|s| s.start_ms != start_ms);
        self.sections.push(TempoSection {
            start_ms,
            tempo_bpm,
            beats_per_bar,
        });
        self.sections.sort_by_key(|s| s.start_ms);
        self.rebuild_beat_grid();
        self
    }

    pub fn with_marker(mut self, position_ms: i32, name: impl Into<String>) -> Self {
        self.markers.push(MarkerMark {
            position_ms,
            name: name.into(),
        });
        self.markers.sort_by_key(|m| m.position_ms);
        self
    }

    /// Keeps the track unready for the given duration of `advance` calls,
    /// as if sample data were still loading.
    pub fn with_loading_time(mut self, seconds: f64) -> Self {
        self.loading_remaining_sec = seconds.max(0.0);
        self.ready = self.loading_remaining_sec <= 0.0;
        self
    }

    pub fn with_looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Starts from the beginning when stopped, resumes when paused.
    pub fn play(&mut self) {
        if !self.ready {
            tracing::warn!("attempted to play a track that has not finished loading");
            return;
        }
        if self.state == PlayState::Stopped {
            self.seek_internal(0.0);
            self.publisher.track_length(self.length_ms);
        }
        self.state = PlayState::Playing;
    }

    pub fn pause(&mut self) {
        if self.state == PlayState::Playing {
            self.state = PlayState::Paused;
        }
    }

    pub fn stop(&mut self) {
        self.state = PlayState::Stopped;
        self.seek_internal(0.0);
    }

    /// Playback rate multiplier. Non-positive values are ignored.
    pub fn set_pitch(&mut self, pitch: f64) {
        if pitch > 0.0 && pitch.is_finite() {
            self.pitch = pitch;
        }
    }

    pub fn pitch(&self) -> f64 {
        self.pitch
    }

    pub fn sections(&self) -> &[TempoSection] {
        &self.sections
    }

    /// Advances wall time by `seconds`, moving the DSP clock and playback
    /// position and publishing every beat and marker crossed on the way.
    pub fn advance(&mut self, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }

        if !self.ready {
            self.loading_remaining_sec -= seconds;
            if self.loading_remaining_sec <= 0.0 {
                self.ready = true;
                tracing::debug!("simulated track finished loading");
            }
            return;
        }

        if self.state != PlayState::Playing {
            return;
        }

        let samples = seconds * self.sample_rate as f64 + self.dsp_remainder;
        self.dsp_samples += samples.floor() as u64;
        self.dsp_remainder = samples.fract();

        let target = self.position_ms + seconds * 1000.0 * self.pitch;
        self.play_through(target);
    }

    fn play_through(&mut self, target_ms: f64) {
        let end = self.length_ms as f64;
        if target_ms < end || self.length_ms == 0 {
            self.emit_until(target_ms);
            self.position_ms = target_ms;
            return;
        }

        self.emit_until(end);
        if self.looping && end > 0.0 {
            let wrapped = target_ms % end;
            self.seek_internal(0.0);
            self.emit_until(wrapped);
            self.position_ms = wrapped;
        } else {
            self.position_ms = end;
            self.state = PlayState::Stopped;
            tracing::debug!("simulated track reached its end");
        }
    }

    fn emit_until(&mut self, target_ms: f64) {
        while let Some(beat) = self.beats.get(self.next_beat) {
            if beat.position_ms >= target_ms {
                break;
            }
            self.publisher.beat(
                beat.bar,
                beat.beat,
                beat.position_ms.round() as i32,
                beat.tempo_bpm,
            );
            self.next_beat += 1;
        }

        while let Some(marker) = self.markers.get(self.next_marker) {
            if marker.position_ms as f64 >= target_ms {
                break;
            }
            self.publisher.marker(marker.name.clone(), marker.position_ms);
            self.next_marker += 1;
        }
    }

    fn seek_internal(&mut self, position_ms: f64) {
        self.position_ms = if self.length_ms > 0 {
            position_ms.clamp(0.0, self.length_ms as f64)
        } else {
            position_ms.max(0.0)
        };
        self.next_beat = self
            .beats
            .partition_point(|b| b.position_ms < self.position_ms);
        self.next_marker = self
            .markers
            .partition_point(|m| (m.position_ms as f64) < self.position_ms);
    }

    fn rebuild_beat_grid(&mut self) {
        self.beats.clear();
        let mut bar = 1;
        let mut beat_in_bar = FIRST_BEAT_INDEX;

        for (index, section) in self.sections.iter().enumerate() {
            let section_end = self
                .sections
                .get(index + 1)
                .map(|next| next.start_ms)
                .unwrap_or(self.length_ms) as f64;
            if section.tempo_bpm <= 0.0 || section.beats_per_bar <= 0 {
                continue;
            }

            // A new section always opens a bar.
            if beat_in_bar != FIRST_BEAT_INDEX {
                bar += 1;
                beat_in_bar = FIRST_BEAT_INDEX;
            }

            let period_ms = 60_000.0 / section.tempo_bpm as f64;
            let mut position = section.start_ms as f64;
            while position < section_end {
                self.beats.push(BeatMark {
                    position_ms: position,
                    bar,
                    beat: beat_in_bar,
                    tempo_bpm: section.tempo_bpm,
                });
                beat_in_bar += 1;
                if beat_in_bar > section.beats_per_bar {
                    beat_in_bar = FIRST_BEAT_INDEX;
                    bar += 1;
                }
                position += period_ms;
            }
        }

        let current = self.position_ms;
        self.seek_internal(current);
    }
}

impl AudioSource for SimulatedTrack {
    fn is_ready(&self) -> bool {
        self.ready
    }

    fn play_state(&self) -> PlayState {
        self.state
    }

    fn position_ms(&self) -> i32 {
        self.position_ms.round() as i32
    }

    fn set_position_ms(&mut self, position_ms: i32) {
        self.seek_internal(position_ms as f64);
    }

    fn dsp_clock(&self) -> DspClock {
        DspClock::new(self.dsp_samples, self.sample_rate)
    }

    fn track_length_ms(&self) -> i32 {
        self.length_ms
    }
}
