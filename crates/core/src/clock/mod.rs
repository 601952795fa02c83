//! The local beat timeline.
//!
//! [`BeatClock`] turns the audio engine's DSP clock into a steady beat grid.
//! Beat boundaries are detected against DSP time rather than against the
//! engine's own (coarser, callback-delivered) beat reports, and the grid is
//! re-anchored whenever the tempo changes, a marker is crossed or the track
//! is seeked, so the phase heard by players never jumps.

mod marker;

pub use marker::MarkerCommand;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::{
    audio::{AudioSource, DspClock, PlayState},
    config::ClockConfig,
    timeline::{TimelinePoll, TimelineSnapshot},
};

/// Notifications produced by the clock for gameplay and audio consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum BeatEvent {
    /// A downbeat was crossed. Bar and beat are the latest indices the
    /// audio engine reported.
    Beat { bar: i32, beat: i32 },
    Upbeat,
    /// The audio engine reported the first beat of a new bar.
    BarStarted { bar: i32 },
    TempoChanged { beat_period_sec: f64 },
    MarkerPassed { name: String },
    TrackStarted,
}

/// Everything the clock needs to place the beat grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatClockState {
    pub elapsed_dsp_time_sec: f64,
    /// DSP time at which track-relative time is zero.
    pub track_start_time_sec: f64,
    /// Zero while no valid tempo is known, which freezes beat detection.
    pub beat_period_sec: f64,
    pub swing_fraction: f64,
    /// Manual bias, already wrapped into one beat period.
    pub offset_sec: f64,
    /// Track-relative time of the last downbeat.
    pub last_beat_time_sec: f64,
    pub last_upbeat_time_sec: f64,
    /// DSP time of the last downbeat.
    pub last_beat_dsp_time_sec: f64,
    pub dsp_delta_sec: f64,
}

impl BeatClockState {
    fn new(swing_fraction: f64) -> Self {
        Self {
            elapsed_dsp_time_sec: 0.0,
            track_start_time_sec: 0.0,
            beat_period_sec: 0.0,
            swing_fraction,
            offset_sec: 0.0,
            last_beat_time_sec: 0.0,
            last_upbeat_time_sec: 0.0,
            last_beat_dsp_time_sec: 0.0,
            dsp_delta_sec: 0.0,
        }
    }
}

/// Events a subscriber may leave undrained before newer ones are dropped.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Identifies a subscription so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Receiving end of a [`BeatClock::subscribe`] call.
#[derive(Debug)]
pub struct BeatSubscription {
    id: SubscriberId,
    rx: Receiver<BeatEvent>,
}

impl BeatSubscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Takes every event delivered since the last call.
    pub fn drain(&self) -> Vec<BeatEvent> {
        self.rx.try_iter().collect()
    }
}

#[derive(Debug)]
struct Subscriber {
    id: SubscriberId,
    tx: Sender<BeatEvent>,
    dropped: u64,
}

impl Subscriber {
    /// Returns `false` once the subscription has been dropped.
    fn deliver(&mut self, event: &BeatEvent) -> bool {
        match self.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if self.dropped == 0 {
                    tracing::warn!(id = ?self.id, "subscriber is not draining, dropping beat events");
                }
                self.dropped += 1;
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

/// Authoritative local notion of where we are in the music.
#[derive(Debug)]
pub struct BeatClock {
    state: BeatClockState,
    offset_ms: i32,
    fallback_sample_rate: u32,
    observed_tempo_bpm: f32,
    last_play_state: PlayState,
    track_position_ms: i32,
    track_length_ms: i32,
    current_bar: i32,
    current_beat: i32,
    beats_elapsed: u64,
    invalid_tempo_logged: bool,
    outbox: Vec<BeatEvent>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

impl BeatClock {
    pub fn new(config: &ClockConfig) -> Self {
        let mut clock = Self {
            state: BeatClockState::new(config.swing_fraction.clamp(0.0, 1.0)),
            offset_ms: 0,
            fallback_sample_rate: config.sample_rate,
            observed_tempo_bpm: 0.0,
            last_play_state: PlayState::Stopped,
            track_position_ms: 0,
            track_length_ms: 0,
            current_bar: 0,
            current_beat: 0,
            beats_elapsed: 0,
            invalid_tempo_logged: false,
            outbox: Vec::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
        };
        clock.set_offset(config.offset_ms);
        clock
    }

    /// Runs one main-loop tick against the audio engine and the freshly
    /// polled timeline. Returns the events emitted this tick, which have
    /// also been delivered to every subscriber.
    pub fn update(
        &mut self,
        audio: &dyn AudioSource,
        snapshot: &TimelineSnapshot,
        poll: &TimelinePoll,
    ) -> Vec<BeatEvent> {
        if !audio.is_ready() {
            return Vec::new();
        }

        let play_state = audio.play_state();
        let started = play_state == PlayState::Playing && self.last_play_state != PlayState::Playing;
        self.last_play_state = play_state;
        if play_state != PlayState::Playing {
            return Vec::new();
        }

        self.advance_from_snapshot(snapshot, audio.dsp_clock());
        if started {
            self.on_track_started();
        }

        if snapshot.tempo_bpm != self.observed_tempo_bpm {
            self.on_tempo_changed(snapshot.tempo_bpm, snapshot.beat_position_ms);
        }

        for marker in &poll.markers {
            self.on_marker_crossed(&marker.name, marker.position_ms);
        }

        for &bar in &poll.bars_started {
            self.outbox.push(BeatEvent::BarStarted { bar });
        }

        self.check_for_next_beat();
        self.check_for_next_upbeat();

        self.drain_events()
    }

    /// Recomputes elapsed DSP time from an absolute sample count, so feeding
    /// the same clock reading twice leaves elapsed time unchanged.
    pub fn advance_from_snapshot(&mut self, snapshot: &TimelineSnapshot, dsp: DspClock) {
        let sample_rate = if dsp.sample_rate == 0 {
            self.fallback_sample_rate
        } else {
            dsp.sample_rate
        };
        let Some(now) = DspClock::new(dsp.samples, sample_rate).seconds() else {
            return;
        };

        self.state.dsp_delta_sec = now - self.state.elapsed_dsp_time_sec;
        self.state.elapsed_dsp_time_sec = now;
        self.track_position_ms = snapshot.track_position_ms;
        self.track_length_ms = snapshot.track_length_ms;
        self.current_bar = snapshot.current_bar;
        self.current_beat = snapshot.current_beat;
    }

    /// Anchors beat phase zero to the current DSP time.
    pub fn on_track_started(&mut self) {
        let now = self.state.elapsed_dsp_time_sec;
        self.state.track_start_time_sec = now;
        self.state.last_beat_time_sec = 0.0;
        self.state.last_upbeat_time_sec = 0.0;
        self.state.last_beat_dsp_time_sec = now;
        self.state.dsp_delta_sec = 0.0;
        self.beats_elapsed = 0;
        tracing::info!(dsp_time = now, "track started");
        self.outbox.push(BeatEvent::TrackStarted);
    }

    /// Switches to a new tempo while keeping the phase at the moment of the
    /// change. `beat_position_ms` is the track position of the most recent
    /// beat under the new tempo.
    pub fn on_tempo_changed(&mut self, new_tempo_bpm: f32, beat_position_ms: i32) {
        self.observed_tempo_bpm = new_tempo_bpm;

        if !(new_tempo_bpm.is_finite() && new_tempo_bpm > 0.0) {
            if !self.invalid_tempo_logged {
                tracing::warn!(tempo = new_tempo_bpm, "invalid tempo, pausing beat clock");
                self.invalid_tempo_logged = true;
            }
            self.state.beat_period_sec = 0.0;
            return;
        }
        self.invalid_tempo_logged = false;

        let phase = (self.track_position_ms - beat_position_ms) as f64 / 1000.0;
        self.realign(phase);
        self.state.beat_period_sec = 60.0 / new_tempo_bpm as f64;
        self.rewrap_offset();

        tracing::debug!(
            tempo = new_tempo_bpm,
            beat_period = self.state.beat_period_sec,
            "tempo changed"
        );
        self.outbox.push(BeatEvent::TempoChanged {
            beat_period_sec: self.state.beat_period_sec,
        });
    }

    /// Handles a marker reported by the audio engine: catches up a beat the
    /// poll may have missed, applies `key=value` parameter markers and
    /// re-anchors the grid on the marker position.
    pub fn on_marker_crossed(&mut self, name: &str, marker_position_ms: i32) {
        let period = self.state.beat_period_sec;
        if period > 0.0
            && self.state.last_beat_dsp_time_sec < self.state.elapsed_dsp_time_sec - period / 2.0
        {
            self.emit_beat();
        }

        match MarkerCommand::parse(name) {
            Some(MarkerCommand::Swing(fraction)) => self.set_swing_fraction(fraction),
            Some(MarkerCommand::OffsetMs(offset_ms)) => self.set_offset(offset_ms),
            Some(MarkerCommand::Unrecognized { key, value }) => {
                tracing::debug!(%key, %value, "ignoring unrecognized parameter marker")
            }
            None => {}
        }

        let phase = (self.track_position_ms - marker_position_ms) as f64 / 1000.0;
        self.realign(phase);

        self.outbox.push(BeatEvent::MarkerPassed {
            name: name.to_string(),
        });
    }

    /// Re-anchors the grid after the track was moved to `position_ms`,
    /// assuming the beats continue from the last reported beat at the
    /// current tempo.
    pub fn on_seek(&mut self, position_ms: i32, snapshot: &TimelineSnapshot) {
        self.track_position_ms = position_ms;
        let period = self.state.beat_period_sec;
        if period <= 0.0 {
            return;
        }
        let since_beat = (position_ms - snapshot.beat_position_ms) as f64 / 1000.0;
        self.realign(repeat(since_beat, period));
    }

    /// Emits a downbeat if one has been crossed since the last call.
    pub fn check_for_next_beat(&mut self) -> bool {
        let period = self.state.beat_period_sec;
        if period <= 0.0 {
            return false;
        }

        let position = self.track_time(self.state.elapsed_dsp_time_sec);
        if position < self.state.last_beat_time_sec + period {
            return false;
        }

        let remainder = repeat(position, period);
        self.emit_beat();
        self.state.last_beat_time_sec = position - remainder;
        self.state.last_beat_dsp_time_sec = self.state.elapsed_dsp_time_sec - remainder;
        true
    }

    /// Emits an upbeat if one has been crossed since the last call. The
    /// upbeat schedule runs `period * swing` ahead of the downbeats.
    pub fn check_for_next_upbeat(&mut self) -> bool {
        let period = self.state.beat_period_sec;
        if period <= 0.0 {
            return false;
        }

        let position =
            self.track_time(self.state.elapsed_dsp_time_sec) + self.upbeat_position_sec();
        if position < self.state.last_upbeat_time_sec + period {
            return false;
        }

        let remainder = repeat(position, period);
        self.state.last_upbeat_time_sec = position - remainder;
        tracing::trace!("upbeat");
        self.outbox.push(BeatEvent::Upbeat);
        true
    }

    /// Signed distance in seconds from `timestamp` (DSP seconds) to the
    /// nearest beat: negative when early, positive when late. Zero while
    /// the clock is paused.
    pub fn latency(&self, timestamp: f64) -> f64 {
        let period = self.state.beat_period_sec;
        if period <= 0.0 {
            return 0.0;
        }

        let since_beat = repeat(self.track_time(timestamp), period);
        if since_beat <= period / 2.0 {
            since_beat
        } else {
            since_beat - period
        }
    }

    /// Ordinal of the beat nearest to `timestamp`, counted from track start.
    pub fn beat_index_at(&self, timestamp: f64) -> i64 {
        let period = self.state.beat_period_sec;
        if period <= 0.0 {
            return 0;
        }
        (self.track_time(timestamp) / period).round() as i64
    }

    /// Applies a long-lived bias to the beat phase, wrapped into one period.
    pub fn set_offset(&mut self, offset_ms: i32) {
        self.offset_ms = offset_ms;
        self.rewrap_offset();
        tracing::debug!(offset_ms, offset_sec = self.state.offset_sec, "beat offset set");
    }

    pub fn offset_ms(&self) -> i32 {
        self.offset_ms
    }

    pub fn set_swing_fraction(&mut self, swing_fraction: f64) {
        if !swing_fraction.is_finite() {
            return;
        }
        self.state.swing_fraction = swing_fraction.clamp(0.0, 1.0);
        tracing::debug!(swing = self.state.swing_fraction, "swing changed");
    }

    pub fn state(&self) -> &BeatClockState {
        &self.state
    }

    pub fn beat_period_sec(&self) -> f64 {
        self.state.beat_period_sec
    }

    pub fn upbeat_position_sec(&self) -> f64 {
        self.state.beat_period_sec * self.state.swing_fraction
    }

    pub fn current_time_sec(&self) -> f64 {
        self.state.elapsed_dsp_time_sec
    }

    pub fn dsp_delta_sec(&self) -> f64 {
        self.state.dsp_delta_sec
    }

    pub fn last_beat_dsp_time_sec(&self) -> f64 {
        self.state.last_beat_dsp_time_sec
    }

    pub fn track_position_ms(&self) -> i32 {
        self.track_position_ms
    }

    pub fn track_length_ms(&self) -> i32 {
        self.track_length_ms
    }

    /// Downbeats emitted since the track started.
    pub fn beats_elapsed(&self) -> u64 {
        self.beats_elapsed
    }

    /// True while no usable tempo is known.
    pub fn is_paused(&self) -> bool {
        self.state.beat_period_sec <= 0.0
    }

    pub fn subscribe(&mut self) -> BeatSubscription {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers.push(Subscriber { id, tx, dropped: 0 });
        BeatSubscription { id, rx }
    }

    /// Returns `false` if the id was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Events lost because a live subscriber's queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.subscribers.iter().map(|s| s.dropped).sum()
    }

    /// Delivers queued events to subscribers and hands them back. Dropped
    /// subscriptions are pruned here; full ones lose the overflow.
    pub fn drain_events(&mut self) -> Vec<BeatEvent> {
        let events = std::mem::take(&mut self.outbox);
        if !events.is_empty() {
            self.subscribers
                .retain_mut(|s| events.iter().all(|event| s.deliver(event)));
        }
        events
    }

    fn emit_beat(&mut self) {
        self.beats_elapsed += 1;
        tracing::trace!(bar = self.current_bar, beat = self.current_beat, "beat");
        self.outbox.push(BeatEvent::Beat {
            bar: self.current_bar,
            beat: self.current_beat,
        });
    }

    fn track_time(&self, dsp_time: f64) -> f64 {
        dsp_time - self.state.track_start_time_sec + self.state.offset_sec
    }

    fn realign(&mut self, phase_sec: f64) {
        let start = self.state.elapsed_dsp_time_sec - phase_sec;
        self.state.track_start_time_sec = start;
        self.state.last_beat_time_sec = 0.0;
        self.state.last_upbeat_time_sec = 0.0;
        self.state.last_beat_dsp_time_sec = start;
    }

    fn rewrap_offset(&mut self) {
        let raw = self.offset_ms as f64 / 1000.0;
        let period = self.state.beat_period_sec;
        self.state.offset_sec = if period > 0.0 { repeat(raw, period) } else { raw };
    }
}

/// Wraps `t` into `[0, length]`.
pub(crate) fn repeat(t: f64, length: f64) -> f64 {
    (t - (t / length).floor() * length).clamp(0.0, length)
}
