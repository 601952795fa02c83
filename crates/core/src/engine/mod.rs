//! Per-tick composition of the timing core.
//!
//! [`RhythmEngine`] owns one of each component and runs them in a fixed
//! order: poll the audio timeline, advance the beat clock, evaluate sync,
//! then score. Hits arriving between ticks are queued and graded against
//! the freshly advanced clock.

use crate::{
    audio::AudioSource,
    calibration::{LatencyCalibrator, PlayerId},
    clock::{BeatClock, BeatEvent, BeatSubscription},
    config::AppConfig,
    scoring::{ScoreEvaluator, ScoreRecord, TeamScore},
    sync::{BarAction, NetworkClock, NetworkTimelineSync, SyncPacket, SyncRole, SyncTransport},
    timeline::{timeline_channel, TimelinePublisher, TimelineReceiver},
    Result, RhythmSyncError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum HitKind {
    Score,
    CalibrationTap,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct QueuedHit {
    kind: HitKind,
    player: Option<PlayerId>,
    timestamp: f64,
}

/// Everything one tick produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub events: Vec<BeatEvent>,
    /// Packets the host should broadcast to its clients.
    pub outgoing: Vec<SyncPacket>,
    /// Position the track was moved to by a sync correction.
    pub corrected_to_ms: Option<i32>,
    pub scores: Vec<ScoreRecord>,
    pub team_scores: Vec<TeamScore>,
    /// Calibration taps measured this tick, in seconds.
    pub calibration_samples: Vec<(PlayerId, f64)>,
}

impl TickReport {
    pub fn beats(&self) -> usize {
        self.events
            .iter()
            .filter(|event| matches!(event, BeatEvent::Beat { .. }))
            .count()
    }

    pub fn bars_started(&self) -> impl Iterator<Item = i32> + '_ {
        self.events.iter().filter_map(|event| match event {
            BeatEvent::BarStarted { bar } => Some(*bar),
            _ => None,
        })
    }
}

#[derive(Debug)]
pub struct RhythmEngine {
    receiver: TimelineReceiver,
    clock: BeatClock,
    sync: NetworkTimelineSync,
    calibrator: LatencyCalibrator,
    scoring: ScoreEvaluator,
    queued: Vec<QueuedHit>,
}

impl RhythmEngine {
    /// Builds an engine and the publisher its audio source should report
    /// timeline events through.
    pub fn new(role: SyncRole, config: &AppConfig) -> (Self, TimelinePublisher) {
        let (publisher, receiver) = timeline_channel();
        (Self::with_receiver(role, config, receiver), publisher)
    }

    pub fn with_receiver(role: SyncRole, config: &AppConfig, receiver: TimelineReceiver) -> Self {
        Self {
            receiver,
            clock: BeatClock::new(&config.clock),
            sync: NetworkTimelineSync::new(role, &config.sync),
            calibrator: LatencyCalibrator::new(&config.calibration),
            scoring: ScoreEvaluator::new(&config.scoring),
            queued: Vec::new(),
        }
    }

    pub fn clock(&self) -> &BeatClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut BeatClock {
        &mut self.clock
    }

    pub fn sync(&self) -> &NetworkTimelineSync {
        &self.sync
    }

    pub fn calibrator(&self) -> &LatencyCalibrator {
        &self.calibrator
    }

    pub fn calibrator_mut(&mut self) -> &mut LatencyCalibrator {
        &mut self.calibrator
    }

    pub fn scoring(&self) -> &ScoreEvaluator {
        &self.scoring
    }

    pub fn receiver(&self) -> &TimelineReceiver {
        &self.receiver
    }

    pub fn subscribe(&mut self) -> BeatSubscription {
        self.clock.subscribe()
    }

    pub fn add_player(&mut self, player: PlayerId) {
        self.scoring.add_player(player);
    }

    /// Drops the player from team synchrony and forgets their calibration.
    pub fn remove_player(&mut self, player: PlayerId) {
        self.scoring.remove_player(player);
        self.calibrator.reset(player);
    }

    /// Queues a hit to be scored on the next tick.
    pub fn queue_hit(&mut self, player: Option<PlayerId>, timestamp: f64) {
        self.queued.push(QueuedHit {
            kind: HitKind::Score,
            player,
            timestamp,
        });
    }

    /// Queues a calibration tap to be measured on the next tick.
    pub fn queue_calibration_tap(&mut self, player: PlayerId, timestamp: f64) {
        self.queued.push(QueuedHit {
            kind: HitKind::CalibrationTap,
            player: Some(player),
            timestamp,
        });
    }

    /// Runs one main-loop update.
    pub fn tick(
        &mut self,
        audio: &mut dyn AudioSource,
        net: &dyn NetworkClock,
        wall_time_sec: f64,
    ) -> TickReport {
        let poll = self.receiver.poll(audio.position_ms());
        let events = self.clock.update(&*audio, self.receiver.snapshot(), &poll);
        let mut report = TickReport::default();

        self.sync.tick(wall_time_sec);
        for _ in events
            .iter()
            .filter(|event| matches!(event, BeatEvent::BarStarted { .. }))
        {
            match self.sync.on_bar_boundary(audio, net) {
                BarAction::Broadcast(packet) => report.outgoing.push(packet),
                BarAction::Corrected { position_ms } => {
                    self.clock.on_seek(position_ms, self.receiver.snapshot());
                    report.corrected_to_ms = Some(position_ms);
                }
                BarAction::None => {}
            }
        }

        for hit in std::mem::take(&mut self.queued) {
            match (hit.kind, hit.player) {
                (HitKind::CalibrationTap, Some(player)) => {
                    let measured = self.calibrator.record_tap(player, &self.clock, hit.timestamp);
                    report.calibration_samples.push((player, measured));
                }
                _ => {
                    let outcome =
                        self.scoring
                            .score(&self.clock, &self.calibrator, hit.timestamp, hit.player);
                    report.scores.push(outcome.record);
                    report.team_scores.extend(outcome.team);
                }
            }
        }

        report.events = events;
        report
    }

    /// Handles every packet waiting on `transport`, replying to requests.
    /// Returns how many packets were processed.
    pub fn receive_packets(
        &mut self,
        transport: &dyn SyncTransport,
        audio: &dyn AudioSource,
        net: &dyn NetworkClock,
        wall_time_sec: f64,
    ) -> usize {
        let packets = transport.drain();
        for (from, packet) in &packets {
            let Some(reply) =
                self.sync
                    .handle_packet(packet, audio.position_ms(), net, wall_time_sec)
            else {
                continue;
            };
            if let Err(err) = transport.send_to(*from, &reply) {
                tracing::warn!(%from, %err, "could not answer sync request");
            }
        }
        packets.len()
    }

    /// Broadcasts the packets a tick produced.
    pub fn send_outgoing(&self, report: &TickReport, transport: &dyn SyncTransport) -> Result<()> {
        for packet in &report.outgoing {
            transport.broadcast(packet)?;
        }
        Ok(())
    }

    /// Asks the host for its position, typically right after joining.
    pub fn request_sync(&self, transport: &dyn SyncTransport) -> Result<()> {
        match self.sync.request_sync() {
            Some(_) => transport.request(),
            None => Err(RhythmSyncError::msg("only clients can request a sync")),
        }
    }
}
