//! Host/client agreement on track position.
//!
//! The host stamps its position with shared network time and sends it every
//! bar. A client extrapolates that position to "now", compares it with its
//! own, and when the gap is too large schedules a seek that is only applied
//! on the next bar boundary. The state machine is transport agnostic: the
//! caller moves [`SyncPacket`]s over whatever [`SyncTransport`] it has.

mod message;
pub mod transport;

pub use message::{SyncKind, SyncPacket, TimelineSyncMessage};
pub use transport::{LocalEndpoint, LocalHub, PeerId, SyncTransport};

use std::cell::Cell;
use std::rc::Rc;

use crate::{audio::AudioSource, config::SyncConfig};

/// Time base shared by every participant, in seconds.
pub trait NetworkClock {
    /// `None` while the clock is not available (not connected yet).
    fn now_sec(&self) -> Option<f64>;
}

/// Hand-driven network clock for simulations and tests. Clones share the
/// same reading.
#[derive(Debug, Clone, Default)]
pub struct ManualNetworkClock {
    now: Rc<Cell<Option<f64>>>,
}

impl ManualNetworkClock {
    pub fn starting_at(now_sec: f64) -> Self {
        let clock = Self::default();
        clock.set(Some(now_sec));
        clock
    }

    pub fn set(&self, now_sec: Option<f64>) {
        self.now.set(now_sec);
    }

    /// Moves the clock forward. Does nothing while unavailable.
    pub fn advance(&self, seconds: f64) {
        if let Some(now) = self.now.get() {
            self.now.set(Some(now + seconds));
        }
    }
}

impl NetworkClock for ManualNetworkClock {
    fn now_sec(&self) -> Option<f64> {
        self.now.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRole {
    Host,
    Client,
}

/// A correction waiting for the next bar boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingSync {
    /// Extrapolated host position when the message arrived.
    pub start_position_ms: i32,
    /// Where the track will be moved to. Kept moving with wall time.
    pub target_position_ms: i32,
    scheduled_at_sec: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    AwaitingCorrection(PendingSync),
}

/// What a client made of one received message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncDecision {
    pub extrapolated_position_ms: i32,
    pub drift_ms: f64,
    pub scheduled: bool,
}

/// What happened at a bar boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BarAction {
    None,
    /// Host: send this to every client.
    Broadcast(SyncPacket),
    /// Client: the track was moved to this position.
    Corrected { position_ms: i32 },
}

#[derive(Debug, Clone)]
pub struct NetworkTimelineSync {
    role: SyncRole,
    drift_tolerance_ms: f64,
    anticipation_ms: i32,
    state: SyncState,
    synchronized: bool,
    last_drift_ms: Option<f64>,
    corrections_applied: u32,
    clock_unavailable_logged: bool,
}

impl NetworkTimelineSync {
    pub fn new(role: SyncRole, config: &SyncConfig) -> Self {
        Self {
            role,
            drift_tolerance_ms: config.drift_tolerance_ms,
            anticipation_ms: config.network_anticipation_ms,
            state: SyncState::Idle,
            // The host is the reference and is synchronized by definition.
            synchronized: role == SyncRole::Host,
            last_drift_ms: None,
            corrections_applied: 0,
            clock_unavailable_logged: false,
        }
    }

    pub fn host(config: &SyncConfig) -> Self {
        Self::new(SyncRole::Host, config)
    }

    pub fn client(config: &SyncConfig) -> Self {
        Self::new(SyncRole::Client, config)
    }

    pub fn role(&self) -> SyncRole {
        self.role
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        self.synchronized
    }

    /// Drift measured on the most recent processed message.
    pub fn last_drift_ms(&self) -> Option<f64> {
        self.last_drift_ms
    }

    pub fn corrections_applied(&self) -> u32 {
        self.corrections_applied
    }

    /// Packet a client sends to ask for an immediate position, e.g. on join.
    /// Hosts have nobody to ask.
    pub fn request_sync(&self) -> Option<SyncPacket> {
        (self.role == SyncRole::Client).then_some(SyncPacket::Request)
    }

    /// Host: reply to a client's request with the anticipated position.
    pub fn handle_request(
        &mut self,
        local_position_ms: i32,
        net: &dyn NetworkClock,
    ) -> Option<SyncPacket> {
        if self.role != SyncRole::Host {
            return None;
        }
        self.host_message(local_position_ms, net)
            .map(SyncPacket::requested)
    }

    /// Dispatches an incoming packet. Returns the reply to send back to the
    /// sender, if any.
    pub fn handle_packet(
        &mut self,
        packet: &SyncPacket,
        local_position_ms: i32,
        net: &dyn NetworkClock,
        wall_time_sec: f64,
    ) -> Option<SyncPacket> {
        match *packet {
            SyncPacket::Request => self.handle_request(local_position_ms, net),
            SyncPacket::Sync { kind, message } => {
                self.receive(&message, kind, local_position_ms, net, wall_time_sec);
                None
            }
        }
    }

    /// Client: measures drift against a host message and schedules a
    /// correction when needed. A new correction replaces any pending one.
    /// Returns `None` when the message was not processed.
    pub fn receive(
        &mut self,
        message: &TimelineSyncMessage,
        kind: SyncKind,
        local_position_ms: i32,
        net: &dyn NetworkClock,
        wall_time_sec: f64,
    ) -> Option<SyncDecision> {
        if self.role != SyncRole::Client {
            return None;
        }
        let now = self.network_now(net)?;

        let elapsed_ms = ((now - message.host_timestamp) * 1000.0).round() as i32;
        let extrapolated = message.timeline_position_ms.saturating_add(elapsed_ms);
        let drift_ms = (extrapolated as f64 - local_position_ms as f64).abs();
        self.last_drift_ms = Some(drift_ms);

        tracing::debug!(
            ?kind,
            host_position = message.timeline_position_ms,
            elapsed_ms,
            extrapolated,
            local_position_ms,
            drift_ms,
            "timeline sync received"
        );

        let scheduled = kind == SyncKind::Requested || drift_ms > self.drift_tolerance_ms;
        if scheduled {
            if matches!(self.state, SyncState::AwaitingCorrection(_)) {
                tracing::debug!("replacing pending correction");
            }
            self.state = SyncState::AwaitingCorrection(PendingSync {
                start_position_ms: extrapolated,
                target_position_ms: extrapolated,
                scheduled_at_sec: wall_time_sec,
            });
        } else if !self.synchronized {
            self.synchronized = true;
            tracing::info!(drift_ms, "timeline within tolerance");
        }

        Some(SyncDecision {
            extrapolated_position_ms: extrapolated,
            drift_ms,
            scheduled,
        })
    }

    /// Keeps a pending target moving forward with wall time.
    pub fn tick(&mut self, wall_time_sec: f64) {
        if let SyncState::AwaitingCorrection(pending) = &mut self.state {
            let waited_ms = ((wall_time_sec - pending.scheduled_at_sec) * 1000.0).round() as i32;
            pending.target_position_ms = pending.start_position_ms.saturating_add(waited_ms.max(0));
        }
    }

    /// Called when the local clock starts a new bar. Clients apply the
    /// pending correction; the host produces its periodic broadcast.
    pub fn on_bar_boundary(
        &mut self,
        audio: &mut dyn AudioSource,
        net: &dyn NetworkClock,
    ) -> BarAction {
        match self.role {
            SyncRole::Host => self
                .host_message(audio.position_ms(), net)
                .map(|message| BarAction::Broadcast(SyncPacket::periodic(message)))
                .unwrap_or(BarAction::None),
            SyncRole::Client => {
                let SyncState::AwaitingCorrection(pending) = self.state else {
                    return BarAction::None;
                };
                let from = audio.position_ms();
                audio.set_position_ms(pending.target_position_ms);
                self.state = SyncState::Idle;
                self.synchronized = true;
                self.corrections_applied += 1;

                tracing::info!(
                    from,
                    to = pending.target_position_ms,
                    corrections = self.corrections_applied,
                    "timeline correction applied"
                );
                BarAction::Corrected {
                    position_ms: pending.target_position_ms,
                }
            }
        }
    }

    fn host_message(
        &mut self,
        local_position_ms: i32,
        net: &dyn NetworkClock,
    ) -> Option<TimelineSyncMessage> {
        let now = self.network_now(net)?;
        Some(TimelineSyncMessage {
            timeline_position_ms: local_position_ms.saturating_add(self.anticipation_ms),
            host_timestamp: now,
        })
    }

    fn network_now(&mut self, net: &dyn NetworkClock) -> Option<f64> {
        match net.now_sec().filter(|now| now.is_finite()) {
            Some(now) => {
                self.clock_unavailable_logged = false;
                Some(now)
            }
            None => {
                if !self.clock_unavailable_logged {
                    tracing::warn!(role = ?self.role, "network clock unavailable, skipping sync");
                    self.clock_unavailable_logged = true;
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{PlayState, SimulatedTrack},
        timeline::timeline_channel,
    };
    use proptest::prelude::*;

    fn config(tolerance: f64) -> SyncConfig {
        SyncConfig {
            drift_tolerance_ms: tolerance,
            network_anticipation_ms: 25,
        }
    }

    fn track_at(position_ms: i32) -> SimulatedTrack {
        let (publisher, _receiver) = timeline_channel();
        let mut track = SimulatedTrack::new(publisher, 120.0, 60_000);
        track.play();
        track.set_position_ms(position_ms);
        track
    }

    fn message_at(position: i32, timestamp: f64) -> TimelineSyncMessage {
        TimelineSyncMessage {
            timeline_position_ms: position,
            host_timestamp: timestamp,
        }
    }

    #[test]
    fn host_stamps_anticipated_position() {
        let net = ManualNetworkClock::starting_at(4.0);
        let mut host = NetworkTimelineSync::host(&config(30.0));
        let mut track = track_at(1000);

        let BarAction::Broadcast(SyncPacket::Sync { kind, message }) =
            host.on_bar_boundary(&mut track, &net)
        else {
            panic!("host should broadcast on a bar");
        };
        assert_eq!(kind, SyncKind::Periodic);
        assert_eq!(message, message_at(1025, 4.0));

        let reply = host.handle_request(1000, &net).unwrap();
        assert_eq!(reply, SyncPacket::requested(message_at(1025, 4.0)));
        assert!(host.request_sync().is_none());
    }

    #[test]
    fn drift_within_tolerance_stays_idle() {
        let net = ManualNetworkClock::starting_at(10.05);
        let mut client = NetworkTimelineSync::client(&config(30.0));

        let decision = client
            .receive(&message_at(1000, 10.0), SyncKind::Periodic, 1060, &net, 0.0)
            .unwrap();
        assert_eq!(decision.extrapolated_position_ms, 1050);
        assert_eq!(decision.drift_ms, 10.0);
        assert!(!decision.scheduled);
        assert_eq!(client.state(), SyncState::Idle);
        assert!(client.is_synchronized());
    }

    #[test]
    fn host_broadcast_seen_50ms_later_against_each_tolerance() {
        let net = ManualNetworkClock::starting_at(10.0);
        let mut host = NetworkTimelineSync::host(&config(30.0));
        let BarAction::Broadcast(SyncPacket::Sync { kind, message }) =
            host.on_bar_boundary(&mut track_at(1000), &net)
        else {
            panic!("host should broadcast on a bar");
        };
        assert_eq!(message, message_at(1025, 10.0));

        net.advance(0.050);
        let mut tight = NetworkTimelineSync::client(&config(30.0));
        let decision = tight.receive(&message, kind, 1000, &net, 0.0).unwrap();
        assert_eq!(decision.extrapolated_position_ms, 1075);
        assert_eq!(decision.drift_ms, 75.0);
        assert!(decision.scheduled);
        assert!(matches!(tight.state(), SyncState::AwaitingCorrection(_)));

        let mut loose = NetworkTimelineSync::client(&config(100.0));
        let decision = loose.receive(&message, kind, 1000, &net, 0.0).unwrap();
        assert_eq!(decision.extrapolated_position_ms, 1075);
        assert_eq!(decision.drift_ms, 75.0);
        assert!(!decision.scheduled);
        assert_eq!(loose.state(), SyncState::Idle);
    }

    #[test]
    fn correction_waits_for_the_bar_and_keeps_pace() {
        let net = ManualNetworkClock::starting_at(10.0);
        let mut client = NetworkTimelineSync::client(&config(30.0));
        let mut track = track_at(500);

        client.receive(&message_at(1000, 10.0), SyncKind::Periodic, 500, &net, 2.0);
        assert!(matches!(client.state(), SyncState::AwaitingCorrection(_)));
        assert!(!client.is_synchronized());

        client.tick(2.2);
        let SyncState::AwaitingCorrection(pending) = client.state() else {
            panic!("still waiting");
        };
        assert_eq!(pending.target_position_ms, 1200);
        assert_eq!(track.position_ms(), 500);

        assert_eq!(
            client.on_bar_boundary(&mut track, &net),
            BarAction::Corrected { position_ms: 1200 }
        );
        assert_eq!(track.position_ms(), 1200);
        assert_eq!(track.play_state(), PlayState::Playing);
        assert_eq!(client.state(), SyncState::Idle);
        assert_eq!(client.corrections_applied(), 1);
        assert!(client.is_synchronized());

        assert_eq!(client.on_bar_boundary(&mut track, &net), BarAction::None);
    }

    #[test]
    fn newer_message_replaces_pending_target() {
        let net = ManualNetworkClock::starting_at(1.0);
        let mut client = NetworkTimelineSync::client(&config(30.0));
        let mut track = track_at(0);

        client.receive(&message_at(5000, 1.0), SyncKind::Periodic, 0, &net, 0.0);
        client.receive(&message_at(8000, 1.0), SyncKind::Periodic, 0, &net, 0.0);

        assert_eq!(
            client.on_bar_boundary(&mut track, &net),
            BarAction::Corrected { position_ms: 8000 }
        );
        assert_eq!(client.corrections_applied(), 1);
    }

    #[test]
    fn requested_reply_always_schedules() {
        let net = ManualNetworkClock::starting_at(3.0);
        let mut client = NetworkTimelineSync::client(&config(30.0));
        assert_eq!(client.request_sync(), Some(SyncPacket::Request));

        let reply = SyncPacket::requested(message_at(700, 3.0));
        assert!(client.handle_packet(&reply, 700, &net, 0.0).is_none());
        assert!(matches!(client.state(), SyncState::AwaitingCorrection(_)));
        assert_eq!(client.last_drift_ms(), Some(0.0));
    }

    #[test]
    fn unavailable_network_clock_skips_messages() {
        let net = ManualNetworkClock::default();
        let mut client = NetworkTimelineSync::client(&config(30.0));
        assert!(client
            .receive(&message_at(9000, 0.0), SyncKind::Requested, 0, &net, 0.0)
            .is_none());
        assert_eq!(client.state(), SyncState::Idle);
        assert!(!client.is_synchronized());

        let mut host = NetworkTimelineSync::host(&config(30.0));
        let mut track = track_at(0);
        assert_eq!(host.on_bar_boundary(&mut track, &net), BarAction::None);
    }

    #[test]
    fn roles_ignore_the_other_side() {
        let net = ManualNetworkClock::starting_at(0.0);
        let mut host = NetworkTimelineSync::host(&config(30.0));
        assert!(host
            .receive(&message_at(100, 0.0), SyncKind::Requested, 0, &net, 0.0)
            .is_none());

        let mut client = NetworkTimelineSync::client(&config(30.0));
        assert!(client.handle_packet(&SyncPacket::Request, 0, &net, 0.0).is_none());
    }

    proptest! {
        #[test]
        fn periodic_schedules_only_beyond_tolerance(
            host_position in 0i32..100_000,
            elapsed_ms in 0i32..500,
            local_offset in -400i32..400,
            tolerance in 0.0f64..200.0,
        ) {
            let host_ts = 100.0;
            let net = ManualNetworkClock::starting_at(host_ts + elapsed_ms as f64 / 1000.0);
            let mut client = NetworkTimelineSync::client(&config(tolerance));
            let local = host_position + elapsed_ms + local_offset;

            let decision = client
                .receive(&message_at(host_position, host_ts), SyncKind::Periodic, local, &net, 0.0)
                .unwrap();
            prop_assert_eq!(decision.drift_ms, local_offset.abs() as f64);
            prop_assert_eq!(decision.scheduled, decision.drift_ms > tolerance);
        }
    }
}
