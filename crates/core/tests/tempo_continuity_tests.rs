use rhythm_sync_core::{
    AppConfig, BeatEvent, ManualNetworkClock, RhythmEngine, SimulatedTrack, SyncRole,
};

const FRAME: f64 = 0.01;

/// Plays the track through the engine and returns the DSP time of every
/// detected beat together with all events.
fn beat_times(
    mut track: SimulatedTrack,
    mut engine: RhythmEngine,
    frames: u64,
) -> (Vec<f64>, Vec<BeatEvent>) {
    let net = ManualNetworkClock::starting_at(0.0);
    let mut times = Vec::new();
    let mut events = Vec::new();

    track.play();
    for frame in 0..frames {
        let report = engine.tick(&mut track, &net, frame as f64 * FRAME);
        if report.beats() > 0 {
            times.push(engine.clock().last_beat_dsp_time_sec());
        }
        events.extend(report.events);
        track.advance(FRAME);
        net.advance(FRAME);
    }
    (times, events)
}

#[test]
fn tempo_ramp_keeps_beats_continuous() {
    let (engine, publisher) = RhythmEngine::new(SyncRole::Host, &AppConfig::default());
    let track = SimulatedTrack::new(publisher, 120.0, 10_000)
        .with_sample_rate(1_000)
        .with_section(4_000, 90.0, 4);

    let (times, events) = beat_times(track, engine, 801);

    let slow = 60.0 / 90.0;
    let intervals: Vec<f64> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(!intervals.is_empty());
    for (index, interval) in intervals.iter().enumerate() {
        let expected = if times[index + 1] <= 4.0 + 1e-6 { 0.5 } else { slow };
        assert!(
            (interval - expected).abs() < 1e-6,
            "beat {index} came after {interval}s, expected {expected}s"
        );
    }
    assert!((times.iter().find(|&&t| t > 4.0 + 1e-6).unwrap() - (4.0 + slow)).abs() < 1e-6);

    let tempo_changes: Vec<f64> = events
        .iter()
        .filter_map(|event| match event {
            BeatEvent::TempoChanged { beat_period_sec } => Some(*beat_period_sec),
            _ => None,
        })
        .collect();
    assert_eq!(tempo_changes.len(), 2);
    assert!((tempo_changes[1] - slow).abs() < 1e-9);
}

#[test]
fn parameter_marker_on_a_beat_keeps_the_grid() {
    let (mut engine, publisher) = RhythmEngine::new(SyncRole::Host, &AppConfig::default());
    let mut track = SimulatedTrack::new(publisher, 120.0, 10_000)
        .with_sample_rate(1_000)
        .with_marker(2_000, "Swing=0.65");

    let net = ManualNetworkClock::starting_at(0.0);
    track.play();
    let mut times = Vec::new();
    let mut marker_seen = false;
    for frame in 0..401u64 {
        let report = engine.tick(&mut track, &net, frame as f64 * FRAME);
        if report.beats() > 0 {
            times.push(engine.clock().last_beat_dsp_time_sec());
        }
        marker_seen |= report
            .events
            .iter()
            .any(|event| matches!(event, BeatEvent::MarkerPassed { .. }));
        track.advance(FRAME);
    }

    assert!(marker_seen);
    assert!((engine.clock().state().swing_fraction - 0.65).abs() < 1e-12);
    for pair in times.windows(2) {
        assert!((pair[1] - pair[0] - 0.5).abs() < 1e-6);
    }
}

#[test]
fn beat_subscribers_see_the_same_events() {
    let (mut engine, publisher) = RhythmEngine::new(SyncRole::Host, &AppConfig::default());
    let subscription = engine.subscribe();
    let track = SimulatedTrack::new(publisher, 120.0, 10_000).with_sample_rate(1_000);

    let (_, events) = beat_times(track, engine, 201);
    assert_eq!(subscription.drain(), events);
    assert!(events.contains(&BeatEvent::TrackStarted));
}
