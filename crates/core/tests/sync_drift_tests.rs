use rhythm_sync_core::sync::LocalEndpoint;
use rhythm_sync_core::{
    AppConfig, AudioSource, LocalHub, ManualNetworkClock, RhythmEngine, SimulatedTrack, SyncRole,
    TickReport,
};

const FRAME: f64 = 0.01;
const LENGTH_MS: i32 = 60_000;

struct Peer {
    engine: RhythmEngine,
    track: SimulatedTrack,
    link: LocalEndpoint,
}

impl Peer {
    fn new(role: SyncRole, link: LocalEndpoint, start_ms: i32) -> Self {
        let (engine, publisher) = RhythmEngine::new(role, &AppConfig::default());
        let mut track = SimulatedTrack::new(publisher, 120.0, LENGTH_MS).with_sample_rate(1_000);
        track.play();
        track.set_position_ms(start_ms);
        Self {
            engine,
            track,
            link,
        }
    }

    fn step(&mut self, net: &ManualNetworkClock, wall: f64) -> TickReport {
        self.engine.receive_packets(&self.link, &self.track, net, wall);
        let report = self.engine.tick(&mut self.track, net, wall);
        self.engine.send_outgoing(&report, &self.link).unwrap();
        report
    }
}

/// Runs host and clients frame by frame; returns every client report.
fn run(
    host: &mut Peer,
    clients: &mut [Peer],
    net: &ManualNetworkClock,
    first_frame: u64,
    frames: u64,
) -> Vec<Vec<TickReport>> {
    let mut reports = vec![Vec::new(); clients.len()];
    for frame in first_frame..first_frame + frames {
        let wall = frame as f64 * FRAME;
        host.step(net, wall);
        for (client, log) in clients.iter_mut().zip(&mut reports) {
            log.push(client.step(net, wall));
        }

        host.track.advance(FRAME);
        for client in clients.iter_mut() {
            client.track.advance(FRAME);
        }
        net.advance(FRAME);
    }
    reports
}

fn offset_ms(host: &Peer, client: &Peer) -> i32 {
    client.track.position_ms() - host.track.position_ms()
}

#[test]
fn skewed_clients_converge_on_the_host() {
    let hub = LocalHub::new();
    let net = ManualNetworkClock::starting_at(0.0);
    let mut host = Peer::new(SyncRole::Host, hub.host().unwrap(), 0);
    let mut clients = vec![
        Peer::new(SyncRole::Client, hub.join().unwrap(), 300),
        Peer::new(SyncRole::Client, hub.join().unwrap(), 900),
    ];
    for client in &clients {
        client.engine.request_sync(&client.link).unwrap();
        assert!(!client.engine.sync().is_synchronized());
    }

    let reports = run(&mut host, &mut clients, &net, 0, 600);

    let tolerance = AppConfig::default().sync.drift_tolerance_ms as i32;
    for (client, log) in clients.iter().zip(&reports) {
        assert!(client.engine.sync().is_synchronized());
        assert!(client.engine.sync().corrections_applied() >= 1);
        assert!(offset_ms(&host, client).abs() <= tolerance);

        // Corrections only ever land on a bar boundary.
        for report in log.iter().filter(|r| r.corrected_to_ms.is_some()) {
            assert!(report.bars_started().next().is_some());
        }
    }
}

#[test]
fn playback_rate_drift_is_pulled_back() {
    let hub = LocalHub::new();
    let net = ManualNetworkClock::starting_at(0.0);
    let mut host = Peer::new(SyncRole::Host, hub.host().unwrap(), 0);
    let mut clients = vec![Peer::new(SyncRole::Client, hub.join().unwrap(), 0)];
    clients[0].engine.request_sync(&clients[0].link).unwrap();

    run(&mut host, &mut clients, &net, 0, 300);
    let settled = clients[0].engine.sync().corrections_applied();

    // Two percent fast gains 200 ms over the next ten seconds when left alone.
    clients[0].track.set_pitch(1.02);
    run(&mut host, &mut clients, &net, 300, 1_000);

    let sync = clients[0].engine.sync();
    assert!(sync.corrections_applied() >= settled + 2);
    assert!(sync.last_drift_ms().is_some());
    assert!(offset_ms(&host, &clients[0]).abs() < 150);
}

#[test]
fn lost_broadcasts_leave_the_client_unsynced() {
    let hub = LocalHub::new();
    let net = ManualNetworkClock::starting_at(0.0);
    let mut host = Peer::new(SyncRole::Host, hub.host().unwrap(), 0);
    let mut clients = vec![Peer::new(SyncRole::Client, hub.join().unwrap(), 500)];

    host.link.set_link_up(false);
    run(&mut host, &mut clients, &net, 0, 500);
    assert_eq!(clients[0].engine.sync().corrections_applied(), 0);
    assert!(!clients[0].engine.sync().is_synchronized());
    assert_eq!(offset_ms(&host, &clients[0]), 500);

    // The next periodic broadcast heals it.
    host.link.set_link_up(true);
    run(&mut host, &mut clients, &net, 500, 500);
    assert!(clients[0].engine.sync().corrections_applied() >= 1);
    assert!(offset_ms(&host, &clients[0]).abs() <= 30);
}

#[test]
fn unavailable_network_clock_means_no_sync() {
    let hub = LocalHub::new();
    let net = ManualNetworkClock::default();
    let mut host = Peer::new(SyncRole::Host, hub.host().unwrap(), 0);
    let mut clients = vec![Peer::new(SyncRole::Client, hub.join().unwrap(), 400)];
    clients[0].engine.request_sync(&clients[0].link).unwrap();

    run(&mut host, &mut clients, &net, 0, 500);
    assert_eq!(clients[0].engine.sync().corrections_applied(), 0);
    assert_eq!(clients[0].engine.sync().last_drift_ms(), None);
}
