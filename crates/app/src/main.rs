use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use rhythm_sync_core::{
    sync::LocalEndpoint, AppConfig, AudioSource, LocalHub, ManualNetworkClock, PlayState,
    PlayerId, RhythmEngine, SimulatedTrack, SyncRole,
};
use tracing_subscriber::EnvFilter;

const FRAME_SEC: f64 = 1.0 / 60.0;

fn main() -> rhythm_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            clients,
            seconds,
            tempo,
            skew_ms,
            pitch_drift,
        } => run_simulate(&config, clients, seconds, tempo, skew_ms, pitch_drift),
        Commands::Calibrate {
            taps,
            bias_ms,
            jitter_ms,
        } => run_calibrate(&config, taps, bias_ms, jitter_ms),
        Commands::Config => {
            println!("{}", config.to_json_pretty()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> rhythm_sync_core::Result<AppConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            AppConfig::from_json_file(path)
        }
        None => Ok(AppConfig::default()),
    }
}

struct Participant {
    name: String,
    engine: RhythmEngine,
    track: SimulatedTrack,
    link: LocalEndpoint,
}

impl Participant {
    fn join(
        name: String,
        role: SyncRole,
        config: &AppConfig,
        link: LocalEndpoint,
        tempo: f32,
        length_ms: i32,
    ) -> Self {
        let (engine, publisher) = RhythmEngine::new(role, config);
        let track = SimulatedTrack::new(publisher, tempo, length_ms)
            .with_sample_rate(config.clock.sample_rate);
        Self {
            name,
            engine,
            track,
            link,
        }
    }

    fn step(&mut self, net: &ManualNetworkClock, wall_time_sec: f64) -> rhythm_sync_core::Result<()> {
        self.engine
            .receive_packets(&self.link, &self.track, net, wall_time_sec);
        let report = self.engine.tick(&mut self.track, net, wall_time_sec);
        self.engine.send_outgoing(&report, &self.link)?;

        if let Some(position_ms) = report.corrected_to_ms {
            tracing::info!(peer = %self.name, position_ms, "corrected");
        }
        Ok(())
    }
}

fn run_simulate(
    config: &AppConfig,
    clients: u32,
    seconds: f64,
    tempo: f32,
    skew_ms: i32,
    pitch_drift: f64,
) -> rhythm_sync_core::Result<()> {
    tracing::info!(clients, seconds, tempo, skew_ms, pitch_drift, "starting simulation");

    let length_ms = ((seconds + 10.0) * 1000.0) as i32;
    let hub = LocalHub::new();
    let net = ManualNetworkClock::starting_at(0.0);

    let mut host = Participant::join(
        "host".to_string(),
        SyncRole::Host,
        config,
        hub.host()?,
        tempo,
        length_ms,
    );
    host.track.play();

    let mut peers = Vec::new();
    for index in 0..clients {
        let mut peer = Participant::join(
            format!("client-{}", index + 1),
            SyncRole::Client,
            config,
            hub.join()?,
            tempo,
            length_ms,
        );
        // Alternate fast and slow playback, growing with the index.
        let sign = if index % 2 == 0 { 1.0 } else { -1.0 };
        peer.track
            .set_pitch(1.0 + sign * pitch_drift / 100.0 * f64::from(index + 1));
        peer.track.play();
        peer.track
            .set_position_ms(skew_ms.saturating_mul(index as i32 + 1).max(0));
        peer.engine.request_sync(&peer.link)?;
        peers.push(peer);
    }

    let frames = (seconds / FRAME_SEC).ceil() as u64;
    let mut next_report_sec = 1.0;
    for frame in 0..frames {
        let wall = frame as f64 * FRAME_SEC;

        host.step(&net, wall)?;
        for peer in &mut peers {
            peer.step(&net, wall)?;
        }

        if wall >= next_report_sec {
            next_report_sec += 1.0;
            let host_position = host.track.position_ms();
            for peer in &peers {
                tracing::info!(
                    peer = %peer.name,
                    offset_ms = peer.track.position_ms() - host_position,
                    synced = peer.engine.sync().is_synchronized(),
                    "drift"
                );
            }
        }

        host.track.advance(FRAME_SEC);
        for peer in &mut peers {
            peer.track.advance(FRAME_SEC);
        }
        net.advance(FRAME_SEC);
    }

    let host_position = host.track.position_ms();
    println!("{:<10} {:>10} {:>12} {:>14}", "peer", "offset ms", "corrections", "last drift ms");
    for peer in &peers {
        let sync = peer.engine.sync();
        println!(
            "{:<10} {:>10} {:>12} {:>14}",
            peer.name,
            peer.track.position_ms() - host_position,
            sync.corrections_applied(),
            sync.last_drift_ms()
                .map(|drift| format!("{drift:.0}"))
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(())
}

fn run_calibrate(
    config: &AppConfig,
    taps: u32,
    bias_ms: f64,
    jitter_ms: f64,
) -> rhythm_sync_core::Result<()> {
    tracing::info!(taps, bias_ms, jitter_ms, "running calibration");

    let player = PlayerId(1);
    let net = ManualNetworkClock::starting_at(0.0);
    let (mut engine, publisher) = RhythmEngine::new(SyncRole::Host, config);
    let mut track = SimulatedTrack::new(publisher, 120.0, (taps as i32 + 4) * 1000)
        .with_sample_rate(config.clock.sample_rate);
    track.play();

    println!("{:>4} {:>10} {:>12}", "tap", "sample ms", "estimate ms");
    let mut queued = 0;
    let mut measured = 0;
    let mut frame = 0u64;
    while measured < taps && track.play_state() == PlayState::Playing {
        let report = engine.tick(&mut track, &net, frame as f64 * FRAME_SEC);

        for &(_, sample) in &report.calibration_samples {
            measured += 1;
            println!(
                "{:>4} {:>10.1} {:>12.1}",
                measured,
                sample * 1000.0,
                engine.calibrator().estimate(Some(player)) * 1000.0
            );
        }

        if report.beats() > 0 && queued < taps {
            // Deterministic jitter so runs are reproducible.
            let jitter = (f64::from(queued) * 2.399).sin() * jitter_ms;
            let beat = engine.clock().last_beat_dsp_time_sec();
            engine.queue_calibration_tap(player, beat + (bias_ms + jitter) / 1000.0);
            queued += 1;
        }

        track.advance(FRAME_SEC);
        net.advance(FRAME_SEC);
        frame += 1;
    }
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Rhythm timing and synchronization engine", long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults are used when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a host and several clients in-process and report their drift.
    Simulate {
        /// Number of clients joining the host.
        #[arg(long, default_value_t = 2)]
        clients: u32,
        /// Simulated duration in seconds.
        #[arg(long, default_value_t = 20.0)]
        seconds: f64,
        /// Track tempo in beats per minute.
        #[arg(long, default_value_t = 120.0)]
        tempo: f32,
        /// How far ahead each successive client starts, in milliseconds.
        #[arg(long, default_value_t = 250)]
        skew_ms: i32,
        /// Playback rate error per client, in percent.
        #[arg(long, default_value_t = 0.2)]
        pitch_drift: f64,
    },
    /// Feed synthetic calibration taps and show the estimate converge.
    Calibrate {
        #[arg(long, default_value_t = 12)]
        taps: u32,
        /// The player's true latency.
        #[arg(long, default_value_t = 60.0)]
        bias_ms: f64,
        #[arg(long, default_value_t = 15.0)]
        jitter_ms: f64,
    },
    /// Print the effective configuration as JSON.
    Config,
}
