use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use chrono::Utc;
use clap::{Parser, Subcommand};
use lightsync_core::{
    audio, AnimationKind, AnimationSpec, AppConfig, AudioAnalyzer, AudioLocation, Capability,
    DeviceProfiler, DeviceScanner, HomeHub, HttpHub, LightDevice, LightSyncError, ProfileStore,
    ScanFilter, SessionStore, SimulatedHub, SimulatedLight, Timeline, TimelineGenerator,
    TimelineStore,
};
use tracing_subscriber::EnvFilter;

type Result<T> = lightsync_core::Result<T>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let hub = build_hub(&config, cli.simulate)?;

    match cli.command {
        Commands::Analyze { source, output } => run_analyze(&config, &source, output).await,
        Commands::Scan { capability, area } => run_scan(hub, capability, area).await,
        Commands::Profile {
            entity,
            iterations,
            profiles,
            force,
        } => run_profile(&config, hub, entity, iterations, profiles, force).await,
        Commands::Generate {
            source,
            entity,
            profiles,
            timelines,
            name,
        } => run_generate(&config, hub, &source, entity, profiles, timelines, name).await,
        Commands::Play {
            timeline,
            timelines,
            start,
        } => run_play(&config, hub, &timeline, timelines, start).await,
        Commands::Animate {
            kind,
            entity,
            period_ms,
            seconds,
        } => run_animate(&config, hub, &kind, entity, period_ms, seconds).await,
    }
}

fn build_hub(config: &AppConfig, simulate: bool) -> Result<Arc<dyn HomeHub>> {
    if simulate {
        tracing::info!("using simulated hub");
        let hub = SimulatedHub::new(vec![
            SimulatedLight::new("light.living_room", "Living Room")
                .with_color_modes(&["rgb"])
                .with_effects(&["colorloop"])
                .with_area("living_room"),
            SimulatedLight::new("light.desk", "Desk Lamp")
                .with_color_modes(&["color_temp"])
                .with_area("office")
                .with_response_delay(Duration::from_millis(250)),
            SimulatedLight::new("light.hallway", "Hallway")
                .with_brightness_gamma(2.2)
                .with_area("hallway"),
        ]);
        return Ok(Arc::new(hub));
    }

    tracing::info!(base_url = %config.hub.base_url, "using home hub");
    Ok(Arc::new(HttpHub::new(&config.hub)?))
}

async fn load_audio(config: &AppConfig, source: &str) -> Result<Vec<u8>> {
    let location = AudioLocation::parse(source);
    audio::load(
        &location,
        config.analysis.max_audio_bytes,
        Duration::from_secs(config.analysis.fetch_timeout_secs),
    )
    .await
}

async fn run_analyze(config: &AppConfig, source: &str, output: Option<PathBuf>) -> Result<()> {
    tracing::info!(source, "analysing audio");
    let bytes = load_audio(config, source).await?;
    let mut analyzer = AudioAnalyzer::new(config.analysis.clone())?;
    let features = analyzer.analyze_bytes(bytes)?;

    tracing::info!(
        duration = features.duration,
        bpm = features.bpm,
        beats = features.beats.len(),
        mood = %features.mood,
        "analysis complete"
    );
    let json = serde_json::to_string_pretty(&features)?;
    match output {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}

async fn run_scan(hub: Arc<dyn HomeHub>, capability: Option<String>, area: Option<String>) -> Result<()> {
    let mut filter = ScanFilter::default();
    if let Some(capability) = capability {
        filter = filter.with_capability(Capability::from_str(&capability)?);
    }
    if let Some(area) = area {
        filter = filter.in_area(area);
    }

    let devices = DeviceScanner::new(hub).scan(&filter).await?;
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

/// Scans and keeps only the requested entities (all lights when empty).
async fn select_devices(hub: Arc<dyn HomeHub>, entities: &[String]) -> Result<Vec<LightDevice>> {
    let devices = DeviceScanner::new(hub).scan(&ScanFilter::default()).await?;
    if entities.is_empty() {
        return Ok(devices);
    }

    let selected: Vec<LightDevice> = devices
        .into_iter()
        .filter(|d| entities.contains(&d.entity_id))
        .collect();
    if let Some(missing) = entities
        .iter()
        .find(|e| !selected.iter().any(|d| &d.entity_id == *e))
    {
        return Err(LightSyncError::input(format!("light `{missing}` was not found")));
    }
    Ok(selected)
}

async fn run_profile(
    config: &AppConfig,
    hub: Arc<dyn HomeHub>,
    entities: Vec<String>,
    iterations: Option<usize>,
    profiles_dir: PathBuf,
    force: bool,
) -> Result<()> {
    let devices = select_devices(hub.clone(), &entities).await?;
    let mut store = ProfileStore::open(&profiles_dir)?;
    let profiler = DeviceProfiler::new(hub, config.profiler.clone());
    let iterations = iterations.unwrap_or(config.profiler.iterations);
    let now = Utc::now();

    for device in &devices {
        let fresh = store
            .get(&device.entity_id)
            .is_some_and(|p| !p.needs_reprofiling_at(config.profiler.reprofile_interval_days, now));
        if fresh && !force {
            tracing::info!(entity_id = %device.entity_id, "profile is current, skipping");
            continue;
        }

        match profiler.profile(device, iterations).await {
            Ok(profile) => store.insert(profile)?,
            Err(err) => tracing::error!(entity_id = %device.entity_id, %err, "profiling failed"),
        }
    }

    println!("{}", serde_json::to_string_pretty(store.profiles())?);
    Ok(())
}

async fn run_generate(
    config: &AppConfig,
    hub: Arc<dyn HomeHub>,
    source: &str,
    entities: Vec<String>,
    profiles_dir: PathBuf,
    timelines_dir: PathBuf,
    name: Option<String>,
) -> Result<()> {
    let bytes = load_audio(config, source).await?;
    let mut analyzer = AudioAnalyzer::new(config.analysis.clone())?;
    let features = analyzer.analyze_bytes(bytes)?;

    let devices = select_devices(hub, &entities).await?;
    let profiles = ProfileStore::open(&profiles_dir)?;
    let stale = profiles.stale(config.profiler.reprofile_interval_days, Utc::now());
    if !stale.is_empty() {
        tracing::warn!(?stale, "generating with stale profiles");
    }

    let mut settings = config.generation.clone();
    if name.is_some() {
        settings.name = name;
    }
    let generated = TimelineGenerator::new(settings)?.generate(&features, &devices, &profiles)?;
    let mut timeline = generated.timeline;
    timeline.audio_source = Some(source.to_string());

    let mut store = TimelineStore::open(&timelines_dir)?;
    let stored = store.insert(timeline)?;
    tracing::info!(timeline_id = %stored.id, stats = ?generated.stats, "timeline stored");
    println!("{}", stored.id);
    Ok(())
}

async fn run_play(
    config: &AppConfig,
    hub: Arc<dyn HomeHub>,
    timeline: &str,
    timelines_dir: PathBuf,
    start: f64,
) -> Result<()> {
    let mut timelines = TimelineStore::open(&timelines_dir)?;
    let timeline_id = match timelines.get(timeline) {
        Some(stored) => stored.id.clone(),
        None => {
            // Not a stored id; treat it as an exported document on disk.
            let raw = std::fs::read_to_string(timeline)?;
            timelines.insert(Timeline::import_json(&raw)?)?.id.clone()
        }
    };
    let duration = timelines
        .get(&timeline_id)
        .map(|t| t.duration)
        .unwrap_or_default();

    let devices = DeviceScanner::new(hub.clone()).scan(&ScanFilter::default()).await?;
    let mut sessions =
        SessionStore::new(hub, config.playback.clone(), timelines).with_devices(&devices);
    let session_id = expect_success(sessions.create_timeline_session(&timeline_id, start))?;
    expect_success(sessions.start(&session_id))?;

    let remaining = Duration::from_secs_f64((duration - start).max(0.0)) + Duration::from_millis(500);
    tokio::select! {
        _ = tokio::time::sleep(remaining) => tracing::info!("timeline finished"),
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
    }

    println!("{}", serde_json::to_string_pretty(&sessions.list())?);
    sessions.stop_all();
    Ok(())
}

async fn run_animate(
    config: &AppConfig,
    hub: Arc<dyn HomeHub>,
    kind: &str,
    entities: Vec<String>,
    period_ms: u64,
    seconds: Option<u64>,
) -> Result<()> {
    let devices = select_devices(hub.clone(), &entities).await?;
    let spec = AnimationSpec {
        period_ms,
        ..AnimationSpec::new(
            AnimationKind::from_str(kind)?,
            devices.into_iter().map(|d| d.entity_id).collect(),
        )
    };

    let mut sessions = SessionStore::new(hub, config.playback.clone(), TimelineStore::in_memory());
    let session_id = expect_success(sessions.create_animation_session(spec))?;
    expect_success(sessions.start(&session_id))?;

    match seconds {
        Some(seconds) => tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            _ = tokio::signal::ctrl_c() => {}
        },
        None => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    sessions.stop_all();
    Ok(())
}

/// Returns the session id of a successful response, or its message as an
/// error.
fn expect_success(response: lightsync_core::ControlResponse) -> Result<String> {
    if response.success {
        response
            .session_id
            .ok_or_else(|| LightSyncError::msg("control response carried no session id"))
    } else {
        Err(LightSyncError::msg(response.message))
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Synchronise smart lights to music", long_about = None)]
struct Cli {
    /// JSON configuration file. Defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Use a built-in simulated hub instead of the configured one.
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract frequency bands, beats, tempo and mood from an audio file.
    Analyze {
        /// Local path or http(s) URL.
        source: String,
        /// Write the features here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List controllable lights.
    Scan {
        /// Only lights with this capability (color, color_temp, brightness, effects).
        #[arg(long)]
        capability: Option<String>,
        #[arg(long)]
        area: Option<String>,
    },
    /// Measure latency and fidelity of lights whose profile is missing or stale.
    Profile {
        /// Lights to profile; all when omitted.
        #[arg(short, long)]
        entity: Vec<String>,
        #[arg(short, long)]
        iterations: Option<usize>,
        #[arg(long, default_value = "profiles")]
        profiles: PathBuf,
        /// Re-profile even when the stored profile is current.
        #[arg(long)]
        force: bool,
    },
    /// Analyse audio and build a latency-compensated timeline.
    Generate {
        source: String,
        #[arg(short, long)]
        entity: Vec<String>,
        #[arg(long, default_value = "profiles")]
        profiles: PathBuf,
        #[arg(long, default_value = "timelines")]
        timelines: PathBuf,
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Play a stored timeline (by id) or an exported timeline file.
    Play {
        timeline: String,
        #[arg(long, default_value = "timelines")]
        timelines: PathBuf,
        /// Start position in seconds.
        #[arg(long, default_value_t = 0.0)]
        start: f64,
    },
    /// Run a looping animation (pulse, breathe, color_cycle) until interrupted.
    Animate {
        kind: String,
        #[arg(short, long)]
        entity: Vec<String>,
        #[arg(long, default_value_t = 2_000)]
        period_ms: u64,
        /// Stop after this many seconds.
        #[arg(long)]
        seconds: Option<u64>,
    },
}
