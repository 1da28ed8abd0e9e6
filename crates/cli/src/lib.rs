use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use texstream_cache::{DecodedImage, RawImage, StreamingConfig, TextureId};
use texstream_core::{BoostLevel, ImageRequest, ListStats, TextureHandle, TextureList, TextureStats};
use texstream_scheduler::{CancellationToken, FetchError, FetchRequest, ManualClock};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Edge length of every synthetic texture at full resolution
const SYNTHETIC_EDGE: u32 = 1024;

/// Simulated time between frames
const FRAME_INTERVAL: Duration = Duration::from_millis(16);

#[derive(Debug, Parser)]
#[command(name = "texstream")]
#[command(about = "Texture streaming simulator")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Stream a synthetic scene and print the final list statistics.
    Simulate {
        #[arg(long, default_value_t = 200)]
        textures: usize,
        #[arg(long, default_value_t = 120)]
        frames: u32,
        /// Time budget per streaming pass.
        #[arg(long, default_value_t = 5)]
        budget_ms: u64,
        #[arg(long, default_value_t = 256)]
        vram_mb: usize,
        /// Simulated cost of every clock read, in nanoseconds.
        #[arg(long, default_value_t = 200)]
        clock_step_ns: u64,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Configuration file; environment variables otherwise.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration as TOML.
    Config {
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
    /// Print CLI version.
    Version,
}

#[derive(Debug, Serialize)]
struct SimulationOutput {
    textures: usize,
    frames: u32,
    budget_ms: u64,
    vram_mb: usize,
    /// Passes that ran out of budget before finishing
    interrupted_frames: u32,
    max_pass_us: u64,
    peak_vram: usize,
    stats: ListStats,
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    init_tracing();

    match cli.command {
        Commands::Simulate { textures, frames, budget_ms, vram_mb, clock_step_ns, seed, config, json } => {
            let config = load_config(config.as_deref())?.with_vram_mb(vram_mb).with_fast_cache(false);
            let scene = Scene { textures, frames, budget_ms, clock_step_ns, seed };
            let output = run_simulation(config, &scene)?;
            print_simulation(&output, json)
        }
        Commands::Config { file } => {
            let config = load_config(file.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // a subscriber may already be installed when run() is called twice in one process
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

fn load_config(file: Option<&Path>) -> Result<StreamingConfig> {
    let config = match file {
        Some(path) => StreamingConfig::from_file(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?,
        None => StreamingConfig::from_env().context("invalid TEXSTREAM_* environment")?,
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

struct Scene {
    textures: usize,
    frames: u32,
    budget_ms: u64,
    clock_step_ns: u64,
    seed: u64,
}

fn synthetic_source(request: &FetchRequest, _: &CancellationToken) -> Result<DecodedImage, FetchError> {
    let edge = (SYNTHETIC_EDGE >> request.discard).max(1);
    let shade = request.discard.saturating_mul(40);
    Ok(DecodedImage::new(RawImage::solid(edge, edge, 4, shade), request.discard, SYNTHETIC_EDGE, SYNTHETIC_EDGE))
}

fn run_simulation(config: StreamingConfig, scene: &Scene) -> Result<SimulationOutput> {
    let clock = ManualClock::with_step(Duration::from_nanos(scene.clock_step_ns));
    let mut list = TextureList::new(config.clone())?.with_clock(Arc::new(clock.clone()));
    list.init()?;
    let fetcher = list.inline_fetcher(Arc::new(synthetic_source));
    let mut rng = StdRng::seed_from_u64(scene.seed);

    let handles: Vec<TextureHandle> = (0..scene.textures)
        .filter_map(|i| {
            let boost = if i % 50 == 0 { BoostLevel::Hud } else { BoostLevel::None };
            list.get_image(ImageRequest::new(TextureId::from_name(&format!("synthetic-{i}"))).boost(boost))
        })
        .collect();
    info!(textures = handles.len(), frames = scene.frames, "simulation started");

    let budget = Duration::from_millis(scene.budget_ms);
    let mut interrupted_frames = 0;
    let mut max_pass = Duration::ZERO;
    let mut peak_vram = 0;

    for _ in 0..scene.frames {
        for handle in &handles {
            if rng.gen_bool(0.4) {
                let edge: f32 = rng.gen_range(16.0..1024.0);
                list.add_texture_stats(*handle, TextureStats::new(true, edge * edge))?;
            }
        }
        let report = list.update_images(budget);
        if report.admission.interrupted || report.stages_skipped > 0 {
            interrupted_frames += 1;
        }
        max_pass = max_pass.max(report.elapsed);
        peak_vram = peak_vram.max(list.memory().vram.current_usage());

        fetcher.run_pending(config.max_concurrent_fetches);
        clock.advance(FRAME_INTERVAL);
    }

    let stats = list.stats();
    list.shutdown();

    Ok(SimulationOutput {
        textures: scene.textures,
        frames: scene.frames,
        budget_ms: scene.budget_ms,
        vram_mb: config.vram_budget_mb,
        interrupted_frames,
        max_pass_us: max_pass.as_micros() as u64,
        peak_vram,
        stats,
    })
}

fn print_simulation(output: &SimulationOutput, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(output)?);
        return Ok(());
    }

    let stats = &output.stats;
    println!("textures: {}", output.textures);
    println!("frames: {}", output.frames);
    println!("interrupted frames: {}", output.interrupted_frames);
    println!("max pass: {}us", output.max_pass_us);
    println!("pressure: {:?}", stats.pressure);
    println!("resident: {} / {}", stats.resident, stats.textures);
    println!("vram: {} / {} bytes (peak {})", stats.vram_used, stats.vram_limit, output.peak_vram);
    println!("uploads: {}", stats.uploads);
    println!("fetches: {}", stats.fetches_issued);
    println!("dropped decodes: {}", stats.dropped_decodes);
    println!("deletions: {}", stats.deletions);
    Ok(())
}
