mod app;
mod color;
mod config;
mod error;
mod histogram;
mod layer;
mod loader;
mod merge;
mod mock;
mod normalize;
mod points;
mod render;
mod view;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "wavecloud")]
#[command(about = "Point-cloud viewer for multi-channel waveform layers", long_about = None)]
struct Cli {
    /// JSON settings file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the viewer (default)
    View(ViewArgs),

    /// Convert a folder of .wav recordings into layer files
    Convert {
        wav_dir: PathBuf,

        /// Output directory for Layer_N.layer files
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Print the value histogram of a layer folder
    Histogram {
        dir: PathBuf,

        #[arg(short, long, default_value = "channel_1")]
        channel: String,

        /// Re-bucket into this many equal-width bins
        #[arg(short, long)]
        bins: Option<usize>,
    },

    /// Write synthetic layer files
    Mock {
        dir: PathBuf,

        #[arg(short, long, default_value = "5")]
        layers: usize,

        /// Approximate points per layer
        #[arg(short, long, default_value = "250000")]
        points: usize,

        #[arg(short, long)]
        seed: Option<u64>,
    },
}

#[derive(Args, Default)]
struct ViewArgs {
    /// Folder with layer files
    #[arg(long)]
    layer_dir: Option<PathBuf>,

    #[arg(long)]
    channel: Option<String>,

    /// Keep every nth row
    #[arg(long)]
    stride: Option<usize>,

    #[arg(long)]
    point_size: Option<f32>,

    #[arg(long)]
    value_min: Option<f32>,

    #[arg(long)]
    value_max: Option<f32>,

    /// Screenshot target
    #[arg(long)]
    export: Option<PathBuf>,
}

impl ViewArgs {
    fn apply(self, settings: &mut config::Settings) {
        if let Some(dir) = self.layer_dir {
            settings.layer_dir = dir;
        }
        if let Some(channel) = self.channel {
            settings.channel = channel;
        }
        if let Some(stride) = self.stride {
            settings.stride = stride;
        }
        if let Some(size) = self.point_size {
            settings.point_size = size;
        }
        if let Some(min) = self.value_min {
            settings.value_min = min;
        }
        if let Some(max) = self.value_max {
            settings.value_max = max;
        }
        if let Some(path) = self.export {
            settings.export_path = path;
        }
    }
}

fn run_viewer(settings: config::Settings) -> anyhow::Result<()> {
    let native_options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_title("wavecloud")
            .with_inner_size([1200.0, 800.0]),
        ..Default::default()
    };

    eframe::run_native(
        "wavecloud",
        native_options,
        Box::new(|cc| Ok(Box::new(app::WavecloudApp::new(cc, settings)))),
    )
    .map_err(|e| anyhow::anyhow!("viewer failed: {e}"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut settings = config::Settings::load_or_default(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::View(ViewArgs::default())) {
        Commands::View(args) => {
            args.apply(&mut settings);
            run_viewer(settings.sanitized())
        }
        Commands::Convert { wav_dir, out } => {
            let out = out.unwrap_or(settings.layer_dir);
            let written = layer::convert_wav_dir(&wav_dir, &out, |done, total, path| {
                println!("[{done}/{total}] {}", path.display());
            })
            .with_context(|| format!("converting {}", wav_dir.display()))?;
            println!("{} layer files written to {}", written.len(), out.display());
            Ok(())
        }
        Commands::Histogram { dir, channel, bins } => {
            let hist = histogram::histogram(&dir, &channel, bins)
                .with_context(|| format!("histogram of {}", dir.display()))?;
            for (value, count) in hist.bins() {
                println!("{value}\t{count}");
            }
            Ok(())
        }
        Commands::Mock {
            dir,
            layers,
            points,
            seed,
        } => {
            let mut opts = mock::MockOptions {
                layers,
                points,
                ..Default::default()
            };
            if let Some(seed) = seed {
                opts.seed = seed;
            }
            let written = mock::write_mock_layers(&dir, &opts)?;
            println!("{} mock layers written to {}", written.len(), dir.display());
            Ok(())
        }
    }
}
