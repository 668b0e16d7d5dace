use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use slate_lib::default_bands;
use slate_lib::spectral::{band_power, welch_psd, WelchOptions};
use slate_task::{load_recording, Task, TaskConfig, TaskKind};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "slate",
    version,
    about = "Slate: EEG source-analysis pipeline"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum TaskArg {
    #[value(name = "resting-source-psd")]
    RestingSourcePsd,
    #[value(name = "source-analysis")]
    SourceAnalysis,
    #[value(name = "line-noise-check")]
    LineNoiseCheck,
}

impl From<TaskArg> for TaskKind {
    fn from(arg: TaskArg) -> Self {
        match arg {
            TaskArg::RestingSourcePsd => TaskKind::RestingSourcePsd,
            TaskArg::SourceAnalysis => TaskKind::SourceAnalysis,
            TaskArg::LineNoiseCheck => TaskKind::LineNoiseCheck,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a configured analysis task over one recording
    Run {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        input: PathBuf,
        /// Override the derivatives directory from the config
        #[arg(long)]
        out: Option<PathBuf>,
        /// Sampling rate in Hz for bare matrix inputs
        #[arg(long)]
        sfreq: Option<f64>,
    },
    /// Write a ready-to-edit configuration for a task
    InitConfig {
        #[arg(long)]
        task: TaskArg,
        /// Write to this path instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Describe an input recording
    Info {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        sfreq: Option<f64>,
    },
    /// Band powers of one channel
    Psd {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        channel: String,
        #[arg(long, default_value_t = 45.0)]
        fmax: f64,
        #[arg(long)]
        sfreq: Option<f64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            config,
            input,
            out,
            sfreq,
        } => cmd_run(&config, &input, out, sfreq)?,
        Commands::InitConfig { task, out } => cmd_init_config(task, out.as_deref())?,
        Commands::Info { input, sfreq } => cmd_info(&input, sfreq)?,
        Commands::Psd {
            input,
            channel,
            fmax,
            sfreq,
        } => cmd_psd(&input, &channel, fmax, sfreq)?,
    }
    Ok(())
}

#[derive(Serialize)]
struct RunSummary {
    task: &'static str,
    input: String,
    derivatives: String,
    manifest: String,
}

fn cmd_run(
    config_path: &Path,
    input: &Path,
    out: Option<PathBuf>,
    sfreq: Option<f64>,
) -> Result<()> {
    let mut config = TaskConfig::load(config_path)?;
    if let Some(out) = out {
        config.output.derivatives_dir = out;
    }
    let kind = config.task;
    let mut task = Task::new_with_rate(config, input, sfreq)?;
    task.run()?;
    let summary = RunSummary {
        task: kind.as_str(),
        input: input.display().to_string(),
        derivatives: task.derivatives_dir().display().to_string(),
        manifest: task.manifest_path().display().to_string(),
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn cmd_init_config(task: TaskArg, out: Option<&Path>) -> Result<()> {
    let config = slate_task::presets::default_config(task.into());
    let text = toml::to_string_pretty(&config)?;
    match out {
        Some(path) => std::fs::write(path, &text)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => print!("{text}"),
    }
    Ok(())
}

#[derive(Serialize)]
struct InputInfo {
    fs: f64,
    n_channels: usize,
    n_samples: usize,
    duration_s: f64,
    channels: Vec<String>,
}

fn cmd_info(input: &Path, sfreq: Option<f64>) -> Result<()> {
    let recording = load_recording(input, sfreq)?;
    let info = InputInfo {
        fs: recording.fs,
        n_channels: recording.n_channels(),
        n_samples: recording.n_samples(),
        duration_s: recording.duration(),
        channels: recording.channels,
    };
    println!("{}", serde_json::to_string(&info)?);
    Ok(())
}

#[derive(Serialize)]
struct BandPowerLine {
    band: String,
    lo: f64,
    hi: f64,
    power_uv2: f64,
}

#[derive(Serialize)]
struct PsdSummary {
    channel: String,
    fs: f64,
    fmax: f64,
    band_powers: Vec<BandPowerLine>,
}

fn cmd_psd(input: &Path, channel: &str, fmax: f64, sfreq: Option<f64>) -> Result<()> {
    let recording = load_recording(input, sfreq)?;
    let signal = recording.channel(channel).with_context(|| {
        format!(
            "channel {channel:?} not found; available: {}",
            recording.channels.join(", ")
        )
    })?;
    let psd = welch_psd(signal, recording.fs, &WelchOptions::default())?.crop(0.0, fmax);
    let band_powers = default_bands()
        .into_iter()
        .filter(|band| band.lo < fmax)
        .map(|band| BandPowerLine {
            power_uv2: band_power(&psd, band.lo, band.hi),
            band: band.name,
            lo: band.lo,
            hi: band.hi,
        })
        .collect();
    let summary = PsdSummary {
        channel: channel.to_string(),
        fs: recording.fs,
        fmax,
        band_powers,
    };
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
