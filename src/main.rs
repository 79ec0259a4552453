//! CLI entry point for rust_fgen
//!
//! Every subcommand opens a session, runs one operation and prints the
//! instrument's error report. Connection settings come from the configuration
//! file (`config/fgen.toml` by default) and `RUST_FGEN_*` environment
//! variables.
//!
//! # Usage
//!
//! ```bash
//! rust_fgen idn
//! rust_fgen pulse --channel 1 --duty-cycle 10 --frequency 100
//! rust_fgen upload stim.csv --name ramp --rate 1e6
//! rust_fgen voltage 0.98 --channel 2 --confirm
//! rust_fgen --mock list --json
//! ```
//!
//! Operation options can also be given as a TOML file with `--options`, using
//! the option names of the library (`duty_cycle`, `repetition_frequency`, ...).

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use rust_fgen::config::{FgenConfig, DEFAULT_CONFIG_PATH};
use rust_fgen::error_monitor::ErrorReport;
use rust_fgen::options::{
    parse_options, LoadWaveformOptions, ModulationOptions, OperationOptions, PulseOptions,
    StateOptions, TriggerOptions, TriggerSource, UploadOptions,
};
use rust_fgen::transport::{MockFunctionGenerator, TcpTransport, Transport};
use rust_fgen::{logging, Channel, Session, VoltageOutcome};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "rust_fgen")]
#[command(about = "Function generator control over a SCPI socket", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run against the simulated instrument instead of the network
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ChannelArgs {
    /// Channels to act on
    #[arg(long, value_delimiter = ',', default_values_t = [1u8, 2])]
    channels: Vec<u8>,
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceArg {
    External,
    Bus,
    Timer,
}

impl From<SourceArg> for TriggerSource {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::External => TriggerSource::External,
            SourceArg::Bus => TriggerSource::Bus,
            SourceArg::Timer => TriggerSource::Timer,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the instrument identity
    Idn,

    /// Idle sine on both channels, outputs off, volatile memory cleared
    Reset,

    /// Enable outputs
    Go(ChannelArgs),

    /// Disable outputs and send a trigger
    Stop(ChannelArgs),

    /// Send a software trigger
    Trigger,

    /// Configure a pulse train (give exactly two timing values)
    Pulse {
        #[arg(long, default_value_t = 1)]
        channel: u8,
        /// Duty cycle in percent
        #[arg(long)]
        duty_cycle: Option<f64>,
        /// Pulse duration in milliseconds
        #[arg(long)]
        duration: Option<f64>,
        /// Repetition frequency in Hz
        #[arg(long)]
        frequency: Option<f64>,
        #[arg(long, default_value_t = 0.1)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
        /// TOML file with pulse options; replaces the flags above
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Amplitude-modulate one channel by the other
    Modulate {
        /// Channel providing the modulating signal
        #[arg(long, default_value_t = 1)]
        modulating_channel: u8,
        /// Depth in percent
        #[arg(long, default_value_t = 100.0)]
        depth: f64,
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Arm single-cycle triggered bursts
    Burst {
        #[command(flatten)]
        channels: ChannelArgs,
        #[arg(long, value_enum, default_value_t = SourceArg::External)]
        source: SourceArg,
        /// Timer period in seconds for the timer source
        #[arg(long, default_value_t = 1.0)]
        timer_interval: f64,
        #[arg(long)]
        options: Option<PathBuf>,
    },

    /// Upload samples from a CSV file as an arbitrary waveform
    Upload {
        /// CSV file; the last column of each row is used
        csv: PathBuf,
        #[arg(long)]
        name: String,
        /// Sample rate in samples per second
        #[arg(long)]
        rate: f64,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        #[arg(long, default_value_t = 0.1)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
        #[arg(long)]
        folder: Option<String>,
        /// Keep the waveform in volatile memory only
        #[arg(long)]
        no_persist: bool,
    },

    /// Load a stored waveform
    Load {
        name: String,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        #[arg(long, default_value_t = 0.1)]
        amplitude: f64,
        #[arg(long, default_value_t = 0.0)]
        offset: f64,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long)]
        sample_rate: Option<f64>,
    },

    /// Recall a stored instrument state
    LoadState {
        name: String,
        #[arg(long)]
        folder: Option<String>,
    },

    /// Save the instrument state
    StoreState {
        name: String,
        #[arg(long)]
        folder: Option<String>,
    },

    /// Change a channel's amplitude
    Voltage {
        volts: f64,
        #[arg(long, default_value_t = 1)]
        channel: u8,
        /// Apply even above the safety threshold
        #[arg(long)]
        confirm: bool,
    },

    /// Clear a channel's volatile memory
    Clear {
        #[arg(long, default_value_t = 1)]
        channel: u8,
    },

    /// List stored waveforms
    List {
        #[arg(long)]
        folder: Option<String>,
        /// Print the names as a JSON array
        #[arg(long)]
        json: bool,
    },

    /// Check whether a waveform is in volatile memory
    Resident {
        name: String,
        #[arg(long, default_value_t = 1)]
        channel: u8,
    },

    /// Crest factor of a resident waveform
    CrestFactor {
        name: String,
        #[arg(long, default_value_t = 1)]
        channel: u8,
    },

    /// Peak-to-peak of a resident waveform
    PeakToPeak {
        name: String,
        #[arg(long, default_value_t = 1)]
        channel: u8,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = FgenConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let capacity = config.buffers.default_bytes;
    if cli.mock {
        let transport = MockFunctionGenerator::with_capacity(capacity);
        run(transport, config, cli.command).await
    } else {
        let transport = TcpTransport::from_config(&config.connection, capacity)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to {}:{}",
                    config.connection.host, config.connection.port
                )
            })?;
        run(transport, config, cli.command).await
    }
}

async fn run<T: Transport>(transport: T, config: FgenConfig, command: Commands) -> Result<()> {
    let mut session = Session::open(transport, config).await?;

    match command {
        Commands::Idn => println!("{}", session.identity()),
        Commands::Reset => report(session.reset().await?),
        Commands::Go(args) => report(session.go(&channels(&args.channels)?).await?),
        Commands::Stop(args) => report(session.stop(&channels(&args.channels)?).await?),
        Commands::Trigger => report(session.trigger().await?),
        Commands::Pulse {
            channel,
            duty_cycle,
            duration,
            frequency,
            amplitude,
            offset,
            options,
        } => {
            let opts = resolve(options.as_deref(), || {
                Ok(PulseOptions {
                    channel: channel_from(channel)?,
                    duty_cycle,
                    duration,
                    repetition_frequency: frequency,
                    amplitude,
                    offset,
                })
            })?;
            report(session.configure_pulse(&opts).await?);
        }
        Commands::Modulate {
            modulating_channel,
            depth,
            options,
        } => {
            let opts = resolve(options.as_deref(), || {
                Ok(ModulationOptions {
                    modulating_channel: channel_from(modulating_channel)?,
                    depth,
                })
            })?;
            report(session.configure_modulation(&opts).await?);
        }
        Commands::Burst {
            channels: args,
            source,
            timer_interval,
            options,
        } => {
            let opts = resolve(options.as_deref(), || {
                Ok(TriggerOptions {
                    channels: channels(&args.channels)?,
                    source: source.into(),
                    timer_interval,
                })
            })?;
            report(session.configure_trigger(&opts).await?);
        }
        Commands::Upload {
            csv,
            name,
            rate,
            channel,
            amplitude,
            offset,
            folder,
            no_persist,
        } => {
            let samples = read_samples(&csv)?;
            println!("Read {} samples from {}", samples.len(), csv.display());
            let opts = UploadOptions {
                channel: channel_from(channel)?,
                amplitude,
                offset,
                folder,
                persist: !no_persist,
            };
            report(session.upload_waveform(&name, samples, rate, &opts).await?);
        }
        Commands::Load {
            name,
            channel,
            amplitude,
            offset,
            folder,
            sample_rate,
        } => {
            let opts = LoadWaveformOptions {
                channel: channel_from(channel)?,
                amplitude,
                offset,
                folder,
                sample_rate,
            };
            report(session.load_waveform(&name, &opts).await?);
        }
        Commands::LoadState { name, folder } => {
            report(session.load_state(&name, &StateOptions { folder }).await?)
        }
        Commands::StoreState { name, folder } => {
            report(session.store_state(&name, &StateOptions { folder }).await?)
        }
        Commands::Voltage {
            volts,
            channel,
            confirm,
        } => match session.change_voltage(channel_from(channel)?, volts).await? {
            VoltageOutcome::Applied(errors) => report(errors),
            VoltageOutcome::ConfirmationRequired(pending) if confirm => {
                report(session.confirm_voltage(pending).await?)
            }
            outcome @ VoltageOutcome::ConfirmationRequired(_) => {
                eprintln!("Not applied; rerun with --confirm to override the safety threshold");
                outcome.into_applied()?;
            }
        },
        Commands::Clear { channel } => report(session.clear_memory(channel_from(channel)?).await?),
        Commands::List { folder, json } => {
            let names = session.list_waveforms(folder.as_deref()).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&names)?);
            } else {
                for name in names {
                    println!("{}", name);
                }
            }
        }
        Commands::Resident { name, channel } => {
            let resident = session.is_resident(channel_from(channel)?, &name).await?;
            println!("{}", resident);
        }
        Commands::CrestFactor { name, channel } => {
            print_attribute(session.crest_factor(channel_from(channel)?, &name).await?)
        }
        Commands::PeakToPeak { name, channel } => {
            print_attribute(session.peak_to_peak(channel_from(channel)?, &name).await?)
        }
    }

    Ok(())
}

fn report(errors: ErrorReport) {
    if errors.had_error() {
        eprintln!("⚠️  Instrument reported: {}", errors);
    } else {
        println!("✅ Done");
    }
}

fn print_attribute(value: Option<f64>) {
    match value {
        Some(value) => println!("{}", value),
        None => eprintln!("⚠️  Waveform is not resident; load it first"),
    }
}

fn channel_from(number: u8) -> Result<Channel> {
    Channel::try_from(number).map_err(anyhow::Error::msg)
}

fn channels(numbers: &[u8]) -> Result<Vec<Channel>> {
    let mut selected: Vec<Channel> = numbers
        .iter()
        .map(|&n| channel_from(n))
        .collect::<Result<_>>()?;
    selected.sort();
    selected.dedup();
    Ok(selected)
}

/// Options from a TOML file when one is given, otherwise from the flags.
fn resolve<T, F>(file: Option<&Path>, from_flags: F) -> Result<T>
where
    T: DeserializeOwned + OperationOptions,
    F: FnOnce() -> Result<T>,
{
    match file {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read options file {}", path.display()))?;
            Ok(parse_options(&text)?)
        }
        None => from_flags(),
    }
}

/// Read one sample per CSV row from the last column. A first row that does
/// not parse as a number is taken as a header.
fn read_samples(path: &Path) -> Result<Vec<f64>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut samples = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let Some(field) = record.iter().last() else {
            continue;
        };
        match field.parse::<f64>() {
            Ok(value) => samples.push(value),
            Err(_) if row == 0 => continue,
            Err(_) => bail!("Row {} of {}: '{}' is not a number", row + 1, path.display(), field),
        }
    }
    Ok(samples)
}
