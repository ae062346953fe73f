//! CLI Entry Point for dataset-tool
//!
//! Provides command-line access to stored data sets:
//! - Inspecting a stored data set (arrays, shapes, metadata keys)
//! - Converting a data set between formatters
//! - Recording a demo sweep against a mock instrument
//!
//! # Usage
//!
//! ```bash
//! dataset-tool info 2024-05-01/#001_sweep_12-00-00 --format hdf5
//! dataset-tool convert 2024-05-01/#001_sweep_12-00-00 --from hdf5 --to gnuplot --dest exported/sweep
//! dataset-tool demo --points 21
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daq_dataset::config::Settings;
use daq_dataset::data::dataset::{load_data, DataSet, DataSetBuilder};
use daq_dataset::formatter::{FormatterRegistry, WriteOptions};
use daq_dataset::logging;
use daq_dataset::testing::{sweep_1d, MockParabola};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "dataset-tool")]
#[command(about = "Inspect and convert stored measurement data sets", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    /// Base directory overriding the configured one
    #[arg(long, global = true)]
    base: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the arrays and metadata keys of a stored data set
    Info {
        /// Location relative to the configured base location
        location: String,
        /// Formatter the data set was written with (defaults to the configured one)
        #[arg(long)]
        format: Option<String>,
    },

    /// Read a data set with one formatter and write it with another
    Convert {
        /// Source location
        source: String,
        /// Destination location (defaults to `<source>_<to>`)
        #[arg(long)]
        dest: Option<String>,
        /// Source formatter
        #[arg(long, default_value = "hdf5")]
        from: String,
        /// Destination formatter
        #[arg(long, default_value = "gnuplot")]
        to: String,
        /// Replace an existing destination
        #[arg(long)]
        overwrite: bool,
    },

    /// Record a 1D sweep of a mock parabola into a new location
    Demo {
        /// Number of sweep points
        #[arg(long, default_value = "11")]
        points: usize,
        /// Name used in the generated location
        #[arg(long, default_value = "demo_sweep")]
        name: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(base) = cli.base {
        settings.storage.base_location = base;
    }
    settings.validate()?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Info { location, format } => show_info(&settings, &location, format),
        Commands::Convert {
            source,
            dest,
            from,
            to,
            overwrite,
        } => {
            let dest = dest.unwrap_or_else(|| format!("{source}_{to}"));
            convert(&settings, &source, &dest, &from, &to, overwrite)
        }
        Commands::Demo { points, name } => run_demo(&settings, points, &name),
    }
}

fn show_info(settings: &Settings, location: &str, format: Option<String>) -> Result<()> {
    let format = format.unwrap_or_else(|| settings.storage.default_formatter.clone());
    let formatter = FormatterRegistry::new().create(&format)?;
    let data_set = load_data(location, formatter, Arc::new(settings.disk_io()))
        .with_context(|| format!("reading {location} as {format}"))?;

    println!("DataSet: {location} ({format})");
    for (id, array) in data_set.arrays() {
        let array = array.read();
        let marker = if array.is_setpoint() { " (setpoint)" } else { "" };
        println!(
            "   {id:<20} {:?}  label={:?} units={:?} set_arrays={:?}{marker}",
            array.shape(),
            array.label(),
            array.units(),
            array.set_arrays()
        );
    }
    println!("   complete: {:.1}%", data_set.fraction_complete() * 100.0);
    println!("   metadata:");
    println!("{}", serde_json::to_string_pretty(data_set.metadata())?);
    Ok(())
}

fn convert(
    settings: &Settings,
    source: &str,
    dest: &str,
    from: &str,
    to: &str,
    overwrite: bool,
) -> Result<()> {
    let registry = FormatterRegistry::new();
    let io = Arc::new(settings.disk_io());
    let input = load_data(source, registry.create(from)?, io.clone())
        .with_context(|| format!("reading {source} as {from}"))?;

    let arrays = input.arrays().values().map(|array| {
        let mut array = array.read().clone();
        array.clear_save();
        array
    });
    let mut output: DataSet = DataSet::builder()
        .arrays(arrays)
        .location(dest)
        .overwrite(overwrite)
        .io(io)
        .formatter(registry.create(to)?)
        .metadata(input.metadata().clone())
        .build()?;

    output.snapshot();
    output
        .write_with(WriteOptions::default().forced().incomplete())
        .with_context(|| format!("writing {dest} as {to}"))?;
    output.finalize()?;
    info!(source, dest, from, to, "converted data set");
    Ok(())
}

fn run_demo(settings: &Settings, points: usize, name: &str) -> Result<()> {
    let parabola = MockParabola::new();
    parabola.y.set(0.5)?;
    let step = if points > 1 { 2.0 / (points - 1) as f64 } else { 0.0 };
    let xs: Vec<f64> = (0..points).map(|i| -1.0 + step * i as f64).collect();

    let builder = DataSetBuilder::from_settings(settings)?.name(name);
    let data_set = sweep_1d(&parabola, &xs, builder)?;
    println!(
        "Recorded {points} points to {}",
        data_set.location().unwrap_or_default()
    );
    Ok(())
}
