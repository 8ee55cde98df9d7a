mod archive;
mod auxiliary;
mod config;
mod convert;
mod discovery;
mod error;
mod loader;
mod logging;
mod mib;
mod params;
mod preview;
mod sidecar;
mod signal;
mod zarr;

use clap::{ArgAction, Parser};
use log::info;

use crate::logging::LogConfig;

#[derive(Parser)]
#[command(
    name = "mib2zarr",
    version,
    about = "Convert Merlin MIB 4D-STEM acquisitions to zspy (zarr) stores"
)]
struct Cli {
    #[command(flatten)]
    convert: convert::ConvertArgs,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn progress(fraction: f64, message: &str) {
    info!("[{:>3.0}%] {}", fraction * 100.0, message);
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    LogConfig::from_verbosity(cli.verbose).init();
    convert::run(cli.convert, progress)?;
    Ok(())
}
