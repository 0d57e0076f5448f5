use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vz_bridge::apply::{apply_settings, ApplyReport, FeatureOutcome};
use vz_bridge::framework::simulated::{ReleaseProfile, SimConfiguration, SimulatedFramework};
use vz_bridge::settings::{load_settings, BridgeSettings};
use vz_bridge::{Availability, Bridge, CapabilityTable, Feature};

#[derive(Parser)]
#[command(name = "vzbridge", version, about = "Probe and apply private Virtualization.framework features")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print which private features the framework supports
    Probe {
        /// Probe a simulated release (macos11, macos12, macos13, latest) instead of the host
        #[arg(long, env = "VZBRIDGE_SIMULATE")]
        simulate: Option<ReleaseProfile>,
        /// Emit the capability table as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load a settings file and apply it to a fresh configuration
    Check {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, env = "VZBRIDGE_SIMULATE")]
        simulate: Option<ReleaseProfile>,
        /// Emit the apply report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the version
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Probe { simulate, json } => cmd_probe(simulate, json)?,
        Command::Check {
            file,
            simulate,
            json,
        } => cmd_check(&file, simulate, json)?,
        Command::Version => println!("vzbridge {}", env!("CARGO_PKG_VERSION")),
    }

    Ok(())
}

/// Simulated profile to use, or `None` for the live framework.
#[cfg(target_os = "macos")]
fn simulated_profile(requested: Option<ReleaseProfile>) -> Option<ReleaseProfile> {
    requested
}

#[cfg(not(target_os = "macos"))]
fn simulated_profile(requested: Option<ReleaseProfile>) -> Option<ReleaseProfile> {
    Some(requested.unwrap_or(ReleaseProfile::Latest))
}

fn cmd_probe(simulate: Option<ReleaseProfile>, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let table = match simulated_profile(simulate) {
        Some(profile) => {
            info!("probing simulated framework ({})", profile);
            CapabilityTable::resolve(&SimulatedFramework::profile(profile))
        }
        None => native::capabilities()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("framework: {}", table.version());
    for (feature, availability) in table.iter() {
        let status = match availability {
            Availability::Available => "available".to_string(),
            Availability::Unavailable { missing } => format!("unavailable ({})", missing.join(", ")),
            Availability::Inconclusive { reason } => format!("inconclusive ({})", reason),
        };
        println!("  {:<28} {}", feature.to_string(), status);
    }
    Ok(())
}

fn cmd_check(
    file: &std::path::Path,
    simulate: Option<ReleaseProfile>,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let settings = load_settings(file)?;
    let report = match simulated_profile(simulate) {
        Some(profile) => check_simulated(profile, &settings)?,
        None => native::check(&settings)?,
    };
    print_report(&report, json)
}

fn check_simulated(
    profile: ReleaseProfile,
    settings: &BridgeSettings,
) -> Result<ApplyReport, Box<dyn std::error::Error>> {
    let framework = SimulatedFramework::profile(profile);
    let bridge = Bridge::new(&framework);

    let mut config = SimConfiguration::new();
    let loader = match framework.mac_os_boot_loader() {
        Ok(loader) => loader,
        Err(e) => {
            warn!("{}; using the Linux boot loader", e);
            framework.linux_boot_loader()
        }
    };
    config.set_boot_loader(loader)?;

    let report = apply_settings(&bridge, &mut config, settings)?;
    let vm = framework.instantiate(&mut config)?;
    info!(
        "simulated VM instantiated: rom={:?} debug_port={:?} serial={:?}",
        vm.rom.as_ref().map(|rom| rom.to_string()),
        vm.debug_port,
        vm.serial_transports
    );
    Ok(report)
}

fn print_report(report: &ApplyReport, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("framework: {}", report.framework_version);
    for feature in Feature::ALL {
        let outcome = match report.outcome(feature) {
            FeatureOutcome::NotRequested => "not requested".to_string(),
            FeatureOutcome::Applied => "applied".to_string(),
            FeatureOutcome::Skipped { reason } => format!("skipped ({})", reason),
        };
        println!("  {:<28} {}", feature.to_string(), outcome);
    }
    for (entry, index) in report.serial_ports.iter().enumerate() {
        match index {
            Some(index) => println!("  serial_ports[{}] -> port {}", entry, index),
            None => println!("  serial_ports[{}] skipped", entry),
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
mod native {
    use vz_bridge::apply::{apply_settings, ApplyReport};
    use vz_bridge::settings::BridgeSettings;
    use vz_bridge::{CapabilityTable, VzBootLoader, VzConfiguration, VzFramework};

    pub fn capabilities() -> Result<CapabilityTable, Box<dyn std::error::Error>> {
        Ok(VzFramework::new().capabilities())
    }

    /// Apply onto a live configuration. The configuration is not instantiated.
    pub fn check(settings: &BridgeSettings) -> Result<ApplyReport, Box<dyn std::error::Error>> {
        let framework = VzFramework::new();
        let bridge = framework.bridge();
        let mut config = VzConfiguration::new();
        config.set_boot_loader(VzBootLoader::mac_os()?)?;
        Ok(apply_settings(&bridge, &mut config, settings)?)
    }
}

#[cfg(not(target_os = "macos"))]
mod native {
    use vz_bridge::apply::ApplyReport;
    use vz_bridge::settings::BridgeSettings;
    use vz_bridge::CapabilityTable;

    const UNAVAILABLE: &str = "the live framework is only available on macOS; pass --simulate";

    pub fn capabilities() -> Result<CapabilityTable, Box<dyn std::error::Error>> {
        Err(UNAVAILABLE.into())
    }

    pub fn check(_settings: &BridgeSettings) -> Result<ApplyReport, Box<dyn std::error::Error>> {
        Err(UNAVAILABLE.into())
    }
}
