use std::env::consts::{ARCH, FAMILY, OS};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{info, trace};

use file_converter::cli::{run_cli, CliManager, WatchSession};
use file_converter::config::{AppConfig, ConfigError, DEFAULT_CONFIG_FILE};
use file_converter::conversion::ConverterRegistry;
use file_converter::logger::{init_logging, log_system_event};

/// Watch a folder tree and convert every new file
#[derive(Parser, Debug)]
#[command(name = "file_converter")]
#[command(version)]
struct Args {
    /// Configuration file, created with defaults when missing
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Watch the monitored folder without the interactive menu
    #[arg(short, long)]
    watch: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(ConfigError::NotFound(path)) => {
            eprintln!("No configuration found at {}, writing the defaults there", path);
            AppConfig::write_default(&args.config)?
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to load {}", args.config.display())),
    };

    let _logger = init_logging(&config.logging).context("Failed to initialize logging")?;
    log_system_information();
    log_system_event("startup", &format!("config {}", args.config.display()));

    let registry = Arc::new(ConverterRegistry::with_defaults());
    let interactive = CliManager::is_interactive_terminal();

    if args.watch || config.monitor_at_start {
        let root = config
            .monitored_dir
            .clone()
            .ok_or_else(|| anyhow!("watching needs `monitoredDir` in {}", args.config.display()))?;
        let session = WatchSession::start(&root, &config, registry.clone())?;

        let summary = if interactive {
            println!("Watching {}, press Enter to stop...", root.display());
            let mut buffer = String::new();
            io::stdin().read_line(&mut buffer)?;
            session.stop()?
        } else {
            session.wait()?
        };
        info!(
            dispatched = summary.jobs_dispatched,
            rejected = summary.jobs_rejected,
            "Watch session ended"
        );

        if args.watch {
            return Ok(());
        }
    }

    if !interactive {
        println!("Not running in an interactive terminal; use --watch to convert unattended.");
        return Ok(());
    }

    run_cli(config, &args.config, registry)?;
    log_system_event("shutdown", "menu closed");
    Ok(())
}

/// Logs important information about the system being used.
fn log_system_information() {
    trace!("Printing system information out into log for debug purposes...");
    trace!("ARCH:           \"{}\"", ARCH);
    trace!("FAMILY:         \"{}\"", FAMILY);
    trace!("OS:             \"{}\"", OS);
    trace!("CPUS:           \"{}\"", num_cpus::get());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["file_converter"]).unwrap();
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(!args.watch);
    }

    #[test]
    fn test_args_config_and_watch() {
        let args = Args::try_parse_from(["file_converter", "-c", "/etc/converter.json", "--watch"]).unwrap();
        assert_eq!(args.config, PathBuf::from("/etc/converter.json"));
        assert!(args.watch);
    }

    #[test]
    fn test_args_reject_unknown_flag() {
        assert!(Args::try_parse_from(["file_converter", "--bogus"]).is_err());
    }
}
