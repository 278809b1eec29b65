/*!
 * Warden CLI - Command Line Interface
 *
 * `warden run` wires the engine together and serves admin commands read
 * from stdin, one JSON response line per command.
 */

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use warden::{
    error::{EXIT_FATAL, EXIT_STOPPED, EXIT_SUCCESS},
    logging, AdminInterface, CommandRemediation, NotificationFanout, RecoveryCoordinator,
    Remediation, SystemState, WardenConfig, WardenError, Watchdog,
};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about = "Fault-tolerance and recovery engine for long-running automation", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recovery engine and read admin commands from stdin
    ///
    /// Each line is a command such as `status`, `assign <id> <who>` or
    /// `system_pause "reason"`. `help` lists them. `quit` or end of input
    /// shuts down.
    Run {
        /// Configuration file (default: the platform config directory)
        #[arg(short, long, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Debug-level logging
        #[arg(short, long)]
        verbose: bool,
    },

    /// Write the default configuration as TOML
    InitConfig {
        /// Destination (default: the platform config directory)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Load and validate a configuration file
    CheckConfig {
        path: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<WardenError>()
                .map_or(EXIT_FATAL, WardenError::exit_code)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run { config, verbose } => {
            let mut config = load_config(config.as_deref())?;
            config.logging.verbose |= verbose;
            logging::init_logging(&config.logging)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start async runtime")?;
            runtime.block_on(serve(config))
        }
        Commands::InitConfig { path, force } => {
            let path = match path {
                Some(path) => path,
                None => WardenConfig::default_path()
                    .context("no platform config directory; pass a path")?,
            };
            init_config(&path, force)?;
            Ok(EXIT_SUCCESS)
        }
        Commands::CheckConfig { path } => {
            let config = load_config(Some(&path))?;
            println!("✓ {} is valid", path.display());
            println!(
                "  max attempts {}, breaker threshold {}, watchdog every {}s, {} watched component(s)",
                config.recovery.max_attempts,
                config.breaker.failure_threshold,
                config.watchdog.check_interval_s,
                config.watchdog.components.len()
            );
            Ok(EXIT_SUCCESS)
        }
    }
}

/// Explicit path, else the default location if it exists, else built-in defaults
fn load_config(path: Option<&Path>) -> anyhow::Result<WardenConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| WardenConfig::default_path().filter(|p| p.exists()));

    let config = match path {
        Some(path) => WardenConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WardenConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    WardenConfig::default().to_file(path)?;
    println!("✓ wrote default configuration to {}", path.display());
    Ok(())
}

async fn serve(config: WardenConfig) -> anyhow::Result<i32> {
    let fanout = Arc::new(
        NotificationFanout::from_config(&config.notifications)
            .context("failed to set up notification channels")?,
    );
    let coordinator = RecoveryCoordinator::from_config(&config, fanout.clone());

    let remediation: Arc<dyn Remediation> = Arc::new(CommandRemediation::new(&config.capabilities));
    coordinator.install_default_handlers(remediation.clone());

    let watchdog = Watchdog::new(config.watchdog.clone(), coordinator.clone())?;
    watchdog.register_builtin_checkers()?;
    watchdog.register_configured(&remediation)?;
    watchdog.start()?;

    // child of the coordinator token, so an emergency stop ends the loop too
    let shutdown = coordinator.cancellation_token().child_token();
    let sweeper = coordinator
        .queue()
        .spawn_sweeper(config.interventions.sweep_interval(), shutdown.clone());

    info!(
        channels = ?fanout.channel_names(),
        "🚀 Warden running, reading admin commands from stdin"
    );

    let admin = AdminInterface::new(coordinator.clone()).with_watchdog(watchdog.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => line.context("reading stdin")?,
        };
        let Some(line) = line else {
            debug!("end of input");
            break;
        };

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        if let Some(response) = admin.execute_line(line).await {
            println!("{}", serde_json::to_string(&response)?);
        }
    }

    shutdown.cancel();
    if let Err(e) = watchdog.stop().await {
        debug!(error = %e, "watchdog already stopped");
    }
    if let Err(e) = sweeper.await {
        warn!(error = %e, "intervention sweeper ended abnormally");
    }

    if coordinator.state() == SystemState::EmergencyStop {
        warn!("🛑 exiting after emergency stop");
        Ok(EXIT_STOPPED)
    } else {
        info!("👋 Warden stopped");
        Ok(EXIT_SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_subcommand() {
        let cli = Cli::try_parse_from(["warden", "run", "--config", "warden.toml", "-v"]).unwrap();
        match cli.command {
            Commands::Run { config, verbose } => {
                assert_eq!(config, Some(PathBuf::from("warden.toml")));
                assert!(verbose);
            }
            _ => panic!("Expected Run subcommand"),
        }
    }

    #[test]
    fn test_init_config_subcommand() {
        let cli = Cli::try_parse_from(["warden", "init-config", "out.toml", "--force"]).unwrap();
        match cli.command {
            Commands::InitConfig { path, force } => {
                assert_eq!(path, Some(PathBuf::from("out.toml")));
                assert!(force);
            }
            _ => panic!("Expected InitConfig subcommand"),
        }
    }

    #[test]
    fn test_init_then_check_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.toml");

        init_config(&path, false).unwrap();
        assert!(init_config(&path, false).is_err());
        init_config(&path, true).unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config, WardenConfig::default());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[recovery]\nhandler_timeout_secs = 0\n").unwrap();

        assert!(load_config(Some(&path)).is_err());
    }
}
