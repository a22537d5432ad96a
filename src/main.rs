use anyhow::{Context, Result};
use audioshield::app::{self, CodeDelivery};
use audioshield::audio::capture::{list_devices, suppress_audio_warnings};
use audioshield::cli::{Cli, Commands, ConfigAction};
use audioshield::config::Config;
use clap::{CommandFactory, Parser};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose);
    tracing::debug!(version = %audioshield::version_string(), "starting");

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        std::process::exit(1);
    }
    // Pending prompt readers would otherwise keep the runtime alive.
    std::process::exit(0);
}

/// Diagnostics go through tracing; `RUST_LOG` overrides the verbosity flags.
fn init_tracing(quiet: bool, verbose: u8) {
    let default = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "audioshield=debug,info",
        (false, _) => "audioshield=trace,debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Enroll { existing, email } => {
            suppress_audio_warnings();
            let config = load_config(cli.config.as_deref(), cli.device)?;
            app::run_enroll(&config, existing, email, cli.quiet).await?;
        }
        Commands::SignIn {
            email,
            console_code,
        } => {
            suppress_audio_warnings();
            let config = load_config(cli.config.as_deref(), cli.device)?;
            let delivery = if console_code {
                CodeDelivery::Console
            } else {
                CodeDelivery::Email
            };
            let outcome = app::run_sign_in(&config, email, delivery, cli.quiet).await?;
            if !outcome.is_authenticated() {
                std::process::exit(1);
            }
        }
        Commands::Detect { file, json } => {
            let config = load_config(cli.config.as_deref(), cli.device)?;
            let result = app::run_detect(&config, &file, json)
                .await
                .with_context(|| format!("liveness check of {}", file.display()))?;
            if !result.is_genuine() {
                std::process::exit(1);
            }
        }
        Commands::Phrase { words } => {
            let config = load_config(cli.config.as_deref(), cli.device)?;
            app::run_phrase(&config, words);
        }
        Commands::Devices => {
            suppress_audio_warnings();
            list_audio_devices()?;
        }
        Commands::ResetPassword { email } => {
            let config = load_config(cli.config.as_deref(), cli.device)?;
            app::run_reset_password(&config, email).await?;
        }
        Commands::DeleteAccount { email, yes } => {
            suppress_audio_warnings();
            let config = load_config(cli.config.as_deref(), cli.device)?;
            app::run_delete_account(&config, email, yes).await?;
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(
                shell,
                &mut Cli::command(),
                "audioshield",
                &mut std::io::stdout(),
            );
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config), which must exist
/// 2. Default config path (~/.config/audioshield/config.toml)
/// 3. Built-in defaults
///
/// Environment overrides and `--device` are applied on top, then validated.
fn load_config(custom_path: Option<&Path>, device: Option<String>) -> Result<Config> {
    let mut config = match custom_path {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(&Config::default_path()?)?,
    }
    .with_env_overrides();

    if device.is_some() {
        config.audio.device = device;
    }
    config.validate()?;
    Ok(config)
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Handle configuration commands.
fn handle_config_command(action: ConfigAction, custom_path: Option<&Path>) -> Result<()> {
    let config_path = match custom_path {
        Some(path) => PathBuf::from(path),
        None => Config::default_path()?,
    };

    match action {
        ConfigAction::Path => {
            println!("{}", config_path.display());
            if !config_path.exists() {
                eprintln!("{}", "(file does not exist; defaults are in use)".dimmed());
            }
        }
        ConfigAction::Show => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            print!("{}", config.to_redacted_toml()?);
        }
    }
    Ok(())
}
