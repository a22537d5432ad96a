//! Command-line interface for audioshield
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Multi-factor voice authentication
#[derive(Parser, Debug)]
#[command(
    name = "audioshield",
    version,
    about = "Multi-factor voice authentication: password, voiceprint, liveness and one-time code"
)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Suppress progress output (quiet mode)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug logs, -vv: trace logs)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Audio input device (overrides audio.device)
    #[arg(long, global = true, value_name = "DEVICE")]
    pub device: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an account (or sign in to one) and enroll a voiceprint
    Enroll {
        /// Sign in to an existing account instead of creating one
        #[arg(long)]
        existing: bool,

        /// Account email (prompted if omitted)
        #[arg(long, value_name = "EMAIL")]
        email: Option<String>,
    },

    /// Sign in with password, voice and an emailed code
    SignIn {
        /// Account email (prompted if omitted)
        #[arg(long, value_name = "EMAIL")]
        email: Option<String>,

        /// Print the one-time code to the terminal instead of emailing it
        #[arg(long)]
        console_code: bool,
    },

    /// Run the liveness check on a WAV file
    Detect {
        /// WAV file to classify
        file: PathBuf,

        /// Print the result as JSON on stdout
        #[arg(long)]
        json: bool,
    },

    /// Print a fresh challenge phrase
    Phrase {
        /// Number of words (default: challenge.word_count)
        #[arg(long, short = 'n', value_name = "N")]
        words: Option<usize>,
    },

    /// List available audio input devices
    Devices,

    /// Email a password-reset link
    ResetPassword {
        /// Account email (prompted if omitted)
        #[arg(long, value_name = "EMAIL")]
        email: Option<String>,
    },

    /// Delete the account and everything stored for it
    DeleteAccount {
        /// Account email (prompted if omitted)
        #[arg(long, value_name = "EMAIL")]
        email: Option<String>,

        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration inspection actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the configuration file path
    Path,
    /// Print the effective configuration with secrets masked
    Show,
}
