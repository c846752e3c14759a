//! Hushline device key store administration.
//!
//! # Usage
//!
//! ```bash
//! # Create identity and pre-keys
//! hushline --store alice.redb --store-key alice.key init
//!
//! # Hex CBOR upload for the key directory
//! hushline --store alice.redb --store-key alice.key bundle
//!
//! # Encrypted backup; prints the recovery phrase
//! hushline --store alice.redb --store-key alice.key backup --out alice.backup
//! ```

use std::{io, path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod error;

use commands::Device;
use error::CliError;

/// Hushline key store administration
#[derive(Parser, Debug)]
#[command(name = "hushline")]
#[command(about = "Manage the identity, pre-keys and backups of a Hushline device")]
#[command(version)]
struct Args {
    /// Path to the key store database
    #[arg(long, default_value = "hushline.redb")]
    store: PathBuf,

    /// Path to the store encryption key (created if missing)
    #[arg(long, default_value = "hushline.key")]
    store_key: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the identity, a signed pre-key and one-time pre-keys
    Init {
        /// One-time pre-keys to hold unused
        #[arg(long, default_value = "100")]
        one_time: u32,
    },

    /// Print the key directory upload (hex-encoded CBOR)
    Bundle,

    /// Rotate the signed pre-key and replenish one-time pre-keys when due
    Maintain {
        /// One-time pre-keys the directory reports as remaining
        #[arg(long)]
        directory_available: Option<usize>,
    },

    /// Write an encrypted backup and print its recovery phrase
    Backup {
        /// Output file
        #[arg(long)]
        out: PathBuf,
    },

    /// Restore an encrypted backup into the store
    Restore {
        /// Backup file
        #[arg(long)]
        input: PathBuf,

        /// The 24-word recovery phrase
        #[arg(long)]
        phrase: String,
    },

    /// Summarize the key store
    Status,
}

fn run(args: Args) -> Result<(), CliError> {
    let device = Device::open(&args.store, &args.store_key)?;
    let mut out = io::stdout().lock();

    match args.command {
        Command::Init { one_time } => device.init(one_time, &mut out),
        Command::Bundle => device.bundle(&mut out),
        Command::Maintain { directory_available } => device.maintain(directory_available, &mut out),
        Command::Backup { out: path } => device.backup(&path, &mut out),
        Command::Restore { input, phrase } => device.restore(&input, &phrase, &mut out),
        Command::Status => device.status(&mut out),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::registry().with(fmt::layer().with_writer(io::stderr)).with(filter).init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        },
    }
}
