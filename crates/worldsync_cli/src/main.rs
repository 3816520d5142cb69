//! WorldSync CLI
//!
//! Command-line tools for backing up and sharing game saves.
//!
//! # Commands
//!
//! - `worlds` - List local saves
//! - `snapshot` - Build and print a snapshot of a save
//! - `push` / `pull` / `sync` - Run one sync job against a remote directory
//! - `resolve` - Settle a conflict by keeping one side
//! - `history` - Print the local commit log of a save
//! - `config` - Show or change the stored profile

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use worldsync_sync_engine::{ConflictSide, Direction};

/// WorldSync command-line tools.
#[derive(Parser)]
#[command(name = "worldsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory for the commit log, blob cache and profile
    #[arg(global = true, long)]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List local saves
    Worlds {
        /// Saves directory (defaults to the game's)
        #[arg(long)]
        saves: Option<PathBuf>,
    },

    /// Build and print a snapshot of a save
    Snapshot {
        /// Save directory
        path: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Record local changes and upload them
    Push(SyncArgs),

    /// Download remote commits into the save
    Pull(SyncArgs),

    /// Push or pull, whichever applies without conflict
    Sync(SyncArgs),

    /// Settle a conflict by keeping one side
    Resolve {
        /// Save directory
        path: PathBuf,

        /// Remote directory
        #[arg(short, long)]
        remote: PathBuf,

        /// Side to keep
        #[arg(short, long, value_enum)]
        keep: Side,
    },

    /// Print the local commit log of a save
    History {
        /// Save directory
        path: PathBuf,

        /// Maximum number of commits to print
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show or change the stored profile
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show version information
    Version,
}

#[derive(clap::Args)]
struct SyncArgs {
    /// Save directory
    path: PathBuf,

    /// Remote directory
    #[arg(short, long)]
    remote: PathBuf,

    /// Commit message
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Side {
    Local,
    Remote,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the profile (secrets are masked)
    Show,

    /// Change profile fields
    Set {
        /// Display name used as commit author
        #[arg(long)]
        username: Option<String>,

        /// Avatar id
        #[arg(long)]
        avatar: Option<String>,

        /// Remote client id
        #[arg(long)]
        client_id: Option<String>,

        /// Remote client secret
        #[arg(long)]
        client_secret: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state_dir = cli.state_dir.unwrap_or_else(commands::default_state_dir);

    match cli.command {
        Commands::Worlds { saves } => commands::worlds::run(saves)?,
        Commands::Snapshot { path, format } => commands::snapshot::run(&path, &format)?,
        Commands::Push(args) => {
            commands::sync::run(&state_dir, &args.path, &args.remote, Direction::Push, args.message)?
        }
        Commands::Pull(args) => {
            commands::sync::run(&state_dir, &args.path, &args.remote, Direction::Pull, args.message)?
        }
        Commands::Sync(args) => {
            commands::sync::run(&state_dir, &args.path, &args.remote, Direction::Auto, args.message)?
        }
        Commands::Resolve { path, remote, keep } => {
            let side = match keep {
                Side::Local => ConflictSide::KeepLocal,
                Side::Remote => ConflictSide::KeepRemote,
            };
            commands::sync::resolve(&state_dir, &path, &remote, side)?;
        }
        Commands::History { path, limit } => commands::history::run(&state_dir, &path, limit)?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config::show(&state_dir)?,
            ConfigAction::Set {
                username,
                avatar,
                client_id,
                client_secret,
            } => commands::config::set(
                &state_dir,
                commands::config::Changes {
                    username,
                    avatar_id: avatar,
                    client_id,
                    client_secret,
                },
            )?,
        },
        Commands::Version => {
            println!("WorldSync CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("Manifest format v{}", worldsync_core::MANIFEST_VERSION);
        }
    }

    Ok(())
}
