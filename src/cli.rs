//! Command-line interface for ioc
//!
//! Uses clap with derive for type-safe CLI parsing. The CLI is a thin
//! shell: every subcommand maps onto one library operation.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// ioc - FreeBSD jail manager
#[derive(Parser)]
#[command(name = "ioc")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Activate a ZFS pool for ioc
    Activate {
        /// Pool name (e.g. zroot)
        pool: String,
    },

    /// Deactivate a ZFS pool
    Deactivate {
        /// Pool name
        pool: String,
    },

    /// Fetch a release from the distribution mirror
    Fetch {
        /// Release name (e.g. 13.2-RELEASE)
        release: String,

        /// Also download the lib32 distribution set
        #[arg(long)]
        lib32: bool,

        /// Fetch updates after extraction
        #[arg(long)]
        fetch_updates: bool,

        /// Apply fetched updates
        #[arg(long)]
        update: bool,

        /// Sync the ZFS basejail mirror datasets
        #[arg(long)]
        update_base: bool,
    },

    /// Update a fetched release to the latest patch level
    Update {
        /// Release name
        release: String,
    },

    /// Create a jail
    Create {
        /// Jail name
        name: String,

        /// Release to clone the root from
        #[arg(short, long)]
        release: Option<String>,

        /// Existing jail to clone instead of a release
        #[arg(long, conflicts_with = "release")]
        from_jail: Option<String>,

        /// Create an empty root dataset
        #[arg(long, conflicts_with_all = ["release", "from_jail"])]
        empty: bool,

        /// Initial config properties (key=value)
        #[arg(short = 'o', long = "option")]
        options: Vec<String>,
    },

    /// Start a jail
    Start {
        /// Jail name
        jail: String,

        /// Skip starting jails listed in depends
        #[arg(long)]
        no_depends: bool,
    },

    /// Stop a jail
    Stop {
        /// Jail name
        jail: String,

        /// Enforce teardown even when jail -r fails
        #[arg(short, long)]
        force: bool,
    },

    /// Restart a jail
    Restart {
        /// Jail name
        jail: String,
    },

    /// Destroy a jail and its datasets
    Destroy {
        /// Jail name
        jail: String,

        /// Stop the jail first if it is running
        #[arg(short, long)]
        force: bool,
    },

    /// Rename a stopped jail
    Rename {
        /// Current jail name
        jail: String,

        /// New jail name
        new_name: String,
    },

    /// List jails
    List,

    /// Execute a command inside a running jail
    Exec {
        /// Jail name
        jail: String,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Attach an interactive shell to a running jail
    Console {
        /// Jail name
        jail: String,
    },

    /// Get a config property (or all with no key)
    Get {
        /// Jail name
        jail: String,

        /// Property name
        key: Option<String>,
    },

    /// Set config properties
    Set {
        /// Jail name
        jail: String,

        /// Properties (key=value)
        #[arg(required = true)]
        properties: Vec<String>,
    },

    /// Export a jail to an archive or directory
    Export {
        /// Jail name
        jail: String,

        /// Destination path
        destination: PathBuf,

        /// Write a directory instead of a tar archive
        #[arg(long)]
        directory: bool,

        /// Export the full root dataset instead of a release delta
        #[arg(long)]
        standalone: bool,

        /// Include snapshots of exported datasets
        #[arg(short, long)]
        recursive: bool,
    },

    /// Import a jail from an exported archive or directory
    Import {
        /// Source path
        source: PathBuf,

        /// Name of the jail to create
        name: String,
    },

    /// Generate shell completions
    Completions {
        /// Target shell
        shell: Shell,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn print_completions(shell: Shell) {
        let mut command = Self::command();
        let name = command.get_name().to_string();
        clap_complete::generate(shell, &mut command, name, &mut std::io::stdout());
    }
}
