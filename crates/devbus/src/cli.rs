//! Clap derive structures for the `devbus` CLI.
//!
//! Defines the command tree, global flags, and shared value enums.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// devbus -- inspect connection specs and device properties
#[derive(Debug, Parser)]
#[command(
    name = "devbus",
    version,
    about = "Inspect devbus connection specs and device properties",
    long_about = "Command-line companion for devbus device servers.\n\n\
        Resolves TANGO_HOST-style connection specs, edits device properties\n\
        in a file database, and manages the shared configuration file.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (defaults to the platform config directory)
    #[arg(long, env = "DEVBUS_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "DEVBUS_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Parse a connection spec and show where requests would go
    Resolve(ResolveArgs),

    /// Read and edit device properties in a file database
    #[command(alias = "p")]
    Prop(PropArgs),

    /// Manage CLI configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Resolve ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ResolveArgs {
    /// Spec such as `db:10000` or `db1:10000,db2:10000`; falls back to the
    /// configured database, then TANGO_HOST
    pub spec: Option<String>,
}

// ── Properties ───────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct PropArgs {
    /// Resource file holding the properties (defaults to `file_database`)
    #[arg(long, short = 'f', global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: PropCommand,
}

#[derive(Debug, Subcommand)]
pub enum PropCommand {
    /// Show property values of a device
    Get {
        /// Device name (domain/family/member)
        device: String,
        /// Property names
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Set a property, replacing any previous values
    Put {
        /// Device name (domain/family/member)
        device: String,
        /// Property name
        name: String,
        /// New values
        #[arg(required = true)]
        values: Vec<String>,
    },

    /// Remove properties from a device
    #[command(alias = "rm")]
    Delete {
        /// Device name (domain/family/member)
        device: String,
        /// Property names
        #[arg(required = true)]
        names: Vec<String>,
    },
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration (file, environment and defaults)
    Show,

    /// Print the configuration file path
    Path,

    /// Write the effective configuration to the configuration file
    Init {
        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

// ── Completions ──────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
