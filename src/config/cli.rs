use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the Verdant binary.
#[derive(Debug, Parser)]
#[command(name = "verdant", version, about = "Verdant published-content tree server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "VERDANT_CONFIG_FILE", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve the published tree over HTTP.
    Serve(Box<ServeArgs>),
    /// Rebuild the whole tree from the database and write the snapshot file.
    #[command(name = "republish")]
    Republish(RepublishArgs),
    /// Re-publish one node and everything below it.
    #[command(name = "republish-subtree")]
    RepublishSubtree(RepublishSubtreeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheOverrides {
    /// Override the snapshot file location.
    #[arg(long = "cache-snapshot-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub snapshot_path: Option<PathBuf>,

    /// Toggle the snapshot file entirely.
    #[arg(
        long = "cache-disk-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub disk_cache_enabled: Option<bool>,

    /// Toggle writing the snapshot file after changes.
    #[arg(
        long = "cache-persist-changes",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub persist_changes: Option<bool>,

    /// Toggle watching the snapshot file for writes from other processes.
    #[arg(
        long = "cache-check-disk-changes",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub check_disk_changes: Option<bool>,

    /// Override the minimum spacing between snapshot file checks.
    #[arg(long = "cache-staleness-check-interval-ms", value_name = "MILLIS")]
    pub staleness_check_interval_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RepublishArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RepublishSubtreeArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    #[command(flatten)]
    pub cache: CacheOverrides,

    /// Id of the subtree's top node.
    #[arg(value_name = "ID")]
    pub id: i64,
}
