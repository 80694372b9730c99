use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::BoolishValueParser};

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(name = "pagecache", version, about = "Versioned page cache proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy.
    Serve(Box<ServeArgs>),
    /// Remove every entry from the configured cache store.
    #[command(name = "clear-cache")]
    ClearCache(ClearCacheArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackendArg {
    Memory,
    Memcached,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverrides {
    /// Override the cache store backend.
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub backend: Option<StoreBackendArg>,

    /// Override the memcached address.
    #[arg(long = "memcached-addr", value_name = "HOST:PORT")]
    pub memcached_addr: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverrides,

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

    /// Override the ledger database URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the upstream application URL.
    #[arg(long = "upstream-url", value_name = "URL")]
    pub upstream_url: Option<String>,

    /// Serve hits but never write.
    #[arg(
        long = "cache-read-only",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_read_only: Option<bool>,

    /// Emit cache diagnostics headers.
    #[arg(
        long = "cache-debug-headers",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_debug_headers: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClearCacheArgs {
    #[command(flatten)]
    pub store: StoreOverrides,
}
