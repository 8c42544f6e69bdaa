use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Academic-management sidecar: reads JSON requests on stdin, answers on stdout.
#[derive(Parser, Debug)]
#[command(name = "campusd", version)]
#[command(about = "Academic management daemon speaking line-delimited JSON over stdio")]
pub struct Args {
    /// Workspace directory to open at startup
    #[arg(short, long, value_name = "PATH", env = "CAMPUSD_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, value_name = "LEVEL", env = "CAMPUSD_LOG", default_value = "info")]
    pub log_level: String,
}

/// Logs go to stderr; stdout carries protocol responses only.
pub fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_ansi(false)
        .try_init();
}
