//! Command-line arguments

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bitleech")]
#[command(about = "Download a torrent from its .torrent descriptor", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Directory the torrent's folder is created in
    #[arg(short, long, value_name = "DIR", default_value = "./downloads")]
    pub output_dir: PathBuf,

    /// Port reported to trackers
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Peers dialled after each tracker answer
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Peers we upload to at once
    #[arg(long, default_value_t = 4)]
    pub max_unchoked: usize,

    /// Remaining pieces at which endgame requests start
    #[arg(long, default_value_t = 20)]
    pub endgame_threshold: usize,

    /// Seconds between announces until a tracker suggests an interval
    #[arg(long, value_name = "SECS", default_value_t = 1800)]
    pub announce_interval: u64,

    /// Debug logging with the pretty formatter
    #[arg(short, long)]
    pub verbose: bool,

    /// Errors only, no progress line
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
