//! Validated CLI configuration

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::cli::args::CliArgs;
use crate::error::TorrentError;
use crate::session::SessionConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub torrent_file: PathBuf,
    pub output_dir: PathBuf,
    pub port: u16,
    pub max_connections: usize,
    pub max_unchoked: usize,
    pub endgame_threshold: usize,
    pub announce_interval: Duration,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    pub fn from_args(args: &CliArgs) -> Self {
        Self {
            torrent_file: args.torrent_file.clone(),
            output_dir: args.output_dir.clone(),
            port: args.port,
            max_connections: args.max_connections,
            max_unchoked: args.max_unchoked,
            endgame_threshold: args.endgame_threshold,
            announce_interval: Duration::from_secs(args.announce_interval),
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field("Must allow at least one connection", "max_connections").into());
        }
        if self.max_unchoked == 0 {
            return Err(TorrentError::config_error_with_field("Must unchoke at least one peer", "max_unchoked").into());
        }
        if self.announce_interval.is_zero() {
            return Err(TorrentError::validation_error_with_field("Announce interval cannot be 0", "announce_interval").into());
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::validation_error_with_field("Output directory cannot be empty", "output_dir").into());
        }
        Ok(())
    }

    /// Session policy with the CLI overrides applied
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            port: self.port,
            max_connections: self.max_connections,
            max_unchoked: self.max_unchoked,
            endgame_threshold: self.endgame_threshold,
            announce_interval: self.announce_interval,
            ..SessionConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(extra: &[&str]) -> Config {
        let mut argv = vec!["bitleech", "movie.torrent"];
        argv.extend_from_slice(extra);
        Config::from_args(&CliArgs::try_parse_from(argv).unwrap())
    }

    #[test]
    fn test_session_config_overrides() {
        let config = config(&["--port", "7000", "--max-unchoked", "2", "--announce-interval", "600"]);
        assert!(config.validate().is_ok());

        let session = config.session_config();
        assert_eq!(session.port, 7000);
        assert_eq!(session.max_unchoked, 2);
        assert_eq!(session.announce_interval, Duration::from_secs(600));
        assert_eq!(session.endgame_threshold, 20);
        assert_eq!(session.max_pipeline, SessionConfig::default().max_pipeline);
    }

    #[test]
    fn test_validate_rejects_zeroes() {
        for extra in [["--port", "0"], ["--max-connections", "0"], ["--max-unchoked", "0"], ["--announce-interval", "0"]] {
            assert!(config(&extra).validate().is_err(), "{:?} accepted", extra);
        }

        let mut empty = config(&[]);
        empty.output_dir = PathBuf::new();
        let err = empty.validate().unwrap_err();
        assert!(err.to_string().contains("output_dir"));
    }
}
