//! Terminal progress line
//!
//! Renders `TorrentStatus` snapshots as a single self-overwriting line.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::session::{SessionState, TorrentStatus};

const BAR_WIDTH: usize = 30;

/// Human readable byte count, binary units
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Time left at the current speed; None when stalled or finished
pub fn eta(status: &TorrentStatus) -> Option<Duration> {
    if status.speed <= 0.0 || status.downloaded >= status.total {
        return None;
    }
    let remaining = (status.total - status.downloaded) as f64;
    Some(Duration::from_secs_f64(remaining / status.speed))
}

pub struct ProgressDisplay {
    start_time: Instant,
    quiet: bool,
}

impl ProgressDisplay {
    pub fn new(quiet: bool) -> Self {
        Self {
            start_time: Instant::now(),
            quiet,
        }
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// The progress line for one snapshot, without terminal control codes
    pub fn render(status: &TorrentStatus) -> String {
        let filled = ((status.percent / 100.0) * BAR_WIDTH as f64).round() as usize;
        let filled = filled.min(BAR_WIDTH);
        let bar = "#".repeat(filled) + &"-".repeat(BAR_WIDTH - filled);
        let eta = match status.state {
            SessionState::Paused => "paused".to_string(),
            SessionState::Complete => "done".to_string(),
            SessionState::Active => eta(status).map(format_duration).unwrap_or_else(|| "--".to_string()),
        };
        format!(
            "[{}] {:5.1}% {} / {} | {} | {} peers | {}/{} pieces | ETA {}",
            bar,
            status.percent,
            format_bytes(status.downloaded),
            format_bytes(status.total),
            format_speed(status.speed),
            status.peers,
            status.completed_pieces,
            status.total_pieces,
            eta,
        )
    }

    /// Overwrite the current line with `status`
    pub fn update(&mut self, status: &TorrentStatus) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        write!(out, "\r\x1b[2K{}", Self::render(status))?;
        out.flush()
    }

    pub fn print_complete(&self, status: &TorrentStatus) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        let mut out = io::stdout().lock();
        writeln!(out, "\r\x1b[2K{}", Self::render(status))?;
        writeln!(out, "Download complete: {}", status.name)?;
        writeln!(
            out,
            "  {} in {}, {} uploaded",
            format_bytes(status.total),
            format_duration(self.start_time.elapsed()),
            format_bytes(status.uploaded)
        )?;
        out.flush()
    }

    pub fn print_status(&self, message: &str) -> io::Result<()> {
        if self.quiet {
            return Ok(());
        }
        println!("\r\x1b[2K{}", message);
        Ok(())
    }

    pub fn print_error(&self, message: &str) {
        eprintln!("\r\x1b[2KError: {}", message);
    }
}
