//! Progress reporting surface. Rendering is deliberately thin: the engine
//! core only knows how to hand snapshots to a sink.

use crate::gid::Gid;
use std::io::Write;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub gid: Gid,
    /// Zero when the total is unknown (single-connection mode without a
    /// Content-Length).
    pub total: u64,
    pub completed: u64,
    /// Bytes per second.
    pub speed: u64,
    pub connections: u32,
}

pub trait ProgressSink: Send + Sync {
    fn progress(&self, update: &ProgressUpdate);
    fn message(&self, text: &str);
}

/// Carriage-return progress line on stderr. Quiet mode drops everything.
pub struct ConsoleProgress {
    quiet: bool,
}

impl ConsoleProgress {
    pub fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl ProgressSink for ConsoleProgress {
    fn progress(&self, update: &ProgressUpdate) {
        if self.quiet {
            return;
        }
        let mut stderr = std::io::stderr();
        if update.total > 0 {
            let pct = update.completed * 100 / update.total;
            let _ = write!(
                stderr,
                "\r[{}] {}/{} ({pct}%) {}/s cn:{}    ",
                update.gid,
                human_bytes(update.completed),
                human_bytes(update.total),
                human_bytes(update.speed),
                update.connections,
            );
        } else {
            let _ = write!(
                stderr,
                "\r[{}] {} {}/s cn:{}    ",
                update.gid,
                human_bytes(update.completed),
                human_bytes(update.speed),
                update.connections,
            );
        }
        let _ = stderr.flush();
    }

    fn message(&self, text: &str) {
        if self.quiet {
            return;
        }
        eprintln!("{text}");
    }
}

pub fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_picks_sensible_units() {
        assert_eq!(human_bytes(0), "0B");
        assert_eq!(human_bytes(512), "512B");
        assert_eq!(human_bytes(2048), "2.0KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0MiB");
        assert_eq!(human_bytes(3 * 1024 * 1024 * 1024), "3.0GiB");
    }
}
