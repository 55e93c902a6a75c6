//! Typed option records. Unit-suffixed and boolean-coded values are parsed
//! once at admission time; the records are immutable for the lifetime of the
//! download they configure.

use crate::disk::Allocation;
use crate::segment::selector::SelectorKind;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SPLIT: u32 = 5;
pub const DEFAULT_MAX_TRIES: u32 = 5;
pub const DEFAULT_MAX_PIECES_PER_SEGMENT: u32 = 20;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_MAX_IDLE_PER_HOST: usize = 32;
pub const DEFAULT_SPEED_CHECK_INTERVAL_SECS: u64 = 30;

/// Per-download configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadOptions {
    pub dir: Option<PathBuf>,
    pub out: Option<String>,
    /// Number of connections (workers) per download.
    pub split: u32,
    /// Bytes per second; 0 disables rate limiting.
    pub max_download_limit: u64,
    /// Bytes per second; 0 disables the lowest-speed abort.
    pub lowest_speed_limit: u64,
    pub max_tries: u32,
    pub retry_wait_secs: u64,
    /// Raw checksum spec (`algo=hex` or bare hex), verified after completion.
    pub checksum: Option<String>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
    pub headers: Vec<(String, String)>,
    pub http_user: Option<String>,
    pub http_passwd: Option<String>,
    pub allow_overwrite: bool,
    pub auto_file_renaming: bool,
    pub piece_selector: SelectorKind,
    pub file_allocation: Allocation,
    pub max_pieces_per_segment: u32,
    /// Interval between lowest-speed checks. Shortened in tests.
    pub speed_check_interval_secs: u64,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            dir: None,
            out: None,
            split: DEFAULT_SPLIT,
            max_download_limit: 0,
            lowest_speed_limit: 0,
            max_tries: DEFAULT_MAX_TRIES,
            retry_wait_secs: 0,
            checksum: None,
            user_agent: None,
            referer: None,
            headers: Vec::new(),
            http_user: None,
            http_passwd: None,
            allow_overwrite: false,
            auto_file_renaming: true,
            piece_selector: SelectorKind::InOrder,
            file_allocation: Allocation::Trunc,
            max_pieces_per_segment: DEFAULT_MAX_PIECES_PER_SEGMENT,
            speed_check_interval_secs: DEFAULT_SPEED_CHECK_INTERVAL_SECS,
        }
    }
}

impl DownloadOptions {
    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn speed_check_interval(&self) -> Duration {
        Duration::from_secs(self.speed_check_interval_secs.max(1))
    }
}

/// Engine-wide transport configuration, shared by every download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkOptions {
    /// Total per-request timeout in seconds; 0 disables it.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub proxy: Option<String>,
    /// Comma-separated host list exempt from the proxy; `*` disables
    /// proxying entirely.
    pub no_proxy: Option<String>,
    pub check_certificate: bool,
    /// Netscape/Mozilla cookie file preloaded into the shared jar.
    pub load_cookies: Option<PathBuf>,
    pub max_idle_per_host: usize,
    pub idle_timeout_secs: u64,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            proxy: None,
            no_proxy: None,
            check_certificate: true,
            load_cookies: None,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
        }
    }
}

/// Parses a decimal integer with an optional `K`/`M`/`G`/`T` suffix
/// (powers of 1024, either case) into bytes.
pub fn parse_unit_size(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size".to_string());
    }

    let (number, multiplier) = match s.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => {
            let number = &s[..s.len() - 1];
            let multiplier: u64 = match c.to_ascii_uppercase() {
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                'T' => 1024 * 1024 * 1024 * 1024,
                other => return Err(format!("unknown size suffix '{other}'")),
            };
            (number, multiplier)
        }
        _ => (s, 1),
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{s}' overflows"))
}

/// Splits a multi-line header option into `(name, value)` pairs. Each line is
/// split on the first `:`; lines without one are ignored.
pub fn parse_header_lines(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_parser_handles_plain_numbers() {
        assert_eq!(parse_unit_size("0"), Ok(0));
        assert_eq!(parse_unit_size("1234"), Ok(1234));
    }

    #[test]
    fn unit_parser_handles_suffixes_both_cases() {
        assert_eq!(parse_unit_size("1K"), Ok(1024));
        assert_eq!(parse_unit_size("1k"), Ok(1024));
        assert_eq!(parse_unit_size("10M"), Ok(10 * 1024 * 1024));
        assert_eq!(parse_unit_size("2G"), Ok(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_unit_size("1T"), Ok(1024u64.pow(4)));
    }

    #[test]
    fn unit_parser_rejects_garbage() {
        assert!(parse_unit_size("").is_err());
        assert!(parse_unit_size("10X").is_err());
        assert!(parse_unit_size("K").is_err());
        assert!(parse_unit_size("1.5M").is_err());
    }

    #[test]
    fn header_lines_split_on_first_colon_only() {
        let headers = parse_header_lines("Accept: text/html\nX-Time: 12:30:00\nbogus line\n");
        assert_eq!(
            headers,
            vec![
                ("Accept".to_string(), "text/html".to_string()),
                ("X-Time".to_string(), "12:30:00".to_string()),
            ]
        );
    }

    #[test]
    fn defaults_match_documented_values() {
        let opt = DownloadOptions::default();
        assert_eq!(opt.split, 5);
        assert_eq!(opt.max_tries, 5);
        assert_eq!(opt.max_pieces_per_segment, 20);
        assert!(opt.auto_file_renaming);
        assert!(!opt.allow_overwrite);
        assert_eq!(opt.piece_selector, SelectorKind::InOrder);
        assert_eq!(opt.file_allocation, Allocation::Trunc);
    }

    #[test]
    fn download_options_survive_a_json_round_trip() {
        let mut opt = DownloadOptions::default();
        opt.out = Some("file.bin".to_string());
        opt.split = 8;
        opt.headers
            .push(("X-Token".to_string(), "abc".to_string()));
        let encoded = serde_json::to_string(&opt).expect("encode");
        let decoded: DownloadOptions = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.out.as_deref(), Some("file.bin"));
        assert_eq!(decoded.split, 8);
        assert_eq!(decoded.headers.len(), 1);
    }
}
