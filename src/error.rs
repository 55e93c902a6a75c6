use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Persistence failures for the control file and the session file.
#[derive(Debug)]
pub enum StoreError {
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    EnsureDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read file '{}': {source}", path.display())
            }
            Self::WriteFile { path, source } => {
                write!(f, "failed to write file '{}': {source}", path.display())
            }
            Self::Rename { from, to, source } => write!(
                f,
                "failed to rename '{}' -> '{}': {source}",
                from.display(),
                to.display()
            ),
            Self::Remove { path, source } => {
                write!(f, "failed to remove file '{}': {source}", path.display())
            }
            Self::EnsureDir { path, source } => {
                write!(
                    f,
                    "failed to ensure directory '{}': {source}",
                    path.display()
                )
            }
            Self::Serialize { source } => write!(f, "failed to serialize state: {source}"),
            Self::Parse { path, source } => {
                write!(f, "failed to parse '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. }
            | Self::WriteFile { source, .. }
            | Self::Rename { source, .. }
            | Self::Remove { source, .. }
            | Self::EnsureDir { source, .. } => Some(source),
            Self::Serialize { source } | Self::Parse { source, .. } => Some(source),
        }
    }
}

/// Everything that can go wrong while executing a download or running the
/// engine. Control-file load failures are deliberately absent: they demote to
/// a fresh start instead of surfacing here.
#[derive(Debug)]
pub enum DownloadError {
    NoUris,
    InvalidUri {
        uri: String,
        reason: String,
    },
    Network(reqwest::Error),
    HttpStatus {
        status: reqwest::StatusCode,
    },
    SpeedTooLow {
        observed: u64,
        minimum: u64,
    },
    ShortBody {
        missing: u64,
    },
    Disk(std::io::Error),
    FileConflict {
        path: PathBuf,
    },
    ChecksumSpec {
        spec: String,
    },
    ChecksumMismatch {
        expected: String,
        actual: String,
    },
    Cancelled,
    Shutdown,
    Incomplete,
    Entropy {
        source: getrandom::Error,
    },
    Worker {
        id: usize,
        segment: u64,
        tries: u32,
        source: Box<DownloadError>,
    },
    TaskJoin(tokio::task::JoinError),
    Store(StoreError),
    /// One or more downloads ended in error; `(gid, message)` per failure.
    Failed(Vec<(String, String)>),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoUris => write!(f, "no URIs provided"),
            Self::InvalidUri { uri, reason } => write!(f, "invalid URI '{uri}': {reason}"),
            Self::Network(source) => write!(f, "network error: {source}"),
            Self::HttpStatus { status } => write!(f, "server returned {status}"),
            Self::SpeedTooLow { observed, minimum } => write!(
                f,
                "transfer speed {observed} B/s below lowest limit {minimum} B/s"
            ),
            Self::ShortBody { missing } => write!(
                f,
                "server closed the connection with {missing} bytes outstanding"
            ),
            Self::Disk(source) => write!(f, "disk error: {source}"),
            Self::FileConflict { path } => {
                write!(f, "file already exists: {}", path.display())
            }
            Self::ChecksumSpec { spec } => write!(f, "invalid checksum spec '{spec}'"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum failed: expected {expected}, got {actual}")
            }
            Self::Cancelled => write!(f, "download cancelled"),
            Self::Shutdown => write!(f, "engine shut down"),
            Self::Incomplete => write!(f, "download incomplete"),
            Self::Entropy { source } => write!(f, "failed to generate random bytes: {source}"),
            Self::Worker {
                id,
                segment,
                tries,
                source,
            } => write!(
                f,
                "worker {id} failed segment {segment} after {tries} tries: {source}"
            ),
            Self::TaskJoin(source) => write!(f, "worker task join error: {source}"),
            Self::Store(source) => write!(f, "{source}"),
            Self::Failed(failures) => {
                if let [(gid, message)] = failures.as_slice() {
                    return write!(f, "download {gid} failed: {message}");
                }
                write!(f, "{} downloads failed:", failures.len())?;
                for (i, (gid, message)) in failures.iter().enumerate() {
                    write!(f, "\n{}. download {gid} failed: {message}", i + 1)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for DownloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Network(source) => Some(source),
            Self::Disk(source) => Some(source),
            Self::Entropy { source } => Some(source),
            Self::Worker { source, .. } => Some(source),
            Self::TaskJoin(source) => Some(source),
            Self::Store(source) => Some(source),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(value: reqwest::Error) -> Self {
        Self::Network(value)
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(value: std::io::Error) -> Self {
        Self::Disk(value)
    }
}

impl From<StoreError> for DownloadError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl DownloadError {
    /// Cancellation and shutdown must short-circuit retry loops instead of
    /// being recorded as a transient attempt failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Shutdown)
    }
}
