//! Whole-file checksum verification, run once after a download completes.

use crate::buffer;
use crate::error::DownloadError;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgo {
    Md5,
    Sha1,
    Sha256,
}

/// Parsed form of the `--checksum` option: `algo=hex`, or bare hex typed by
/// its length (32 → md5, 40 → sha-1, 64 → sha-256).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumSpec {
    pub algo: ChecksumAlgo,
    pub digest: String,
}

impl ChecksumSpec {
    pub fn parse(spec: &str) -> Result<Self, DownloadError> {
        let invalid = || DownloadError::ChecksumSpec {
            spec: spec.to_string(),
        };

        let (algo, digest) = match spec.split_once('=') {
            Some((algo, digest)) => {
                let algo = match algo.to_ascii_lowercase().as_str() {
                    "md5" => ChecksumAlgo::Md5,
                    "sha-1" | "sha1" => ChecksumAlgo::Sha1,
                    "sha-256" | "sha256" => ChecksumAlgo::Sha256,
                    _ => return Err(invalid()),
                };
                (algo, digest)
            }
            None => {
                let algo = match spec.len() {
                    32 => ChecksumAlgo::Md5,
                    40 => ChecksumAlgo::Sha1,
                    64 => ChecksumAlgo::Sha256,
                    _ => return Err(invalid()),
                };
                (algo, spec)
            }
        };

        let digest = digest.to_ascii_lowercase();
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        Ok(Self { algo, digest })
    }
}

enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    fn new(algo: ChecksumAlgo) -> Self {
        match algo {
            ChecksumAlgo::Md5 => Self::Md5(Md5::new()),
            ChecksumAlgo::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumAlgo::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        let bytes = match self {
            Self::Md5(h) => h.finalize().to_vec(),
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        };
        let mut out = String::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

/// Hashes the finished file and compares against the spec. A mismatch is a
/// [`DownloadError::ChecksumMismatch`]; the file is left in place either way.
pub async fn verify_file(path: &Path, spec: &ChecksumSpec) -> Result<(), DownloadError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Hasher::new(spec.algo);
    let mut buf = buffer::get();
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    buffer::put(buf);

    let actual = hasher.finalize_hex();
    if actual != spec.digest {
        return Err(DownloadError::ChecksumMismatch {
            expected: spec.digest.clone(),
            actual,
        });
    }
    Ok(())
}
