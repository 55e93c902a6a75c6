use crate::error::DownloadError;
use serde::{Deserialize, Serialize};

/// Download identifier: 8 cryptographically random bytes rendered as 16
/// lowercase hex characters. Immutable once assigned; keys every engine map
/// and appears in all events and progress updates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Gid(String);

impl Gid {
    pub fn generate() -> Result<Self, DownloadError> {
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).map_err(|source| DownloadError::Entropy { source })?;
        let mut out = String::with_capacity(16);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        Ok(Self(out))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Gid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Gid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_gid_is_16_lowercase_hex_chars() {
        let gid = Gid::generate().expect("generate");
        assert_eq!(gid.as_str().len(), 16);
        assert!(
            gid.as_str()
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        );
    }

    #[test]
    fn generated_gids_are_unique() {
        let a = Gid::generate().expect("generate");
        let b = Gid::generate().expect("generate");
        assert_ne!(a, b);
    }
}
