use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

pub const FINGERPRINT_LEN: usize = 32;

/// A SHA-256 digest of document content. Equal content always yields an
/// equal fingerprint; two different documents sharing a fingerprint are
/// treated as duplicates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// The leading 8 bytes read as a big-endian integer, used for routing.
    pub fn prefix(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(prefix)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// How document content is canonicalized before hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// Hash the content bytes as they are.
    #[default]
    Exact,
    /// Lower-case the content and collapse whitespace runs into a single space.
    Canonical,
}

impl FromStr for Normalization {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(Normalization::Exact),
            "canonical" => Ok(Normalization::Canonical),
            _ => Err(ConfigError::UnknownNormalization(s.to_owned())),
        }
    }
}

/// Computes fingerprints. Holds no state besides its normalization, so it is
/// cheap to copy into every worker and agrees across processes and runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Fingerprinter {
    normalization: Normalization,
}

impl Fingerprinter {
    pub fn new(normalization: Normalization) -> Self {
        Self { normalization }
    }

    pub fn normalization(&self) -> Normalization {
        self.normalization
    }

    pub fn fingerprint(&self, content: &[u8]) -> Fingerprint {
        match self.normalization {
            Normalization::Exact => fingerprint(content),
            Normalization::Canonical => match std::str::from_utf8(content) {
                Ok(text) => canonical_fingerprint(text),
                // Bytes that are not text have nothing to canonicalize.
                Err(_) => fingerprint(content),
            },
        }
    }
}

/// Fingerprint of the raw content bytes.
pub fn fingerprint(content: &[u8]) -> Fingerprint {
    Fingerprint(Sha256::digest(content).into())
}

fn canonical_fingerprint(text: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    for (i, word) in text.split_whitespace().enumerate() {
        if i > 0 {
            hasher.update(b" ");
        }
        hasher.update(word.to_lowercase().as_bytes());
    }
    Fingerprint(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_empty_content_has_stable_fingerprint() {
        assert_eq!(
            fingerprint(b"").to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(fingerprint(b""), Fingerprinter::default().fingerprint(b""));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let fingerprinter = Fingerprinter::default();
        let content = b"def main():\n    return 42\n";

        assert_eq!(
            fingerprinter.fingerprint(content),
            fingerprinter.fingerprint(content)
        );
        assert_ne!(
            fingerprinter.fingerprint(content),
            fingerprinter.fingerprint(b"def main():\n    return 43\n")
        );
    }

    #[test_case("Hello  World", "hello world" ; "case and inner whitespace")]
    #[test_case("\thello\nworld  ", "hello world" ; "leading and trailing whitespace")]
    #[test_case("", "   " ; "empty and blank")]
    fn test_canonical_normalization_matches(left: &str, right: &str) {
        let fingerprinter = Fingerprinter::new(Normalization::Canonical);

        assert_eq!(
            fingerprinter.fingerprint(left.as_bytes()),
            fingerprinter.fingerprint(right.as_bytes())
        );
    }

    #[test]
    fn test_exact_normalization_keeps_differences() {
        let fingerprinter = Fingerprinter::new(Normalization::Exact);

        assert_ne!(
            fingerprinter.fingerprint(b"Hello  World"),
            fingerprinter.fingerprint(b"hello world")
        );
    }

    #[test]
    fn test_canonical_normalization_falls_back_on_invalid_utf8() {
        let fingerprinter = Fingerprinter::new(Normalization::Canonical);
        let bytes = [0xff, 0xfe, b' ', b'A'];

        assert_eq!(fingerprinter.fingerprint(&bytes), fingerprint(&bytes));
    }

    #[test]
    fn test_normalization_from_str() {
        assert_eq!("exact".parse(), Ok(Normalization::Exact));
        assert_eq!(" Canonical ".parse(), Ok(Normalization::Canonical));
        assert_eq!(
            "fuzzy".parse::<Normalization>(),
            Err(ConfigError::UnknownNormalization("fuzzy".to_owned()))
        );
    }

    #[test]
    fn test_prefix_reads_leading_bytes() {
        let mut bytes = [0u8; FINGERPRINT_LEN];
        bytes[7] = 1;
        bytes[8] = 0xff;

        assert_eq!(Fingerprint::from_bytes(bytes).prefix(), 1);
    }
}
