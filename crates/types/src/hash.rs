//! Transaction hash type using Blake3.

use std::fmt;

/// A 32-byte ledger transaction hash.
///
/// Outstanding-set entries are keyed by this value and matched against the
/// hashes reported in block execution results.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxHash([u8; 32]);

impl TxHash {
    /// Create hash from bytes using Blake3.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let hash = blake3::hash(bytes);
        Self(*hash.as_bytes())
    }

    /// Create hash from multiple byte slices.
    pub fn from_parts(parts: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// Convert hash to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get bytes as slice reference.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "TxHash({}..{})", &hex[..8], &hex[56..])
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        let data = b"hello world";
        assert_eq!(TxHash::from_bytes(data), TxHash::from_bytes(data));
        assert_ne!(TxHash::from_bytes(b"hello"), TxHash::from_bytes(b"world"));
    }

    #[test]
    fn test_from_parts_matches_concatenation() {
        let joined = TxHash::from_bytes(b"partition-1:nonce-7");
        let parts = TxHash::from_parts(&[b"partition-1:", b"nonce-7"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_display_is_full_hex() {
        let hash = TxHash::from_bytes(b"x");
        let shown = hash.to_string();
        assert_eq!(shown.len(), 64);
        assert_eq!(shown, hex::encode(hash.as_bytes()));
        assert!(format!("{hash:?}").starts_with(&format!("TxHash({}..", &shown[..8])));
    }
}
