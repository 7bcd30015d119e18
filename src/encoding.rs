//! Negotiated payload encodings.
//!
//! SETUP carries a metadata encoding name and a data encoding name; both are
//! immutable for the lifetime of the connection once the handshake completes.
//! The default for both is `utf-8`. Servers refuse a SETUP announcing an
//! encoding the core cannot honor.

/// Default encoding name for metadata and data.
pub const DEFAULT_ENCODING: &str = "utf-8";

/// The metadata/data encoding pair negotiated during SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPair {
    /// Encoding name for the metadata block.
    pub metadata: String,
    /// Encoding name for the data block.
    pub data: String,
}

impl EncodingPair {
    /// Create a pair from explicit names.
    pub fn new(metadata: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            metadata: metadata.into(),
            data: data.into(),
        }
    }

    /// Whether the core can honor the named encoding. Only `utf-8` (and its
    /// `ascii` subset) qualify.
    pub fn supports(name: &str) -> bool {
        name.eq_ignore_ascii_case("utf-8") || name.eq_ignore_ascii_case("ascii")
    }

    /// Whether both names of this pair are supported.
    pub fn is_supported(&self) -> bool {
        Self::supports(&self.metadata) && Self::supports(&self.data)
    }
}

impl Default for EncodingPair {
    fn default() -> Self {
        Self {
            metadata: DEFAULT_ENCODING.to_string(),
            data: DEFAULT_ENCODING.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pair() {
        let pair = EncodingPair::default();
        assert_eq!(pair.metadata, "utf-8");
        assert_eq!(pair.data, "utf-8");
        assert!(pair.is_supported());
    }

    #[test]
    fn test_supported_names() {
        assert!(EncodingPair::supports("utf-8"));
        assert!(EncodingPair::supports("UTF-8"));
        assert!(EncodingPair::supports("ascii"));
        assert!(!EncodingPair::supports("ebcdic"));
        assert!(!EncodingPair::supports(""));
    }

    #[test]
    fn test_mixed_pair_unsupported() {
        let pair = EncodingPair::new("utf-8", "ebcdic");
        assert!(!pair.is_supported());
    }
}
