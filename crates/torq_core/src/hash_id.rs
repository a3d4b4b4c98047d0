use std::str::FromStr;

use data_encoding::BASE32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A fixed-size binary identifier. Used with N=20 for info-hashes and peer
/// ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id<const N: usize>(pub [u8; N]);

impl<const N: usize> Default for Id<N> {
    fn default() -> Self {
        Id([0u8; N])
    }
}

pub type Id20 = Id<20>;

/// SHA-1 of the bencoded info dict; the torrent's identity.
pub type InfoHash = Id20;

/// Our 20-byte identity on the wire, generated once per session.
pub type PeerId = Id20;

impl<const N: usize> Id<N> {
    pub const fn new(bytes: [u8; N]) -> Self {
        Id(bytes)
    }

    pub fn from_slice(b: &[u8]) -> anyhow::Result<Self> {
        if b.len() != N {
            anyhow::bail!("expected {} bytes, got {}", N, b.len());
        }
        let mut out = [0u8; N];
        out.copy_from_slice(b);
        Ok(Id(out))
    }

    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl<const N: usize> std::fmt::Display for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl<const N: usize> std::fmt::Debug for Id<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl<const N: usize> FromStr for Id<N> {
    type Err = anyhow::Error;

    /// Accepts hex (2N chars) or base32 (the magnet link legacy encoding).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; N];
        let base32_len = N.div_ceil(5) * 8;
        if s.len() == N * 2 {
            hex::decode_to_slice(s, &mut out)?;
            Ok(Id(out))
        } else if s.len() == base32_len {
            let decoded = BASE32
                .decode(s.to_ascii_uppercase().as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid base32 id {s:?}: {e}"))?;
            Self::from_slice(&decoded)
        } else {
            anyhow::bail!(
                "expected a hex string of length {} or base32 of length {}",
                N * 2,
                base32_len
            )
        }
    }
}

impl<const N: usize> Serialize for Id<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_hex())
    }
}

impl<'de, const N: usize> Deserialize<'de> for Id<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let id = Id20::from_str("cfe1119f124881ca70f7306f32e292194c88c195").unwrap();
        assert_eq!(id.to_string(), "cfe1119f124881ca70f7306f32e292194c88c195");
    }

    #[test]
    fn test_base32() {
        let b32 = Id20::from_str("Z7QRDHYSJCA4U4HXGBXTFYUSDFGIRQMV").unwrap();
        let hx = Id20::from_str("cfe1119f124881ca70f7306f32e292194c88c195").unwrap();
        assert_eq!(b32, hx);
    }

    #[test]
    fn test_bad_lengths() {
        assert!(Id20::from_str("cfe111").is_err());
        assert!(Id20::from_slice(&[0u8; 19]).is_err());
    }
}
