use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Content address of a chunk: BLAKE3 of the decoded chunk payload.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkId(pub [u8; 32]);

impl ChunkId {
    pub fn of(data: &[u8]) -> Self {
        ChunkId(*blake3::hash(data).as_bytes())
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    /// First byte as two hex chars, used as the store shard directory.
    pub fn shard_prefix(&self) -> String {
        self.to_hex()[..2].to_string()
    }
}

impl FromStr for ChunkId {
    type Err = blake3::HexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ChunkId(*blake3::Hash::from_hex(s)?.as_bytes()))
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse_matches_display_prefix() {
        let id = ChunkId::of(b"hello world");
        let parsed: ChunkId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(format!("{id}"), id.to_hex()[..16]);
        assert_eq!(id.shard_prefix().len(), 2);
    }

    #[test]
    fn rejects_short_hex() {
        assert!("abcd".parse::<ChunkId>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let id = ChunkId::of(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: ChunkId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
