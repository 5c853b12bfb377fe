use std::{
    fmt,
    str::FromStr,
};

use anyhow::Context as _;
use serde::{
    de::Error as _,
    Deserialize,
    Deserializer,
    Serialize,
    Serializer,
};

use crate::base64::{
    decode_urlsafe,
    encode_urlsafe,
};

/// The digest scheme digit emitted for locally computed identifiers.
pub const DEFAULT_DIGEST_SCHEME: u8 = 0;

/// An immutable identifier for a CAS object.
///
/// The first byte is the digest-scheme digit; the remaining bytes are the
/// digest itself. Equality, ordering, and hashing are over the full byte
/// sequence, so two ids with different schemes are distinct even if their
/// digest bytes coincide.
///
/// The textual form is `<scheme>~<base64url(digest)>` with padding, and it
/// round-trips exactly through `Display`/`FromStr`.
#[must_use]
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataId(Vec<u8>);

impl DataId {
    /// The canonical identifier of the object `(refs, data)` under the
    /// default digest scheme: BLAKE3 over the full bytes of each ref in
    /// order, then the data.
    pub fn of(refs: &[DataId], data: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for r in refs {
            hasher.update(r.as_bytes());
        }
        hasher.update(data);
        let mut bytes = Vec::with_capacity(1 + blake3::OUT_LEN);
        bytes.push(DEFAULT_DIGEST_SCHEME);
        bytes.extend_from_slice(hasher.finalize().as_bytes());
        Self(bytes)
    }

    /// Reconstructs an id from its raw bytes (scheme byte included).
    pub fn from_bytes(bytes: Vec<u8>) -> anyhow::Result<Self> {
        anyhow::ensure!(!bytes.is_empty(), "DataId must not be empty");
        anyhow::ensure!(bytes[0] <= 9, "unknown digest scheme {}", bytes[0]);
        Ok(Self(bytes))
    }

    pub fn scheme(&self) -> u8 {
        self.0[0]
    }

    /// The full byte sequence, scheme byte first.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// base64url of the full byte sequence; used as the file name by the
    /// file-backed database.
    pub fn as_filename(&self) -> String {
        encode_urlsafe(&self.0)
    }
}

impl fmt::Display for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}", self.0[0], encode_urlsafe(&self.0[1..]))
    }
}

impl fmt::Debug for DataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataId({self})")
    }
}

impl FromStr for DataId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (scheme, digest) = s
            .split_once('~')
            .with_context(|| format!("malformed DataId {s:?}"))?;
        anyhow::ensure!(
            scheme.len() == 1 && scheme.as_bytes()[0].is_ascii_digit(),
            "malformed DataId scheme {scheme:?}",
        );
        let mut bytes = vec![scheme.as_bytes()[0] - b'0'];
        bytes.extend_from_slice(&decode_urlsafe(digest)?);
        Self::from_bytes(bytes)
    }
}

impl Serialize for DataId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DataId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::DataId;

    #[test]
    fn test_digest_without_refs() {
        let id = DataId::of(&[], &[1, 2, 3]);
        assert_eq!(id.to_string(), "0~sXfsG_Jt-ztwENRz5tRHE7KbdluZxuYOy_rnQt5JZUM=");
    }

    #[test]
    fn test_digest_with_refs() {
        let id1 = DataId::of(&[], &[1, 2, 3]);
        let id2 = DataId::of(&[id1], &[4, 5, 6]);
        assert_eq!(id2.to_string(), "0~udZrZzFHJr8uovWT5dOWtKz95ZqKi-vBkpiH0mJfjM4=");
    }

    #[test]
    fn test_digest_is_deterministic() {
        assert_eq!(DataId::of(&[], b"hello"), DataId::of(&[], b"hello"));
        assert_ne!(DataId::of(&[], b"hello"), DataId::of(&[], b"world"));
    }

    #[test]
    fn test_scheme_distinguishes_ids() -> anyhow::Result<()> {
        let id = DataId::of(&[], b"payload");
        let mut bytes = id.as_bytes().to_vec();
        bytes[0] = 1;
        let other = DataId::from_bytes(bytes)?;
        assert_ne!(id, other);
        assert_eq!(id.as_bytes()[1..], other.as_bytes()[1..]);
        Ok(())
    }

    #[test]
    fn test_json_round_trip() -> anyhow::Result<()> {
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(b"abc def");
        let id = DataId::from_bytes(bytes)?;
        let encoded = serde_json::to_string(&id)?;
        assert_eq!(encoded, "\"0~YWJjIGRlZg==\"");
        let decoded: DataId = serde_json::from_str(&encoded)?;
        assert_eq!(decoded, id);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<DataId>().is_err());
        assert!("0".parse::<DataId>().is_err());
        assert!("x~YWJj".parse::<DataId>().is_err());
        assert!("00~YWJj".parse::<DataId>().is_err());
        assert!("0~!!".parse::<DataId>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, failure_persistence: None, ..ProptestConfig::default() })]

        #[test]
        fn proptest_text_round_trip(data in prop::collection::vec(any::<u8>(), 0..256)) {
            let id = DataId::of(&[], &data);
            let parsed: DataId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
