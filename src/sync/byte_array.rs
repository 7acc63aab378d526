use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::SyncResult;

/// Immutable byte sequence used as the key type of every storage engine.
///
/// Equality, ordering and hashing are by content. Cloning is cheap.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ByteArray(Arc<[u8]>);

impl ByteArray {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        ByteArray(Arc::from(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for ByteArray {
    fn from(bytes: Vec<u8>) -> Self {
        ByteArray::new(bytes)
    }
}

impl From<&[u8]> for ByteArray {
    fn from(bytes: &[u8]) -> Self {
        ByteArray(Arc::from(bytes))
    }
}

impl From<&str> for ByteArray {
    fn from(s: &str) -> Self {
        ByteArray::from(s.as_bytes())
    }
}

impl AsRef<[u8]> for ByteArray {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteArray({})", hex::encode(&self.0))
    }
}

impl fmt::Display for ByteArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => write!(f, "{}", s),
            Err(_) => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl Serialize for ByteArray {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serde_bytes::Bytes::new(&self.0).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ByteArray {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let buf = serde_bytes::ByteBuf::deserialize(deserializer)?;
        Ok(ByteArray::new(buf.into_vec()))
    }
}

/// Encode a typed key into its store representation
pub fn encode_key<K: Serialize + ?Sized>(key: &K) -> SyncResult<ByteArray> {
    Ok(ByteArray::new(serde_json::to_vec(key)?))
}

pub fn decode_key<K: DeserializeOwned>(key: &ByteArray) -> SyncResult<K> {
    Ok(serde_json::from_slice(key.as_bytes())?)
}

pub fn encode_value<V: Serialize + ?Sized>(value: &V) -> SyncResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> SyncResult<V> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_value_equality_and_hash() {
        let a = ByteArray::from(vec![1u8, 2, 3]);
        let b = ByteArray::from(&[1u8, 2, 3][..]);
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let mut keys = vec![ByteArray::from("b"), ByteArray::from("ab"), ByteArray::from("a")];
        keys.sort();
        assert_eq!(keys, vec![ByteArray::from("a"), ByteArray::from("ab"), ByteArray::from("b")]);
    }

    #[test]
    fn test_typed_key_codec() {
        let key = encode_key(&42i16).unwrap();
        assert_eq!(key.as_bytes(), b"42");
        let back: i16 = decode_key(&key).unwrap();
        assert_eq!(back, 42);
        assert!(decode_key::<i16>(&ByteArray::from("not json")).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(ByteArray::from("seeds").to_string(), "seeds");
        assert_eq!(ByteArray::from(vec![0xffu8, 0x00]).to_string(), "0xff00");
    }
}
