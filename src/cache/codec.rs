//! Value encoding for cached entries.
//!
//! Values are written as JSON when serde_json accepts them and as MessagePack
//! otherwise. Nothing records which form was used: decoding tries JSON first
//! and falls back to MessagePack.

use serde::de::{self, DeserializeOwned, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io::Cursor;

use crate::error::EncodingError;

/// The form a value was stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// JSON text.
    StructuredText,
    /// MessagePack bytes.
    RawBinary,
}

/// An encoded value ready for the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub encoding: Encoding,
    pub bytes: Vec<u8>,
}

/// Encode `value`, preferring JSON.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Encoded, EncodingError> {
    let structured = match serde_json::to_vec(value) {
        Ok(bytes) => {
            return Ok(Encoded {
                encoding: Encoding::StructuredText,
                bytes,
            })
        }
        Err(e) => e.to_string(),
    };

    match rmp_serde::to_vec_named(value) {
        Ok(bytes) => Ok(Encoded {
            encoding: Encoding::RawBinary,
            bytes,
        }),
        Err(e) => Err(EncodingError {
            structured,
            binary: e.to_string(),
        }),
    }
}

/// Decode bytes written by [`encode`], trying JSON before MessagePack.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<(T, Encoding), EncodingError> {
    let structured = match serde_json::from_slice(bytes) {
        Ok(value) => return Ok((value, Encoding::StructuredText)),
        Err(e) => e.to_string(),
    };

    decode_binary(bytes)
        .map(|value| (value, Encoding::RawBinary))
        .map_err(|binary| EncodingError { structured, binary })
}

/// Decode exactly one MessagePack value spanning all of `bytes`.
///
/// Any ASCII byte is a complete MessagePack integer, so a prefix match on
/// text would otherwise read as a number.
fn decode_binary<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    let mut cursor = Cursor::new(bytes);
    let value = T::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor)).map_err(|e| e.to_string())?;

    let consumed = cursor.position();
    if consumed != bytes.len() as u64 {
        return Err(format!(
            "{} trailing bytes after a {consumed}-byte value",
            bytes.len() as u64 - consumed
        ));
    }
    Ok(value)
}

/// Whether the bytes are a stored JSON `null`, which reads as a miss.
pub(crate) fn is_null(bytes: &[u8]) -> bool {
    bytes.trim_ascii() == b"null"
}

/// An opaque byte payload.
///
/// A blob refuses text formats, so it is always cached through the binary
/// path and comes back byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Blob {
    fn from(bytes: Vec<u8>) -> Self {
        Blob(bytes)
    }
}

impl AsRef<[u8]> for Blob {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Blob {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            return Err(serde::ser::Error::custom("binary payload is not text-safe"));
        }
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Blob {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            return Err(de::Error::custom("binary payload is not text-safe"));
        }
        deserializer.deserialize_byte_buf(BlobVisitor)
    }
}

struct BlobVisitor;

impl<'de> Visitor<'de> for BlobVisitor {
    type Value = Blob;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a byte array")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Blob, E> {
        Ok(Blob(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Blob, E> {
        Ok(Blob(v))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Blob, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        Ok(Blob(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stats {
        hours: u32,
        total: u64,
    }

    #[test]
    fn test_plain_values_use_json() {
        let encoded = encode(&Stats { hours: 24, total: 1200 }).unwrap();
        assert_eq!(encoded.encoding, Encoding::StructuredText);
        assert_eq!(encoded.bytes, br#"{"hours":24,"total":1200}"#.to_vec());

        let (decoded, encoding): (Stats, _) = decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, Stats { hours: 24, total: 1200 });
        assert_eq!(encoding, Encoding::StructuredText);
    }

    #[test]
    fn test_blob_takes_binary_path() {
        let blob = Blob(vec![0, 159, 146, 150, 255]);
        let encoded = encode(&blob).unwrap();
        assert_eq!(encoded.encoding, Encoding::RawBinary);

        let (decoded, encoding): (Blob, _) = decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, blob);
        assert_eq!(encoding, Encoding::RawBinary);
    }

    #[test]
    fn test_non_string_map_keys_take_binary_path() {
        let mut map = BTreeMap::new();
        map.insert((1u8, 2u8), "pair".to_string());

        let encoded = encode(&map).unwrap();
        assert_eq!(encoded.encoding, Encoding::RawBinary);

        let (decoded, _): (BTreeMap<(u8, u8), String>, _) = decode(&encoded.bytes).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn test_garbage_fails_both_forms() {
        let err = decode::<Stats>(&[0xc1]).unwrap_err();
        assert!(!err.structured.is_empty());
        assert!(!err.binary.is_empty());
    }

    #[test]
    fn test_wrong_type_is_an_error_not_a_prefix() {
        let encoded = encode(&Stats { hours: 24, total: 1200 }).unwrap();
        let err = decode::<u8>(&encoded.bytes).unwrap_err();
        assert!(err.binary.contains("trailing"));

        assert!(decode::<u64>(b"hello").is_err());
        assert!(decode::<u32>(br#""abc""#).is_err());
    }

    #[test]
    fn test_trailing_bytes_after_binary_value_rejected() {
        let mut bytes = encode(&Blob(vec![1, 2, 3])).unwrap().bytes;
        bytes.push(0x01);
        assert!(decode::<Blob>(&bytes).is_err());
    }

    #[test]
    fn test_null_detection() {
        assert!(is_null(b"null"));
        assert!(is_null(b" null\n"));
        assert!(!is_null(b"\"null\""));
    }
}
