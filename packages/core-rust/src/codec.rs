//! Payload codec contract.
//!
//! Stores never see domain types directly: every value crosses the backend
//! boundary as an opaque byte payload produced by [`StorageData::encode`] and
//! turned back into a fresh instance by [`StorageData::decode`]. Sorted-set
//! members additionally carry a score through [`ScoredData`]; the score is
//! kept out of the payload so that member identity is the encoded bytes alone.
//!
//! [`Packed`] adapts any `serde` type using `MsgPack` with named fields
//! (`rmp_serde::to_vec_named`), and [`Scored`] attaches a score to any
//! [`StorageData`].

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// A value that can round-trip through an opaque byte payload.
///
/// `decode(encode(v))` must be observationally equal to `v`, and equal
/// logical content must encode to equal bytes (snapshot comparison and
/// sorted-set membership rely on it).
pub trait StorageData: Sized + Send + Sync + 'static {
    /// Encode into payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if the value cannot be represented.
    fn encode(&self) -> Result<Vec<u8>, CodecError>;

    /// Build a fresh instance from payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid payload.
    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// A [`StorageData`] that also exposes an ordering score.
///
/// The score only orders members inside a sorted set and filters score
/// ranges; stores do not interpret it otherwise.
pub trait ScoredData: StorageData {
    fn score(&self) -> f64;

    fn set_score(&mut self, score: f64);
}

impl StorageData for Vec<u8> {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.clone())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl StorageData for String {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// `MsgPack` adapter for any `serde` type.
///
/// Struct fields are written by name so payloads stay readable by other
/// clients and survive field reordering.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packed<T>(pub T);

impl<T> Packed<T> {
    /// Unwraps the inner value.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> From<T> for Packed<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> StorageData for Packed<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(&self.0)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Self(rmp_serde::from_slice(bytes)?))
    }
}

/// Pairs a payload value with a sorted-set score.
///
/// Only `value` is encoded; the score travels beside the payload and is
/// restored by the store through [`ScoredData::set_score`] after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored<T> {
    pub value: T,
    pub score: f64,
}

impl<T> Scored<T> {
    #[must_use]
    pub fn new(value: T, score: f64) -> Self {
        Self { value, score }
    }
}

impl<T: StorageData> StorageData for Scored<T> {
    fn encode(&self) -> Result<Vec<u8>, CodecError> {
        self.value.encode()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            value: T::decode(bytes)?,
            score: 0.0,
        })
    }
}

impl<T: StorageData> ScoredData for Scored<T> {
    fn score(&self) -> f64 {
        self.score
    }

    fn set_score(&mut self, score: f64) {
        self.score = score;
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Player {
        id: u32,
        name: String,
    }

    #[test]
    fn packed_round_trip_preserves_fields() {
        let player = Packed(Player {
            id: 7,
            name: "alice".to_string(),
        });
        let bytes = player.encode().unwrap();
        let decoded = Packed::<Player>::decode(&bytes).unwrap();
        assert_eq!(decoded, player);
    }

    #[test]
    fn packed_encoding_is_deterministic() {
        let a = Packed(Player { id: 1, name: "x".into() });
        let b = Packed(Player { id: 1, name: "x".into() });
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn packed_decode_rejects_garbage() {
        let err = Packed::<Player>::decode(&[0xc1]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn string_decode_rejects_invalid_utf8() {
        assert!(String::decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn scored_payload_excludes_score() {
        let low = Scored::new("member".to_string(), 1.0);
        let high = Scored::new("member".to_string(), 99.0);
        assert_eq!(low.encode().unwrap(), high.encode().unwrap());

        let mut decoded = Scored::<String>::decode(&high.encode().unwrap()).unwrap();
        decoded.set_score(high.score());
        assert_eq!(decoded, high);
    }

    proptest! {
        #[test]
        fn string_round_trips(s in ".*") {
            let decoded = String::decode(&s.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, s);
        }

        #[test]
        fn bytes_round_trip(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let decoded = Vec::<u8>::decode(&bytes.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, bytes);
        }
    }
}
