//! Encoded string form of [`Key`].
//!
//! Wire layout: one version tag byte followed by a CBOR payload, armored as
//! lowercase hex. The payload is a plain mirror of the key structure so the
//! codec stays lossless; all identity validation re-runs on decode.

use crate::key::{Key, KeyId, KindName};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

/// Upper bound on an armored key string accepted by [`decode_key`]. Ancestor
/// chains are shallow in practice; anything larger is rejected before the
/// CBOR decoder sees it.
pub(crate) const MAX_ENCODED_KEY_BYTES: usize = 4 * 1024;

const WIRE_VERSION_V1: u8 = 1;

///
/// KeyCodecError
/// (decode boundary; converted to `PersistError::MalformedKey` by callers)
///

#[derive(Debug, ThisError)]
pub(crate) enum KeyCodecError {
    #[error("input is not lowercase hex")]
    BadArmor,

    #[error("input exceeds {max} bytes")]
    TooLarge { max: usize },

    #[error("empty payload")]
    Empty,

    #[error("unsupported wire version {found}")]
    UnsupportedVersion { found: u8 },

    #[error("payload decode failed: {0}")]
    Payload(String),

    #[error("key carries {found} identifier forms (exactly one required)")]
    IdentifierArity { found: usize },

    #[error("invalid kind: {0}")]
    Kind(String),
}

///
/// KeyWire
///
/// Version-free structural mirror of [`Key`]. Unknown fields are rejected:
/// encoded keys are not forward-compatible across wire versions.
///

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct KeyWire {
    kind: String,
    id: Option<i64>,
    name: Option<String>,
    parent: Option<Box<KeyWire>>,
}

impl KeyWire {
    fn from_key(key: &Key) -> Self {
        Self {
            kind: key.kind().as_str().to_string(),
            id: key.id().id(),
            name: key.id().name().map(str::to_string),
            parent: key.parent().map(|p| Box::new(Self::from_key(p))),
        }
    }

    fn into_key(self) -> Result<Key, KeyCodecError> {
        let parent = self.parent.map(|p| p.into_key()).transpose()?;

        let id = match (self.id, self.name) {
            (Some(id), None) => KeyId::Id(id),
            (None, Some(name)) => KeyId::Name(name),
            (None, None) => return Err(KeyCodecError::IdentifierArity { found: 0 }),
            (Some(_), Some(_)) => return Err(KeyCodecError::IdentifierArity { found: 2 }),
        };

        let kind = KindName::try_from_str(&self.kind)
            .map_err(|err| KeyCodecError::Kind(err.to_string()))?;

        Ok(Key::from_parts(kind, id, parent))
    }
}

/// Encode a key into its armored wire string.
#[must_use]
pub fn encode_key(key: &Key) -> String {
    let wire = KeyWire::from_key(key);
    // Invariant: KeyWire is a closed struct of scalars and options, so CBOR
    // serialization cannot fail for a well-formed key.
    let payload = serde_cbor::to_vec(&wire).expect("key wire encoding is infallible");

    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(WIRE_VERSION_V1);
    bytes.extend_from_slice(&payload);

    to_hex(&bytes)
}

/// Decode an armored wire string back into a key.
pub fn decode_key(input: &str) -> Result<Key, crate::error::PersistError> {
    decode_inner(input).map_err(|err| crate::error::PersistError::malformed_key(input, err.to_string()))
}

fn decode_inner(input: &str) -> Result<Key, KeyCodecError> {
    if input.len() > MAX_ENCODED_KEY_BYTES * 2 {
        return Err(KeyCodecError::TooLarge {
            max: MAX_ENCODED_KEY_BYTES,
        });
    }

    let bytes = from_hex(input)?;
    let Some((&version, payload)) = bytes.split_first() else {
        return Err(KeyCodecError::Empty);
    };
    if version != WIRE_VERSION_V1 {
        return Err(KeyCodecError::UnsupportedVersion { found: version });
    }

    let wire: KeyWire =
        serde_cbor::from_slice(payload).map_err(|err| KeyCodecError::Payload(err.to_string()))?;

    wire.into_key()
}

// Keys serialize as their armored wire string so any serde format carries
// them losslessly.

impl serde::Serialize for Key {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&encode_key(self))
    }
}

impl<'de> serde::Deserialize<'de> for Key {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let armored = String::deserialize(deserializer)?;
        decode_key(&armored).map_err(serde::de::Error::custom)
    }
}

// Lowercase hex armor. Hand-rolled to keep the wire surface free of extra
// dependencies; inputs are small by construction.

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit(u32::from(byte >> 4), 16).expect("nibble < 16"));
        out.push(char::from_digit(u32::from(byte & 0x0f), 16).expect("nibble < 16"));
    }
    out
}

fn from_hex(input: &str) -> Result<Vec<u8>, KeyCodecError> {
    if input.len() % 2 != 0 {
        return Err(KeyCodecError::BadArmor);
    }

    let mut out = Vec::with_capacity(input.len() / 2);
    let bytes = input.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = hex_nibble(pair[0]).ok_or(KeyCodecError::BadArmor)?;
        let lo = hex_nibble(pair[1]).ok_or(KeyCodecError::BadArmor)?;
        out.push((hi << 4) | lo);
    }

    Ok(out)
}

const fn hex_nibble(ch: u8) -> Option<u8> {
    match ch {
        b'0'..=b'9' => Some(ch - b'0'),
        b'a'..=b'f' => Some(ch - b'a' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use proptest::prelude::*;

    fn kind(name: &str) -> KindName {
        KindName::try_from_str(name).expect("valid kind")
    }

    #[test]
    fn round_trips_a_multi_level_ancestor_chain() {
        let root = Key::with_id(kind("Org"), 42, None);
        let team = Key::with_name(kind("Team"), "platform", Some(root));
        let member = Key::with_id(kind("Member"), 7, Some(team));

        let encoded = encode_key(&member);
        let decoded = decode_key(&encoded).expect("decodes");

        assert_eq!(decoded, member);
    }

    #[test]
    fn rejects_non_hex_and_truncated_input() {
        assert!(matches!(
            decode_key("zz"),
            Err(PersistError::MalformedKey { .. })
        ));
        assert!(matches!(
            decode_key("abc"),
            Err(PersistError::MalformedKey { .. })
        ));
        assert!(matches!(
            decode_key(""),
            Err(PersistError::MalformedKey { .. })
        ));
    }

    #[test]
    fn rejects_unknown_wire_version() {
        let encoded = encode_key(&Key::with_id(kind("K"), 1, None));
        let mut bytes = from_hex(&encoded).expect("hex");
        bytes[0] = 9;

        assert!(matches!(
            decode_key(&to_hex(&bytes)),
            Err(PersistError::MalformedKey { .. })
        ));
    }

    fn arb_key_id() -> impl Strategy<Value = KeyId> {
        prop_oneof![
            (1i64..=i64::MAX).prop_map(KeyId::Id),
            "[a-z0-9_-]{1,24}".prop_map(KeyId::Name),
        ]
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            kinds in prop::collection::vec("[A-Za-z][A-Za-z0-9_]{0,15}", 1..4),
            ids in prop::collection::vec(arb_key_id(), 4),
        ) {
            let mut key: Option<Key> = None;
            for (name, id) in kinds.iter().zip(ids) {
                key = Some(Key::from_parts(kind(name), id, key));
            }
            let key = key.expect("at least one level");

            prop_assert_eq!(decode_key(&encode_key(&key)).unwrap(), key);
        }
    }
}
