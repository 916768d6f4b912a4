use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::KeyError;

/// Entity kinds held by the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    User,
    Thread,
    Event,
    Message,
    Note,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::User => "User",
            Kind::Thread => "Thread",
            Kind::Event => "Event",
            Kind::Message => "Message",
            Kind::Note => "Note",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "User" => Ok(Kind::User),
            "Thread" => Ok(Kind::Thread),
            "Event" => Ok(Kind::Event),
            "Message" => Ok(Kind::Message),
            "Note" => Ok(Kind::Note),
            other => Err(KeyError::Invalid(format!("unknown kind {other}"))),
        }
    }
}

/// Reference to a stored entity: its kind and server-assigned numeric ID.
///
/// Keys serialize as their external ID, an opaque URL-safe string, so every
/// document that references another entity stores the same form the HTTP
/// surface exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub kind: Kind,
    pub id: i64,
}

impl Key {
    pub fn new(kind: Kind, id: i64) -> Self {
        Self { kind, id }
    }

    /// URL-safe external encoding of this key.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.kind, self.id))
    }

    /// Decode an external ID of any kind.
    pub fn decode(external: &str) -> Result<Self, KeyError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(external.trim())
            .map_err(|_| KeyError::Invalid(external.to_string()))?;
        let raw = String::from_utf8(bytes).map_err(|_| KeyError::Invalid(external.to_string()))?;
        let (kind, id) = raw
            .split_once(':')
            .ok_or_else(|| KeyError::Invalid(external.to_string()))?;
        let id: i64 = id
            .parse()
            .map_err(|_| KeyError::Invalid(external.to_string()))?;
        if id <= 0 {
            return Err(KeyError::Invalid(external.to_string()));
        }
        Ok(Self {
            kind: kind.parse()?,
            id,
        })
    }

    /// Decode an external ID and require a particular kind.
    pub fn decode_kind(external: &str, expected: Kind) -> Result<Self, KeyError> {
        let key = Self::decode(external)?;
        if key.kind != expected {
            return Err(KeyError::WrongKind {
                expected: expected.to_string(),
                actual: key.kind.to_string(),
            });
        }
        Ok(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Key::decode(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_id_roundtrip() {
        let key = Key::new(Kind::Thread, 5629499534213120);
        let external = key.encode();
        assert!(!external.contains('='));
        assert_eq!(Key::decode(&external).unwrap(), key);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Key::decode("not-an-id!").is_err());
        assert!(Key::decode(&URL_SAFE_NO_PAD.encode("Thread:-4")).is_err());
        assert!(Key::decode(&URL_SAFE_NO_PAD.encode("Planet:4")).is_err());
    }

    #[test]
    fn test_decode_kind_mismatch() {
        let key = Key::new(Kind::User, 7);
        let err = Key::decode_kind(&key.encode(), Kind::Event).unwrap_err();
        assert!(matches!(err, KeyError::WrongKind { .. }));
    }

    #[test]
    fn test_serde_uses_external_id() {
        let key = Key::new(Kind::User, 42);
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, format!("\"{}\"", key.encode()));
        let back: Key = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
