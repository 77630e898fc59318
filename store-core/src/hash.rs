//! Content hashing.
//!
//! The store addresses downloaded artifacts by SHA3-384 and derives
//! instance-keys from SHA-256. Both are expressed through the same [`Hash`]
//! type so callers don't need to juggle raw byte arrays.

use std::fmt;

use displaydoc::Display;
use serde::{de, ser, Deserialize, Serialize};
use sha2::Sha256;
use sha3::Sha3_384;

/// A content hash, tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Hash {
    /// A SHA3-384 hash, used to address downloaded snap blobs.
    Sha3_384([u8; 48]),
    /// A SHA-256 hash, used in the instance-key derivation.
    Sha256([u8; 32]),
}

/// A hashing error.
#[derive(Debug, Display)]
pub enum Error {
    /// The string lacks a colon separator.
    NoColonSeparator,
    /// Hash algorithm {0} is not supported.
    UnsupportedHashAlgorithm(String),
    /// Invalid hex hash: {0}
    InvalidHex(hex::FromHexError),
    /// Invalid length for {typ} string: expected {expected} hex characters, got {actual}.
    InvalidLength {
        typ: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl std::error::Error for Error {}

impl Hash {
    /// Hashes a byte slice with SHA3-384.
    pub fn sha3_384_of_bytes(bytes: &[u8]) -> Self {
        use digest::Digest;
        let mut hasher = Sha3_384::new();
        hasher.update(bytes);
        Self::Sha3_384(hasher.finalize().into())
    }

    /// Hashes a byte slice with SHA-256.
    pub fn sha256_of_bytes(bytes: &[u8]) -> Self {
        use digest::Digest;
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self::Sha256(hasher.finalize().into())
    }

    /// Hashes an async reader with SHA3-384, streaming through [`crate::io::HashReader`]
    /// rather than buffering the whole input in memory.
    #[cfg(feature = "tokio")]
    pub async fn sha3_384_of_reader<R>(reader: R) -> std::io::Result<Self>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        use digest::Digest;
        use tokio::io::AsyncReadExt;

        let (mut hashed, finalized) = crate::io::HashReader::new(reader, Sha3_384::new());
        let mut buf = [0u8; 64 * 1024];
        while hashed.read(&mut buf).await? != 0 {}

        let (digest, _) = finalized.get().expect("HashReader finalizes at EOF").clone();
        Ok(Self::Sha3_384(digest.into()))
    }

    /// Parses a typed hash string, e.g. `sha3-384:deadbeef…` or `sha256:…`.
    pub fn from_typed(s: &str) -> Result<Self, Error> {
        let colon = s.find(':').ok_or(Error::NoColonSeparator)?;
        let (typ, rest) = s.split_at(colon);
        let hex_str = &rest[1..];

        match typ {
            "sha3-384" => {
                let v = decode_hex(hex_str, "SHA3-384", 48)?;
                Ok(Self::Sha3_384(v.try_into().unwrap()))
            }
            "sha256" => {
                let v = decode_hex(hex_str, "SHA-256", 32)?;
                Ok(Self::Sha256(v.try_into().unwrap()))
            }
            other => Err(Error::UnsupportedHashAlgorithm(other.to_owned())),
        }
    }

    /// Parses a bare hex hash string given the expected algorithm.
    pub fn from_hex_sha3_384(s: &str) -> Result<Self, Error> {
        let v = decode_hex(s, "SHA3-384", 48)?;
        Ok(Self::Sha3_384(v.try_into().unwrap()))
    }

    fn data(&self) -> &[u8] {
        match self {
            Self::Sha3_384(d) => d,
            Self::Sha256(d) => d,
        }
    }

    fn hash_type(&self) -> &'static str {
        match self {
            Self::Sha3_384(_) => "sha3-384",
            Self::Sha256(_) => "sha256",
        }
    }

    /// Returns the hash as a bare lowercase hex string (no algorithm prefix).
    ///
    /// This is the representation used as the download cache's on-disk file
    /// name, since the cache only ever holds SHA3-384 entries.
    pub fn to_hex(&self) -> String {
        hex::encode(self.data())
    }

    /// Returns the hash in `algo:hex` form, the canonical wire representation.
    pub fn to_typed_hex(&self) -> String {
        format!("{}:{}", self.hash_type(), hex::encode(self.data()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_typed_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        use de::Error as _;
        let s = String::deserialize(deserializer)?;
        // Bare hex without a type prefix is assumed to be SHA3-384, the only
        // hash type that appears un-prefixed on the wire (download info).
        if s.contains(':') {
            Self::from_typed(&s).map_err(|e| D::Error::custom(e.to_string()))
        } else {
            Self::from_hex_sha3_384(&s).map_err(|e| D::Error::custom(e.to_string()))
        }
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: ser::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

fn decode_hex(s: &str, typ: &'static str, expected_bytes: usize) -> Result<Vec<u8>, Error> {
    let expected_len = expected_bytes * 2;
    if s.len() != expected_len {
        return Err(Error::InvalidLength {
            typ,
            expected: expected_len,
            actual: s.len(),
        });
    }

    hex::decode(s).map_err(Error::InvalidHex)
}
