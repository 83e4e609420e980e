//! Content digests.
//!
//! Only `sha256` is produced or accepted, which is what OCI registries,
//! containerd content stores and the nydus builder agree on.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use nydus_convert_core::error::{ConvertError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

const SHA256: &str = "sha256";
const SHA256_HEX_LEN: usize = 64;

/// A validated `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Build a digest from a bare hex string, as reported by the builder.
    pub fn from_hex(hex: &str) -> Result<Self> {
        validate_hex(hex)?;
        Ok(Self(format!("{}:{}", SHA256, hex)))
    }

    /// Digest of an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(format!("{}:{}", SHA256, hex::encode(Sha256::digest(data))))
    }

    /// Hex portion, without the algorithm prefix.
    pub fn hex(&self) -> &str {
        &self.0[SHA256.len() + 1..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_hex(hex: &str) -> Result<()> {
    if hex.len() != SHA256_HEX_LEN
        || !hex
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(ConvertError::SerializationError(format!(
            "invalid sha256 hex digest: '{}'",
            hex
        )));
    }
    Ok(())
}

impl FromStr for Digest {
    type Err = ConvertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once(':') {
            Some((SHA256, hex)) => Self::from_hex(hex),
            Some((algorithm, _)) => Err(ConvertError::SerializationError(format!(
                "unsupported digest algorithm '{}' in '{}'",
                algorithm, s
            ))),
            None => Err(ConvertError::SerializationError(format!(
                "digest '{}' has no algorithm prefix",
                s
            ))),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental SHA-256 over everything written into it.
#[derive(Default, Clone)]
pub struct Digester {
    hasher: Sha256,
    written: u64,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.written += data.len() as u64;
    }

    /// Number of bytes hashed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Digest of the bytes hashed so far, leaving the state untouched.
    pub fn digest(&self) -> Digest {
        Digest(format!(
            "{}:{}",
            SHA256,
            hex::encode(self.hasher.clone().finalize())
        ))
    }
}

impl Write for Digester {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Reader that digests everything read through it.
pub struct HashingReader<R> {
    inner: R,
    digester: Digester,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            digester: Digester::new(),
        }
    }

    pub fn digest(&self) -> Digest {
        self.digester.digest()
    }

    pub fn size(&self) -> u64 {
        self.digester.written()
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.digester.update(&buf[..n]);
        Ok(n)
    }
}

/// Chain ID of an ordered layer stack.
///
/// `chain(l0) = l0`, `chain(l0..n) = sha256(chain(l0..n-1) + " " + ln)`.
/// Returns `None` for an empty stack.
pub fn chain_id(layers: &[Digest]) -> Option<Digest> {
    let (first, rest) = layers.split_first()?;
    Some(rest.iter().fold(first.clone(), |chain, layer| {
        Digest::from_bytes(format!("{} {}", chain, layer).as_bytes())
    }))
}
