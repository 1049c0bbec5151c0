//! Subresource-Integrity digests: `<algo>-<base64(hash)>`.

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use data_encoding::BASE64;
use subtle::ConstantTimeEq;
use tokio::io::AsyncRead;

use crate::{Error, HashingReader};

/// The hash algorithms an SRI string may name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Algorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// Length of the raw digest produced by this algorithm, in bytes.
    pub const fn raw_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 32,
            Algorithm::Sha384 => 48,
            Algorithm::Sha512 => 64,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha384 => "sha384",
            Algorithm::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha384" => Ok(Algorithm::Sha384),
            "sha512" => Ok(Algorithm::Sha512),
            _ => Err(Error::MalformedDigest(format!("unknown algorithm {s:?}"))),
        }
    }
}

/// A parsed SRI digest.
///
/// Equality and hashing operate on the canonical form (lowercased
/// algorithm, standard base64 with padding), which is also what
/// [`fmt::Display`] emits.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SriDigest {
    algo: Algorithm,
    raw: Bytes,
}

impl SriDigest {
    /// Constructs a digest from an algorithm and its raw hash output.
    /// Fails if the length does not match the algorithm.
    pub fn new(algo: Algorithm, raw: Bytes) -> Result<Self, Error> {
        if raw.len() != algo.raw_len() {
            return Err(Error::MalformedDigest(format!(
                "invalid digest length for {}: {}",
                algo,
                raw.len()
            )));
        }
        Ok(Self { algo, raw })
    }

    /// Internal constructor for digests whose length is correct by
    /// construction (hasher output).
    pub(crate) fn from_hasher_output(algo: Algorithm, raw: Bytes) -> Self {
        debug_assert_eq!(raw.len(), algo.raw_len());
        Self { algo, raw }
    }

    pub fn algo(&self) -> Algorithm {
        self.algo
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Constant-time comparison of two digests.
    pub fn ct_eq(&self, other: &SriDigest) -> bool {
        self.algo == other.algo && bool::from(self.raw.as_ref().ct_eq(other.raw.as_ref()))
    }
}

impl fmt::Display for SriDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.algo, BASE64.encode(&self.raw))
    }
}

impl fmt::Debug for SriDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SriDigest({self})")
    }
}

impl FromStr for SriDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, b64) = s
            .split_once('-')
            .ok_or_else(|| Error::MalformedDigest(format!("missing separator in {s:?}")))?;
        let algo: Algorithm = algo.to_ascii_lowercase().parse()?;
        let raw = BASE64
            .decode(b64.as_bytes())
            .map_err(|e| Error::MalformedDigest(format!("invalid base64: {e}")))?;
        SriDigest::new(algo, raw.into())
    }
}

impl serde::Serialize for SriDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for SriDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reads `reader` to EOF and returns the digest of everything read.
pub async fn hash_reader<R>(algo: Algorithm, reader: R) -> Result<SriDigest, Error>
where
    R: AsyncRead + Unpin,
{
    let mut hashing = HashingReader::new(algo, reader);
    tokio::io::copy(&mut hashing, &mut tokio::io::sink()).await?;
    Ok(hashing.into_digest())
}

/// Re-hashes `reader` under the digest's algorithm and compares in
/// constant time.
pub async fn validate<R>(expected: &SriDigest, reader: R) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    let computed = hash_reader(expected.algo(), reader).await?;
    if computed.ct_eq(expected) {
        Ok(())
    } else {
        Err(Error::IntegrityMismatch {
            expected: expected.to_string(),
            computed: computed.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    const HELLO_SRI: &str = "sha256-WJG1tSLV3whtD/CxEPvZ0hu0/HFjrzTQgoai6Eb2vgM=";
    const EMPTY_SRI: &str = "sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=";

    #[test_case("sha256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=", true; "valid sha256")]
    #[test_case("SHA256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=", true; "uppercase algo canonicalizes")]
    #[test_case("md5-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=", false; "unknown algo")]
    #[test_case("sha256-AAAA", false; "wrong raw length")]
    #[test_case("sha256-!!!!", false; "invalid base64")]
    #[test_case("sha256", false; "missing separator")]
    #[test_case("sha384-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=", false; "length mismatch for algo")]
    fn parse(input: &str, is_ok: bool) {
        assert_eq!(input.parse::<SriDigest>().is_ok(), is_ok);
    }

    #[test]
    fn display_is_canonical() {
        let digest: SriDigest = "SHA256-47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU="
            .parse()
            .unwrap();
        assert_eq!(digest.to_string(), EMPTY_SRI);
    }

    #[tokio::test]
    async fn hash_reader_known_input() {
        let digest = hash_reader(Algorithm::Sha256, &b"hello\n"[..])
            .await
            .unwrap();
        assert_eq!(digest.to_string(), HELLO_SRI);
    }

    #[tokio::test]
    async fn hash_reader_empty_input() {
        let digest = hash_reader(Algorithm::Sha256, &b""[..]).await.unwrap();
        assert_eq!(digest.to_string(), EMPTY_SRI);
    }

    #[tokio::test]
    async fn validate_accepts_matching_content() {
        let digest: SriDigest = HELLO_SRI.parse().unwrap();
        validate(&digest, &b"hello\n"[..]).await.unwrap();
    }

    #[tokio::test]
    async fn validate_rejects_different_content() {
        let digest: SriDigest = HELLO_SRI.parse().unwrap();
        let err = validate(&digest, &b"goodbye\n"[..]).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch { .. }));
    }

    #[test]
    fn digest_roundtrips_through_serde() {
        let digest: SriDigest = HELLO_SRI.parse().unwrap();
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{HELLO_SRI}\""));
        let back: SriDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
