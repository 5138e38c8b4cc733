//! Hashing, signing and identifier derivation
//!
//! `hash` is SHA-256, `sign`/`verify` are ECDSA over secp256k1. Keys are
//! derived from a secret phrase so an operator never handles raw key bytes.

use secp256k1::{ecdsa, All, Message, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

/// Length of a compressed secp256k1 public key
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Length of a compact ECDSA signature
pub const SIGNATURE_LENGTH: usize = 64;

fn context() -> &'static Secp256k1<All> {
    static CONTEXT: OnceLock<Secp256k1<All>> = OnceLock::new();
    CONTEXT.get_or_init(Secp256k1::new)
}

/// SHA-256 of a single buffer
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// SHA-256 over the concatenation of several buffers
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Reads the first 8 bytes of a digest as a little-endian integer.
///
/// Used for every 64-bit identifier and for the forging hit.
pub fn le_u64_prefix(digest: &[u8; 32]) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(prefix)
}

/// Account identifier, derived from the owner's public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub u64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HZ-{:016X}", self.0)
    }
}

/// Compressed secp256k1 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "fixed_bytes")] pub [u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Account controlled by this key
    pub fn account_id(&self) -> AccountId {
        AccountId(le_u64_prefix(&sha256(&self.0)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Parses a hex-encoded compressed key
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded).map_err(|_| CryptoError::InvalidPublicKey)?;
        let key: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        secp256k1::PublicKey::from_slice(&key).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(PublicKey(key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Placeholder key carried by the genesis block, which nobody can sign for
    pub fn zero() -> Self {
        PublicKey([0; PUBLIC_KEY_LENGTH])
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

/// Compact ECDSA signature
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "fixed_bytes")] pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn empty() -> Self {
        Signature([0; SIGNATURE_LENGTH])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", hex::encode(self.0))
    }
}

/// Signing key of a locally controlled account
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derives the key pair whose secret key is SHA-256 of the phrase
    pub fn from_secret_phrase(phrase: &str) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_slice(&sha256(phrase.as_bytes()))
            .map_err(|_| CryptoError::InvalidSecret)?;
        let public = secp256k1::PublicKey::from_secret_key(context(), &secret);

        Ok(Self {
            secret,
            public: PublicKey(public.serialize()),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn account_id(&self) -> AccountId {
        self.public.account_id()
    }

    /// Signs SHA-256 of the message. Signing is deterministic (RFC 6979).
    pub fn sign(&self, message: &[u8]) -> Signature {
        let digest = sha256(message);
        // a 32-byte digest is always a valid message
        let msg = Message::from_slice(&digest).expect("digest is 32 bytes");
        let signature = context().sign_ecdsa(&msg, &self.secret);
        Signature(signature.serialize_compact())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish_non_exhaustive()
    }
}

/// Verifies a signature produced by [`KeyPair::sign`]
pub fn verify(message: &[u8], signature: &Signature, public_key: &PublicKey) -> bool {
    let Ok(public) = secp256k1::PublicKey::from_slice(&public_key.0) else {
        return false;
    };
    let Ok(signature) = ecdsa::Signature::from_compact(&signature.0) else {
        return false;
    };
    let digest = sha256(message);
    let Ok(msg) = Message::from_slice(&digest) else {
        return false;
    };

    context().verify_ecdsa(&msg, &signature, &public).is_ok()
}

/// Crypto errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CryptoError {
    #[error("Secret phrase does not map to a valid secret key")]
    InvalidSecret,

    #[error("Invalid public key encoding")]
    InvalidPublicKey,
}

/// Serde support for byte arrays longer than 32 bytes
pub(crate) mod fixed_bytes {
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        deserializer.deserialize_bytes(FixedVisitor::<N>)
    }

    struct FixedVisitor<const N: usize>;

    impl<'de, const N: usize> Visitor<'de> for FixedVisitor<N> {
        type Value = [u8; N];

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} bytes", N)
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            v.try_into().map_err(|_| E::invalid_length(v.len(), &self))
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            self.visit_bytes(&v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = [0u8; N];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(i, &self))?;
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = KeyPair::from_secret_phrase("correct horse battery staple").unwrap();
        let b = KeyPair::from_secret_phrase("correct horse battery staple").unwrap();
        let c = KeyPair::from_secret_phrase("another phrase").unwrap();

        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.account_id(), b.account_id());
        assert_ne!(a.account_id(), c.account_id());
    }

    #[test]
    fn test_sign_and_verify() {
        let keys = KeyPair::from_secret_phrase("signer").unwrap();
        let message = b"block payload";
        let signature = keys.sign(message);

        assert!(verify(message, &signature, &keys.public_key()));
        assert!(!verify(b"block payloaD", &signature, &keys.public_key()));

        let other = KeyPair::from_secret_phrase("someone else").unwrap();
        assert!(!verify(message, &signature, &other.public_key()));
    }

    #[test]
    fn test_zero_key_never_verifies() {
        assert!(!verify(b"genesis", &Signature::empty(), &PublicKey::zero()));
    }

    #[test]
    fn test_fixed_bytes_roundtrip_through_bincode() {
        let keys = KeyPair::from_secret_phrase("serde").unwrap();
        let bytes = bincode::serialize(&keys.public_key()).unwrap();
        let back: PublicKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, keys.public_key());
    }

    #[test]
    fn test_public_key_hex() {
        let keys = KeyPair::from_secret_phrase("hex").unwrap();
        let encoded = keys.public_key().to_hex();
        assert_eq!(PublicKey::from_hex(&encoded).unwrap(), keys.public_key());
        assert!(PublicKey::from_hex("02abcd").is_err());
        assert!(PublicKey::from_hex(&PublicKey::zero().to_hex()).is_err());
    }

    #[test]
    fn test_le_prefix() {
        let mut digest = [0u8; 32];
        digest[0] = 1;
        digest[7] = 0x80;
        assert_eq!(le_u64_prefix(&digest), 0x8000_0000_0000_0001);
    }
}
