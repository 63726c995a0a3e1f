//! Cryptographic primitives for cosync.
//!
//! Everything that touches key material goes through a [`CryptoProvider`].
//! The provider is stateless; callers own the secrets they pass in.
//! [`DefaultCrypto`] wires Ed25519 signatures, X25519 key agreement,
//! ChaCha20-Poly1305 encryption and Blake3 hashing.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{CoreError, Result};
use crate::types::{AgentId, KeyId};

/// A 32-byte Blake3 hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute the Blake3 hash of the given data.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The zero hash, the start of every session chain.
    pub const ZERO: Self = Self([0u8; 32]);
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", &self.to_hex()[..16])
    }
}

/// Public half of a signing key (Ed25519).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignerId(pub [u8; 32]);

/// Public half of a sealing key (X25519).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealerId(pub [u8; 32]);

impl fmt::Debug for SignerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignerId({})", &hex::encode(self.0)[..16])
    }
}

impl fmt::Debug for SealerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealerId({})", &hex::encode(self.0)[..16])
    }
}

/// Secret signing key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SignerSecret(pub [u8; 32]);

/// Secret sealing key material.
#[derive(Clone, PartialEq, Eq)]
pub struct SealerSecret(pub [u8; 32]);

/// A symmetric key used to encrypt private transactions.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret(pub [u8; 32]);

impl KeySecret {
    /// The id under which this key is referenced in group logs.
    pub fn id(&self) -> KeyId {
        let mut hasher = blake3::Hasher::new_derive_key("cosync-v0 key id");
        hasher.update(&self.0);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
        KeyId(id)
    }

    /// Hex encoding, used when a key is revealed inside a group log.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex-encoded key.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for SignerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignerSecret(..)")
    }
}

impl fmt::Debug for SealerSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SealerSecret(..)")
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeySecret({})", self.id())
    }
}

/// A shared secret derived from X25519 key agreement.
#[derive(Clone)]
pub struct SharedSecret(pub [u8; 32]);

impl SharedSecret {
    /// Derive a symmetric key from this shared secret.
    pub fn derive_key(&self, context: &[u8]) -> KeySecret {
        let mut hasher = blake3::Hasher::new_derive_key("cosync-v0 sealing");
        hasher.update(&self.0);
        hasher.update(context);
        KeySecret(*hasher.finalize().as_bytes())
    }
}

/// A 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a byte slice.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 64] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", &self.to_hex()[..16])
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct SignatureVisitor;

        impl<'de> de::Visitor<'de> for SignatureVisitor {
            type Value = Signature;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("64 signature bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<Signature, E> {
                Signature::from_slice(v).ok_or_else(|| E::invalid_length(v.len(), &self))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Signature, A::Error> {
                let mut bytes = Vec::with_capacity(64);
                while let Some(b) = seq.next_element::<u8>()? {
                    bytes.push(b);
                }
                Signature::from_slice(&bytes)
                    .ok_or_else(|| de::Error::invalid_length(bytes.len(), &self))
            }
        }

        deserializer.deserialize_bytes(SignatureVisitor)
    }
}

/// The full secret of an agent: one signing and one sealing key.
#[derive(Clone, PartialEq, Eq)]
pub struct AgentSecret {
    pub signer: SignerSecret,
    pub sealer: SealerSecret,
}

impl AgentSecret {
    /// Generate a new random agent secret.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut signer = [0u8; 32];
        let mut sealer = [0u8; 32];
        rng.fill_bytes(&mut signer);
        rng.fill_bytes(&mut sealer);
        Self {
            signer: SignerSecret(signer),
            sealer: SealerSecret(sealer),
        }
    }

    /// Derive both keys from a single 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signer: SignerSecret(blake3::derive_key("cosync-v0 agent signer", seed)),
            sealer: SealerSecret(blake3::derive_key("cosync-v0 agent sealer", seed)),
        }
    }

    /// Hex encoding of both secrets, used for invite links.
    pub fn to_hex(&self) -> String {
        format!("{}{}", hex::encode(self.signer.0), hex::encode(self.sealer.0))
    }

    /// Parse the encoding produced by [`AgentSecret::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| CoreError::MalformedId(e.to_string()))?;
        if bytes.len() != 64 {
            return Err(CoreError::MalformedId(format!(
                "agent secret must be 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut signer = [0u8; 32];
        let mut sealer = [0u8; 32];
        signer.copy_from_slice(&bytes[..32]);
        sealer.copy_from_slice(&bytes[32..]);
        Ok(Self {
            signer: SignerSecret(signer),
            sealer: SealerSecret(sealer),
        })
    }
}

impl fmt::Debug for AgentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AgentSecret(..)")
    }
}

/// Pure cryptographic operations used by the engine.
///
/// Verification and decryption failures are ordinary results, never errors:
/// an unverifiable transaction is rejected, not fatal.
pub trait CryptoProvider: Send + Sync {
    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature;

    fn verify(&self, signature: &Signature, message: &[u8], signer: &SignerId) -> bool;

    fn signer_id(&self, secret: &SignerSecret) -> SignerId;

    fn sealer_id(&self, secret: &SealerSecret) -> SealerId;

    fn encrypt(&self, key: &KeySecret, nonce_material: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, key: &KeySecret, nonce_material: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>>;

    fn hash(&self, data: &[u8]) -> Hash;

    fn derive_agreement_key(&self, secret: &SealerSecret, peer: &SealerId) -> SharedSecret;

    fn new_key_secret(&self) -> KeySecret;

    fn new_agent_secret(&self) -> AgentSecret {
        AgentSecret::generate()
    }

    /// The public identity of an agent secret.
    fn agent_id(&self, secret: &AgentSecret) -> AgentId {
        AgentId {
            signer: self.signer_id(&secret.signer),
            sealer: self.sealer_id(&secret.sealer),
        }
    }

    /// Encrypt `plaintext` so that only the holder of `to`'s secret can read it.
    fn seal(
        &self,
        from: &SealerSecret,
        to: &SealerId,
        nonce_material: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let key = self
            .derive_agreement_key(from, to)
            .derive_key(b"seal");
        self.encrypt(&key, nonce_material, plaintext)
    }

    /// Open a box produced by [`CryptoProvider::seal`].
    fn unseal(
        &self,
        to: &SealerSecret,
        from: &SealerId,
        nonce_material: &[u8],
        sealed: &[u8],
    ) -> Option<Vec<u8>> {
        let key = self
            .derive_agreement_key(to, from)
            .derive_key(b"seal");
        self.decrypt(&key, nonce_material, sealed)
    }
}

/// Default provider: Ed25519, X25519, ChaCha20-Poly1305 and Blake3.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl DefaultCrypto {
    fn nonce(nonce_material: &[u8]) -> [u8; 12] {
        let digest = blake3::derive_key("cosync-v0 nonce", nonce_material);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&digest[..12]);
        nonce
    }
}

impl CryptoProvider for DefaultCrypto {
    fn sign(&self, secret: &SignerSecret, message: &[u8]) -> Signature {
        let signing_key = SigningKey::from_bytes(&secret.0);
        Signature(signing_key.sign(message).to_bytes())
    }

    fn verify(&self, signature: &Signature, message: &[u8], signer: &SignerId) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&signer.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        verifying_key.verify(message, &sig).is_ok()
    }

    fn signer_id(&self, secret: &SignerSecret) -> SignerId {
        SignerId(SigningKey::from_bytes(&secret.0).verifying_key().to_bytes())
    }

    fn sealer_id(&self, secret: &SealerSecret) -> SealerId {
        let secret = StaticSecret::from(secret.0);
        SealerId(*PublicKey::from(&secret).as_bytes())
    }

    fn encrypt(&self, key: &KeySecret, nonce_material: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&key.0)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
        let nonce = Self::nonce(nonce_material);
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))
    }

    fn decrypt(&self, key: &KeySecret, nonce_material: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&key.0).ok()?;
        let nonce = Self::nonce(nonce_material);
        cipher.decrypt(Nonce::from_slice(&nonce), ciphertext).ok()
    }

    fn hash(&self, data: &[u8]) -> Hash {
        Hash::of(data)
    }

    fn derive_agreement_key(&self, secret: &SealerSecret, peer: &SealerId) -> SharedSecret {
        let secret = StaticSecret::from(secret.0);
        let shared = secret.diffie_hellman(&PublicKey::from(peer.0));
        SharedSecret(*shared.as_bytes())
    }

    fn new_key_secret(&self) -> KeySecret {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        KeySecret(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let crypto = DefaultCrypto;
        let secret = AgentSecret::from_seed(&[0x42; 32]);
        let agent = crypto.agent_id(&secret);

        let signature = crypto.sign(&secret.signer, b"hello world");
        assert!(crypto.verify(&signature, b"hello world", &agent.signer));
        assert!(!crypto.verify(&signature, b"hello worlD", &agent.signer));
    }

    #[test]
    fn test_verify_garbage_key_is_false() {
        let crypto = DefaultCrypto;
        let signature = Signature([7u8; 64]);
        assert!(!crypto.verify(&signature, b"msg", &SignerId([0xff; 32])));
    }

    #[test]
    fn test_agent_secret_deterministic_from_seed() {
        let crypto = DefaultCrypto;
        let a = crypto.agent_id(&AgentSecret::from_seed(&[1; 32]));
        let b = crypto.agent_id(&AgentSecret::from_seed(&[1; 32]));
        let c = crypto.agent_id(&AgentSecret::from_seed(&[2; 32]));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_agent_secret_hex_roundtrip() {
        let secret = AgentSecret::generate();
        let parsed = AgentSecret::from_hex(&secret.to_hex()).unwrap();
        assert_eq!(secret, parsed);
        assert!(AgentSecret::from_hex("abcd").is_err());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = DefaultCrypto;
        let key = crypto.new_key_secret();
        let ciphertext = crypto.encrypt(&key, b"nonce", b"secret").unwrap();
        assert_ne!(ciphertext, b"secret");
        assert_eq!(crypto.decrypt(&key, b"nonce", &ciphertext).unwrap(), b"secret");

        // Wrong nonce material or wrong key fails without panicking
        assert!(crypto.decrypt(&key, b"other", &ciphertext).is_none());
        let other = crypto.new_key_secret();
        assert!(crypto.decrypt(&other, b"nonce", &ciphertext).is_none());
    }

    #[test]
    fn test_seal_unseal() {
        let crypto = DefaultCrypto;
        let alice = AgentSecret::generate();
        let bob = AgentSecret::generate();
        let alice_id = crypto.agent_id(&alice);
        let bob_id = crypto.agent_id(&bob);

        let sealed = crypto
            .seal(&alice.sealer, &bob_id.sealer, b"tx-1", b"group key")
            .unwrap();
        let opened = crypto.unseal(&bob.sealer, &alice_id.sealer, b"tx-1", &sealed);
        assert_eq!(opened.unwrap(), b"group key");

        let eve = AgentSecret::generate();
        assert!(crypto
            .unseal(&eve.sealer, &alice_id.sealer, b"tx-1", &sealed)
            .is_none());
    }

    #[test]
    fn test_key_id_stable() {
        let key = KeySecret([9; 32]);
        assert_eq!(key.id(), key.clone().id());
        assert_ne!(key.id(), KeySecret([8; 32]).id());
        assert_eq!(KeySecret::from_hex(&key.to_hex()).unwrap(), key);
    }
}
