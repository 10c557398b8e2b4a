use once_cell::sync::Lazy;
use secp256k1::ecdsa::Signature;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

static SECP: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid key: {0}")]
    Key(secp256k1::Error),
    #[error("invalid signature encoding: {0}")]
    Signature(secp256k1::Error),
}

/// SHA-256 digest of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// A secp256k1 key pair. The public key is kept in compressed form; its hex
/// encoding doubles as the on-chain address.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let (secret, public) = SECP.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self { secret, public }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex)?;
        let secret = SecretKey::from_slice(&bytes).map_err(CryptoError::Key)?;
        let public = secret.public_key(&SECP);
        Ok(Self { secret, public })
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.serialize())
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.secret.secret_bytes())
    }

    /// ECDSA over the SHA-256 digest of `message`, DER-encoded hex.
    pub fn sign_hex(&self, message: &[u8]) -> String {
        let digest = Sha256::digest(message);
        let msg = Message::from_digest_slice(&digest).expect("digest is 32 bytes");
        let sig = SECP.sign_ecdsa(&msg, &self.secret);
        hex::encode(sig.serialize_der())
    }
}

/// Verifies `signature_hex` (DER or compact) against `public_key_hex` over
/// the SHA-256 digest of `message`. Returns false on a well-formed but
/// non-matching signature; errors only on malformed inputs.
pub fn verify_hex(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<bool, CryptoError> {
    let pk_bytes = hex::decode(public_key_hex)?;
    let public = PublicKey::from_slice(&pk_bytes).map_err(CryptoError::Key)?;
    let sig_bytes = hex::decode(signature_hex)?;
    let signature = Signature::from_der(&sig_bytes)
        .or_else(|_| Signature::from_compact(&sig_bytes))
        .map_err(CryptoError::Signature)?;
    let digest = Sha256::digest(message);
    let msg = Message::from_digest_slice(&digest).expect("digest is 32 bytes");
    Ok(SECP.verify_ecdsa(&msg, &signature, &public).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn sign_and_verify() {
        let kp = KeyPair::generate();
        let sig = kp.sign_hex(b"hello world");
        assert!(verify_hex(&kp.public_key_hex(), b"hello world", &sig).unwrap());
        assert!(!verify_hex(&kp.public_key_hex(), b"hello worle", &sig).unwrap());
    }

    #[test]
    fn secret_roundtrip() {
        let kp = KeyPair::generate();
        let restored = KeyPair::from_secret_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.public_key_hex(), restored.public_key_hex());
    }

    #[test]
    fn rejects_malformed_key() {
        let kp = KeyPair::generate();
        let sig = kp.sign_hex(b"msg");
        assert!(verify_hex("zz", b"msg", &sig).is_err());
        assert!(verify_hex("0011", b"msg", &sig).is_err());
    }
}
