use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{anyhow, Result};
use groat_core::{Transaction, TxType};
use groat_crypto::KeyPair;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const PBKDF2_ROUNDS: u32 = 10_000;

/// A key pair with transaction-building helpers. The compressed public key
/// hex is the wallet's address.
pub struct Wallet {
    keypair: KeyPair,
}

impl Wallet {
    pub fn generate() -> Self {
        Self {
            keypair: KeyPair::generate(),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        Ok(Self {
            keypair: KeyPair::from_secret_hex(secret_hex)?,
        })
    }

    pub fn public_key(&self) -> String {
        self.keypair.public_key_hex()
    }

    pub fn secret_key(&self) -> String {
        self.keypair.secret_key_hex()
    }

    /// A signed standard transfer ready for submission.
    pub fn create_transaction(
        &self,
        destination: &str,
        amount: u64,
        fee: u64,
        prev_hash: &str,
    ) -> Transaction {
        let mut tx = Transaction::new(
            self.public_key(),
            destination.to_string(),
            amount,
            fee,
            TxType::Standard,
            prev_hash.to_string(),
        );
        tx.sign(&self.keypair);
        tx
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWallet {
    pub name: String,
    pub public_key: String,
    pub encrypted_secret: String,
    pub nonce: [u8; 12],
}

/// File-backed wallet storage; secrets only ever touch disk encrypted.
pub struct WalletStore {
    root: PathBuf,
}

impl WalletStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn create(&self, name: &str, passphrase: &str) -> Result<StoredWallet> {
        let wallet = Wallet::generate();
        let (encrypted_secret, nonce) = encrypt_secret(wallet.secret_key().as_bytes(), passphrase)?;
        let stored = StoredWallet {
            name: name.to_string(),
            public_key: wallet.public_key(),
            encrypted_secret,
            nonce,
        };
        let path = self.root.join(format!("{name}.json"));
        fs::write(path, serde_json::to_vec_pretty(&stored)?)?;
        Ok(stored)
    }

    pub fn list(&self) -> Result<Vec<StoredWallet>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let bytes = fs::read(entry.path())?;
                out.push(serde_json::from_slice(&bytes)?);
            }
        }
        Ok(out)
    }

    pub fn load(&self, name: &str) -> Result<StoredWallet> {
        let bytes = fs::read(self.root.join(format!("{name}.json")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn unlock(&self, stored: &StoredWallet, passphrase: &str) -> Result<Wallet> {
        let secret = decrypt_secret(&stored.encrypted_secret, &stored.nonce, passphrase)?;
        Wallet::from_secret_hex(std::str::from_utf8(&secret)?)
    }
}

/// AES-256-GCM with a PBKDF2-derived key; the random salt is prepended to
/// the ciphertext and the whole blob hex-encoded.
pub fn encrypt_secret(secret: &[u8], passphrase: &str) -> Result<(String, [u8; 12])> {
    let mut salt = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), secret)
        .map_err(|e| anyhow!("encrypt failed: {e}"))?;
    let mut blob = salt.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok((hex::encode(blob), nonce_bytes))
}

pub fn decrypt_secret(blob_hex: &str, nonce: &[u8; 12], passphrase: &str) -> Result<Vec<u8>> {
    let blob = hex::decode(blob_hex)?;
    if blob.len() < 16 {
        return Err(anyhow!("ciphertext too short"));
    }
    let (salt, ciphertext) = blob.split_at(16);
    let mut key = [0u8; 32];
    pbkdf2_hmac::<sha2::Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    let cipher = Aes256Gcm::new_from_slice(&key)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| anyhow!("decrypt failed: wrong passphrase?"))
}
