use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::OsRng;
use ripemd::Ripemd160;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Version byte prepended to the pubkey hash in Base58Check addresses.
const ADDRESS_VERSION: u8 = 0x00;

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(#[from] secp256k1::Error),

    #[error("Wallet file error: {0}")]
    FileError(#[from] std::io::Error),

    #[error("Wallet file corrupt: {0}")]
    CorruptFile(String),
}

/// A secp256k1 key pair. The public key is kept in the 64-byte x ‖ y
/// coordinate encoding carried on transaction inputs.
#[derive(Debug, Clone)]
pub struct Wallet {
    secret_key: SecretKey,
    pub_key: Vec<u8>,
}

impl Wallet {
    /// Generates a fresh random key pair.
    pub fn new() -> Self {
        let secp = Secp256k1::new();
        let (secret_key, public_key) = secp.generate_keypair(&mut OsRng);
        Self {
            secret_key,
            pub_key: encode_pub_key(&public_key),
        }
    }

    fn from_secret_bytes(bytes: &[u8]) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let secret_key = SecretKey::from_slice(bytes)?;
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);
        Ok(Self {
            secret_key,
            pub_key: encode_pub_key(&public_key),
        })
    }

    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    pub fn pub_key(&self) -> &[u8] {
        &self.pub_key
    }

    /// Base58Check address: version ‖ RIPEMD160(SHA256(pub_key)) ‖ checksum.
    pub fn address(&self) -> String {
        bs58::encode(hash_pub_key(&self.pub_key))
            .with_check_version(ADDRESS_VERSION)
            .into_string()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_pub_key(public_key: &PublicKey) -> Vec<u8> {
    // strip the 0x04 uncompressed-point marker, keeping x ‖ y
    public_key.serialize_uncompressed()[1..].to_vec()
}

/// The pay-to-pubkey-hash locking hash: SHA-256 followed by RIPEMD-160.
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(pub_key);
    Ripemd160::digest(sha).to_vec()
}

/// Decodes an address back to the pubkey hash it commits to.
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>, WalletError> {
    let payload = bs58::decode(address)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .map_err(|e| WalletError::InvalidAddress(format!("{address}: {e}")))?;
    Ok(payload[1..].to_vec())
}

/// Whether `address` carries a valid version byte and checksum.
pub fn validate_address(address: &str) -> bool {
    bs58::decode(address)
        .with_check(Some(ADDRESS_VERSION))
        .into_vec()
        .is_ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredWallet {
    secret_key: Vec<u8>,
    pub_key: Vec<u8>,
}

/// Wallet collaborator: an address -> key pair map persisted as one bincode
/// file.
pub struct Wallets {
    wallets: BTreeMap<String, StoredWallet>,
    path: PathBuf,
}

impl Wallets {
    /// Loads the wallet file at `path`, starting empty if it does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let path = path.as_ref().to_path_buf();
        let wallets = if path.exists() {
            let raw = fs::read(&path)?;
            bincode::deserialize(&raw).map_err(|e| WalletError::CorruptFile(e.to_string()))?
        } else {
            BTreeMap::new()
        };

        Ok(Self { wallets, path })
    }

    /// Generates a key pair, registers it under its address and returns the
    /// address.
    pub fn create_wallet(&mut self) -> String {
        let wallet = Wallet::new();
        let address = wallet.address();
        self.wallets.insert(
            address.clone(),
            StoredWallet {
                secret_key: wallet.secret_key.secret_bytes().to_vec(),
                pub_key: wallet.pub_key.clone(),
            },
        );
        address
    }

    pub fn get_wallet(&self, address: &str) -> Result<Wallet, WalletError> {
        let stored = self
            .wallets
            .get(address)
            .ok_or_else(|| WalletError::UnknownAddress(address.to_string()))?;
        Wallet::from_secret_bytes(&stored.secret_key)
    }

    /// Addresses in the file, in sorted order.
    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    pub fn save(&self) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = bincode::serialize(&self.wallets)
            .map_err(|e| WalletError::CorruptFile(e.to_string()))?;
        fs::write(&self.path, raw)?;
        Ok(())
    }
}
