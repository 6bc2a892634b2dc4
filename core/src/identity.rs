use crate::error::{Result, SyncError};
use crate::store::{KvStore, IDENTITY_KEY};
use bech32::{FromBase32, ToBase32, Variant};
use secp256k1::{schnorr, Keypair, Message, SecretKey, XOnlyPublicKey, SECP256K1};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::info;

const NPUB_HRP: &str = "npub";

/// X-only public key identifying an author or correspondent
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PublicKey(XOnlyPublicKey);

impl PublicKey {
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| SyncError::Key(format!("Invalid hex public key: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        XOnlyPublicKey::from_slice(bytes)
            .map(Self)
            .map_err(|e| SyncError::Key(format!("Invalid public key: {}", e)))
    }

    /// Parse a bech32 `npub1...` string
    pub fn from_npub(npub: &str) -> Result<Self> {
        let (hrp, data, _) = bech32::decode(npub)
            .map_err(|e| SyncError::Key(format!("Invalid npub: {}", e)))?;
        if hrp != NPUB_HRP {
            return Err(SyncError::Key(format!("Expected npub prefix, got {}", hrp)));
        }
        let bytes = Vec::<u8>::from_base32(&data)
            .map_err(|e| SyncError::Key(format!("Invalid npub payload: {}", e)))?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.serialize())
    }

    pub fn to_npub(&self) -> String {
        // encoding 32 bytes under a fixed, valid hrp cannot fail
        bech32::encode(NPUB_HRP, self.0.serialize().to_base32(), Variant::Bech32)
            .unwrap_or_else(|_| self.to_hex())
    }

    pub(crate) fn as_xonly(&self) -> &XOnlyPublicKey {
        &self.0
    }
}

impl FromStr for PublicKey {
    type Err = SyncError;

    /// Accepts either hex or npub form
    fn from_str(s: &str) -> Result<Self> {
        if s.starts_with(NPUB_HRP) {
            Self::from_npub(s)
        } else {
            Self::from_hex(s)
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

/// Signing keypair of the local identity
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: PublicKey,
}

impl Keys {
    pub fn generate() -> Self {
        let keypair = Keypair::new(SECP256K1, &mut secp256k1::rand::thread_rng());
        Self::from_keypair(keypair)
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| SyncError::Key(format!("Invalid hex secret key: {}", e)))?;
        let keypair = Keypair::from_seckey_slice(SECP256K1, &bytes)
            .map_err(|e| SyncError::Key(format!("Invalid secret key: {}", e)))?;
        Ok(Self::from_keypair(keypair))
    }

    fn from_keypair(keypair: Keypair) -> Self {
        let (xonly, _) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key: PublicKey(xonly),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    /// BIP-340 signature over a 32-byte digest
    pub fn sign_digest(&self, digest: [u8; 32]) -> schnorr::Signature {
        let message = Message::from_digest(digest);
        SECP256K1.sign_schnorr_no_aux_rand(&message, &self.keypair)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Load the persisted identity, if any
pub fn load(store: &dyn KvStore) -> Result<Option<Keys>> {
    match store.get(IDENTITY_KEY)? {
        Some(secret_hex) => Keys::from_secret_hex(&secret_hex).map(Some),
        None => Ok(None),
    }
}

pub fn load_or_create(store: &dyn KvStore) -> Result<Keys> {
    if let Some(keys) = load(store)? {
        return Ok(keys);
    }

    let keys = Keys::generate();
    store.set(IDENTITY_KEY, &keys.secret_hex())?;
    info!(pubkey = %keys.public_key(), "Created new identity keypair");
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_public_key_hex_and_npub() {
        let keys = Keys::generate();
        let pk = keys.public_key();

        assert_eq!(PublicKey::from_hex(&pk.to_hex()).unwrap(), pk);

        let npub = pk.to_npub();
        assert!(npub.starts_with("npub1"));
        assert_eq!(npub.parse::<PublicKey>().unwrap(), pk);
    }

    #[test]
    fn test_invalid_public_key() {
        assert!(PublicKey::from_hex("zz").is_err());
        assert!(PublicKey::from_hex("00").is_err());
        assert!("nsec1qqqq".parse::<PublicKey>().is_err());
    }

    #[test]
    fn test_load_or_create_is_stable() {
        let store = MemoryStore::new();
        assert!(load(&store).unwrap().is_none());

        let created = load_or_create(&store).unwrap();
        let loaded = load_or_create(&store).unwrap();
        assert_eq!(created.public_key(), loaded.public_key());
        assert_eq!(created.secret_hex(), loaded.secret_hex());
    }

    #[test]
    fn test_debug_hides_secret() {
        let keys = Keys::generate();
        let debug = format!("{:?}", keys);
        assert!(!debug.contains(&keys.secret_hex()));
    }
}
