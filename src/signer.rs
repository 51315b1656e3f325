// =============================================================================
// MOONWIRE v1.1 - Channel Signer
// =============================================================================
//
// The default signer: a secp256k1 keypair held in memory, derived from a
// BIP-39 mnemonic (HMAC-SHA512 master-key derivation) or generated fresh.
// Produces the EIP-191-style commitment signatures the protocol exchanges,
// and decrypts payloads encrypted under this node's identifier.
//
// =============================================================================

use async_trait::async_trait;
use bip39::Mnemonic;
use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use sha2::Sha512;

use crate::crypto;
use crate::interfaces::Signer;
use crate::types::{Address, Bytes32, EngineError, Identifier, Signature};

type HmacSha512 = Hmac<Sha512>;

/// HMAC key for master-key derivation from a mnemonic seed
const MASTER_KEY_DOMAIN: &[u8] = b"Moonwire seed";

/// In-memory secp256k1 signer.
pub struct KeySigner {
    secret: SecretKey,
    address: Address,
    identifier: Identifier,
}

impl KeySigner {
    pub fn from_secret(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        KeySigner {
            secret,
            address: crypto::public_key_to_address(&public),
            identifier: crypto::public_key_to_identifier(&public),
        }
    }

    /// Generate a fresh random keypair.
    pub fn random() -> Self {
        Self::from_secret(SecretKey::new(&mut rand::thread_rng()))
    }

    /// Derive the signing key from a BIP-39 mnemonic phrase.
    pub fn from_mnemonic(phrase: &str) -> Result<Self, EngineError> {
        let mnemonic = Mnemonic::parse(phrase)
            .map_err(|e| EngineError::validation(format!("invalid mnemonic: {}", e)))?;
        let seed = mnemonic.to_seed("");

        let mut mac = HmacSha512::new_from_slice(MASTER_KEY_DOMAIN)
            .map_err(|e| EngineError::external(format!("hmac init: {}", e)))?;
        mac.update(&seed);
        let derived = mac.finalize().into_bytes();

        let secret = SecretKey::from_slice(&derived[..32])
            .map_err(|e| EngineError::external(format!("derived key invalid: {}", e)))?;
        Ok(Self::from_secret(secret))
    }
}

#[async_trait]
impl Signer for KeySigner {
    fn address(&self) -> Address {
        self.address
    }

    fn public_identifier(&self) -> Identifier {
        self.identifier
    }

    async fn sign_commitment(&self, digest: &Bytes32) -> Result<Signature, EngineError> {
        crypto::sign_digest(&self.secret, digest).map_err(EngineError::external)
    }

    async fn decrypt(&self, payload: &str) -> Result<Vec<u8>, EngineError> {
        crypto::decrypt_with_key(payload, &self.secret).map_err(EngineError::external)
    }
}

// =============================================================================
// Tests
// =============================================================================
