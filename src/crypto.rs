// =============================================================================
// MOONWIRE v1.2 - Hashing & Signatures
// =============================================================================
//
// Cryptographic plumbing for the channel protocol:
//
// - keccak256 / sha256 digests
// - EIP-191-style message signing with recoverable secp256k1 signatures
// - signer-address and identifier derivation from public keys
// - create2 channel-address derivation (deterministic from participants)
// - ECDH + AES-256-GCM payload encryption for secret delivery to a peer
//   identifier (e.g. routed hashlock preimages)
//
// =============================================================================

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::types::{Address, Bytes32, Identifier, Signature};

// =============================================================================
// Constants
// =============================================================================

/// Prefix applied before signing a 32-byte digest (EIP-191 personal message)
const SIGNED_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// create2 leading byte
const CREATE2_PREFIX: u8 = 0xff;

/// Stand-in for the channel proxy init-code hash the factory deploys with
const CHANNEL_PROXY_INIT_CODE: &[u8] = b"moonwire-channel-proxy-v1";

const AES_NONCE_SIZE: usize = 12;

// =============================================================================
// Digests
// =============================================================================

/// keccak256 digest
pub fn keccak256(data: &[u8]) -> Bytes32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    Bytes32(out)
}

/// Single SHA256 digest (hashlock preimages)
pub fn sha256(data: &[u8]) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    Bytes32(out)
}

/// The digest actually signed: prefixed per EIP-191 and hashed again.
pub fn signed_message_digest(digest: &Bytes32) -> Bytes32 {
    let mut data = Vec::with_capacity(SIGNED_MESSAGE_PREFIX.len() + 32);
    data.extend_from_slice(SIGNED_MESSAGE_PREFIX);
    data.extend_from_slice(&digest.0);
    keccak256(&data)
}

// =============================================================================
// Keys, Addresses, Identifiers
// =============================================================================

/// Signer address: last 20 bytes of keccak256 over the uncompressed pubkey.
pub fn public_key_to_address(public_key: &PublicKey) -> Address {
    let uncompressed = public_key.serialize_uncompressed();
    let digest = keccak256(&uncompressed[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.0[12..]);
    Address(out)
}

/// Peer identifier: the compressed pubkey, used for messaging addressing.
pub fn public_key_to_identifier(public_key: &PublicKey) -> Identifier {
    Identifier(public_key.serialize())
}

/// Recover the signer address behind an identifier.
pub fn identifier_to_address(identifier: &Identifier) -> Result<Address, String> {
    let public_key = PublicKey::from_slice(&identifier.0)
        .map_err(|e| format!("invalid identifier: {}", e))?;
    Ok(public_key_to_address(&public_key))
}

// =============================================================================
// Signing & Recovery
// =============================================================================

/// Sign a 32-byte digest, returning r || s || v (v = 27 or 28).
pub fn sign_digest(secret_key: &SecretKey, digest: &Bytes32) -> Result<Signature, String> {
    let secp = Secp256k1::new();
    let prefixed = signed_message_digest(digest);
    let message = Message::from_digest(prefixed.0);
    let recoverable = secp.sign_ecdsa_recoverable(&message, secret_key);
    let (recovery_id, compact) = recoverable.serialize_compact();
    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&compact);
    out[64] = (recovery_id.to_i32() as u8) + 27;
    Ok(Signature(out))
}

/// Recover the signer address of a signature over a 32-byte digest.
pub fn recover_signer(digest: &Bytes32, signature: &Signature) -> Result<Address, String> {
    let secp = Secp256k1::new();
    let v = signature.0[64];
    let recovery = v.checked_sub(27).ok_or("invalid recovery byte")?;
    let recovery_id =
        RecoveryId::from_i32(recovery as i32).map_err(|e| format!("invalid recovery id: {}", e))?;
    let recoverable = RecoverableSignature::from_compact(&signature.0[..64], recovery_id)
        .map_err(|e| format!("invalid signature: {}", e))?;
    let prefixed = signed_message_digest(digest);
    let message = Message::from_digest(prefixed.0);
    let public_key = secp
        .recover_ecdsa(&message, &recoverable)
        .map_err(|e| format!("recovery failed: {}", e))?;
    Ok(public_key_to_address(&public_key))
}

/// Check that `signature` over `digest` recovers to `expected`.
pub fn verify_signature(
    digest: &Bytes32,
    signature: &Signature,
    expected: &Address,
) -> Result<(), String> {
    let recovered = recover_signer(digest, signature)?;
    if recovered != *expected {
        return Err(format!(
            "signature recovered {} but expected {}",
            recovered, expected
        ));
    }
    Ok(())
}

// =============================================================================
// Channel Address Derivation (create2)
// =============================================================================

/// Deterministic channel address: create2 over the factory with a salt
/// binding both participants and the chain id. Both peers and the adjudicator
/// derive the same address without coordination.
pub fn derive_channel_address(
    alice: &Address,
    bob: &Address,
    chain_id: u64,
    factory: &Address,
) -> Address {
    let mut salt_input = Vec::with_capacity(48);
    salt_input.extend_from_slice(&alice.0);
    salt_input.extend_from_slice(&bob.0);
    salt_input.extend_from_slice(&chain_id.to_be_bytes());
    let salt = keccak256(&salt_input);
    let init_code_hash = keccak256(CHANNEL_PROXY_INIT_CODE);

    let mut data = Vec::with_capacity(1 + 20 + 32 + 32);
    data.push(CREATE2_PREFIX);
    data.extend_from_slice(&factory.0);
    data.extend_from_slice(&salt.0);
    data.extend_from_slice(&init_code_hash.0);
    let digest = keccak256(&data);

    let mut out = [0u8; 20];
    out.copy_from_slice(&digest.0[12..]);
    Address(out)
}

// =============================================================================
// Payload Encryption (ECDH + AES-256-GCM)
// =============================================================================

/// Encrypt a payload so only the holder of `recipient`'s key can read it.
/// Output: hex(ephemeral_pubkey[33] || nonce[12] || ciphertext).
pub fn encrypt_to_identifier(plaintext: &[u8], recipient: &Identifier) -> Result<String, String> {
    let secp = Secp256k1::new();
    let recipient_key = PublicKey::from_slice(&recipient.0)
        .map_err(|e| format!("invalid recipient identifier: {}", e))?;

    let ephemeral_secret = SecretKey::new(&mut rand::thread_rng());
    let ephemeral_public = PublicKey::from_secret_key(&secp, &ephemeral_secret);

    let shared = secp256k1::ecdh::SharedSecret::new(&recipient_key, &ephemeral_secret);
    let key = sha256(&shared.secret_bytes());

    let nonce_bytes: [u8; AES_NONCE_SIZE] = rand::random();
    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key.0));
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| "encryption failed".to_string())?;

    let mut out = Vec::with_capacity(33 + AES_NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&ephemeral_public.serialize());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(hex::encode(out))
}

/// Decrypt a payload produced by [`encrypt_to_identifier`].
pub fn decrypt_with_key(payload: &str, secret_key: &SecretKey) -> Result<Vec<u8>, String> {
    let raw = hex::decode(payload).map_err(|e| format!("invalid payload hex: {}", e))?;
    if raw.len() < 33 + AES_NONCE_SIZE {
        return Err("payload too short".to_string());
    }
    let ephemeral_public =
        PublicKey::from_slice(&raw[..33]).map_err(|e| format!("invalid ephemeral key: {}", e))?;
    let nonce_bytes = &raw[33..33 + AES_NONCE_SIZE];
    let ciphertext = &raw[33 + AES_NONCE_SIZE..];

    let shared = secp256k1::ecdh::SharedSecret::new(&ephemeral_public, secret_key);
    let key = sha256(&shared.secret_bytes());

    let cipher = Aes256Gcm::new(GenericArray::from_slice(&key.0));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| "decryption failed".to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let secret = SecretKey::new(&mut rand::thread_rng());
        let public = PublicKey::from_secret_key(&secp, &secret);
        (secret, public)
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") is a fixed constant
        let empty = keccak256(b"");
        assert_eq!(
            empty.to_hex(),
            "0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_sign_and_recover() {
        let (secret, public) = keypair();
        let digest = keccak256(b"channel commitment");
        let signature = sign_digest(&secret, &digest).unwrap();
        let recovered = recover_signer(&digest, &signature).unwrap();
        assert_eq!(recovered, public_key_to_address(&public));
    }

    #[test]
    fn test_verify_rejects_wrong_signer() {
        let (secret, _) = keypair();
        let (_, other_public) = keypair();
        let digest = keccak256(b"payload");
        let signature = sign_digest(&secret, &digest).unwrap();
        assert!(
            verify_signature(&digest, &signature, &public_key_to_address(&other_public)).is_err()
        );
    }

    #[test]
    fn test_recover_rejects_tampered_digest() {
        let (secret, public) = keypair();
        let digest = keccak256(b"original");
        let signature = sign_digest(&secret, &digest).unwrap();
        let tampered = keccak256(b"tampered");
        let recovered = recover_signer(&tampered, &signature).unwrap();
        assert_ne!(recovered, public_key_to_address(&public));
    }

    #[test]
    fn test_identifier_to_address() {
        let (_, public) = keypair();
        let identifier = public_key_to_identifier(&public);
        let address = identifier_to_address(&identifier).unwrap();
        assert_eq!(address, public_key_to_address(&public));
    }

    #[test]
    fn test_channel_address_deterministic() {
        let alice = Address::from_bytes([1; 20]);
        let bob = Address::from_bytes([2; 20]);
        let factory = Address::from_bytes([9; 20]);

        let a = derive_channel_address(&alice, &bob, 1, &factory);
        let b = derive_channel_address(&alice, &bob, 1, &factory);
        assert_eq!(a, b);

        // participant order, chain, and factory all matter
        assert_ne!(a, derive_channel_address(&bob, &alice, 1, &factory));
        assert_ne!(a, derive_channel_address(&alice, &bob, 137, &factory));
        assert_ne!(
            a,
            derive_channel_address(&alice, &bob, 1, &Address::from_bytes([8; 20]))
        );
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (secret, public) = keypair();
        let identifier = public_key_to_identifier(&public);

        let plaintext = b"the preimage";
        let payload = encrypt_to_identifier(plaintext, &identifier).unwrap();
        let decrypted = decrypt_with_key(&payload, &secret).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let (_, public) = keypair();
        let (wrong_secret, _) = keypair();
        let identifier = public_key_to_identifier(&public);

        let payload = encrypt_to_identifier(b"secret", &identifier).unwrap();
        assert!(decrypt_with_key(&payload, &wrong_secret).is_err());
    }
}
