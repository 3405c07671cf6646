//! Handshake and message cryptography.
//!
//! See https://github.com/ethereum/devp2p/blob/master/discv5/discv5-theory.md#identity-specific-cryptography-in-the-handshake

use aes_gcm::{
    Aes128Gcm, KeyInit,
    aead::{Aead, Payload, generic_array::GenericArray},
};
use ethereum_types::H256;
use hkdf::Hkdf;
use secp256k1::{
    Message as SecpMessage, PublicKey, SECP256K1, SecretKey, ecdh::shared_secret_point,
    ecdsa::Signature,
};
use sha2::{Digest, Sha256};

const KEY_AGREEMENT_INFO: &[u8] = b"discovery v5 key agreement";
const ID_SIGNATURE_TEXT: &[u8] = b"discovery v5 identity proof";

pub type AesKey = [u8; 16];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("AEAD encryption failed")]
    EncryptionFailed,
    #[error("AEAD authentication failed")]
    DecryptionFailed,
}

/// Keys agreed during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionKeys {
    pub initiator_key: AesKey,
    pub recipient_key: AesKey,
}

/// Creates a secret through elliptic-curve Diffie-Hellman key agreement,
/// returned as a compressed point.
pub fn ecdh(secret_key: &SecretKey, public_key: &PublicKey) -> [u8; 33] {
    let xy_point = shared_secret_point(public_key, secret_key);
    let mut compressed = [0u8; 33];
    let y = &xy_point[32..];
    compressed[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
    compressed[1..].copy_from_slice(&xy_point[..32]);
    compressed
}

/// HKDF-SHA256 with the challenge data as salt and info = text || id-A || id-B,
/// where A is always the handshake initiator.
pub fn derive_session_keys(
    shared_secret: &[u8],
    node_id_a: &H256,
    node_id_b: &H256,
    challenge_data: &[u8],
) -> SessionKeys {
    let hkdf = Hkdf::<Sha256>::new(Some(challenge_data), shared_secret);

    let mut kdf_info = KEY_AGREEMENT_INFO.to_vec();
    kdf_info.extend_from_slice(node_id_a.as_bytes());
    kdf_info.extend_from_slice(node_id_b.as_bytes());

    let mut key_data = [0u8; 32];
    hkdf.expand(&kdf_info, &mut key_data)
        .expect("key_data is 32 bytes long, it can never fail");

    let mut keys = SessionKeys {
        initiator_key: [0; 16],
        recipient_key: [0; 16],
    };
    keys.initiator_key.copy_from_slice(&key_data[..16]);
    keys.recipient_key.copy_from_slice(&key_data[16..]);
    keys
}

fn id_signature_digest(challenge_data: &[u8], ephemeral_pubkey: &[u8], dest_id: &H256) -> [u8; 32] {
    /*
       id-signature-input = id-signature-text || challenge-data || ephemeral-pubkey || node-id-B
       id-signature       = id_sign(sha256(id-signature-input))
    */
    let mut hasher = Sha256::new();
    hasher.update(ID_SIGNATURE_TEXT);
    hasher.update(challenge_data);
    hasher.update(ephemeral_pubkey);
    hasher.update(dest_id.as_bytes());
    hasher.finalize().into()
}

/// Signs the id-signature input, serialized as r || s.
pub fn id_signature(
    static_key: &SecretKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    dest_id: &H256,
) -> [u8; 64] {
    let digest = id_signature_digest(challenge_data, ephemeral_pubkey, dest_id);
    SECP256K1
        .sign_ecdsa(&SecpMessage::from_digest(digest), static_key)
        .serialize_compact()
}

pub fn verify_id_signature(
    signature: &[u8],
    static_pubkey: &PublicKey,
    challenge_data: &[u8],
    ephemeral_pubkey: &[u8],
    dest_id: &H256,
) -> bool {
    let Ok(signature) = Signature::from_compact(signature) else {
        return false;
    };
    let digest = id_signature_digest(challenge_data, ephemeral_pubkey, dest_id);
    SECP256K1
        .verify_ecdsa(&SecpMessage::from_digest(digest), &signature, static_pubkey)
        .is_ok()
}

/// AES-128-GCM with a 16 byte tag appended to the ciphertext.
pub fn aead_encrypt(
    key: &[u8],
    nonce: &[u8; 12],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .encrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// Fails with [`CryptoError::DecryptionFailed`] on a wrong key, nonce or associated data.
pub fn aead_decrypt(
    key: &[u8],
    nonce: &[u8; 12],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    cipher
        .decrypt(
            GenericArray::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}
