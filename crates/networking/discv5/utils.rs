use ethereum_types::{H256, H512, U256};
use rand::Rng;
use secp256k1::{PublicKey, SECP256K1, SecretKey};
use sha3::{Digest, Keccak256};

pub const NUMBER_OF_BUCKETS: usize = 256;

pub fn keccak(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Computes the node_id from a public key (aka computes the Keccak256 hash of the given public key)
pub fn node_id(public_key: &H512) -> H256 {
    H256(keccak(public_key.as_bytes()))
}

pub fn public_key_from_signing_key(signer: &SecretKey) -> H512 {
    let public_key = PublicKey::from_secret_key(SECP256K1, signer);
    H512::from_slice(&public_key.serialize_uncompressed()[1..])
}

/// Rebuilds a secp256k1 key from its 64 byte uncompressed representation.
pub fn public_key_from_h512(public_key: &H512) -> Option<PublicKey> {
    let mut encoded = [0u8; 65];
    encoded[0] = 0x04;
    encoded[1..].copy_from_slice(public_key.as_bytes());
    PublicKey::from_slice(&encoded).ok()
}

/// Logarithmic distance between two node ids: the bit length of `a XOR b`.
/// Returns 0 for identical ids and at most 256.
pub fn log_distance(a: &H256, b: &H256) -> usize {
    let xor = *a ^ *b;
    U256::from_big_endian(xor.as_bytes()).bits()
}

/// Index of the k-bucket `node_id_2` falls into as seen from `node_id_1`.
/// Identical ids fold into the last bucket.
pub fn bucket_number(node_id_1: &H256, node_id_2: &H256) -> usize {
    match log_distance(node_id_1, node_id_2) {
        0 => NUMBER_OF_BUCKETS - 1,
        distance => distance - 1,
    }
}

/// Generates a random id whose log distance to `local` is exactly `distance`.
pub fn random_node_id_at_distance<R: Rng + ?Sized>(
    local: &H256,
    distance: usize,
    rng: &mut R,
) -> H256 {
    if distance == 0 {
        return *local;
    }
    // bit index counted from the least significant bit
    let bit = distance.min(NUMBER_OF_BUCKETS) - 1;
    let byte = 31 - bit / 8;
    let mask = 1u8 << (bit % 8);
    let below = mask - 1;

    let mut id = local.0;
    id[byte] ^= mask;
    id[byte] = (id[byte] & !below) | (rng.r#gen::<u8>() & below);
    rng.fill(&mut id[byte + 1..]);
    H256(id)
}
