use std::{hash::BuildHasher, net::SocketAddr, num::NonZeroUsize, sync::Arc};

use ethereum_types::H256;
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use rustc_hash::FxBuildHasher;
use secp256k1::{PublicKey, SECP256K1, SecretKey};

use crate::{
    crypto::{
        CryptoError, SessionKeys, aead_decrypt, aead_encrypt, derive_session_keys, ecdh,
        id_signature,
    },
    packet::Nonce,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("No challenge data, handshake not started")]
    NoChallengeData,
    #[error("Session not established yet")]
    NotEstablished,
    #[error("Operation not allowed for a {0:?} session")]
    WrongRole(SessionRole),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Which side of the handshake we are. The initiator is the node that answered
/// the WHOAREYOU, i.e. node A in the key derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Recipient,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoChallenge,
    /// masking-iv || WHOAREYOU header, signed by the initiator and used as HKDF salt.
    ChallengePending { challenge_data: Vec<u8> },
    Established {
        challenge_data: Vec<u8>,
        keys: SessionKeys,
    },
}

/// A discv5 session with a single (node-id, endpoint) pair.
#[derive(Debug)]
pub struct Session {
    role: SessionRole,
    local_id: H256,
    static_key: SecretKey,
    ephemeral_key: SecretKey,
    state: SessionState,
    /// High 4 bytes of every nonce we send, never reused within the session.
    message_counter: u32,
    /// Set once the peer has shown it holds the session keys.
    confirmed: bool,
}

impl Session {
    pub fn new(
        role: SessionRole,
        local_id: H256,
        static_key: SecretKey,
        ephemeral_key: SecretKey,
    ) -> Self {
        Self {
            role,
            local_id,
            static_key,
            ephemeral_key,
            state: SessionState::NoChallenge,
            message_counter: 0,
            confirmed: false,
        }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_established(&self) -> bool {
        matches!(self.state, SessionState::Established { .. })
    }

    /// Whether messages can go out over this session. The recipient knows once the
    /// handshake decrypts; the initiator derives its keys first and has to wait for a
    /// message from the peer, until then the peer may still be holding a pending challenge.
    pub fn is_confirmed(&self) -> bool {
        self.confirmed && self.is_established()
    }

    /// Records that a message from the peer decrypted. Returns true the first time.
    pub fn confirm(&mut self) -> bool {
        let first = !self.confirmed;
        self.confirmed = true;
        first
    }

    pub fn challenge_data(&self) -> Option<&[u8]> {
        match &self.state {
            SessionState::NoChallenge => None,
            SessionState::ChallengePending { challenge_data }
            | SessionState::Established { challenge_data, .. } => Some(challenge_data),
        }
    }

    /// Stores the challenge for this handshake attempt, replacing any previous one.
    /// An established session keeps its keys.
    pub fn set_challenge_data(&mut self, challenge_data: Vec<u8>) {
        match &mut self.state {
            SessionState::Established {
                challenge_data: current,
                ..
            } => *current = challenge_data,
            state => *state = SessionState::ChallengePending { challenge_data },
        }
    }

    /// Compressed ephemeral public key sent in the handshake authdata.
    pub fn ephemeral_pubkey(&self) -> [u8; 33] {
        self.ephemeral_key.public_key(SECP256K1).serialize()
    }

    /// Signs the current challenge for `dest_id`. `None` when no challenge was received.
    pub fn generate_id_signature(&self, dest_id: &H256) -> Option<[u8; 64]> {
        let challenge_data = self.challenge_data()?;
        Some(id_signature(
            &self.static_key,
            challenge_data,
            &self.ephemeral_pubkey(),
            dest_id,
        ))
    }

    /// Initiator side: ECDH(ephemeral, remote static), derive keys and encrypt with the
    /// initiator key. The session becomes established on success.
    pub fn encrypt_message_with_new_keys(
        &mut self,
        remote_pubkey: &PublicKey,
        remote_id: &H256,
        nonce: &Nonce,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        if self.role != SessionRole::Initiator {
            return Err(SessionError::WrongRole(self.role));
        }
        let challenge_data = self
            .challenge_data()
            .ok_or(SessionError::NoChallengeData)?
            .to_vec();
        let shared_secret = ecdh(&self.ephemeral_key, remote_pubkey);
        let keys = derive_session_keys(&shared_secret, &self.local_id, remote_id, &challenge_data);

        let ciphertext = aead_encrypt(&keys.initiator_key, nonce, plaintext, associated_data)?;
        self.state = SessionState::Established {
            challenge_data,
            keys,
        };
        Ok(ciphertext)
    }

    /// Recipient side: ECDH(static, remote ephemeral), derive keys and decrypt with the
    /// initiator key. The state is left untouched if decryption fails.
    pub fn decrypt_message_with_new_keys(
        &mut self,
        remote_ephemeral_pubkey: &PublicKey,
        remote_id: &H256,
        nonce: &Nonce,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        if self.role != SessionRole::Recipient {
            return Err(SessionError::WrongRole(self.role));
        }
        let challenge_data = self
            .challenge_data()
            .ok_or(SessionError::NoChallengeData)?
            .to_vec();
        let shared_secret = ecdh(&self.static_key, remote_ephemeral_pubkey);
        let keys = derive_session_keys(&shared_secret, remote_id, &self.local_id, &challenge_data);

        let plaintext = aead_decrypt(&keys.initiator_key, nonce, ciphertext, associated_data)?;
        self.state = SessionState::Established {
            challenge_data,
            keys,
        };
        self.confirmed = true;
        Ok(plaintext)
    }

    fn keys(&self) -> Result<&SessionKeys, SessionError> {
        match &self.state {
            SessionState::Established { keys, .. } => Ok(keys),
            _ => Err(SessionError::NotEstablished),
        }
    }

    pub fn encrypt_message(
        &self,
        nonce: &Nonce,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let keys = self.keys()?;
        let key = match self.role {
            SessionRole::Initiator => &keys.initiator_key,
            SessionRole::Recipient => &keys.recipient_key,
        };
        Ok(aead_encrypt(key, nonce, plaintext, associated_data)?)
    }

    /// A failure here doesn't downgrade the session, callers drop it and handshake again.
    pub fn decrypt_message(
        &self,
        nonce: &Nonce,
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, SessionError> {
        let keys = self.keys()?;
        let key = match self.role {
            SessionRole::Initiator => &keys.recipient_key,
            SessionRole::Recipient => &keys.initiator_key,
        };
        Ok(aead_decrypt(key, nonce, ciphertext, associated_data)?)
    }

    /// nonce = message-counter (4 bytes, big endian) || random (8 bytes).
    /// Advances the counter, so every packet sent through the session gets a fresh nonce.
    pub fn next_nonce<R: RngCore + ?Sized>(&mut self, rng: &mut R) -> Nonce {
        let counter = self.message_counter;
        self.message_counter = self.message_counter.wrapping_add(1);

        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&counter.to_be_bytes());
        rng.fill_bytes(&mut nonce[4..]);
        nonce
    }

    pub fn message_counter(&self) -> u32 {
        self.message_counter
    }
}

/// Sessions are scoped to the endpoint the peer was observed at.
pub type SessionKey = (H256, SocketAddr);

type SessionShard = Mutex<LruCache<SessionKey, Arc<Mutex<Session>>>>;

const MAX_SESSION_SHARDS: usize = 16;
/// Small caches stay in a single shard so eviction is exact LRU.
const MIN_SESSIONS_PER_SHARD: usize = 64;

/// Bounded LRU of sessions, split in shards picked by a hash of the key. Each session
/// has its own lock, so handlers only contend on their shard for the cache lookup.
#[derive(Debug)]
pub struct SessionManager {
    local_id: H256,
    static_key: SecretKey,
    shards: Vec<SessionShard>,
}

impl SessionManager {
    pub fn new(local_id: H256, static_key: SecretKey, capacity: NonZeroUsize) -> Self {
        let capacity = capacity.get();
        let shard_count = (capacity / MIN_SESSIONS_PER_SHARD).clamp(1, MAX_SESSION_SHARDS);
        let shards = (0..shard_count)
            .map(|i| {
                // spread the remainder so the shards add up to `capacity`
                let shard_capacity =
                    capacity / shard_count + usize::from(i < capacity % shard_count);
                let shard_capacity =
                    NonZeroUsize::new(shard_capacity).unwrap_or(NonZeroUsize::MIN);
                Mutex::new(LruCache::new(shard_capacity))
            })
            .collect();
        Self {
            local_id,
            static_key,
            shards,
        }
    }

    pub fn local_id(&self) -> H256 {
        self.local_id
    }

    fn shard(&self, key: &SessionKey) -> &SessionShard {
        let index = FxBuildHasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Looks up a session and marks it as most recently used.
    pub fn get_session(&self, node_id: &H256, addr: &SocketAddr) -> Option<Arc<Mutex<Session>>> {
        let key = (*node_id, *addr);
        self.shard(&key).lock().get(&key).cloned()
    }

    /// Creates a session with a fresh ephemeral key, replacing any existing one for the
    /// same key. May evict the least recently used session of its shard.
    pub fn create_session(
        &self,
        role: SessionRole,
        node_id: H256,
        addr: SocketAddr,
    ) -> Arc<Mutex<Session>> {
        let ephemeral_key = SecretKey::new(&mut rand::thread_rng());
        let session = Arc::new(Mutex::new(Session::new(
            role,
            self.local_id,
            self.static_key,
            ephemeral_key,
        )));
        let key = (node_id, addr);
        self.shard(&key).lock().put(key, session.clone());
        session
    }

    pub fn remove_session(&self, node_id: &H256, addr: &SocketAddr) -> Option<Arc<Mutex<Session>>> {
        let key = (*node_id, *addr);
        self.shard(&key).lock().pop(&key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.lock().is_empty())
    }

    pub fn capacity(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().cap().get())
            .sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
