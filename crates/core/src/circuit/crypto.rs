use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use onionpath_common::{protocol, OnionError};
use rand::RngCore;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const FAST_KEY_LEN: usize = protocol::HASH_LEN;
const X25519_KEY_LEN: usize = 32;

/// Offset of the 4-byte digest inside a relay payload
const DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Offset of the `recognized` field inside a relay payload
const RECOGNIZED_RANGE: std::ops::Range<usize> = 1..3;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Handshake verification failed")]
    HandshakeVerificationFailed,

    #[error("Invalid handshake length: expected {expected}, got {actual}")]
    InvalidHandshakeLength { expected: usize, actual: usize },

    #[error("Peer public key is not contributory")]
    InvalidPublicKey,
}

impl From<CryptoError> for OnionError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::HandshakeVerificationFailed => OnionError::HandshakeVerificationFailed,
            other => OnionError::Protocol(other.to_string()),
        }
    }
}

/// Which side of the hop owns this state.
///
/// A client sends with the forward keys and receives with the backward
/// keys; a server is the mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeKind {
    /// CREATE_FAST: no asymmetric exchange, first hop only
    Fast,
    /// CREATE2/EXTEND2 with an X25519 exchange
    X25519,
}

impl HandshakeKind {
    pub fn onion_skin_len(&self) -> usize {
        match self {
            Self::Fast => FAST_KEY_LEN,
            Self::X25519 => X25519_KEY_LEN,
        }
    }

    pub fn reply_len(&self) -> usize {
        self.onion_skin_len() + protocol::HASH_LEN
    }
}

enum PendingSecret {
    Fast(Zeroizing<[u8; FAST_KEY_LEN]>),
    X25519 {
        secret: EphemeralSecret,
        public: X25519PublicKey,
    },
}

/// Client half of a hop handshake waiting for the peer's reply
pub struct HopHandshake {
    pending: PendingSecret,
}

impl std::fmt::Debug for HopHandshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopHandshake")
            .field("kind", &self.kind())
            .finish()
    }
}

impl HopHandshake {
    pub fn client(kind: HandshakeKind) -> Self {
        match kind {
            HandshakeKind::Fast => Self::client_fast(),
            HandshakeKind::X25519 => Self::client_x25519(),
        }
    }

    pub fn client_fast() -> Self {
        let mut x = Zeroizing::new([0u8; FAST_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut x[..]);
        Self {
            pending: PendingSecret::Fast(x),
        }
    }

    pub fn client_x25519() -> Self {
        let secret = EphemeralSecret::random_from_rng(&mut rand::thread_rng());
        let public = X25519PublicKey::from(&secret);
        Self {
            pending: PendingSecret::X25519 { secret, public },
        }
    }

    pub fn kind(&self) -> HandshakeKind {
        match self.pending {
            PendingSecret::Fast(_) => HandshakeKind::Fast,
            PendingSecret::X25519 { .. } => HandshakeKind::X25519,
        }
    }

    /// Bytes sent to the peer: X for the fast handshake, the public value otherwise
    pub fn onion_skin(&self) -> Vec<u8> {
        match &self.pending {
            PendingSecret::Fast(x) => x.to_vec(),
            PendingSecret::X25519 { public, .. } => public.as_bytes().to_vec(),
        }
    }

    /// Consume the reply `Y | KH` and derive the hop state.
    ///
    /// The secret is consumed either way; a failed handshake cannot be retried.
    pub fn complete(self, reply: &[u8]) -> Result<HopCryptoState, CryptoError> {
        let kind = self.kind();
        if reply.len() < kind.reply_len() {
            return Err(CryptoError::InvalidHandshakeLength {
                expected: kind.reply_len(),
                actual: reply.len(),
            });
        }
        let (y, rest) = reply.split_at(kind.onion_skin_len());
        let their_kh = &rest[..protocol::HASH_LEN];

        let k0: Zeroizing<Vec<u8>> = match self.pending {
            PendingSecret::Fast(x) => {
                let mut k0 = Vec::with_capacity(2 * FAST_KEY_LEN);
                k0.extend_from_slice(&x[..]);
                k0.extend_from_slice(y);
                Zeroizing::new(k0)
            }
            PendingSecret::X25519 { secret, .. } => {
                // Honest peers never set the ignored top bit of a Montgomery u-coordinate
                if y[X25519_KEY_LEN - 1] & 0x80 != 0 {
                    return Err(CryptoError::HandshakeVerificationFailed);
                }
                let mut peer = [0u8; X25519_KEY_LEN];
                peer.copy_from_slice(y);
                let shared = secret.diffie_hellman(&X25519PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err(CryptoError::InvalidPublicKey);
                }
                Zeroizing::new(shared.as_bytes().to_vec())
            }
        };

        let (state, kh) = HopCryptoState::derive(HopRole::Client, &k0);
        if !bool::from(kh.as_slice().ct_eq(their_kh)) {
            return Err(CryptoError::HandshakeVerificationFailed);
        }
        Ok(state)
    }
}

/// Symmetric state for one hop: two AES-128-CTR keystreams and two running
/// SHA-1 digests, one per direction.
///
/// Both keystreams and digests only ever move forward.
pub struct HopCryptoState {
    role: HopRole,
    outbound_cipher: Aes128Ctr,
    inbound_cipher: Aes128Ctr,
    outbound_digest: Sha1,
    inbound_digest: Sha1,
}

impl std::fmt::Debug for HopCryptoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HopCryptoState")
            .field("role", &self.role)
            .field("ciphers", &"<AES-128-CTR>")
            .finish()
    }
}

impl HopCryptoState {
    /// Answer a client's onion skin, returning the server state and the reply `Y | KH`
    pub fn respond(kind: HandshakeKind, onion_skin: &[u8]) -> Result<(Self, Vec<u8>), CryptoError> {
        if onion_skin.len() < kind.onion_skin_len() {
            return Err(CryptoError::InvalidHandshakeLength {
                expected: kind.onion_skin_len(),
                actual: onion_skin.len(),
            });
        }
        let skin = &onion_skin[..kind.onion_skin_len()];

        let (k0, y): (Zeroizing<Vec<u8>>, Vec<u8>) = match kind {
            HandshakeKind::Fast => {
                let mut y = [0u8; FAST_KEY_LEN];
                rand::thread_rng().fill_bytes(&mut y);
                let mut k0 = Vec::with_capacity(2 * FAST_KEY_LEN);
                k0.extend_from_slice(skin);
                k0.extend_from_slice(&y);
                (Zeroizing::new(k0), y.to_vec())
            }
            HandshakeKind::X25519 => {
                let mut peer = [0u8; X25519_KEY_LEN];
                peer.copy_from_slice(skin);
                let secret = EphemeralSecret::random_from_rng(&mut rand::thread_rng());
                let public = X25519PublicKey::from(&secret);
                let shared = secret.diffie_hellman(&X25519PublicKey::from(peer));
                if !shared.was_contributory() {
                    return Err(CryptoError::InvalidPublicKey);
                }
                (
                    Zeroizing::new(shared.as_bytes().to_vec()),
                    public.as_bytes().to_vec(),
                )
            }
        };

        let (state, kh) = Self::derive(HopRole::Server, &k0);
        let mut reply = y;
        reply.extend_from_slice(kh.as_slice());
        Ok((state, reply))
    }

    /// Run KDF-TOR over `k0` and build the state for `role`.
    ///
    /// Returns the state together with the handshake-verification key KH.
    pub fn derive(role: HopRole, k0: &[u8]) -> (Self, Zeroizing<[u8; protocol::HASH_LEN]>) {
        let material = kdf_tor(k0);
        let h = protocol::HASH_LEN;
        let k = protocol::KEY_LEN;

        let mut kh = Zeroizing::new([0u8; protocol::HASH_LEN]);
        kh.copy_from_slice(&material[..h]);
        let df = &material[h..2 * h];
        let db = &material[2 * h..3 * h];
        let kf = &material[3 * h..3 * h + k];
        let kb = &material[3 * h + k..3 * h + 2 * k];

        let zero_iv = [0u8; 16];
        let forward_cipher = Aes128Ctr::new(kf.into(), (&zero_iv).into());
        let backward_cipher = Aes128Ctr::new(kb.into(), (&zero_iv).into());
        let mut forward_digest = Sha1::new();
        forward_digest.update(df);
        let mut backward_digest = Sha1::new();
        backward_digest.update(db);

        let state = match role {
            HopRole::Client => Self {
                role,
                outbound_cipher: forward_cipher,
                inbound_cipher: backward_cipher,
                outbound_digest: forward_digest,
                inbound_digest: backward_digest,
            },
            HopRole::Server => Self {
                role,
                outbound_cipher: backward_cipher,
                inbound_cipher: forward_cipher,
                outbound_digest: backward_digest,
                inbound_digest: forward_digest,
            },
        };
        (state, kh)
    }

    pub fn role(&self) -> HopRole {
        self.role
    }

    /// Stamp the running digest into a plaintext relay payload addressed to
    /// (or originating at) this hop.
    pub fn seal_outbound(&mut self, payload: &mut [u8; protocol::CELL_PAYLOAD_LEN]) {
        payload[RECOGNIZED_RANGE].fill(0);
        payload[DIGEST_RANGE].fill(0);
        self.outbound_digest.update(&payload[..]);
        let digest = self.outbound_digest.clone().finalize();
        payload[DIGEST_RANGE].copy_from_slice(&digest[..4]);
    }

    /// Add this hop's layer to an outbound payload
    pub fn encrypt_outbound(&mut self, payload: &mut [u8]) {
        self.outbound_cipher.apply_keystream(payload);
    }

    /// Remove this hop's layer from an inbound payload
    pub fn decrypt_inbound(&mut self, payload: &mut [u8]) {
        self.inbound_cipher.apply_keystream(payload);
    }

    /// Check whether a decrypted payload is addressed to this hop.
    ///
    /// The running digest is committed only when the cell is recognized.
    pub fn recognize_inbound(&mut self, payload: &[u8; protocol::CELL_PAYLOAD_LEN]) -> bool {
        if payload[RECOGNIZED_RANGE] != [0, 0] {
            return false;
        }

        let mut scratch = *payload;
        scratch[DIGEST_RANGE].fill(0);
        let mut candidate = self.inbound_digest.clone();
        candidate.update(&scratch[..]);
        let digest = candidate.clone().finalize();

        if bool::from(digest[..4].ct_eq(&payload[DIGEST_RANGE])) {
            self.inbound_digest = candidate;
            true
        } else {
            false
        }
    }
}

/// KDF-TOR: SHA1(K0 | 0) | SHA1(K0 | 1) | ... truncated to 100 bytes
fn kdf_tor(k0: &[u8]) -> Zeroizing<[u8; protocol::KDF_OUTPUT_LEN]> {
    let mut out = Zeroizing::new([0u8; protocol::KDF_OUTPUT_LEN]);
    for (i, chunk) in out.chunks_mut(protocol::HASH_LEN).enumerate() {
        let mut hasher = Sha1::new();
        hasher.update(k0);
        hasher.update([i as u8]);
        let block = hasher.finalize();
        chunk.copy_from_slice(&block[..chunk.len()]);
    }
    out
}
