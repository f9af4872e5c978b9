//! Traits and helpers for the TLS and AEAD collaborators that key a connection
//!
//! The engine never implements cryptography itself. A [`Session`] supplies the TLS handshake,
//! secret export, key derivation and packet sealing; this module sequences those calls into
//! the key schedule run when the handshake completes.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::{Error, Side};

/// Opaque failure reported by a collaborator
#[derive(Debug, Error, Clone, Copy, Eq, PartialEq)]
#[error("cryptographic operation failed")]
pub struct CryptoError;

impl From<CryptoError> for Error {
    fn from(_: CryptoError) -> Self {
        Self::CallbackFailure
    }
}

/// Hash function negotiated by TLS, used as the key schedule's PRF
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    /// Digest size, which is also the length of each exported traffic secret
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }
}

/// AEAD negotiated by TLS for packet protection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AeadAlgorithm {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    pub fn key_len(self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::ChaCha20Poly1305 => 32,
        }
    }

    pub fn iv_len(self) -> usize {
        12
    }

    /// Bytes appended to every sealed payload
    pub fn tag_len(self) -> usize {
        16
    }
}

/// The TLS handshake and the cryptographic primitives a connection drives
///
/// All methods must complete without blocking. When TLS needs more input than has been handed
/// to [`Session::consume_handshake_bytes`], it simply produces nothing until more arrives.
pub trait Session {
    /// Handshake bytes TLS wants delivered to the peer, possibly none
    fn produce_handshake_bytes(&mut self) -> Result<Vec<u8>, CryptoError>;

    /// Hand TLS handshake bytes received from the peer, in order
    fn consume_handshake_bytes(&mut self, data: &[u8]) -> Result<(), CryptoError>;

    /// Whether TLS is still waiting on handshake messages
    fn is_handshaking(&self) -> bool;

    /// `None` if the handshake has not negotiated a hash this engine understands
    fn negotiated_hash(&self) -> Option<HashAlgorithm>;

    /// `None` if the handshake has not negotiated an AEAD this engine understands
    fn negotiated_aead(&self) -> Option<AeadAlgorithm>;

    /// Export the traffic secret protecting packets sent by `sender`
    fn export_secret(&mut self, sender: Side, len: usize) -> Result<Vec<u8>, CryptoError>;

    /// Derive a packet protection key from a traffic secret
    fn derive_key(
        &self,
        hash: HashAlgorithm,
        aead: AeadAlgorithm,
        secret: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Derive a packet protection IV from a traffic secret
    fn derive_iv(
        &self,
        hash: HashAlgorithm,
        aead: AeadAlgorithm,
        secret: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Largest number of bytes sealing may add to a payload
    fn aead_overhead(&self, aead: AeadAlgorithm) -> usize {
        aead.tag_len()
    }

    /// Seal `payload` in place, appending the authentication tag
    fn encrypt(
        &self,
        aead: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;

    /// Open `payload` in place, removing the authentication tag
    fn decrypt(
        &self,
        aead: AeadAlgorithm,
        key: &[u8],
        nonce: &[u8],
        ad: &[u8],
        payload: &mut Vec<u8>,
    ) -> Result<(), CryptoError>;
}

/// Algorithms and traffic secrets fixed when the handshake completes
#[derive(Clone, Eq, PartialEq)]
pub struct CryptoContext {
    pub hash: HashAlgorithm,
    pub aead: AeadAlgorithm,
    pub secret_len: usize,
    pub tx_secret: Vec<u8>,
    pub rx_secret: Vec<u8>,
    /// Bytes sealing adds to each 1-RTT payload
    pub overhead: usize,
}

impl fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoContext")
            .field("hash", &self.hash)
            .field("aead", &self.aead)
            .field("secret_len", &self.secret_len)
            .field("overhead", &self.overhead)
            .finish_non_exhaustive()
    }
}

/// Key and IV protecting one direction of 1-RTT traffic
#[derive(Clone, Eq, PartialEq)]
pub struct PacketKey {
    key: Vec<u8>,
    iv: Vec<u8>,
}

impl PacketKey {
    fn derive<S: Session + ?Sized>(
        session: &S,
        hash: HashAlgorithm,
        aead: AeadAlgorithm,
        secret: &[u8],
    ) -> Result<Self, Error> {
        let key = session.derive_key(hash, aead, secret)?;
        let iv = session.derive_iv(hash, aead, secret)?;
        if key.len() != aead.key_len() || iv.len() != aead.iv_len() {
            debug!(key = key.len(), iv = iv.len(), "derived key material has wrong length");
            return Err(Error::CallbackFailure);
        }
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Per-packet nonce: the IV XORed with the big-endian packet number in its last 8 bytes
    pub fn nonce(&self, packet_number: u64) -> Vec<u8> {
        let mut nonce = self.iv.clone();
        let tail = nonce.len().min(8);
        let start = nonce.len() - tail;
        let pn = packet_number.to_be_bytes();
        for (out, x) in nonce[start..].iter_mut().zip(&pn[8 - tail..]) {
            *out ^= x;
        }
        nonce
    }
}

impl fmt::Debug for PacketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PacketKey { .. }")
    }
}

/// Packet protection for both directions, installed together
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Keys {
    pub tx: PacketKey,
    pub rx: PacketKey,
}

/// Run the 1-RTT key schedule once TLS reports the handshake complete
///
/// Secrets and keys are derived for the transmit direction first, then the receive direction.
/// Nothing is returned unless every step succeeds, so a failure leaves no direction keyed.
pub fn setup_crypto_context<S: Session + ?Sized>(
    session: &mut S,
    side: Side,
) -> Result<(CryptoContext, Keys), Error> {
    let hash = session.negotiated_hash().ok_or(Error::InvalidState)?;
    let aead = session.negotiated_aead().ok_or(Error::InvalidState)?;
    let secret_len = hash.digest_len();

    let tx_secret = export(session, side, secret_len)?;
    let tx = PacketKey::derive(session, hash, aead, &tx_secret)?;

    let rx_secret = export(session, !side, secret_len)?;
    let rx = PacketKey::derive(session, hash, aead, &rx_secret)?;

    let overhead = session.aead_overhead(aead);
    let ctx = CryptoContext {
        hash,
        aead,
        secret_len,
        tx_secret,
        rx_secret,
        overhead,
    };
    Ok((ctx, Keys { tx, rx }))
}

fn export<S: Session + ?Sized>(
    session: &mut S,
    sender: Side,
    len: usize,
) -> Result<Vec<u8>, Error> {
    let secret = session.export_secret(sender, len)?;
    if secret.len() != len {
        debug!(expected = len, actual = secret.len(), "exported secret has wrong length");
        return Err(Error::CallbackFailure);
    }
    Ok(secret)
}
