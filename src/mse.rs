//! MSE/PE (Message Stream Encryption / Protocol Encryption): the optional
//! obfuscation layer negotiated over Diffie-Hellman before the BitTorrent
//! handshake proper (spec.md §4.5).
//!
//! No module in the teacher repo covers this -- its own encryption layer is
//! advertised but never wired into the connector (see DESIGN.md). Built from
//! the protocol text directly, using `num-bigint` for the modexp handshake
//! and `rc4` for the stream cipher, the same primitives other BitTorrent
//! implementations in the retrieval pack reach for.

use std::fmt;

use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rc4::{consts::U20, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

use crate::Sha1Hash;

/// The 768-bit MSE prime, big-endian.
const PRIME_HEX: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC7",
    "4020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F14",
    "374FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B",
    "7EDEE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
);

const GENERATOR: u64 = 2;

/// RC4 key stream discard count applied by both sides immediately after key
/// derivation (spec.md §4.5).
const RC4_DISCARD: usize = 1024;

/// The obfuscation policy for outgoing and incoming connections (spec.md
/// §6's `encryption_policy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncryptionPolicy {
    /// Refuse any connection that doesn't negotiate encryption.
    Require,
    /// Offer encryption first, but accept a plaintext fallback.
    Prefer,
    /// Accept either, with no preference.
    Allow,
    /// Never negotiate encryption; connect in plaintext only.
    Forbid,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        EncryptionPolicy::Allow
    }
}

/// The crypto method selected by the handshake's `crypto_select`/
/// `crypto_provide` bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CryptoMethod {
    Plaintext = 0x01,
    Rc4 = 0x02,
}

/// The stage at which an MSE/PE handshake failed, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    KeyExchange,
    Verification,
    MethodSelection,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::KeyExchange => write!(f, "key exchange"),
            Stage::Verification => write!(f, "verification"),
            Stage::MethodSelection => write!(f, "method selection"),
        }
    }
}

/// Failures that can occur during the MSE/PE handshake.
#[derive(Debug)]
#[non_exhaustive]
pub enum EncryptionError {
    /// The handshake failed at the given stage.
    Handshake { stage: Stage },
    /// The peer selected plaintext but our policy requires encryption.
    PlaintextRejected,
    /// An IO error occurred while exchanging handshake bytes.
    Io(std::io::Error),
}

impl fmt::Display for EncryptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionError::Handshake { stage } => {
                write!(f, "MSE/PE handshake failed at {} stage", stage)
            }
            EncryptionError::PlaintextRejected => write!(
                f,
                "peer selected plaintext but encryption is required"
            ),
            EncryptionError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for EncryptionError {}

impl From<std::io::Error> for EncryptionError {
    fn from(e: std::io::Error) -> Self {
        EncryptionError::Io(e)
    }
}

/// This side's Diffie-Hellman keypair for one handshake.
pub(crate) struct DiffieHellman {
    private: BigUint,
    prime: BigUint,
}

impl DiffieHellman {
    /// Generates a fresh 160-bit private key.
    pub fn generate() -> Self {
        let prime = prime();
        let private = OsRng.gen_biguint(160);
        Self { private, prime }
    }

    /// Computes this side's public key `G^X mod P`, encoded as a
    /// fixed-width 96-byte big-endian integer.
    pub fn public_key(&self) -> [u8; 96] {
        let public = BigUint::from(GENERATOR).modpow(&self.private, &self.prime);
        to_fixed_width(&public)
    }

    /// Derives the shared secret `S = Y^X mod P` from the peer's public key.
    pub fn shared_secret(&self, peer_public: &[u8]) -> [u8; 96] {
        let peer_public = BigUint::from_bytes_be(peer_public);
        let secret = peer_public.modpow(&self.private, &self.prime);
        to_fixed_width(&secret)
    }
}

fn prime() -> BigUint {
    BigUint::parse_bytes(PRIME_HEX.as_bytes(), 16)
        .expect("MSE prime constant is valid hex")
}

fn to_fixed_width(n: &BigUint) -> [u8; 96] {
    let bytes = n.to_bytes_be();
    let mut out = [0u8; 96];
    let start = 96 - bytes.len().min(96);
    out[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(96)..]);
    out
}

/// Derives the initiator's (`keyA`) and receiver's (`keyB`) RC4 keys from
/// the shared secret and the torrent's info hash, per spec.md §4.5 step 4.
pub(crate) fn derive_keys(shared_secret: &[u8], info_hash: &Sha1Hash) -> (Sha1Hash, Sha1Hash) {
    let key_a = sha1_concat(&[b"keyA", shared_secret, info_hash]);
    let key_b = sha1_concat(&[b"keyB", shared_secret, info_hash]);
    (key_a, key_b)
}

/// `HASH("req1" || S)`, used by the initiator to let the receiver recognize
/// an MSE negotiation without knowing the info hash in advance.
pub(crate) fn req1_hash(shared_secret: &[u8]) -> Sha1Hash {
    sha1_concat(&[b"req1", shared_secret])
}

/// `HASH("req2" || SKEY) XOR HASH("req3" || S)`, used to convey the info
/// hash (`SKEY`) to the receiver without sending it in cleartext.
pub(crate) fn req23_xor(shared_secret: &[u8], info_hash: &Sha1Hash) -> Sha1Hash {
    let req2 = sha1_concat(&[b"req2", info_hash]);
    let req3 = sha1_concat(&[b"req3", shared_secret]);
    let mut out = [0u8; 20];
    for i in 0..20 {
        out[i] = req2[i] ^ req3[i];
    }
    out
}

fn sha1_concat(parts: &[&[u8]]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.input(part);
    }
    let digest = hasher.result();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// An RC4 keystream for one direction of traffic, with the first
/// `RC4_DISCARD` bytes already discarded as required by spec.md §4.5.
pub(crate) struct RabbitStream {
    cipher: Rc4<U20>,
}

impl RabbitStream {
    pub fn new(key: &Sha1Hash) -> Self {
        let mut cipher = Rc4::<U20>::new_from_slice(key)
            .expect("RC4 key derived from a SHA-1 digest is always 20 bytes");
        let mut discard = vec![0u8; RC4_DISCARD];
        cipher.apply_keystream(&mut discard);
        Self { cipher }
    }

    pub fn apply(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
    }
}

/// Chooses which crypto method to offer, in preference order, for the given
/// policy.
pub(crate) fn offered_methods(policy: EncryptionPolicy) -> Vec<CryptoMethod> {
    match policy {
        EncryptionPolicy::Require => vec![CryptoMethod::Rc4],
        EncryptionPolicy::Prefer => {
            vec![CryptoMethod::Rc4, CryptoMethod::Plaintext]
        }
        EncryptionPolicy::Allow => {
            vec![CryptoMethod::Plaintext, CryptoMethod::Rc4]
        }
        EncryptionPolicy::Forbid => vec![CryptoMethod::Plaintext],
    }
}

/// Validates that `selected` is acceptable under `policy`, per spec.md
/// §4.5's `require_encryption`/`allow_plaintext` knobs.
pub(crate) fn validate_selection(
    policy: EncryptionPolicy,
    selected: CryptoMethod,
) -> Result<(), EncryptionError> {
    if policy == EncryptionPolicy::Require && selected == CryptoMethod::Plaintext
    {
        return Err(EncryptionError::PlaintextRejected);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diffie_hellman_shared_secret_matches() {
        let a = DiffieHellman::generate();
        let b = DiffieHellman::generate();
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        assert_eq!(a.shared_secret(&b_pub), b.shared_secret(&a_pub));
    }

    #[test]
    fn test_rc4_round_trip_after_discard() {
        let key = [7u8; 20];
        let mut enc = RabbitStream::new(&key);
        let mut dec = RabbitStream::new(&key);
        let original = b"hello, bittorrent".to_vec();
        let mut buf = original.clone();
        enc.apply(&mut buf);
        assert_ne!(buf, original);
        dec.apply(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_require_policy_rejects_plaintext() {
        assert!(validate_selection(
            EncryptionPolicy::Require,
            CryptoMethod::Plaintext
        )
        .is_err());
        assert!(validate_selection(
            EncryptionPolicy::Require,
            CryptoMethod::Rc4
        )
        .is_ok());
    }

    #[test]
    fn test_offered_methods_order_reflects_policy() {
        assert_eq!(
            offered_methods(EncryptionPolicy::Prefer)[0],
            CryptoMethod::Rc4
        );
        assert_eq!(
            offered_methods(EncryptionPolicy::Allow)[0],
            CryptoMethod::Plaintext
        );
    }

    #[test]
    fn test_req23_xor_is_reversible_by_receiver() {
        let shared_secret = [3u8; 96];
        let info_hash = [9u8; 20];
        let req2 = sha1_concat(&[b"req2", &info_hash]);
        let xored = req23_xor(&shared_secret, &info_hash);
        let req3 = sha1_concat(&[b"req3", &shared_secret]);
        let mut recovered_req2 = [0u8; 20];
        for i in 0..20 {
            recovered_req2[i] = xored[i] ^ req3[i];
        }
        assert_eq!(recovered_req2, req2);
    }
}
