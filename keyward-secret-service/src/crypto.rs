//! Primitives for the `dh-ietf1024-sha256-aes128-cbc-pkcs7` session algorithm.
//!
//! Key agreement uses the 1024-bit MODP group from RFC 2409 (Oakley group 2,
//! generator 2). The shared secret is run through HKDF-SHA256 with an empty
//! salt and empty info to obtain a 16-byte AES-128 key.

use std::fmt;

use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use hkdf::Hkdf;
use keyward_core::{Error, Result};
use num_bigint::BigUint;
use rand::TryRngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Length in bytes of group elements (public keys and shared secrets).
pub const DH_KEY_LEN: usize = 128;
pub const AES_KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;

const DH_GENERATOR: u32 = 2;

/// RFC 2409 section 6.2, big-endian.
const DH_PRIME: [u8; DH_KEY_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xc9, 0x0f, 0xda, 0xa2, 0x21, 0x68, 0xc2, 0x34,
    0xc4, 0xc6, 0x62, 0x8b, 0x80, 0xdc, 0x1c, 0xd1, 0x29, 0x02, 0x4e, 0x08, 0x8a, 0x67, 0xcc, 0x74,
    0x02, 0x0b, 0xbe, 0xa6, 0x3b, 0x13, 0x9b, 0x22, 0x51, 0x4a, 0x08, 0x79, 0x8e, 0x34, 0x04, 0xdd,
    0xef, 0x95, 0x19, 0xb3, 0xcd, 0x3a, 0x43, 0x1b, 0x30, 0x2b, 0x0a, 0x6d, 0xf2, 0x5f, 0x14, 0x37,
    0x4f, 0xe1, 0x35, 0x6d, 0x6d, 0x51, 0xc2, 0x45, 0xe4, 0x85, 0xb5, 0x76, 0x62, 0x5e, 0x7e, 0xc6,
    0xf4, 0x4c, 0x42, 0xe9, 0xa6, 0x37, 0xed, 0x6b, 0x0b, 0xff, 0x5c, 0xb6, 0xf4, 0x06, 0xb7, 0xed,
    0xee, 0x38, 0x6b, 0xfb, 0x5a, 0x89, 0x9f, 0xa5, 0xae, 0x9f, 0x24, 0x11, 0x7c, 0x4b, 0x1f, 0xe6,
    0x49, 0x28, 0x66, 0x51, 0xec, 0xe6, 0x53, 0x81, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME)
}

// ---------------------------------------------------------------------------
// Diffie-Hellman
// ---------------------------------------------------------------------------

/// One side's DH key pair.
///
/// The private exponent is kept as big-endian bytes in a zeroizing buffer;
/// intermediate big integers are dropped as soon as the public key or shared
/// secret has been computed.
pub struct DhKeyPair {
    private: Zeroizing<Vec<u8>>,
    public_bytes: Vec<u8>,
}

impl DhKeyPair {
    /// Build a key pair from a fixed private exponent.
    pub fn from_private_bytes(private: &[u8]) -> Result<Self> {
        let x = BigUint::from_bytes_be(private);
        let p = prime();
        if x < BigUint::from(2u32) || x > &p - 2u32 {
            return Err(Error::CryptoFailure(
                "private exponent outside [2, p-2]".to_string(),
            ));
        }
        let public = BigUint::from(DH_GENERATOR).modpow(&x, &p);
        Ok(Self {
            private: Zeroizing::new(private.to_vec()),
            public_bytes: to_padded_bytes(&public).to_vec(),
        })
    }

    /// Public key, big-endian, left-padded to 128 bytes.
    pub fn public_bytes(&self) -> &[u8] {
        &self.public_bytes
    }
}

impl fmt::Debug for DhKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeyPair")
            .field("private", &"[redacted]")
            .field("public_len", &self.public_bytes.len())
            .finish()
    }
}

/// Generate a fresh key pair with a uniformly chosen exponent in [2, p-2].
pub fn generate_dh_keypair() -> Result<DhKeyPair> {
    let mut raw = Zeroizing::new([0u8; DH_KEY_LEN]);
    OsRng
        .try_fill_bytes(&mut *raw)
        .map_err(|e| Error::CryptoFailure(format!("entropy source failed: {e}")))?;

    // (r mod (p - 3)) + 2 lands in [2, p-2].
    let p = prime();
    let x = BigUint::from_bytes_be(&*raw) % (&p - 3u32) + 2u32;
    let exponent = to_padded_bytes(&x);
    DhKeyPair::from_private_bytes(&exponent)
}

/// `peer_public ^ own_private mod p`, big-endian, left-padded to 128 bytes.
pub fn compute_shared_secret(
    own: &DhKeyPair,
    peer_public: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let p = prime();
    let peer = BigUint::from_bytes_be(peer_public);
    if peer < BigUint::from(2u32) || peer > &p - 2u32 {
        return Err(Error::CryptoFailure(
            "peer public key outside [2, p-2]".to_string(),
        ));
    }
    let x = BigUint::from_bytes_be(&own.private);
    Ok(to_padded_bytes(&peer.modpow(&x, &p)))
}

fn to_padded_bytes(n: &BigUint) -> Zeroizing<Vec<u8>> {
    let raw = Zeroizing::new(n.to_bytes_be());
    let mut out = Zeroizing::new(vec![0u8; DH_KEY_LEN.saturating_sub(raw.len())]);
    out.extend_from_slice(&raw);
    out
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// HKDF-SHA256 with empty salt and empty info, 16 bytes of output.
pub fn derive_key(shared_secret: &[u8]) -> Result<Zeroizing<[u8; AES_KEY_LEN]>> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = Zeroizing::new([0u8; AES_KEY_LEN]);
    hkdf.expand(&[], &mut *key)
        .map_err(|_| Error::CryptoFailure("HKDF expand failed".to_string()))?;
    Ok(key)
}

/// Full client/server key agreement: shared secret, then HKDF.
pub fn derive_session_key(
    own: &DhKeyPair,
    peer_public: &[u8],
) -> Result<Zeroizing<[u8; AES_KEY_LEN]>> {
    let shared = compute_shared_secret(own, peer_public)?;
    derive_key(&shared)
}

// ---------------------------------------------------------------------------
// AES-128-CBC / PKCS7
// ---------------------------------------------------------------------------

/// Encrypt with a fresh random IV. Returns `(iv, ciphertext)`.
pub fn aes128_cbc_encrypt(key: &[u8; AES_KEY_LEN], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut iv = [0u8; IV_LEN];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| Error::CryptoFailure(format!("entropy source failed: {e}")))?;
    let cipher = Aes128CbcEnc::new(key.into(), (&iv).into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    Ok((iv.to_vec(), ciphertext))
}

/// Inverse of [`aes128_cbc_encrypt`].
///
/// Every failure (IV length, partial block, bad padding) is reported as the
/// same [`Error::DecryptionFailure`].
pub fn aes128_cbc_decrypt(
    key: &[u8; AES_KEY_LEN],
    iv: &[u8],
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    if iv.len() != IV_LEN || ciphertext.is_empty() || ciphertext.len() % IV_LEN != 0 {
        return Err(Error::DecryptionFailure);
    }
    let cipher =
        Aes128CbcDec::new_from_slices(key, iv).map_err(|_| Error::DecryptionFailure)?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| Error::DecryptionFailure)
}
