//! Security policies, key material and cryptographic transforms.
//!
//! Symmetric transforms (HMAC-SHA-256 signing, AES-CBC encryption, P_SHA256
//! key derivation) are implemented here. Asymmetric (RSA) operations and
//! X.509 chain validation belong to the embedding application's crypto and
//! PKI providers and enter through the [`KeyPair`], [`PeerIdentity`] and
//! [`Pki`] traits.
//!
//! [`KeyPair`]: trait.KeyPair.html
//! [`PeerIdentity`]: trait.PeerIdentity.html
//! [`Pki`]: trait.Pki.html

use aes::cipher::block_padding::NoPadding;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use ring::{digest, hmac};

use {SecurityMode, Side, StatusCode};

/// A security policy supported by this implementation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityPolicy {
    None,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
}

impl SecurityPolicy {
    pub fn uri(self) -> &'static str {
        match self {
            SecurityPolicy::None => "http://opcfoundation.org/UA/SecurityPolicy#None",
            SecurityPolicy::Basic256Sha256 => {
                "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256"
            }
            SecurityPolicy::Aes128Sha256RsaOaep => {
                "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep"
            }
        }
    }

    pub fn from_uri(uri: &str) -> Option<SecurityPolicy> {
        match uri {
            "http://opcfoundation.org/UA/SecurityPolicy#None" => Some(SecurityPolicy::None),
            "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256" => {
                Some(SecurityPolicy::Basic256Sha256)
            }
            "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep" => {
                Some(SecurityPolicy::Aes128Sha256RsaOaep)
            }
            _ => None,
        }
    }

    /// Length of the channel nonce each peer contributes during OPN.
    pub fn nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            _ => 32,
        }
    }

    /// Length of a symmetric signature (HMAC-SHA-256 for both suites).
    pub fn symmetric_signature_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            _ => 32,
        }
    }

    /// Symmetric signing key length.
    pub fn signing_key_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            _ => 32,
        }
    }

    /// Symmetric encryption key length (AES-256 vs AES-128).
    pub fn encrypting_key_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic256Sha256 => 32,
            SecurityPolicy::Aes128Sha256RsaOaep => 16,
        }
    }

    /// Symmetric cipher block size; plaintext and ciphertext blocks are the
    /// same size for CBC suites.
    pub fn symmetric_block_size(self) -> usize {
        match self {
            SecurityPolicy::None => 1,
            _ => 16,
        }
    }

    /// SHA-1 certificate thumbprint length.
    pub fn thumbprint_length(self) -> usize {
        20
    }
}

/// One direction's worth of symmetric key material.
#[derive(Clone)]
pub struct KeySet {
    pub signing: Vec<u8>,
    pub encrypting: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Key sets for both directions of one security token.
#[derive(Clone)]
pub struct KeySets {
    /// Keys this peer applies to outbound chunks.
    pub sender: KeySet,
    /// Keys used to decrypt and verify inbound chunks.
    pub receiver: KeySet,
}

/// Private key and certificate of the local application, implemented by the
/// embedding crypto provider.
pub trait KeyPair: Send + Sync {
    /// RSA-decrypt a sequence of whole cipher blocks.
    fn decrypt(&self, cipher: &[u8]) -> Result<Vec<u8>, StatusCode>;
    /// RSA-sign `data` with the policy's asymmetric signature algorithm.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, StatusCode>;
    /// Cipher block size of material encrypted *to* this key.
    fn cipher_block_size(&self) -> usize;
    /// Plaintext bytes carried per cipher block.
    fn plain_block_size(&self) -> usize;
    fn signature_size(&self) -> usize;
}

/// Public key extracted from a validated peer certificate.
pub trait PeerIdentity {
    /// RSA-encrypt whole plaintext blocks to the peer.
    fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, StatusCode>;
    fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), StatusCode>;
    fn cipher_block_size(&self) -> usize;
    fn plain_block_size(&self) -> usize;
    fn signature_size(&self) -> usize;
}

/// Certificate chain validation, implemented by the embedding PKI provider.
pub trait Pki: Send + Sync {
    fn validate(&self, cert_der: &[u8], policy: SecurityPolicy) -> Result<(), StatusCode>;
    fn peer_identity(&self, cert_der: &[u8]) -> Result<Box<PeerIdentity>, StatusCode>;
}

/// SHA-1 thumbprint of a DER certificate, as carried in the asymmetric
/// security header.
pub fn thumbprint(cert_der: &[u8]) -> Vec<u8> {
    digest::digest(&digest::SHA1, cert_der).as_ref().to_vec()
}

/// TLS P_SHA256 pseudo-random function (Part 6 §6.7.5).
fn p_sha256(secret: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let key = hmac::SigningKey::new(&digest::SHA256, secret);
    let mut out = Vec::with_capacity(out_len);
    // A(1) = HMAC(secret, seed)
    let mut a = hmac::sign(&key, seed).as_ref().to_vec();
    while out.len() < out_len {
        let mut input = a.clone();
        input.extend_from_slice(seed);
        out.extend_from_slice(hmac::sign(&key, &input).as_ref());
        a = hmac::sign(&key, &a).as_ref().to_vec();
    }
    out.truncate(out_len);
    out
}

fn cbc_encrypt(key: &[u8], iv: &[u8], plain: &[u8]) -> Result<Vec<u8>, StatusCode> {
    if plain.len() % 16 != 0 {
        return Err(StatusCode::BAD_ENCODING_ERROR);
    }
    match key.len() {
        16 => {
            let enc = cbc::Encryptor::<::aes::Aes128>::new_from_slices(key, iv)
                .map_err(|_| StatusCode::BAD_ENCODING_ERROR)?;
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plain))
        }
        32 => {
            let enc = cbc::Encryptor::<::aes::Aes256>::new_from_slices(key, iv)
                .map_err(|_| StatusCode::BAD_ENCODING_ERROR)?;
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(plain))
        }
        _ => Err(StatusCode::BAD_ENCODING_ERROR),
    }
}

fn cbc_decrypt(key: &[u8], iv: &[u8], cipher: &[u8]) -> Result<Vec<u8>, StatusCode> {
    if cipher.len() % 16 != 0 {
        return Err(StatusCode::BAD_SECURITY_CHECKS_FAILED);
    }
    match key.len() {
        16 => cbc::Decryptor::<::aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)?
            .decrypt_padded_vec_mut::<NoPadding>(cipher)
            .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED),
        32 => cbc::Decryptor::<::aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)?
            .decrypt_padded_vec_mut::<NoPadding>(cipher)
            .map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED),
        _ => Err(StatusCode::BAD_SECURITY_CHECKS_FAILED),
    }
}

/// Policy-bound cryptographic context of one secure connection, created when
/// the first OPN fixes the security policy and mode.
pub struct Crypto {
    policy: SecurityPolicy,
    mode: SecurityMode,
}

impl Crypto {
    pub fn new(policy: SecurityPolicy, mode: SecurityMode) -> Crypto {
        Crypto { policy, mode }
    }

    pub fn policy(&self) -> SecurityPolicy {
        self.policy
    }

    pub fn mode(&self) -> SecurityMode {
        self.mode
    }

    /// Whether chunk payloads are encrypted. OPN chunks are encrypted
    /// whenever any security is active, MSG/CLO only in SignAndEncrypt.
    pub fn is_encrypted(&self, is_opn: bool) -> bool {
        match self.mode {
            SecurityMode::None => false,
            SecurityMode::Sign => is_opn,
            SecurityMode::SignAndEncrypt => true,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.mode != SecurityMode::None
    }

    /// Generate a channel nonce of the policy's length.
    pub fn generate_nonce<R: RngCore>(&self, rng: &mut R) -> Vec<u8> {
        let mut nonce = vec![0; self.policy.nonce_length()];
        rng.fill_bytes(&mut nonce);
        nonce
    }

    /// Derive the key sets used by a client, from the nonces exchanged
    /// during OPN.
    pub fn derive_client_key_sets(&self, client_nonce: &[u8], server_nonce: &[u8]) -> KeySets {
        KeySets {
            sender: self.derive_key_set(server_nonce, client_nonce),
            receiver: self.derive_key_set(client_nonce, server_nonce),
        }
    }

    /// Derive the key sets used by a server; the mirror image of
    /// `derive_client_key_sets`.
    pub fn derive_server_key_sets(&self, client_nonce: &[u8], server_nonce: &[u8]) -> KeySets {
        KeySets {
            sender: self.derive_key_set(client_nonce, server_nonce),
            receiver: self.derive_key_set(server_nonce, client_nonce),
        }
    }

    pub fn derive_key_sets(&self, side: Side, client_nonce: &[u8], server_nonce: &[u8]) -> KeySets {
        match side {
            Side::Client => self.derive_client_key_sets(client_nonce, server_nonce),
            Side::Server => self.derive_server_key_sets(client_nonce, server_nonce),
        }
    }

    fn derive_key_set(&self, secret: &[u8], seed: &[u8]) -> KeySet {
        let sig_len = self.policy.signing_key_length();
        let enc_len = self.policy.encrypting_key_length();
        let iv_len = self.policy.symmetric_block_size();
        if self.mode == SecurityMode::None {
            return KeySet {
                signing: Vec::new(),
                encrypting: Vec::new(),
                iv: Vec::new(),
            };
        }
        let material = p_sha256(secret, seed, sig_len + enc_len + iv_len);
        KeySet {
            signing: material[..sig_len].to_vec(),
            encrypting: material[sig_len..sig_len + enc_len].to_vec(),
            iv: material[sig_len + enc_len..].to_vec(),
        }
    }

    /// HMAC-SHA-256 signature over `data` with the key set's signing key.
    pub fn symmetric_sign(&self, keys: &KeySet, data: &[u8]) -> Vec<u8> {
        let key = hmac::SigningKey::new(&digest::SHA256, &keys.signing);
        hmac::sign(&key, data).as_ref().to_vec()
    }

    pub fn symmetric_verify(
        &self,
        keys: &KeySet,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), StatusCode> {
        let key = hmac::VerificationKey::new(&digest::SHA256, &keys.signing);
        hmac::verify(&key, data, signature).map_err(|_| StatusCode::BAD_SECURITY_CHECKS_FAILED)
    }

    pub fn symmetric_encrypt(&self, keys: &KeySet, plain: &[u8]) -> Result<Vec<u8>, StatusCode> {
        cbc_encrypt(&keys.encrypting, &keys.iv, plain)
    }

    pub fn symmetric_decrypt(&self, keys: &KeySet, cipher: &[u8]) -> Result<Vec<u8>, StatusCode> {
        cbc_decrypt(&keys.encrypting, &keys.iv, cipher)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn crypto() -> Crypto {
        Crypto::new(SecurityPolicy::Basic256Sha256, SecurityMode::SignAndEncrypt)
    }

    fn key_sets() -> (KeySets, KeySets) {
        let c = crypto();
        let client_nonce = [0x11; 32];
        let server_nonce = [0x22; 32];
        (
            c.derive_client_key_sets(&client_nonce, &server_nonce),
            c.derive_server_key_sets(&client_nonce, &server_nonce),
        )
    }

    #[test]
    fn p_sha256_is_deterministic_and_sized() {
        let a = p_sha256(b"secret", b"seed", 80);
        let b = p_sha256(b"secret", b"seed", 80);
        assert_eq!(a, b);
        assert_eq!(a.len(), 80);
        // A prefix request yields a prefix of the longer output
        assert_eq!(p_sha256(b"secret", b"seed", 16), &a[..16]);
        assert_ne!(p_sha256(b"other", b"seed", 80), a);
    }

    #[test]
    fn derivation_is_mirrored_between_roles() {
        let (client, server) = key_sets();
        assert_eq!(client.sender.signing, server.receiver.signing);
        assert_eq!(client.sender.encrypting, server.receiver.encrypting);
        assert_eq!(client.sender.iv, server.receiver.iv);
        assert_eq!(client.receiver.signing, server.sender.signing);
        // The two directions must not share keys
        assert_ne!(client.sender.signing, client.receiver.signing);
    }

    #[test]
    fn encrypt_decrypt_is_identity_on_block_multiples() {
        let c = crypto();
        let (client, server) = key_sets();
        let plain = vec![0x5A; 64];
        let cipher = c.symmetric_encrypt(&client.sender, &plain).unwrap();
        assert_ne!(cipher, plain);
        assert_eq!(cipher.len(), plain.len());
        let decrypted = c.symmetric_decrypt(&server.receiver, &cipher).unwrap();
        assert_eq!(decrypted, plain);
    }

    #[test]
    fn encrypt_rejects_partial_blocks() {
        let c = crypto();
        let (client, _) = key_sets();
        assert_eq!(
            c.symmetric_encrypt(&client.sender, &[0; 17]),
            Err(StatusCode::BAD_ENCODING_ERROR)
        );
    }

    #[test]
    fn sign_verify_is_identity() {
        let c = crypto();
        let (client, server) = key_sets();
        let data = b"chunk bytes to authenticate";
        let sig = c.symmetric_sign(&client.sender, data);
        assert_eq!(sig.len(), 32);
        assert_eq!(c.symmetric_verify(&server.receiver, data, &sig), Ok(()));
        assert_eq!(
            c.symmetric_verify(&server.receiver, b"tampered", &sig),
            Err(StatusCode::BAD_SECURITY_CHECKS_FAILED)
        );
    }

    #[test]
    fn none_mode_derives_empty_keys() {
        let c = Crypto::new(SecurityPolicy::None, SecurityMode::None);
        let keys = c.derive_client_key_sets(&[], &[]);
        assert!(keys.sender.signing.is_empty());
        assert!(!c.is_signed());
        assert!(!c.is_encrypted(true));
    }

    #[test]
    fn opn_is_encrypted_in_sign_mode() {
        let c = Crypto::new(SecurityPolicy::Basic256Sha256, SecurityMode::Sign);
        assert!(c.is_encrypted(true));
        assert!(!c.is_encrypted(false));
        assert!(c.is_signed());
    }

    #[test]
    fn thumbprint_is_sha1_sized() {
        assert_eq!(thumbprint(b"not really a certificate").len(), 20);
    }
}
