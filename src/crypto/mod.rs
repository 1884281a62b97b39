//! Pluggable cryptographic capabilities.
//!
//! Algorithm descriptors are immutable, shared statics; live contexts are
//! per-connection and owned. The engine only ever talks to the traits in this
//! module, so alternative back ends can be dropped in by constructing
//! descriptor values of their own.

mod aead;
mod hashes;
mod kx;
pub mod sign;

pub use aead::{AES_128_GCM, AES_256_GCM, CHACHA20_POLY1305};
pub use hashes::{SHA256, SHA384};
pub use kx::{Secp256r1, X25519};

use zeroize::Zeroizing;

use crate::errors::Error;

/// Output of a completed key exchange; wiped on drop.
pub type SharedSecret = Zeroizing<Vec<u8>>;

/// Identifies the hash function behind a [`Hash`] descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashId {
  Sha256,
  Sha384,
}

/// A hash algorithm descriptor.
pub trait Hash: Send + Sync {
  fn id(&self) -> HashId;
  fn digest_size(&self) -> usize;
  fn block_size(&self) -> usize;
  /// Digest of the empty string, needed by the key schedule's "derived" steps.
  fn empty_digest(&self) -> &'static [u8];
  fn start(&self) -> Box<dyn HashContext>;
  /// One-shot HMAC over the concatenation of `parts`.
  fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Vec<u8>;
}

/// A live hashing context.
pub trait HashContext: Send {
  fn update(&mut self, data: &[u8]);
  /// Digest of the data fed so far; the context is left untouched.
  fn snapshot(&self) -> Vec<u8>;
  /// Digest of the data fed so far; the context is reset to its initial state.
  fn finish_reset(&mut self) -> Vec<u8>;
  /// Independent copy of the context.
  fn fork(&self) -> Box<dyn HashContext>;
}

/// An AEAD algorithm descriptor.
pub trait Aead: Send + Sync {
  fn key_size(&self) -> usize;
  fn iv_size(&self) -> usize;
  fn tag_size(&self) -> usize;
  /// Instantiates a live context. `static_iv` is XORed with the right-aligned
  /// 64-bit sequence number to produce each per-record nonce.
  fn new_context(&self, key: &[u8], static_iv: &[u8]) -> Result<Box<dyn AeadContext>, Error>;
}

/// A live AEAD context carrying its static IV.
pub trait AeadContext: Send {
  fn seal(&self, seq: u64, aad: &[u8], plaintext: &[u8]) -> Vec<u8>;
  fn open(&self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error>;
}

/// A key-exchange algorithm descriptor.
pub trait KeyExchange: Send + Sync {
  /// Group ID from the TLS registry.
  fn group(&self) -> u16;
  /// First phase: generates a key pair whose public half goes into a
  /// key_share. The shared secret is computed later by
  /// [`ActiveKeyExchange::complete`], which allows deferred (possibly
  /// hardware-backed) key operations.
  fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, Error>;
  /// Synchronous variant used by the server: generate, exchange and release
  /// in one call, returning our public key and the shared secret.
  fn exchange(&self, peer: &[u8]) -> Result<(Vec<u8>, SharedSecret), Error>;
}

/// In-flight key exchange created by [`KeyExchange::start`]. Dropping the box
/// releases the context without exchanging.
pub trait ActiveKeyExchange: Send {
  fn group(&self) -> u16;
  fn public_key(&self) -> &[u8];
  fn complete(self: Box<Self>, peer: &[u8]) -> Result<SharedSecret, Error>;
}

/// Produces CertificateVerify signatures for the local certificate chain.
pub trait SignCertificate: Send + Sync {
  /// Picks a mutually supported signature scheme out of the peer's offer.
  fn select_scheme(&self, offered: &[u16]) -> Option<u16>;
  fn sign(&self, scheme: u16, message: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Validates the peer's certificate chain and hands back a verifier for the
/// subsequent CertificateVerify signature.
pub trait VerifyCertificate: Send + Sync {
  fn verify_chain(
    &self,
    certificates: &[&[u8]],
    server_name: Option<&str>,
  ) -> Result<Box<dyn VerifySignature>, Error>;
}

/// One-shot signature verifier returned by [`VerifyCertificate::verify_chain`].
/// Dropping it unconsumed releases any temporary state it holds.
pub trait VerifySignature: Send {
  fn verify(self: Box<Self>, scheme: u16, message: &[u8], signature: &[u8]) -> Result<(), Error>;
}

/// Named groups from the TLS supported-groups registry.
pub mod group {
  pub const SECP256R1: u16 = 23;
  pub const SECP384R1: u16 = 24;
  pub const SECP521R1: u16 = 25;
  pub const X25519: u16 = 29;
  pub const X448: u16 = 30;
}

pub const CIPHER_SUITE_AES_128_GCM_SHA256: u16 = 0x1301;
pub const CIPHER_SUITE_AES_256_GCM_SHA384: u16 = 0x1302;
pub const CIPHER_SUITE_CHACHA20_POLY1305_SHA256: u16 = 0x1303;

/// A negotiable cipher suite: AEAD plus hash under a registry ID.
pub struct CipherSuite {
  pub id: u16,
  pub aead: &'static dyn Aead,
  pub hash: &'static dyn Hash,
}

impl PartialEq for CipherSuite {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl std::fmt::Debug for CipherSuite {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "CipherSuite(0x{:04x})", self.id)
  }
}

pub static TLS_AES_128_GCM_SHA256: CipherSuite =
  CipherSuite { id: CIPHER_SUITE_AES_128_GCM_SHA256, aead: &AES_128_GCM, hash: &SHA256 };

pub static TLS_AES_256_GCM_SHA384: CipherSuite =
  CipherSuite { id: CIPHER_SUITE_AES_256_GCM_SHA384, aead: &AES_256_GCM, hash: &SHA384 };

pub static TLS_CHACHA20_POLY1305_SHA256: CipherSuite =
  CipherSuite { id: CIPHER_SUITE_CHACHA20_POLY1305_SHA256, aead: &CHACHA20_POLY1305, hash: &SHA256 };

/// The recognised suites in default preference order.
pub fn default_cipher_suites() -> Vec<&'static CipherSuite> {
  vec![&TLS_AES_128_GCM_SHA256, &TLS_AES_256_GCM_SHA384, &TLS_CHACHA20_POLY1305_SHA256]
}

/// The built-in key exchanges in default preference order.
pub fn default_key_exchanges() -> Vec<&'static dyn KeyExchange> {
  vec![&X25519 as &'static dyn KeyExchange, &Secp256r1]
}

pub(crate) fn find_cipher_suite(
  suites: &[&'static CipherSuite],
  id: u16,
) -> Option<&'static CipherSuite> {
  suites.iter().copied().find(|s| s.id == id)
}
