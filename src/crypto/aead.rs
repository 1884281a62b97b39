//! AEAD providers: AES-128/256-GCM and ChaCha20-Poly1305.

use aes_gcm::aead::{Aead as _, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use super::{Aead, AeadContext};
use crate::errors::{AlertDescription, Error};

pub(crate) const AEAD_IV_SIZE: usize = 12;
pub(crate) const AEAD_TAG_SIZE: usize = 16;

/// Builds the per-record nonce: static IV XOR right-aligned sequence number.
pub(crate) fn nonce_for(static_iv: &[u8; AEAD_IV_SIZE], seq: u64) -> [u8; AEAD_IV_SIZE] {
  let mut nonce = [0u8; AEAD_IV_SIZE];
  nonce[4..].copy_from_slice(&seq.to_be_bytes());
  nonce.iter_mut().zip(static_iv.iter()).for_each(|(n, iv)| *n ^= *iv);
  nonce
}

struct AeadCtx<C> {
  cipher: C,
  static_iv: [u8; AEAD_IV_SIZE],
}

impl<C> Drop for AeadCtx<C> {
  fn drop(&mut self) {
    self.static_iv.zeroize();
  }
}

impl<C> AeadContext for AeadCtx<C>
where
  C: aes_gcm::aead::Aead + Send,
{
  fn seal(&self, seq: u64, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
    let nonce = nonce_for(&self.static_iv, seq);
    self
      .cipher
      .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
      .expect("aead encryption is infallible for in-range inputs")
  }

  fn open(&self, seq: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    let nonce = nonce_for(&self.static_iv, seq);
    self
      .cipher
      .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
      .map_err(|_| Error::alert(AlertDescription::BadRecordMac))
  }
}

fn check_key_material(key: &[u8], static_iv: &[u8], key_size: usize) -> Result<(), Error> {
  if key.len() != key_size || static_iv.len() != AEAD_IV_SIZE {
    return Err(Error::Library("aead key material has the wrong length"));
  }
  Ok(())
}

fn iv_array(static_iv: &[u8]) -> [u8; AEAD_IV_SIZE] {
  let mut iv = [0u8; AEAD_IV_SIZE];
  iv.copy_from_slice(static_iv);
  iv
}

pub struct Aes128GcmAead;
/// AES-128-GCM descriptor.
pub static AES_128_GCM: Aes128GcmAead = Aes128GcmAead;

impl Aead for Aes128GcmAead {
  fn key_size(&self) -> usize {
    16
  }

  fn iv_size(&self) -> usize {
    AEAD_IV_SIZE
  }

  fn tag_size(&self) -> usize {
    AEAD_TAG_SIZE
  }

  fn new_context(&self, key: &[u8], static_iv: &[u8]) -> Result<Box<dyn AeadContext>, Error> {
    check_key_material(key, static_iv, self.key_size())?;
    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::Library("bad aes-128 key"))?;
    Ok(Box::new(AeadCtx { cipher, static_iv: iv_array(static_iv) }))
  }
}

pub struct Aes256GcmAead;
/// AES-256-GCM descriptor.
pub static AES_256_GCM: Aes256GcmAead = Aes256GcmAead;

impl Aead for Aes256GcmAead {
  fn key_size(&self) -> usize {
    32
  }

  fn iv_size(&self) -> usize {
    AEAD_IV_SIZE
  }

  fn tag_size(&self) -> usize {
    AEAD_TAG_SIZE
  }

  fn new_context(&self, key: &[u8], static_iv: &[u8]) -> Result<Box<dyn AeadContext>, Error> {
    check_key_material(key, static_iv, self.key_size())?;
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::Library("bad aes-256 key"))?;
    Ok(Box::new(AeadCtx { cipher, static_iv: iv_array(static_iv) }))
  }
}

pub struct ChaCha20Poly1305Aead;
/// ChaCha20-Poly1305 descriptor.
pub static CHACHA20_POLY1305: ChaCha20Poly1305Aead = ChaCha20Poly1305Aead;

impl Aead for ChaCha20Poly1305Aead {
  fn key_size(&self) -> usize {
    32
  }

  fn iv_size(&self) -> usize {
    AEAD_IV_SIZE
  }

  fn tag_size(&self) -> usize {
    AEAD_TAG_SIZE
  }

  fn new_context(&self, key: &[u8], static_iv: &[u8]) -> Result<Box<dyn AeadContext>, Error> {
    check_key_material(key, static_iv, self.key_size())?;
    let cipher =
      ChaCha20Poly1305::new_from_slice(key).map_err(|_| Error::Library("bad chacha20 key"))?;
    Ok(Box::new(AeadCtx { cipher, static_iv: iv_array(static_iv) }))
  }
}
