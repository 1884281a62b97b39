//! SHA-256 / SHA-384 hash providers backed by RustCrypto.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256 as Sha256Impl, Sha384 as Sha384Impl};

use super::{Hash, HashContext, HashId};

const SHA256_EMPTY_DIGEST: [u8; 32] = [
  0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
  0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

const SHA384_EMPTY_DIGEST: [u8; 48] = [
  0x38, 0xb0, 0x60, 0xa7, 0x51, 0xac, 0x96, 0x38, 0x4c, 0xd9, 0x32, 0x7e, 0xb1, 0xb1, 0xe3, 0x6a,
  0x21, 0xfd, 0xb7, 0x11, 0x14, 0xbe, 0x07, 0x43, 0x4c, 0x0c, 0xc7, 0xbf, 0x63, 0xf6, 0xe1, 0xda,
  0x27, 0x4e, 0xde, 0xbf, 0xe7, 0x6f, 0x65, 0xfb, 0xd5, 0x1a, 0xd2, 0xf1, 0x48, 0x98, 0xb9, 0x5b,
];

struct DigestContext<D: Digest + Clone + Send + 'static>(D);

impl<D: Digest + Clone + Send + 'static> HashContext for DigestContext<D> {
  fn update(&mut self, data: &[u8]) {
    Digest::update(&mut self.0, data);
  }

  fn snapshot(&self) -> Vec<u8> {
    self.0.clone().finalize().to_vec()
  }

  fn finish_reset(&mut self) -> Vec<u8> {
    std::mem::replace(&mut self.0, D::new()).finalize().to_vec()
  }

  fn fork(&self) -> Box<dyn HashContext> {
    Box::new(DigestContext(self.0.clone()))
  }
}

pub struct Sha256Alg;
/// SHA-256 descriptor.
pub static SHA256: Sha256Alg = Sha256Alg;

impl Hash for Sha256Alg {
  fn id(&self) -> HashId {
    HashId::Sha256
  }

  fn digest_size(&self) -> usize {
    32
  }

  fn block_size(&self) -> usize {
    64
  }

  fn empty_digest(&self) -> &'static [u8] {
    &SHA256_EMPTY_DIGEST
  }

  fn start(&self) -> Box<dyn HashContext> {
    Box::new(DigestContext(Sha256Impl::new()))
  }

  fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = Hmac::<Sha256Impl>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
      mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
  }
}

pub struct Sha384Alg;
/// SHA-384 descriptor.
pub static SHA384: Sha384Alg = Sha384Alg;

impl Hash for Sha384Alg {
  fn id(&self) -> HashId {
    HashId::Sha384
  }

  fn digest_size(&self) -> usize {
    48
  }

  fn block_size(&self) -> usize {
    128
  }

  fn empty_digest(&self) -> &'static [u8] {
    &SHA384_EMPTY_DIGEST
  }

  fn start(&self) -> Box<dyn HashContext> {
    Box::new(DigestContext(Sha384Impl::new()))
  }

  fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = Hmac::<Sha384Impl>::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
      mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::Hash;

  #[test]
  fn empty_digest_matches_live_context() {
    assert_eq!(SHA256.start().snapshot(), SHA256.empty_digest());
    assert_eq!(SHA384.start().snapshot(), SHA384.empty_digest());
  }

  #[test]
  fn snapshot_leaves_context_usable() {
    let mut ctx = SHA256.start();
    ctx.update(b"abc");
    let first = ctx.snapshot();
    ctx.update(b"def");
    let second = ctx.snapshot();
    assert_ne!(first, second);

    let mut oneshot = SHA256.start();
    oneshot.update(b"abcdef");
    assert_eq!(oneshot.snapshot(), second);
  }

  #[test]
  fn fork_is_independent() {
    let mut ctx = SHA256.start();
    ctx.update(b"shared");
    let mut forked = ctx.fork();
    forked.update(b"-left");
    ctx.update(b"-right");
    assert_ne!(ctx.snapshot(), forked.snapshot());
  }
}
