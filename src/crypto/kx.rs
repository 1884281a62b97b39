//! Key-exchange providers: X25519 and secp256r1.

use p256::ecdh::EphemeralSecret as P256Secret;
use p256::{EncodedPoint, PublicKey as P256PublicKey};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use super::{group, ActiveKeyExchange, KeyExchange, SharedSecret};
use crate::errors::{AlertDescription, Error};

fn bad_peer_key() -> Error {
  Error::alert(AlertDescription::IllegalParameter)
}

/// X25519 (group 29).
pub struct X25519;

struct X25519Active {
  secret: StaticSecret,
  public: [u8; 32],
}

impl ActiveKeyExchange for X25519Active {
  fn group(&self) -> u16 {
    group::X25519
  }

  fn public_key(&self) -> &[u8] {
    &self.public
  }

  fn complete(self: Box<Self>, peer: &[u8]) -> Result<SharedSecret, Error> {
    let peer: [u8; 32] = peer.try_into().map_err(|_| bad_peer_key())?;
    let shared = self.secret.diffie_hellman(&X25519Public::from(peer));
    if !shared.was_contributory() {
      return Err(bad_peer_key());
    }
    Ok(Zeroizing::new(shared.as_bytes().to_vec()))
  }
}

impl KeyExchange for X25519 {
  fn group(&self) -> u16 {
    group::X25519
  }

  fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, Error> {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret).to_bytes();
    Ok(Box::new(X25519Active { secret, public }))
  }

  fn exchange(&self, peer: &[u8]) -> Result<(Vec<u8>, SharedSecret), Error> {
    let active = self.start()?;
    let public = active.public_key().to_vec();
    let secret = active.complete(peer)?;
    Ok((public, secret))
  }
}

/// NIST P-256 / secp256r1 (group 23).
pub struct Secp256r1;

struct Secp256r1Active {
  secret: P256Secret,
  public: Vec<u8>,
}

impl ActiveKeyExchange for Secp256r1Active {
  fn group(&self) -> u16 {
    group::SECP256R1
  }

  fn public_key(&self) -> &[u8] {
    &self.public
  }

  fn complete(self: Box<Self>, peer: &[u8]) -> Result<SharedSecret, Error> {
    let peer_key = P256PublicKey::from_sec1_bytes(peer).map_err(|_| bad_peer_key())?;
    let shared = self.secret.diffie_hellman(&peer_key);
    Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
  }
}

impl KeyExchange for Secp256r1 {
  fn group(&self) -> u16 {
    group::SECP256R1
  }

  fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, Error> {
    let secret = P256Secret::random(&mut OsRng);
    let public = EncodedPoint::from(secret.public_key()).as_bytes().to_vec();
    Ok(Box::new(Secp256r1Active { secret, public }))
  }

  fn exchange(&self, peer: &[u8]) -> Result<(Vec<u8>, SharedSecret), Error> {
    let active = self.start()?;
    let public = active.public_key().to_vec();
    let secret = active.complete(peer)?;
    Ok((public, secret))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn x25519_agreement() {
    let a = X25519.start().unwrap();
    let (b_public, b_secret) = X25519.exchange(a.public_key()).unwrap();
    let a_secret = a.complete(&b_public).unwrap();
    assert_eq!(*a_secret, *b_secret);
    assert_eq!(a_secret.len(), 32);
  }

  #[test]
  fn p256_agreement() {
    let a = Secp256r1.start().unwrap();
    assert_eq!(a.public_key().len(), 65);
    let (b_public, b_secret) = Secp256r1.exchange(a.public_key()).unwrap();
    let a_secret = a.complete(&b_public).unwrap();
    assert_eq!(*a_secret, *b_secret);
  }

  #[test]
  fn malformed_peer_keys_are_rejected() {
    let a = X25519.start().unwrap();
    assert!(a.complete(b"short").is_err());
    let b = Secp256r1.start().unwrap();
    assert!(b.complete(&[0u8; 65]).is_err());
  }
}
