//! Encrypted SNI secret plumbing (draft-ietf-tls-esni-02).
//!
//! Parsing the ESNIKeys TXT record is an external collaborator's job. The
//! engine consumes the parsed material: a server holds [`EsniContext`]
//! entries built around long-lived key-exchange secrets, a client passes
//! pre-parsed [`EsniKeys`] through its handshake properties. The inner SNI
//! is sealed with an AEAD keyed from Zx, the extracted ESNI shared secret,
//! using the ClientHello key_share extension as associated data.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{group, CipherSuite, Hash, SharedSecret};
use crate::errors::{AlertDescription, Error};
use crate::key_schedule::{hkdf_extract, hkdf_expand_label, DEFAULT_LABEL_PREFIX};

pub const ESNI_VERSION_DRAFT02: u16 = 0xFF01;
pub(crate) const ESNI_NONCE_SIZE: usize = 16;

/// A long-lived key-exchange secret backing an ESNI key. Unlike the handshake
/// key exchange this is reused across connections, so deriving the shared
/// secret does not consume the context.
pub trait EsniKeyExchange: Send + Sync {
  fn group(&self) -> u16;
  fn public_key(&self) -> &[u8];
  fn derive(&self, peer: &[u8]) -> Result<SharedSecret, Error>;
}

/// X25519-backed ESNI key.
pub struct X25519EsniKey {
  secret: StaticSecret,
  public: [u8; 32],
}

impl X25519EsniKey {
  pub fn random() -> Self {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519Public::from(&secret).to_bytes();
    X25519EsniKey { secret, public }
  }

  pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
    let secret = StaticSecret::from(secret);
    let public = X25519Public::from(&secret).to_bytes();
    X25519EsniKey { secret, public }
  }
}

impl EsniKeyExchange for X25519EsniKey {
  fn group(&self) -> u16 {
    group::X25519
  }

  fn public_key(&self) -> &[u8] {
    &self.public
  }

  fn derive(&self, peer: &[u8]) -> Result<SharedSecret, Error> {
    let peer: [u8; 32] = peer.try_into().map_err(|_| Error::alert(AlertDescription::IllegalParameter))?;
    let shared = self.secret.diffie_hellman(&X25519Public::from(peer));
    if !shared.was_contributory() {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    Ok(Zeroizing::new(shared.as_bytes().to_vec()))
  }
}

/// Cipher-suite/record-digest pair from an ESNIKeys record.
pub struct EsniCipherSuite {
  pub suite: &'static CipherSuite,
  pub record_digest: Vec<u8>,
}

/// Server-side ESNI material (one per published ESNIKeys record).
pub struct EsniContext {
  pub key_exchanges: Vec<Box<dyn EsniKeyExchange>>,
  pub cipher_suites: Vec<EsniCipherSuite>,
  pub padded_length: u16,
  /// Validity window, seconds since the Unix epoch.
  pub not_before: u64,
  pub not_after: u64,
}

impl EsniContext {
  pub fn is_valid_at(&self, now_seconds: u64) -> bool {
    self.not_before <= now_seconds && now_seconds <= self.not_after
  }
}

/// Client-side pre-parsed ESNIKeys.
pub struct EsniKeys {
  /// (group, public key) pairs from the keys' key_share list.
  pub entries: Vec<(u16, Vec<u8>)>,
  pub cipher_suites: Vec<EsniCipherSuite>,
  pub padded_length: u16,
  pub not_before: u64,
  pub not_after: u64,
}

/// Hash of ESNIContents: the record digest, the key share entry we produced
/// and the ClientHello random.
pub(crate) fn hash_esni_contents(
  hash: &'static dyn Hash,
  record_digest: &[u8],
  key_share_group: u16,
  key_share_public: &[u8],
  client_random: &[u8; 32],
) -> Vec<u8> {
  let mut ctx = hash.start();
  ctx.update(&(record_digest.len() as u16).to_be_bytes());
  ctx.update(record_digest);
  ctx.update(&key_share_group.to_be_bytes());
  ctx.update(&(key_share_public.len() as u16).to_be_bytes());
  ctx.update(key_share_public);
  ctx.update(client_random);
  ctx.snapshot()
}

/// Expands Zx into the ESNI AEAD key and IV.
pub(crate) fn esni_aead_material(
  suite: &'static CipherSuite,
  zx: &[u8],
  contents_hash: &[u8],
) -> Result<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>), Error> {
  let key = hkdf_expand_label(
    suite.hash,
    zx,
    "esni key",
    contents_hash,
    suite.aead.key_size(),
    DEFAULT_LABEL_PREFIX,
  )?;
  let iv = hkdf_expand_label(
    suite.hash,
    zx,
    "esni iv",
    contents_hash,
    suite.aead.iv_size(),
    DEFAULT_LABEL_PREFIX,
  )?;
  Ok((key, iv))
}

/// Extracts Zx from the raw shared secret.
pub(crate) fn extract_zx(hash: &'static dyn Hash, z: &[u8]) -> Zeroizing<Vec<u8>> {
  hkdf_extract(hash, &[], z)
}

/// Builds the PaddedServerNameList plaintext: nonce, ServerNameList, zero
/// padding up to `padded_length`.
pub(crate) fn build_padded_sni(
  nonce: &[u8; ESNI_NONCE_SIZE],
  server_name: &str,
  padded_length: u16,
) -> Result<Zeroizing<Vec<u8>>, Error> {
  let name = server_name.as_bytes();
  let list_len = 2 + 1 + 2 + name.len();
  if list_len > padded_length as usize {
    return Err(Error::Library("server name exceeds esni padded_length"));
  }
  let mut out = Zeroizing::new(Vec::with_capacity(ESNI_NONCE_SIZE + padded_length as usize));
  out.extend_from_slice(nonce);
  out.extend_from_slice(&((1 + 2 + name.len()) as u16).to_be_bytes());
  out.push(0); // host_name
  out.extend_from_slice(&(name.len() as u16).to_be_bytes());
  out.extend_from_slice(name);
  out.resize(ESNI_NONCE_SIZE + padded_length as usize, 0);
  Ok(out)
}

/// Parses the decrypted PaddedServerNameList, returning the nonce and name.
pub(crate) fn parse_padded_sni(plaintext: &[u8]) -> Result<([u8; ESNI_NONCE_SIZE], String), Error> {
  if plaintext.len() < ESNI_NONCE_SIZE + 2 {
    return Err(Error::alert(AlertDescription::DecodeError));
  }
  let mut nonce = [0u8; ESNI_NONCE_SIZE];
  nonce.copy_from_slice(&plaintext[..ESNI_NONCE_SIZE]);
  let rest = &plaintext[ESNI_NONCE_SIZE..];
  let list_len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
  if rest.len() < 2 + list_len || list_len < 3 {
    return Err(Error::alert(AlertDescription::DecodeError));
  }
  let list = &rest[2..2 + list_len];
  if list[0] != 0 {
    return Err(Error::alert(AlertDescription::IllegalParameter));
  }
  let name_len = u16::from_be_bytes([list[1], list[2]]) as usize;
  if list.len() != 3 + name_len {
    return Err(Error::alert(AlertDescription::DecodeError));
  }
  let name =
    std::str::from_utf8(&list[3..]).map_err(|_| Error::alert(AlertDescription::DecodeError))?;
  if rest[2 + list_len..].iter().any(|&b| b != 0) {
    return Err(Error::alert(AlertDescription::IllegalParameter));
  }
  Ok((nonce, name.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::TLS_AES_128_GCM_SHA256;

  #[test]
  fn padded_sni_round_trip() {
    let nonce = [0xABu8; ESNI_NONCE_SIZE];
    let padded = build_padded_sni(&nonce, "example.com", 132).unwrap();
    assert_eq!(padded.len(), ESNI_NONCE_SIZE + 132);
    let (parsed_nonce, name) = parse_padded_sni(&padded).unwrap();
    assert_eq!(parsed_nonce, nonce);
    assert_eq!(name, "example.com");
  }

  #[test]
  fn nonzero_padding_is_rejected() {
    let nonce = [0u8; ESNI_NONCE_SIZE];
    let mut padded = build_padded_sni(&nonce, "example.com", 132).unwrap();
    let last = padded.len() - 1;
    padded[last] = 1;
    assert!(parse_padded_sni(&padded).is_err());
  }

  #[test]
  fn esni_sealing_is_symmetric() {
    let server_key = X25519EsniKey::random();
    let suite = &TLS_AES_128_GCM_SHA256;
    let client_random = [7u8; 32];
    let record_digest = vec![1u8; 32];

    // Client side: fresh share against the published key.
    let client_kx = X25519EsniKey::random();
    let z_client = client_kx.derive(server_key.public_key()).unwrap();
    let zx_client = extract_zx(suite.hash, &z_client);
    let contents = hash_esni_contents(
      suite.hash,
      &record_digest,
      client_kx.group(),
      client_kx.public_key(),
      &client_random,
    );
    let (key, iv) = esni_aead_material(suite, &zx_client, &contents).unwrap();
    let aead = suite.aead.new_context(&key, &iv).unwrap();
    let nonce = [9u8; ESNI_NONCE_SIZE];
    let padded = build_padded_sni(&nonce, "secret.example", 260).unwrap();
    let sealed = aead.seal(0, b"key-share-aad", &padded);

    // Server side: recompute from its static secret.
    let z_server = server_key.derive(client_kx.public_key()).unwrap();
    assert_eq!(*z_client, *z_server);
    let zx_server = extract_zx(suite.hash, &z_server);
    let (key, iv) = esni_aead_material(suite, &zx_server, &contents).unwrap();
    let aead = suite.aead.new_context(&key, &iv).unwrap();
    let opened = aead.open(0, b"key-share-aad", &sealed).unwrap();
    let (opened_nonce, name) = parse_padded_sni(&opened).unwrap();
    assert_eq!(opened_nonce, nonce);
    assert_eq!(name, "secret.example");
  }
}
