//! Record layer: 5-byte header framing and AEAD protection.
//!
//! Each direction of a connection owns a [`TrafficProtection`] per epoch:
//! the traffic secret, the AEAD context expanded from it and the 64-bit
//! record sequence number. Sealing appends whole records to the caller's
//! buffer, fragmenting at the 2^14-byte plaintext bound; opening decrypts a
//! single record and strips the inner content type and its zero padding.

use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::codec::Reader;
use crate::crypto::{AeadContext, CipherSuite};
use crate::errors::{AlertDescription, Error};
use crate::key_schedule::hkdf_expand_label;

/// Largest permitted record plaintext (RFC 8446 §5.1).
pub const MAX_PLAINTEXT_RECORD_SIZE: usize = 16384;
/// Largest permitted record ciphertext (RFC 8446 §5.2).
pub const MAX_CIPHERTEXT_RECORD_SIZE: usize = MAX_PLAINTEXT_RECORD_SIZE + 256;
/// Record header: content type, legacy version, 16-bit length.
pub const RECORD_HEADER_SIZE: usize = 5;

pub(crate) const LEGACY_RECORD_VERSION: u16 = 0x0303;

/// Write sequence threshold past which the engine rekeys on its own; a single
/// key must never protect more than 2^48 records.
pub(crate) const SEQ_SOFT_LIMIT: u64 = 1 << 48;

/// The single permissible ChangeCipherSpec record.
pub(crate) const CHANGE_CIPHER_SPEC_RECORD: [u8; 6] = [0x14, 0x03, 0x03, 0x00, 0x01, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
  ChangeCipherSpec = 20,
  Alert = 21,
  Handshake = 22,
  ApplicationData = 23,
}

impl ContentType {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      20 => Some(Self::ChangeCipherSpec),
      21 => Some(Self::Alert),
      22 => Some(Self::Handshake),
      23 => Some(Self::ApplicationData),
      _ => None,
    }
  }
}

fn record_header(content_type: u8, len: usize) -> [u8; RECORD_HEADER_SIZE] {
  let [version_hi, version_lo] = LEGACY_RECORD_VERSION.to_be_bytes();
  [content_type, version_hi, version_lo, (len >> 8) as u8, len as u8]
}

/// Per-direction, per-epoch protection state.
pub(crate) struct TrafficProtection {
  suite: &'static CipherSuite,
  secret: Zeroizing<Vec<u8>>,
  aead: Box<dyn AeadContext>,
  seq: u64,
  epoch: usize,
}

impl TrafficProtection {
  /// Expands `secret` into key and IV and installs a fresh AEAD context.
  pub fn new(
    suite: &'static CipherSuite,
    secret: &[u8],
    epoch: usize,
    label_prefix: &str,
  ) -> Result<Self, Error> {
    let key =
      hkdf_expand_label(suite.hash, secret, "key", &[], suite.aead.key_size(), label_prefix)?;
    let iv = hkdf_expand_label(suite.hash, secret, "iv", &[], suite.aead.iv_size(), label_prefix)?;
    let aead = suite.aead.new_context(&key, &iv)?;
    Ok(TrafficProtection { suite, secret: Zeroizing::new(secret.to_vec()), aead, seq: 0, epoch })
  }

  pub fn epoch(&self) -> usize {
    self.epoch
  }

  pub fn seq(&self) -> u64 {
    self.seq
  }

  pub fn secret(&self) -> &[u8] {
    &self.secret
  }

  /// The next-generation protection for a KeyUpdate:
  /// HKDF-Expand-Label(current, "traffic upd", "", Hash.length), sequence
  /// reset to zero.
  pub fn updated(&self, label_prefix: &str) -> Result<Self, Error> {
    let next = hkdf_expand_label(
      self.suite.hash,
      &self.secret,
      "traffic upd",
      &[],
      self.suite.hash.digest_size(),
      label_prefix,
    )?;
    TrafficProtection::new(self.suite, &next, self.epoch, label_prefix)
  }

  fn next_seq(&mut self) -> Result<u64, Error> {
    if self.seq == u64::MAX {
      return Err(Error::alert(AlertDescription::InternalError));
    }
    let seq = self.seq;
    self.seq += 1;
    Ok(seq)
  }

  /// Seals `payload` as one or more records of `content_type`, appending them
  /// to `buf`.
  pub fn seal_into(
    &mut self,
    buf: &mut Buffer,
    content_type: ContentType,
    payload: &[u8],
  ) -> Result<(), Error> {
    let mut chunks = payload.chunks(MAX_PLAINTEXT_RECORD_SIZE - 1);
    let mut first = true;
    loop {
      let chunk = match chunks.next() {
        Some(chunk) => chunk,
        None if first => &[][..],
        None => break,
      };
      first = false;
      self.seal_one(buf, content_type, chunk)?;
    }
    Ok(())
  }

  fn seal_one(
    &mut self,
    buf: &mut Buffer,
    content_type: ContentType,
    chunk: &[u8],
  ) -> Result<(), Error> {
    let ciphertext_len = chunk.len() + 1 + self.suite.aead.tag_size();
    let header = record_header(ContentType::ApplicationData as u8, ciphertext_len);
    let mut inner = Zeroizing::new(Vec::with_capacity(chunk.len() + 1));
    inner.extend_from_slice(chunk);
    inner.push(content_type as u8);
    let seq = self.next_seq()?;
    let ciphertext = self.aead.seal(seq, &header, &inner);
    buf.reserve(RECORD_HEADER_SIZE + ciphertext.len());
    buf.extend_from_slice(&header);
    buf.extend_from_slice(&ciphertext);
    tracing::trace!(epoch = self.epoch, seq, len = chunk.len(), "sealed record");
    Ok(())
  }

  /// Opens one record given its header and ciphertext body, returning the
  /// inner content type and plaintext.
  pub fn open(&mut self, header: &[u8], body: &[u8]) -> Result<(ContentType, Vec<u8>), Error> {
    if body.len() > MAX_CIPHERTEXT_RECORD_SIZE {
      return Err(Error::alert(AlertDescription::DecodeError));
    }
    let seq = self.seq;
    let mut plaintext = self.aead.open(seq, header, body)?;
    self.next_seq()?;
    // Strip the zero padding and the trailing inner content type.
    let inner_type = loop {
      match plaintext.pop() {
        Some(0) => {},
        Some(byte) => break byte,
        None => return Err(Error::alert(AlertDescription::UnexpectedMessage)),
      }
    };
    if plaintext.len() > MAX_PLAINTEXT_RECORD_SIZE {
      return Err(Error::alert(AlertDescription::DecodeError));
    }
    let content_type = ContentType::from_u8(inner_type)
      .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?;
    tracing::trace!(epoch = self.epoch, seq, len = plaintext.len(), "opened record");
    Ok((content_type, plaintext))
  }
}

/// Writes an unprotected record, fragmenting at the plaintext bound.
pub(crate) fn emit_plaintext_record(buf: &mut Buffer, content_type: ContentType, payload: &[u8]) {
  let mut chunks = payload.chunks(MAX_PLAINTEXT_RECORD_SIZE);
  let mut first = true;
  loop {
    let chunk = match chunks.next() {
      Some(chunk) => chunk,
      None if first => &[][..],
      None => break,
    };
    first = false;
    buf.reserve(RECORD_HEADER_SIZE + chunk.len());
    buf.extend_from_slice(&record_header(content_type as u8, chunk.len()));
    buf.extend_from_slice(chunk);
  }
}

/// A parsed record header.
pub(crate) struct RecordHeader {
  pub content_type: u8,
  pub len: usize,
}

/// Parses a record header if enough bytes are present. Returns `Ok(None)` for
/// a partial header.
pub(crate) fn parse_record_header(input: &[u8]) -> Result<Option<RecordHeader>, Error> {
  if input.len() < RECORD_HEADER_SIZE {
    return Ok(None);
  }
  let mut r = Reader::new(input);
  let content_type = r.u8()?;
  let _legacy_version = r.u16()?;
  let len = r.u16()? as usize;
  if len > MAX_CIPHERTEXT_RECORD_SIZE {
    return Err(Error::alert(AlertDescription::DecodeError));
  }
  Ok(Some(RecordHeader { content_type, len }))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::TLS_AES_128_GCM_SHA256;

  fn protection_pair() -> (TrafficProtection, TrafficProtection) {
    let secret = [0x5Au8; 32];
    let a = TrafficProtection::new(&TLS_AES_128_GCM_SHA256, &secret, 3, "tls13 ").unwrap();
    let b = TrafficProtection::new(&TLS_AES_128_GCM_SHA256, &secret, 3, "tls13 ").unwrap();
    (a, b)
  }

  fn open_single(dec: &mut TrafficProtection, wire: &[u8]) -> (ContentType, Vec<u8>) {
    let header = parse_record_header(wire).unwrap().unwrap();
    let body = &wire[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + header.len];
    dec.open(&wire[..RECORD_HEADER_SIZE], body).unwrap()
  }

  #[test]
  fn seal_open_round_trip() {
    let (mut enc, mut dec) = protection_pair();
    let mut buf = Buffer::new();
    enc.seal_into(&mut buf, ContentType::ApplicationData, b"ping").unwrap();
    let (content_type, plaintext) = open_single(&mut dec, buf.as_slice());
    assert_eq!(content_type, ContentType::ApplicationData);
    assert_eq!(plaintext, b"ping");
  }

  #[test]
  fn bit_flip_fails_with_bad_record_mac() {
    let (mut enc, mut dec) = protection_pair();
    let mut buf = Buffer::new();
    enc.seal_into(&mut buf, ContentType::ApplicationData, b"ping").unwrap();
    let n = buf.len();
    buf.as_mut_slice()[n - 1] ^= 0x01;
    let header = parse_record_header(buf.as_slice()).unwrap().unwrap();
    let err = dec
      .open(&buf.as_slice()[..RECORD_HEADER_SIZE], &buf.as_slice()[RECORD_HEADER_SIZE..][..header.len])
      .unwrap_err();
    assert!(matches!(err, Error::Alert(AlertDescription::BadRecordMac)));
  }

  #[test]
  fn wrong_sequence_fails() {
    let (mut enc, mut dec) = protection_pair();
    let mut first = Buffer::new();
    enc.seal_into(&mut first, ContentType::ApplicationData, b"one").unwrap();
    let mut second = Buffer::new();
    enc.seal_into(&mut second, ContentType::ApplicationData, b"two").unwrap();
    // Feeding the second record first desynchronises the sequence number.
    let header = parse_record_header(second.as_slice()).unwrap().unwrap();
    assert!(dec
      .open(
        &second.as_slice()[..RECORD_HEADER_SIZE],
        &second.as_slice()[RECORD_HEADER_SIZE..][..header.len]
      )
      .is_err());
  }

  #[test]
  fn large_payload_fragments() {
    let (mut enc, mut dec) = protection_pair();
    let payload = vec![0x77u8; MAX_PLAINTEXT_RECORD_SIZE + 1000];
    let mut buf = Buffer::new();
    enc.seal_into(&mut buf, ContentType::ApplicationData, &payload).unwrap();

    let mut reassembled = Vec::new();
    let mut rest = buf.as_slice();
    let mut records = 0;
    while !rest.is_empty() {
      let header = parse_record_header(rest).unwrap().unwrap();
      let (_, plaintext) =
        dec.open(&rest[..RECORD_HEADER_SIZE], &rest[RECORD_HEADER_SIZE..][..header.len]).unwrap();
      reassembled.extend_from_slice(&plaintext);
      rest = &rest[RECORD_HEADER_SIZE + header.len..];
      records += 1;
    }
    assert_eq!(records, 2);
    assert_eq!(reassembled, payload);
  }

  #[test]
  fn key_update_rotates_secret_and_resets_sequence() {
    let (mut enc, dec) = protection_pair();
    let mut buf = Buffer::new();
    enc.seal_into(&mut buf, ContentType::ApplicationData, b"x").unwrap();
    assert_eq!(enc.seq(), 1);

    let mut enc2 = enc.updated("tls13 ").unwrap();
    let mut dec2 = dec.updated("tls13 ").unwrap();
    assert_eq!(enc2.seq(), 0);
    assert_ne!(enc.secret(), enc2.secret());

    let mut buf = Buffer::new();
    enc2.seal_into(&mut buf, ContentType::ApplicationData, b"post-update").unwrap();
    let (_, plaintext) = open_single(&mut dec2, buf.as_slice());
    assert_eq!(plaintext, b"post-update");
  }
}
