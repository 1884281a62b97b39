//! Handshake message and extension codec.
//!
//! Builders live with the role that emits the message (`client`, `server`);
//! this module owns the shared wire shapes: message framing, extension
//! walking with duplicate/placement policing, and the parsed views of every
//! message the engine consumes.

use crate::buffer::Buffer;
use crate::codec::Reader;
use crate::errors::{AlertDescription, Error};
use crate::key_schedule::KeySchedule;

pub const LEGACY_VERSION: u16 = 0x0303;
pub const TLS13_VERSION: u16 = 0x0304;
pub const HELLO_RANDOM_SIZE: usize = 32;

/// Fixed ServerHello.random of a HelloRetryRequest:
/// SHA-256("HelloRetryRequest").
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
  0xCF, 0x21, 0xAD, 0x74, 0xE5, 0x9A, 0x61, 0x11, 0xBE, 0x1D, 0x8C, 0x02, 0x1E, 0x65, 0xB8, 0x91,
  0xC2, 0xA2, 0x11, 0x16, 0x7A, 0xBB, 0x8C, 0x5E, 0x07, 0x9E, 0x09, 0xE2, 0xC8, 0xA8, 0x33, 0x9C,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
  ClientHello = 1,
  ServerHello = 2,
  NewSessionTicket = 4,
  EndOfEarlyData = 5,
  EncryptedExtensions = 8,
  Certificate = 11,
  CertificateRequest = 13,
  CertificateVerify = 15,
  Finished = 20,
  KeyUpdate = 24,
  CompressedCertificate = 25,
  MessageHash = 254,
}

impl HandshakeType {
  pub fn from_u8(v: u8) -> Option<Self> {
    match v {
      1 => Some(Self::ClientHello),
      2 => Some(Self::ServerHello),
      4 => Some(Self::NewSessionTicket),
      5 => Some(Self::EndOfEarlyData),
      8 => Some(Self::EncryptedExtensions),
      11 => Some(Self::Certificate),
      13 => Some(Self::CertificateRequest),
      15 => Some(Self::CertificateVerify),
      20 => Some(Self::Finished),
      24 => Some(Self::KeyUpdate),
      25 => Some(Self::CompressedCertificate),
      254 => Some(Self::MessageHash),
      _ => None,
    }
  }
}

/// Extension type numbers used by the engine.
pub mod ext {
  pub const SERVER_NAME: u16 = 0;
  pub const SUPPORTED_GROUPS: u16 = 10;
  pub const SIGNATURE_ALGORITHMS: u16 = 13;
  pub const ALPN: u16 = 16;
  pub const COMPRESS_CERTIFICATE: u16 = 27;
  pub const PRE_SHARED_KEY: u16 = 41;
  pub const EARLY_DATA: u16 = 42;
  pub const SUPPORTED_VERSIONS: u16 = 43;
  pub const COOKIE: u16 = 44;
  pub const PSK_KEY_EXCHANGE_MODES: u16 = 45;
  pub const KEY_SHARE: u16 = 51;
  pub const ENCRYPTED_SERVER_NAME: u16 = 0xFFCE;
}

pub const PSK_MODE_KE: u8 = 0;
pub const PSK_MODE_DHE_KE: u8 = 1;

fn decode_error() -> Error {
  Error::alert(AlertDescription::DecodeError)
}

fn illegal_parameter() -> Error {
  Error::alert(AlertDescription::IllegalParameter)
}

/// Frames a handshake message (type octet + 24-bit length) into `buf`,
/// feeding the whole message into the transcript when a schedule is given.
pub(crate) fn push_handshake_message(
  buf: &mut Buffer,
  sched: Option<&mut KeySchedule>,
  typ: HandshakeType,
  body: impl FnOnce(&mut Buffer) -> Result<(), Error>,
) -> Result<(), Error> {
  let start = buf.len();
  buf.push_u8(typ as u8);
  buf.push_block(3, body)?;
  if let Some(sched) = sched {
    let slice = buf.as_slice();
    sched.update_hash(&slice[start..]);
  }
  Ok(())
}

/// Reassembles handshake messages out of (possibly fragmented, possibly
/// coalesced) record payloads.
#[derive(Default)]
pub(crate) struct MessageJoiner {
  pending: Vec<u8>,
}

impl MessageJoiner {
  pub fn push(&mut self, fragment: &[u8]) {
    self.pending.extend_from_slice(fragment);
  }

  pub fn has_pending(&self) -> bool {
    !self.pending.is_empty()
  }

  /// Pops the next complete message, returning its type and the full message
  /// bytes (header included).
  pub fn next(&mut self) -> Result<Option<(HandshakeType, Vec<u8>)>, Error> {
    if self.pending.len() < 4 {
      return Ok(None);
    }
    let body_len = u32::from_be_bytes([0, self.pending[1], self.pending[2], self.pending[3]]) as usize;
    let total = 4 + body_len;
    if self.pending.len() < total {
      return Ok(None);
    }
    let typ = HandshakeType::from_u8(self.pending[0])
      .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?;
    let message = self.pending.drain(..total).collect();
    Ok(Some((typ, message)))
  }
}

/// Walks an extensions block, policing duplicates, and calls `f` with each
/// extension's type and a reader bounded to its data.
pub(crate) fn for_each_extension<'a>(
  r: &mut Reader<'a>,
  mut f: impl FnMut(u16, Reader<'a>) -> Result<(), Error>,
) -> Result<(), Error> {
  let mut exts = r.open_block(2)?;
  let mut seen: Vec<u16> = Vec::new();
  while !exts.is_empty() {
    let typ = exts.u16()?;
    let data = exts.open_block(2)?;
    if seen.contains(&typ) {
      return Err(illegal_parameter());
    }
    seen.push(typ);
    f(typ, data)?;
  }
  Ok(())
}

fn read_u16_list(r: &mut Reader<'_>) -> Result<Vec<u16>, Error> {
  let mut block = r.open_block(2)?;
  let mut out = Vec::with_capacity(block.remaining() / 2);
  while !block.is_empty() {
    out.push(block.u16()?);
  }
  Ok(out)
}

#[derive(Debug, Clone, Copy)]
pub struct KeyShareEntry<'a> {
  pub group: u16,
  pub key: &'a [u8],
}

fn read_key_share_entry<'a>(r: &mut Reader<'a>) -> Result<KeyShareEntry<'a>, Error> {
  let group = r.u16()?;
  let key = r.open_block(2)?;
  if key.is_empty() {
    return Err(decode_error());
  }
  Ok(KeyShareEntry { group, key: key.rest() })
}

#[derive(Debug, Clone, Copy)]
pub struct PskIdentity<'a> {
  pub identity: &'a [u8],
  pub obfuscated_ticket_age: u32,
}

#[derive(Debug)]
pub struct OfferedPsk<'a> {
  pub identities: Vec<PskIdentity<'a>>,
  pub binders: Vec<&'a [u8]>,
  /// Offset of the binders list within the ClientHello *message* (header
  /// included); the binder MAC covers the transcript up to this point.
  pub binders_offset: usize,
}

/// ESNI extension as sent in ClientHello (draft-02).
#[derive(Debug, Clone, Copy)]
pub struct EsniExtension<'a> {
  pub suite_id: u16,
  pub key_share: KeyShareEntry<'a>,
  pub record_digest: &'a [u8],
  pub encrypted_sni: &'a [u8],
}

/// Parsed view of a ClientHello body.
pub struct ClientHello<'a> {
  pub random: [u8; HELLO_RANDOM_SIZE],
  pub legacy_session_id: &'a [u8],
  pub cipher_suites: Vec<u16>,
  pub server_name: Option<String>,
  pub alpn: Vec<&'a [u8]>,
  pub supported_groups: Vec<u16>,
  pub signature_algorithms: Vec<u16>,
  pub key_shares: Vec<KeyShareEntry<'a>>,
  pub tls13_offered: bool,
  pub psk_modes: Vec<u8>,
  pub psk: Option<OfferedPsk<'a>>,
  pub early_data: bool,
  pub cookie: Option<&'a [u8]>,
  pub esni: Option<EsniExtension<'a>>,
  pub compress_algorithms: Vec<u16>,
  /// Raw body of the key_share extension, used as ESNI associated data.
  pub key_share_raw: &'a [u8],
  /// Extensions collected for the embedding application.
  pub collected: Vec<(u16, &'a [u8])>,
}

/// Parses a ClientHello *message* (4-byte header plus body). The message view
/// is needed so `OfferedPsk::binders_offset` can locate the binder boundary
/// for transcript truncation.
pub fn parse_client_hello<'a>(
  message: &'a [u8],
  collect: Option<&dyn Fn(u16) -> bool>,
) -> Result<ClientHello<'a>, Error> {
  let mut r = Reader::new(message);
  let typ = r.u8()?;
  if typ != HandshakeType::ClientHello as u8 {
    return Err(Error::alert(AlertDescription::UnexpectedMessage));
  }
  let mut body = r.open_block(3)?;
  r.expect_empty()?;

  let legacy_version = body.u16()?;
  if legacy_version != LEGACY_VERSION {
    return Err(Error::alert(AlertDescription::ProtocolVersion));
  }
  let mut random = [0u8; HELLO_RANDOM_SIZE];
  random.copy_from_slice(body.take(HELLO_RANDOM_SIZE)?);
  let session = body.open_block(1)?;
  if session.remaining() > 32 {
    return Err(decode_error());
  }
  let legacy_session_id = session.rest();

  let mut suites_block = body.open_block(2)?;
  let mut cipher_suites = Vec::new();
  while !suites_block.is_empty() {
    cipher_suites.push(suites_block.u16()?);
  }
  if cipher_suites.is_empty() {
    return Err(decode_error());
  }

  let compression = body.open_block(1)?;
  if compression.rest() != [0] {
    return Err(illegal_parameter());
  }

  let mut ch = ClientHello {
    random,
    legacy_session_id,
    cipher_suites,
    server_name: None,
    alpn: Vec::new(),
    supported_groups: Vec::new(),
    signature_algorithms: Vec::new(),
    key_shares: Vec::new(),
    tls13_offered: false,
    psk_modes: Vec::new(),
    psk: None,
    early_data: false,
    cookie: None,
    esni: None,
    compress_algorithms: Vec::new(),
    key_share_raw: &[],
    collected: Vec::new(),
  };

  let mut last_ext_was_psk = false;
  for_each_extension(&mut body, |typ, mut data| {
    last_ext_was_psk = false;
    match typ {
      ext::SERVER_NAME => {
        let mut list = data.open_block(2)?;
        while !list.is_empty() {
          let name_type = list.u8()?;
          let name = list.open_block(2)?;
          if name_type == 0 {
            if ch.server_name.is_some() {
              return Err(illegal_parameter());
            }
            let name = std::str::from_utf8(name.rest()).map_err(|_| decode_error())?;
            ch.server_name = Some(name.to_string());
          }
        }
        data.expect_empty()?;
      },
      ext::SUPPORTED_GROUPS => {
        ch.supported_groups = read_u16_list(&mut data)?;
        data.expect_empty()?;
      },
      ext::SIGNATURE_ALGORITHMS => {
        ch.signature_algorithms = read_u16_list(&mut data)?;
        data.expect_empty()?;
      },
      ext::ALPN => {
        let mut list = data.open_block(2)?;
        while !list.is_empty() {
          let proto = list.open_block(1)?;
          if proto.is_empty() {
            return Err(decode_error());
          }
          ch.alpn.push(proto.rest());
        }
        data.expect_empty()?;
      },
      ext::KEY_SHARE => {
        ch.key_share_raw = data.rest();
        let mut list = data.open_block(2)?;
        while !list.is_empty() {
          ch.key_shares.push(read_key_share_entry(&mut list)?);
        }
        data.expect_empty()?;
      },
      ext::SUPPORTED_VERSIONS => {
        let mut versions = data.open_block(1)?;
        while !versions.is_empty() {
          if versions.u16()? == TLS13_VERSION {
            ch.tls13_offered = true;
          }
        }
        data.expect_empty()?;
      },
      ext::PSK_KEY_EXCHANGE_MODES => {
        let modes = data.open_block(1)?;
        ch.psk_modes = modes.rest().to_vec();
        data.expect_empty()?;
      },
      ext::PRE_SHARED_KEY => {
        let mut identities = Vec::new();
        let mut ident_block = data.open_block(2)?;
        while !ident_block.is_empty() {
          let identity = ident_block.open_block(2)?.rest();
          if identity.is_empty() {
            return Err(decode_error());
          }
          let obfuscated_ticket_age = ident_block.u32()?;
          identities.push(PskIdentity { identity, obfuscated_ticket_age });
        }
        let mut binder_block = data.open_block(2)?;
        let mut binders = Vec::new();
        while !binder_block.is_empty() {
          let binder = binder_block.open_block(1)?.rest();
          if binder.is_empty() {
            return Err(decode_error());
          }
          binders.push(binder);
        }
        data.expect_empty()?;
        if identities.is_empty() || identities.len() != binders.len() {
          return Err(illegal_parameter());
        }
        ch.psk = Some(OfferedPsk { identities, binders, binders_offset: 0 });
        last_ext_was_psk = true;
      },
      ext::EARLY_DATA => {
        data.expect_empty()?;
        ch.early_data = true;
      },
      ext::COOKIE => {
        let cookie = data.open_block(2)?;
        ch.cookie = Some(cookie.rest());
        data.expect_empty()?;
      },
      ext::COMPRESS_CERTIFICATE => {
        let mut algos = data.open_block(1)?;
        while !algos.is_empty() {
          ch.compress_algorithms.push(algos.u16()?);
        }
        data.expect_empty()?;
      },
      ext::ENCRYPTED_SERVER_NAME => {
        let suite_id = data.u16()?;
        let key_share = read_key_share_entry(&mut data)?;
        let record_digest = data.open_block(2)?.rest();
        let encrypted_sni = data.open_block(2)?.rest();
        data.expect_empty()?;
        ch.esni = Some(EsniExtension { suite_id, key_share, record_digest, encrypted_sni });
      },
      other => {
        if collect.map_or(false, |want| want(other)) {
          ch.collected.push((other, data.rest()));
        }
        // Unknown extensions in ClientHello are ignored.
      },
    }
    Ok(())
  })?;
  body.expect_empty()?;

  // pre_shared_key must be the last extension when present. Because the
  // binders list is then the final field of the message, the binder boundary
  // can be located from the tail.
  if let Some(psk) = &mut ch.psk {
    if !last_ext_was_psk {
      return Err(illegal_parameter());
    }
    let binders_wire_len = 2 + psk.binders.iter().map(|b| 1 + b.len()).sum::<usize>();
    psk.binders_offset = message.len() - binders_wire_len;
  }
  Ok(ch)
}

/// Parsed view of a ServerHello (or HelloRetryRequest) body.
pub struct ServerHello<'a> {
  pub random: [u8; HELLO_RANDOM_SIZE],
  pub legacy_session_id_echo: &'a [u8],
  pub cipher_suite: u16,
  pub selected_version: Option<u16>,
  pub key_share: Option<KeyShareEntry<'a>>,
  /// Group named by a HelloRetryRequest's key_share extension.
  pub retry_group: Option<u16>,
  pub cookie: Option<&'a [u8]>,
  pub psk_selected_identity: Option<u16>,
  pub is_retry: bool,
}

pub fn parse_server_hello<'a>(body_bytes: &'a [u8]) -> Result<ServerHello<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let legacy_version = body.u16()?;
  if legacy_version != LEGACY_VERSION {
    return Err(Error::alert(AlertDescription::ProtocolVersion));
  }
  let mut random = [0u8; HELLO_RANDOM_SIZE];
  random.copy_from_slice(body.take(HELLO_RANDOM_SIZE)?);
  let is_retry = random == HELLO_RETRY_REQUEST_RANDOM;
  let legacy_session_id_echo = body.open_block(1)?.rest();
  let cipher_suite = body.u16()?;
  if body.u8()? != 0 {
    // legacy_compression_method
    return Err(illegal_parameter());
  }

  let mut sh = ServerHello {
    random,
    legacy_session_id_echo,
    cipher_suite,
    selected_version: None,
    key_share: None,
    retry_group: None,
    cookie: None,
    psk_selected_identity: None,
    is_retry,
  };

  for_each_extension(&mut body, |typ, mut data| {
    match typ {
      ext::SUPPORTED_VERSIONS => {
        sh.selected_version = Some(data.u16()?);
        data.expect_empty()?;
      },
      ext::KEY_SHARE => {
        if is_retry {
          sh.retry_group = Some(data.u16()?);
        } else {
          sh.key_share = Some(read_key_share_entry(&mut data)?);
        }
        data.expect_empty()?;
      },
      ext::COOKIE if is_retry => {
        let cookie = data.open_block(2)?;
        if cookie.is_empty() {
          return Err(decode_error());
        }
        sh.cookie = Some(cookie.rest());
        data.expect_empty()?;
      },
      ext::PRE_SHARED_KEY if !is_retry => {
        sh.psk_selected_identity = Some(data.u16()?);
        data.expect_empty()?;
      },
      _ => return Err(illegal_parameter()),
    }
    Ok(())
  })?;
  body.expect_empty()?;
  Ok(sh)
}

/// Parsed view of EncryptedExtensions.
pub struct EncryptedExtensions<'a> {
  pub alpn: Option<&'a [u8]>,
  pub early_data_accepted: bool,
  pub server_name_acked: bool,
  pub esni_nonce: Option<&'a [u8]>,
  pub collected: Vec<(u16, &'a [u8])>,
}

pub fn parse_encrypted_extensions<'a>(
  body_bytes: &'a [u8],
  collect: Option<&dyn Fn(u16) -> bool>,
) -> Result<EncryptedExtensions<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let mut ee = EncryptedExtensions {
    alpn: None,
    early_data_accepted: false,
    server_name_acked: false,
    esni_nonce: None,
    collected: Vec::new(),
  };
  for_each_extension(&mut body, |typ, mut data| {
    match typ {
      ext::ALPN => {
        let mut list = data.open_block(2)?;
        let proto = list.open_block(1)?;
        if proto.is_empty() || !list.is_empty() {
          return Err(illegal_parameter());
        }
        ee.alpn = Some(proto.rest());
        data.expect_empty()?;
      },
      ext::EARLY_DATA => {
        data.expect_empty()?;
        ee.early_data_accepted = true;
      },
      ext::SERVER_NAME => {
        data.expect_empty()?;
        ee.server_name_acked = true;
      },
      ext::SUPPORTED_GROUPS => {
        // Informational; the server may tell us its groups for later use.
        let _ = read_u16_list(&mut data)?;
      },
      ext::ENCRYPTED_SERVER_NAME => {
        ee.esni_nonce = Some(data.rest());
      },
      other => {
        if collect.map_or(false, |want| want(other)) {
          ee.collected.push((other, data.rest()));
        }
        // Unknown extensions in EncryptedExtensions are ignored.
      },
    }
    Ok(())
  })?;
  body.expect_empty()?;
  Ok(ee)
}

/// Parsed view of CertificateRequest.
pub struct CertificateRequest<'a> {
  pub context: &'a [u8],
  pub signature_algorithms: Vec<u16>,
}

pub fn parse_certificate_request<'a>(body_bytes: &'a [u8]) -> Result<CertificateRequest<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let context = body.open_block(1)?.rest();
  let mut signature_algorithms = Vec::new();
  for_each_extension(&mut body, |typ, mut data| {
    if typ == ext::SIGNATURE_ALGORITHMS {
      signature_algorithms = read_u16_list(&mut data)?;
      data.expect_empty()?;
    }
    Ok(())
  })?;
  body.expect_empty()?;
  if signature_algorithms.is_empty() {
    return Err(Error::alert(AlertDescription::MissingExtension));
  }
  Ok(CertificateRequest { context, signature_algorithms })
}

/// Parsed view of a Certificate message.
pub struct CertificateMessage<'a> {
  pub request_context: &'a [u8],
  pub entries: Vec<&'a [u8]>,
}

pub fn parse_certificate<'a>(body_bytes: &'a [u8]) -> Result<CertificateMessage<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let request_context = body.open_block(1)?.rest();
  let mut entries = Vec::new();
  let mut list = body.open_block(3)?;
  while !list.is_empty() {
    let cert = list.open_block(3)?.rest();
    if cert.is_empty() {
      return Err(decode_error());
    }
    // Per-certificate extensions: bounds-checked but otherwise ignored here.
    let _extensions = list.open_block(2)?;
    entries.push(cert);
  }
  body.expect_empty()?;
  Ok(CertificateMessage { request_context, entries })
}

/// Builds the body of a Certificate message. Usable standalone so embedders
/// can pre-compress certificate messages.
pub fn build_certificate_message(
  buf: &mut Buffer,
  request_context: &[u8],
  certificates: &[&[u8]],
) -> Result<(), Error> {
  buf.push_block(1, |buf| {
    buf.extend_from_slice(request_context);
    Ok(())
  })?;
  buf.push_block(3, |buf| {
    for cert in certificates {
      buf.push_block(3, |buf| {
        buf.extend_from_slice(cert);
        Ok(())
      })?;
      // No per-certificate extensions.
      buf.push_block(2, |_| Ok(()))?;
    }
    Ok(())
  })
}

/// Parsed view of CompressedCertificate (draft-ietf-tls-certificate-compression).
pub struct CompressedCertificate<'a> {
  pub algorithm: u16,
  pub uncompressed_length: usize,
  pub compressed: &'a [u8],
}

pub fn parse_compressed_certificate<'a>(
  body_bytes: &'a [u8],
) -> Result<CompressedCertificate<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let algorithm = body.u16()?;
  let uncompressed_length = body.u24()? as usize;
  let compressed = body.open_block(3)?.rest();
  body.expect_empty()?;
  Ok(CompressedCertificate { algorithm, uncompressed_length, compressed })
}

/// Parsed view of CertificateVerify.
pub struct CertificateVerify<'a> {
  pub scheme: u16,
  pub signature: &'a [u8],
}

pub fn parse_certificate_verify<'a>(body_bytes: &'a [u8]) -> Result<CertificateVerify<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let scheme = body.u16()?;
  let signature = body.open_block(2)?.rest();
  body.expect_empty()?;
  Ok(CertificateVerify { scheme, signature })
}

/// Parsed view of NewSessionTicket.
pub struct NewSessionTicket<'a> {
  pub lifetime: u32,
  pub age_add: u32,
  pub nonce: &'a [u8],
  pub ticket: &'a [u8],
  pub max_early_data_size: u32,
}

pub fn parse_new_session_ticket<'a>(body_bytes: &'a [u8]) -> Result<NewSessionTicket<'a>, Error> {
  let mut body = Reader::new(body_bytes);
  let lifetime = body.u32()?;
  let age_add = body.u32()?;
  let nonce = body.open_block(1)?.rest();
  let ticket_block = body.open_block(2)?;
  if ticket_block.is_empty() {
    return Err(decode_error());
  }
  let ticket = ticket_block.rest();
  let mut max_early_data_size = 0;
  for_each_extension(&mut body, |typ, mut data| {
    if typ == ext::EARLY_DATA {
      max_early_data_size = data.u32()?;
      data.expect_empty()?;
    }
    Ok(())
  })?;
  body.expect_empty()?;
  Ok(NewSessionTicket { lifetime, age_add, nonce, ticket, max_early_data_size })
}

/// Parses a KeyUpdate body, returning whether the peer requested an update in
/// return.
pub fn parse_key_update(body_bytes: &[u8]) -> Result<bool, Error> {
  let mut body = Reader::new(body_bytes);
  let request = body.u8()?;
  body.expect_empty()?;
  match request {
    0 => Ok(false),
    1 => Ok(true),
    _ => Err(illegal_parameter()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(typ: HandshakeType, body: &[u8]) -> Vec<u8> {
    let mut out = vec![typ as u8];
    out.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    out.extend_from_slice(body);
    out
  }

  #[test]
  fn joiner_reassembles_fragments_and_coalesced_messages() {
    let first = frame(HandshakeType::Finished, &[0xAA; 32]);
    let second = frame(HandshakeType::KeyUpdate, &[0]);
    let mut wire = first.clone();
    wire.extend_from_slice(&second);

    let mut joiner = MessageJoiner::default();
    joiner.push(&wire[..10]);
    assert!(joiner.next().unwrap().is_none());
    joiner.push(&wire[10..]);
    let (typ, msg) = joiner.next().unwrap().unwrap();
    assert_eq!(typ, HandshakeType::Finished);
    assert_eq!(msg, first);
    let (typ, msg) = joiner.next().unwrap().unwrap();
    assert_eq!(typ, HandshakeType::KeyUpdate);
    assert_eq!(msg, second);
    assert!(joiner.next().unwrap().is_none());
  }

  #[test]
  fn duplicate_extension_is_fatal() {
    let mut buf = Buffer::new();
    buf
      .push_block(2, |buf| {
        for _ in 0..2 {
          buf.push_u16(ext::SUPPORTED_GROUPS);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              buf.push_u16(29);
              Ok(())
            })
          })?;
        }
        Ok(())
      })
      .unwrap();
    let mut r = Reader::new(buf.as_slice());
    let err = for_each_extension(&mut r, |_, _| Ok(())).unwrap_err();
    assert!(matches!(err, Error::Alert(AlertDescription::IllegalParameter)));
  }

  #[test]
  fn certificate_message_round_trip() {
    let mut buf = Buffer::new();
    build_certificate_message(&mut buf, b"ctx", &[b"cert one", b"cert two"]).unwrap();
    let parsed = parse_certificate(buf.as_slice()).unwrap();
    assert_eq!(parsed.request_context, b"ctx");
    assert_eq!(parsed.entries, vec![&b"cert one"[..], &b"cert two"[..]]);
  }

  #[test]
  fn key_update_body_values() {
    assert!(!parse_key_update(&[0]).unwrap());
    assert!(parse_key_update(&[1]).unwrap());
    assert!(parse_key_update(&[2]).is_err());
    assert!(parse_key_update(&[0, 0]).is_err());
  }
}
