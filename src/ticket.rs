//! Session-ticket state blobs.
//!
//! Two binary shapes, both carried through the wire codec: the server-side
//! ticket plaintext (sealed by the application's `encrypt_ticket` capability)
//! and the client-side cached session handed to `save_ticket` and fed back on
//! resumption. Both carry the already-derived resumption PSK rather than the
//! resumption master secret, so a compromised ticket key cannot yield other
//! derivations.

use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::codec::Reader;
use crate::errors::Error;

const FORMAT_VERSION: u8 = 1;

/// Plaintext of a server-issued ticket.
pub(crate) struct TicketState {
  pub issued_at: u64,
  pub age_add: u32,
  pub suite_id: u16,
  pub max_early_data_size: u32,
  pub alpn: Option<String>,
  pub psk: Zeroizing<Vec<u8>>,
}

impl TicketState {
  pub fn encode(&self, buf: &mut Buffer) -> Result<(), Error> {
    buf.push_u8(FORMAT_VERSION);
    buf.push_u64(self.issued_at);
    buf.push_u32(self.age_add);
    buf.push_u16(self.suite_id);
    buf.push_u32(self.max_early_data_size);
    buf.push_block(1, |buf| {
      if let Some(alpn) = &self.alpn {
        buf.extend_from_slice(alpn.as_bytes());
      }
      Ok(())
    })?;
    buf.push_block(2, |buf| {
      buf.extend_from_slice(&self.psk);
      Ok(())
    })
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
    let mut r = Reader::new(bytes);
    if r.u8()? != FORMAT_VERSION {
      return Err(Error::SessionNotFound);
    }
    let issued_at = r.u64()?;
    let age_add = r.u32()?;
    let suite_id = r.u16()?;
    let max_early_data_size = r.u32()?;
    let alpn = r.open_block(1)?.rest();
    let alpn = if alpn.is_empty() {
      None
    } else {
      Some(String::from_utf8(alpn.to_vec()).map_err(|_| Error::SessionNotFound)?)
    };
    let psk = Zeroizing::new(r.open_block(2)?.rest().to_vec());
    r.expect_empty().map_err(|_| Error::SessionNotFound)?;
    Ok(TicketState { issued_at, age_add, suite_id, max_early_data_size, alpn, psk })
  }
}

/// The client-side cached session: everything needed to offer the PSK again.
pub(crate) struct CachedSession {
  pub obtained_at: u64,
  pub lifetime: u32,
  pub age_add: u32,
  pub suite_id: u16,
  pub max_early_data_size: u32,
  pub alpn: Option<String>,
  pub psk: Zeroizing<Vec<u8>>,
  pub ticket: Vec<u8>,
}

impl CachedSession {
  pub fn encode(&self, buf: &mut Buffer) -> Result<(), Error> {
    buf.push_u8(FORMAT_VERSION);
    buf.push_u64(self.obtained_at);
    buf.push_u32(self.lifetime);
    buf.push_u32(self.age_add);
    buf.push_u16(self.suite_id);
    buf.push_u32(self.max_early_data_size);
    buf.push_block(1, |buf| {
      if let Some(alpn) = &self.alpn {
        buf.extend_from_slice(alpn.as_bytes());
      }
      Ok(())
    })?;
    buf.push_block(2, |buf| {
      buf.extend_from_slice(&self.psk);
      Ok(())
    })?;
    buf.push_block(2, |buf| {
      buf.extend_from_slice(&self.ticket);
      Ok(())
    })
  }

  pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
    let mut r = Reader::new(bytes);
    if r.u8()? != FORMAT_VERSION {
      return Err(Error::SessionNotFound);
    }
    let obtained_at = r.u64()?;
    let lifetime = r.u32()?;
    let age_add = r.u32()?;
    let suite_id = r.u16()?;
    let max_early_data_size = r.u32()?;
    let alpn = r.open_block(1)?.rest();
    let alpn = if alpn.is_empty() {
      None
    } else {
      Some(String::from_utf8(alpn.to_vec()).map_err(|_| Error::SessionNotFound)?)
    };
    let psk = Zeroizing::new(r.open_block(2)?.rest().to_vec());
    let ticket = r.open_block(2)?.rest().to_vec();
    r.expect_empty().map_err(|_| Error::SessionNotFound)?;
    Ok(CachedSession {
      obtained_at,
      lifetime,
      age_add,
      suite_id,
      max_early_data_size,
      alpn,
      psk,
      ticket,
    })
  }

  /// The obfuscated ticket age for the pre_shared_key identity.
  pub fn obfuscated_age(&self, now_millis: u64) -> u32 {
    let age = now_millis.saturating_sub(self.obtained_at) as u32;
    age.wrapping_add(self.age_add)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn ticket_state_round_trip() {
    let state = TicketState {
      issued_at: 1_700_000_000_000,
      age_add: 0xDEADBEEF,
      suite_id: 0x1301,
      max_early_data_size: 16384,
      alpn: Some("h2".to_string()),
      psk: Zeroizing::new(vec![9u8; 32]),
    };
    let mut buf = Buffer::new();
    state.encode(&mut buf).unwrap();
    let decoded = TicketState::decode(buf.as_slice()).unwrap();
    assert_eq!(decoded.issued_at, state.issued_at);
    assert_eq!(decoded.age_add, state.age_add);
    assert_eq!(decoded.suite_id, state.suite_id);
    assert_eq!(decoded.max_early_data_size, state.max_early_data_size);
    assert_eq!(decoded.alpn, state.alpn);
    assert_eq!(*decoded.psk, *state.psk);
  }

  #[test]
  fn cached_session_round_trip() {
    let session = CachedSession {
      obtained_at: 1_700_000_000_000,
      lifetime: 7200,
      age_add: 42,
      suite_id: 0x1302,
      max_early_data_size: 0,
      alpn: None,
      psk: Zeroizing::new(vec![7u8; 48]),
      ticket: b"opaque server ticket".to_vec(),
    };
    let mut buf = Buffer::new();
    session.encode(&mut buf).unwrap();
    let decoded = CachedSession::decode(buf.as_slice()).unwrap();
    assert_eq!(decoded.lifetime, 7200);
    assert_eq!(decoded.ticket, session.ticket);
    assert_eq!(*decoded.psk, *session.psk);
  }

  #[test]
  fn garbage_is_rejected() {
    assert!(CachedSession::decode(b"not a session").is_err());
    assert!(TicketState::decode(&[]).is_err());
  }

  #[test]
  fn obfuscated_age_wraps() {
    let session = CachedSession {
      obtained_at: 1_000,
      lifetime: 10,
      age_add: u32::MAX,
      suite_id: 0x1301,
      max_early_data_size: 0,
      alpn: None,
      psk: Zeroizing::new(vec![0; 32]),
      ticket: Vec::new(),
    };
    assert_eq!(session.obfuscated_age(1_001), 0);
  }
}
