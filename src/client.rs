//! Client side of the handshake state machine.

use tracing::debug;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::config::HandshakeProperties;
use crate::connection::{
  usable_session, Connection, HandshakeSecrets, Side, State, EPOCH_APPLICATION, EPOCH_EARLY,
  EPOCH_HANDSHAKE, EPOCH_INITIAL,
};
use crate::crypto::{sign, ActiveKeyExchange, CipherSuite};
use crate::errors::{AlertDescription, Error};
use crate::esni::{self, ESNI_NONCE_SIZE};
use crate::key_schedule::KeySchedule;
use crate::msgs::{
  self, ext, push_handshake_message, HandshakeType, ServerHello, LEGACY_VERSION, PSK_MODE_DHE_KE,
  TLS13_VERSION,
};
use crate::ticket::CachedSession;
use crate::utils::{mem_equal, server_name_is_ipaddr};

/// The CertificateVerify domain-separation prefix (RFC 8446 §4.4.3).
pub(crate) fn certificate_verify_message(context_string: &str, transcript_hash: &[u8]) -> Vec<u8> {
  let mut out = Vec::with_capacity(64 + context_string.len() + 1 + transcript_hash.len());
  out.extend_from_slice(&[0x20; 64]);
  out.extend_from_slice(context_string.as_bytes());
  out.push(0x00);
  out.extend_from_slice(transcript_hash);
  out
}

pub(crate) const SERVER_CERTIFICATE_VERIFY_CONTEXT: &str = "TLS 1.3, server CertificateVerify";
pub(crate) const CLIENT_CERTIFICATE_VERIFY_CONTEXT: &str = "TLS 1.3, client CertificateVerify";

/// Per-handshake scratch state of a client connection.
pub(crate) struct ClientHandshake {
  pub active_kx: Vec<Box<dyn ActiveKeyExchange>>,
  pub offered_session: Option<CachedSession>,
  pub offered_psk_suite: Option<&'static CipherSuite>,
  pub offered_protocols: Vec<Vec<u8>>,
  pub offered_signature_schemes: Vec<u16>,
  pub legacy_session_id: Vec<u8>,
  pub sent_esni_nonce: Option<[u8; ESNI_NONCE_SIZE]>,
  pub cert_request: Option<(Vec<u8>, Vec<u16>)>,
  pub server_verify: Option<Box<dyn crate::crypto::VerifySignature>>,
  pub in_retry: bool,
}

impl Connection {
  /// Emits the first ClientHello and, when resuming with early data, installs
  /// the early traffic keys.
  pub(crate) fn client_start(&mut self, props: &mut HandshakeProperties) -> Result<(), Error> {
    debug_assert_eq!(self.side, Side::Client);
    let ctx = self.ctx.clone();

    ctx.random.fill(&mut self.client_random);
    let legacy_session_id = if ctx.send_change_cipher_spec {
      let mut id = vec![0u8; 32];
      ctx.random.fill(&mut id);
      id
    } else {
      Vec::new()
    };

    let mut sched = KeySchedule::new(ctx.hkdf_label_prefix.as_deref());

    // Resumption: adopt a cached session if it is still usable. The PSK's
    // hash is only a guess until the server picks a suite, so the selection
    // stays provisional.
    let mut offered_session = None;
    let mut offered_psk_suite = None;
    if let Some(encoded) = &props.client.session_ticket {
      if let Some((session, suite)) = usable_session(&ctx, &ctx.cipher_suites, encoded) {
        sched.select_hash_provisional(suite.hash);
        sched.extract(Some(&session.psk))?;
        offered_psk_suite = Some(suite);
        offered_session = Some(session);
      } else {
        debug!("cached session unusable, falling back to a full handshake");
      }
    }

    // Early data is only offered when the caller asked and the ticket allows.
    if let Some(allowance) = props.client.max_early_data_size.as_mut() {
      *allowance = match &offered_session {
        Some(session) if session.max_early_data_size > 0 => session.max_early_data_size,
        _ => 0,
      };
      if *allowance > 0 {
        self.early_data_offered = true;
        self.max_early_data_size = *allowance;
      }
    }

    let mut active_kx = Vec::new();
    if !props.client.negotiate_before_key_exchange {
      let kx =
        ctx.key_exchanges.first().ok_or(Error::Library("no key exchange configured"))?;
      active_kx.push(kx.start()?);
    }

    self.client_hs = Some(ClientHandshake {
      active_kx,
      offered_session,
      offered_psk_suite,
      offered_protocols: props.client.negotiated_protocols.clone(),
      offered_signature_schemes: sign::default_signature_schemes(),
      legacy_session_id,
      sent_esni_nonce: None,
      cert_request: None,
      server_verify: None,
      in_retry: false,
    });
    self.key_schedule = Some(sched);

    let message = self.build_client_hello(props, None)?;
    self.push_handshake_emit(EPOCH_INITIAL, message, true)?;

    if self.early_data_offered {
      let sched = self.key_schedule.as_ref().expect("installed above");
      let early_secret = sched.derive_secret("c e traffic")?;
      if ctx.use_exporter {
        self.early_exporter_master = Some(sched.derive_secret("e exp master")?);
        self.keylog("EARLY_EXPORTER_SECRET", self.early_exporter_master.as_ref().unwrap());
      }
      self.suite = self.client_hs.as_ref().unwrap().offered_psk_suite;
      self.install_protection(true, EPOCH_EARLY, &early_secret)?;
      self.write_epoch = EPOCH_EARLY;
    }

    self.state = State::ClientExpectServerHello;
    Ok(())
  }

  /// Assembles a ClientHello message, patching in the PSK binder when a
  /// session is offered. `retry_cookie` is echoed on the HelloRetryRequest
  /// round.
  fn build_client_hello(
    &mut self,
    props: &mut HandshakeProperties,
    retry_cookie: Option<Vec<u8>>,
  ) -> Result<Vec<u8>, Error> {
    let ctx = self.ctx.clone();
    let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;

    let sni: Option<String> = self
      .server_name
      .clone()
      .filter(|name| !server_name_is_ipaddr(name));
    let key_shares: Vec<(u16, Vec<u8>)> =
      hs.active_kx.iter().map(|kx| (kx.group(), kx.public_key().to_vec())).collect();
    let groups: Vec<u16> = ctx.key_exchanges.iter().map(|kx| kx.group()).collect();
    let suites: Vec<u16> = ctx.cipher_suites.iter().map(|s| s.id).collect();

    // The key_share extension body doubles as ESNI associated data, so build
    // it up front.
    let mut key_share_body = Buffer::new();
    key_share_body.push_block(2, |buf| {
      for (group, key) in &key_shares {
        buf.push_u16(*group);
        buf.push_block(2, |buf| {
          buf.extend_from_slice(key);
          Ok(())
        })?;
      }
      Ok(())
    })?;

    // Encrypt the SNI when ESNI keys were provided.
    let mut esni_ext: Option<Vec<u8>> = None;
    if let (Some(keys), Some(name)) = (&props.client.esni_keys, &sni) {
      let (ext_body, nonce) = self.client_seal_esni(keys, name, key_share_body.as_slice())?;
      self.client_hs.as_mut().unwrap().sent_esni_nonce = Some(nonce);
      esni_ext = Some(ext_body);
    }
    let hs = self.client_hs.as_mut().unwrap();

    let offering_psk = hs.offered_session.is_some();
    let binder_len =
      hs.offered_psk_suite.map(|suite| suite.hash.digest_size()).unwrap_or_default();
    let now = ctx.now_millis();

    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::ClientHello, |buf| {
      buf.push_u16(LEGACY_VERSION);
      buf.extend_from_slice(&self.client_random);
      buf.push_block(1, |buf| {
        buf.extend_from_slice(&hs.legacy_session_id);
        Ok(())
      })?;
      buf.push_block(2, |buf| {
        for id in &suites {
          buf.push_u16(*id);
        }
        Ok(())
      })?;
      // legacy_compression_methods: null only.
      buf.push_block(1, |buf| {
        buf.push_u8(0);
        Ok(())
      })?;
      buf.push_block(2, |buf| {
        if esni_ext.is_none() {
          if let Some(name) = &sni {
            buf.push_u16(ext::SERVER_NAME);
            buf.push_block(2, |buf| {
              buf.push_block(2, |buf| {
                buf.push_u8(0); // host_name
                buf.push_block(2, |buf| {
                  buf.extend_from_slice(name.as_bytes());
                  Ok(())
                })
              })
            })?;
          }
        }
        if let Some(body) = &esni_ext {
          buf.push_u16(ext::ENCRYPTED_SERVER_NAME);
          buf.push_block(2, |buf| {
            buf.extend_from_slice(body);
            Ok(())
          })?;
        }
        if !hs.offered_protocols.is_empty() {
          buf.push_u16(ext::ALPN);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              for proto in &hs.offered_protocols {
                buf.push_block(1, |buf| {
                  buf.extend_from_slice(proto);
                  Ok(())
                })?;
              }
              Ok(())
            })
          })?;
        }
        buf.push_u16(ext::SUPPORTED_VERSIONS);
        buf.push_block(2, |buf| {
          buf.push_block(1, |buf| {
            buf.push_u16(TLS13_VERSION);
            Ok(())
          })
        })?;
        buf.push_u16(ext::SUPPORTED_GROUPS);
        buf.push_block(2, |buf| {
          buf.push_block(2, |buf| {
            for group in &groups {
              buf.push_u16(*group);
            }
            Ok(())
          })
        })?;
        buf.push_u16(ext::SIGNATURE_ALGORITHMS);
        buf.push_block(2, |buf| {
          buf.push_block(2, |buf| {
            for scheme in &hs.offered_signature_schemes {
              buf.push_u16(*scheme);
            }
            Ok(())
          })
        })?;
        buf.push_u16(ext::KEY_SHARE);
        buf.push_block(2, |buf| {
          buf.extend_from_slice(key_share_body.as_slice());
          Ok(())
        })?;
        if let Some(decompress) = &ctx.decompress_certificate {
          buf.push_u16(ext::COMPRESS_CERTIFICATE);
          buf.push_block(2, |buf| {
            buf.push_block(1, |buf| {
              for algo in decompress.supported_algorithms() {
                buf.push_u16(*algo);
              }
              Ok(())
            })
          })?;
        }
        if let Some(cookie) = &retry_cookie {
          buf.push_u16(ext::COOKIE);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              buf.extend_from_slice(cookie);
              Ok(())
            })
          })?;
        }
        if self.early_data_offered {
          buf.push_u16(ext::EARLY_DATA);
          buf.push_block(2, |_| Ok(()))?;
        }
        for (typ, data) in &props.additional_extensions {
          buf.push_u16(*typ);
          buf.push_block(2, |buf| {
            buf.extend_from_slice(data);
            Ok(())
          })?;
        }
        buf.push_u16(ext::PSK_KEY_EXCHANGE_MODES);
        buf.push_block(2, |buf| {
          buf.push_block(1, |buf| {
            buf.push_u8(PSK_MODE_DHE_KE);
            Ok(())
          })
        })?;
        // pre_shared_key must come last.
        if let Some(session) = &hs.offered_session {
          buf.push_u16(ext::PRE_SHARED_KEY);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              buf.push_block(2, |buf| {
                buf.extend_from_slice(&session.ticket);
                Ok(())
              })?;
              buf.push_u32(session.obfuscated_age(now));
              Ok(())
            })?;
            buf.push_block(2, |buf| {
              buf.push_block(1, |buf| {
                buf.extend_zeroes(binder_len); // patched below
                Ok(())
              })
            })
          })?;
        }
        Ok(())
      })
    })?;

    let mut message = msg.as_slice().to_vec();
    if offering_psk {
      let binders_offset = message.len() - (2 + 1 + binder_len);
      let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
      let suite = hs.offered_psk_suite.expect("psk implies suite");
      let truncated = sched.transcript_hash_with_partial(&message[..binders_offset])?;
      let binder_key = sched.derive_secret_with_hash("res binder", suite.hash.empty_digest())?;
      let binder = sched.finished_mac_with_hash(&binder_key, &truncated)?;
      message[binders_offset + 3..].copy_from_slice(&binder);
    }
    Ok(message)
  }

  fn client_seal_esni(
    &mut self,
    keys: &esni::EsniKeys,
    server_name: &str,
    key_share_aad: &[u8],
  ) -> Result<(Vec<u8>, [u8; ESNI_NONCE_SIZE]), Error> {
    let ctx = self.ctx.clone();
    let now_seconds = ctx.now_millis() / 1000;
    if now_seconds < keys.not_before || now_seconds > keys.not_after {
      return Err(Error::Library("esni keys outside their validity window"));
    }
    let esni_suite = keys
      .cipher_suites
      .iter()
      .find(|s| ctx.cipher_suites.iter().any(|own| own.id == s.suite.id))
      .ok_or(Error::IncompatibleKey)?;
    let (group, server_public) = keys
      .entries
      .iter()
      .find(|(group, _)| ctx.key_exchanges.iter().any(|kx| kx.group() == *group))
      .ok_or(Error::IncompatibleKey)?;
    let kx = ctx
      .key_exchanges
      .iter()
      .find(|kx| kx.group() == *group)
      .expect("filtered above");
    let (our_public, z) = kx.exchange(server_public)?;
    let zx = esni::extract_zx(esni_suite.suite.hash, &z);
    let contents_hash = esni::hash_esni_contents(
      esni_suite.suite.hash,
      &esni_suite.record_digest,
      *group,
      &our_public,
      &self.client_random,
    );
    if let Some(update) = &ctx.update_esni_key {
      update.update(&zx, esni_suite.suite.hash, &contents_hash)?;
    }
    let (key, iv) = esni::esni_aead_material(esni_suite.suite, &zx, &contents_hash)?;
    let aead = esni_suite.suite.aead.new_context(&key, &iv)?;
    let mut nonce = [0u8; ESNI_NONCE_SIZE];
    ctx.random.fill(&mut nonce);
    let padded = esni::build_padded_sni(&nonce, server_name, keys.padded_length)?;
    let sealed = aead.seal(0, key_share_aad, &padded);

    let mut body = Buffer::new();
    body.push_u16(esni_suite.suite.id);
    body.push_u16(*group);
    body.push_block(2, |buf| {
      buf.extend_from_slice(&our_public);
      Ok(())
    })?;
    body.push_block(2, |buf| {
      buf.extend_from_slice(&esni_suite.record_digest);
      Ok(())
    })?;
    body.push_block(2, |buf| {
      buf.extend_from_slice(&sealed);
      Ok(())
    })?;
    Ok((body.as_slice().to_vec(), nonce))
  }

  pub(crate) fn client_handle_message(
    &mut self,
    typ: HandshakeType,
    message: &[u8],
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let body = &message[4..];
    match (self.state, typ) {
      (State::ClientExpectServerHello, HandshakeType::ServerHello)
      | (State::ClientExpectSecondServerHello, HandshakeType::ServerHello) => {
        self.client_handle_server_hello(message, body, props)
      },
      (State::ClientExpectEncryptedExtensions, HandshakeType::EncryptedExtensions) => {
        self.client_handle_encrypted_extensions(message, body, props)
      },
      (State::ClientExpectCertOrCertReq, HandshakeType::CertificateRequest) => {
        self.client_handle_certificate_request(message, body)
      },
      (State::ClientExpectCertOrCertReq, HandshakeType::Certificate)
      | (State::ClientExpectCertificate, HandshakeType::Certificate) => {
        self.client_handle_certificate(message, body, false)
      },
      (State::ClientExpectCertOrCertReq, HandshakeType::CompressedCertificate)
      | (State::ClientExpectCertificate, HandshakeType::CompressedCertificate) => {
        self.client_handle_certificate(message, body, true)
      },
      (State::ClientExpectCertificateVerify, HandshakeType::CertificateVerify) => {
        self.client_handle_certificate_verify(message, body)
      },
      (State::ClientExpectFinished, HandshakeType::Finished) => {
        self.client_handle_finished(message, body, props)
      },
      (State::ClientPostHandshake, HandshakeType::NewSessionTicket) => {
        self.client_handle_new_session_ticket(body)
      },
      (State::ClientPostHandshake, HandshakeType::KeyUpdate) => {
        let update_requested = msgs::parse_key_update(body)?;
        let prefix = self.ctx.label_prefix().to_string();
        let updated = self.dec[EPOCH_APPLICATION]
          .as_ref()
          .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?
          .updated(&prefix)?;
        self.dec[EPOCH_APPLICATION] = Some(updated);
        if update_requested {
          self.pending_key_update = true;
        }
        Ok(())
      },
      _ => Err(Error::alert(AlertDescription::UnexpectedMessage)),
    }
  }

  fn client_handle_server_hello(
    &mut self,
    message: &[u8],
    body: &[u8],
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let sh = msgs::parse_server_hello(body)?;
    if sh.is_retry {
      return self.client_handle_retry(message, &sh, props);
    }
    match sh.selected_version {
      None => return Err(Error::alert(AlertDescription::ProtocolVersion)),
      Some(TLS13_VERSION) => {},
      Some(_) => return Err(Error::alert(AlertDescription::IllegalParameter)),
    }
    let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;
    if sh.legacy_session_id_echo != hs.legacy_session_id.as_slice() {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    let suite = crate::crypto::find_cipher_suite(&self.ctx.cipher_suites, sh.cipher_suite)
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    if let Some(selected) = self.suite {
      // After a retry the suite is pinned by the HelloRetryRequest.
      if hs.in_retry && selected.id != suite.id {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
    }

    let psk_accepted = match sh.psk_selected_identity {
      None => false,
      Some(0) if hs.offered_session.is_some() => true,
      Some(_) => return Err(Error::alert(AlertDescription::IllegalParameter)),
    };
    if psk_accepted {
      let offered = hs.offered_psk_suite.expect("psk implies suite");
      if offered.hash.id() != suite.hash.id() {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
    }

    // Complete the key exchange named by the server.
    let share = sh
      .key_share
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    let kx_index = hs
      .active_kx
      .iter()
      .position(|kx| kx.group() == share.group)
      .ok_or_else(|| Error::alert(AlertDescription::IllegalParameter))?;
    let kx = hs.active_kx.remove(kx_index);
    hs.active_kx.clear();
    let shared_secret = kx.complete(share.key)?;

    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    // If the negotiated suite's hash differs from a provisionally selected
    // PSK hash, select_hash replays the transcript under the real hash.
    sched.select_hash(suite.hash);
    if !psk_accepted {
      // An offered-but-declined PSK has already advanced the chain; rewind.
      sched.reset_chain();
      sched.extract(None)?;
    }
    sched.update_hash(message);
    sched.extract(Some(&shared_secret))?;
    let client_hs_secret = sched.derive_secret("c hs traffic")?;
    let server_hs_secret = sched.derive_secret("s hs traffic")?;

    self.suite = Some(suite);
    self.negotiated_group = Some(share.group);
    self.psk_used = psk_accepted;
    self.hs_secrets = Some(HandshakeSecrets {
      client: Zeroizing::new(client_hs_secret.to_vec()),
      server: Zeroizing::new(server_hs_secret.to_vec()),
    });
    self.install_protection(false, EPOCH_HANDSHAKE, &server_hs_secret)?;
    self.install_protection(true, EPOCH_HANDSHAKE, &client_hs_secret)?;
    self.advance_read_epoch(EPOCH_HANDSHAKE)?;
    if !self.early_data_offered {
      self.write_epoch = EPOCH_HANDSHAKE;
    }
    debug!(suite = suite.id, group = share.group, psk = psk_accepted, "server hello processed");
    self.state = State::ClientExpectEncryptedExtensions;
    Ok(())
  }

  fn client_handle_retry(
    &mut self,
    message: &[u8],
    sh: &ServerHello<'_>,
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    if self.state != State::ClientExpectServerHello
      || self.client_hs.as_ref().map_or(true, |hs| hs.in_retry)
    {
      return Err(Error::alert(AlertDescription::UnexpectedMessage));
    }
    match sh.selected_version {
      None => return Err(Error::alert(AlertDescription::ProtocolVersion)),
      Some(TLS13_VERSION) => {},
      Some(_) => return Err(Error::alert(AlertDescription::IllegalParameter)),
    }
    let suite = crate::crypto::find_cipher_suite(&self.ctx.cipher_suites, sh.cipher_suite)
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    let ctx = self.ctx.clone();

    {
      let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;
      if let Some(psk_suite) = hs.offered_psk_suite {
        if psk_suite.hash.id() != suite.hash.id() {
          // The resumption PSK cannot survive a hash change; drop it.
          hs.offered_session = None;
          hs.offered_psk_suite = None;
        }
      }
      if sh.retry_group.is_none() && sh.cookie.is_none() {
        // A retry that changes nothing is illegal.
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
      if let Some(group) = sh.retry_group {
        if hs.active_kx.iter().any(|kx| kx.group() == group) {
          return Err(Error::alert(AlertDescription::IllegalParameter));
        }
        let kx = ctx
          .key_exchanges
          .iter()
          .find(|kx| kx.group() == group)
          .ok_or_else(|| Error::alert(AlertDescription::IllegalParameter))?;
        hs.active_kx = vec![kx.start()?];
      }
      hs.in_retry = true;
    }

    // Early data dies with the retry.
    if self.early_data_offered {
      self.early_data_offered = false;
      self.enc[EPOCH_EARLY] = None;
      self.write_epoch = EPOCH_INITIAL;
      if let Some(allowance) = props.client.max_early_data_size.as_mut() {
        *allowance = 0;
      }
    }

    self.suite = Some(suite);
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    // Definitive selection: replays the first ClientHello under the retry
    // suite's hash when it replaces a provisional PSK hash, so the rewrite
    // below digests under the negotiated hash.
    sched.select_hash(suite.hash);
    sched.rewrite_with_message_hash()?;
    sched.update_hash(message);

    let cookie = sh.cookie.map(|c| c.to_vec());
    let second_hello = self.build_client_hello(props, cookie)?;
    self.push_handshake_emit(EPOCH_INITIAL, second_hello, true)?;
    debug!(group = ?sh.retry_group, "retrying with second client hello");
    self.state = State::ClientExpectSecondServerHello;
    Ok(())
  }

  fn client_handle_encrypted_extensions(
    &mut self,
    message: &[u8],
    body: &[u8],
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let collect =
      props.collect_extension.as_deref().map(|f| f as &dyn Fn(u16) -> bool);
    let ee = msgs::parse_encrypted_extensions(body, collect)?;
    let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;

    if let Some(proto) = ee.alpn {
      if !hs.offered_protocols.iter().any(|p| p.as_slice() == proto) {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
      self.negotiated_protocol = Some(proto.to_vec());
    }
    if ee.early_data_accepted {
      if !self.early_data_offered {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
      self.early_data_accepted = true;
      props.client.early_data_accepted_by_peer = true;
    }
    match (&hs.sent_esni_nonce, ee.esni_nonce) {
      (None, None) => {},
      (Some(sent), Some(echoed)) if mem_equal(sent, echoed) => {},
      _ => return Err(Error::alert(AlertDescription::IllegalParameter)),
    }
    for (typ, data) in &ee.collected {
      props.collected_extensions.push((*typ, data.to_vec()));
    }

    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    self.state = if self.psk_used {
      State::ClientExpectFinished
    } else {
      State::ClientExpectCertOrCertReq
    };
    Ok(())
  }

  fn client_handle_certificate_request(
    &mut self,
    message: &[u8],
    body: &[u8],
  ) -> Result<(), Error> {
    let cr = msgs::parse_certificate_request(body)?;
    let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;
    hs.cert_request = Some((cr.context.to_vec(), cr.signature_algorithms));
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    self.state = State::ClientExpectCertificate;
    Ok(())
  }

  fn client_handle_certificate(
    &mut self,
    message: &[u8],
    body: &[u8],
    compressed: bool,
  ) -> Result<(), Error> {
    let decompressed;
    let cert_body = if compressed {
      let decompressor = self
        .ctx
        .decompress_certificate
        .as_ref()
        .ok_or_else(|| Error::alert(AlertDescription::UnexpectedMessage))?;
      let compressed_msg = msgs::parse_compressed_certificate(body)?;
      if !decompressor.supported_algorithms().contains(&compressed_msg.algorithm) {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
      decompressed = decompressor.decompress(
        compressed_msg.algorithm,
        compressed_msg.uncompressed_length,
        compressed_msg.compressed,
      )?;
      if decompressed.len() != compressed_msg.uncompressed_length {
        return Err(Error::CompressionFailure);
      }
      decompressed.as_slice()
    } else {
      body
    };

    let certificate = msgs::parse_certificate(cert_body)?;
    if !certificate.request_context.is_empty() {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    if certificate.entries.is_empty() {
      return Err(Error::alert(AlertDescription::DecodeError));
    }
    if let Some(verifier) = &self.ctx.verify_certificate {
      let verify =
        verifier.verify_chain(&certificate.entries, self.server_name.as_deref())?;
      self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?.server_verify =
        Some(verify);
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    self.state = State::ClientExpectCertificateVerify;
    Ok(())
  }

  fn client_handle_certificate_verify(&mut self, message: &[u8], body: &[u8]) -> Result<(), Error> {
    let cv = msgs::parse_certificate_verify(body)?;
    let hs = self.client_hs.as_mut().ok_or(Error::Library("client state missing"))?;
    if !hs.offered_signature_schemes.contains(&cv.scheme) {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
    let transcript = sched.transcript_hash()?;
    if let Some(verify) = hs.server_verify.take() {
      let data = certificate_verify_message(SERVER_CERTIFICATE_VERIFY_CONTEXT, &transcript);
      verify.verify(cv.scheme, &data, cv.signature)?;
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    self.state = State::ClientExpectFinished;
    Ok(())
  }

  fn client_handle_finished(
    &mut self,
    message: &[u8],
    body: &[u8],
    _props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let ctx = self.ctx.clone();
    {
      let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
      let secrets = self.hs_secrets.as_ref().ok_or(Error::Library("handshake secrets missing"))?;
      let expected = sched.finished_mac(&secrets.server)?;
      if !mem_equal(&expected, body) {
        return Err(Error::alert(AlertDescription::DecryptError));
      }
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    sched.extract(None)?;
    let server_app_secret = sched.derive_secret("s ap traffic")?;
    let client_app_secret = sched.derive_secret("c ap traffic")?;
    if ctx.use_exporter {
      self.exporter_master = Some(sched.derive_secret("exp master")?);
      self.keylog("EXPORTER_SECRET", self.exporter_master.as_ref().unwrap());
    }
    self.install_protection(false, EPOCH_APPLICATION, &server_app_secret)?;
    self.advance_read_epoch(EPOCH_APPLICATION)?;

    // Second flight: optional CCS, EndOfEarlyData, client auth, Finished.
    if ctx.send_change_cipher_spec {
      self.push_change_cipher_spec();
    }
    if self.early_data_accepted && !ctx.omit_end_of_early_data {
      // Still sealed under the early traffic keys; those are released once
      // the queue drains.
      let mut msg = Buffer::new();
      push_handshake_message(&mut msg, None, HandshakeType::EndOfEarlyData, |_| Ok(()))?;
      self.push_handshake_emit(EPOCH_EARLY, msg.as_slice().to_vec(), true)?;
    }

    let cert_request = self.client_hs.as_mut().and_then(|hs| hs.cert_request.take());
    if let Some((context, schemes)) = cert_request {
      self.client_send_certificate(&context, &schemes)?;
    }

    let finished = {
      let sched = self.key_schedule.as_ref().expect("present above");
      let secrets = self.hs_secrets.as_ref().expect("present above");
      sched.finished_mac(&secrets.client)?
    };
    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::Finished, |buf| {
      buf.extend_from_slice(&finished);
      Ok(())
    })?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)?;

    self.install_protection(true, EPOCH_APPLICATION, &client_app_secret)?;
    self.write_epoch = EPOCH_APPLICATION;
    let sched = self.key_schedule.as_mut().expect("present above");
    self.resumption_master = Some(sched.derive_secret("res master")?);

    self.handshake_complete = true;
    self.state = State::ClientPostHandshake;
    debug!("client handshake complete");
    Ok(())
  }

  /// Emits the client Certificate (and CertificateVerify when a signer and
  /// chain are available) in response to a CertificateRequest.
  fn client_send_certificate(&mut self, context: &[u8], schemes: &[u16]) -> Result<(), Error> {
    let ctx = self.ctx.clone();
    let chain: Vec<&[u8]> = ctx.certificates.iter().map(|c| c.as_slice()).collect();

    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::Certificate, |buf| {
      msgs::build_certificate_message(buf, context, &chain)
    })?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)?;

    let signer = match (&ctx.sign_certificate, chain.is_empty()) {
      (Some(signer), false) => signer,
      _ => return Ok(()),
    };
    let scheme = signer.select_scheme(schemes).ok_or_else(|| {
      Error::alert(AlertDescription::HandshakeFailure)
    })?;
    let transcript = self
      .key_schedule
      .as_ref()
      .ok_or(Error::Library("key schedule missing"))?
      .transcript_hash()?;
    let data = certificate_verify_message(CLIENT_CERTIFICATE_VERIFY_CONTEXT, &transcript);
    let signature = signer.sign(scheme, &data)?;

    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::CertificateVerify, |buf| {
      buf.push_u16(scheme);
      buf.push_block(2, |buf| {
        buf.extend_from_slice(&signature);
        Ok(())
      })
    })?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)
  }

  /// Post-handshake NewSessionTicket: derive the resumption PSK and hand the
  /// serialised session to the application.
  pub(crate) fn client_handle_new_session_ticket(&mut self, body: &[u8]) -> Result<(), Error> {
    let ctx = self.ctx.clone();
    let nst = msgs::parse_new_session_ticket(body)?;
    let suite = self.suite.ok_or(Error::Library("ticket before suite selection"))?;
    let resumption_master =
      self.resumption_master.as_ref().ok_or(Error::Library("resumption secret missing"))?;
    let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
    let psk = sched.expand_label(
      resumption_master,
      "resumption",
      nst.nonce,
      suite.hash.digest_size(),
    )?;

    let session = CachedSession {
      obtained_at: ctx.now_millis(),
      lifetime: nst.lifetime,
      age_add: nst.age_add,
      suite_id: suite.id,
      max_early_data_size: nst.max_early_data_size,
      alpn: self
        .negotiated_protocol
        .as_ref()
        .and_then(|p| String::from_utf8(p.clone()).ok()),
      psk: Zeroizing::new(psk.to_vec()),
      ticket: nst.ticket.to_vec(),
    };
    let mut encoded = Buffer::new();
    session.encode(&mut encoded)?;
    if let Some(save) = &ctx.save_ticket {
      save.save(self, encoded.as_slice())?;
    }
    debug!(lifetime = nst.lifetime, "session ticket cached");
    Ok(())
  }
}
