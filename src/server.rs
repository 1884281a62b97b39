//! Server side of the handshake state machine.

use tracing::debug;
use zeroize::Zeroizing;

use crate::buffer::Buffer;
use crate::client::{
  certificate_verify_message, CLIENT_CERTIFICATE_VERIFY_CONTEXT, SERVER_CERTIFICATE_VERIFY_CONTEXT,
};
use crate::config::{ClientHelloParams, HandshakeProperties};
use crate::connection::{
  Connection, HandshakeSecrets, State, EPOCH_APPLICATION, EPOCH_EARLY, EPOCH_HANDSHAKE,
  EPOCH_INITIAL,
};
use crate::crypto::{sign, CipherSuite, KeyExchange};
use crate::errors::{AlertDescription, Error};
use crate::esni;
use crate::key_schedule::KeySchedule;
use crate::msgs::{
  self, ext, push_handshake_message, ClientHello, HandshakeType, HELLO_RETRY_REQUEST_RANDOM,
  LEGACY_VERSION, PSK_MODE_DHE_KE, TLS13_VERSION,
};
use crate::ticket::TicketState;
use crate::utils::mem_equal;

/// Grace added to the ticket-age window to absorb clock skew.
const TICKET_AGE_SLACK_MILLIS: u64 = 10_000;

/// Per-handshake scratch state of a server connection.
pub(crate) struct ServerHandshake {
  /// Client application-traffic secret, installed once the client Finished
  /// verifies.
  pub client_app_secret: Option<Zeroizing<Vec<u8>>>,
  /// Digest over the negotiation-relevant ClientHello fields, for enforcing
  /// that a retried ClientHello changes nothing else.
  pub negotiation_digest: Option<Vec<u8>>,
  pub retry_group: Option<u16>,
  pub sent_cookie: bool,
  pub esni_nonce: Option<[u8; esni::ESNI_NONCE_SIZE]>,
  pub client_auth_verify: Option<Box<dyn crate::crypto::VerifySignature>>,
}

impl Default for ServerHandshake {
  fn default() -> Self {
    ServerHandshake {
      client_app_secret: None,
      negotiation_digest: None,
      retry_group: None,
      sent_cookie: false,
      esni_nonce: None,
      client_auth_verify: None,
    }
  }
}

impl Connection {
  pub(crate) fn server_handle_message(
    &mut self,
    typ: HandshakeType,
    message: &[u8],
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let body = &message[4..];
    match (self.state, typ) {
      (State::ServerExpectClientHello, HandshakeType::ClientHello)
      | (State::ServerExpectSecondClientHello, HandshakeType::ClientHello) => {
        self.server_handle_client_hello(message, props)
      },
      (State::ServerExpectEndOfEarlyData, HandshakeType::EndOfEarlyData) => {
        if !body.is_empty() {
          return Err(Error::alert(AlertDescription::DecodeError));
        }
        let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
        sched.update_hash(message);
        self.advance_read_epoch(EPOCH_HANDSHAKE)?;
        self.state = State::ServerExpectFinished;
        Ok(())
      },
      (State::ServerExpectCertificate, HandshakeType::Certificate) => {
        self.server_handle_client_certificate(message, body)
      },
      (State::ServerExpectCertificateVerify, HandshakeType::CertificateVerify) => {
        self.server_handle_client_certificate_verify(message, body)
      },
      (State::ServerExpectFinished, HandshakeType::Finished) => {
        self.server_handle_finished(message, body)
      },
      (State::ServerPostHandshake, HandshakeType::KeyUpdate) => {
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

  fn server_handle_client_hello(
    &mut self,
    message: &[u8],
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    let ctx = self.ctx.clone();
    let collect =
      props.collect_extension.as_deref().map(|f| f as &dyn Fn(u16) -> bool);
    let ch = msgs::parse_client_hello(message, collect)?;
    if !ch.tls13_offered {
      return Err(Error::alert(AlertDescription::ProtocolVersion));
    }
    let mut is_second = self.state == State::ServerExpectSecondClientHello;
    self.client_random = ch.random;

    // Cipher suite: first mutually supported in our preference order.
    let suite = ctx
      .cipher_suites
      .iter()
      .copied()
      .find(|own| ch.cipher_suites.contains(&own.id))
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;

    if self.server_hs.is_none() {
      self.server_hs = Some(ServerHandshake::default());
    }
    if self.key_schedule.is_none() {
      let mut sched = KeySchedule::new(ctx.hkdf_label_prefix.as_deref());
      sched.select_hash(suite.hash);
      self.key_schedule = Some(sched);
    }

    // A cookie on a first ClientHello resumes a stateless retry: rebuild the
    // transcript from the state carried inside it.
    if !is_second && ch.cookie.is_some() && props.server.retry_uses_cookie {
      let group = self.server_resume_stateless_retry(&ch, props)?;
      self.server_hs.as_mut().unwrap().retry_group = Some(group);
      self.server_hs.as_mut().unwrap().sent_cookie = true;
      is_second = true;
    }

    // ESNI, or plaintext SNI.
    let mut esni_used = false;
    if let Some(esni_ext) = &ch.esni {
      if !ctx.esni.is_empty() {
        let (name, nonce) = self.server_open_esni(esni_ext, ch.key_share_raw)?;
        self.server_name = Some(name);
        self.server_hs.as_mut().unwrap().esni_nonce = Some(nonce);
        esni_used = true;
      }
    } else if let Some(name) = &ch.server_name {
      self.server_name = Some(name.clone());
    }
    let sni_present = esni_used || ch.server_name.is_some();

    // Enforce that a retried ClientHello changed nothing but what the retry
    // asked for.
    let digest = negotiation_digest(suite, &ch);
    {
      let hs = self.server_hs.as_mut().unwrap();
      match &hs.negotiation_digest {
        Some(previous) if is_second => {
          if !mem_equal(previous, &digest) {
            return Err(Error::alert(AlertDescription::IllegalParameter));
          }
        },
        _ => hs.negotiation_digest = Some(digest),
      }
    }

    if let Some(cb) = &ctx.on_client_hello {
      let sni = self.server_name.clone();
      let params = ClientHelloParams {
        server_name: sni.as_deref(),
        negotiated_protocols: &ch.alpn,
        signature_algorithms: &ch.signature_algorithms,
        certificate_compression_algorithms: &ch.compress_algorithms,
        esni: esni_used,
      };
      cb.on_client_hello(self, &params)?;
    }
    for (typ, data) in &ch.collected {
      props.collected_extensions.push((*typ, data.to_vec()));
    }

    // Group selection is by strict server preference: the first of our key
    // exchanges the client supports wins, and a missing share for it costs
    // the client a retry round-trip.
    let kx: &'static dyn KeyExchange = ctx
      .key_exchanges
      .iter()
      .copied()
      .find(|kx| ch.supported_groups.contains(&kx.group()))
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    let share = ch.key_shares.iter().find(|s| s.group == kx.group());

    if is_second {
      // The retried hello must supply the share the retry asked for.
      let expected = self.server_hs.as_ref().unwrap().retry_group;
      if expected != Some(kx.group()) || share.is_none() {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
      if self.server_hs.as_ref().unwrap().sent_cookie && ch.cookie.is_none() {
        return Err(Error::alert(AlertDescription::MissingExtension));
      }
      if ch.early_data {
        return Err(Error::alert(AlertDescription::IllegalParameter));
      }
    }

    let force_retry = props.server.enforce_retry && !is_second;
    let peer_share = match (share, force_retry) {
      (Some(share), false) => share.key,
      (share, _) => {
        // Either no share for the preferred group, or a forced retry. Name
        // the group only when the client has not already shared it.
        let name_group = share.is_none();
        return self.server_send_retry(message, &ch, suite, kx.group(), name_group, props);
      },
    };

    // PSK resumption and the 0-RTT decision, both before the ClientHello
    // enters the transcript (the binder covers the truncated message).
    let mut early_data_accepted = false;
    let psk_accepted = self.server_try_psk(message, &ch, suite, props)?;
    if let Some(index) = psk_accepted {
      self.psk_used = true;
      if ch.early_data && index == 0 && !is_second && self.max_early_data_size > 0 {
        early_data_accepted = true;
      }
    } else {
      self.max_early_data_size = 0;
    }
    let sched = self.key_schedule.as_mut().unwrap();
    if psk_accepted.is_none() {
      sched.extract(None)?;
    }
    sched.update_hash(message);
    self.suite = Some(suite);
    self.negotiated_group = Some(kx.group());

    // Early traffic keys come off the transcript at the ClientHello.
    if early_data_accepted {
      self.early_data_accepted = true;
      let sched = self.key_schedule.as_ref().unwrap();
      let early_secret = sched.derive_secret("c e traffic")?;
      if ctx.use_exporter {
        self.early_exporter_master = Some(sched.derive_secret("e exp master")?);
        self.keylog("EARLY_EXPORTER_SECRET", self.early_exporter_master.as_ref().unwrap());
      }
      self.install_protection(false, EPOCH_EARLY, &early_secret)?;
    }

    // Key exchange and ServerHello.
    let (server_share, shared_secret) = kx.exchange(peer_share)?;
    let mut server_random = [0u8; 32];
    ctx.random.fill(&mut server_random);
    let sh = build_server_hello(
      &server_random,
      ch.legacy_session_id,
      suite.id,
      Some((kx.group(), server_share.as_slice())),
      None,
      psk_accepted,
    )?;
    self.push_handshake_emit(EPOCH_INITIAL, sh, true)?;
    if ctx.send_change_cipher_spec {
      self.push_change_cipher_spec();
    }

    let sched = self.key_schedule.as_mut().unwrap();
    sched.extract(Some(&shared_secret))?;
    let client_hs_secret = sched.derive_secret("c hs traffic")?;
    let server_hs_secret = sched.derive_secret("s hs traffic")?;
    self.hs_secrets = Some(HandshakeSecrets {
      client: Zeroizing::new(client_hs_secret.to_vec()),
      server: Zeroizing::new(server_hs_secret.to_vec()),
    });
    self.install_protection(true, EPOCH_HANDSHAKE, &server_hs_secret)?;
    self.install_protection(false, EPOCH_HANDSHAKE, &client_hs_secret)?;
    self.write_epoch = EPOCH_HANDSHAKE;

    // EncryptedExtensions.
    let ee = self.build_encrypted_extensions(sni_present, early_data_accepted, props)?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, ee, true)?;

    let client_auth = ctx.require_client_authentication && !self.psk_used;
    if client_auth {
      let mut msg = Buffer::new();
      push_handshake_message(&mut msg, None, HandshakeType::CertificateRequest, |buf| {
        buf.push_block(1, |_| Ok(()))?; // empty certificate_request_context
        buf.push_block(2, |buf| {
          buf.push_u16(ext::SIGNATURE_ALGORITHMS);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              for scheme in sign::default_signature_schemes() {
                buf.push_u16(scheme);
              }
              Ok(())
            })
          })
        })
      })?;
      self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)?;
    }

    if !self.psk_used {
      self.server_send_certificate(&ch.signature_algorithms)?;
    }

    // Server Finished.
    let finished = {
      let sched = self.key_schedule.as_ref().unwrap();
      sched.finished_mac(&self.hs_secrets.as_ref().unwrap().server)?
    };
    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::Finished, |buf| {
      buf.extend_from_slice(&finished);
      Ok(())
    })?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)?;

    // Application secrets: the server can write immediately.
    let sched = self.key_schedule.as_mut().unwrap();
    sched.extract(None)?;
    let server_app_secret = sched.derive_secret("s ap traffic")?;
    let client_app_secret = sched.derive_secret("c ap traffic")?;
    if ctx.use_exporter {
      self.exporter_master = Some(sched.derive_secret("exp master")?);
      self.keylog("EXPORTER_SECRET", self.exporter_master.as_ref().unwrap());
    }
    self.install_protection(true, EPOCH_APPLICATION, &server_app_secret)?;
    self.server_hs.as_mut().unwrap().client_app_secret =
      Some(Zeroizing::new(client_app_secret.to_vec()));
    self.write_epoch = EPOCH_APPLICATION;

    self.state = if early_data_accepted && !ctx.omit_end_of_early_data {
      self.advance_read_epoch(EPOCH_EARLY)?;
      State::ServerExpectEndOfEarlyData
    } else if early_data_accepted {
      self.advance_read_epoch(EPOCH_EARLY)?;
      State::ServerExpectFinished
    } else if client_auth {
      self.advance_read_epoch(EPOCH_HANDSHAKE)?;
      State::ServerExpectCertificate
    } else {
      self.advance_read_epoch(EPOCH_HANDSHAKE)?;
      State::ServerExpectFinished
    };
    debug!(suite = suite.id, group = kx.group(), psk = self.psk_used, early = early_data_accepted,
           "server flight emitted");
    Ok(())
  }

  /// Sends a HelloRetryRequest for `group`. With a cookie the retry is
  /// stateless and the connection is disposable afterwards. `name_group`
  /// controls whether the key_share extension names the group; a retry whose
  /// group the client already shared must change something else (the cookie).
  fn server_send_retry(
    &mut self,
    message: &[u8],
    ch: &ClientHello<'_>,
    suite: &'static CipherSuite,
    group: u16,
    name_group: bool,
    props: &mut HandshakeProperties,
  ) -> Result<(), Error> {
    if self.state == State::ServerExpectSecondClientHello {
      // One retry per connection.
      return Err(Error::alert(AlertDescription::UnexpectedMessage));
    }
    if !name_group && !props.server.retry_uses_cookie {
      return Err(Error::Library("enforce_retry without a new group requires retry_uses_cookie"));
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    let ch1_hash = sched.transcript_hash()?;
    sched.rewrite_with_message_hash()?;

    let cookie = if props.server.retry_uses_cookie {
      let key = props
        .server
        .cookie_key
        .as_ref()
        .ok_or(Error::Library("retry_uses_cookie requires a cookie key"))?;
      Some(build_cookie(
        suite,
        group,
        name_group,
        &ch1_hash,
        key,
        &props.server.cookie_additional_data,
      ))
    } else {
      None
    };

    let hrr = build_server_hello(
      &HELLO_RETRY_REQUEST_RANDOM,
      ch.legacy_session_id,
      suite.id,
      None,
      Some((name_group.then_some(group), cookie.as_deref())),
      None,
    )?;
    self.push_handshake_emit(EPOCH_INITIAL, hrr, true)?;
    self.suite = Some(suite);

    let hs = self.server_hs.as_mut().unwrap();
    hs.retry_group = Some(group);
    hs.sent_cookie = cookie.is_some();
    debug!(group, stateless = cookie.is_some(), "hello retry request sent");
    if cookie.is_some() {
      // Stateless: the cookie carries everything needed to resume on a fresh
      // connection.
      return Err(Error::StatelessRetry);
    }
    self.state = State::ServerExpectSecondClientHello;
    Ok(())
  }

  /// Verifies the cookie of a stateless retry and replays the transcript the
  /// original connection would have had. Returns the group the retry named.
  fn server_resume_stateless_retry(
    &mut self,
    ch: &ClientHello<'_>,
    props: &mut HandshakeProperties,
  ) -> Result<u16, Error> {
    let key = props
      .server
      .cookie_key
      .as_ref()
      .ok_or(Error::Library("retry_uses_cookie requires a cookie key"))?;
    let cookie = ch.cookie.expect("caller checked");
    let (suite, group, named_group, ch1_hash) =
      verify_cookie(&self.ctx.cipher_suites, cookie, key, &props.server.cookie_additional_data)?;

    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    if sched.hash()?.id() != suite.hash.id() {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    let mut synthetic = vec![HandshakeType::MessageHash as u8, 0, 0, ch1_hash.len() as u8];
    synthetic.extend_from_slice(&ch1_hash);
    sched.update_hash(&synthetic);

    let hrr = build_server_hello(
      &HELLO_RETRY_REQUEST_RANDOM,
      ch.legacy_session_id,
      suite.id,
      None,
      Some((named_group.then_some(group), Some(cookie))),
      None,
    )?;
    sched.update_hash(&hrr);
    debug!(group, "stateless retry resumed from cookie");
    Ok(group)
  }

  /// Attempts PSK resumption. Returns the accepted identity index, leaving
  /// the key schedule extracted with the PSK on success.
  fn server_try_psk(
    &mut self,
    message: &[u8],
    ch: &ClientHello<'_>,
    suite: &'static CipherSuite,
    props: &mut HandshakeProperties,
  ) -> Result<Option<u16>, Error> {
    let ctx = self.ctx.clone();
    let psk = match &ch.psk {
      Some(psk) => psk,
      None => return Ok(None),
    };
    let decryptor = match &ctx.encrypt_ticket {
      Some(decryptor) => decryptor,
      None => return Ok(None),
    };
    if !ch.psk_modes.contains(&PSK_MODE_DHE_KE) {
      // Plain psk_ke offers no forward secrecy; insist on (EC)DHE.
      return Ok(None);
    }

    let now = ctx.now_millis();
    for (index, identity) in psk.identities.iter().enumerate() {
      let plaintext = match decryptor.process(false, identity.identity) {
        Ok(plaintext) => plaintext,
        Err(_) => continue,
      };
      let state = match TicketState::decode(&plaintext) {
        Ok(state) => state,
        Err(_) => continue,
      };
      if state.suite_id != suite.id {
        // The PSK hash must match the negotiated suite.
        let offered = crate::crypto::find_cipher_suite(&ctx.cipher_suites, state.suite_id);
        if offered.map_or(true, |s| s.hash.id() != suite.hash.id()) {
          continue;
        }
      }
      let lifetime_millis = ctx.ticket_lifetime as u64 * 1000;
      if now >= state.issued_at.saturating_add(lifetime_millis) {
        continue;
      }
      let claimed_age = identity.obfuscated_ticket_age.wrapping_sub(state.age_add) as u64;
      if claimed_age > lifetime_millis + TICKET_AGE_SLACK_MILLIS {
        continue;
      }

      // Binder check, in constant time, over the truncated ClientHello.
      let binder = psk.binders[index];
      if binder.len() != suite.hash.digest_size() {
        return Err(Error::alert(AlertDescription::DecodeError));
      }
      let sched = self.key_schedule.as_mut().unwrap();
      sched.extract(Some(&state.psk))?;
      let expected = {
        let sched = self.key_schedule.as_ref().unwrap();
        let truncated = sched.transcript_hash_with_partial(&message[..psk.binders_offset])?;
        let binder_key = sched.derive_secret_with_hash("res binder", suite.hash.empty_digest())?;
        sched.finished_mac_with_hash(&binder_key, &truncated)?
      };
      if !mem_equal(&expected, binder) {
        return Err(Error::alert(AlertDescription::DecryptError));
      }
      props.server.selected_psk_binder = binder.to_vec();
      self.max_early_data_size = state.max_early_data_size;
      if let Some(alpn) = &state.alpn {
        // Resumed early data runs under the session's original protocol.
        if self.negotiated_protocol.is_none() {
          self.negotiated_protocol = Some(alpn.as_bytes().to_vec());
        }
      }
      debug!(index, "psk resumption accepted");
      return Ok(Some(index as u16));
    }
    Ok(None)
  }

  fn server_open_esni(
    &mut self,
    esni_ext: &msgs::EsniExtension<'_>,
    key_share_aad: &[u8],
  ) -> Result<(String, [u8; esni::ESNI_NONCE_SIZE]), Error> {
    let ctx = self.ctx.clone();
    let now_seconds = ctx.now_millis() / 1000;
    for context in &ctx.esni {
      if !context.is_valid_at(now_seconds) {
        continue;
      }
      let suite = match context
        .cipher_suites
        .iter()
        .find(|s| s.suite.id == esni_ext.suite_id && s.record_digest == esni_ext.record_digest)
      {
        Some(esni_suite) => esni_suite,
        None => continue,
      };
      let kx = match context.key_exchanges.iter().find(|k| k.group() == esni_ext.key_share.group) {
        Some(kx) => kx,
        None => continue,
      };
      let z = kx.derive(esni_ext.key_share.key)?;
      let zx = esni::extract_zx(suite.suite.hash, &z);
      let contents_hash = esni::hash_esni_contents(
        suite.suite.hash,
        &suite.record_digest,
        esni_ext.key_share.group,
        esni_ext.key_share.key,
        &self.client_random,
      );
      if let Some(update) = &ctx.update_esni_key {
        update.update(&zx, suite.suite.hash, &contents_hash)?;
      }
      let (key, iv) = esni::esni_aead_material(suite.suite, &zx, &contents_hash)?;
      let aead = suite.suite.aead.new_context(&key, &iv)?;
      let opened = aead
        .open(0, key_share_aad, esni_ext.encrypted_sni)
        .map_err(|_| Error::alert(AlertDescription::DecryptError))?;
      let (nonce, name) = esni::parse_padded_sni(&opened)?;
      debug!("encrypted sni decrypted");
      return Ok((name, nonce));
    }
    Err(Error::alert(AlertDescription::IllegalParameter))
  }

  fn build_encrypted_extensions(
    &mut self,
    sni_present: bool,
    early_data_accepted: bool,
    props: &HandshakeProperties,
  ) -> Result<Vec<u8>, Error> {
    let esni_nonce = self.server_hs.as_ref().and_then(|hs| hs.esni_nonce);
    let alpn = self.negotiated_protocol.clone();
    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::EncryptedExtensions, |buf| {
      buf.push_block(2, |buf| {
        if let Some(proto) = &alpn {
          buf.push_u16(ext::ALPN);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              buf.push_block(1, |buf| {
                buf.extend_from_slice(proto);
                Ok(())
              })
            })
          })?;
        }
        if sni_present && esni_nonce.is_none() {
          buf.push_u16(ext::SERVER_NAME);
          buf.push_block(2, |_| Ok(()))?;
        }
        if let Some(nonce) = &esni_nonce {
          buf.push_u16(ext::ENCRYPTED_SERVER_NAME);
          buf.push_block(2, |buf| {
            buf.extend_from_slice(nonce);
            Ok(())
          })?;
        }
        if early_data_accepted {
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
        Ok(())
      })
    })?;
    Ok(msg.as_slice().to_vec())
  }

  fn server_send_certificate(&mut self, offered_schemes: &[u16]) -> Result<(), Error> {
    let ctx = self.ctx.clone();

    let body = if let Some(emitter) = &ctx.emit_certificate {
      emitter.certificate_body(self, &[])?
    } else {
      if ctx.certificates.is_empty() {
        return Err(Error::alert(AlertDescription::HandshakeFailure));
      }
      let chain: Vec<&[u8]> = ctx.certificates.iter().map(|c| c.as_slice()).collect();
      let mut buf = Buffer::new();
      msgs::build_certificate_message(&mut buf, &[], &chain)?;
      buf.as_slice().to_vec()
    };
    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::Certificate, |buf| {
      buf.extend_from_slice(&body);
      Ok(())
    })?;
    self.push_handshake_emit(EPOCH_HANDSHAKE, msg.as_slice().to_vec(), true)?;

    let signer = ctx
      .sign_certificate
      .as_ref()
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    let scheme = signer
      .select_scheme(offered_schemes)
      .ok_or_else(|| Error::alert(AlertDescription::HandshakeFailure))?;
    let transcript = self
      .key_schedule
      .as_ref()
      .ok_or(Error::Library("key schedule missing"))?
      .transcript_hash()?;
    let data = certificate_verify_message(SERVER_CERTIFICATE_VERIFY_CONTEXT, &transcript);
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

  fn server_handle_client_certificate(&mut self, message: &[u8], body: &[u8]) -> Result<(), Error> {
    let certificate = msgs::parse_certificate(body)?;
    if !certificate.request_context.is_empty() {
      return Err(Error::alert(AlertDescription::IllegalParameter));
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    if certificate.entries.is_empty() {
      if self.ctx.require_client_authentication {
        return Err(Error::alert(AlertDescription::CertificateRequired));
      }
      self.state = State::ServerExpectFinished;
      return Ok(());
    }
    if let Some(verifier) = &self.ctx.verify_certificate {
      let verify = verifier.verify_chain(&certificate.entries, None)?;
      self.server_hs.as_mut().ok_or(Error::Library("server state missing"))?.client_auth_verify =
        Some(verify);
    }
    self.state = State::ServerExpectCertificateVerify;
    Ok(())
  }

  fn server_handle_client_certificate_verify(
    &mut self,
    message: &[u8],
    body: &[u8],
  ) -> Result<(), Error> {
    let cv = msgs::parse_certificate_verify(body)?;
    let transcript = self
      .key_schedule
      .as_ref()
      .ok_or(Error::Library("key schedule missing"))?
      .transcript_hash()?;
    let verify = self.server_hs.as_mut().and_then(|hs| hs.client_auth_verify.take());
    if let Some(verify) = verify {
      let data = certificate_verify_message(CLIENT_CERTIFICATE_VERIFY_CONTEXT, &transcript);
      verify.verify(cv.scheme, &data, cv.signature)?;
    }
    let sched = self.key_schedule.as_mut().ok_or(Error::Library("key schedule missing"))?;
    sched.update_hash(message);
    self.state = State::ServerExpectFinished;
    Ok(())
  }

  fn server_handle_finished(&mut self, message: &[u8], body: &[u8]) -> Result<(), Error> {
    {
      let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
      let secrets = self.hs_secrets.as_ref().ok_or(Error::Library("handshake secrets missing"))?;
      let expected = sched.finished_mac(&secrets.client)?;
      if !mem_equal(&expected, body) {
        return Err(Error::alert(AlertDescription::DecryptError));
      }
    }
    let sched = self.key_schedule.as_mut().unwrap();
    sched.update_hash(message);
    self.resumption_master = Some(sched.derive_secret("res master")?);

    let client_app_secret = self
      .server_hs
      .as_mut()
      .and_then(|hs| hs.client_app_secret.take())
      .ok_or(Error::Library("application secret missing"))?;
    self.install_protection(false, EPOCH_APPLICATION, &client_app_secret)?;
    self.advance_read_epoch(EPOCH_APPLICATION)?;
    self.handshake_complete = true;
    self.state = State::ServerPostHandshake;
    debug!("server handshake complete");

    self.server_maybe_send_ticket()
  }

  /// Emits at most one NewSessionTicket per connection, right after the
  /// handshake completes.
  fn server_maybe_send_ticket(&mut self) -> Result<(), Error> {
    let ctx = self.ctx.clone();
    let encryptor = match &ctx.encrypt_ticket {
      Some(encryptor) if ctx.ticket_lifetime > 0 => encryptor,
      _ => return Ok(()),
    };
    let suite = self.suite.ok_or(Error::Library("suite missing"))?;
    let resumption_master =
      self.resumption_master.as_ref().ok_or(Error::Library("resumption secret missing"))?;
    let sched = self.key_schedule.as_ref().ok_or(Error::Library("key schedule missing"))?;
    let psk =
      sched.expand_label(resumption_master, "resumption", &[], suite.hash.digest_size())?;

    let mut age_add_bytes = [0u8; 4];
    ctx.random.fill(&mut age_add_bytes);
    let age_add = u32::from_be_bytes(age_add_bytes);

    let state = TicketState {
      issued_at: ctx.now_millis(),
      age_add,
      suite_id: suite.id,
      max_early_data_size: ctx.max_early_data_size,
      alpn: self
        .negotiated_protocol
        .as_ref()
        .and_then(|p| String::from_utf8(p.clone()).ok()),
      psk: Zeroizing::new(psk.to_vec()),
    };
    let mut plaintext = Buffer::new();
    state.encode(&mut plaintext)?;
    let ticket = encryptor.process(true, plaintext.as_slice())?;

    let mut msg = Buffer::new();
    push_handshake_message(&mut msg, None, HandshakeType::NewSessionTicket, |buf| {
      buf.push_u32(ctx.ticket_lifetime);
      buf.push_u32(age_add);
      buf.push_block(1, |_| Ok(()))?; // empty ticket_nonce
      buf.push_block(2, |buf| {
        buf.extend_from_slice(&ticket);
        Ok(())
      })?;
      buf.push_block(2, |buf| {
        if ctx.max_early_data_size > 0 {
          buf.push_u16(ext::EARLY_DATA);
          buf.push_block(2, |buf| {
            buf.push_u32(ctx.max_early_data_size);
            Ok(())
          })?;
        }
        Ok(())
      })
    })?;
    self.push_handshake_emit(EPOCH_APPLICATION, msg.as_slice().to_vec(), false)?;
    debug!(lifetime = ctx.ticket_lifetime, "session ticket issued");
    Ok(())
  }
}

/// Serialises a ServerHello or HelloRetryRequest message.
fn build_server_hello(
  random: &[u8; 32],
  session_id_echo: &[u8],
  suite_id: u16,
  key_share: Option<(u16, &[u8])>,
  retry: Option<(Option<u16>, Option<&[u8]>)>,
  psk_identity: Option<u16>,
) -> Result<Vec<u8>, Error> {
  let mut msg = Buffer::new();
  push_handshake_message(&mut msg, None, HandshakeType::ServerHello, |buf| {
    buf.push_u16(LEGACY_VERSION);
    buf.extend_from_slice(random);
    buf.push_block(1, |buf| {
      buf.extend_from_slice(session_id_echo);
      Ok(())
    })?;
    buf.push_u16(suite_id);
    buf.push_u8(0); // legacy_compression_method
    buf.push_block(2, |buf| {
      buf.push_u16(ext::SUPPORTED_VERSIONS);
      buf.push_block(2, |buf| {
        buf.push_u16(TLS13_VERSION);
        Ok(())
      })?;
      if let Some((group, key)) = key_share {
        buf.push_u16(ext::KEY_SHARE);
        buf.push_block(2, |buf| {
          buf.push_u16(group);
          buf.push_block(2, |buf| {
            buf.extend_from_slice(key);
            Ok(())
          })
        })?;
      }
      if let Some((group, cookie)) = retry {
        if let Some(group) = group {
          buf.push_u16(ext::KEY_SHARE);
          buf.push_block(2, |buf| {
            buf.push_u16(group);
            Ok(())
          })?;
        }
        if let Some(cookie) = cookie {
          buf.push_u16(ext::COOKIE);
          buf.push_block(2, |buf| {
            buf.push_block(2, |buf| {
              buf.extend_from_slice(cookie);
              Ok(())
            })
          })?;
        }
      }
      if let Some(identity) = psk_identity {
        buf.push_u16(ext::PRE_SHARED_KEY);
        buf.push_block(2, |buf| {
          buf.push_u16(identity);
          Ok(())
        })?;
      }
      Ok(())
    })
  })?;
  Ok(msg.as_slice().to_vec())
}

/// Digest over the negotiation-relevant ClientHello contents, for the
/// retry-consistency check.
fn negotiation_digest(suite: &'static CipherSuite, ch: &ClientHello<'_>) -> Vec<u8> {
  let mut ctx = suite.hash.start();
  for id in &ch.cipher_suites {
    ctx.update(&id.to_be_bytes());
  }
  ctx.update(&[0xFF]);
  for group in &ch.supported_groups {
    ctx.update(&group.to_be_bytes());
  }
  ctx.update(&[0xFF]);
  for scheme in &ch.signature_algorithms {
    ctx.update(&scheme.to_be_bytes());
  }
  ctx.update(&[0xFF]);
  if let Some(name) = &ch.server_name {
    ctx.update(name.as_bytes());
  }
  ctx.update(&[0xFF]);
  for proto in &ch.alpn {
    ctx.update(&[proto.len() as u8]);
    ctx.update(proto);
  }
  ctx.snapshot()
}

/// Cookie layout: suite, group, whether the retry named the group, the
/// first-ClientHello hash, then an HMAC over all of it plus the caller's
/// additional data.
fn build_cookie(
  suite: &'static CipherSuite,
  group: u16,
  named_group: bool,
  ch1_hash: &[u8],
  key: &[u8],
  additional_data: &[u8],
) -> Vec<u8> {
  let mut body = Vec::with_capacity(6 + ch1_hash.len() + suite.hash.digest_size());
  body.extend_from_slice(&suite.id.to_be_bytes());
  body.extend_from_slice(&group.to_be_bytes());
  body.push(named_group as u8);
  body.push(ch1_hash.len() as u8);
  body.extend_from_slice(ch1_hash);
  let mac = suite.hash.hmac(key, &[&body, additional_data]);
  body.extend_from_slice(&mac);
  body
}

fn verify_cookie(
  suites: &[&'static CipherSuite],
  cookie: &[u8],
  key: &[u8],
  additional_data: &[u8],
) -> Result<(&'static CipherSuite, u16, bool, Vec<u8>), Error> {
  let fail = || Error::alert(AlertDescription::IllegalParameter);
  if cookie.len() < 6 {
    return Err(fail());
  }
  let suite_id = u16::from_be_bytes([cookie[0], cookie[1]]);
  let group = u16::from_be_bytes([cookie[2], cookie[3]]);
  let named_group = cookie[4] != 0;
  let hash_len = cookie[5] as usize;
  let suite = crate::crypto::find_cipher_suite(suites, suite_id).ok_or_else(fail)?;
  let mac_len = suite.hash.digest_size();
  if cookie.len() != 6 + hash_len + mac_len {
    return Err(fail());
  }
  let (body, mac) = cookie.split_at(6 + hash_len);
  let expected = suite.hash.hmac(key, &[body, additional_data]);
  if !mem_equal(&expected, mac) {
    return Err(fail());
  }
  Ok((suite, group, named_group, body[6..].to_vec()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::TLS_AES_128_GCM_SHA256;

  #[test]
  fn cookie_round_trip_and_tamper_detection() {
    let suite = &TLS_AES_128_GCM_SHA256;
    let key = [0x55u8; 32];
    let ch1_hash = vec![9u8; 32];
    let cookie = build_cookie(suite, 29, true, &ch1_hash, &key, b"addr");

    let suites = vec![suite];
    let (parsed_suite, group, named, hash) =
      verify_cookie(&suites, &cookie, &key, b"addr").unwrap();
    assert_eq!(parsed_suite.id, suite.id);
    assert_eq!(group, 29);
    assert!(named);
    assert_eq!(hash, ch1_hash);

    assert!(verify_cookie(&suites, &cookie, &key, b"other").is_err());
    let mut tampered = cookie.clone();
    tampered[7] ^= 1;
    assert!(verify_cookie(&suites, &tampered, &key, b"addr").is_err());
  }
}
