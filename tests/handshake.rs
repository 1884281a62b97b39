//! End-to-end handshake scenarios, driving two engines against each other by
//! piping their send buffers into each other's input.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use tls_engine::config::{
  ClientHelloParams, EncryptTicket, OnClientHello, SaveTicket, UpdateOpenCount, UpdateTrafficKey,
};
use tls_engine::crypto::sign::{EcdsaP256Signer, EcdsaP256Verifier};
use tls_engine::crypto::{
  group, CipherSuite, Secp256r1, X25519, TLS_AES_128_GCM_SHA256, TLS_AES_256_GCM_SHA384,
};
use tls_engine::esni::{EsniCipherSuite, EsniContext, EsniKeyExchange, EsniKeys, X25519EsniKey};
use tls_engine::{
  AlertDescription, Buffer, Connection, Context, Error, HandshakeProperties, HandshakeStatus,
  ReceiveStatus, Side,
};

const SIGNER_SECRET: [u8; 32] = [0x42; 32];

fn test_signer() -> EcdsaP256Signer {
  EcdsaP256Signer::from_secret_bytes(&SIGNER_SECRET).unwrap()
}

fn test_verifier() -> EcdsaP256Verifier {
  EcdsaP256Verifier::from_public_key_bytes(&test_signer().public_key_bytes()).unwrap()
}

/// ALPN selection hook: picks the first client protocol present in our list.
struct SelectAlpn(Vec<Vec<u8>>);

impl OnClientHello for SelectAlpn {
  fn on_client_hello(
    &self,
    conn: &mut Connection,
    params: &ClientHelloParams<'_>,
  ) -> Result<(), Error> {
    if params.negotiated_protocols.is_empty() {
      return Ok(());
    }
    for offered in params.negotiated_protocols {
      if self.0.iter().any(|own| own.as_slice() == *offered) {
        conn.set_negotiated_protocol(offered);
        return Ok(());
      }
    }
    Err(Error::alert(AlertDescription::NoApplicationProtocol))
  }
}

/// Stand-in ticket protection: real deployments seal with a rotating key, the
/// engine only cares that decrypt inverts encrypt.
struct PrefixTicketCrypto;

impl EncryptTicket for PrefixTicketCrypto {
  fn process(&self, is_encrypt: bool, src: &[u8]) -> Result<Vec<u8>, Error> {
    if is_encrypt {
      let mut out = b"tkt:".to_vec();
      out.extend_from_slice(src);
      Ok(out)
    } else {
      src.strip_prefix(b"tkt:").map(|rest| rest.to_vec()).ok_or(Error::SessionNotFound)
    }
  }
}

struct SaveToMemory(Arc<Mutex<Vec<Vec<u8>>>>);

impl SaveTicket for SaveToMemory {
  fn save(&self, _conn: &Connection, session: &[u8]) -> Result<(), Error> {
    self.0.lock().unwrap().push(session.to_vec());
    Ok(())
  }
}

struct OpenCounter(Arc<AtomicI64>);

impl UpdateOpenCount for OpenCounter {
  fn update(&self, delta: i64) {
    self.0.fetch_add(delta, Ordering::SeqCst);
  }
}

fn client_context() -> Context {
  Context {
    cipher_suites: vec![&TLS_AES_128_GCM_SHA256],
    key_exchanges: vec![&X25519],
    verify_certificate: Some(Box::new(test_verifier())),
    ..Context::default()
  }
}

fn server_context() -> Context {
  Context {
    cipher_suites: vec![&TLS_AES_128_GCM_SHA256],
    key_exchanges: vec![&X25519],
    certificates: vec![b"opaque test certificate".to_vec()],
    sign_certificate: Some(Box::new(test_signer())),
    on_client_hello: Some(Box::new(SelectAlpn(vec![b"h2".to_vec()]))),
    ..Context::default()
  }
}

/// Runs both engines until the handshake completes on each side, returning
/// whatever bytes were left undelivered in either direction.
fn drive(
  client: &mut Connection,
  server: &mut Connection,
  cprops: &mut HandshakeProperties,
  sprops: &mut HandshakeProperties,
  mut c2s: Vec<u8>,
  mut s2c: Vec<u8>,
) -> (Vec<u8>, Vec<u8>) {
  for _ in 0..16 {
    if client.handshake_is_complete() && server.handshake_is_complete() {
      return (c2s, s2c);
    }
    if !client.handshake_is_complete() {
      let mut out = Buffer::new();
      let status = client.handshake(&mut out, &s2c, cprops).expect("client handshake");
      let consumed = match status {
        HandshakeStatus::Complete { consumed } => consumed,
        HandshakeStatus::InProgress => s2c.len(),
      };
      s2c.drain(..consumed);
      c2s.extend_from_slice(out.as_slice());
    }
    if !server.handshake_is_complete() {
      let mut out = Buffer::new();
      let status = server.handshake(&mut out, &c2s, sprops).expect("server handshake");
      let consumed = match status {
        HandshakeStatus::Complete { consumed } => consumed,
        HandshakeStatus::InProgress => c2s.len(),
      };
      c2s.drain(..consumed);
      s2c.extend_from_slice(out.as_slice());
    }
  }
  panic!("handshake did not converge");
}

/// One-record receive helper; returns the plaintext delivered by the record.
fn receive_one(conn: &mut Connection, wire: &mut Vec<u8>) -> Vec<u8> {
  let mut plain = Buffer::new();
  match conn.receive(&mut plain, wire).expect("receive") {
    ReceiveStatus::Record { consumed } => {
      wire.drain(..consumed);
    },
    ReceiveStatus::InProgress => panic!("partial record in test"),
  }
  plain.as_slice().to_vec()
}

fn exchange_ping(client: &mut Connection, server: &mut Connection) {
  let mut wire = Buffer::new();
  client.send(&mut wire, b"ping").unwrap();
  let mut wire = wire.as_slice().to_vec();
  assert_eq!(receive_one(server, &mut wire), b"ping");

  let mut wire = Buffer::new();
  server.send(&mut wire, b"pong").unwrap();
  let mut wire = wire.as_slice().to_vec();
  assert_eq!(receive_one(client, &mut wire), b"pong");
}

#[test]
fn full_handshake_with_alpn_and_application_data() {
  let opens = Arc::new(AtomicI64::new(0));
  let mut server_ctx = server_context();
  server_ctx.update_open_count = Some(Box::new(OpenCounter(opens.clone())));

  let mut client = Connection::new(Arc::new(client_context()), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");

  let mut cprops = HandshakeProperties::default();
  cprops.client.negotiated_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
  let mut sprops = HandshakeProperties::default();

  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  assert!(client.handshake_is_complete());
  assert!(server.handshake_is_complete());
  assert!(!client.is_psk_handshake());
  assert!(!server.is_psk_handshake());
  assert!(!client.is_server());
  assert!(server.is_server());
  assert_eq!(client.get_cipher().unwrap().id, 0x1301);
  assert_eq!(server.get_cipher().unwrap().id, 0x1301);
  assert_eq!(client.get_negotiated_protocol(), Some(&b"h2"[..]));
  assert_eq!(server.get_negotiated_protocol(), Some(&b"h2"[..]));
  assert_eq!(server.get_server_name(), Some("example.com"));
  assert_eq!(client.get_client_random(), server.get_client_random());
  assert_eq!(client.get_record_overhead(), 5 + 1 + 16);

  exchange_ping(&mut client, &mut server);

  assert_eq!(opens.load(Ordering::SeqCst), 1);
  drop(server);
  assert_eq!(opens.load(Ordering::SeqCst), 0);
}

#[test]
fn hello_retry_request_negotiates_servers_preferred_group() {
  // Client shares only X25519; the server prefers secp256r1, so it answers
  // with a HelloRetryRequest naming group 23 and completes on the retry.
  let mut client_ctx = client_context();
  client_ctx.key_exchanges = vec![&X25519, &Secp256r1];
  let mut server_ctx = server_context();
  server_ctx.key_exchanges = vec![&Secp256r1, &X25519];

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");

  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  assert!(client.handshake_is_complete());
  assert!(server.handshake_is_complete());
  assert_eq!(client.get_negotiated_group(), Some(group::SECP256R1));
  assert_eq!(server.get_negotiated_group(), Some(group::SECP256R1));
  exchange_ping(&mut client, &mut server);
}

fn resumable_server_context() -> Context {
  let mut ctx = server_context();
  ctx.encrypt_ticket = Some(Box::new(PrefixTicketCrypto));
  ctx.ticket_lifetime = 3600;
  ctx.max_early_data_size = 16384;
  ctx
}

#[test]
fn psk_resumption_with_early_data() {
  let saved = Arc::new(Mutex::new(Vec::new()));
  let mut client_ctx = client_context();
  client_ctx.save_ticket = Some(Box::new(SaveToMemory(saved.clone())));
  let client_ctx = Arc::new(client_ctx);
  let server_ctx = Arc::new(resumable_server_context());

  // First connection: full handshake, ticket issued on completion.
  let mut client = Connection::new(client_ctx.clone(), Side::Client);
  let mut server = Connection::new(server_ctx.clone(), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());
  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }
  let session = saved.lock().unwrap().last().cloned().expect("ticket saved");

  // Second connection: resume with 0-RTT.
  let mut client = Connection::new(client_ctx, Side::Client);
  let mut server = Connection::new(server_ctx, Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  cprops.client.session_ticket = Some(session);
  cprops.client.max_early_data_size = Some(0);
  let mut sprops = HandshakeProperties::default();

  let mut first_flight = Buffer::new();
  let status = client.handshake(&mut first_flight, &[], &mut cprops).unwrap();
  assert_eq!(status, HandshakeStatus::InProgress);
  assert_eq!(cprops.client.max_early_data_size, Some(16384));
  let mut c2s = first_flight.as_slice().to_vec();
  let mut early = Buffer::new();
  client.send(&mut early, b"early").unwrap();
  c2s.extend_from_slice(early.as_slice());

  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, c2s, Vec::new());

  assert!(cprops.client.early_data_accepted_by_peer);
  assert!(client.early_data_accepted());
  assert!(client.is_psk_handshake());
  assert!(server.is_psk_handshake());

  // The buffered early data is delivered ahead of any new input.
  let mut plain = Buffer::new();
  let status = server.receive(&mut plain, &[]).unwrap();
  assert!(matches!(status, ReceiveStatus::Record { consumed: 0 }));
  assert_eq!(plain.as_slice(), b"early");

  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }
  exchange_ping(&mut client, &mut server);
}

#[test]
fn corrupted_record_fails_with_bad_record_mac() {
  let mut client = Connection::new(Arc::new(client_context()), Side::Client);
  let mut server = Connection::new(Arc::new(server_context()), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  let mut wire = Buffer::new();
  client.send(&mut wire, b"ping").unwrap();
  let mut bytes = wire.as_slice().to_vec();
  let last = bytes.len() - 1;
  bytes[last] ^= 0x01;

  let mut plain = Buffer::new();
  let err = server.receive(&mut plain, &bytes).unwrap_err();
  assert!(matches!(err, Error::Alert(AlertDescription::BadRecordMac)));
  assert_eq!(err.code(), 20);

  // The connection is unusable from here on.
  let mut plain = Buffer::new();
  assert!(server.receive(&mut plain, &[]).is_err());
  let mut out = Buffer::new();
  assert!(server.send(&mut out, b"x").is_err());
}

#[test]
fn key_update_round_trip() {
  let mut client = Connection::new(Arc::new(client_context()), Side::Client);
  let mut server = Connection::new(Arc::new(server_context()), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  // Client rekeys and asks the server to follow suit.
  let mut ku = Buffer::new();
  client.update_key(&mut ku, true).unwrap();
  let mut ku_bytes = ku.as_slice().to_vec();

  // A server message sent before it sees the KeyUpdate still decrypts: only
  // the client's write direction changed.
  let mut wire = Buffer::new();
  server.send(&mut wire, b"before update").unwrap();
  let mut wire = wire.as_slice().to_vec();
  assert_eq!(receive_one(&mut client, &mut wire), b"before update");

  // The server processes the KeyUpdate and honours the update request on its
  // next send: first its own KeyUpdate, then data under the fresh key.
  assert!(receive_one(&mut server, &mut ku_bytes).is_empty());
  let mut wire = Buffer::new();
  server.send(&mut wire, b"after update").unwrap();
  let mut wire = wire.as_slice().to_vec();
  assert!(receive_one(&mut client, &mut wire).is_empty()); // the KeyUpdate
  assert_eq!(receive_one(&mut client, &mut wire), b"after update");

  // And both directions keep working.
  exchange_ping(&mut client, &mut server);
}

#[test]
fn missing_supported_versions_yields_protocol_version_alert() {
  // Hand-rolled ClientHello whose extensions block lacks supported_versions.
  let mut body = Vec::new();
  body.extend_from_slice(&[0x03, 0x03]);
  body.extend_from_slice(&[0xAA; 32]); // random
  body.push(0); // empty legacy_session_id
  body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // cipher_suites
  body.extend_from_slice(&[0x01, 0x00]); // null compression
  body.extend_from_slice(&[0x00, 0x00]); // empty extensions
  let mut message = vec![0x01, 0x00, 0x00, body.len() as u8];
  message.extend_from_slice(&body);
  let mut record = vec![0x16, 0x03, 0x03, 0x00, message.len() as u8];
  record.extend_from_slice(&message);

  let mut server = Connection::new(Arc::new(server_context()), Side::Server);
  let mut sprops = HandshakeProperties::default();
  let mut out = Buffer::new();
  let err = server.handshake(&mut out, &record, &mut sprops).unwrap_err();
  assert!(matches!(err, Error::Alert(AlertDescription::ProtocolVersion)));
  assert_eq!(err.code(), 70);
  // The send buffer carries the fatal alert record for the peer.
  assert_eq!(out.as_slice(), &[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 70]);
}

#[test]
fn exporter_secrets_agree() {
  let mut client_ctx = client_context();
  client_ctx.use_exporter = true;
  let mut server_ctx = server_context();
  server_ctx.use_exporter = true;

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  let from_client = client.export_secret("EXPORTER-test", b"context", false, 32).unwrap();
  let from_server = server.export_secret("EXPORTER-test", b"context", false, 32).unwrap();
  assert_eq!(*from_client, *from_server);

  let different_label = client.export_secret("EXPORTER-other", b"context", false, 32).unwrap();
  assert_ne!(*from_client, *different_label);
}

#[test]
fn stateless_retry_resumes_on_a_fresh_connection() {
  let server_ctx = Arc::new(server_context());
  let mut client = Connection::new(Arc::new(client_context()), Side::Client);
  client.set_server_name("example.com");

  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  sprops.server.enforce_retry = true;
  sprops.server.retry_uses_cookie = true;
  sprops.server.cookie_key = Some(vec![0x77; 32]);
  sprops.server.cookie_additional_data = b"192.0.2.1".to_vec();

  // First flight hits a disposable connection that answers statelessly.
  let mut first_flight = Buffer::new();
  client.handshake(&mut first_flight, &[], &mut cprops).unwrap();
  let mut throwaway = Connection::new(server_ctx.clone(), Side::Server);
  let mut retry = Buffer::new();
  let err = throwaway.handshake(&mut retry, first_flight.as_slice(), &mut sprops).unwrap_err();
  assert!(matches!(err, Error::StatelessRetry));
  assert_eq!(err.code(), 0x206);
  assert!(!retry.is_empty());
  drop(throwaway);

  // The client retries with the cookie; a fresh connection picks it up.
  let mut second_flight = Buffer::new();
  let status = client.handshake(&mut second_flight, retry.as_slice(), &mut cprops).unwrap();
  assert_eq!(status, HandshakeStatus::InProgress);
  let mut server = Connection::new(server_ctx, Side::Server);
  drive(
    &mut client,
    &mut server,
    &mut cprops,
    &mut sprops,
    second_flight.as_slice().to_vec(),
    Vec::new(),
  );
  assert!(client.handshake_is_complete());
  assert!(server.handshake_is_complete());
  exchange_ping(&mut client, &mut server);
}

#[test]
fn encrypted_sni_is_decrypted_and_acknowledged() {
  let esni_key = X25519EsniKey::random();
  let esni_public = esni_key.public_key().to_vec();
  let record_digest = vec![0xAB; 32];

  let mut server_ctx = server_context();
  server_ctx.esni = vec![EsniContext {
    key_exchanges: vec![Box::new(esni_key)],
    cipher_suites: vec![EsniCipherSuite {
      suite: &TLS_AES_128_GCM_SHA256,
      record_digest: record_digest.clone(),
    }],
    padded_length: 260,
    not_before: 0,
    not_after: u64::MAX,
  }];

  let mut client = Connection::new(Arc::new(client_context()), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("secret.example");

  let mut cprops = HandshakeProperties::default();
  cprops.client.esni_keys = Some(EsniKeys {
    entries: vec![(group::X25519, esni_public)],
    cipher_suites: vec![EsniCipherSuite {
      suite: &TLS_AES_128_GCM_SHA256,
      record_digest,
    }],
    padded_length: 260,
    not_before: 0,
    not_after: u64::MAX,
  });
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  assert!(client.handshake_is_complete());
  assert_eq!(server.get_server_name(), Some("secret.example"));
  exchange_ping(&mut client, &mut server);
}

/// Captures the traffic secrets the engine would hand to a QUIC stack.
struct CaptureKeys(Arc<Mutex<Vec<(bool, usize, Vec<u8>)>>>);

impl UpdateTrafficKey for CaptureKeys {
  fn update(
    &self,
    is_enc: bool,
    epoch: usize,
    secret: &[u8],
    _suite: &'static CipherSuite,
  ) -> Result<(), Error> {
    self.0.lock().unwrap().push((is_enc, epoch, secret.to_vec()));
    Ok(())
  }
}

fn secret_for(log: &[(bool, usize, Vec<u8>)], is_enc: bool, epoch: usize) -> Vec<u8> {
  log
    .iter()
    .find(|(e, ep, _)| *e == is_enc && *ep == epoch)
    .map(|(_, _, s)| s.clone())
    .expect("secret installed")
}

#[test]
fn message_api_drives_a_quic_style_handshake() {
  let client_keys = Arc::new(Mutex::new(Vec::new()));
  let server_keys = Arc::new(Mutex::new(Vec::new()));

  let mut client_ctx = client_context();
  client_ctx.update_traffic_key = Some(Box::new(CaptureKeys(client_keys.clone())));
  client_ctx.omit_end_of_early_data = true;
  let mut server_ctx = server_context();
  server_ctx.update_traffic_key = Some(Box::new(CaptureKeys(server_keys.clone())));
  server_ctx.omit_end_of_early_data = true;

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();

  // Client start: ClientHello lands in the epoch-0 range.
  let mut buf = Buffer::new();
  let mut offsets = [0usize; 5];
  let status = client.handle_message(&mut buf, &mut offsets, 0, &[], &mut cprops).unwrap();
  assert_eq!(status, HandshakeStatus::InProgress);
  let ch = buf.as_slice()[offsets[0]..offsets[1]].to_vec();
  assert!(!ch.is_empty());

  // Server consumes the ClientHello and emits its flight across epochs 0/2.
  let mut buf = Buffer::new();
  let mut offsets = [0usize; 5];
  let status = server.handle_message(&mut buf, &mut offsets, 0, &ch, &mut sprops).unwrap();
  assert_eq!(status, HandshakeStatus::InProgress);
  let sh = buf.as_slice()[offsets[0]..offsets[1]].to_vec();
  let server_flight = buf.as_slice()[offsets[2]..offsets[3]].to_vec();
  assert!(!sh.is_empty());
  assert!(!server_flight.is_empty());
  assert_eq!(server.get_read_epoch(), 2);

  // Client processes the ServerHello (epoch 0), then the rest (epoch 2).
  let mut buf = Buffer::new();
  let mut offsets = [0usize; 5];
  client.handle_message(&mut buf, &mut offsets, 0, &sh, &mut cprops).unwrap();
  assert_eq!(client.get_read_epoch(), 2);
  let mut buf = Buffer::new();
  let mut offsets = [0usize; 5];
  let status = client.handle_message(&mut buf, &mut offsets, 2, &server_flight, &mut cprops).unwrap();
  assert!(matches!(status, HandshakeStatus::Complete { .. }));
  let client_finished = buf.as_slice()[offsets[2]..offsets[3]].to_vec();
  assert!(!client_finished.is_empty());

  // Server verifies the client Finished and completes.
  let mut buf = Buffer::new();
  let mut offsets = [0usize; 5];
  let status =
    server.handle_message(&mut buf, &mut offsets, 2, &client_finished, &mut sprops).unwrap();
  assert!(matches!(status, HandshakeStatus::Complete { .. }));

  // Each side's write secret is the peer's read secret, per epoch.
  let client_log = client_keys.lock().unwrap();
  let server_log = server_keys.lock().unwrap();
  for epoch in [2usize, 3] {
    assert_eq!(secret_for(&client_log, true, epoch), secret_for(&server_log, false, epoch));
    assert_eq!(secret_for(&server_log, true, epoch), secret_for(&client_log, false, epoch));
  }
}

#[test]
fn resumption_without_early_data_skips_certificates() {
  let saved = Arc::new(Mutex::new(Vec::new()));
  let mut client_ctx = client_context();
  client_ctx.save_ticket = Some(Box::new(SaveToMemory(saved.clone())));
  let client_ctx = Arc::new(client_ctx);
  let server_ctx = Arc::new(resumable_server_context());

  let mut client = Connection::new(client_ctx.clone(), Side::Client);
  let mut server = Connection::new(server_ctx.clone(), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());
  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }
  let session = saved.lock().unwrap().last().cloned().expect("ticket saved");

  let mut client = Connection::new(client_ctx, Side::Client);
  let mut server = Connection::new(server_ctx, Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  cprops.client.session_ticket = Some(session);
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  assert!(client.is_psk_handshake());
  assert!(server.is_psk_handshake());
  // No early data was requested, so none was accepted.
  assert!(!cprops.client.early_data_accepted_by_peer);
  exchange_ping(&mut client, &mut server);
}

/// Obtains a cached session from a full SHA-256 handshake, for the
/// cross-hash resumption tests below.
fn obtain_session(saved: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<u8> {
  let mut client_ctx = client_context();
  client_ctx.save_ticket = Some(Box::new(SaveToMemory(saved.clone())));
  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(resumable_server_context()), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());
  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }
  saved.lock().unwrap().last().cloned().expect("ticket saved")
}

#[test]
fn declined_psk_survives_a_hash_change() {
  // The cached session is bound to AES-128-GCM/SHA-256, but the server now
  // only speaks the SHA-384 suite: the PSK is declined and the handshake
  // must still complete under the negotiated hash.
  let saved = Arc::new(Mutex::new(Vec::new()));
  let session = obtain_session(&saved);

  let mut client_ctx = client_context();
  client_ctx.cipher_suites = vec![&TLS_AES_128_GCM_SHA256, &TLS_AES_256_GCM_SHA384];
  let mut server_ctx = resumable_server_context();
  server_ctx.cipher_suites = vec![&TLS_AES_256_GCM_SHA384];

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  cprops.client.session_ticket = Some(session);
  let mut sprops = HandshakeProperties::default();
  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());
  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }

  assert!(!client.is_psk_handshake());
  assert!(!server.is_psk_handshake());
  assert_eq!(client.get_cipher().unwrap().id, 0x1302);
  exchange_ping(&mut client, &mut server);
}

#[test]
fn retry_that_changes_the_hash_drops_the_psk() {
  // The HelloRetryRequest both asks for a new group and pins the SHA-384
  // suite, so the offered SHA-256 PSK dies with the retry and the replayed
  // transcript must carry the first ClientHello under the new hash.
  let saved = Arc::new(Mutex::new(Vec::new()));
  let session = obtain_session(&saved);

  let mut client_ctx = client_context();
  client_ctx.cipher_suites = vec![&TLS_AES_128_GCM_SHA256, &TLS_AES_256_GCM_SHA384];
  client_ctx.key_exchanges = vec![&X25519, &Secp256r1];
  let mut server_ctx = resumable_server_context();
  server_ctx.cipher_suites = vec![&TLS_AES_256_GCM_SHA384];
  server_ctx.key_exchanges = vec![&Secp256r1, &X25519];

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  cprops.client.session_ticket = Some(session);
  let mut sprops = HandshakeProperties::default();
  let (_, mut leftovers) =
    drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());
  while !leftovers.is_empty() {
    receive_one(&mut client, &mut leftovers);
  }

  assert!(!client.is_psk_handshake());
  assert!(!server.is_psk_handshake());
  assert_eq!(client.get_cipher().unwrap().id, 0x1302);
  assert_eq!(client.get_negotiated_group(), Some(group::SECP256R1));
  exchange_ping(&mut client, &mut server);
}

#[test]
fn suite_negotiation_follows_server_preference() {
  let mut client_ctx = client_context();
  client_ctx.cipher_suites = vec![&TLS_AES_128_GCM_SHA256, &TLS_AES_256_GCM_SHA384];
  let mut server_ctx = server_context();
  server_ctx.cipher_suites = vec![&TLS_AES_256_GCM_SHA384, &TLS_AES_128_GCM_SHA256];

  let mut client = Connection::new(Arc::new(client_ctx), Side::Client);
  let mut server = Connection::new(Arc::new(server_ctx), Side::Server);
  client.set_server_name("example.com");
  let mut cprops = HandshakeProperties::default();
  let mut sprops = HandshakeProperties::default();
  drive(&mut client, &mut server, &mut cprops, &mut sprops, Vec::new(), Vec::new());

  assert_eq!(client.get_cipher().unwrap().id, 0x1302);
  assert_eq!(server.get_cipher().unwrap().id, 0x1302);
  assert_eq!(client.get_record_overhead(), 5 + 1 + 16);
  exchange_ping(&mut client, &mut server);
}
