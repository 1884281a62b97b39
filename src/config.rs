//! Connection configuration: the shared [`Context`] capability bundle and the
//! per-handshake [`HandshakeProperties`].
//!
//! A `Context` is immutable once connections are created against it and is
//! shared via `Arc`; its callbacks must be thread-safe if connections run on
//! multiple threads. Everything optional defaults to off.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::connection::Connection;
use crate::crypto::{
  default_cipher_suites, default_key_exchanges, CipherSuite, Hash, KeyExchange, SignCertificate,
  VerifyCertificate,
};
use crate::errors::Error;
use crate::esni::{EsniContext, EsniKeys};
use crate::utils::{SystemTimeSource, TimeSource};

/// Source of cryptographically secure random bytes.
pub trait FillRandom: Send + Sync {
  fn fill(&self, buf: &mut [u8]);
}

/// Default RNG backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl FillRandom for OsRandom {
  fn fill(&self, buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
  }
}

/// Arguments passed to [`OnClientHello`].
pub struct ClientHelloParams<'a> {
  /// SNI value, after ESNI decryption when that applied.
  pub server_name: Option<&'a str>,
  /// ALPN protocols offered by the client.
  pub negotiated_protocols: &'a [&'a [u8]],
  pub signature_algorithms: &'a [u16],
  pub certificate_compression_algorithms: &'a [u16],
  /// Whether the SNI arrived encrypted.
  pub esni: bool,
}

/// Server-side hook invoked once the ClientHello has been parsed. The
/// implementation performs ALPN selection by calling
/// [`Connection::set_negotiated_protocol`], and may acknowledge the SNI via
/// [`Connection::set_server_name`] or swap the connection's context entirely.
pub trait OnClientHello: Send + Sync {
  fn on_client_hello(&self, conn: &mut Connection, params: &ClientHelloParams<'_>)
    -> Result<(), Error>;
}

/// Replaces the built-in Certificate message body (which serialises
/// `Context::certificates`) when the chain must be produced dynamically.
pub trait EmitCertificate: Send + Sync {
  fn certificate_body(&self, conn: &Connection, request_context: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Seals and opens session tickets (server only). `is_encrypt` selects the
/// direction; the plaintext is an opaque engine-internal blob.
pub trait EncryptTicket: Send + Sync {
  fn process(&self, is_encrypt: bool, src: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Receives the serialised session to cache for resumption (client only).
pub trait SaveTicket: Send + Sync {
  fn save(&self, conn: &Connection, session: &[u8]) -> Result<(), Error>;
}

/// NSS-keylog-style secret logging hook.
pub trait LogEvent: Send + Sync {
  fn log(&self, client_random: &[u8; 32], label: &str, secret: &[u8]);
}

/// Connection accounting: called with +1 from `Connection::new` and −1 from
/// its `Drop` impl, exactly once each.
pub trait UpdateOpenCount: Send + Sync {
  fn update(&self, delta: i64);
}

/// Externalises the record layer: when set, the engine never seals records
/// itself but hands each traffic secret to the embedder (QUIC stacks).
pub trait UpdateTrafficKey: Send + Sync {
  fn update(
    &self,
    is_enc: bool,
    epoch: usize,
    secret: &[u8],
    suite: &'static CipherSuite,
  ) -> Result<(), Error>;
}

/// Decompresses CompressedCertificate messages.
pub trait DecompressCertificate: Send + Sync {
  /// Algorithms to advertise in the compress_certificate extension.
  fn supported_algorithms(&self) -> &[u16];
  fn decompress(
    &self,
    algorithm: u16,
    uncompressed_length: usize,
    input: &[u8],
  ) -> Result<Vec<u8>, Error>;
}

/// Observes the ESNI shared secret Zx together with the hashed ESNIContents.
pub trait UpdateEsniKey: Send + Sync {
  fn update(&self, zx: &[u8], hash: &'static dyn Hash, contents_hash: &[u8]) -> Result<(), Error>;
}

/// The configuration bundle shared by connections.
pub struct Context {
  pub random: Box<dyn FillRandom>,
  pub time: Box<dyn TimeSource>,
  /// Supported key exchanges, in preference order.
  pub key_exchanges: Vec<&'static dyn KeyExchange>,
  /// Supported cipher suites, in preference order.
  pub cipher_suites: Vec<&'static CipherSuite>,
  /// DER certificate chain presented by this side, end-entity first. The
  /// engine treats each element as opaque bytes.
  pub certificates: Vec<Vec<u8>>,
  /// Server-side ESNI material.
  pub esni: Vec<EsniContext>,
  pub on_client_hello: Option<Box<dyn OnClientHello>>,
  pub emit_certificate: Option<Box<dyn EmitCertificate>>,
  pub sign_certificate: Option<Box<dyn SignCertificate>>,
  pub verify_certificate: Option<Box<dyn VerifyCertificate>>,
  pub encrypt_ticket: Option<Box<dyn EncryptTicket>>,
  pub save_ticket: Option<Box<dyn SaveTicket>>,
  pub log_event: Option<Box<dyn LogEvent>>,
  pub update_open_count: Option<Box<dyn UpdateOpenCount>>,
  pub update_traffic_key: Option<Box<dyn UpdateTrafficKey>>,
  pub decompress_certificate: Option<Box<dyn DecompressCertificate>>,
  pub update_esni_key: Option<Box<dyn UpdateEsniKey>>,
  /// Session ticket lifetime in seconds (server; 0 disables tickets).
  pub ticket_lifetime: u32,
  /// Maximum early-data size granted in issued tickets (server).
  pub max_early_data_size: u32,
  /// Obsolete HkdfLabel prefix override. Leave `None` ("tls13 ") unless a
  /// legacy QUIC draft peer requires otherwise; any value set here is honoured
  /// verbatim.
  pub hkdf_label_prefix: Option<String>,
  /// Require (EC)DHE on PSK resumptions. The engine only ever offers and
  /// accepts the psk_dhe_ke mode, so this holds regardless; the flag is kept
  /// for configurations that want to assert it explicitly.
  pub require_dhe_on_psk: bool,
  /// Record exporter master secrets so `export_secret` works.
  pub use_exporter: bool,
  /// Emit the middlebox-compatibility ChangeCipherSpec.
  pub send_change_cipher_spec: bool,
  /// Request a client certificate.
  pub require_client_authentication: bool,
  /// Neither send nor expect EndOfEarlyData.
  pub omit_end_of_early_data: bool,
}

impl Default for Context {
  fn default() -> Self {
    Context {
      random: Box::new(OsRandom),
      time: Box::new(SystemTimeSource),
      key_exchanges: default_key_exchanges(),
      cipher_suites: default_cipher_suites(),
      certificates: Vec::new(),
      esni: Vec::new(),
      on_client_hello: None,
      emit_certificate: None,
      sign_certificate: None,
      verify_certificate: None,
      encrypt_ticket: None,
      save_ticket: None,
      log_event: None,
      update_open_count: None,
      update_traffic_key: None,
      decompress_certificate: None,
      update_esni_key: None,
      ticket_lifetime: 0,
      max_early_data_size: 0,
      hkdf_label_prefix: None,
      require_dhe_on_psk: false,
      use_exporter: false,
      send_change_cipher_spec: false,
      require_client_authentication: false,
      omit_end_of_early_data: false,
    }
  }
}

impl Context {
  pub(crate) fn label_prefix(&self) -> &str {
    self.hkdf_label_prefix.as_deref().unwrap_or(crate::key_schedule::DEFAULT_LABEL_PREFIX)
  }

  pub(crate) fn now_millis(&self) -> u64 {
    self.time.now_millis()
  }
}

/// Client-side handshake options.
#[derive(Default)]
pub struct ClientProperties {
  /// ALPN protocols to offer, most preferred first.
  pub negotiated_protocols: Vec<Vec<u8>>,
  /// A session previously handed to `save_ticket`, to resume from.
  pub session_ticket: Option<Vec<u8>>,
  /// Set to `Some(0)` to request early data; the engine overwrites the value
  /// with the ticket's early-data allowance (zero when early data cannot be
  /// sent). `None` disables early data.
  pub max_early_data_size: Option<u32>,
  /// Set by the engine once the peer confirms it accepted early data.
  pub early_data_accepted_by_peer: bool,
  /// Send the first ClientHello without a key_share and let the server pick
  /// the group via HelloRetryRequest.
  pub negotiate_before_key_exchange: bool,
  /// Pre-parsed ESNIKeys for encrypting the SNI.
  pub esni_keys: Option<EsniKeys>,
}

/// Server-side handshake options.
#[derive(Default)]
pub struct ServerProperties {
  /// Set by the engine to the PSK binder it selected (empty when none).
  pub selected_psk_binder: Vec<u8>,
  /// HMAC key protecting HelloRetryRequest cookies. Should be as long as the
  /// digest of the first configured cipher suite.
  pub cookie_key: Option<Vec<u8>>,
  /// Additional data bound into the cookie HMAC.
  pub cookie_additional_data: Vec<u8>,
  /// Always send a HelloRetryRequest on the first ClientHello.
  pub enforce_retry: bool,
  /// Make the retry stateless through the cookie extension; requires
  /// `cookie_key`.
  pub retry_uses_cookie: bool,
}

/// Per-call options for `handshake` / `handle_message`.
#[derive(Default)]
pub struct HandshakeProperties {
  pub client: ClientProperties,
  pub server: ServerProperties,
  /// Extra raw extensions to emit (client: ClientHello, server:
  /// EncryptedExtensions).
  pub additional_extensions: Vec<(u16, Vec<u8>)>,
  /// Predicate deciding which unknown peer extensions to collect.
  pub collect_extension: Option<Box<dyn Fn(u16) -> bool + Send + Sync>>,
  /// Extensions collected by the predicate, filled in by the engine.
  pub collected_extensions: Vec<(u16, Vec<u8>)>,
}

/// Convenience alias used by the public constructors.
pub type SharedContext = Arc<Context>;
