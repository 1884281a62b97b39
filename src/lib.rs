//! # tls-engine
//!
//! A sans-I/O TLS 1.3 protocol engine. The engine never touches a socket:
//! callers feed it bytes received from the peer and transmit whatever bytes
//! it places in their send buffer, which makes it equally at home in an
//! event-loop server, a QUIC stack (via [`Connection::handle_message`]) or a
//! blocking client.
//!
//! The crate covers the full handshake state machine for both roles
//! (HelloRetryRequest, PSK and PSK-DHE resumption, 0-RTT early data,
//! client authentication, post-handshake KeyUpdate and NewSessionTicket),
//! the HKDF key schedule with its rolling transcript hash, AEAD record
//! protection, and the wire codec underneath it all. Cryptographic
//! primitives are pluggable through the [`crypto`] capability traits, with
//! RustCrypto-backed defaults for the three RFC 8446 cipher suites, X25519
//! and secp256r1.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tls_engine::{Buffer, Connection, Context, HandshakeProperties, Side};
//!
//! let ctx = Arc::new(Context::default());
//! let mut conn = Connection::new(ctx, Side::Client);
//! conn.set_server_name("example.com");
//!
//! let mut sendbuf = Buffer::new();
//! let mut props = HandshakeProperties::default();
//! // Drive the handshake: transmit `sendbuf`, feed peer bytes back in.
//! let _status = conn.handshake(&mut sendbuf, &[], &mut props)?;
//! # Ok::<(), tls_engine::Error>(())
//! ```
//!
//! X.509 parsing and chain validation, PEM loading and ticket-encryption
//! policy are deliberately external: the engine consumes them through the
//! narrow capability traits in [`config`] and [`crypto`].

pub mod buffer;
mod client;
pub mod codec;
pub mod config;
mod connection;
pub mod crypto;
pub mod errors;
pub mod esni;
pub mod key_schedule;
pub mod msgs;
pub mod record;
mod server;
mod ticket;
pub mod utils;

pub use buffer::Buffer;
pub use config::{Context, HandshakeProperties};
pub use connection::{
  Connection, HandshakeStatus, ReceiveStatus, Side, EPOCH_APPLICATION, EPOCH_EARLY,
  EPOCH_HANDSHAKE, EPOCH_INITIAL,
};
pub use errors::{AlertDescription, Error, ALERT_LEVEL_FATAL, ALERT_LEVEL_WARNING};
