//! Error type for the `tls-engine` crate.
//!
//! Failures fall into three wire-visible classes, mirrored by [`Error::code`]:
//! alerts this side generates (0x000..=0x0FF), alerts received from the peer
//! (0x100..=0x1FF) and internal conditions (0x200..).

use thiserror::Error;

/// TLS alert descriptions emitted or understood by the engine (RFC 8446 §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
  CloseNotify = 0,
  UnexpectedMessage = 10,
  BadRecordMac = 20,
  HandshakeFailure = 40,
  BadCertificate = 42,
  CertificateRevoked = 44,
  CertificateExpired = 45,
  CertificateUnknown = 46,
  IllegalParameter = 47,
  UnknownCa = 48,
  DecodeError = 50,
  DecryptError = 51,
  ProtocolVersion = 70,
  InternalError = 80,
  UserCanceled = 90,
  MissingExtension = 109,
  UnrecognizedName = 112,
  CertificateRequired = 116,
  NoApplicationProtocol = 120,
  Unknown(u8),
}

impl AlertDescription {
  pub fn from_u8(v: u8) -> Self {
    match v {
      0 => Self::CloseNotify,
      10 => Self::UnexpectedMessage,
      20 => Self::BadRecordMac,
      40 => Self::HandshakeFailure,
      42 => Self::BadCertificate,
      44 => Self::CertificateRevoked,
      45 => Self::CertificateExpired,
      46 => Self::CertificateUnknown,
      47 => Self::IllegalParameter,
      48 => Self::UnknownCa,
      50 => Self::DecodeError,
      51 => Self::DecryptError,
      70 => Self::ProtocolVersion,
      80 => Self::InternalError,
      90 => Self::UserCanceled,
      109 => Self::MissingExtension,
      112 => Self::UnrecognizedName,
      116 => Self::CertificateRequired,
      120 => Self::NoApplicationProtocol,
      other => Self::Unknown(other),
    }
  }

  pub fn as_u8(self) -> u8 {
    match self {
      Self::CloseNotify => 0,
      Self::UnexpectedMessage => 10,
      Self::BadRecordMac => 20,
      Self::HandshakeFailure => 40,
      Self::BadCertificate => 42,
      Self::CertificateRevoked => 44,
      Self::CertificateExpired => 45,
      Self::CertificateUnknown => 46,
      Self::IllegalParameter => 47,
      Self::UnknownCa => 48,
      Self::DecodeError => 50,
      Self::DecryptError => 51,
      Self::ProtocolVersion => 70,
      Self::InternalError => 80,
      Self::UserCanceled => 90,
      Self::MissingExtension => 109,
      Self::UnrecognizedName => 112,
      Self::CertificateRequired => 116,
      Self::NoApplicationProtocol => 120,
      Self::Unknown(v) => v,
    }
  }
}

impl std::fmt::Display for AlertDescription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Unknown(v) => write!(f, "unknown({v})"),
      other => write!(f, "{:?}({})", other, other.as_u8()),
    }
  }
}

/// Alert level octet (RFC 8446 §6).
pub const ALERT_LEVEL_WARNING: u8 = 1;
pub const ALERT_LEVEL_FATAL: u8 = 2;

const ERROR_CLASS_PEER_ALERT: u16 = 0x100;
const ERROR_CLASS_INTERNAL: u16 = 0x200;

/// The error type returned by every fallible operation of the engine.
///
/// An `Alert` value means the engine has produced (or is about to produce) a
/// fatal alert record for the peer; the caller should flush the send buffer
/// before discarding the connection. `PeerAlert` reports a fatal alert sent by
/// the peer. The remaining variants are local conditions that never reach the
/// wire.
#[derive(Debug, Error)]
pub enum Error {
  #[error("fatal alert generated: {0}")]
  Alert(AlertDescription),

  #[error("fatal alert received: {0}")]
  PeerAlert(AlertDescription),

  #[error("allocation failed")]
  NoMemory,

  #[error("library usage error: {0}")]
  Library(&'static str),

  #[error("incompatible key-exchange key")]
  IncompatibleKey,

  #[error("session not found")]
  SessionNotFound,

  #[error("stateless retry emitted; the connection can be discarded")]
  StatelessRetry,

  #[error("requested feature is not available")]
  NotAvailable,

  #[error("certificate decompression failed")]
  CompressionFailure,

  #[error("malformed ASN.1 input")]
  Asn1,
}

impl Error {
  /// Shorthand for the common "generate a fatal alert" case.
  pub fn alert(desc: AlertDescription) -> Self {
    Error::Alert(desc)
  }

  /// Numeric error code, bucketed by class: self-alerts occupy 0x000..=0x0FF,
  /// peer alerts 0x100..=0x1FF, and internal conditions 0x200 and above.
  pub fn code(&self) -> u16 {
    match self {
      Error::Alert(desc) => desc.as_u8() as u16,
      Error::PeerAlert(desc) => ERROR_CLASS_PEER_ALERT + desc.as_u8() as u16,
      Error::NoMemory => ERROR_CLASS_INTERNAL + 1,
      Error::Library(_) => ERROR_CLASS_INTERNAL + 3,
      Error::IncompatibleKey => ERROR_CLASS_INTERNAL + 4,
      Error::SessionNotFound => ERROR_CLASS_INTERNAL + 5,
      Error::StatelessRetry => ERROR_CLASS_INTERNAL + 6,
      Error::NotAvailable => ERROR_CLASS_INTERNAL + 7,
      Error::CompressionFailure => ERROR_CLASS_INTERNAL + 8,
      Error::Asn1 => ERROR_CLASS_INTERNAL + 0x32,
    }
  }

  /// The alert description to place on the wire for this error, if any.
  pub(crate) fn alert_to_send(&self) -> Option<AlertDescription> {
    match self {
      Error::Alert(desc) => Some(*desc),
      Error::PeerAlert(_) => None,
      Error::StatelessRetry => None,
      _ => Some(AlertDescription::InternalError),
    }
  }
}
