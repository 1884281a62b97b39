//! Signature-scheme registry constants plus a P-256 ECDSA signer/verifier
//! pair.
//!
//! Chain validation proper (X.509 parsing, path building, trust anchors) is an
//! external collaborator; the verifier here treats certificates as opaque
//! bytes and checks only the CertificateVerify signature against a known
//! public key, which is what the engine's own test suite needs.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};

use super::{SignCertificate, VerifyCertificate, VerifySignature};
use crate::errors::{AlertDescription, Error};

pub const RSA_PKCS1_SHA256: u16 = 0x0401;
pub const ECDSA_SECP256R1_SHA256: u16 = 0x0403;
pub const ECDSA_SECP384R1_SHA384: u16 = 0x0503;
pub const ECDSA_SECP521R1_SHA512: u16 = 0x0603;
pub const RSA_PSS_RSAE_SHA256: u16 = 0x0804;
pub const RSA_PSS_RSAE_SHA384: u16 = 0x0805;
pub const RSA_PSS_RSAE_SHA512: u16 = 0x0806;

/// The schemes the engine offers in signature_algorithms by default.
pub fn default_signature_schemes() -> Vec<u16> {
  vec![ECDSA_SECP256R1_SHA256, RSA_PSS_RSAE_SHA256, RSA_PKCS1_SHA256]
}

/// ECDSA P-256/SHA-256 certificate signer.
pub struct EcdsaP256Signer {
  key: SigningKey,
}

impl EcdsaP256Signer {
  /// Builds a signer from a raw 32-byte scalar.
  pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, Error> {
    let key = SigningKey::from_slice(secret).map_err(|_| Error::IncompatibleKey)?;
    Ok(EcdsaP256Signer { key })
  }

  /// The SEC1 uncompressed public key matching this signer.
  pub fn public_key_bytes(&self) -> Vec<u8> {
    self.key.verifying_key().to_encoded_point(false).as_bytes().to_vec()
  }
}

impl SignCertificate for EcdsaP256Signer {
  fn select_scheme(&self, offered: &[u16]) -> Option<u16> {
    offered.iter().copied().find(|&s| s == ECDSA_SECP256R1_SHA256)
  }

  fn sign(&self, scheme: u16, message: &[u8]) -> Result<Vec<u8>, Error> {
    if scheme != ECDSA_SECP256R1_SHA256 {
      return Err(Error::IncompatibleKey);
    }
    let signature: Signature = self.key.sign(message);
    Ok(signature.to_der().as_bytes().to_vec())
  }
}

/// Verifier pinned to a known ECDSA P-256 public key.
pub struct EcdsaP256Verifier {
  key: VerifyingKey,
}

impl EcdsaP256Verifier {
  /// Builds a verifier from a SEC1-encoded public key.
  pub fn from_public_key_bytes(public: &[u8]) -> Result<Self, Error> {
    let key = VerifyingKey::from_sec1_bytes(public).map_err(|_| Error::IncompatibleKey)?;
    Ok(EcdsaP256Verifier { key })
  }
}

struct EcdsaP256Verify {
  key: VerifyingKey,
}

impl VerifySignature for EcdsaP256Verify {
  fn verify(self: Box<Self>, scheme: u16, message: &[u8], signature: &[u8]) -> Result<(), Error> {
    if scheme != ECDSA_SECP256R1_SHA256 {
      return Err(Error::alert(AlertDescription::HandshakeFailure));
    }
    let signature =
      Signature::from_der(signature).map_err(|_| Error::alert(AlertDescription::DecryptError))?;
    self
      .key
      .verify(message, &signature)
      .map_err(|_| Error::alert(AlertDescription::DecryptError))
  }
}

impl VerifyCertificate for EcdsaP256Verifier {
  fn verify_chain(
    &self,
    certificates: &[&[u8]],
    _server_name: Option<&str>,
  ) -> Result<Box<dyn VerifySignature>, Error> {
    if certificates.is_empty() {
      return Err(Error::alert(AlertDescription::CertificateRequired));
    }
    Ok(Box::new(EcdsaP256Verify { key: self.key.clone() }))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sign_and_verify_round_trip() {
    let signer = EcdsaP256Signer::from_secret_bytes(&[7u8; 32]).unwrap();
    let scheme = signer.select_scheme(&default_signature_schemes()).unwrap();
    let signature = signer.sign(scheme, b"handshake transcript").unwrap();

    let verifier = EcdsaP256Verifier::from_public_key_bytes(&signer.public_key_bytes()).unwrap();
    let verify = verifier.verify_chain(&[b"opaque cert"], None).unwrap();
    verify.verify(scheme, b"handshake transcript", &signature).unwrap();

    let verify = verifier.verify_chain(&[b"opaque cert"], None).unwrap();
    assert!(verify.verify(scheme, b"different transcript", &signature).is_err());
  }
}
