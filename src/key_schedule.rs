//! HKDF-driven key schedule with the rolling handshake transcript.
//!
//! The schedule advances through the RFC 8446 §7.1 chain: an extract of the
//! PSK (or zeros) yields the early secrets, an extract of the (EC)DHE shared
//! secret yields the handshake secrets, and a final extract of zeros yields
//! the application, exporter and resumption secrets. Each extract is preceded
//! by a "derived" expansion of the previous secret.

use zeroize::Zeroizing;

use crate::crypto::{Hash, HashContext};
use crate::errors::Error;
use crate::utils::hexdump;

/// The standard HkdfLabel prefix.
pub const DEFAULT_LABEL_PREFIX: &str = "tls13 ";

const MESSAGE_HASH: u8 = 254;

/// HKDF-Extract. An empty salt stands for a string of zeros of digest length.
pub fn hkdf_extract(hash: &dyn Hash, salt: &[u8], ikm: &[u8]) -> Zeroizing<Vec<u8>> {
  let zeros;
  let salt = if salt.is_empty() {
    zeros = vec![0u8; hash.digest_size()];
    &zeros
  } else {
    salt
  };
  Zeroizing::new(hash.hmac(salt, &[ikm]))
}

/// HKDF-Expand (RFC 5869 §2.3).
pub fn hkdf_expand(
  hash: &dyn Hash,
  prk: &[u8],
  info: &[u8],
  outlen: usize,
) -> Result<Zeroizing<Vec<u8>>, Error> {
  let digest_size = hash.digest_size();
  if outlen > 255 * digest_size {
    return Err(Error::Library("hkdf output length out of range"));
  }
  let mut okm = Zeroizing::new(Vec::with_capacity(outlen));
  let mut block: Vec<u8> = Vec::new();
  let mut counter = 1u8;
  while okm.len() < outlen {
    block = hash.hmac(prk, &[&block, info, &[counter]]);
    let take = (outlen - okm.len()).min(digest_size);
    okm.extend_from_slice(&block[..take]);
    counter += 1;
  }
  Ok(okm)
}

/// HKDF-Expand-Label (RFC 8446 §7.1). The Info field is the 2-byte output
/// length, the 1-byte-prefixed label (with `label_prefix` prepended) and the
/// 1-byte-prefixed context hash value.
pub fn hkdf_expand_label(
  hash: &dyn Hash,
  secret: &[u8],
  label: &str,
  hash_value: &[u8],
  outlen: usize,
  label_prefix: &str,
) -> Result<Zeroizing<Vec<u8>>, Error> {
  let mut info = Vec::with_capacity(4 + label_prefix.len() + label.len() + hash_value.len());
  info.extend_from_slice(&(outlen as u16).to_be_bytes());
  info.push((label_prefix.len() + label.len()) as u8);
  info.extend_from_slice(label_prefix.as_bytes());
  info.extend_from_slice(label.as_bytes());
  info.push(hash_value.len() as u8);
  info.extend_from_slice(hash_value);
  hkdf_expand(hash, secret, &info, outlen)
}

enum Transcript {
  /// Messages seen before the cipher suite (and therefore the hash) is known.
  Pending(Vec<u8>),
  /// Hashing under a provisional choice (an offered PSK's hash). The raw
  /// bytes are retained so a different negotiated hash can replay them.
  Provisional { ctx: Box<dyn HashContext>, raw: Vec<u8> },
  /// Hashing under the negotiated suite's hash.
  Live(Box<dyn HashContext>),
}

/// The key schedule: rolling transcript hash plus the current extracted
/// secret.
pub struct KeySchedule {
  hash: Option<&'static dyn Hash>,
  transcript: Transcript,
  secret: Zeroizing<Vec<u8>>,
  generation: u32,
  label_prefix: String,
}

impl KeySchedule {
  /// Creates a schedule in the unselected state. `label_prefix` overrides the
  /// "tls13 " HkdfLabel prefix; pass `None` unless talking to a legacy QUIC
  /// draft peer.
  pub fn new(label_prefix: Option<&str>) -> Self {
    KeySchedule {
      hash: None,
      transcript: Transcript::Pending(Vec::new()),
      secret: Zeroizing::new(Vec::new()),
      generation: 0,
      label_prefix: label_prefix.unwrap_or(DEFAULT_LABEL_PREFIX).to_string(),
    }
  }

  pub fn is_selected(&self) -> bool {
    self.hash.is_some()
  }

  pub fn hash(&self) -> Result<&'static dyn Hash, Error> {
    self.hash.ok_or(Error::Library("key schedule hash not selected yet"))
  }

  /// Commits a hash provisionally, before any suite has been negotiated
  /// (the hash of an offered PSK's suite). The raw transcript bytes are
  /// retained so a later [`KeySchedule::select_hash`] with a different hash
  /// can replay them. Ignored once any hash is committed.
  pub fn select_hash_provisional(&mut self, hash: &'static dyn Hash) {
    if self.hash.is_some() {
      return;
    }
    if let Transcript::Pending(buffered) = &mut self.transcript {
      let raw = std::mem::take(buffered);
      let mut ctx = hash.start();
      ctx.update(&raw);
      self.transcript = Transcript::Provisional { ctx, raw };
      self.hash = Some(hash);
      self.secret = Zeroizing::new(vec![0u8; hash.digest_size()]);
    }
  }

  /// Finalises the hash choice on cipher-suite selection, replaying any
  /// transcript bytes gathered so far. A provisional selection with a
  /// different hash is replaced: the retained bytes are re-hashed and the
  /// secret chain, keyed under the old hash, restarts from its pristine
  /// state. A definitive selection is never replaced.
  pub fn select_hash(&mut self, hash: &'static dyn Hash) {
    let same = self.hash.map(|h| h.id() == hash.id()).unwrap_or(false);
    let transcript = std::mem::replace(&mut self.transcript, Transcript::Pending(Vec::new()));
    self.transcript = match transcript {
      Transcript::Pending(buffered) => {
        let mut ctx = hash.start();
        ctx.update(&buffered);
        self.hash = Some(hash);
        self.secret = Zeroizing::new(vec![0u8; hash.digest_size()]);
        Transcript::Live(ctx)
      },
      Transcript::Provisional { ctx, raw } => {
        if same {
          Transcript::Live(ctx)
        } else {
          let mut replayed = hash.start();
          replayed.update(&raw);
          self.hash = Some(hash);
          self.secret = Zeroizing::new(vec![0u8; hash.digest_size()]);
          self.generation = 0;
          Transcript::Live(replayed)
        }
      },
      Transcript::Live(ctx) => {
        debug_assert!(same, "hash changed after definitive selection");
        Transcript::Live(ctx)
      },
    };
  }

  /// Feeds handshake bytes (4-byte message header included) into the
  /// transcript.
  pub fn update_hash(&mut self, data: &[u8]) {
    match &mut self.transcript {
      Transcript::Pending(buffered) => buffered.extend_from_slice(data),
      Transcript::Provisional { ctx, raw } => {
        ctx.update(data);
        raw.extend_from_slice(data);
      },
      Transcript::Live(ctx) => ctx.update(data),
    }
  }

  /// Snapshot of the running transcript hash.
  pub fn transcript_hash(&self) -> Result<Vec<u8>, Error> {
    match &self.transcript {
      Transcript::Pending(_) => Err(Error::Library("transcript hash requested before selection")),
      Transcript::Provisional { ctx, .. } | Transcript::Live(ctx) => Ok(ctx.snapshot()),
    }
  }

  /// Transcript hash as it would be after also feeding `extra` (used for PSK
  /// binders, whose MAC covers the ClientHello truncated before the binders).
  pub fn transcript_hash_with_partial(&self, extra: &[u8]) -> Result<Vec<u8>, Error> {
    match &self.transcript {
      Transcript::Pending(_) => Err(Error::Library("transcript hash requested before selection")),
      Transcript::Provisional { ctx, .. } | Transcript::Live(ctx) => {
        let mut forked = ctx.fork();
        forked.update(extra);
        Ok(forked.snapshot())
      },
    }
  }

  /// Rewinds the secret chain to its pristine state, leaving the transcript
  /// untouched. Used when an offered PSK (whose extract already ran) is
  /// declined by the server.
  pub fn reset_chain(&mut self) {
    if let Some(hash) = self.hash {
      self.secret = Zeroizing::new(vec![0u8; hash.digest_size()]);
    }
    self.generation = 0;
  }

  /// The HelloRetryRequest transcript rewrite: the ClientHello seen so far is
  /// replaced by a synthetic message_hash(254) message carrying its digest.
  /// The synthetic message embeds a digest of the final hash, so the rewrite
  /// requires a definitive selection.
  pub fn rewrite_with_message_hash(&mut self) -> Result<(), Error> {
    let hash = self.hash()?;
    let digest = match &mut self.transcript {
      Transcript::Live(ctx) => ctx.finish_reset(),
      _ => return Err(Error::Library("transcript rewrite requires a definitive hash")),
    };
    let mut synthetic = vec![MESSAGE_HASH, 0, 0, hash.digest_size() as u8];
    synthetic.extend_from_slice(&digest);
    self.update_hash(&synthetic);
    Ok(())
  }

  /// HKDF-Extract step of the chain. `ikm` of `None` stands for a string of
  /// zeros of digest length. Every extract after the first is preceded by a
  /// "derived" expansion of the previous secret.
  pub fn extract(&mut self, ikm: Option<&[u8]>) -> Result<(), Error> {
    let hash = self.hash()?;
    if self.generation > 0 {
      self.secret = hkdf_expand_label(
        hash,
        &self.secret,
        "derived",
        hash.empty_digest(),
        hash.digest_size(),
        &self.label_prefix,
      )?;
    }
    self.generation += 1;
    let zeros;
    let ikm = match ikm {
      Some(ikm) => ikm,
      None => {
        zeros = vec![0u8; hash.digest_size()];
        &zeros
      },
    };
    self.secret = Zeroizing::new(hash.hmac(&self.secret, &[ikm]));
    tracing::trace!(generation = self.generation, "key schedule extract");
    Ok(())
  }

  /// Derive-Secret over the running transcript.
  pub fn derive_secret(&self, label: &str) -> Result<Zeroizing<Vec<u8>>, Error> {
    let digest = self.transcript_hash()?;
    self.derive_secret_with_hash(label, &digest)
  }

  /// Derive-Secret over an explicit transcript digest.
  pub fn derive_secret_with_hash(
    &self,
    label: &str,
    hash_value: &[u8],
  ) -> Result<Zeroizing<Vec<u8>>, Error> {
    let hash = self.hash()?;
    hkdf_expand_label(hash, &self.secret, label, hash_value, hash.digest_size(), &self.label_prefix)
  }

  /// HKDF-Expand-Label under this schedule's label prefix.
  pub fn expand_label(
    &self,
    secret: &[u8],
    label: &str,
    hash_value: &[u8],
    outlen: usize,
  ) -> Result<Zeroizing<Vec<u8>>, Error> {
    hkdf_expand_label(self.hash()?, secret, label, hash_value, outlen, &self.label_prefix)
  }

  /// finished_key = HKDF-Expand-Label(base_key, "finished", "", Hash.length).
  pub fn finished_key(&self, base_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
    let hash = self.hash()?;
    self.expand_label(base_key, "finished", &[], hash.digest_size())
  }

  /// Finished MAC: HMAC(finished_key, transcript-hash).
  pub fn finished_mac(&self, base_key: &[u8]) -> Result<Vec<u8>, Error> {
    let digest = self.transcript_hash()?;
    self.finished_mac_with_hash(base_key, &digest)
  }

  /// Finished-style MAC over an explicit digest (PSK binders use the
  /// transcript truncated before the binders list).
  pub fn finished_mac_with_hash(&self, base_key: &[u8], digest: &[u8]) -> Result<Vec<u8>, Error> {
    let hash = self.hash()?;
    let key = self.finished_key(base_key)?;
    Ok(hash.hmac(&key, &[digest]))
  }

  pub(crate) fn trace_secret(&self, label: &str, secret: &[u8]) {
    tracing::trace!(label, len = secret.len(), digest = %hexdump(&self.secret_fingerprint(secret)), "derived secret");
  }

  fn secret_fingerprint(&self, secret: &[u8]) -> Vec<u8> {
    // Only a short hash of the secret ever reaches the log stream.
    match self.hash {
      Some(hash) => hash.hmac(b"fingerprint", &[secret])[..4].to_vec(),
      None => Vec::new(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crypto::{SHA256, SHA384};

  #[test]
  fn expand_label_layout_matches_rfc8446() {
    // Independently assemble the HkdfLabel info and compare against a raw
    // HKDF-Expand with the same inputs.
    let secret = hkdf_extract(&SHA256, &[], b"input keying material");
    let via_label = hkdf_expand_label(&SHA256, &secret, "key", b"ctx", 16, "tls13 ").unwrap();

    let mut info = Vec::new();
    info.extend_from_slice(&16u16.to_be_bytes());
    info.push(9); // len("tls13 key")
    info.extend_from_slice(b"tls13 key");
    info.push(3);
    info.extend_from_slice(b"ctx");
    let via_expand = hkdf_expand(&SHA256, &secret, &info, 16).unwrap();

    assert_eq!(*via_label, *via_expand);
  }

  #[test]
  fn legacy_prefix_changes_output() {
    let secret = [0x0Bu8; 32];
    let standard = hkdf_expand_label(&SHA256, &secret, "key", &[], 16, "tls13 ").unwrap();
    let legacy = hkdf_expand_label(&SHA256, &secret, "key", &[], 16, "quic ").unwrap();
    assert_ne!(*standard, *legacy);
  }

  #[test]
  fn transcript_buffers_until_selection() {
    let mut sched = KeySchedule::new(None);
    sched.update_hash(b"client hello bytes");
    sched.select_hash(&SHA384);
    let deferred = sched.transcript_hash().unwrap();

    let mut direct = SHA384.start();
    direct.update(b"client hello bytes");
    assert_eq!(deferred, direct.snapshot());
  }

  #[test]
  fn provisional_hash_is_replaced_by_definitive_selection() {
    // A PSK-guess hash that loses the negotiation: the transcript replays
    // under the real hash and the secret chain restarts.
    let mut sched = KeySchedule::new(None);
    sched.select_hash_provisional(&SHA256);
    sched.extract(Some(b"an offered psk")).unwrap();
    sched.update_hash(b"client hello bytes");
    sched.select_hash(&SHA384);

    let mut direct = SHA384.start();
    direct.update(b"client hello bytes");
    assert_eq!(sched.transcript_hash().unwrap(), direct.snapshot());

    sched.extract(None).unwrap();
    let replaced = sched.derive_secret("c hs traffic").unwrap();

    let mut fresh = KeySchedule::new(None);
    fresh.select_hash(&SHA384);
    fresh.update_hash(b"client hello bytes");
    fresh.extract(None).unwrap();
    assert_eq!(*replaced, *fresh.derive_secret("c hs traffic").unwrap());
  }

  #[test]
  fn provisional_hash_promotes_without_losing_the_chain() {
    let run = |provisional: bool| {
      let mut sched = KeySchedule::new(None);
      if provisional {
        sched.select_hash_provisional(&SHA256);
      } else {
        sched.select_hash(&SHA256);
      }
      sched.extract(Some(b"a pre-shared key")).unwrap();
      sched.update_hash(b"client hello bytes");
      sched.select_hash(&SHA256);
      sched.derive_secret("c e traffic").unwrap()
    };
    assert_eq!(*run(true), *run(false));
  }

  #[test]
  fn rewrite_requires_a_definitive_hash() {
    let mut sched = KeySchedule::new(None);
    sched.select_hash_provisional(&SHA256);
    sched.update_hash(b"first client hello");
    assert!(sched.rewrite_with_message_hash().is_err());
    sched.select_hash(&SHA256);
    sched.rewrite_with_message_hash().unwrap();
  }

  #[test]
  fn message_hash_rewrite_replaces_transcript() {
    let mut sched = KeySchedule::new(None);
    sched.select_hash(&SHA256);
    sched.update_hash(b"first client hello");
    sched.rewrite_with_message_hash().unwrap();
    let rewritten = sched.transcript_hash().unwrap();

    let mut inner = SHA256.start();
    inner.update(b"first client hello");
    let mut expected = SHA256.start();
    expected.update(&[254, 0, 0, 32]);
    expected.update(&inner.snapshot());
    assert_eq!(rewritten, expected.snapshot());
  }

  #[test]
  fn schedule_is_deterministic_across_instances() {
    let run = || {
      let mut sched = KeySchedule::new(None);
      sched.select_hash(&SHA256);
      sched.extract(Some(b"a pre-shared key")).unwrap();
      sched.update_hash(b"hello messages");
      let early = sched.derive_secret("c e traffic").unwrap();
      sched.extract(Some(b"an ecdhe secret")).unwrap();
      let hs = sched.derive_secret("c hs traffic").unwrap();
      sched.extract(None).unwrap();
      let app = sched.derive_secret("c ap traffic").unwrap();
      (early, hs, app)
    };
    let (e1, h1, a1) = run();
    let (e2, h2, a2) = run();
    assert_eq!(*e1, *e2);
    assert_eq!(*h1, *h2);
    assert_eq!(*a1, *a2);
    assert_ne!(*e1, *h1);
    assert_ne!(*h1, *a1);
  }

  #[test]
  fn finished_mac_depends_on_transcript() {
    let mut sched = KeySchedule::new(None);
    sched.select_hash(&SHA256);
    sched.extract(None).unwrap();
    sched.update_hash(b"some message");
    let base = sched.derive_secret("s hs traffic").unwrap();
    let first = sched.finished_mac(&base).unwrap();
    sched.update_hash(b"another message");
    let second = sched.finished_mac(&base).unwrap();
    assert_ne!(first, second);
  }
}
