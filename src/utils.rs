//! Hardening hooks and small helpers shared across the engine.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

/// Signature of the process-wide secret-wiping hook.
pub type ClearMemoryFn = fn(&mut [u8]);
/// Signature of the process-wide constant-time comparison hook.
pub type MemEqualFn = fn(&[u8], &[u8]) -> bool;

static CLEAR_MEMORY: OnceLock<ClearMemoryFn> = OnceLock::new();
static MEM_EQUAL: OnceLock<MemEqualFn> = OnceLock::new();

fn default_clear_memory(buf: &mut [u8]) {
  buf.zeroize();
}

fn default_mem_equal(x: &[u8], y: &[u8]) -> bool {
  x.len() == y.len() && bool::from(x.ct_eq(y))
}

/// Installs a replacement secret-wiping routine. Must be called before any
/// connection is created; a second call (or a call after first use) is
/// ignored and reported as `false`.
pub fn set_clear_memory(f: ClearMemoryFn) -> bool {
  CLEAR_MEMORY.set(f).is_ok()
}

/// Installs a replacement constant-time comparison. Same once-only contract
/// as [`set_clear_memory`].
pub fn set_mem_equal(f: MemEqualFn) -> bool {
  MEM_EQUAL.set(f).is_ok()
}

/// Wipes `buf` using the installed hook (zeroize-backed by default).
pub fn clear_memory(buf: &mut [u8]) {
  CLEAR_MEMORY.get_or_init(|| default_clear_memory)(buf)
}

/// Compares two byte strings in time independent of the position of the first
/// differing byte. Lengths are not secret.
pub fn mem_equal(x: &[u8], y: &[u8]) -> bool {
  MEM_EQUAL.get_or_init(|| default_mem_equal)(x, y)
}

/// Formats `src` as lowercase hex, the way secrets appear in key-log files.
pub fn hexdump(src: &[u8]) -> String {
  hex::encode(src)
}

/// Source of wall-clock time, milliseconds since the Unix epoch.
pub trait TimeSource: Send + Sync {
  fn now_millis(&self) -> u64;
}

/// The default time source backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
  fn now_millis(&self) -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
  }
}

/// Returns true if `name` parses as an IPv4 or IPv6 literal. SNI must carry
/// DNS names only (RFC 6066 §3).
pub fn server_name_is_ipaddr(name: &str) -> bool {
  name.parse::<std::net::IpAddr>().is_ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mem_equal_agrees_with_plain_equality() {
    assert!(mem_equal(b"abc", b"abc"));
    assert!(!mem_equal(b"abc", b"abd"));
    assert!(!mem_equal(b"abc", b"ab"));
    assert!(mem_equal(b"", b""));
  }

  #[test]
  fn clear_memory_zeroes_contents() {
    let mut secret = *b"super secret key material.......";
    clear_memory(&mut secret);
    // Reread through a volatile pointer so the wipe cannot be elided.
    for i in 0..secret.len() {
      let v = unsafe { std::ptr::read_volatile(secret.as_ptr().add(i)) };
      assert_eq!(v, 0);
    }
  }

  #[test]
  fn ip_literals_are_detected() {
    assert!(server_name_is_ipaddr("127.0.0.1"));
    assert!(server_name_is_ipaddr("::1"));
    assert!(!server_name_is_ipaddr("example.com"));
  }
}
