//! Growable output buffer with inline small-buffer storage.
//!
//! Every public operation of the engine writes its output through a
//! [`Buffer`]. Small flights (alerts, KeyUpdate, most handshake responses)
//! stay in the inline storage; the first growth beyond it promotes the
//! contents to the heap. Contents are wiped before any backing storage is
//! released, so key material never lingers in freed memory.

use crate::utils::clear_memory;

/// Size of the inline storage. Chosen to hold an alert record or a small
/// post-handshake message without touching the allocator.
pub const INLINE_CAPACITY: usize = 128;

enum Repr {
  Inline { data: [u8; INLINE_CAPACITY], len: usize },
  Heap(Vec<u8>),
}

/// Byte buffer holding the engine's output.
pub struct Buffer {
  repr: Repr,
}

impl Buffer {
  /// Creates an empty buffer backed by inline storage.
  pub fn new() -> Self {
    Buffer { repr: Repr::Inline { data: [0; INLINE_CAPACITY], len: 0 } }
  }

  pub fn len(&self) -> usize {
    match &self.repr {
      Repr::Inline { len, .. } => *len,
      Repr::Heap(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Whether the contents have been promoted to a heap allocation.
  pub fn is_allocated(&self) -> bool {
    matches!(self.repr, Repr::Heap(_))
  }

  pub fn as_slice(&self) -> &[u8] {
    match &self.repr {
      Repr::Inline { data, len } => &data[..*len],
      Repr::Heap(v) => v.as_slice(),
    }
  }

  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    match &mut self.repr {
      Repr::Inline { data, len } => &mut data[..*len],
      Repr::Heap(v) => v.as_mut_slice(),
    }
  }

  /// Ensures capacity for `delta` additional bytes, promoting to the heap on
  /// first growth past the inline storage.
  pub fn reserve(&mut self, delta: usize) {
    let needed = self.len() + delta;
    match &mut self.repr {
      Repr::Inline { data, len } => {
        if needed > INLINE_CAPACITY {
          let mut v = Vec::with_capacity(needed.next_power_of_two());
          v.extend_from_slice(&data[..*len]);
          clear_memory(&mut data[..*len]);
          self.repr = Repr::Heap(v);
        }
      },
      Repr::Heap(v) => {
        if needed > v.capacity() {
          let mut grown = Vec::with_capacity(needed.next_power_of_two());
          grown.extend_from_slice(v);
          clear_memory(v.as_mut_slice());
          *v = grown;
        }
      },
    }
  }

  pub fn push(&mut self, byte: u8) {
    self.extend_from_slice(&[byte]);
  }

  pub fn extend_from_slice(&mut self, src: &[u8]) {
    self.reserve(src.len());
    match &mut self.repr {
      Repr::Inline { data, len } => {
        data[*len..*len + src.len()].copy_from_slice(src);
        *len += src.len();
      },
      Repr::Heap(v) => v.extend_from_slice(src),
    }
  }

  /// Appends `n` zero bytes (placeholder space for back-patched prefixes).
  pub fn extend_zeroes(&mut self, n: usize) {
    self.reserve(n);
    match &mut self.repr {
      Repr::Inline { data, len } => {
        data[*len..*len + n].fill(0);
        *len += n;
      },
      Repr::Heap(v) => v.resize(v.len() + n, 0),
    }
  }

  /// Inserts `n` zero bytes at `at`, shifting the tail right. Used by the
  /// ASN.1 long-form length fix-up.
  pub fn insert_zeroes(&mut self, at: usize, n: usize) {
    assert!(at <= self.len());
    let old_len = self.len();
    self.extend_zeroes(n);
    let slice = self.as_mut_slice();
    slice.copy_within(at..old_len, at + n);
    slice[at..at + n].fill(0);
  }

  /// Inserts `src` at `at`, shifting the tail right.
  pub fn insert_slice(&mut self, at: usize, src: &[u8]) {
    self.insert_zeroes(at, src.len());
    self.as_mut_slice()[at..at + src.len()].copy_from_slice(src);
  }

  /// Shortens the buffer, wiping the removed tail.
  pub fn truncate(&mut self, new_len: usize) {
    if new_len >= self.len() {
      return;
    }
    let len = self.len();
    clear_memory(&mut self.as_mut_slice()[new_len..len]);
    match &mut self.repr {
      Repr::Inline { len, .. } => *len = new_len,
      Repr::Heap(v) => v.truncate(new_len),
    }
  }

  /// Empties the buffer, wiping current contents.
  pub fn clear(&mut self) {
    self.truncate(0);
  }
}

impl Default for Buffer {
  fn default() -> Self {
    Buffer::new()
  }
}

impl Drop for Buffer {
  fn drop(&mut self) {
    match &mut self.repr {
      Repr::Inline { data, len } => clear_memory(&mut data[..*len]),
      Repr::Heap(v) => clear_memory(v.as_mut_slice()),
    }
  }
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Buffer {{ len: {}, allocated: {} }}", self.len(), self.is_allocated())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stays_inline_until_first_growth() {
    let mut buf = Buffer::new();
    buf.extend_from_slice(&[0xAB; INLINE_CAPACITY]);
    assert!(!buf.is_allocated());
    buf.push(0xCD);
    assert!(buf.is_allocated());
    assert_eq!(buf.len(), INLINE_CAPACITY + 1);
    assert_eq!(buf.as_slice()[INLINE_CAPACITY], 0xCD);
  }

  #[test]
  fn insert_zeroes_shifts_tail() {
    let mut buf = Buffer::new();
    buf.extend_from_slice(b"abcd");
    buf.insert_zeroes(2, 3);
    assert_eq!(buf.as_slice(), b"ab\0\0\0cd");
  }

  #[test]
  fn truncate_wipes_and_shrinks() {
    let mut buf = Buffer::new();
    buf.extend_from_slice(b"0123456789");
    buf.truncate(4);
    assert_eq!(buf.as_slice(), b"0123");
    buf.clear();
    assert!(buf.is_empty());
  }
}
