//! Length-prefixed byte-string key, mirroring the persisted layout used
//! throughout the index implementations: `[u32 length][length bytes]`.

use std::cmp::Ordering;
use std::convert::TryInto;

/// A key that owns its bytes, laid out exactly as it would be persisted:
/// a 4-byte little-endian length prefix followed by the content.
///
/// Index implementations allocate a `Key` into a PM arena and thereafter
/// only ever hand out [`KeyRef`] views into that allocation; the owning
/// buffer itself never moves (see the durability invariant in
/// `SPEC_FULL.md` component 3).
#[derive(Clone, Eq, PartialEq)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn new(content: &[u8]) -> Key {
        let mut buf = Vec::with_capacity(4 + content.len());
        buf.extend_from_slice(&(content.len() as u32).to_le_bytes());
        buf.extend_from_slice(content);
        Key(buf)
    }

    pub fn as_ref(&self) -> KeyRef<'_> {
        KeyRef(&self.0)
    }

    pub fn content(&self) -> &[u8] {
        &self.0[4..]
    }

    pub fn len(&self) -> usize {
        self.0.len() - 4
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The full persisted buffer, `[len][content]`, as would be written
    /// into a PM arena by an allocator (see `crate::alloc`).
    pub fn persisted_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Reconstruct a `Key` from raw persisted bytes (the layout produced
    /// by [`Key::persisted_bytes`]). Used when reading a key back out of
    /// an arena, e.g. during recovery or rehashing.
    pub fn from_persisted(buf: &[u8]) -> KeyRef<'_> {
        KeyRef(buf)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(&other.as_ref())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({:?})", self.as_ref())
    }
}

/// A borrowed view of a persisted key buffer: `data[0..4]` is the
/// little-endian length, `data[4..]` is the content.
///
/// Comparison mirrors the original `InternalString::compare`: a memcmp
/// over the shared prefix, then shorter-is-less on a tie.
#[derive(Clone, Copy)]
pub struct KeyRef<'a>(&'a [u8]);

impl<'a> KeyRef<'a> {
    pub fn from_raw(data: &'a [u8]) -> KeyRef<'a> {
        KeyRef(data)
    }

    pub fn length(&self) -> u32 {
        u32::from_le_bytes(self.0[0..4].try_into().unwrap())
    }

    pub fn content(&self) -> &'a [u8] {
        &self.0[4..4 + self.length() as usize]
    }

    pub fn to_owned_key(&self) -> Key {
        Key::new(self.content())
    }
}

impl<'a> PartialEq for KeyRef<'a> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<'a> Eq for KeyRef<'a> {}

impl<'a> Ord for KeyRef<'a> {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.content(), other.content());
        let n = a.len().min(b.len());
        match a[..n].cmp(&b[..n]) {
            Ordering::Equal => a.len().cmp(&b.len()),
            ord => ord,
        }
    }
}

impl<'a> PartialOrd for KeyRef<'a> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<'a> std::fmt::Debug for KeyRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.content()) {
            Ok(s) => write!(f, "{:?}", s),
            Err(_) => write!(f, "{:?}", self.content()),
        }
    }
}

/// Fixed-size scratch buffer for keys, used in the hot insert/search
/// paths so common-case small keys never touch the heap (see the
/// thread-local-scratch-buffer redesign note in `SPEC_FULL.md` §9).
/// Falls back to an owned `Key` allocation for anything larger.
pub enum KeyScratch {
    Inline([u8; 64], usize),
    Owned(Key),
}

impl KeyScratch {
    pub fn new(content: &[u8]) -> KeyScratch {
        if content.len() <= 60 {
            let mut buf = [0u8; 64];
            buf[0..4].copy_from_slice(&(content.len() as u32).to_le_bytes());
            buf[4..4 + content.len()].copy_from_slice(content);
            KeyScratch::Inline(buf, content.len())
        } else {
            KeyScratch::Owned(Key::new(content))
        }
    }

    pub fn as_ref(&self) -> KeyRef<'_> {
        match self {
            KeyScratch::Inline(buf, len) => KeyRef(&buf[..4 + len]),
            KeyScratch::Owned(k) => k.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_orders_shorter_first() {
        let a = Key::new(b"Hell");
        let b = Key::new(b"Hello");
        assert_eq!(a.cmp(&b), Ordering::Less);
    }

    #[test]
    fn equal_content_is_equal() {
        let a = Key::new(b"Hello");
        let b = Key::new(b"Hello");
        assert_eq!(a.cmp(&b), Ordering::Equal);
        assert_eq!(a, b);
    }

    #[test]
    fn lexicographic_order() {
        let a = Key::new(b"abc");
        let b = Key::new(b"abd");
        assert_eq!(a.cmp(&b), Ordering::Less);
    }

    #[test]
    fn roundtrip_through_persisted_bytes() {
        let k = Key::new(b"roundtrip-key");
        let bytes = k.persisted_bytes().to_vec();
        let kr = Key::from_persisted(&bytes);
        assert_eq!(kr.content(), b"roundtrip-key");
    }

    #[test]
    fn scratch_inline_vs_owned() {
        let small = KeyScratch::new(b"short");
        assert!(matches!(small, KeyScratch::Inline(..)));
        let large = KeyScratch::new(&vec![b'x'; 100]);
        assert!(matches!(large, KeyScratch::Owned(_)));
        assert_eq!(small.as_ref().content(), b"short");
        assert_eq!(large.as_ref().content().len(), 100);
    }
}
