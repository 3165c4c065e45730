//! Fixed-capacity inline string.

use core::fmt;
use core::ops::Deref;

/// A bounded, inline UTF-8 string for naming kernel objects (arenas,
/// tasks). Copyable, allocation-free, at most [`Name::CAPACITY`] bytes.
#[derive(Copy, Clone)]
pub struct Name {
    len: u8,
    bytes: [u8; Self::CAPACITY],
}

impl Name {
    /// Maximum name length in bytes.
    pub const CAPACITY: usize = 63;

    /// Construct from a string slice.
    ///
    /// # Panics
    /// Panics if `name` exceeds [`Self::CAPACITY`] bytes. Names are
    /// compile-time literals in practice, so this is a `const`-evaluable
    /// build error rather than a runtime hazard.
    #[must_use]
    pub const fn new(name: &str) -> Self {
        let src = name.as_bytes();
        assert!(src.len() <= Self::CAPACITY, "name too long");
        let mut bytes = [0u8; Self::CAPACITY];
        let mut i = 0;
        while i < src.len() {
            bytes[i] = src[i];
            i += 1;
        }
        Self {
            len: src.len() as u8,
            bytes,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Bytes were copied from a &str and never mutated.
        unsafe { core::str::from_utf8_unchecked(&self.bytes[..self.len as usize]) }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Name {}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        const NAME: Name = Name::new("kernel_heap");
        assert_eq!(NAME.as_str(), "kernel_heap");
        assert_eq!(NAME.len(), 11);
        assert_eq!(NAME.to_string(), "kernel_heap");
        assert_eq!(NAME, Name::new("kernel_heap"));
        assert_ne!(NAME, Name::new("other"));
    }

    #[test]
    fn empty_name() {
        let name = Name::new("");
        assert!(name.is_empty());
        assert_eq!(name.as_str(), "");
    }

    #[test]
    #[should_panic(expected = "name too long")]
    fn oversized_name_panics() {
        let _ = Name::new(
            "this-name-is-unreasonably-long-for-a-kernel-object-and-exceeds-the-limit",
        );
    }
}
