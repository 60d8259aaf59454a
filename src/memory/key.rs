//! Shared-memory key naming.
//!
//! Every frameserver instance gets one base key ending in `_m`. The three
//! gates of its triad are named by replacing that terminal `m` with `v`
//! (video), `a` (audio) or `e` (event), so a child holding only the base key
//! can locate everything else.

use crate::error::{Error, Result};
use crate::sync::GateKind;
use rustix::process::getpid;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

/// Shortest accepted key, e.g. `"a_m"`.
pub const MIN_KEY_LEN: usize = 3;

/// Longest accepted key. 31 bytes is the most restrictive named-object
/// limit among the supported platforms.
pub const MAX_KEY_LEN: usize = 31;

/// Terminal character of a segment key.
pub const SEGMENT_SUFFIX: char = 'm';

/// Prefix of generated keys.
const GENERATED_PREFIX: &str = "/flk";

/// Process-wide sequence for generated keys.
static NEXT_KEY_SEQ: AtomicU32 = AtomicU32::new(0);

/// Base name of a frameserver's shared objects.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShmKey(String);

impl ShmKey {
    /// Validate and wrap an existing key (typically received from the parent).
    ///
    /// Keys are ASCII alphanumerics and `_`, optionally led by a single `/`,
    /// and must end in `_m`.
    pub fn new(key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.len() < MIN_KEY_LEN || key.len() > MAX_KEY_LEN {
            return Err(Error::BadArgument(format!(
                "key length {} outside {}..={}",
                key.len(),
                MIN_KEY_LEN,
                MAX_KEY_LEN
            )));
        }

        let body = key.strip_prefix('/').unwrap_or(&key);
        if !body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(Error::BadArgument(format!("invalid characters in key {key:?}")));
        }
        if !body.ends_with("_m") {
            return Err(Error::BadArgument(format!("key {key:?} must end in \"_m\"")));
        }

        Ok(Self(key))
    }

    /// Generate a fresh key for this process.
    ///
    /// Uniqueness within the process comes from a monotonically increasing
    /// sequence; the allocator additionally creates objects exclusively, so a
    /// collision with a foreign process just advances to the next key.
    pub fn generate() -> Self {
        let pid = getpid().as_raw_nonzero().get() as u32;
        let seq = NEXT_KEY_SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("{GENERATED_PREFIX}{pid:x}_{seq:x}_m"))
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Derive the name of one of the triad gates.
    pub fn gate_name(&self, kind: GateKind) -> String {
        let mut name = self.0.clone();
        name.pop();
        name.push(kind.suffix());
        name
    }
}

impl fmt::Display for ShmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ShmKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_gate_names() {
        let key = ShmKey::new("seg_m").unwrap();
        assert_eq!(key.gate_name(GateKind::Video), "seg_v");
        assert_eq!(key.gate_name(GateKind::Audio), "seg_a");
        assert_eq!(key.gate_name(GateKind::Event), "seg_e");
        // The base key is untouched by derivation.
        assert_eq!(key.as_str(), "seg_m");
    }

    #[test]
    fn test_derive_at_length_bounds() {
        let shortest = ShmKey::new("a_m").unwrap();
        assert_eq!(shortest.gate_name(GateKind::Event), "a_e");

        let longest_str = format!("/{}_m", "k".repeat(MAX_KEY_LEN - 3));
        assert_eq!(longest_str.len(), MAX_KEY_LEN);
        let longest = ShmKey::new(longest_str.clone()).unwrap();
        let video = longest.gate_name(GateKind::Video);
        assert_eq!(video.len(), MAX_KEY_LEN);
        assert_eq!(&video[..MAX_KEY_LEN - 1], &longest_str[..MAX_KEY_LEN - 1]);
        assert!(video.ends_with("_v"));
    }

    #[test]
    fn test_rejects_bad_keys() {
        assert!(ShmKey::new("_m").is_err());
        assert!(ShmKey::new("seg_x").is_err());
        assert!(ShmKey::new("se/g_m").is_err());
        assert!(ShmKey::new("seg-1_m").is_err());
        assert!(ShmKey::new(format!("{}_m", "k".repeat(MAX_KEY_LEN))).is_err());
    }

    #[test]
    fn test_generated_keys_unique_and_valid() {
        let a = ShmKey::generate();
        let b = ShmKey::generate();
        assert_ne!(a, b);
        assert!(ShmKey::new(a.as_str()).is_ok());
        assert!(a.as_str().len() <= MAX_KEY_LEN);
    }
}
