//! Session identity.
//!
//! A deterministic key is SHA-256 over `workspace NUL pane`, hex-encoded and
//! cut to [`KEY_HEX_LEN`] characters, so the same workspace and pane always
//! land on the same session after a UI remount. A fresh key is 16 random
//! bytes and is used when a pane must get its own shell (splits).

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Pane name used when the caller does not name one.
pub const DEFAULT_PANE: &str = "main";

/// Width of every session key in hex characters (128 bits).
pub const KEY_HEX_LEN: usize = 32;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Stable key for a workspace + pane pair.
    pub fn deterministic(workspace_path: &Path, pane_id: Option<&str>) -> Self {
        let pane = pane_id.unwrap_or(DEFAULT_PANE);
        let mut hasher = Sha256::new();
        hasher.update(workspace_path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(pane.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(digest[..KEY_HEX_LEN].to_string())
    }

    /// Random key, independent of any workspace or pane.
    pub fn fresh() -> Self {
        let bytes: [u8; KEY_HEX_LEN / 2] = rand::thread_rng().gen();
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::borrow::Borrow<str> for SessionKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn deterministic_is_stable() {
        let a = SessionKey::deterministic(Path::new("/repo"), Some("main"));
        let b = SessionKey::deterministic(Path::new("/repo"), Some("main"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), KEY_HEX_LEN);
    }

    #[test]
    fn missing_pane_is_the_main_pane() {
        let implicit = SessionKey::deterministic(Path::new("/repo"), None);
        let explicit = SessionKey::deterministic(Path::new("/repo"), Some(DEFAULT_PANE));
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn pane_is_part_of_the_key() {
        let left = SessionKey::deterministic(Path::new("/repo"), Some("left"));
        let right = SessionKey::deterministic(Path::new("/repo"), Some("right"));
        assert_ne!(left, right);
    }

    #[test]
    fn workspace_and_pane_do_not_run_together() {
        // "/a" + "bc" must not hash like "/ab" + "c".
        let one = SessionKey::deterministic(Path::new("/a"), Some("bc"));
        let two = SessionKey::deterministic(Path::new("/ab"), Some("c"));
        assert_ne!(one, two);
    }

    #[test]
    fn fresh_keys_differ() {
        let keys: HashSet<SessionKey> = (0..64).map(|_| SessionKey::fresh()).collect();
        assert_eq!(keys.len(), 64);
        assert!(keys.iter().all(|k| k.as_str().len() == KEY_HEX_LEN));
    }

    #[test]
    fn borrow_as_str_for_map_lookups() {
        let mut map = std::collections::HashMap::new();
        let key = SessionKey::from("abc");
        map.insert(key, 1);
        assert_eq!(map.get("abc"), Some(&1));
    }
}
