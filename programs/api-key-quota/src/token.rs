use std::fmt;
use std::hash::{Hash, Hasher};

use rand::random;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Characters of the raw token kept for display and audit.
pub const DISPLAY_PREFIX_LEN: usize = 12;

const SECRET_BYTES: usize = 16;

/// SHA-256 of a key token. Equality is constant time.
#[derive(Clone, Copy)]
pub struct TokenHash([u8; 32]);

impl TokenHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl PartialEq for TokenHash {
    fn eq(&self, other: &Self) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }
}

impl Eq for TokenHash {}

impl Hash for TokenHash {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for TokenHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenHash({}..)", &self.to_hex()[..8])
    }
}

/// Generates tokens and derives their stored hash.
#[derive(Clone)]
pub struct TokenHasher {
    prefix: String,
    pepper: String,
}

impl TokenHasher {
    pub fn new(prefix: impl Into<String>, pepper: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            pepper: pepper.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// A fresh `<prefix><32 hex>` token from the thread CSPRNG.
    pub fn generate(&self) -> String {
        let bytes: [u8; SECRET_BYTES] = random();
        format!("{}{}", self.prefix, hex::encode(bytes))
    }

    /// Cheap shape check so garbage never reaches the store.
    pub fn is_well_formed(&self, token: &str) -> bool {
        match token.strip_prefix(self.prefix.as_str()) {
            Some(secret) => {
                secret.len() == SECRET_BYTES * 2 && secret.bytes().all(|b| b.is_ascii_hexdigit())
            }
            None => false,
        }
    }

    pub fn hash(&self, token: &str) -> TokenHash {
        let mut hasher = Sha256::new();
        hasher.update(self.pepper.as_bytes());
        hasher.update(token.as_bytes());
        TokenHash(hasher.finalize().into())
    }

    pub fn display_prefix(token: &str) -> String {
        token.chars().take(DISPLAY_PREFIX_LEN).collect()
    }
}

impl fmt::Debug for TokenHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenHasher")
            .field("prefix", &self.prefix)
            .field("pepper", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_well_formed_and_distinct() {
        let hasher = TokenHasher::new("veh_", "pepper");
        let a = hasher.generate();
        let b = hasher.generate();
        assert!(a.starts_with("veh_"));
        assert_eq!(a.len(), 4 + 32);
        assert!(hasher.is_well_formed(&a));
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let hasher = TokenHasher::new("veh_", "pepper");
        assert!(!hasher.is_well_formed(""));
        assert!(!hasher.is_well_formed("veh_"));
        assert!(!hasher.is_well_formed("key_0123456789abcdef0123456789abcdef"));
        assert!(!hasher.is_well_formed("veh_0123456789abcdef0123456789abcdeg"));
        assert!(hasher.is_well_formed("veh_0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn hash_depends_on_pepper() {
        let token = "veh_0123456789abcdef0123456789abcdef";
        let a = TokenHasher::new("veh_", "one").hash(token);
        let b = TokenHasher::new("veh_", "two").hash(token);
        assert_ne!(a, b);
        assert_eq!(a, TokenHasher::new("veh_", "one").hash(token));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let hasher = TokenHasher::new("veh_", "super-secret");
        assert!(!format!("{hasher:?}").contains("super-secret"));
        let hash = hasher.hash("veh_0123456789abcdef0123456789abcdef");
        assert!(format!("{hash:?}").len() < 24);
    }

    #[test]
    fn display_prefix_is_truncated() {
        assert_eq!(
            TokenHasher::display_prefix("veh_0123456789abcdef0123456789abcdef"),
            "veh_01234567"
        );
        assert_eq!(TokenHasher::display_prefix("short"), "short");
    }
}
