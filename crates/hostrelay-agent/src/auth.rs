//! Connection token validation

use crate::config::ConnectionToken;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Outcome of presenting a credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    /// The credential matches the configured token
    Accepted,
    /// Anything else
    Rejected,
}

/// Checks presented credentials against the configured token
///
/// Both sides are hashed before comparing so the comparison always runs over
/// 32 bytes, whatever length the client sent.
pub struct TokenAuthenticator {
    expected: [u8; 32],
    rejections: AtomicU64,
}

impl TokenAuthenticator {
    /// Authenticator for `token`
    pub fn new(token: &ConnectionToken) -> Self {
        Self {
            expected: digest(token.expose()),
            rejections: AtomicU64::new(0),
        }
    }

    /// Validate a presented credential
    pub fn authenticate(&self, presented: &str) -> AuthOutcome {
        let candidate = digest(presented);
        let diff = self
            .expected
            .iter()
            .zip(candidate.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));

        if diff == 0 {
            AuthOutcome::Accepted
        } else {
            self.reject()
        }
    }

    /// Record a failed handshake that never got as far as a credential
    pub fn reject(&self) -> AuthOutcome {
        let total = self.rejections.fetch_add(1, Ordering::Relaxed) + 1;
        warn!("Rejected unauthenticated connection ({} so far)", total);
        AuthOutcome::Rejected
    }

    /// Number of rejected handshakes
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}

fn digest(value: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(value.as_bytes()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_matching_token() {
        let auth = TokenAuthenticator::new(&ConnectionToken::new("s3cret"));
        assert_eq!(auth.authenticate("s3cret"), AuthOutcome::Accepted);
        assert_eq!(auth.rejections(), 0);
    }

    #[test]
    fn test_rejects_prefix_and_empty() {
        let auth = TokenAuthenticator::new(&ConnectionToken::new("s3cret"));

        assert_eq!(auth.authenticate("s3cre"), AuthOutcome::Rejected);
        assert_eq!(auth.authenticate("s3cret "), AuthOutcome::Rejected);
        assert_eq!(auth.authenticate(""), AuthOutcome::Rejected);
        assert_eq!(auth.rejections(), 3);
    }

    #[test]
    fn test_explicit_reject_counts() {
        let auth = TokenAuthenticator::new(&ConnectionToken::generate());
        auth.reject();
        assert_eq!(auth.rejections(), 1);
    }

    proptest! {
        #[test]
        fn test_only_exact_token_accepted(token in "[a-zA-Z0-9-]{1,40}", other in "[a-zA-Z0-9-]{0,40}") {
            let auth = TokenAuthenticator::new(&ConnectionToken::new(token.clone()));
            let expected = if other == token { AuthOutcome::Accepted } else { AuthOutcome::Rejected };
            prop_assert_eq!(auth.authenticate(&other), expected);
            prop_assert_eq!(auth.authenticate(&token), AuthOutcome::Accepted);
        }
    }
}
