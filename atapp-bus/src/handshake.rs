// Copyright (c) Sean Lawlor
//
// This source code is licensed under both the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree.

//! Hashing utilities mainly used around challenge computation

pub(crate) const DIGEST_BYTES: usize = 32;
pub(crate) type Digest = [u8; DIGEST_BYTES];

/// Compute a challenge digest
pub(crate) fn challenge_digest(token: &str, challenge: u64) -> Digest {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let token_bytes = token.as_bytes();
    let challenge_bytes = challenge.to_be_bytes();
    let mut mac = HmacSha256::new_from_slice(token_bytes).expect("HMAC can take key of any size");
    mac.update(&challenge_bytes);

    mac.finalize().into_bytes().into()
}

/// Check a peer's answer to `challenge` against every configured token.
/// With no tokens configured, authentication is disabled and every answer
/// passes.
pub(crate) fn verify_digest(tokens: &[String], challenge: u64, answer: &[u8]) -> bool {
    if tokens.is_empty() {
        return true;
    }
    tokens
        .iter()
        .any(|token| challenge_digest(token, challenge).as_slice() == answer)
}

/// The digest this node answers a peer challenge with: computed from the
/// first configured token, empty when authentication is disabled.
pub(crate) fn answer_digest(tokens: &[String], challenge: u64) -> Vec<u8> {
    match tokens.first() {
        Some(token) => challenge_digest(token, challenge).to_vec(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_per_token_and_challenge() {
        let a = challenge_digest("cookie", 42);
        let b = challenge_digest("cookie", 42);
        assert_eq!(DIGEST_BYTES, a.len());
        assert_eq!(a, b);

        assert_ne!(a, challenge_digest("cookie", 43));
        assert_ne!(a, challenge_digest("biscuit", 42));
    }

    #[test]
    fn any_configured_token_verifies() {
        let tokens = vec!["old-secret".to_string(), "new-secret".to_string()];
        let answer = challenge_digest("new-secret", 7);
        assert!(verify_digest(&tokens, 7, &answer));

        let wrong = challenge_digest("stolen", 7);
        assert!(!verify_digest(&tokens, 7, &wrong));
    }

    #[test]
    fn no_tokens_disables_authentication() {
        assert!(verify_digest(&[], 1, b""));
        assert!(verify_digest(&[], 1, b"anything"));
        assert!(answer_digest(&[], 1).is_empty());
    }
}
