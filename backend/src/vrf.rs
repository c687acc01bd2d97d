//! Randomness produced by the local oracle.
//!
//! The base output is an HMAC-SHA256 keyed by the oracle secret, so it is
//! deterministic for a given request but unpredictable without the key. The
//! base output is then expanded into as many 32-byte words as were requested.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Compute the 32-byte base output for a request.
///
/// ```text
/// output = HMAC-SHA256(secret, key_hash || subscription_id_le || request_id_le)
/// ```
pub fn compute_randomness(
    secret: &[u8],
    key_hash: &[u8; 32],
    subscription_id: u64,
    request_id: u64,
) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any size");

    mac.update(key_hash);
    mac.update(&subscription_id.to_le_bytes());
    mac.update(&request_id.to_le_bytes());

    let mut output = [0u8; 32];
    output.copy_from_slice(&mac.finalize().into_bytes());
    output
}

/// Expand a base output into `num_words` words: `word[i] = SHA256(base || i_le)`.
pub fn expand_words(base: &[u8; 32], num_words: u32) -> Vec<[u8; 32]> {
    (0..num_words)
        .map(|i| {
            let mut hasher = Sha256::new();
            hasher.update(base);
            hasher.update(i.to_le_bytes());
            let mut word = [0u8; 32];
            word.copy_from_slice(&hasher.finalize());
            word
        })
        .collect()
}

/// Interpret the first 8 bytes of a word as a little-endian u64.
pub fn word_to_u64(word: &[u8; 32]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&word[..8]);
    u64::from_le_bytes(bytes)
}
