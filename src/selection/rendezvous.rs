//! Rendezvous (highest-random-weight) hashing.
//!
//! Every candidate is scored with HMAC-SHA256 keyed by the affinity key over
//! the candidate id, truncated to 64 bits. The highest score wins, so removing
//! a candidate only moves the keys that had picked it.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub fn rendezvous_score(key: &[u8], candidate: &str) -> u64 {
    // HMAC accepts keys of any length
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 rejected a key"));
    mac.update(candidate.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Pick the candidate with the highest score for `key`. Ties go to the
/// lexicographically smaller id.
pub fn pick_by_rendezvous<'a, T, F>(key: &[u8], candidates: &'a [T], id_of: F) -> Option<&'a T>
where
    F: Fn(&T) -> &str,
{
    candidates
        .iter()
        .map(|candidate| (rendezvous_score(key, id_of(candidate)), candidate))
        .max_by(|(score_a, a), (score_b, b)| {
            score_a
                .cmp(score_b)
                .then_with(|| id_of(b).cmp(id_of(a)))
        })
        .map(|(_, candidate)| candidate)
}
