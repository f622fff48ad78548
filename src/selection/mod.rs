//! Worker selection strategies.
//!
//! - [`pick_random`]: uniform choice among eligible candidates
//! - [`pick_by_rendezvous`]: highest-random-weight hashing, stable under churn
//! - [`hash_index`]: cheap bucket index (`murmur3_32(data) mod n`) for callers
//!   that need *some* deterministic slot rather than rendezvous stability

pub mod murmur3;
pub mod rendezvous;

use rand::seq::SliceRandom;

pub use murmur3::murmur3_32;
pub use rendezvous::{pick_by_rendezvous, rendezvous_score};

/// Pick one candidate uniformly at random. Returns `None` for an empty slice.
pub fn pick_random<T>(candidates: &[T]) -> Option<&T> {
    candidates.choose(&mut rand::thread_rng())
}

/// Deterministic bucket index for `data` among `n` slots.
pub fn hash_index(data: &[u8], n: usize) -> Option<usize> {
    if n == 0 {
        return None;
    }
    Some(murmur3_32(data, 0) as usize % n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_random_empty_is_none() {
        let empty: [u8; 0] = [];
        assert!(pick_random(&empty).is_none());
    }

    #[test]
    fn pick_random_returns_a_member() {
        let candidates = ["a", "b", "c"];
        for _ in 0..50 {
            let picked = pick_random(&candidates).unwrap();
            assert!(candidates.contains(picked));
        }
    }

    #[test]
    fn pick_random_reaches_every_candidate() {
        let candidates = [1, 2, 3];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            seen.insert(*pick_random(&candidates).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn hash_index_is_stable_and_in_range() {
        assert_eq!(hash_index(b"image:latest", 0), None);
        let first = hash_index(b"image:latest", 7).unwrap();
        assert!(first < 7);
        assert_eq!(hash_index(b"image:latest", 7), Some(first));
    }
}
