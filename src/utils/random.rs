//! Seeded deterministic random number generator.
//!
//! Wraps ChaCha20 so that every consumer in the crate draws from a single,
//! reproducible stream: a given seed replays the exact same sequence of
//! integers, reals and samples, which makes Spatial Pooler runs
//! bit-for-bit repeatable.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// A deterministic pseudo-random number generator.
///
/// # Example
///
/// ```rust
/// use veles::utils::Random;
///
/// let mut rng = Random::new(42);
/// let n = rng.get_uint32();
/// let f = rng.get_real64();
/// let mut items: Vec<u32> = (0..10).collect();
/// rng.shuffle(&mut items);
/// ```
pub struct Random {
    rng: ChaCha20Rng,
    seed: u64,
}

/// Exact generator state: seed plus position in the ChaCha20 key stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomState {
    /// The seed the generator was created with.
    pub seed: u64,
    /// Word offset into the key stream.
    pub word_pos: u128,
}

#[cfg(feature = "serde")]
mod serde_impl {
    use super::*;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct State {
        seed: u64,
        word_pos_hi: u64,
        word_pos_lo: u64,
    }

    impl Serialize for Random {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            let state = self.state();
            State {
                seed: state.seed,
                word_pos_hi: (state.word_pos >> 64) as u64,
                word_pos_lo: state.word_pos as u64,
            }
            .serialize(serializer)
        }
    }

    impl<'de> Deserialize<'de> for Random {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let state = State::deserialize(deserializer)?;
            Ok(Random::restore(RandomState {
                seed: state.seed,
                word_pos: (u128::from(state.word_pos_hi) << 64) | u128::from(state.word_pos_lo),
            }))
        }
    }
}

impl Random {
    /// Creates a new generator with the given seed.
    ///
    /// A negative seed requests OS entropy, giving a non-reproducible
    /// generator.
    #[must_use]
    pub fn new(seed: i64) -> Self {
        let actual_seed = if seed < 0 {
            rand::thread_rng().gen()
        } else {
            seed as u64
        };

        Self {
            rng: ChaCha20Rng::seed_from_u64(actual_seed),
            seed: actual_seed,
        }
    }

    /// Returns the seed used by this generator.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Captures the exact generator state.
    #[must_use]
    pub fn state(&self) -> RandomState {
        RandomState {
            seed: self.seed,
            word_pos: self.rng.get_word_pos(),
        }
    }

    /// Reconstructs a generator from a captured state.
    #[must_use]
    pub fn restore(state: RandomState) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(state.seed);
        rng.set_word_pos(state.word_pos);
        Self {
            rng,
            seed: state.seed,
        }
    }

    /// Generates a random u32.
    pub fn get_uint32(&mut self) -> u32 {
        self.rng.gen()
    }

    /// Generates a random usize in the range `[0, n)`; returns 0 when `n == 0`.
    pub fn get_usize(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        self.rng.gen_range(0..n)
    }

    /// Generates a random f32 in `[0, 1)`.
    pub fn get_real32(&mut self) -> f32 {
        self.rng.gen()
    }

    /// Generates a random f64 in `[0, 1)`.
    pub fn get_real64(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Generates a random f32 in the range `[min, max)`.
    pub fn real_range(&mut self, min: f32, max: f32) -> f32 {
        if min >= max {
            return min;
        }
        min + (max - min) * self.get_real32()
    }

    /// Shuffles a slice in place using Fisher-Yates.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        let n = slice.len();
        if n <= 1 {
            return;
        }

        for i in (1..n).rev() {
            let j = self.get_usize(i + 1);
            slice.swap(i, j);
        }
    }

    /// Samples `k` unique items from a collection without replacement.
    ///
    /// If `k >= items.len()`, returns a shuffled copy of all items.
    pub fn sample<T: Clone>(&mut self, mut items: Vec<T>, k: usize) -> Vec<T> {
        let n = items.len();
        if k >= n {
            self.shuffle(&mut items);
            return items;
        }

        // Partial Fisher-Yates: only the first k slots need settling.
        for i in 0..k {
            let j = self.get_usize(n - i) + i;
            items.swap(i, j);
        }

        items.truncate(k);
        items
    }

    /// Samples `k` indices from `0..n` without replacement.
    pub fn sample_indices(&mut self, n: usize, k: usize) -> Vec<usize> {
        self.sample((0..n).collect(), k)
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clone for Random {
    fn clone(&self) -> Self {
        Self {
            rng: self.rng.clone(),
            seed: self.seed,
        }
    }
}

impl PartialEq for Random {
    fn eq(&self, other: &Self) -> bool {
        self.state() == other.state()
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random")
            .field("seed", &self.seed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        let mut rng1 = Random::new(42);
        let mut rng2 = Random::new(42);

        for _ in 0..100 {
            assert_eq!(rng1.get_uint32(), rng2.get_uint32());
        }
    }

    #[test]
    fn test_different_seeds() {
        let mut rng1 = Random::new(42);
        let mut rng2 = Random::new(43);

        let same = (0..100).all(|_| rng1.get_uint32() == rng2.get_uint32());
        assert!(!same);
    }

    #[test]
    fn test_real_range() {
        let mut rng = Random::new(42);

        for _ in 0..1000 {
            let v = rng.real_range(0.25, 0.75);
            assert!((0.25..0.75).contains(&v));
        }
    }

    #[test]
    fn test_state_restore() {
        let mut rng = Random::new(7);
        // Mixed-width draws move the stream position by different amounts.
        let _ = rng.get_uint32();
        let _ = rng.get_real64();
        let _ = rng.get_real32();

        let state = rng.state();
        let mut restored = Random::restore(state);

        for _ in 0..50 {
            assert_eq!(rng.get_uint32(), restored.get_uint32());
        }
    }

    #[test]
    fn test_shuffle() {
        let mut rng = Random::new(42);
        let original: Vec<u32> = (0..100).collect();
        let mut shuffled = original.clone();
        rng.shuffle(&mut shuffled);

        assert_ne!(original, shuffled);

        let mut sorted = shuffled.clone();
        sorted.sort_unstable();
        assert_eq!(original, sorted);
    }

    #[test]
    fn test_sample() {
        let mut rng = Random::new(42);
        let items: Vec<u32> = (0..100).collect();
        let sampled = rng.sample(items.clone(), 10);

        assert_eq!(sampled.len(), 10);

        let mut unique = sampled.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 10);

        for item in &sampled {
            assert!(items.contains(item));
        }
    }

    #[test]
    fn test_sample_more_than_available() {
        let mut rng = Random::new(42);
        let sampled = rng.sample((0u32..5).collect(), 10);
        assert_eq!(sampled.len(), 5);

        let mut empty: Vec<u32> = Vec::new();
        rng.shuffle(&mut empty);
        assert!(empty.is_empty());
    }
}
