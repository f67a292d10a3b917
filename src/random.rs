//! A small, fast, non-cryptographic PRNG used only to shuffle the order in
//! which a `select` call visits its events, so that repeated calls with
//! several simultaneously-ready events don't always favor the
//! textually-first one.
//!
//! A 15-bit linear congruential generator, seeded once per process from
//! `/dev/urandom` and falling back to a fixed seed if that fails, rather
//! than failing `select` outright over an unseeded shuffle.

use std::io::Read;
use std::sync::Mutex;
use std::sync::OnceLock;

const MULTIPLIER: u32 = 1_103_515_245;
const INCREMENT: u32 = 12_345;
const BITS: u32 = 15;
const MODULUS: u32 = 1 << BITS;

/// A 15-bit linear congruential generator, matching the one the original
/// `select` implementation shuffled event order with.
pub(crate) struct Random15 {
    state: u32,
}

impl Random15 {
    pub(crate) fn new(seed: u32) -> Self {
        Random15 { state: seed }
    }

    /// The next pseudo-random value in `0..2^15`.
    fn next(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        (self.state >> 16) & (MODULUS - 1)
    }

    /// A pseudo-random value in `0..bound`, via rejection sampling against
    /// the generator's 15-bit range so the result isn't biased toward the
    /// low end of non-power-of-two bounds.
    pub(crate) fn random_below(&mut self, bound: usize) -> usize {
        if bound <= 1 {
            return 0;
        }

        let bound32 = bound as u32;
        if bound32 >= MODULUS {
            return (self.next() as usize) % bound;
        }

        let limit = MODULUS - (MODULUS % bound32);
        loop {
            let value = self.next();
            if value < limit {
                return (value % bound32) as usize;
            }
        }
    }

    /// Fisher-Yates shuffle of `items` in place.
    pub(crate) fn shuffle<T>(&mut self, items: &mut [T]) {
        if items.len() < 2 {
            return;
        }

        for i in (1..items.len()).rev() {
            let j = self.random_below(i + 1);
            items.swap(i, j);
        }
    }
}

/// Read a `u32` seed from `/dev/urandom`, falling back to `0` if it can't be
/// opened or read in full. A bad seed only skews the shuffle, it never
/// makes `select` incorrect, so this deliberately doesn't propagate an
/// `Error`.
pub(crate) fn system_random() -> u32 {
    std::fs::File::open("/dev/urandom")
        .and_then(|mut f| {
            let mut buf = [0u8; 4];
            f.read_exact(&mut buf)?;
            Ok(u32::from_ne_bytes(buf))
        })
        .unwrap_or(0)
}

static GENERATOR: OnceLock<Mutex<Random15>> = OnceLock::new();

fn process_generator() -> &'static Mutex<Random15> {
    GENERATOR.get_or_init(|| Mutex::new(Random15::new(system_random())))
}

/// Fisher-Yates shuffle of `items` using the single generator shared by
/// every `select` call in this process, seeded once from [`system_random`]
/// and advanced (never reset) on every call. A `Random15` freshly re-seeded
/// per call would shuffle identically every time it's asked to order the
/// same number of events, which would make ties break the same way every
/// time instead of uniformly at random. This is the only entry point into
/// the generator; nothing else in this crate should construct its own
/// `Random15` from [`system_random`] and use it in isolation.
pub(crate) fn shuffle<T>(items: &mut [T]) {
    let mut guard = process_generator().lock().unwrap_or_else(|e| e.into_inner());
    guard.shuffle(items);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_below_one_is_always_zero() {
        let mut rng = Random15::new(42);
        for _ in 0..10 {
            assert_eq!(rng.random_below(1), 0);
        }
    }

    #[test]
    fn random_below_stays_in_bounds() {
        let mut rng = Random15::new(7);
        for _ in 0..1000 {
            let v = rng.random_below(13);
            assert!(v < 13);
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = Random15::new(99);
        let mut items: Vec<i32> = (0..10).collect();
        let original = items.clone();
        rng.shuffle(&mut items);

        let mut sorted = items.clone();
        sorted.sort();
        assert_eq!(sorted, original);
    }

    #[test]
    fn same_seed_is_deterministic() {
        let mut a = Random15::new(123);
        let mut b = Random15::new(123);
        for _ in 0..20 {
            assert_eq!(a.next(), b.next());
        }
    }

    /// The process-wide generator behind [`shuffle`] must advance rather
    /// than reset on every call. Otherwise every `select` call with the
    /// same number of events would always produce the same tie-break order.
    #[test]
    fn shuffle_advances_the_shared_generator_across_calls() {
        let mut saw_more_than_one_order = false;
        let mut first: Option<Vec<i32>> = None;

        for _ in 0..200 {
            let mut items = vec![0, 1];
            shuffle(&mut items);
            match &first {
                None => first = Some(items),
                Some(prev) if *prev != items => saw_more_than_one_order = true,
                Some(_) => {}
            }
        }

        assert!(
            saw_more_than_one_order,
            "shuffle() produced the same order on every call"
        );
    }
}
