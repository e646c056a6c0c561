//! Wrapping sequence numbers for outbound calls.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// Hands out `min, min + 1, ..., max, min, ...`.
///
/// A number is only reused after the whole range has gone by, so two calls
/// pending at the same time never share one unless more than
/// `max - min + 1` are outstanding.
#[derive(Debug)]
pub struct SnCounter {
    min: u64,
    max: u64,
    next: AtomicU64,
}

impl SnCounter {
    pub fn new(min: u64, max: u64) -> Self {
        let max = max.max(min);
        Self { min, max, next: AtomicU64::new(min) }
    }

    pub fn next(&self) -> u64 {
        let step = |cur: u64| Some(if cur >= self.max { self.min } else { cur + 1 });
        match self.next.fetch_update(Ordering::AcqRel, Ordering::Acquire, step) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Restarts the sequence, as after a reconnect.
    pub fn reset(&self) {
        self.next.store(self.min, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use rand::Rng;

    use super::*;

    #[test]
    fn test_wraps_to_min() {
        let sn = SnCounter::new(1, 3);
        let got: Vec<u64> = (0..7).map(|_| sn.next()).collect();
        assert_eq!(got, vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn test_wrap_at_u64_max_does_not_overflow() {
        let sn = SnCounter::new(u64::MAX - 1, u64::MAX);
        assert_eq!(sn.next(), u64::MAX - 1);
        assert_eq!(sn.next(), u64::MAX);
        assert_eq!(sn.next(), u64::MAX - 1);
    }

    #[test]
    fn test_reset() {
        let sn = SnCounter::new(10, 20);
        sn.next();
        sn.next();
        sn.reset();
        assert_eq!(sn.next(), 10);
    }

    #[test]
    fn test_random_ranges_stay_in_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let min = rng.gen_range(0..1_000u64);
            let span = rng.gen_range(0..64u64);
            let sn = SnCounter::new(min, min + span);
            let mut seen = HashSet::new();
            for _ in 0..(span + 1) {
                let v = sn.next();
                assert!(v >= min && v <= min + span);
                assert!(seen.insert(v), "duplicate sn {} within one cycle", v);
            }
            assert_eq!(sn.next(), min);
        }
    }

    #[test]
    fn test_concurrent_callers_get_distinct_numbers() {
        let sn = Arc::new(SnCounter::new(1, 1_000_000));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let sn = sn.clone();
                std::thread::spawn(move || (0..1000).map(|_| sn.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v));
            }
        }
        assert_eq!(all.len(), 4000);
    }
}
