// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::Mutex;

/// Non-cryptographic random number source used for retry jitter.
///
/// Not suitable for anything security-related.
#[derive(Clone, Default)]
pub(crate) enum Rnd {
    #[default]
    Real,

    Seeded(Arc<Mutex<fastrand::Rng>>),

    #[cfg(test)]
    Fixed(f64),
}

impl Debug for Rnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "Real"),
            Self::Seeded(_) => write!(f, "Seeded"),
            #[cfg(test)]
            Self::Fixed(value) => write!(f, "Fixed({value})"),
        }
    }
}

impl Rnd {
    pub fn new_seeded(seed: u64) -> Self {
        Self::Seeded(Arc::new(Mutex::new(fastrand::Rng::with_seed(seed))))
    }

    /// Returns a value in `[0, 1)`.
    pub fn next_f64(&self) -> f64 {
        match self {
            Self::Real => fastrand::f64(),
            Self::Seeded(rng) => rng.lock().f64(),
            #[cfg(test)]
            Self::Fixed(value) => *value,
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_is_in_range() {
        let value = Rnd::Real.next_f64();
        assert!((0.0..1.0).contains(&value));
    }

    #[test]
    fn same_seed_same_sequence() {
        let a = Rnd::new_seeded(7);
        let b = Rnd::new_seeded(7);

        for _ in 0..10 {
            assert!((a.next_f64() - b.next_f64()).abs() < f64::EPSILON);
        }
    }

    #[test]
    fn clones_share_sequence() {
        let a = Rnd::new_seeded(7);
        let b = a.clone();
        let reference = Rnd::new_seeded(7);

        let first = reference.next_f64();
        let second = reference.next_f64();

        assert!((a.next_f64() - first).abs() < f64::EPSILON);
        assert!((b.next_f64() - second).abs() < f64::EPSILON);
    }

    #[test]
    fn debug_names_variant() {
        assert_eq!(format!("{:?}", Rnd::Real), "Real");
        assert_eq!(format!("{:?}", Rnd::new_seeded(1)), "Seeded");
        assert_eq!(format!("{:?}", Rnd::Fixed(0.5)), "Fixed(0.5)");
    }
}
