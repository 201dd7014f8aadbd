//! Running min/max/sum accumulators.
//!
//! A minimum of zero means "unset": the first value always replaces it, and a
//! zero-valued sample puts the minimum back into the unset state. The
//! classifier consumes figures produced under this rule.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Accumulator exposing a running minimum and maximum.
pub trait RunningMinMax {
    fn min_max_mut(&mut self) -> (&mut u64, &mut u64);
}

/// Accumulator that also keeps a running sum.
pub trait RunningMinMaxSum: RunningMinMax {
    fn sum_mut(&mut self) -> &mut u64;
}

/// Fold `value` into the accumulator's min and max.
pub fn update_min_max<A: RunningMinMax + ?Sized>(acc: &mut A, value: u64) {
    let (min, max) = acc.min_max_mut();
    if *min == 0 || value < *min {
        *min = value;
    }
    if value > *max {
        *max = value;
    }
}

/// Fold `value` into the accumulator's min, max and sum.
pub fn update_min_max_sum<A: RunningMinMaxSum + ?Sized>(acc: &mut A, value: u64) {
    update_min_max(acc, value);
    let sum = acc.sum_mut();
    *sum = sum.saturating_add(value);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MinMax {
    pub min: u64,
    pub max: u64,
}

impl RunningMinMax for MinMax {
    fn min_max_mut(&mut self) -> (&mut u64, &mut u64) {
        (&mut self.min, &mut self.max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MinMaxSum {
    pub min: u64,
    pub max: u64,
    pub sum: u64,
}

impl RunningMinMax for MinMaxSum {
    fn min_max_mut(&mut self) -> (&mut u64, &mut u64) {
        (&mut self.min, &mut self.max)
    }
}

impl RunningMinMaxSum for MinMaxSum {
    fn sum_mut(&mut self) -> &mut u64 {
        &mut self.sum
    }
}

/// Lock-free storage for a [`MinMax`] living in a flow row.
///
/// Only the packet path writes it, so a load-modify-store is enough.
#[derive(Debug, Default)]
pub struct AtomicMinMax {
    min: AtomicU64,
    max: AtomicU64,
}

impl AtomicMinMax {
    pub fn load(&self) -> MinMax {
        MinMax {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self, value: MinMax) {
        self.min.store(value.min, Ordering::Relaxed);
        self.max.store(value.max, Ordering::Relaxed);
    }

    pub fn record(&self, value: u64) {
        let mut acc = self.load();
        update_min_max(&mut acc, value);
        self.store(acc);
    }

    pub fn clear(&self) {
        self.store(MinMax::default());
    }
}

/// Lock-free storage for a [`MinMaxSum`] living in a flow row.
#[derive(Debug, Default)]
pub struct AtomicMinMaxSum {
    min: AtomicU64,
    max: AtomicU64,
    sum: AtomicU64,
}

impl AtomicMinMaxSum {
    pub fn load(&self) -> MinMaxSum {
        MinMaxSum {
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
            sum: self.sum.load(Ordering::Relaxed),
        }
    }

    pub fn store(&self, value: MinMaxSum) {
        self.min.store(value.min, Ordering::Relaxed);
        self.max.store(value.max, Ordering::Relaxed);
        self.sum.store(value.sum, Ordering::Relaxed);
    }

    pub fn record(&self, value: u64) {
        let mut acc = self.load();
        update_min_max_sum(&mut acc, value);
        self.store(acc);
    }

    pub fn clear(&self) {
        self.store(MinMaxSum::default());
    }
}
