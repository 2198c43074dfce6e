//! Mergeable quantile sketch with a relative-error guarantee.
//!
//! Values are mapped to logarithmically sized buckets: with
//! `gamma = (1 + a) / (1 - a)`, bucket `i` covers `(gamma^(i-1), gamma^i]`
//! and any value in it is within relative error `a` of the bucket's
//! representative. Memory grows with the log of the value range, not with
//! the sample count.

use std::collections::BTreeMap;

/// Log-bucketed quantile sketch.
#[derive(Debug, Clone)]
pub struct QuantileSketch {
    relative_error: f64,
    gamma_ln: f64,
    positive: BTreeMap<i32, u64>,
    negative: BTreeMap<i32, u64>,
    zeros: u64,
    count: u64,
    min: f64,
    max: f64,
}

/// Values closer to zero than this land in the zero bucket.
const MIN_INDEXABLE: f64 = 1e-9;

impl QuantileSketch {
    /// Create a sketch with the given relative error, clamped to `0.0001 - 0.5`.
    pub fn new(relative_error: f64) -> Self {
        let relative_error = relative_error.clamp(0.0001, 0.5);
        let gamma = (1.0 + relative_error) / (1.0 - relative_error);
        Self {
            relative_error,
            gamma_ln: gamma.ln(),
            positive: BTreeMap::new(),
            negative: BTreeMap::new(),
            zeros: 0,
            count: 0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    pub fn relative_error(&self) -> f64 {
        self.relative_error
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Smallest sample seen, exact.
    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    /// Largest sample seen, exact.
    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }

    /// Add a sample. Non-finite values are ignored.
    pub fn insert(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if value > MIN_INDEXABLE {
            *self.positive.entry(self.index(value)).or_insert(0) += 1;
        } else if value < -MIN_INDEXABLE {
            *self.negative.entry(self.index(-value)).or_insert(0) += 1;
        } else {
            self.zeros += 1;
        }
        self.count += 1;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Fold another sketch into this one. Both must share a relative error.
    pub fn merge(&mut self, other: &QuantileSketch) {
        debug_assert!((self.relative_error - other.relative_error).abs() < f64::EPSILON);
        for (i, n) in &other.positive {
            *self.positive.entry(*i).or_insert(0) += n;
        }
        for (i, n) in &other.negative {
            *self.negative.entry(*i).or_insert(0) += n;
        }
        self.zeros += other.zeros;
        self.count += other.count;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Estimate the value at quantile `q` (0.0 - 1.0).
    ///
    /// Returns `None` for an empty sketch.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        let q = q.clamp(0.0, 1.0);
        let rank = (q * (self.count - 1) as f64).floor() as u64;

        let mut seen = 0u64;
        // Most negative values first: the largest negative index.
        for (i, n) in self.negative.iter().rev() {
            seen += n;
            if seen > rank {
                return Some(self.clamp(-self.value_of(*i)));
            }
        }
        seen += self.zeros;
        if seen > rank {
            return Some(self.clamp(0.0));
        }
        for (i, n) in &self.positive {
            seen += n;
            if seen > rank {
                return Some(self.clamp(self.value_of(*i)));
            }
        }
        Some(self.max)
    }

    fn index(&self, value: f64) -> i32 {
        (value.ln() / self.gamma_ln).ceil() as i32
    }

    fn value_of(&self, index: i32) -> f64 {
        let gamma = self.gamma_ln.exp();
        2.0 * gamma.powi(index) / (gamma + 1.0)
    }

    fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }
}
