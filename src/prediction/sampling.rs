//! Cumulative-distribution sampling over weighted values.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// A value paired with its probability weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weighted<T> {
    pub value: T,
    pub weight: f64,
}

/// Weighted values whose weights always sum to 1.
///
/// Every mutation goes through a method that renormalizes afterwards, so
/// callers never observe an unnormalized distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedDistribution<T> {
    items: Vec<Weighted<T>>,
}

impl<T> Default for WeightedDistribution<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T> WeightedDistribution<T> {
    /// Build from `(value, weight)` pairs. Negative weights count as zero.
    pub fn new(pairs: impl IntoIterator<Item = (T, f64)>) -> Self {
        let mut dist = Self {
            items: pairs
                .into_iter()
                .map(|(value, weight)| Weighted {
                    value,
                    weight: weight.max(0.0),
                })
                .collect(),
        };
        dist.normalize();
        dist
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Weighted<T>> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Weighted<T>> {
        self.items.get(index)
    }

    /// Sum of all weights (1 for a non-empty distribution).
    pub fn total(&self) -> f64 {
        self.items.iter().map(|w| w.weight).sum()
    }

    /// Append a value and renormalize.
    pub fn push(&mut self, value: T, weight: f64) {
        self.items.push(Weighted {
            value,
            weight: weight.max(0.0),
        });
        self.normalize();
    }

    /// Replace one weight with `f(old)` and renormalize.
    pub fn adjust(&mut self, index: usize, f: impl FnOnce(f64) -> f64) {
        if let Some(item) = self.items.get_mut(index) {
            item.weight = f(item.weight).max(0.0);
            self.normalize();
        }
    }

    /// Pick the value whose cumulative weight first exceeds `u * total`.
    ///
    /// `u` is clamped to `[0, 1)`; the last item absorbs rounding error.
    pub fn sample_with(&self, u: f64) -> Option<(usize, &T)> {
        let last = self.items.len().checked_sub(1)?;
        let target = u.clamp(0.0, 1.0 - f64::EPSILON) * self.total();
        let mut cumulative = 0.0;
        for (i, item) in self.items.iter().enumerate() {
            cumulative += item.weight;
            if target < cumulative {
                return Some((i, &item.value));
            }
        }
        Some((last, &self.items[last].value))
    }

    /// Sample using a random number generator.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(usize, &T)> {
        self.sample_with(rng.r#gen::<f64>())
    }

    /// Scale weights to sum to 1. All-zero weights become uniform.
    fn normalize(&mut self) {
        if self.items.is_empty() {
            return;
        }
        let total = self.total();
        if total <= f64::EPSILON {
            let uniform = 1.0 / self.items.len() as f64;
            self.items.iter_mut().for_each(|w| w.weight = uniform);
        } else {
            self.items.iter_mut().for_each(|w| w.weight /= total);
        }
    }
}
