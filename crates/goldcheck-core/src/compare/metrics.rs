//! Elementwise closeness and per-position KL divergence.

use crate::error::Result;
use candle_core::{DType, Tensor, D};

/// Elementwise closeness test: `|actual - expected| <= atol + rtol * |expected|`.
///
/// NaN is never close to anything, itself included. Infinities are close
/// only to an infinity of the same sign.
pub fn is_close(actual: f32, expected: f32, atol: f32, rtol: f32) -> bool {
    if actual.is_nan() || expected.is_nan() {
        return false;
    }
    if actual.is_infinite() || expected.is_infinite() {
        return actual == expected;
    }
    (actual - expected).abs() <= atol + rtol * expected.abs()
}

/// Outcome of an elementwise closeness scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Closeness {
    /// Largest finite `|actual - expected|`; NaN when any element is NaN.
    pub max_abs_difference: f32,
    /// Number of elements that are not close.
    pub violations: usize,
    /// Flat index of the first element that is not close.
    pub first_violation: Option<usize>,
}

impl Closeness {
    /// Whether every element was close.
    pub fn all_close(&self) -> bool {
        self.violations == 0
    }
}

/// Scan two equally sized slices for elements that are not close.
pub fn closeness(actual: &[f32], expected: &[f32], atol: f32, rtol: f32) -> Closeness {
    debug_assert_eq!(actual.len(), expected.len());

    let mut max_abs_difference = 0.0f32;
    let mut saw_nan = false;
    let mut violations = 0;
    let mut first_violation = None;

    for (i, (&a, &e)) in actual.iter().zip(expected.iter()).enumerate() {
        let diff = (a - e).abs();
        if diff.is_nan() {
            saw_nan |= a.is_nan() || e.is_nan();
        } else if diff > max_abs_difference {
            max_abs_difference = diff;
        }

        if !is_close(a, e, atol, rtol) {
            violations += 1;
            first_violation.get_or_insert(i);
        }
    }

    Closeness {
        max_abs_difference: if saw_nan { f32::NAN } else { max_abs_difference },
        violations,
        first_violation,
    }
}

/// KL divergence `sum(p * ln(p / q))` per row, with `p = softmax(reference)`
/// and `q = softmax(candidate)` over the last axis.
///
/// Both inputs are [positions, vocab]. Computed through log-softmax so that
/// probabilities which underflow to zero contribute zero instead of NaN.
pub fn kl_divergence_per_position(reference: &Tensor, candidate: &Tensor) -> Result<Vec<f32>> {
    let log_p = candle_nn::ops::log_softmax(&reference.to_dtype(DType::F32)?, D::Minus1)?;
    let log_q = candle_nn::ops::log_softmax(&candidate.to_dtype(DType::F32)?, D::Minus1)?;
    let p = log_p.exp()?;

    let kl = (p * (log_p - log_q)?)?.sum(D::Minus1)?;
    Ok(kl.to_vec1()?)
}
