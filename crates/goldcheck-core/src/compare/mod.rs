//! Golden logit comparison.
//!
//! [`DivergenceChecker`] decides whether the logits a model produced for a
//! golden case are acceptably close to the reference. One of two metrics
//! decides the verdict:
//!
//! - **Closeness** (default): every element must satisfy
//!   `|model - golden| <= atol + rtol * |golden|`.
//! - **Divergence**: when `max_kl_div` is set, every position's KL divergence
//!   between the softmax distributions must be below it.
//!
//! Both metrics are computed and logged for every case regardless of which
//! one is active.

mod metrics;

pub use metrics::{closeness, is_close, kl_divergence_per_position, Closeness};

use crate::error::{GoldcheckError, Result};
use candle_core::{DType, Tensor};
use std::fmt;
use tracing::{debug, info};

/// Thresholds for a check run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckConfig {
    /// Absolute tolerance for closeness mode.
    pub atol: f32,
    /// Relative tolerance for closeness mode.
    pub rtol: f32,
    /// Compare only the first `token_size` positions.
    pub token_size: Option<usize>,
    /// KL threshold; setting it switches to divergence mode.
    pub max_kl_div: Option<f32>,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            atol: 0.1,
            rtol: 0.1,
            token_size: None,
            max_kl_div: None,
        }
    }
}

impl CheckConfig {
    /// The metric that decides the verdict.
    pub fn mode(&self) -> CheckMode {
        match self.max_kl_div {
            Some(max_kl_div) => CheckMode::Divergence { max_kl_div },
            None => CheckMode::Closeness {
                atol: self.atol,
                rtol: self.rtol,
            },
        }
    }
}

/// The metric a check is decided by.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckMode {
    /// Elementwise closeness of raw logits.
    Closeness {
        /// Absolute tolerance.
        atol: f32,
        /// Relative tolerance.
        rtol: f32,
    },
    /// Per-position KL divergence of softmax distributions.
    Divergence {
        /// Every position must stay strictly below this value.
        max_kl_div: f32,
    },
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closeness { atol, rtol } => write!(f, "closeness (rtol={}, atol={})", rtol, atol),
            Self::Divergence { max_kl_div } => write!(f, "kl divergence (max={})", max_kl_div),
        }
    }
}

/// Result of comparing one case.
#[derive(Debug, Clone, PartialEq)]
pub struct ComparisonResult {
    /// Metric that decided `passed`.
    pub mode: CheckMode,
    /// Number of positions compared.
    pub token_size: usize,
    /// Largest `|model - golden|` over the compared positions.
    pub max_abs_difference: f32,
    /// Elements outside the closeness tolerance, reported in both modes.
    pub closeness_violations: usize,
    /// KL divergence of each compared position.
    pub kl_divergence_per_position: Vec<f32>,
    /// Verdict under `mode`.
    pub passed: bool,
}

impl ComparisonResult {
    /// Largest per-position KL divergence.
    pub fn max_kl_divergence(&self) -> f32 {
        self.kl_divergence_per_position
            .iter()
            .copied()
            .fold(0.0f32, |acc, v| if v.is_nan() || v > acc { v } else { acc })
    }

    /// Turn a failed verdict into [`GoldcheckError::CheckFailed`].
    pub fn ensure_passed(self) -> Result<Self> {
        if self.passed {
            return Ok(self);
        }
        let message = match self.mode {
            CheckMode::Closeness { atol, rtol } => format!(
                "Logits do not match closely enough. Required rtol={}, atol={}. \
                 Max difference: {} ({} elements out of tolerance)",
                rtol, atol, self.max_abs_difference, self.closeness_violations
            ),
            CheckMode::Divergence { max_kl_div } => format!(
                "KL divergence values exceed the specified threshold of {}. Max divergence: {}",
                max_kl_div,
                self.max_kl_divergence()
            ),
        };
        Err(GoldcheckError::CheckFailed(message))
    }
}

impl fmt::Display for ComparisonResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "[{}] {} over {} positions: max |diff| = {}, max KL = {}",
            status,
            self.mode,
            self.token_size,
            self.max_abs_difference,
            self.max_kl_divergence()
        )
    }
}

/// Compares model logits against golden logits.
#[derive(Debug, Clone, Default)]
pub struct DivergenceChecker {
    config: CheckConfig,
}

impl DivergenceChecker {
    /// Create a checker.
    pub fn new(config: CheckConfig) -> Self {
        Self { config }
    }

    /// Thresholds in use.
    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    /// Metric that decides verdicts.
    pub fn mode(&self) -> CheckMode {
        self.config.mode()
    }

    /// Compare and return the result, passing or not.
    ///
    /// # Arguments
    ///
    /// * `golden` - Reference logits [seq_len, vocab]
    /// * `model` - Model logits [batch, seq_len, vocab] (row 0 is compared)
    ///   or [seq_len, vocab]
    pub fn compare(&self, golden: &Tensor, model: &Tensor) -> Result<ComparisonResult> {
        let model = match model.rank() {
            3 => model.get(0)?,
            2 => model.clone(),
            rank => {
                return Err(GoldcheckError::ShapeMismatch(format!(
                    "model logits must be rank 2 or 3, got rank {} {:?}",
                    rank,
                    model.dims()
                )))
            }
        };
        if golden.rank() != 2 {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "golden logits must be rank 2, got {:?}",
                golden.dims()
            )));
        }

        let (golden_len, golden_vocab) = golden.dims2()?;
        let (model_len, model_vocab) = model.dims2()?;
        if golden_vocab != model_vocab {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "vocabulary size differs: golden {}, model {}",
                golden_vocab, model_vocab
            )));
        }

        let token_size = self.config.token_size.unwrap_or(golden_len);
        if token_size == 0 || token_size > golden_len || token_size > model_len {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "token_size {} out of range: golden has {} positions, model has {}",
                token_size, golden_len, model_len
            )));
        }

        let golden = golden.narrow(0, 0, token_size)?.to_dtype(DType::F32)?;
        let model = model.narrow(0, 0, token_size)?.to_dtype(DType::F32)?;

        let golden_flat: Vec<f32> = golden.flatten_all()?.to_vec1()?;
        let model_flat: Vec<f32> = model.flatten_all()?.to_vec1()?;
        debug!(
            golden_first = ?&golden_flat[..golden_vocab.min(8)],
            model_first = ?&model_flat[..model_vocab.min(8)],
            "first position logits"
        );

        let mode = self.mode();
        let (atol, rtol) = match mode {
            CheckMode::Closeness { atol, rtol } => (atol, rtol),
            CheckMode::Divergence { .. } => (self.config.atol, self.config.rtol),
        };
        let close = closeness(&model_flat, &golden_flat, atol, rtol);
        let kl = kl_divergence_per_position(&golden, &model)?;

        let mut result = ComparisonResult {
            mode,
            token_size,
            max_abs_difference: close.max_abs_difference,
            closeness_violations: close.violations,
            kl_divergence_per_position: kl,
            passed: false,
        };
        result.passed = match mode {
            CheckMode::Closeness { .. } => close.all_close(),
            CheckMode::Divergence { max_kl_div } => result
                .kl_divergence_per_position
                .iter()
                .all(|&v| v < max_kl_div),
        };

        info!(
            max_abs_difference = result.max_abs_difference,
            max_kl_divergence = result.max_kl_divergence(),
            kl_divergence = ?result.kl_divergence_per_position,
            passed = result.passed,
            "compared {} positions by {}",
            token_size,
            mode
        );

        Ok(result)
    }

    /// Compare and fail with [`GoldcheckError::CheckFailed`] on a bad verdict.
    pub fn check(&self, golden: &Tensor, model: &Tensor) -> Result<ComparisonResult> {
        self.compare(golden, model)?.ensure_passed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn golden() -> Tensor {
        Tensor::new(
            &[[1.0f32, 2.0, 3.0, 4.0], [0.5, 0.25, -1.0, 2.0], [3.0, 1.0, 0.0, -2.0]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn from_rows(rows: Vec<Vec<f32>>) -> Tensor {
        let cols = rows[0].len();
        let n = rows.len();
        Tensor::from_vec(rows.concat(), (n, cols), &Device::Cpu).unwrap()
    }

    fn checker(config: CheckConfig) -> DivergenceChecker {
        DivergenceChecker::new(config)
    }

    #[test]
    fn default_is_closeness() {
        let config = CheckConfig::default();
        assert_eq!(config.mode(), CheckMode::Closeness { atol: 0.1, rtol: 0.1 });
    }

    #[test]
    fn divergence_takes_precedence() {
        let config = CheckConfig {
            atol: 0.0,
            rtol: 0.0,
            max_kl_div: Some(0.5),
            ..CheckConfig::default()
        };
        assert_eq!(config.mode(), CheckMode::Divergence { max_kl_div: 0.5 });

        // A uniform shift breaks closeness at atol=rtol=0 but leaves the
        // softmax untouched, so divergence mode still passes.
        let model = (golden() + 3.0).unwrap();
        let result = checker(config).check(&golden(), &model).unwrap();
        assert!(result.passed);
        assert!(result.closeness_violations > 0);
    }

    #[test]
    fn identical_passes_with_zero_tolerance() {
        let config = CheckConfig {
            atol: 0.0,
            rtol: 0.0,
            ..CheckConfig::default()
        };
        let result = checker(config).check(&golden(), &golden()).unwrap();
        assert!(result.passed);
        assert_eq!(result.max_abs_difference, 0.0);
        assert_eq!(result.token_size, 3);
    }

    #[test]
    fn identical_kl_is_zero() {
        let config = CheckConfig {
            max_kl_div: Some(1e-3),
            ..CheckConfig::default()
        };
        let result = checker(config).check(&golden(), &golden()).unwrap();
        assert_eq!(result.kl_divergence_per_position.len(), 3);
        for kl in &result.kl_divergence_per_position {
            assert!(kl.abs() < 1e-6);
        }
    }

    #[test]
    fn single_perturbation_fails() {
        let mut values: Vec<Vec<f32>> = golden().to_vec2().unwrap();
        // tolerance at 4.0 is 0.1 + 0.1 * 4.0 = 0.5
        values[0][3] += 0.6;
        let model = from_rows(values);

        let err = checker(CheckConfig::default())
            .check(&golden(), &model)
            .unwrap_err();
        assert!(err.is_check_failure());
        let message = err.to_string();
        assert!(message.contains("rtol=0.1"), "{}", message);
        assert!(message.contains("atol=0.1"), "{}", message);
    }

    #[test]
    fn perturbation_within_tolerance_passes() {
        let mut values: Vec<Vec<f32>> = golden().to_vec2().unwrap();
        values[0][3] += 0.4;
        let model = from_rows(values);

        let result = checker(CheckConfig::default()).check(&golden(), &model).unwrap();
        assert!(result.passed);
    }

    #[test]
    fn batched_model_uses_first_row() {
        let row = golden().unsqueeze(0).unwrap();
        let garbage = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let model = Tensor::cat(&[&row, &garbage], 0).unwrap();

        let result = checker(CheckConfig::default()).compare(&golden(), &model).unwrap();
        assert!(result.passed);
    }

    #[test]
    fn token_size_prefix() {
        let mut values: Vec<Vec<f32>> = golden().to_vec2().unwrap();
        values[2][0] += 100.0;
        let model = from_rows(values);

        let config = CheckConfig {
            token_size: Some(2),
            ..CheckConfig::default()
        };
        let result = checker(config).check(&golden(), &model).unwrap();
        assert_eq!(result.token_size, 2);
        assert_eq!(result.kl_divergence_per_position.len(), 2);

        assert!(checker(CheckConfig::default()).check(&golden(), &model).is_err());
    }

    #[test]
    fn token_size_out_of_range() {
        let config = CheckConfig {
            token_size: Some(4),
            ..CheckConfig::default()
        };
        let result = checker(config).compare(&golden(), &golden());
        assert!(matches!(result, Err(GoldcheckError::ShapeMismatch(_))));
    }

    #[test]
    fn vocab_mismatch_rejected() {
        let model = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        let result = checker(CheckConfig::default()).compare(&golden(), &model);
        assert!(matches!(result, Err(GoldcheckError::ShapeMismatch(_))));
    }

    #[test]
    fn nan_logits_fail() {
        let mut values: Vec<Vec<f32>> = golden().to_vec2().unwrap();
        values[1][1] = f32::NAN;
        let with_nan = from_rows(values);

        let result = checker(CheckConfig::default())
            .compare(&with_nan, &with_nan)
            .unwrap();
        assert!(!result.passed);
    }

    #[test]
    fn kl_threshold_is_strict() {
        let config = CheckConfig {
            max_kl_div: Some(0.0),
            ..CheckConfig::default()
        };
        let err = checker(config).check(&golden(), &golden()).unwrap_err();
        assert!(err.to_string().contains("threshold of 0"));
    }

    #[test]
    fn uniform_offset_fails_with_large_difference() {
        // "I love to" -> [1, 2, 3]; model returns golden + 1.0 everywhere
        let model = (golden() + 1.0).unwrap();
        let err = checker(CheckConfig::default())
            .check(&golden(), &model)
            .unwrap_err();
        assert!(err.is_check_failure());

        let result = checker(CheckConfig::default()).compare(&golden(), &model).unwrap();
        assert!(result.max_abs_difference >= 1.0 - 1e-6);
        assert!(result.to_string().starts_with("[FAIL]"));
    }
}
