//! Golden logit checking, end to end.
//!
//! For every case, in file order: build the batch, run one forward pass,
//! compare against the golden logits. The first failing case ends the run.

use crate::compare::{CheckConfig, ComparisonResult, DivergenceChecker};
use crate::config::RunConfig;
use crate::error::Result;
use crate::golden::{BatchInputBuilder, GoldenCase};
use crate::model::CausalLm;
use crate::runner::{ForwardBackend, ForwardRunner};
use candle_core::Device;
use std::fmt;
use std::time::Instant;
use tracing::info;

/// Outcome of one golden case.
#[derive(Debug, Clone)]
pub struct CaseReport {
    /// Prompt the case was recorded from.
    pub prompt: String,
    /// Comparison metrics and verdict.
    pub result: ComparisonResult,
    /// Forward plus comparison time in milliseconds.
    pub time_ms: f64,
}

impl fmt::Display for CaseReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} ({:.1}ms)", self.prompt, self.result, self.time_ms)
    }
}

/// Summary of a completed run. Only produced when every case passed.
#[derive(Debug, Clone, Default)]
pub struct CheckSummary {
    /// Per-case reports in evaluation order.
    pub reports: Vec<CaseReport>,
    /// Total execution time in milliseconds.
    pub total_time_ms: f64,
}

impl CheckSummary {
    /// Number of cases checked.
    pub fn total(&self) -> usize {
        self.reports.len()
    }

    /// Largest absolute logit difference over all cases.
    pub fn max_abs_difference(&self) -> f32 {
        self.reports
            .iter()
            .map(|r| r.result.max_abs_difference)
            .fold(0.0, f32::max)
    }

    /// Largest per-position KL divergence over all cases.
    pub fn max_kl_divergence(&self) -> f32 {
        self.reports
            .iter()
            .map(|r| r.result.max_kl_divergence())
            .fold(0.0, f32::max)
    }
}

impl fmt::Display for CheckSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Logit Check Summary")?;
        writeln!(f, "===================")?;
        writeln!(f, "Cases:     {}", self.total())?;
        writeln!(f, "Max |diff|: {}", self.max_abs_difference())?;
        writeln!(f, "Max KL:    {}", self.max_kl_divergence())?;
        writeln!(f, "Time:      {:.1}ms", self.total_time_ms)?;
        for report in &self.reports {
            writeln!(f, "  - {}", report)?;
        }
        Ok(())
    }
}

/// Runs golden cases through a model and checks the logits.
pub struct LogitChecker<B> {
    builder: BatchInputBuilder,
    runner: ForwardRunner<B>,
    checker: DivergenceChecker,
}

impl LogitChecker<Box<dyn ForwardBackend>> {
    /// Wire the stages from a run configuration.
    pub fn from_config(run: &RunConfig, check: CheckConfig, device: Device) -> Self {
        Self::new(
            BatchInputBuilder::from_config(run, device),
            ForwardRunner::for_shards(run.num_shards),
            DivergenceChecker::new(check),
        )
    }
}

impl<B: ForwardBackend> LogitChecker<B> {
    /// Create a checker from its stages.
    pub fn new(
        builder: BatchInputBuilder,
        runner: ForwardRunner<B>,
        checker: DivergenceChecker,
    ) -> Self {
        Self {
            builder,
            runner,
            checker,
        }
    }

    /// Check one case; a failed verdict is an error.
    pub fn check_case(&self, model: &dyn CausalLm, case: &GoldenCase) -> Result<CaseReport> {
        let start = Instant::now();
        info!(
            prompt = %case.prompt,
            tokens = ?case.tokens,
            golden_shape = ?(case.seq_len(), case.vocab_size()),
            "Checking golden case"
        );

        let input = self.builder.build(case)?;
        let logits = self.runner.run(model, &input)?;
        let golden = case.logits_tensor(input.device())?;
        let result = self.checker.check(&golden, &logits)?;

        Ok(CaseReport {
            prompt: case.prompt.clone(),
            result,
            time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    /// Check every case in order, stopping at the first error or failure.
    pub fn run<I>(&self, model: &dyn CausalLm, cases: I) -> Result<CheckSummary>
    where
        I: IntoIterator<Item = Result<GoldenCase>>,
    {
        let start = Instant::now();
        let mut reports = Vec::new();
        for case in cases {
            let report = self.check_case(model, &case?)?;
            info!("{}", report);
            reports.push(report);
        }

        Ok(CheckSummary {
            reports,
            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GoldcheckError;
    use crate::golden::{BatchedInput, GoldenCaseLoader, GoldenCaseWriter};
    use crate::runner::{LocalBackend, ShardedBackend};
    use candle_core::{DType, Tensor};

    /// Fixed logits L[position][vocab] regardless of tokens, plus an offset.
    struct FixedModel {
        logits: Vec<Vec<f32>>,
        offset: f32,
    }

    impl FixedModel {
        fn golden() -> Vec<Vec<f32>> {
            vec![
                vec![0.1, 2.0, -1.0, 0.5],
                vec![1.5, 0.0, 0.25, -0.75],
                vec![-2.0, 3.0, 1.0, 0.0],
            ]
        }
    }

    impl CausalLm for FixedModel {
        fn forward(&self, input: &BatchedInput) -> crate::error::Result<Tensor> {
            let (batch, seq_len) = input.ids.dims2()?;
            let flat: Vec<f32> = self.logits.iter().flatten().map(|v| v + self.offset).collect();
            let row = Tensor::from_vec(flat, (1, seq_len, self.vocab_size()), input.device())?;
            Ok(row.repeat((batch, 1, 1))?.to_dtype(DType::F32)?)
        }

        fn vocab_size(&self) -> usize {
            self.logits[0].len()
        }
    }

    fn case() -> GoldenCase {
        GoldenCase::new("I love to", vec![1, 2, 3], FixedModel::golden())
    }

    fn checker(batch: usize, check: CheckConfig) -> LogitChecker<LocalBackend> {
        LogitChecker::new(
            BatchInputBuilder::new(batch, 3, Device::Cpu),
            ForwardRunner::new(LocalBackend),
            DivergenceChecker::new(check),
        )
    }

    #[test]
    fn matching_model_passes() {
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 0.0,
        };
        let summary = checker(4, CheckConfig::default())
            .run(&model, vec![Ok(case()), Ok(case())])
            .unwrap();

        assert_eq!(summary.total(), 2);
        assert_eq!(summary.max_abs_difference(), 0.0);
        assert!(summary.reports.iter().all(|r| r.result.passed));
        assert!(summary.to_string().contains("Cases:     2"));
    }

    #[test]
    fn shifted_logits_fail_closeness() {
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 1.0,
        };
        let err = checker(2, CheckConfig::default())
            .run(&model, vec![Ok(case())])
            .unwrap_err();

        match err {
            GoldcheckError::CheckFailed(message) => {
                assert!(message.contains("Max difference: 1"), "{}", message)
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn shifted_logits_pass_divergence() {
        // A constant shift leaves the softmax unchanged
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 1.0,
        };
        let config = CheckConfig {
            max_kl_div: Some(1e-4),
            ..CheckConfig::default()
        };
        let summary = checker(2, config).run(&model, vec![Ok(case())]).unwrap();
        assert!(summary.max_kl_divergence() < 1e-4);
        assert!(summary.max_abs_difference() >= 1.0 - 1e-6);
    }

    #[test]
    fn stops_at_first_failure() {
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 0.0,
        };
        let bad = GoldenCase::new("short", vec![1, 2], vec![vec![0.0; 4]; 2]);
        let result = checker(1, CheckConfig::default()).run(
            &model,
            vec![
                Ok(case()),
                Ok(bad),
                Err(GoldcheckError::data_format(3, "never read")),
            ],
        );
        assert!(matches!(result, Err(GoldcheckError::ShapeMismatch(_))));
    }

    #[test]
    fn loader_errors_end_the_run() {
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 0.0,
        };
        let result = checker(1, CheckConfig::default())
            .run(&model, vec![Err(GoldcheckError::data_format(1, "bad json"))]);
        assert!(matches!(result, Err(GoldcheckError::DataFormat { line: 1, .. })));
    }

    #[test]
    fn golden_file_through_sharded_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("golden_data_fixed.jsonl");
        let mut writer = GoldenCaseWriter::create(&path).unwrap();
        writer.write(&case()).unwrap();
        writer.write(&case()).unwrap();
        writer.finish().unwrap();

        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 0.0,
        };
        let checker = LogitChecker::new(
            BatchInputBuilder::new(5, 3, Device::Cpu),
            ForwardRunner::new(ShardedBackend::new(2)),
            DivergenceChecker::new(CheckConfig::default()),
        );
        let summary = checker
            .run(&model, GoldenCaseLoader::new(&path).cases().unwrap())
            .unwrap();
        assert_eq!(summary.total(), 2);
    }

    #[test]
    fn from_config_uses_global_batch() {
        let run = RunConfig {
            per_device_batch_size: 2,
            num_shards: 2,
            max_target_length: 3,
            ..RunConfig::default()
        };
        let model = FixedModel {
            logits: FixedModel::golden(),
            offset: 0.0,
        };
        let checker = LogitChecker::from_config(&run, CheckConfig::default(), Device::Cpu);
        let report = checker.check_case(&model, &case()).unwrap();
        assert!(report.result.passed);
    }
}
