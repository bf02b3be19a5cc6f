//! Check a model's logits against recorded golden logits.
//!
//! ```text
//! logit-checker [--atol 0.1] [--rtol 0.1] [--token_size N] [--max_kl_div X] \
//!     [run.json] [key=value ...]
//! ```
//!
//! Exits non-zero when any case fails or any error occurs.

use anyhow::Context;
use clap::Parser;
use goldcheck::prelude::*;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "logit-checker")]
#[command(about = "Compare model logits against golden reference logits", long_about = None)]
#[command(version)]
struct Cli {
    /// Absolute tolerance for the closeness check
    #[arg(long, default_value_t = 0.1)]
    atol: f32,

    /// Relative tolerance for the closeness check
    #[arg(long, default_value_t = 0.1)]
    rtol: f32,

    /// Compare only the first N positions
    #[arg(long = "token_size")]
    token_size: Option<usize>,

    /// KL divergence threshold; switches to the divergence check
    #[arg(long = "max_kl_div")]
    max_kl_div: Option<f32>,

    /// Run config file and `key=value` overrides. Flags may appear before,
    /// between or after them.
    config_args: Vec<String>,
}

impl Cli {
    fn check_config(&self) -> CheckConfig {
        CheckConfig {
            atol: self.atol,
            rtol: self.rtol,
            token_size: self.token_size,
            max_kl_div: self.max_kl_div,
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<CheckSummary> {
    let run = RunConfig::from_args(&cli.config_args).context("invalid run configuration")?;
    let device = run.device()?;
    let dtype = run.dtype()?;
    info!(
        model = %run.model_name,
        checkpoint = %run.checkpoint_dir.display(),
        mode = %cli.check_config().mode(),
        "Starting logit check"
    );

    let model = Llama::load(&run.checkpoint_dir, dtype, &device)
        .with_context(|| format!("failed to load {}", run.checkpoint_dir.display()))?;
    let golden_path = run.golden_data_path();
    let cases = GoldenCaseLoader::new(&golden_path)
        .cases()
        .with_context(|| format!("failed to open {}", golden_path.display()))?;

    let checker = LogitChecker::from_config(&run, cli.check_config(), device);
    Ok(checker.run(&model, cases)?)
}

fn main() {
    goldcheck::init_logging();
    let cli = Cli::parse();

    match run(&cli) {
        Ok(summary) => println!("{}", summary),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_passthrough() {
        let cli = Cli::try_parse_from([
            "logit-checker",
            "--atol",
            "0.5",
            "--token_size",
            "2",
            "run.json",
            "num_shards=2",
        ])
        .unwrap();

        assert_eq!(cli.atol, 0.5);
        assert_eq!(cli.rtol, 0.1);
        assert_eq!(cli.token_size, Some(2));
        assert_eq!(cli.config_args, vec!["run.json", "num_shards=2"]);
        assert!(matches!(cli.check_config().mode(), CheckMode::Closeness { .. }));
    }

    #[test]
    fn flags_after_config_args() {
        let cli = Cli::try_parse_from([
            "logit-checker",
            "run.json",
            "model_name=llama3-8b",
            "--max_kl_div=0.015",
            "num_shards=2",
            "--token_size",
            "4",
        ])
        .unwrap();

        assert_eq!(cli.max_kl_div, Some(0.015));
        assert_eq!(cli.token_size, Some(4));
        assert_eq!(
            cli.config_args,
            vec!["run.json", "model_name=llama3-8b", "num_shards=2"]
        );

        let run = RunConfig::from_args(&cli.config_args[1..]).unwrap();
        assert_eq!(run.model_name, "llama3-8b");
        assert_eq!(run.num_shards, 2);
    }

    #[test]
    fn kl_threshold_selects_divergence() {
        let cli = Cli::try_parse_from(["logit-checker", "--max_kl_div", "0.01"]).unwrap();
        assert_eq!(
            cli.check_config().mode(),
            CheckMode::Divergence { max_kl_div: 0.01 }
        );
    }
}
