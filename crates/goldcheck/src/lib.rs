//! # Goldcheck
//!
//! Command line tools for Llama-style checkpoints:
//! - **`logit-checker`**: runs golden cases through a model and fails when
//!   its logits drift from the recorded reference
//! - **`fuse-qkv`**: converts a checkpoint so every attention block carries
//!   one fused `qkv_proj` instead of separate q/k/v projections
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use goldcheck::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     goldcheck::init_logging();
//!
//!     let run = RunConfig::from_args(["max_target_length=4"])?;
//!     let model = Llama::load(&run.checkpoint_dir, run.dtype()?, &run.device()?)?;
//!     let checker = LogitChecker::from_config(&run, CheckConfig::default(), run.device()?);
//!     let cases = GoldenCaseLoader::new(run.golden_data_path()).cases()?;
//!
//!     println!("{}", checker.run(&model, cases)?);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Re-export core crate
pub use goldcheck_core::*;

use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Commonly used types.
pub mod prelude {
    pub use goldcheck_core::prelude::*;

    // Re-export useful external types
    pub use anyhow;
    pub use tracing;
}
