//! Record golden logits from a trusted model run.
//!
//! Runs each prompt's token ids through the model once and writes the
//! resulting logits as a golden case, one JSON line per prompt. The output
//! can be checked later with `logit-checker`.
//!
//! Usage:
//!    cargo run -p goldcheck-core --example export_golden -- \
//!        <checkpoint_dir> <output.jsonl> [prompts.json]
//!
//! `prompts.json` is a list of `{"prompt": "...", "tokens": [..]}` objects.
//! Without it, a tiny random model and a single built-in prompt are used.

use candle_core::{DType, Device};
use goldcheck_core::golden::{BatchInputBuilder, GoldenCase, GoldenCaseWriter};
use goldcheck_core::model::{CausalLm, Llama, ModelConfig};
use serde::Deserialize;
use std::path::Path;

/// Prompt as stored in JSON.
#[derive(Debug, Deserialize)]
struct Prompt {
    prompt: String,
    tokens: Vec<u32>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!("Usage: export_golden <checkpoint_dir|random> <output.jsonl> [prompts.json]");
        std::process::exit(1);
    }

    let device = Device::Cpu;
    let model = if args[1] == "random" {
        Llama::random(ModelConfig::tiny(), &device)?
    } else {
        Llama::load(Path::new(&args[1]), DType::F32, &device)?
    };

    let prompts: Vec<Prompt> = match args.get(3) {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => vec![Prompt {
            prompt: "I love to".to_string(),
            tokens: vec![1, 306, 5360, 304],
        }],
    };

    let mut writer = GoldenCaseWriter::create(Path::new(&args[2]))?;
    for prompt in prompts {
        let tokens: Vec<u32> = prompt
            .tokens
            .iter()
            .map(|&t| t % model.vocab_size() as u32)
            .collect();
        let placeholder = GoldenCase::new(prompt.prompt.clone(), tokens.clone(), Vec::new());
        let input = BatchInputBuilder::new(1, tokens.len(), device.clone()).build(&placeholder)?;

        let logits: Vec<Vec<f32>> = model.forward(&input)?.get(0)?.to_vec2()?;
        println!("{:?}: {} positions x {} logits", prompt.prompt, logits.len(), model.vocab_size());
        writer.write(&GoldenCase::new(prompt.prompt, tokens, logits))?;
    }

    let written = writer.written();
    writer.finish()?;
    println!("Wrote {} golden cases to {}", written, args[2]);
    Ok(())
}
