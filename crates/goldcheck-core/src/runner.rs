//! Forward execution and shard gathering.
//!
//! A [`ForwardBackend`] evaluates a model over a whole batch and always
//! hands back one tensor, however the work was split:
//! - [`LocalBackend`] - one forward call over the whole batch
//! - [`ShardedBackend`] - contiguous row shards on scoped worker threads,
//!   gathered back in order along the batch axis

use crate::error::{GoldcheckError, Result};
use crate::golden::BatchedInput;
use crate::model::CausalLm;
use candle_core::Tensor;
use parking_lot::Mutex;
use tracing::debug;

/// Executes one forward evaluation and returns the gathered logits.
pub trait ForwardBackend: Send + Sync {
    /// Evaluate `model` on `input`.
    ///
    /// Returns logits [batch, seq_len, vocab_size] in input row order.
    fn evaluate(&self, model: &dyn CausalLm, input: &BatchedInput) -> Result<Tensor>;

    /// Backend name (for logging).
    fn name(&self) -> &'static str;
}

/// Evaluates the whole batch with a single forward call.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalBackend;

impl ForwardBackend for LocalBackend {
    fn evaluate(&self, model: &dyn CausalLm, input: &BatchedInput) -> Result<Tensor> {
        model.forward(input)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

/// Splits the batch into contiguous row shards evaluated concurrently.
#[derive(Debug, Clone, Copy)]
pub struct ShardedBackend {
    num_shards: usize,
}

impl ShardedBackend {
    /// Create a backend with `num_shards` workers (at least one).
    pub fn new(num_shards: usize) -> Self {
        Self {
            num_shards: num_shards.max(1),
        }
    }

    /// Number of workers.
    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// `(start, len)` row ranges; earlier shards take the remainder rows.
    /// Empty shards are dropped.
    pub fn shard_ranges(&self, batch_size: usize) -> Vec<(usize, usize)> {
        let base = batch_size / self.num_shards;
        let extra = batch_size % self.num_shards;

        let mut ranges = Vec::with_capacity(self.num_shards);
        let mut start = 0;
        for shard in 0..self.num_shards {
            let len = base + usize::from(shard < extra);
            if len > 0 {
                ranges.push((start, len));
            }
            start += len;
        }
        ranges
    }
}

impl ForwardBackend for ShardedBackend {
    fn evaluate(&self, model: &dyn CausalLm, input: &BatchedInput) -> Result<Tensor> {
        let ranges = self.shard_ranges(input.batch_size());
        if ranges.len() <= 1 {
            return model.forward(input);
        }

        let results: Mutex<Vec<Option<Result<Tensor>>>> =
            Mutex::new((0..ranges.len()).map(|_| None).collect());

        std::thread::scope(|scope| {
            for (shard, &(start, len)) in ranges.iter().enumerate() {
                let results = &results;
                scope.spawn(move || {
                    debug!(shard, start, len, "Evaluating shard");
                    let output = input
                        .narrow_batch(start, len)
                        .and_then(|rows| model.forward(&rows));
                    results.lock()[shard] = Some(output);
                });
            }
        });

        let mut outputs = Vec::with_capacity(ranges.len());
        for (shard, output) in results.into_inner().into_iter().enumerate() {
            match output {
                Some(tensor) => outputs.push(tensor?),
                None => {
                    return Err(GoldcheckError::ModelError(format!(
                        "shard {} produced no output",
                        shard
                    )))
                }
            }
        }

        Ok(Tensor::cat(&outputs, 0)?)
    }

    fn name(&self) -> &'static str {
        "sharded"
    }
}

/// Runs a model through a backend and checks the gathered shape.
#[derive(Debug, Clone)]
pub struct ForwardRunner<B> {
    backend: B,
}

impl<B: ForwardBackend> ForwardRunner<B> {
    /// Create a runner over `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// The backend in use.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// One forward evaluation; the result is `[batch, seq_len, vocab]`.
    pub fn run(&self, model: &dyn CausalLm, input: &BatchedInput) -> Result<Tensor> {
        let logits = self.backend.evaluate(model, input)?;

        let expected = [input.batch_size(), input.seq_len(), model.vocab_size()];
        if logits.dims() != expected {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "{} backend returned logits {:?}, expected {:?}",
                self.backend.name(),
                logits.dims(),
                expected
            )));
        }

        Ok(logits)
    }
}

impl ForwardRunner<Box<dyn ForwardBackend>> {
    /// Local execution for one shard, sharded execution otherwise.
    pub fn for_shards(num_shards: usize) -> Self {
        if num_shards > 1 {
            Self::new(Box::new(ShardedBackend::new(num_shards)))
        } else {
            Self::new(Box::new(LocalBackend))
        }
    }
}

impl ForwardBackend for Box<dyn ForwardBackend> {
    fn evaluate(&self, model: &dyn CausalLm, input: &BatchedInput) -> Result<Tensor> {
        (**self).evaluate(model, input)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
