// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small deterministic backend for tests and demos.
//!
//! Each layer is a residual tanh block:
//!
//! ```text
//! h = embed[ids]
//! for layer l: h = h + tanh(h @ W_l); hooks at blocks.{l}.hook_resid_post
//! logits = h @ embed^T
//! ```
//!
//! Weights are drawn uniformly from `[-scale, scale]` with a seeded RNG, so
//! two models built from the same seed are identical.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::Embedding;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::backend::CfBackend;
use crate::error::Result;
use crate::hooks::{HookCache, HookPoint, HookSpec, apply_layer_hooks, run_hooks};

/// Residual-tanh toy transformer with tied embeddings.
pub struct ToyTransformer {
    embed: Embedding,
    layers: Vec<Tensor>,
    vocab_size: usize,
    hidden_size: usize,
}

impl ToyTransformer {
    /// Build a model with seeded random weights.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`](crate::CfError::Model) if tensor
    /// construction fails.
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        num_layers: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut uniform = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
        };

        let embed_weights = Tensor::from_vec(
            uniform(vocab_size * hidden_size, 1.0),
            (vocab_size, hidden_size),
            device,
        )?;
        let mut layers = Vec::with_capacity(num_layers);
        for _ in 0..num_layers {
            layers.push(Tensor::from_vec(
                uniform(hidden_size * hidden_size, 0.5),
                (hidden_size, hidden_size),
                device,
            )?);
        }

        Ok(Self {
            embed: Embedding::new(embed_weights, hidden_size),
            layers,
            vocab_size,
            hidden_size,
        })
    }
}

impl CfBackend for ToyTransformer {
    fn num_layers(&self) -> usize {
        self.layers.len()
    }

    fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        let mut cache = HookCache::new(Tensor::zeros(1, DType::F32, input_ids.device())?);

        let hidden = self.embed.forward(input_ids)?;
        let mut hidden = run_hooks(&HookPoint::Embed, hidden, hooks, &mut cache)?;

        for (layer_idx, weight) in self.layers.iter().enumerate() {
            hidden = run_hooks(&HookPoint::ResidPre(layer_idx), hidden, hooks, &mut cache)?;
            let update = hidden.broadcast_matmul(weight)?.tanh()?;
            hidden = (hidden + update)?;
            hidden = apply_layer_hooks(layer_idx, hidden, hooks, &mut cache)?;
        }

        let logits = hidden.broadcast_matmul(&self.embed.embeddings().t()?)?;
        cache.set_output(logits);
        Ok(cache)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::hooks::Intervention;

    #[test]
    fn forward_shapes() {
        let model = ToyTransformer::new(10, 4, 2, 0, &Device::Cpu).unwrap();
        let input = Tensor::new(&[[1_u32, 2, 3]], &Device::Cpu).unwrap();
        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::ResidPost(1));
        let cache = model.forward(&input, &hooks).unwrap();
        assert_eq!(cache.output().dims(), &[1, 3, 10]);
        assert_eq!(
            cache.require(&HookPoint::ResidPost(1)).unwrap().dims(),
            &[1, 3, 4]
        );
    }

    #[test]
    fn same_seed_same_model() {
        let input = Tensor::new(&[[4_u32, 5]], &Device::Cpu).unwrap();
        let run = |seed| {
            let model = ToyTransformer::new(8, 4, 2, seed, &Device::Cpu).unwrap();
            let out: Vec<f32> = model
                .forward(&input, &HookSpec::new())
                .unwrap()
                .output()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap();
            out
        };
        assert_eq!(run(9), run(9));
    }

    #[test]
    fn intervention_changes_logits() {
        let model = ToyTransformer::new(8, 4, 2, 1, &Device::Cpu).unwrap();
        let input = Tensor::new(&[[1_u32, 2]], &Device::Cpu).unwrap();
        let plain: Vec<f32> = model
            .forward(&input, &HookSpec::new())
            .unwrap()
            .output()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let mut hooks = HookSpec::new();
        hooks.install(HookPoint::ResidPost(1), Intervention::Zero);
        let zeroed: Vec<f32> = model
            .forward(&input, &hooks)
            .unwrap()
            .output()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_ne!(plain, zeroed);
        assert!(zeroed.iter().all(|v| v.abs() < 1e-6));
    }
}
