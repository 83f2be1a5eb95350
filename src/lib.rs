// SPDX-License-Identifier: MIT OR Apache-2.0

//! # candle-counterfactual
//!
//! Counterfactual interpretation of sparse features in language models,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! A run intervenes on a subject model's hidden state at one layer,
//! either clamping a sparse-autoencoder feature or steering along its
//! decoder direction, and records how generated text changes. A second
//! model proposes short explanations of each feature from the steering
//! evidence. The output is a results table for an external scorer that
//! judges whether an explanation predicts the observed change.
//!
//! ## Building blocks
//!
//! - [`CfBackend`] / [`CfModel`]: hook-aware forward pass over a stack of
//!   layers. Interventions travel in an explicit [`HookSpec`] value; no
//!   hook state lives on the model.
//! - [`FeatureCodec`] / [`JumpReluSae`]: sparse autoencoder used for
//!   clamping.
//! - [`features`]: activation examples and train/test sampling.
//! - [`interp::intervention`]: additive steering and clamping.
//! - [`GenerationController`]: logit queries and sampling under an
//!   intervention.
//! - [`explain`]: explainer prompts, explanation sampling, random baseline.
//! - [`results`] and [`persist`]: checkpointed result table and per-query
//!   result files.
//! - [`CounterfactualPipeline`]: the three-pass run.
//!
//! ## Quick start
//!
//! ```
//! use std::sync::Arc;
//!
//! use candle_core::{DType, Device, Tensor};
//! use candle_counterfactual::{
//!     CfModel, CfTokenizer, FeatureCodec, GenerationConfig, GenerationController,
//!     InterventionEngine, JumpReluSae, ToyTransformer, WordVocab,
//! };
//! use rand::SeedableRng;
//!
//! # fn main() -> candle_counterfactual::Result<()> {
//! let dev = Device::Cpu;
//! let model = CfModel::new(Box::new(ToyTransformer::new(4, 2, 2, 7, &dev)?), dev.clone());
//! let tok = CfTokenizer::Word(WordVocab::new(["<bos>", "x", "y", "z"]).with_bos("<bos>")?);
//!
//! let eye = Tensor::eye(2, DType::F32, &dev)?;
//! let zeros = Tensor::zeros(2, DType::F32, &dev)?;
//! let sae = JumpReluSae::new(eye.clone(), zeros.clone(), zeros.clone(), eye, zeros)?;
//! let codec: Arc<dyn FeatureCodec> = Arc::new(sae);
//! let engine = InterventionEngine::new(codec, &model)?;
//!
//! let controller =
//!     GenerationController::new(&model, &tok, GenerationConfig::default()).with_engine(&engine);
//! let mut rng = rand::rngs::StdRng::seed_from_u64(22);
//! let clean = controller.generate_with_intervention("x y", 1, 0.0, 0, &mut rng)?;
//! let steered = controller.generate_with_intervention("x y", 1, 25.0, 0, &mut rng)?;
//! println!("{:?} vs {:?}", clean.completion, steered.completion);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod explain;
pub mod features;
pub mod generation;
pub mod hooks;
pub mod interp;
pub mod persist;
pub mod pipeline;
pub mod results;
pub mod tokenizer;
pub mod toy;

// --- Public re-exports ---------------------------------------------------

// Backend
pub use backend::{CfBackend, CfModel, GenerationResult, sample_token};

// Codec
pub use codec::{FeatureCodec, JumpReluSae};

// Config
pub use config::{PipelineConfig, RunSnapshot};

// Error
pub use error::{CfError, Result};

// Explanation
pub use explain::{
    Explainer, InterventionExample, NeuronPrompter, RandomExplanationPool, explainer_prompt,
};

// Features
pub use features::sampler::{SampledFeature, SamplerPolicy};
pub use features::{
    ActivationExample, ActivationLocation, ExperimentConfig, FeatureConfig, FeatureRecord,
    FeatureStore, SampleType,
};

// Generation
pub use generation::{GenerationConfig, GenerationController};

// Hooks
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention};

// Interventions
pub use interp::intervention::{InterventionEngine, InterventionSpec, Positions};
pub use interp::steering::Condition;

// Persistence
pub use persist::{PersistSummary, QueryKey, execute_and_save};

// Pipeline
pub use pipeline::CounterfactualPipeline;

// Results
pub use results::{Checkpointer, ResultRow, ResultTable, RunDirectory};

// Tokenizer
pub use tokenizer::{CfTokenizer, WordVocab};

// Toy backend
pub use toy::ToyTransformer;
