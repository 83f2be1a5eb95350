// SPDX-License-Identifier: MIT OR Apache-2.0

//! Toy counterfactual run: a random 2-layer subject model, a codec whose
//! features read single hidden dimensions, and a synthetic corpus.
//!
//! ```bash
//! cargo run --example toy_counterfactual -- --output /tmp/cf_run
//! cargo run --example toy_counterfactual -- --output /tmp/cf_run2 --config run.json
//! ```
//!
//! Writes `config.json` and `results.json` to the output directory, then
//! one `layer{L}_feature{F}.txt` summary per feature under `summaries/`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_counterfactual::persist::execute_and_save_blocking;
use candle_counterfactual::{
    ActivationLocation, CfModel, CfTokenizer, CounterfactualPipeline, FeatureCodec,
    FeatureConfig, FeatureRecord, FeatureStore, JumpReluSae, PipelineConfig, ToyTransformer,
    WordVocab,
};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const WORDS: [&str; 16] = [
    "<bos>", "<unk>", "\n", "the", "a", "cat", "dog", "bird", "sat", "ran", "flew", "on", "mat",
    "tree", "home", "quickly",
];

#[derive(Parser)]
#[command(name = "toy_counterfactual")]
#[command(about = "Run the counterfactual pipeline on a toy model")]
struct Args {
    /// Output directory (must not already hold results.json)
    #[arg(short, long)]
    output: PathBuf,

    /// Optional JSON file with pipeline parameters
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hidden size of the toy subject model
    #[arg(long, default_value_t = 8)]
    hidden: usize,

    /// Features in the toy codec
    #[arg(long, default_value_t = 4)]
    features: usize,

    /// Synthetic corpus sequences
    #[arg(long, default_value_t = 40)]
    sequences: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    anyhow::ensure!(
        args.features <= args.hidden,
        "toy codec needs features <= hidden"
    );

    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)?,
        None => PipelineConfig {
            feat_layer: 1,
            n_train: 3,
            n_test: 4,
            n_quantiles: 2,
            ..PipelineConfig::default()
        },
    };
    config.n_feats = config.n_feats.min(args.features);

    let dev = Device::Cpu;
    let subject = CfModel::new(
        Box::new(ToyTransformer::new(WORDS.len(), args.hidden, 2, 1, &dev)?),
        dev.clone(),
    );
    let explainer = CfModel::new(
        Box::new(ToyTransformer::new(WORDS.len(), args.hidden, 2, 2, &dev)?),
        dev.clone(),
    );
    let tokenizer = CfTokenizer::Word(WordVocab::new(WORDS).with_bos("<bos>")?.with_unk("<unk>")?);
    let codec = toy_codec(args.hidden, args.features, &dev)?;

    let mut store = synthetic_store(&config, args.features, args.sequences)?;
    store.fill_directions(codec.as_ref())?;
    println!(
        "Subject: {} layers, hidden {}; {} features with examples",
        subject.num_layers(),
        subject.hidden_size(),
        store.len()
    );

    let pipeline = CounterfactualPipeline::new(config, &subject, &tokenizer, codec)?
        .with_explainer(&explainer, &tokenizer)?;
    let table = pipeline.run(&store, &args.output)?;

    for row in table.rows() {
        let explanation = row
            .explanations
            .as_ref()
            .and_then(|e| e.first())
            .map_or("", String::as_str);
        println!("feature {}: {explanation:?}", row.feat_idx);
        for record in &row.completions {
            println!(
                "  {:?} (max {:.2})\n    clean:      {:?}\n    intervened: {:?}",
                record.text, record.max_act, record.completions.clean, record.completions.intervened
            );
        }
    }

    // Per-feature summaries, one file per query.
    let summaries: Vec<FeatureRecord> = store.records().to_vec();
    let rows = Arc::new(table);
    let summary = execute_and_save_blocking(
        summaries,
        args.output.join("summaries"),
        true,
        move |record: FeatureRecord| {
            let rows = Arc::clone(&rows);
            async move {
                let n_changed = rows
                    .rows()
                    .iter()
                    .find(|r| r.feat_idx == record.feature_index)
                    .map_or(0, |r| {
                        r.completions
                            .iter()
                            .filter(|c| c.completions.clean != c.completions.intervened)
                            .count()
                    });
                Ok(serde_json::json!({
                    "feature": record.feature_index,
                    "max_activation": record.max_activation(),
                    "changed_completions": n_changed,
                }))
            }
        },
    )?;
    println!(
        "\nWrote {} summaries ({} failed) to {}",
        summary.written.len(),
        summary.failures.len(),
        args.output.join("summaries").display()
    );
    Ok(())
}

/// Identity-like codec: feature `i` reads and writes hidden dimension `i`.
fn toy_codec(hidden: usize, features: usize, dev: &Device) -> Result<Arc<dyn FeatureCodec>> {
    let mut w_enc = vec![0.0_f32; hidden * features];
    for i in 0..features {
        w_enc[i * features + i] = 1.0;
    }
    let w_enc = Tensor::from_vec(w_enc, (hidden, features), dev)?;
    let w_dec = w_enc.t()?.contiguous()?;
    let sae = JumpReluSae::new(
        w_enc,
        Tensor::zeros(features, DType::F32, dev)?,
        Tensor::full(0.05_f32, features, dev)?,
        w_dec,
        Tensor::zeros(hidden, DType::F32, dev)?,
    )?;
    Ok(Arc::new(sae))
}

/// Random word sequences; feature `f` fires on every occurrence of word
/// `3 + f` with a random strength.
fn synthetic_store(
    config: &PipelineConfig,
    features: usize,
    sequences: usize,
) -> candle_counterfactual::Result<FeatureStore> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let len = 16;
    #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
    let corpus: Vec<Vec<u32>> = (0..sequences)
        .map(|_| (0..len).map(|_| rng.gen_range(3..WORDS.len() as u32)).collect())
        .collect();

    let mut locations = Vec::new();
    for (sequence, tokens) in corpus.iter().enumerate() {
        for (position, &token) in tokens.iter().enumerate() {
            for feature in 0..features {
                #[allow(clippy::cast_possible_truncation, clippy::as_conversions)]
                let trigger = 3 + feature as u32;
                if token == trigger {
                    locations.push(ActivationLocation {
                        sequence,
                        position,
                        feature,
                        activation: rng.gen_range(0.5..4.0),
                    });
                }
            }
        }
    }

    let cfg = FeatureConfig {
        width: features,
        n_splits: 1,
        max_examples: 1000,
        min_examples: 2,
    };
    FeatureStore::from_locations(&corpus, &locations, config.feat_layer, cfg, 8)
}
