// SPDX-License-Identifier: MIT OR Apache-2.0

//! Feature codecs: sparse autoencoders mapping hidden states to sparse
//! feature coefficients and back.
//!
//! # `JumpReLU` SAE
//!
//! ```text
//! Encode:  pre   = x @ W_enc + b_enc
//!          codes = (pre > threshold) * ReLU(pre)
//! Decode:  x_hat = codes @ W_dec + b_dec
//! ```
//!
//! Parameter files (`params.npz` or `.safetensors`) hold the tensors
//! `W_enc` `[d_model, n_features]`, `b_enc` `[n_features]`,
//! `threshold` `[n_features]`, `W_dec` `[n_features, d_model]` and
//! `b_dec` `[d_model]`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use candle_core::{DType, Device, IndexOp, Tensor};
use tracing::info;

use crate::error::{CfError, Result};

/// Encoder/decoder pair over the hidden state of one layer.
///
/// `decode` must be affine in the codes for clamping to change only the
/// targeted coefficient's contribution.
pub trait FeatureCodec: Send + Sync + fmt::Debug {
    /// Number of sparse features (the codec's width).
    fn num_features(&self) -> usize;

    /// Hidden dimension the codec reads and writes.
    fn hidden_size(&self) -> usize;

    /// Encode hidden states into sparse feature coefficients.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, seq, hidden_size]`
    /// - returns: `[batch, seq, num_features]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] on tensor operation failure.
    fn encode(&self, hidden: &Tensor) -> Result<Tensor>;

    /// Decode feature coefficients back into hidden states.
    ///
    /// # Shapes
    /// - `codes`: `[batch, seq, num_features]`
    /// - returns: `[batch, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] on tensor operation failure.
    fn decode(&self, codes: &Tensor) -> Result<Tensor>;

    /// Decoder row for one feature.
    ///
    /// # Shapes
    /// - returns: `[hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if `feature` is out of range.
    fn decoder_direction(&self, feature: usize) -> Result<Tensor>;
}

/// `JumpReLU` sparse autoencoder (the Gemma Scope parameterisation).
pub struct JumpReluSae {
    w_enc: Tensor,
    b_enc: Tensor,
    threshold: Tensor,
    w_dec: Tensor,
    b_dec: Tensor,
}

impl JumpReluSae {
    /// Build a codec from its parameter tensors, checking shapes.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if the shapes are inconsistent.
    pub fn new(
        w_enc: Tensor,
        b_enc: Tensor,
        threshold: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
    ) -> Result<Self> {
        let (d_model, n_features) = w_enc.dims2()?;
        let (dec_features, dec_model) = w_dec.dims2()?;
        if dec_features != n_features || dec_model != d_model {
            return Err(CfError::Configuration(format!(
                "W_dec shape [{dec_features}, {dec_model}] does not transpose W_enc [{d_model}, {n_features}]"
            )));
        }
        for (name, tensor, expected) in [
            ("b_enc", &b_enc, n_features),
            ("threshold", &threshold, n_features),
            ("b_dec", &b_dec, d_model),
        ] {
            let len = tensor.dims1()?;
            if len != expected {
                return Err(CfError::Configuration(format!(
                    "{name} has length {len}, expected {expected}"
                )));
            }
        }
        Ok(Self {
            w_enc,
            b_enc,
            threshold,
            w_dec,
            b_dec,
        })
    }

    /// Build a codec from a name → tensor map, moving tensors to `device`
    /// as `F32`.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Configuration`] if a parameter is missing.
    pub fn from_tensors(mut tensors: HashMap<String, Tensor>, device: &Device) -> Result<Self> {
        let mut take = |name: &str| -> Result<Tensor> {
            let tensor = tensors.remove(name).ok_or_else(|| {
                CfError::Configuration(format!("SAE parameter `{name}` not found"))
            })?;
            Ok(tensor.to_dtype(DType::F32)?.to_device(device)?)
        };
        let w_enc = take("W_enc")?;
        let b_enc = take("b_enc")?;
        let threshold = take("threshold")?;
        let w_dec = take("W_dec")?;
        let b_dec = take("b_dec")?;
        Self::new(w_enc, b_enc, threshold, w_dec, b_dec)
    }

    /// Load a codec from a NumPy `.npz` archive.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] if the archive cannot be read and
    /// [`CfError::Configuration`] if a parameter is missing.
    pub fn from_npz(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let tensors: HashMap<String, Tensor> = Tensor::read_npz(path)?.into_iter().collect();
        let sae = Self::from_tensors(tensors, device)?;
        info!(
            "Loaded JumpReLU SAE from {}: d_model={}, n_features={}",
            path.display(),
            sae.hidden_size(),
            sae.num_features()
        );
        Ok(sae)
    }

    /// Load a codec from a `.safetensors` file.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::Model`] if the file cannot be read and
    /// [`CfError::Configuration`] if a parameter is missing.
    pub fn from_safetensors(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path.as_ref(), device)?;
        Self::from_tensors(tensors, device)
    }

    /// Download (or reuse the cached copy of) an `.npz` parameter file
    /// from the `HuggingFace` Hub and load it.
    ///
    /// # Errors
    ///
    /// Returns [`CfError::ExternalModel`] if the download fails.
    #[cfg(feature = "hub")]
    pub fn from_hub(repo_id: &str, filename: &str, device: &Device) -> Result<Self> {
        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| CfError::ExternalModel(format!("HF Hub API: {e}")))?;
        let path = api
            .model(repo_id.to_string())
            .get(filename)
            .map_err(|e| CfError::ExternalModel(format!("download {repo_id}/{filename}: {e}")))?;
        Self::from_npz(path, device)
    }
}

impl fmt::Debug for JumpReluSae {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JumpReluSae")
            .field("d_model", &self.hidden_size())
            .field("n_features", &self.num_features())
            .finish_non_exhaustive()
    }
}

impl FeatureCodec for JumpReluSae {
    fn num_features(&self) -> usize {
        self.b_enc.dims().first().copied().unwrap_or(0)
    }

    fn hidden_size(&self) -> usize {
        self.b_dec.dims().first().copied().unwrap_or(0)
    }

    fn encode(&self, hidden: &Tensor) -> Result<Tensor> {
        // PROMOTE: codec parameters are F32
        let hidden = hidden.to_dtype(DType::F32)?;
        let pre = hidden
            .broadcast_matmul(&self.w_enc)?
            .broadcast_add(&self.b_enc)?;
        let mask = pre.broadcast_gt(&self.threshold)?.to_dtype(DType::F32)?;
        Ok((mask * pre.relu()?)?)
    }

    fn decode(&self, codes: &Tensor) -> Result<Tensor> {
        let codes = codes.to_dtype(DType::F32)?;
        Ok(codes
            .broadcast_matmul(&self.w_dec)?
            .broadcast_add(&self.b_dec)?)
    }

    fn decoder_direction(&self, feature: usize) -> Result<Tensor> {
        let n_features = self.num_features();
        if feature >= n_features {
            return Err(CfError::Configuration(format!(
                "feature {feature} out of range (codec has {n_features} features)"
            )));
        }
        Ok(self.w_dec.i(feature)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    /// 2 features over a 3-dim hidden state: feature 0 reads dim 0,
    /// feature 1 reads dim 1, both with threshold 0.5.
    fn toy_sae() -> JumpReluSae {
        let dev = Device::Cpu;
        let w_enc =
            Tensor::from_vec(vec![1.0_f32, 0.0, 0.0, 1.0, 0.0, 0.0], (3, 2), &dev).unwrap();
        let w_dec =
            Tensor::from_vec(vec![1.0_f32, 0.0, 0.0, 0.0, 1.0, 0.0], (2, 3), &dev).unwrap();
        JumpReluSae::new(
            w_enc,
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            Tensor::new(&[0.5_f32, 0.5], &dev).unwrap(),
            w_dec,
            Tensor::zeros(3, DType::F32, &dev).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn encode_applies_jump_threshold() {
        let sae = toy_sae();
        let hidden = Tensor::from_vec(vec![2.0_f32, 0.3, 7.0], (1, 1, 3), &Device::Cpu).unwrap();
        let codes: Vec<f32> = sae
            .encode(&hidden)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(codes.len(), 2);
        assert!((codes[0] - 2.0).abs() < 1e-6);
        // 0.3 is below the threshold and gets cut to zero.
        assert!(codes[1].abs() < 1e-6);
    }

    #[test]
    fn decode_reconstructs_in_span() {
        let sae = toy_sae();
        let codes = Tensor::from_vec(vec![1.5_f32, 2.5], (1, 1, 2), &Device::Cpu).unwrap();
        let hidden: Vec<f32> = sae
            .decode(&codes)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(hidden, vec![1.5, 2.5, 0.0]);
    }

    #[test]
    fn decoder_direction_bounds() {
        let sae = toy_sae();
        let dir: Vec<f32> = sae.decoder_direction(1).unwrap().to_vec1().unwrap();
        assert_eq!(dir, vec![0.0, 1.0, 0.0]);
        assert!(matches!(
            sae.decoder_direction(2),
            Err(CfError::Configuration(_))
        ));
    }

    #[test]
    fn shape_mismatch_rejected() {
        let dev = Device::Cpu;
        let result = JumpReluSae::new(
            Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::F32, &dev).unwrap(),
            Tensor::zeros((2, 4), DType::F32, &dev).unwrap(),
            Tensor::zeros(3, DType::F32, &dev).unwrap(),
        );
        assert!(matches!(result, Err(CfError::Configuration(_))));
    }

    #[test]
    fn from_tensors_requires_all_parameters() {
        let dev = Device::Cpu;
        let mut map = HashMap::new();
        map.insert(
            "W_enc".to_string(),
            Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
        );
        let err = JumpReluSae::from_tensors(map, &dev).unwrap_err();
        assert!(err.to_string().contains("b_enc"));
    }

    #[test]
    fn safetensors_roundtrip_through_disk() {
        let sae = toy_sae();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sae.safetensors");
        let mut map = HashMap::new();
        map.insert("W_enc".to_string(), sae.w_enc.clone());
        map.insert("b_enc".to_string(), sae.b_enc.clone());
        map.insert("threshold".to_string(), sae.threshold.clone());
        map.insert("W_dec".to_string(), sae.w_dec.clone());
        map.insert("b_dec".to_string(), sae.b_dec.clone());
        candle_core::safetensors::save(&map, &path).unwrap();

        let loaded = JumpReluSae::from_safetensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.num_features(), 2);
        assert_eq!(loaded.hidden_size(), 3);
    }

    #[test]
    fn npz_params_load_like_gemma_scope() {
        let sae = toy_sae();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.npz");
        Tensor::write_npz(
            &[
                ("W_enc", &sae.w_enc),
                ("b_enc", &sae.b_enc),
                ("threshold", &sae.threshold),
                ("W_dec", &sae.w_dec),
                ("b_dec", &sae.b_dec),
            ],
            &path,
        )
        .unwrap();

        let loaded = JumpReluSae::from_npz(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.num_features(), 2);
        assert_eq!(loaded.hidden_size(), 3);

        let h = Tensor::new(&[[[1.5_f32, 2.5, 0.0]]], &Device::Cpu).unwrap();
        let codes = |codec: &JumpReluSae| -> Vec<f32> {
            codec.encode(&h).unwrap().flatten_all().unwrap().to_vec1().unwrap()
        };
        assert_eq!(codes(&loaded), codes(&sae));
    }
}
