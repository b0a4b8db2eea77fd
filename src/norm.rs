// Implementation references:
// - https://github.com/state-spaces/mamba/blob/v1.2.0/mamba_ssm/ops/triton/layernorm.py (layer_norm_ref, rms_norm_ref)
// - https://github.com/johnma2006/mamba-minimal/blob/03de542a36d873f6e6c4057ad687278cc6ae944d/model.py#L328

use crate::utils::cast_float;
use burn::module::{Content, DisplaySettings, ModuleDisplay, Param};
use burn::nn::Initializer;
use burn::prelude::*;
use burn::tensor::{DType, FloatDType};

/// Which normalization a [Norm] applies.
#[derive(Module, Default, Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NormKind {
    /// `Y = (X - mean(X)) / sqrt(var(X) + eps) * γ + β`
    LayerNorm,
    /// `Y = X / sqrt(mean(X²) + eps) * γ`
    #[default]
    RmsNorm,
    /// `Y = X`. Has no parameters and cannot be fused with the residual add.
    Identity,
}

impl NormKind {
    /// Whether the fused add-norm path has an implementation for this kind.
    pub fn supports_fused_add_norm(&self) -> bool {
        matches!(self, NormKind::LayerNorm | NormKind::RmsNorm)
    }
}

/// Configuration to create a [Norm] layer using the [init function](NormConfig::init).
#[derive(Debug, Config)]
pub struct NormConfig {
    /// The size of the input features.
    pub d_model: usize,
    #[config(default = "NormKind::RmsNorm")]
    pub kind: NormKind,
    /// A value required for numerical stability. Default: 1e-5
    #[config(default = 1e-5)]
    pub epsilon: f64,
}

impl NormConfig {
    /// Initialize a new [norm](Norm) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Norm<B> {
        let (weight, bias) = match self.kind {
            NormKind::LayerNorm => (
                Some(Initializer::Ones.init([self.d_model], device)),
                Some(Initializer::Zeros.init([self.d_model], device)),
            ),
            NormKind::RmsNorm => (Some(Initializer::Ones.init([self.d_model], device)), None),
            NormKind::Identity => (None, None),
        };
        Norm {
            weight,
            bias,
            epsilon: self.epsilon,
            kind: self.kind,
        }
    }
}

/// Normalization over the last dimension, either a LayerNorm or an RmsNorm.
///
/// Besides the plain [forward](Norm::forward), [fused_add_norm](Norm::fused_add_norm) adds
/// a residual and normalizes the sum in one call, returning both.
///
/// Should be created using [NormConfig].
#[derive(Module, Debug)]
#[module(custom_display)]
pub struct Norm<B: Backend> {
    /// The learnable weight (`γ`).
    pub weight: Option<Param<Tensor<B, 1>>>,
    /// The learnable bias (`β`). Only present for [NormKind::LayerNorm].
    pub bias: Option<Param<Tensor<B, 1>>>,
    epsilon: f64,
    kind: NormKind,
}

impl<B: Backend> Norm<B> {
    pub fn kind(&self) -> NormKind {
        self.kind
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Dtype of the normalization parameters, if there are any.
    pub fn param_dtype(&self) -> Option<DType> {
        self.weight.as_ref().map(|w| w.val().dtype())
    }

    /// # Shapes
    ///
    /// - input: `[..., any, d_model]`
    /// - output: `[..., any, d_model]`
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self.param_dtype() {
            Some(dtype) => self.normalize(cast_float(x, dtype)),
            None => x,
        }
    }

    /// Adds `x` into `residual` (or starts the residual with `x` if there is none) and
    /// normalizes the sum.
    ///
    /// With `residual_in_fp32` the sum is held as f32 and the statistics are computed on it;
    /// the normalized output comes back in the parameter dtype.
    ///
    /// Returns `(normalized, residual)`.
    pub fn fused_add_norm<const D: usize>(
        &self,
        x: Tensor<B, D>,
        residual: Option<Tensor<B, D>>,
        residual_in_fp32: bool,
    ) -> (Tensor<B, D>, Tensor<B, D>) {
        debug_assert!(self.kind.supports_fused_add_norm());

        let x = if residual_in_fp32 {
            x.cast(FloatDType::F32)
        } else {
            x
        };
        let residual = match residual {
            Some(residual) => cast_float(residual, x.dtype()) + x,
            None => x,
        };
        let normalized = self.normalize(residual.clone());
        let normalized = match self.param_dtype() {
            Some(dtype) => cast_float(normalized, dtype),
            None => normalized,
        };

        (normalized, residual)
    }

    fn normalize<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let shape = x.dims();
        let dtype = x.dtype();
        let x_normalized = match self.kind {
            NormKind::LayerNorm => {
                let mean = x.clone().mean_dim(D - 1);
                let centered = x - mean.expand(shape);
                let var = centered.clone().powi_scalar(2).mean_dim(D - 1);
                let rsqrt = (var + self.epsilon).sqrt().recip().expand(shape);
                centered * rsqrt
            }
            NormKind::RmsNorm => {
                let sq_mean = (x.clone() * x.clone()).mean_dim(D - 1);
                let rsqrt = (sq_mean + self.epsilon).sqrt().recip().expand(shape);
                x * rsqrt
            }
            NormKind::Identity => return x,
        };

        let mut y = x_normalized;
        if let Some(weight) = &self.weight {
            y = y * cast_float(weight.val(), dtype).unsqueeze();
        }
        if let Some(bias) = &self.bias {
            y = y + cast_float(bias.val(), dtype).unsqueeze();
        }
        y
    }
}

impl<B: Backend> ModuleDisplay for Norm<B> {
    fn custom_settings(&self) -> Option<DisplaySettings> {
        DisplaySettings::new()
            .with_new_line_after_attribute(false)
            .optional()
    }

    fn custom_content(&self, content: Content) -> Option<Content> {
        let d_model = self.weight.as_ref().map(|w| w.dims()[0]).unwrap_or(0);
        content
            .add("kind", &self.kind)
            .add("d_model", &d_model)
            .add("epsilon", &self.epsilon)
            .optional()
    }
}
