use crate::drop_path::{DropPath, DropPathConfig};
use crate::error::{self, VimError};
use crate::mixer::{Mamba, MambaCache, MambaConfig};
use crate::norm::{Norm, NormConfig, NormKind};
use burn::prelude::*;
use burn::tensor::FloatDType;

/// Whether a block is planned to keep or recompute its activations for the backward pass.
///
/// burn picks recomputation per backend type, not per block: under
/// [CheckpointedAutodiff](crate::CheckpointedAutodiff) every block recomputes its memory-bound
/// ops, under a plain `Autodiff` none does. A plan entry therefore cannot restrict
/// recomputation to a subset of the blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Execution {
    #[default]
    Retain,
    Recompute,
}

#[derive(Config, Debug)]
pub struct NormResidualBlockConfig {
    pub mixer: MambaConfig,

    #[config(default = "NormKind::RmsNorm")]
    pub norm: NormKind,

    #[config(default = 1e-5)]
    pub norm_epsilon: f64,

    /// Add the residual and normalize in a single call.
    ///
    /// Only [NormKind::LayerNorm] and [NormKind::RmsNorm] support it.
    #[config(default = false)]
    pub fused_add_norm: bool,

    /// Hold the residual stream as f32.
    #[config(default = false)]
    pub residual_in_fp32: bool,

    /// Stochastic depth rate of this block.
    #[config(default = 0.0)]
    pub drop_path: f64,
}

impl NormResidualBlockConfig {
    /// Returns the initialized block.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<NormResidualBlock<B>> {
        let mixer = &self.mixer;
        if mixer.d_model == 0 || mixer.d_state == 0 || mixer.d_conv == 0 || mixer.d_inner() == 0 {
            return Err(VimError::Config(format!(
                "mixer sizes must be positive: d_model={}, d_state={}, d_conv={}, d_inner={}",
                mixer.d_model,
                mixer.d_state,
                mixer.d_conv,
                mixer.d_inner()
            )));
        }
        if !(0.0..=1.0).contains(&self.drop_path) {
            return Err(VimError::Config(format!(
                "drop_path must be in [0, 1], got {}",
                self.drop_path
            )));
        }
        if self.fused_add_norm && !self.norm.supports_fused_add_norm() {
            return Err(VimError::Config(format!(
                "fused add-norm supports only LayerNorm and RmsNorm, got {:?}",
                self.norm
            )));
        }

        Ok(NormResidualBlock {
            mixer: self.mixer.init(device),
            norm: NormConfig::new(self.mixer.d_model)
                .with_kind(self.norm)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            drop_path: DropPathConfig::new(self.drop_path).init(),
            fused_add_norm: self.fused_add_norm,
            residual_in_fp32: self.residual_in_fp32,
        })
    }
}

/// A mixer wrapped with a normalization and a residual connection.
///
/// Unlike the usual prenorm block (`Norm -> Mixer -> Add`), this block runs
/// `Add -> Norm -> Mixer` and returns both the mixer output and the residual, so that the
/// next block (or the final norm) can fuse its add with its normalization.
/// The first block receives no residual.
#[derive(Module, Debug)]
pub struct NormResidualBlock<B: Backend> {
    pub mixer: Mamba<B>,
    pub norm: Norm<B>,
    pub drop_path: DropPath,
    fused_add_norm: bool,
    residual_in_fp32: bool,
}

impl<B: Backend> NormResidualBlock<B> {
    pub fn fused_add_norm(&self) -> bool {
        self.fused_add_norm
    }

    pub fn residual_in_fp32(&self) -> bool {
        self.residual_in_fp32
    }

    /// Returns `(hidden_states, residual, cache)`, where `hidden_states = Mixer(Norm(residual))`.
    ///
    /// # Shapes
    ///   - Input hidden_states [batch, sequence, d_model]
    ///   - Input residual [batch, sequence, d_model]
    ///   - Output hidden_states [batch, sequence, d_model]
    ///   - Output residual [batch, sequence, d_model]
    pub fn forward(
        &self,
        hidden_states: Tensor<B, 3>,
        residual: Option<Tensor<B, 3>>,
        cache: Option<MambaCache<B>>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>, Option<MambaCache<B>>) {
        let [batch, sequence, d_model] = hidden_states.dims();

        let (normalized, residual) = self.add_norm(hidden_states, residual);
        debug_assert_eq!([batch, sequence, d_model], residual.dims());

        let (hidden_states, cache) = self.mixer.forward(normalized, cache);
        debug_assert_eq!([batch, sequence, d_model], hidden_states.dims());

        (hidden_states, residual, cache)
    }

    /// Accumulates `hidden_states` into the residual stream and normalizes it.
    ///
    /// Returns `(normalized, residual)`.
    pub fn add_norm(
        &self,
        hidden_states: Tensor<B, 3>,
        residual: Option<Tensor<B, 3>>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        add_norm(
            &self.norm,
            &self.drop_path,
            hidden_states,
            residual,
            self.fused_add_norm,
            self.residual_in_fp32,
        )
    }
}

/// Residual accumulation followed by normalization, shared by the blocks and the final norm.
///
/// The unfused path adds, normalizes the sum in the norm's dtype and then optionally
/// upcasts the residual; the fused path does all of it through [Norm::fused_add_norm].
/// Stochastic depth only applies when there is a residual to add into.
pub(crate) fn add_norm<B: Backend, const D: usize>(
    norm: &Norm<B>,
    drop_path: &DropPath,
    hidden_states: Tensor<B, D>,
    residual: Option<Tensor<B, D>>,
    fused_add_norm: bool,
    residual_in_fp32: bool,
) -> (Tensor<B, D>, Tensor<B, D>) {
    if fused_add_norm {
        let hidden_states = match residual {
            Some(_) => drop_path.forward(hidden_states),
            None => hidden_states,
        };
        return norm.fused_add_norm(hidden_states, residual, residual_in_fp32);
    }

    let residual = match residual {
        Some(residual) => {
            let hidden_states = drop_path.forward(hidden_states);
            let dtype = residual.dtype();
            residual + crate::utils::cast_float(hidden_states, dtype)
        }
        None => hidden_states,
    };
    let normalized = norm.forward(residual.clone());
    let residual = if residual_in_fp32 {
        residual.cast(FloatDType::F32)
    } else {
        residual
    };
    (normalized, residual)
}
