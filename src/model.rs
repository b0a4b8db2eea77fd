//! Stacks [NormResidualBlock]s into a VisionMamba encoder over flattened feature rows.
//!
//! References:
//! - https://github.com/OpenGVLab/VideoMamba/blob/f3fb5ea6514f1de26eb0c8b3e8e2186a4e7d8dd0/videomamba/video_sm/models/videomamba.py
//! - https://github.com/hustvl/Vim/blob/6143d07b3dd31f904c63840a19e22d95d1124493/vim/models_mamba.py

use crate::block::{Execution, NormResidualBlock, NormResidualBlockConfig, add_norm};
use crate::drop_path::{DropPath, DropPathConfig};
use crate::error::{self, VimError};
use crate::mixer::{InferenceCache, MambaConfig};
use crate::norm::{Norm, NormConfig, NormKind};
use crate::schedule::stochastic_depth_rates;
use burn::module::Param;
use burn::nn::{Dropout, DropoutConfig, Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::Distribution;

#[derive(Config, Debug)]
pub struct VisionMambaConfig {
    /// Number of blocks.
    #[config(default = 24)]
    pub depth: usize,

    /// Width of each input feature row.
    #[config(default = 4096)]
    pub input_channels: usize,

    /// Model width (`d_model` of every block).
    #[config(default = 192)]
    pub embed_dim: usize,

    /// Dropout applied after the positional embedding.
    #[config(default = 0.0)]
    pub drop_rate: f64,

    /// Stochastic depth rate of the last block. Earlier blocks scale linearly down to 0.
    #[config(default = 0.1)]
    pub drop_path_rate: f64,

    #[config(default = 1e-5)]
    pub norm_epsilon: f64,

    #[config(default = "NormKind::RmsNorm")]
    pub norm: NormKind,

    #[config(default = true)]
    pub fused_add_norm: bool,

    #[config(default = true)]
    pub residual_in_fp32: bool,

    /// Whether each mixer also scans the tokens in reverse.
    #[config(default = true)]
    pub bimamba: bool,

    /// Number of consecutive feature rows forming one sequence.
    #[config(default = 64)]
    pub tokens_per_sequence: usize,

    /// Whether the learned positional embedding is added to the projected rows.
    ///
    /// Off by default, the embedding is then only a trained parameter of the checkpoint.
    #[config(default = false)]
    pub add_pos_embed: bool,

    /// Plan recomputation for the first `checkpoint_num` blocks.
    ///
    /// See [Execution] for how burn carries it out.
    #[config(default = false)]
    pub use_checkpoint: bool,

    #[config(default = 0)]
    pub checkpoint_num: usize,

    /// latent state dimension of each mixer.
    #[config(default = 16)]
    pub d_state: usize,

    #[config(default = 4)]
    pub d_conv: usize,

    #[config(default = 2)]
    pub expand: usize,
}

impl VisionMambaConfig {
    /// 12 blocks of width 192 with RmsNorm, fused add-norm and an f32 residual stream.
    pub fn tiny() -> Self {
        Self::new()
            .with_depth(12)
            .with_norm(NormKind::RmsNorm)
            .with_residual_in_fp32(true)
            .with_fused_add_norm(true)
    }

    pub fn mixer_config(&self) -> MambaConfig {
        MambaConfig::new(self.embed_dim)
            .with_d_state(self.d_state)
            .with_d_conv(self.d_conv)
            .with_expand(self.expand)
            .with_bimamba(self.bimamba)
    }

    pub fn block_config(&self, drop_path: f64) -> NormResidualBlockConfig {
        NormResidualBlockConfig::new(self.mixer_config())
            .with_norm(self.norm)
            .with_norm_epsilon(self.norm_epsilon)
            .with_fused_add_norm(self.fused_add_norm)
            .with_residual_in_fp32(self.residual_in_fp32)
            .with_drop_path(drop_path)
    }

    /// Returns the initialized model.
    ///
    /// Fails when a size is zero, when a rate is outside `[0, 1]` or when fused add-norm is
    /// requested for a norm kind that doesn't support it.
    pub fn init<B: Backend>(&self, device: &B::Device) -> error::Result<VisionMamba<B>> {
        if self.depth == 0 {
            return Err(VimError::Config("depth must be at least 1".into()));
        }
        if self.tokens_per_sequence == 0 || self.embed_dim == 0 || self.input_channels == 0 {
            return Err(VimError::Config(format!(
                "sizes must be positive: tokens_per_sequence={}, embed_dim={}, input_channels={}",
                self.tokens_per_sequence, self.embed_dim, self.input_channels
            )));
        }
        for (name, rate) in [("drop_rate", self.drop_rate), ("drop_path_rate", self.drop_path_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(VimError::Config(format!("{name} must be in [0, 1], got {rate}")));
            }
        }
        if self.fused_add_norm && !self.norm.supports_fused_add_norm() {
            return Err(VimError::Config(format!(
                "fused add-norm supports only LayerNorm and RmsNorm, got {:?}",
                self.norm
            )));
        }

        let d_inner = self.mixer_config().d_inner();
        let mut layers = Vec::with_capacity(self.depth);
        for drop_path in stochastic_depth_rates(self.depth, self.drop_path_rate) {
            let mut layer = self.block_config(drop_path).init(device)?;
            layer.mixer = reinit_mixer(layer.mixer, self.depth, d_inner);
            layers.push(layer);
        }

        // default uniform weight, zero bias
        let proj = LinearConfig::new(self.input_channels, self.embed_dim).init(device);
        let embedding = Embedding {
            proj: Linear {
                weight: proj.weight,
                bias: proj.bias.map(|b| b.map(|b| b.zeros_like())),
            },
        };
        let pos_embed = Param::from_tensor(Tensor::random(
            [1, self.tokens_per_sequence, self.embed_dim],
            Distribution::Normal(0.0, INIT_STD),
            device,
        ));

        tracing::info!(
            depth = self.depth,
            embed_dim = self.embed_dim,
            use_checkpoint = self.use_checkpoint,
            checkpoint_num = self.checkpoint_num,
            "vision mamba initialized"
        );
        if self.use_checkpoint && self.checkpoint_num > 0 && self.checkpoint_num < self.depth {
            tracing::warn!(
                checkpoint_num = self.checkpoint_num,
                depth = self.depth,
                "recomputation follows the autodiff backend and applies to every block"
            );
        }

        Ok(VisionMamba {
            embedding,
            pos_embed,
            pos_drop: DropoutConfig::new(self.drop_rate).init(),
            layers,
            drop_path: DropPathConfig::new(self.drop_path_rate).init(),
            norm_f: NormConfig::new(self.embed_dim)
                .with_kind(self.norm)
                .with_epsilon(self.norm_epsilon)
                .init(device),
            tokens_per_sequence: self.tokens_per_sequence,
            add_pos_embed: self.add_pos_embed,
            fused_add_norm: self.fused_add_norm,
            residual_in_fp32: self.residual_in_fp32,
            use_checkpoint: self.use_checkpoint,
            checkpoint_num: self.checkpoint_num,
        })
    }
}

const INIT_STD: f64 = 0.02;

/// Weight ~ N(0, 0.02), bias = 0.
fn normal_linear<B: Backend>(linear: Linear<B>) -> Linear<B> {
    Linear {
        weight: linear.weight.map(|w| {
            let device = w.device();
            Tensor::random(w.shape(), Distribution::Normal(0.0, INIT_STD), &device)
        }),
        bias: linear.bias.map(|b| b.map(|b| b.zeros_like())),
    }
}

/// Applies the encoder-wide init on top of the mixer's own: normal projections with zero
/// biases, and an `out_proj` rescaled by `1/√depth` to account for the residual accumulation.
fn reinit_mixer<B: Backend>(
    mut mixer: crate::mixer::Mamba<B>,
    depth: usize,
    d_inner: usize,
) -> crate::mixer::Mamba<B> {
    mixer.in_proj = normal_linear(mixer.in_proj);
    let reinit_branch = |mut branch: crate::mixer::ScanBranch<B>| {
        branch.x_proj = normal_linear(branch.x_proj);
        branch.dt_proj = normal_linear(branch.dt_proj);
        branch
    };
    mixer.forward_scan = reinit_branch(mixer.forward_scan);
    mixer.backward_scan = mixer.backward_scan.map(reinit_branch);

    // kaiming uniform with a = √5 has bound 1/√fan_in
    let bound = 1.0 / (d_inner as f64).sqrt() / (depth as f64).sqrt();
    mixer.out_proj = Linear {
        weight: mixer.out_proj.weight.map(|w| {
            let device = w.device();
            Tensor::random(w.shape(), Distribution::Uniform(-bound, bound), &device)
        }),
        bias: mixer.out_proj.bias.map(|b| b.map(|b| b.zeros_like())),
    };
    mixer
}

/// Projects each input row from `input_channels` to `embed_dim`.
#[derive(Module, Debug)]
pub struct Embedding<B: Backend> {
    pub proj: Linear<B>,
}

impl<B: Backend> Embedding<B> {
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        self.proj.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct VisionMamba<B: Backend> {
    pub embedding: Embedding<B>,
    /// # Shape
    /// [1, tokens_per_sequence, embed_dim]
    pub pos_embed: Param<Tensor<B, 3>>,
    pub pos_drop: Dropout,
    pub layers: Vec<NormResidualBlock<B>>,
    /// Stochastic depth on the last block output, before the final norm.
    pub drop_path: DropPath,
    pub norm_f: Norm<B>,
    tokens_per_sequence: usize,
    add_pos_embed: bool,
    fused_add_norm: bool,
    residual_in_fp32: bool,
    use_checkpoint: bool,
    checkpoint_num: usize,
}

impl<B: Backend> VisionMamba<B> {
    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn tokens_per_sequence(&self) -> usize {
        self.tokens_per_sequence
    }

    pub fn embed_dim(&self) -> usize {
        self.pos_embed.dims()[2]
    }

    /// Planned execution of each block: the blocks below `checkpoint_num` when checkpointing
    /// is enabled.
    ///
    /// The plan is informational. Whether activations are recomputed is decided by the
    /// autodiff backend for all blocks at once, see [Execution].
    pub fn checkpoint_plan(&self) -> Vec<Execution> {
        (0..self.layers.len())
            .map(|idx| {
                if self.use_checkpoint && idx < self.checkpoint_num {
                    Execution::Recompute
                } else {
                    Execution::Retain
                }
            })
            .collect()
    }

    /// Zeroed decoding state for every block, keyed by block index.
    pub fn allocate_inference_cache(
        &self,
        batch: usize,
        max_seqlen: usize,
        device: &B::Device,
    ) -> InferenceCache<B> {
        InferenceCache {
            caches: self
                .layers
                .iter()
                .map(|layer| layer.mixer.allocate_inference_cache(batch, device))
                .collect(),
            max_seqlen,
        }
    }

    /// # Shapes
    ///   - Input [batch * tokens_per_sequence, input_channels]
    ///   - Output [batch, tokens_per_sequence, embed_dim]
    pub fn forward(&self, x: Tensor<B, 2>) -> error::Result<Tensor<B, 3>> {
        let x = self.embed(x)?;
        let (x, _) = self.forward_layers(x, None);
        Ok(x)
    }

    /// Like [Self::forward], threading an [InferenceCache].
    ///
    /// The first call on a fresh cache runs the full sequences and records their final state;
    /// later calls continue from it token by token.
    pub fn forward_with_cache(
        &self,
        x: Tensor<B, 2>,
        cache: InferenceCache<B>,
    ) -> error::Result<(Tensor<B, 3>, InferenceCache<B>)> {
        let x = self.embed(x)?;
        let [batch, sequence, _] = x.dims();

        if cache.caches.len() != self.layers.len() {
            return Err(VimError::Cache(format!(
                "cache has {} layers, model has {}",
                cache.caches.len(),
                self.layers.len()
            )));
        }
        if let Some(cache_batch) = cache.batch() {
            if cache_batch != batch {
                return Err(VimError::Cache(format!(
                    "cache allocated for batch {cache_batch}, got batch {batch}"
                )));
            }
        }
        if cache.seqlen_offset() + sequence > cache.max_seqlen {
            return Err(VimError::Cache(format!(
                "{} cached + {} new tokens exceed max_seqlen {}",
                cache.seqlen_offset(),
                sequence,
                cache.max_seqlen
            )));
        }

        let (x, cache) = self.forward_layers(x, Some(cache));
        let cache = cache.ok_or_else(|| VimError::Cache("layers dropped the cache".into()))?;
        Ok((x, cache))
    }

    /// Projects the rows and groups them into sequences, adding the positional embedding when
    /// enabled.
    ///
    /// # Shapes
    ///   - Input [batch * tokens_per_sequence, input_channels]
    ///   - Output [batch, tokens_per_sequence, embed_dim]
    pub fn embed(&self, x: Tensor<B, 2>) -> error::Result<Tensor<B, 3>> {
        let [rows, channels] = x.dims();
        let [input_channels, embed_dim] = self.embedding.proj.weight.dims();
        let tokens = self.tokens_per_sequence;

        if channels != input_channels {
            return Err(VimError::Shape(format!(
                "expected rows of {input_channels} channels, got {channels}"
            )));
        }
        if rows % tokens != 0 {
            return Err(VimError::Shape(format!(
                "{rows} rows cannot be split into sequences of {tokens} tokens"
            )));
        }

        let x = self.embedding.forward(x);
        debug_assert_eq!([rows, embed_dim], x.dims());
        let batch = rows / tokens;
        let x = x.reshape([batch, tokens, embed_dim]);

        let x = if self.add_pos_embed {
            x + self.pos_embed.val().expand([batch, tokens, embed_dim])
        } else {
            x
        };
        Ok(self.pos_drop.forward(x))
    }

    /// Runs every block and the final norm.
    ///
    /// # Shapes
    ///   - Input [batch, sequence, embed_dim]
    ///   - Output [batch, sequence, embed_dim]
    ///
    /// A given cache must hold one entry per block.
    fn forward_layers(
        &self,
        x: Tensor<B, 3>,
        mut cache: Option<InferenceCache<B>>,
    ) -> (Tensor<B, 3>, Option<InferenceCache<B>>) {
        debug_assert!(cache.as_ref().is_none_or(|c| c.caches.len() == self.layers.len()));

        let mut hidden_states = x;
        let mut residual = None;
        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_cache = cache.as_ref().map(|c| c.caches[idx].clone());
            let (hidden_states_, residual_, layer_cache) =
                layer.forward(hidden_states, residual, layer_cache);
            hidden_states = hidden_states_;
            residual = Some(residual_);
            if let (Some(cache), Some(layer_cache)) = (cache.as_mut(), layer_cache) {
                cache.caches[idx] = layer_cache;
            }
        }

        // no block follows, so the residual is dropped
        let (hidden_states, _residual) = add_norm(
            &self.norm_f,
            &self.drop_path,
            hidden_states,
            residual,
            self.fused_add_norm,
            self.residual_in_fp32,
        );

        (hidden_states, cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CheckpointedAutodiff;
    use crate::state::StateModule;
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;

    fn small_config() -> VisionMambaConfig {
        VisionMambaConfig::new()
            .with_depth(3)
            .with_input_channels(6)
            .with_embed_dim(8)
            .with_tokens_per_sequence(4)
            .with_d_state(4)
            .with_drop_path_rate(0.2)
    }

    fn max_abs_diff<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> f32 {
        (a - b).abs().max().into_scalar().elem::<f32>()
    }

    #[test]
    fn output_shape_is_batch_tokens_embed() {
        let device = Default::default();
        for (depth, embed_dim, tokens) in [(1, 8, 4), (2, 16, 3), (4, 8, 1)] {
            let model = small_config()
                .with_depth(depth)
                .with_embed_dim(embed_dim)
                .with_tokens_per_sequence(tokens)
                .init::<TestBackend>(&device)
                .unwrap();
            for batch in [1, 3] {
                let x = Tensor::<TestBackend, 2>::random(
                    [batch * tokens, 6],
                    Distribution::Default,
                    &device,
                );
                let y = model.forward(x).unwrap();
                assert_eq!([batch, tokens, embed_dim], y.dims());
            }
        }
    }

    #[test]
    fn indivisible_rows_are_a_shape_error() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let x = Tensor::<TestBackend, 2>::zeros([7, 6], &device);
        assert!(matches!(model.forward(x), Err(VimError::Shape(_))));

        let x = Tensor::<TestBackend, 2>::zeros([8, 5], &device);
        assert!(matches!(model.forward(x), Err(VimError::Shape(_))));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let device = Default::default();
        let fused_identity = small_config()
            .with_norm(NormKind::Identity)
            .with_fused_add_norm(true);
        assert!(matches!(
            fused_identity.init::<TestBackend>(&device),
            Err(VimError::Config(_))
        ));
        for config in [
            small_config().with_depth(0),
            small_config().with_d_conv(0),
            small_config().with_d_state(0),
            small_config().with_expand(0),
            small_config().with_drop_rate(1.5),
            small_config().with_drop_path_rate(-0.1),
        ] {
            assert!(matches!(
                config.init::<TestBackend>(&device),
                Err(VimError::Config(_))
            ));
        }
    }

    #[test]
    fn positional_embedding_is_opt_in() {
        let device = Default::default();
        let config = small_config();
        assert!(!config.add_pos_embed);

        let plain = config.init::<TestBackend>(&device).unwrap();
        let with_pos = config
            .clone()
            .with_add_pos_embed(true)
            .init::<TestBackend>(&device)
            .unwrap()
            .load_state(&plain.state_dict())
            .unwrap();

        let x = Tensor::<TestBackend, 2>::random([8, 6], Distribution::Default, &device);
        let projected = plain
            .embedding
            .forward(x.clone())
            .reshape([2, 4, 8]);
        assert_eq!(max_abs_diff(plain.embed(x.clone()).unwrap(), projected.clone()), 0.);

        let shifted = projected + plain.pos_embed.val().expand([2, 4, 8]);
        assert!(max_abs_diff(with_pos.embed(x).unwrap(), shifted) < 1e-6);
    }

    #[test]
    fn embedding_keeps_default_weights_with_zero_bias() {
        let device = Default::default();
        let model = small_config()
            .with_input_channels(16)
            .init::<TestBackend>(&device)
            .unwrap();
        let proj = &model.embedding.proj;
        let bias = proj.bias.as_ref().unwrap().val();
        assert_eq!(bias.abs().max().into_scalar(), 0.);

        // U(-1/√fan_in, 1/√fan_in)
        let largest = proj.weight.val().abs().max().into_scalar();
        assert!(largest <= 0.25 + 1e-6);
        assert!(largest > 0.1);
    }

    #[test]
    fn drop_path_rates_rise_to_the_maximum() {
        let device = Default::default();
        let model = small_config()
            .with_depth(5)
            .init::<TestBackend>(&device)
            .unwrap();
        let rates: Vec<f64> = model.layers.iter().map(|l| l.drop_path.prob).collect();
        assert_eq!(rates[0], 0.0);
        assert_eq!(rates[4], 0.2);
        assert!(rates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(model.drop_path.prob, 0.2);
    }

    #[test]
    fn checkpointing_is_partial() {
        let device = Default::default();
        let model = small_config()
            .with_depth(4)
            .with_use_checkpoint(true)
            .with_checkpoint_num(2)
            .init::<TestBackend>(&device)
            .unwrap();
        use Execution::*;
        assert_eq!(model.checkpoint_plan(), vec![Recompute, Recompute, Retain, Retain]);

        let disabled = small_config()
            .with_checkpoint_num(2)
            .init::<TestBackend>(&device)
            .unwrap();
        assert!(disabled.checkpoint_plan().iter().all(|e| *e == Retain));
    }

    #[test]
    fn fused_and_unfused_models_agree() {
        let device = Default::default();
        for norm in [NormKind::LayerNorm, NormKind::RmsNorm] {
            let config = small_config().with_norm(norm);
            let fused = config.init::<TestBackend>(&device).unwrap();
            let unfused = config
                .clone()
                .with_fused_add_norm(false)
                .init::<TestBackend>(&device)
                .unwrap()
                .load_state(&fused.state_dict())
                .unwrap();
            assert!(!unfused.layers[0].fused_add_norm());

            let x = Tensor::<TestBackend, 2>::random([8, 6], Distribution::Default, &device);
            let y_fused = fused.forward(x.clone()).unwrap();
            let y_unfused = unfused.forward(x).unwrap();
            assert!(max_abs_diff(y_fused, y_unfused) < 1e-4);
        }
    }

    #[test]
    fn cached_forward_continues_sequences() {
        let device = Default::default();
        let model = small_config()
            .with_bimamba(false)
            .with_add_pos_embed(false)
            .init::<TestBackend>(&device)
            .unwrap();
        let x = Tensor::<TestBackend, 2>::random([8, 6], Distribution::Default, &device);

        let cache = model.allocate_inference_cache(2, 8, &device);
        let (y_first, cache) = model.forward_with_cache(x.clone(), cache).unwrap();
        assert_eq!(cache.seqlen_offset(), 4);
        assert!(max_abs_diff(y_first, model.forward(x.clone()).unwrap()) < 1e-5);

        let (y_next, cache) = model.forward_with_cache(x.clone(), cache).unwrap();
        assert_eq!([2, 4, 8], y_next.dims());
        assert_eq!(cache.seqlen_offset(), 8);

        // max_seqlen reached
        assert!(matches!(
            model.forward_with_cache(x, cache),
            Err(VimError::Cache(_))
        ));
    }

    #[test]
    fn cache_depth_must_match() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let shallow = small_config()
            .with_depth(1)
            .init::<TestBackend>(&device)
            .unwrap();
        let cache = shallow.allocate_inference_cache(2, 64, &device);
        let x = Tensor::<TestBackend, 2>::zeros([8, 6], &device);
        assert!(matches!(
            model.forward_with_cache(x, cache),
            Err(VimError::Cache(_))
        ));
    }

    #[test]
    fn cache_batch_must_match() {
        let device = Default::default();
        let model = small_config().init::<TestBackend>(&device).unwrap();
        let cache = model.allocate_inference_cache(3, 64, &device);
        let x = Tensor::<TestBackend, 2>::zeros([8, 6], &device);
        assert!(matches!(
            model.forward_with_cache(x, cache),
            Err(VimError::Cache(_))
        ));
    }

    #[test]
    fn recomputation_keeps_outputs_and_gradients() {
        type Retaining = Autodiff<TestBackend>;
        type Recomputing = CheckpointedAutodiff<TestBackend>;

        let device = Default::default();
        let config = small_config().with_drop_path_rate(0.0);
        let retaining = config.init::<Retaining>(&device).unwrap();
        let recomputing = config
            .clone()
            .with_use_checkpoint(true)
            .with_checkpoint_num(2)
            .init::<Recomputing>(&device)
            .unwrap();
        let recomputing = recomputing.load_state(&retaining.state_dict()).unwrap();

        let x = Tensor::<TestBackend, 2>::random([8, 6], Distribution::Default, &device);
        let y_a = retaining
            .forward(Tensor::from_inner(x.clone()))
            .unwrap();
        let y_b = recomputing.forward(Tensor::from_inner(x)).unwrap();
        assert!(max_abs_diff(y_a.clone().inner(), y_b.clone().inner()) < 1e-6);

        let grads_a = y_a.sum().backward();
        let grads_b = y_b.sum().backward();
        let g_a = retaining.embedding.proj.weight.grad(&grads_a).unwrap();
        let g_b = recomputing.embedding.proj.weight.grad(&grads_b).unwrap();
        assert!(max_abs_diff(g_a, g_b) < 1e-5);
    }
}
