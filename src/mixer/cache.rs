use crate::mixer::MambaConfig;
use burn::prelude::*;
use burn::{
    module::{Module, Param},
    nn::Initializer,
};

/// Incremental decoding state of one [Mamba](crate::mixer::Mamba) mixer.
#[derive(Module, Debug)]
pub struct MambaCache<B: Backend> {
    /// The last `d_conv` inputs of the causal conv.
    ///
    /// # Shape
    /// [batch, d_inner, d_conv]
    pub conv: Param<Tensor<B, 3>>,
    /// # Shape
    /// [batch, d_inner, d_state]
    pub ssm: Param<Tensor<B, 3>>,
    /// How many tokens have already been consumed.
    pub seqlen_offset: usize,
}

impl<B: Backend> MambaCache<B> {
    pub fn batch(&self) -> usize {
        self.conv.dims()[0]
    }
}

#[derive(Config, Debug)]
pub struct MambaCacheConfig {
    pub batch: usize,

    /// latent state dimension (`N` in Algorithm 2 from the Mamba paper).
    #[config(default = 16)]
    pub d_state: usize,

    #[config(default = 4)]
    pub d_conv: usize,

    pub d_inner: usize,
}

impl MambaCacheConfig {
    pub fn new_from_mixer_config(batch: usize, mixer_config: &MambaConfig) -> Self {
        Self {
            batch,
            d_state: mixer_config.d_state,
            d_conv: mixer_config.d_conv,
            d_inner: mixer_config.d_inner(),
        }
    }

    /// Returns the zeroed cache.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MambaCache<B> {
        let conv = Initializer::Zeros.init([self.batch, self.d_inner, self.d_conv], device);
        let ssm = Initializer::Zeros.init([self.batch, self.d_inner, self.d_state], device);
        MambaCache {
            conv,
            ssm,
            seqlen_offset: 0,
        }
    }
}

/// One [MambaCache] per block, indexed by block position.
#[derive(Module, Debug)]
pub struct InferenceCache<B: Backend> {
    /// # Shape
    /// [n_layers]
    pub caches: Vec<MambaCache<B>>,
    /// Upper bound on the total number of tokens fed through the cache.
    pub max_seqlen: usize,
}

impl<B: Backend> InferenceCache<B> {
    pub fn batch(&self) -> Option<usize> {
        self.caches.first().map(MambaCache::batch)
    }

    /// Tokens consumed so far. All blocks advance together.
    pub fn seqlen_offset(&self) -> usize {
        self.caches.first().map(|c| c.seqlen_offset).unwrap_or(0)
    }
}
