use burn::prelude::*;
use burn::tensor::Distribution;

/// Configuration to create a [DropPath] layer.
#[derive(Config, Debug)]
pub struct DropPathConfig {
    /// Probability of dropping a sample's whole branch.
    pub prob: f64,
}

impl DropPathConfig {
    pub fn init(&self) -> DropPath {
        DropPath { prob: self.prob }
    }
}

/// Stochastic depth ([Deep Networks with Stochastic Depth](https://arxiv.org/abs/1603.09382)).
///
/// During training, each sample of the batch has its whole input zeroed with probability `prob`;
/// surviving samples are scaled by `1 / (1 - prob)`. Outside of training (no autodiff backend)
/// this is the identity.
#[derive(Module, Clone, Debug)]
pub struct DropPath {
    pub prob: f64,
}

impl DropPath {
    /// # Shapes
    ///
    /// - input: `[batch, ...]`
    /// - output: `[batch, ...]`
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        if !B::ad_enabled() || self.prob <= 0.0 {
            return x;
        }
        if self.prob >= 1.0 {
            return x.zeros_like();
        }

        let keep = 1.0 - self.prob;
        let dims = x.dims();
        let mut mask_shape = [1; D];
        mask_shape[0] = dims[0];
        let mask = Tensor::<B, D>::random(mask_shape, Distribution::Bernoulli(keep), &x.device())
            .expand(dims);

        x * mask / keep
    }
}
