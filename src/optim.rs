//! AdamW with separate weight decay groups and a linear warmup schedule.

use crate::state::{OwnerKind, ParamInfo, StateModule};
use burn::module::{AutodiffModule, ParamId};
use burn::optim::adaptor::OptimizerAdaptor;
use burn::lr_scheduler::LrScheduler;
use burn::optim::{AdamW, AdamWConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<ParamInfo>,
    pub weight_decay: f32,
}

impl ParamGroup {
    pub fn ids(&self) -> Vec<ParamId> {
        self.params.iter().map(|p| p.id).collect()
    }
}

/// Every parameter of a model, in exactly one of the two groups.
#[derive(Debug, Clone)]
pub struct ParamGroups {
    pub decay: ParamGroup,
    /// Always has a weight decay of 0.
    pub no_decay: ParamGroup,
}

/// Whether a parameter is exempt from weight decay: it belongs to a norm, is a bias, or was
/// marked by its mixer.
pub fn skips_weight_decay(param: &ParamInfo) -> bool {
    param.owner == OwnerKind::Norm || param.name() == "bias" || param.no_weight_decay
}

/// Splits the parameters of `model` by [skips_weight_decay], keeping traversal order.
pub fn group_parameters<M: StateModule>(model: &M, weight_decay: f32) -> ParamGroups {
    let (no_decay, decay): (Vec<_>, Vec<_>) = model
        .param_infos()
        .into_iter()
        .partition(skips_weight_decay);
    ParamGroups {
        decay: ParamGroup {
            params: decay,
            weight_decay,
        },
        no_decay: ParamGroup {
            params: no_decay,
            weight_decay: 0.0,
        },
    }
}

/// Learning rate factor at `step`: rises linearly from 0 to 1 over `warmup` steps, then stays at 1.
pub fn linear_warmup(step: usize, warmup: usize) -> f64 {
    if warmup == 0 {
        return 1.0;
    }
    step.min(warmup) as f64 / warmup as f64
}

#[derive(Config, Debug)]
pub struct LinearWarmupConfig {
    pub base_lr: f64,
    pub warmup_steps: usize,
}

impl LinearWarmupConfig {
    pub fn init(&self) -> LinearWarmup {
        LinearWarmup {
            base_lr: self.base_lr,
            warmup_steps: self.warmup_steps,
            step: 0,
        }
    }
}

/// `base_lr * linear_warmup(step, warmup_steps)`, starting at step 0.
#[derive(Clone, Debug)]
pub struct LinearWarmup {
    base_lr: f64,
    warmup_steps: usize,
    step: usize,
}

impl LrScheduler for LinearWarmup {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> burn::optim::LearningRate {
        let lr = self.base_lr * linear_warmup(self.step, self.warmup_steps);
        self.step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.step = record;
        self
    }
}

/// Two [AdamW] optimizers over disjoint parameter groups, sharing every setting but the
/// weight decay.
pub struct GroupedAdamW<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    decay: OptimizerAdaptor<AdamW, M, B>,
    no_decay: OptimizerAdaptor<AdamW, M, B>,
    decay_ids: Vec<ParamId>,
    no_decay_ids: Vec<ParamId>,
}

impl<M, B> GroupedAdamW<M, B>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    /// The weight decay of `config` is replaced by each group's.
    pub fn new(config: &AdamWConfig, groups: &ParamGroups) -> Self {
        tracing::info!(
            decay = groups.decay.params.len(),
            no_decay = groups.no_decay.params.len(),
            weight_decay = groups.decay.weight_decay,
            "grouped optimizer"
        );
        Self {
            decay: config
                .clone()
                .with_weight_decay(groups.decay.weight_decay)
                .init::<B, M>(),
            no_decay: config
                .clone()
                .with_weight_decay(groups.no_decay.weight_decay)
                .init::<B, M>(),
            decay_ids: groups.decay.ids(),
            no_decay_ids: groups.no_decay.ids(),
        }
    }

    pub fn step(&mut self, lr: burn::optim::LearningRate, module: M, mut grads: B::Gradients) -> M {
        let decay_grads = GradientsParams::from_params(&mut grads, &module, &self.decay_ids);
        let no_decay_grads = GradientsParams::from_params(&mut grads, &module, &self.no_decay_ids);
        let module = self.decay.step(lr, module, decay_grads);
        self.no_decay.step(lr, module, no_decay_grads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VisionMamba, VisionMambaConfig};
    use crate::norm::NormKind;
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Distribution;
    use std::collections::HashSet;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn small_model<B: Backend>(norm: NormKind) -> VisionMamba<B> {
        VisionMambaConfig::new()
            .with_depth(2)
            .with_input_channels(6)
            .with_embed_dim(8)
            .with_tokens_per_sequence(4)
            .with_d_state(4)
            .with_drop_path_rate(0.0)
            .with_norm(norm)
            .init(&Default::default())
            .unwrap()
    }

    #[test]
    fn groups_partition_the_parameters() {
        for norm in [NormKind::LayerNorm, NormKind::RmsNorm] {
            let model = small_model::<TestBackend>(norm);
            let groups = group_parameters(&model, 0.05);
            let all: Vec<ParamId> = model.param_infos().iter().map(|p| p.id).collect();

            let decay: HashSet<ParamId> = groups.decay.ids().into_iter().collect();
            let no_decay: HashSet<ParamId> = groups.no_decay.ids().into_iter().collect();
            assert!(decay.is_disjoint(&no_decay));
            assert_eq!(decay.len() + no_decay.len(), all.len());
            assert!(all.iter().all(|id| decay.contains(id) || no_decay.contains(id)));
            assert_eq!(groups.decay.weight_decay, 0.05);
            assert_eq!(groups.no_decay.weight_decay, 0.0);
        }
    }

    #[test]
    fn groups_follow_the_decay_policy() {
        let model = small_model::<TestBackend>(NormKind::LayerNorm);
        let groups = group_parameters(&model, 0.1);
        let names = |group: &ParamGroup| -> Vec<String> {
            group.params.iter().map(|p| p.path.clone()).collect()
        };
        let decay = names(&groups.decay);
        let no_decay = names(&groups.no_decay);

        for path in [
            "layers.0.norm.weight",
            "layers.0.norm.bias",
            "norm_f.weight",
            "embedding.proj.bias",
            "layers.1.mixer.dt_proj_b.bias",
            "layers.1.mixer.A_log",
            "layers.1.mixer.D_b",
        ] {
            assert!(no_decay.contains(&path.to_string()), "{path} should not decay");
        }
        for path in [
            "embedding.proj.weight",
            "pos_embed",
            "layers.0.mixer.in_proj.weight",
            "layers.0.mixer.conv1d.weight",
            "layers.1.mixer.out_proj.weight",
        ] {
            assert!(decay.contains(&path.to_string()), "{path} should decay");
        }

        // traversal order is kept
        let order: Vec<String> = model.param_infos().into_iter().map(|p| p.path).collect();
        let position = |path: &String| order.iter().position(|p| p == path).unwrap();
        assert!(decay.windows(2).all(|w| position(&w[0]) < position(&w[1])));
    }

    #[test]
    fn warmup_factor() {
        assert_eq!(linear_warmup(0, 4), 0.0);
        assert_eq!(linear_warmup(1, 4), 0.25);
        assert_eq!(linear_warmup(4, 4), 1.0);
        assert_eq!(linear_warmup(100, 4), 1.0);
        assert_eq!(linear_warmup(3, 0), 1.0);
    }

    #[test]
    fn warmup_scheduler_steps_and_resumes() {
        let mut scheduler = LinearWarmupConfig::new(1e-3, 2).init();
        let lrs: Vec<f64> = (0..4).map(|_| scheduler.step()).collect();
        assert_eq!(lrs[0], 0.0);
        assert!((lrs[1] - 5e-4).abs() < 1e-12);
        assert_eq!(lrs[2], 1e-3);
        assert_eq!(lrs[3], 1e-3);

        let record = LrScheduler::to_record::<TestBackend>(&scheduler);
        let mut resumed = LinearWarmupConfig::new(1e-3, 8)
            .init()
            .load_record::<TestBackend>(record);
        assert!((resumed.step() - 5e-4).abs() < 1e-12);
    }

    #[test]
    fn grouped_step_updates_both_groups() {
        let device = Default::default();
        let model = small_model::<TestAutodiffBackend>(NormKind::LayerNorm);
        let groups = group_parameters(&model, 0.05);
        let mut optim = GroupedAdamW::new(&AdamWConfig::new(), &groups);

        let before_weight = model.embedding.proj.weight.val().inner();
        let before_norm = model.norm_f.weight.as_ref().unwrap().val().inner();

        let x = Tensor::<TestAutodiffBackend, 2>::random([8, 6], Distribution::Default, &device);
        let loss = model.forward(x).unwrap().powf_scalar(2.0).mean();
        let grads = loss.backward();
        let model = optim.step(1e-2, model, grads);

        let after_weight = model.embedding.proj.weight.val().inner();
        let after_norm = model.norm_f.weight.as_ref().unwrap().val().inner();
        let moved = |a: Tensor<TestBackend, 2>, b: Tensor<TestBackend, 2>| {
            (a - b).abs().max().into_scalar() > 0.
        };
        assert!(moved(before_weight, after_weight));
        assert!(moved(before_norm.unsqueeze(), after_norm.unsqueeze()));
    }
}
