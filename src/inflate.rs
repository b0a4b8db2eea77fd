//! Adapts image-pretrained checkpoints to video models by inflating 2D kernels with a
//! temporal axis.

use crate::error::{Result, VimError};
use crate::model::VisionMamba;
use crate::state::{StateDict, StateModule, read_safetensors};
use burn::prelude::*;
use num_traits::Float;
use std::collections::BTreeMap;
use std::path::Path;

/// Classification head entries dropped from every checkpoint before merging.
pub const HEAD_KEYS: [&str; 2] = ["head.weight", "head.bias"];

/// Axis at which the temporal dimension is inserted: `[out, in, h, w] -> [out, in, t, h, w]`.
pub const TIME_AXIS: usize = 2;

/// Inflates a `[out, in, h, w]` kernel into `[out, in, time_dim, h, w]`.
///
/// With `center`, the kernel is placed at the temporal index `time_dim / 2` and every other
/// slice is zero. Otherwise it's replicated over every slice and divided by `time_dim`, so the
/// temporal sum equals the original kernel.
pub fn inflate_weight<B: Backend>(
    weight: Tensor<B, 4>,
    time_dim: usize,
    center: bool,
) -> Result<Tensor<B, 5>> {
    if time_dim == 0 {
        return Err(VimError::Shape("cannot inflate to an empty temporal axis".into()));
    }
    let [d_out, d_in, h, w] = weight.dims();
    let weight = weight.unsqueeze_dim::<5>(TIME_AXIS);

    if center {
        let mid = time_dim / 2;
        let zeros = Tensor::zeros([d_out, d_in, time_dim, h, w], &weight.device());
        Ok(zeros.slice_assign([0..d_out, 0..d_in, mid..mid + 1, 0..h, 0..w], weight))
    } else {
        Ok(weight.repeat_dim(TIME_AXIS, time_dim) / time_dim as f32)
    }
}

/// Same as [inflate_weight] over row-major values of any rank ≥ 2.
///
/// Returns the inflated values and shape.
pub fn inflate_values<E: Float>(
    values: &[E],
    shape: &[usize],
    time_dim: usize,
    center: bool,
) -> Result<(Vec<E>, Vec<usize>)> {
    if time_dim == 0 {
        return Err(VimError::Shape("cannot inflate to an empty temporal axis".into()));
    }
    if shape.len() < TIME_AXIS || shape.iter().product::<usize>() != values.len() {
        return Err(VimError::Shape(format!(
            "cannot inflate {} values of shape {shape:?}",
            values.len()
        )));
    }
    let scale = <E as num_traits::NumCast>::from(time_dim)
        .ok_or_else(|| VimError::Shape(format!("time_dim {time_dim} overflows the element type")))?;

    let inner: usize = shape[TIME_AXIS..].iter().product();
    let mid = time_dim / 2;
    let mut inflated = Vec::with_capacity(values.len() * time_dim);
    for block in values.chunks(inner.max(1)) {
        for t in 0..time_dim {
            if center {
                if t == mid {
                    inflated.extend_from_slice(block);
                } else {
                    inflated.extend(std::iter::repeat_n(E::zero(), block.len()));
                }
            } else {
                inflated.extend(block.iter().map(|v| *v / scale));
            }
        }
    }

    let mut inflated_shape = shape.to_vec();
    inflated_shape.insert(TIME_AXIS, time_dim);
    Ok((inflated, inflated_shape))
}

/// Outcome of [load_pretrained_with_inflation], with sorted key lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Loaded as is.
    pub applied: Vec<String>,
    /// Loaded after temporal inflation.
    pub inflated: Vec<String>,
    /// Present in both, with shapes that couldn't be reconciled.
    pub skipped: Vec<String>,
    /// Model parameters absent from the checkpoint. They keep their initialization.
    pub missing: Vec<String>,
    /// Checkpoint entries the model doesn't have.
    pub unexpected: Vec<String>,
}

/// Merges `checkpoint` into `model`, non-strictly.
///
/// [HEAD_KEYS] are stripped. An entry whose shape differs from the model's is inflated when
/// the model parameter has more than 3 dims and is one temporal axis away from the entry;
/// any other mismatch is skipped with a warning.
pub fn load_pretrained_with_inflation<M: StateModule>(
    model: M,
    mut checkpoint: StateDict,
    center: bool,
) -> Result<(M, LoadReport)> {
    for key in HEAD_KEYS {
        if checkpoint.remove(key).is_some() {
            tracing::info!(key, "removed classification head entry");
        }
    }

    let expected: BTreeMap<String, Vec<usize>> = model
        .param_infos()
        .into_iter()
        .map(|info| (info.path, info.shape))
        .collect();

    let mut report = LoadReport::default();
    let mut merged = StateDict::new();
    for (key, data) in checkpoint {
        let Some(target) = expected.get(&key) else {
            report.unexpected.push(key);
            continue;
        };
        if data.shape == *target {
            report.applied.push(key.clone());
            merged.insert(key, data);
            continue;
        }
        if target.len() <= 3 {
            tracing::warn!(key, from = ?data.shape, to = ?target, "shape mismatch, entry skipped");
            report.skipped.push(key);
            continue;
        }

        let mut spatial = target.clone();
        let time_dim = spatial.remove(TIME_AXIS);
        if data.shape != spatial {
            tracing::warn!(key, from = ?data.shape, to = ?target, "not inflatable, entry skipped");
            report.skipped.push(key);
            continue;
        }

        let values = data
            .to_vec::<f32>()
            .map_err(|e| VimError::Checkpoint(format!("{key}: {e:?}")))?;
        let (values, shape) = inflate_values(&values, &data.shape, time_dim, center)?;
        tracing::info!(key, from = ?data.shape, to = ?shape, center, "inflated entry");
        report.inflated.push(key.clone());
        merged.insert(key, TensorData::new(values, shape));
    }
    report.missing = expected
        .into_keys()
        .filter(|key| !merged.contains_key(key) && !report.skipped.contains(key))
        .collect();

    let model = model.import_state("", &mut merged)?;
    tracing::info!(
        applied = report.applied.len(),
        inflated = report.inflated.len(),
        skipped = report.skipped.len(),
        missing = report.missing.len(),
        unexpected = report.unexpected.len(),
        "checkpoint merged"
    );
    Ok((model, report))
}

impl<B: Backend> VisionMamba<B> {
    /// Reads a safetensors checkpoint and merges it with [load_pretrained_with_inflation].
    pub fn load_pretrained(self, path: impl AsRef<Path>, center: bool) -> Result<(Self, LoadReport)> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading pretrained checkpoint");
        let checkpoint = read_safetensors(path)?;
        load_pretrained_with_inflation(self, checkpoint, center)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::{Norm, NormConfig, NormKind};
    use crate::state::{OwnerKind, ParamInfo, write_safetensors};
    use burn::backend::NdArray;
    use burn::nn::conv::{Conv3d, Conv3dConfig};
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;

    /// A video patch embedding: the only kind of module with rank-5 kernels.
    #[derive(Module, Debug)]
    struct VideoStem<B: Backend> {
        conv: Conv3d<B>,
        norm: Norm<B>,
    }

    impl<B: Backend> VideoStem<B> {
        fn new(device: &B::Device) -> Self {
            Self {
                conv: Conv3dConfig::new([3, 4], [3, 2, 2]).init(device),
                norm: NormConfig::new(4).with_kind(NormKind::LayerNorm).init(device),
            }
        }
    }

    impl<B: Backend> StateModule for VideoStem<B> {
        fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
            self.conv.visit_params(&format!("{prefix}conv."), out);
            self.norm.visit_params(&format!("{prefix}norm."), out);
        }

        fn export_state(&self, prefix: &str, state: &mut StateDict) {
            self.conv.export_state(&format!("{prefix}conv."), state);
            self.norm.export_state(&format!("{prefix}norm."), state);
        }

        fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
            self.conv = self.conv.import_state(&format!("{prefix}conv."), state)?;
            self.norm = self.norm.import_state(&format!("{prefix}norm."), state)?;
            Ok(self)
        }
    }

    fn kernel_2d() -> Tensor<TestBackend, 4> {
        Tensor::random([4, 3, 2, 2], Distribution::Default, &Default::default())
    }

    #[test]
    fn centered_inflation_fills_the_middle_slice() {
        let weight = kernel_2d();
        let inflated = inflate_weight(weight.clone(), 5, true).unwrap();
        assert_eq!([4, 3, 5, 2, 2], inflated.dims());

        for t in 0..5 {
            let slice = inflated.clone().narrow(2, t, 1).squeeze_dim::<4>(2);
            let diff = if t == 2 {
                (slice - weight.clone()).abs().max().into_scalar()
            } else {
                slice.abs().max().into_scalar()
            };
            assert_eq!(diff, 0.);
        }
    }

    #[test]
    fn averaged_inflation_sums_back() {
        let weight = kernel_2d();
        let inflated = inflate_weight(weight.clone(), 4, false).unwrap();
        let summed = inflated.sum_dim(2).squeeze_dim::<4>(2);
        assert!((summed - weight).abs().max().into_scalar() < 1e-6);
    }

    #[test]
    fn values_inflation_agrees_with_tensors() {
        let weight = kernel_2d();
        let values = weight.to_data().to_vec::<f32>().unwrap();
        for center in [true, false] {
            let (inflated, shape) = inflate_values(&values, &[4, 3, 2, 2], 3, center).unwrap();
            assert_eq!(shape, vec![4, 3, 3, 2, 2]);
            let expected = inflate_weight(weight.clone(), 3, center)
                .unwrap()
                .into_data()
                .to_vec::<f32>()
                .unwrap();
            for (a, b) in inflated.iter().zip(&expected) {
                assert!((a - b).abs() < 1e-7);
            }
        }
    }

    #[test]
    fn empty_temporal_axis_is_a_shape_error() {
        assert!(matches!(
            inflate_weight(kernel_2d(), 0, true),
            Err(VimError::Shape(_))
        ));
        assert!(matches!(
            inflate_values(&[1f64, 2.], &[3], 2, false),
            Err(VimError::Shape(_))
        ));
    }

    #[test]
    fn merge_inflates_skips_and_reports() {
        let device = Default::default();
        let stem = VideoStem::<TestBackend>::new(&device);
        let infos = stem.param_infos();
        assert!(infos.iter().any(|p| p.owner == OwnerKind::Conv));

        let kernel = vec![0.5f32; 4 * 3 * 2 * 2];
        let mut checkpoint = StateDict::new();
        checkpoint.insert("conv.weight".into(), TensorData::new(kernel, [4, 3, 2, 2]));
        checkpoint.insert("norm.weight".into(), TensorData::new(vec![1f32; 3], [3]));
        checkpoint.insert("norm.bias".into(), TensorData::new(vec![0.25f32; 4], [4]));
        checkpoint.insert("head.weight".into(), TensorData::new(vec![0f32; 8], [2, 4]));
        checkpoint.insert("extra".into(), TensorData::new(vec![0f32], [1]));

        let (stem, report) = load_pretrained_with_inflation(stem, checkpoint, true).unwrap();
        assert_eq!(report.applied, vec!["norm.bias".to_string()]);
        assert_eq!(report.inflated, vec!["conv.weight".to_string()]);
        assert_eq!(report.skipped, vec!["norm.weight".to_string()]);
        assert_eq!(report.missing, vec!["conv.bias".to_string()]);
        assert_eq!(report.unexpected, vec!["extra".to_string()]);

        let weight = stem.conv.weight.val();
        assert_eq!([4, 3, 3, 2, 2], weight.dims());
        let middle = weight.clone().narrow(2, 1, 1).min().into_scalar();
        let first = weight.narrow(2, 0, 1).abs().max().into_scalar();
        assert_eq!(middle, 0.5);
        assert_eq!(first, 0.);
        let bias = stem.norm.bias.as_ref().unwrap().val();
        assert_eq!(bias.min().into_scalar(), 0.25);
    }

    #[test]
    fn missing_head_keys_are_tolerated() {
        let device = Default::default();
        let stem = VideoStem::<TestBackend>::new(&device);
        let checkpoint = stem.state_dict();
        let (_, report) = load_pretrained_with_inflation(stem, checkpoint, false).unwrap();
        assert_eq!(report.applied.len(), 4);
        assert!(report.inflated.is_empty());
        assert!(report.missing.is_empty());
    }

    #[test]
    fn pretrained_file_loads_into_the_model() {
        let device = Default::default();
        let config = crate::VisionMambaConfig::new()
            .with_depth(2)
            .with_input_channels(6)
            .with_embed_dim(8)
            .with_tokens_per_sequence(4)
            .with_d_state(4);
        let source = config.init::<TestBackend>(&device).unwrap();
        let mut state = source.state_dict();
        state.insert("head.weight".into(), TensorData::new(vec![0f32; 16], [2, 8]));
        state.insert("head.bias".into(), TensorData::new(vec![0f32; 2], [2]));

        let path = std::env::temp_dir().join(format!(
            "vision-mamba-pretrained-{}.safetensors",
            std::process::id()
        ));
        write_safetensors(&path, &state).unwrap();
        let target = config.init::<TestBackend>(&device).unwrap();
        let (target, report) = target.load_pretrained(&path, true).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(report.applied.len(), state.len() - 2);
        assert!(report.unexpected.is_empty());
        let x = Tensor::<TestBackend, 2>::random([4, 6], Distribution::Default, &device);
        let diff = (source.forward(x.clone()).unwrap() - target.forward(x).unwrap())
            .abs()
            .max()
            .into_scalar();
        assert!(diff < 1e-6);
    }
}
