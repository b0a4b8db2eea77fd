//! Named parameter trees and safetensors checkpoints.
//!
//! Keys and layouts follow the PyTorch naming of the pretrained checkpoints
//! (`layers.0.mixer.in_proj.weight`, `layers.0.mixer.A_b_log`, `norm_f.weight`, ...).
//! Linear weights are stored as `[d_output, d_input]`.

use crate::block::NormResidualBlock;
use crate::error::{Result, VimError};
use crate::mixer::{Mamba, ScanBranch};
use crate::model::{Embedding, VisionMamba};
use crate::norm::Norm;
use burn::module::{Param, ParamId};
use burn::nn::Linear;
use burn::nn::conv::{Conv1d, Conv3d};
use burn::prelude::*;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use std::collections::BTreeMap;
use std::path::Path;

/// Parameter values keyed by their dotted path.
pub type StateDict = BTreeMap<String, TensorData>;

/// Kind of the submodule that directly owns a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Linear,
    Conv,
    Norm,
    /// A parameter held directly by a model or mixer, such as `pos_embed` or `A_log`.
    Direct,
}

#[derive(Debug, Clone)]
pub struct ParamInfo {
    /// Dotted path, e.g. `layers.3.mixer.x_proj_b.weight`.
    pub path: String,
    pub owner: OwnerKind,
    /// Set by the mixer on parameters that must not be weight decayed.
    pub no_weight_decay: bool,
    /// Shape as stored in a [StateDict].
    pub shape: Vec<usize>,
    pub id: ParamId,
}

impl ParamInfo {
    /// Last component of the path.
    pub fn name(&self) -> &str {
        self.path.rsplit('.').next().unwrap_or(&self.path)
    }
}

/// Modules whose parameters can be listed, exported and loaded by name.
pub trait StateModule: Sized {
    /// Appends the parameters in traversal order.
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>);

    fn export_state(&self, prefix: &str, state: &mut StateDict);

    /// Loads the matching entries, removing them from `state`.
    ///
    /// Parameters without an entry keep their current value.
    fn import_state(self, prefix: &str, state: &mut StateDict) -> Result<Self>;

    fn param_infos(&self) -> Vec<ParamInfo> {
        let mut out = vec![];
        self.visit_params("", &mut out);
        out
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        self.export_state("", &mut state);
        state
    }

    /// Loads every matching entry of `state`; other entries are ignored.
    fn load_state(self, state: &StateDict) -> Result<Self> {
        let mut state = state.clone();
        self.import_state("", &mut state)
    }
}

fn info<B: Backend, const D: usize>(
    param: &Param<Tensor<B, D>>,
    path: String,
    owner: OwnerKind,
    no_weight_decay: bool,
) -> ParamInfo {
    ParamInfo {
        path,
        owner,
        no_weight_decay,
        shape: param.dims().to_vec(),
        id: param.id,
    }
}

fn import_param<B: Backend, const D: usize>(
    param: Param<Tensor<B, D>>,
    key: &str,
    state: &mut StateDict,
) -> Result<Param<Tensor<B, D>>> {
    let Some(data) = state.remove(key) else {
        return Ok(param);
    };
    let expected = param.dims();
    if data.shape != expected {
        return Err(VimError::Checkpoint(format!(
            "{key}: expected shape {expected:?}, got {:?}",
            data.shape
        )));
    }
    Ok(param.map(|tensor| {
        let dtype = tensor.dtype();
        crate::utils::cast_float(Tensor::from_data(data, &tensor.device()), dtype)
    }))
}

fn import_optional<B: Backend, const D: usize>(
    param: Option<Param<Tensor<B, D>>>,
    key: &str,
    state: &mut StateDict,
) -> Result<Option<Param<Tensor<B, D>>>> {
    param.map(|param| import_param(param, key, state)).transpose()
}

impl<B: Backend> StateModule for Linear<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        let mut weight = info(&self.weight, format!("{prefix}weight"), OwnerKind::Linear, false);
        weight.shape.reverse();
        out.push(weight);
        if let Some(bias) = &self.bias {
            out.push(info(bias, format!("{prefix}bias"), OwnerKind::Linear, false));
        }
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        state.insert(
            format!("{prefix}weight"),
            self.weight.val().transpose().into_data(),
        );
        if let Some(bias) = &self.bias {
            state.insert(format!("{prefix}bias"), bias.val().into_data());
        }
    }

    fn import_state(self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        // stored as [d_output, d_input]
        let key = format!("{prefix}weight");
        let weight = match state.remove(&key) {
            Some(data) => {
                let [d_input, d_output] = self.weight.dims();
                if data.shape != [d_output, d_input] {
                    return Err(VimError::Checkpoint(format!(
                        "{key}: expected shape {:?}, got {:?}",
                        [d_output, d_input],
                        data.shape
                    )));
                }
                self.weight.map(|tensor| {
                    let dtype = tensor.dtype();
                    let loaded = Tensor::<B, 2>::from_data(data, &tensor.device()).transpose();
                    crate::utils::cast_float(loaded, dtype)
                })
            }
            None => self.weight,
        };
        let bias = import_optional(self.bias, &format!("{prefix}bias"), state)?;
        Ok(Linear { weight, bias })
    }
}

macro_rules! conv_state_module {
    ($conv:ident) => {
        impl<B: Backend> StateModule for $conv<B> {
            fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
                out.push(info(&self.weight, format!("{prefix}weight"), OwnerKind::Conv, false));
                if let Some(bias) = &self.bias {
                    out.push(info(bias, format!("{prefix}bias"), OwnerKind::Conv, false));
                }
            }

            fn export_state(&self, prefix: &str, state: &mut StateDict) {
                state.insert(format!("{prefix}weight"), self.weight.val().into_data());
                if let Some(bias) = &self.bias {
                    state.insert(format!("{prefix}bias"), bias.val().into_data());
                }
            }

            fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
                self.weight = import_param(self.weight, &format!("{prefix}weight"), state)?;
                self.bias = import_optional(self.bias, &format!("{prefix}bias"), state)?;
                Ok(self)
            }
        }
    };
}

conv_state_module!(Conv1d);
conv_state_module!(Conv3d);

impl<B: Backend> StateModule for Norm<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        if let Some(weight) = &self.weight {
            out.push(info(weight, format!("{prefix}weight"), OwnerKind::Norm, false));
        }
        if let Some(bias) = &self.bias {
            out.push(info(bias, format!("{prefix}bias"), OwnerKind::Norm, false));
        }
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        if let Some(weight) = &self.weight {
            state.insert(format!("{prefix}weight"), weight.val().into_data());
        }
        if let Some(bias) = &self.bias {
            state.insert(format!("{prefix}bias"), bias.val().into_data());
        }
    }

    fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        self.weight = import_optional(self.weight, &format!("{prefix}weight"), state)?;
        self.bias = import_optional(self.bias, &format!("{prefix}bias"), state)?;
        Ok(self)
    }
}

/// Key names of one scan direction.
struct BranchKeys {
    conv1d: &'static str,
    x_proj: &'static str,
    dt_proj: &'static str,
    a_log: &'static str,
    d: &'static str,
}

const FORWARD_KEYS: BranchKeys = BranchKeys {
    conv1d: "conv1d",
    x_proj: "x_proj",
    dt_proj: "dt_proj",
    a_log: "A_log",
    d: "D",
};

const BACKWARD_KEYS: BranchKeys = BranchKeys {
    conv1d: "conv1d_b",
    x_proj: "x_proj_b",
    dt_proj: "dt_proj_b",
    a_log: "A_b_log",
    d: "D_b",
};

impl<B: Backend> ScanBranch<B> {
    fn visit_params(&self, prefix: &str, keys: &BranchKeys, out: &mut Vec<ParamInfo>) {
        self.conv1d.visit_params(&format!("{prefix}{}.", keys.conv1d), out);
        self.x_proj.visit_params(&format!("{prefix}{}.", keys.x_proj), out);
        self.dt_proj.visit_params(&format!("{prefix}{}.", keys.dt_proj), out);
        out.push(info(&self.a_log, format!("{prefix}{}", keys.a_log), OwnerKind::Direct, true));
        out.push(info(&self.d, format!("{prefix}{}", keys.d), OwnerKind::Direct, true));
    }

    fn export_state(&self, prefix: &str, keys: &BranchKeys, state: &mut StateDict) {
        self.conv1d.export_state(&format!("{prefix}{}.", keys.conv1d), state);
        self.x_proj.export_state(&format!("{prefix}{}.", keys.x_proj), state);
        self.dt_proj.export_state(&format!("{prefix}{}.", keys.dt_proj), state);
        state.insert(format!("{prefix}{}", keys.a_log), self.a_log.val().into_data());
        state.insert(format!("{prefix}{}", keys.d), self.d.val().into_data());
    }

    fn import_state(mut self, prefix: &str, keys: &BranchKeys, state: &mut StateDict) -> Result<Self> {
        self.conv1d = self.conv1d.import_state(&format!("{prefix}{}.", keys.conv1d), state)?;
        self.x_proj = self.x_proj.import_state(&format!("{prefix}{}.", keys.x_proj), state)?;
        self.dt_proj = self.dt_proj.import_state(&format!("{prefix}{}.", keys.dt_proj), state)?;
        self.a_log = import_param(self.a_log, &format!("{prefix}{}", keys.a_log), state)?;
        self.d = import_param(self.d, &format!("{prefix}{}", keys.d), state)?;
        Ok(self)
    }
}

impl<B: Backend> StateModule for Mamba<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        self.in_proj.visit_params(&format!("{prefix}in_proj."), out);
        self.forward_scan.visit_params(prefix, &FORWARD_KEYS, out);
        if let Some(backward_scan) = &self.backward_scan {
            backward_scan.visit_params(prefix, &BACKWARD_KEYS, out);
        }
        self.out_proj.visit_params(&format!("{prefix}out_proj."), out);
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        self.in_proj.export_state(&format!("{prefix}in_proj."), state);
        self.forward_scan.export_state(prefix, &FORWARD_KEYS, state);
        if let Some(backward_scan) = &self.backward_scan {
            backward_scan.export_state(prefix, &BACKWARD_KEYS, state);
        }
        self.out_proj.export_state(&format!("{prefix}out_proj."), state);
    }

    fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        self.in_proj = self.in_proj.import_state(&format!("{prefix}in_proj."), state)?;
        self.forward_scan = self
            .forward_scan
            .import_state(prefix, &FORWARD_KEYS, state)?;
        self.backward_scan = self
            .backward_scan
            .map(|branch| branch.import_state(prefix, &BACKWARD_KEYS, state))
            .transpose()?;
        self.out_proj = self.out_proj.import_state(&format!("{prefix}out_proj."), state)?;
        Ok(self)
    }
}

impl<B: Backend> StateModule for NormResidualBlock<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        self.mixer.visit_params(&format!("{prefix}mixer."), out);
        self.norm.visit_params(&format!("{prefix}norm."), out);
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        self.mixer.export_state(&format!("{prefix}mixer."), state);
        self.norm.export_state(&format!("{prefix}norm."), state);
    }

    fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        self.mixer = self.mixer.import_state(&format!("{prefix}mixer."), state)?;
        self.norm = self.norm.import_state(&format!("{prefix}norm."), state)?;
        Ok(self)
    }
}

impl<B: Backend> StateModule for Embedding<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        self.proj.visit_params(&format!("{prefix}proj."), out);
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        self.proj.export_state(&format!("{prefix}proj."), state);
    }

    fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        self.proj = self.proj.import_state(&format!("{prefix}proj."), state)?;
        Ok(self)
    }
}

impl<B: Backend> StateModule for VisionMamba<B> {
    fn visit_params(&self, prefix: &str, out: &mut Vec<ParamInfo>) {
        self.embedding.visit_params(&format!("{prefix}embedding."), out);
        out.push(info(&self.pos_embed, format!("{prefix}pos_embed"), OwnerKind::Direct, false));
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_params(&format!("{prefix}layers.{i}."), out);
        }
        self.norm_f.visit_params(&format!("{prefix}norm_f."), out);
    }

    fn export_state(&self, prefix: &str, state: &mut StateDict) {
        self.embedding.export_state(&format!("{prefix}embedding."), state);
        state.insert(format!("{prefix}pos_embed"), self.pos_embed.val().into_data());
        for (i, layer) in self.layers.iter().enumerate() {
            layer.export_state(&format!("{prefix}layers.{i}."), state);
        }
        self.norm_f.export_state(&format!("{prefix}norm_f."), state);
    }

    fn import_state(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        self.embedding = self.embedding.import_state(&format!("{prefix}embedding."), state)?;
        self.pos_embed = import_param(self.pos_embed, &format!("{prefix}pos_embed"), state)?;
        self.layers = self
            .layers
            .into_iter()
            .enumerate()
            .map(|(i, layer)| layer.import_state(&format!("{prefix}layers.{i}."), state))
            .collect::<Result<_>>()?;
        self.norm_f = self.norm_f.import_state(&format!("{prefix}norm_f."), state)?;
        Ok(self)
    }
}

pub fn read_safetensors(path: impl AsRef<Path>) -> Result<StateDict> {
    let bytes = std::fs::read(path.as_ref())?;
    read_safetensors_bytes(&bytes)
}

/// Decodes every tensor as f32. Accepts F64, F32, F16 and BF16 entries.
pub fn read_safetensors_bytes(bytes: &[u8]) -> Result<StateDict> {
    let tensors = SafeTensors::deserialize(bytes)?;
    let mut state = StateDict::new();
    for (name, view) in tensors.tensors() {
        let raw = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F64 => raw
                .chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
            Dtype::F32 => raw
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::F16 => raw
                .chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            Dtype::BF16 => raw
                .chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            other => {
                return Err(VimError::Checkpoint(format!(
                    "{name}: unsupported dtype {other:?}"
                )));
            }
        };
        state.insert(name, TensorData::new(values, view.shape().to_vec()));
    }
    Ok(state)
}

/// Encodes `state` as f32 safetensors.
pub fn write_safetensors_bytes(state: &StateDict) -> Result<Vec<u8>> {
    let mut buffers = Vec::with_capacity(state.len());
    for (name, data) in state {
        let values = data
            .to_vec::<f32>()
            .map_err(|e| VimError::Checkpoint(format!("{name}: {e:?}")))?;
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        buffers.push((name.clone(), data.shape.clone(), bytes));
    }
    let views = buffers
        .iter()
        .map(|(name, shape, bytes)| Ok((name.clone(), TensorView::new(Dtype::F32, shape.clone(), bytes)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(safetensors::serialize(views, &None)?)
}

pub fn write_safetensors(path: impl AsRef<Path>, state: &StateDict) -> Result<()> {
    let bytes = write_safetensors_bytes(state)?;
    std::fs::write(path.as_ref(), bytes)?;
    Ok(())
}
