//! Selective state-space mixer, optionally scanning the tokens in both directions.
//!
//! References:
//! - Mamba: Linear-Time Sequence Modeling with Selective State Spaces (https://arxiv.org/abs/2312.00752)
//! - https://github.com/hustvl/Vim/blob/6143d07b3dd31f904c63840a19e22d95d1124493/mamba-1p1p1/mamba_ssm/modules/mamba_simple.py

use crate::mixer::{MambaCache, MambaCacheConfig};
use burn::module::{Module, Param};
use burn::nn::conv::{Conv1d, Conv1dConfig};
use burn::nn::{Initializer, Linear, LinearConfig, PaddingConfig1d};
use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::activation::{silu, softplus};

/// Gated selective-scan mixer.
///
/// `in_proj` yields the scan input and the gate. Each [ScanBranch] scans the input in its own
/// token order, the scans are summed, gated by `silu(gate)` and projected back by `out_proj`.
#[derive(Module, Debug)]
pub struct Mamba<B: Backend> {
    /// d_model → 2 * d_inner (scan input, gate).
    pub in_proj: Linear<B>,

    /// Scans the tokens in order.
    pub forward_scan: ScanBranch<B>,

    /// Scans the tokens in reverse. Absent for a unidirectional mixer.
    pub backward_scan: Option<ScanBranch<B>>,

    /// d_inner → d_model.
    pub out_proj: Linear<B>,
}

/// Parameters owned by one scan direction.
#[derive(Module, Debug)]
pub struct ScanBranch<B: Backend> {
    /// Depthwise causal conv with `d_inner` channels.
    pub conv1d: Conv1d<B>,

    /// d_inner → dt_rank + 2 * d_state (low rank ∆, then B and C).
    pub x_proj: Linear<B>,

    /// dt_rank → d_inner.
    pub dt_proj: Linear<B>,

    /// `A = -exp(a_log)`.
    ///
    /// # Shape
    /// [d_inner, d_state]
    pub a_log: Param<Tensor<B, 2>>,

    /// Skip weight of the scan input.
    ///
    /// # Shape
    /// [d_inner]
    pub d: Param<Tensor<B, 1>>,
}

#[derive(Config, Debug)]
pub struct MambaConfig {
    pub d_model: usize,

    /// Size of the state kept per channel.
    #[config(default = 16)]
    pub d_state: usize,

    /// Kernel size of the causal conv.
    #[config(default = 4)]
    pub d_conv: usize,

    #[config(default = 2)]
    pub expand: usize,

    /// Initial step sizes are sampled log-uniformly in `[dt_min, dt_max]`.
    #[config(default = 1e-3)]
    pub dt_min: f64,

    #[config(default = 1e-1)]
    pub dt_max: f64,

    #[config(default = 1.)]
    pub dt_scale: f64,

    /// Lower clamp of the initial step sizes.
    #[config(default = 1e-4)]
    pub dt_init_floor: f64,

    #[config(default = true)]
    pub conv_bias: bool,

    /// Bias on `in_proj` and `out_proj`.
    #[config(default = false)]
    pub bias: bool,

    /// Add a second scan over the reversed tokens.
    #[config(default = true)]
    pub bimamba: bool,

    /// Rank of the ∆ projection. Defaults to `ceil(d_model / 16)`.
    pub dt_rank: Option<usize>,

    /// Defaults to `expand * d_model`.
    pub d_inner: Option<usize>,
}

/// `U(-1/√fan_in, 1/√fan_in)`, the default init of torch linear and conv layers.
fn fan_in_uniform(fan_in: usize) -> Initializer {
    let bound = (fan_in as f64).sqrt().recip();
    Initializer::Uniform {
        min: -bound,
        max: bound,
    }
}

impl MambaConfig {
    /// Returns the initialized mixer.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mamba<B> {
        debug_assert!(self.d_state > 0 && self.d_conv > 0);
        let d_inner = self.d_inner();
        let projection = |d_input: usize, d_output: usize| {
            LinearConfig::new(d_input, d_output)
                .with_bias(self.bias)
                .with_initializer(fan_in_uniform(d_input))
                .init(device)
        };

        Mamba {
            in_proj: projection(self.d_model, 2 * d_inner),
            forward_scan: self.init_branch(device),
            backward_scan: self.bimamba.then(|| self.init_branch(device)),
            out_proj: projection(d_inner, self.d_model),
        }
    }

    fn init_branch<B: Backend>(&self, device: &B::Device) -> ScanBranch<B> {
        let d_inner = self.d_inner();
        let dt_rank = self.dt_rank();

        // the bias holds softplus⁻¹(dt) = dt + ln(1 - exp(-dt))
        let dt = Tensor::<B, 1>::random(
            [d_inner],
            Distribution::Uniform(self.dt_min.ln(), self.dt_max.ln()),
            device,
        )
        .exp()
        .clamp_min(self.dt_init_floor);
        let dt_bias = dt.clone() + (dt.neg().exp().neg() + 1.).log();

        let dt_std = self.dt_scale / (dt_rank as f64).sqrt();
        let dt_proj = Linear {
            weight: Param::from_tensor(Tensor::random(
                [dt_rank, d_inner],
                Distribution::Uniform(-dt_std, dt_std),
                device,
            )),
            bias: Some(Param::from_tensor(dt_bias)),
        };

        // S4D-Real: row n of -A is n + 1
        let a = Tensor::<B, 1, Int>::arange(1..self.d_state as i64 + 1, device)
            .float()
            .unsqueeze::<2>()
            .repeat_dim(0, d_inner);
        debug_assert_eq!([d_inner, self.d_state], a.dims());

        ScanBranch {
            conv1d: Conv1dConfig::new(d_inner, d_inner, self.d_conv)
                .with_padding(PaddingConfig1d::Explicit(self.d_conv - 1))
                .with_groups(d_inner)
                .with_bias(self.conv_bias)
                // one input channel per group
                .with_initializer(fan_in_uniform(self.d_conv))
                .init(device),
            x_proj: LinearConfig::new(d_inner, dt_rank + 2 * self.d_state)
                .with_bias(false)
                .with_initializer(fan_in_uniform(d_inner))
                .init(device),
            dt_proj,
            a_log: Param::from_tensor(a.log()),
            d: Initializer::Ones.init([d_inner], device),
        }
    }

    pub fn d_inner(&self) -> usize {
        self.d_inner.unwrap_or(self.expand * self.d_model)
    }

    pub fn dt_rank(&self) -> usize {
        self.dt_rank.unwrap_or_else(|| self.d_model.div_ceil(16))
    }
}

impl<B: Backend> Mamba<B> {
    pub fn d_inner(&self) -> usize {
        self.forward_scan.d.dims()[0]
    }

    /// Zeroed decoding state for `batch` sequences.
    pub fn allocate_inference_cache(&self, batch: usize, device: &B::Device) -> MambaCache<B> {
        let [d_inner, d_state] = self.forward_scan.a_log.dims();
        MambaCacheConfig::new(batch, d_inner)
            .with_d_state(d_state)
            .with_d_conv(self.forward_scan.d_conv())
            .init(device)
    }

    /// Mixes a whole sequence.
    ///
    /// A cache at offset zero receives the final conv window and state of the forward scan.
    /// A cache past offset zero makes the tokens decode one at a time from the cached state,
    /// using the forward scan only.
    ///
    /// # Shapes
    ///   - Input [batch, sequence, d_model]
    ///   - Output [batch, sequence, d_model]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        cache: Option<MambaCache<B>>,
    ) -> (Tensor<B, 3>, Option<MambaCache<B>>) {
        match cache {
            Some(cache) if cache.seqlen_offset > 0 => {
                let (y, cache) = self.decode(x, cache);
                (y, Some(cache))
            }
            cache => self.scan(x, cache),
        }
    }

    fn scan(
        &self,
        x: Tensor<B, 3>,
        cache: Option<MambaCache<B>>,
    ) -> (Tensor<B, 3>, Option<MambaCache<B>>) {
        let [batch, sequence, d_model] = x.dims();

        let (u, gate) = self.project_in(x, 2);
        let (mut ys, window, state) = self.forward_scan.forward(u.clone());
        if let Some(backward_scan) = &self.backward_scan {
            let (ys_reversed, _, _) = backward_scan.forward(u.flip([1]));
            ys = ys + ys_reversed.flip([1]);
        }

        let y = self.out_proj.forward(ys * silu(gate));
        debug_assert_eq!([batch, sequence, d_model], y.dims());

        let cache = cache.map(|mut cache| {
            cache.conv = cache.conv.map(|_| window);
            cache.ssm = cache.ssm.map(|_| state);
            cache.seqlen_offset += sequence;
            cache
        });
        (y, cache)
    }

    fn decode(&self, x: Tensor<B, 3>, mut cache: MambaCache<B>) -> (Tensor<B, 3>, MambaCache<B>) {
        let [batch, sequence, d_model] = x.dims();
        let mut ys = Vec::with_capacity(sequence);
        for t in 0..sequence {
            let token = x.clone().narrow(1, t, 1).reshape([batch, d_model]);
            let (y, next) = self.step(token, cache);
            cache = next;
            ys.push(y);
        }
        (Tensor::stack(ys, 1), cache)
    }

    /// Mixes the next token of every sequence from the cached state.
    ///
    /// # Shapes
    ///   - Input [batch, d_model]
    ///   - Output [batch, d_model]
    pub fn step(&self, x: Tensor<B, 2>, cache: MambaCache<B>) -> (Tensor<B, 2>, MambaCache<B>) {
        let [batch, d_model] = x.dims();

        let (u, gate) = self.project_in(x, 1);
        let (ys, mut cache) = self.forward_scan.step(u, cache);
        let y = self.out_proj.forward(ys * silu(gate));
        debug_assert_eq!([batch, d_model], y.dims());

        cache.seqlen_offset += 1;
        (y, cache)
    }

    /// Returns `(u, gate)`, each with `d_inner` features along `dim`.
    fn project_in<const D: usize>(&self, x: Tensor<B, D>, dim: usize) -> (Tensor<B, D>, Tensor<B, D>) {
        let d_inner = self.d_inner();
        let projected = self.in_proj.forward(x);
        let u = projected.clone().narrow(dim, 0, d_inner);
        let gate = projected.narrow(dim, d_inner, d_inner);
        (u, gate)
    }
}

impl<B: Backend> ScanBranch<B> {
    pub fn d_conv(&self) -> usize {
        self.conv1d.weight.dims()[2]
    }

    /// `A = -exp(a_log)`, the same for every token.
    fn a(&self) -> Tensor<B, 2> {
        self.a_log.val().exp().neg()
    }

    /// Causal conv, SiLU and selective scan from a zero state.
    ///
    /// Returns the outputs, the last `d_conv` scan inputs (left zero-padded when the sequence
    /// is shorter) and the final state.
    ///
    /// # Shapes
    ///   - Input [batch, sequence, d_inner]
    ///   - Output ys [batch, sequence, d_inner]
    ///   - Output window [batch, d_inner, d_conv]
    ///   - Output state [batch, d_inner, d_state]
    pub fn forward(&self, u: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
        let [batch, sequence, d_inner] = u.dims();
        let [_, d_state] = self.a_log.dims();
        let d_conv = self.d_conv();
        let device = u.device();

        let u = u.swap_dims(1, 2);
        let window = if sequence >= d_conv {
            u.clone().narrow(2, sequence - d_conv, d_conv)
        } else {
            let padding = Tensor::zeros([batch, d_inner, d_conv - sequence], &device);
            Tensor::cat(vec![padding, u.clone()], 2)
        };

        // both sides are padded by d_conv - 1, the first outputs are the causal ones
        let u = self.conv1d.forward(u).narrow(2, 0, sequence).swap_dims(1, 2);
        let u = silu(u);
        debug_assert_eq!([batch, sequence, d_inner], u.dims());

        let (delta, b, c) = self.selection(u.clone());
        let state = Tensor::zeros([batch, d_inner, d_state], &device);
        let (ys, state) = selective_scan(delta, self.a(), b, c, self.d.val(), u, state);
        (ys, window, state)
    }

    /// Input-dependent `∆` (after softplus), `B` and `C`.
    ///
    /// # Shapes
    ///   - Input [..., d_inner]
    ///   - Output ∆ [..., d_inner]
    ///   - Output B, C [..., d_state]
    fn selection<const D: usize>(&self, u: Tensor<B, D>) -> (Tensor<B, D>, Tensor<B, D>, Tensor<B, D>) {
        let [dt_rank, _] = self.dt_proj.weight.dims();
        let [_, d_state] = self.a_log.dims();

        let x_dbl = self.x_proj.forward(u);
        let delta = x_dbl.clone().narrow(D - 1, 0, dt_rank);
        let b = x_dbl.clone().narrow(D - 1, dt_rank, d_state);
        let c = x_dbl.narrow(D - 1, dt_rank + d_state, d_state);
        (softplus(self.dt_proj.forward(delta), 1.), b, c)
    }

    /// # Shapes
    ///   - Input [batch, d_inner]
    ///   - Output [batch, d_inner]
    pub fn step(&self, u: Tensor<B, 2>, mut cache: MambaCache<B>) -> (Tensor<B, 2>, MambaCache<B>) {
        let [batch, d_inner, d_conv] = cache.conv.dims();

        cache.conv = cache.conv.map(|window| {
            let older = window.narrow(2, 1, d_conv - 1);
            Tensor::cat(vec![older, u.unsqueeze_dim::<3>(2)], 2)
        });

        // conv output at the newest token
        let kernel = self
            .conv1d
            .weight
            .val()
            .reshape([1, d_inner, d_conv])
            .expand([batch, d_inner, d_conv]);
        let u = (cache.conv.val() * kernel).sum_dim(2).reshape([batch, d_inner]);
        let u = match &self.conv1d.bias {
            Some(bias) => u + bias.val().unsqueeze(),
            None => u,
        };
        let u = silu(u);

        let (delta, b, c) = self.selection(u.clone());
        let (y, state) = scan_token(cache.ssm.val(), delta, self.a(), b, c, u.clone());
        cache.ssm = cache.ssm.map(|_| state);

        let d = self.d.val().unsqueeze::<2>().expand([batch, d_inner]);
        (y + d * u, cache)
    }
}

/// One recurrence step, `h ← exp(∆A) h + ∆B u` then `y = C h`.
///
/// A is discretized with a zero-order hold and B with Euler's method.
///
/// # Shapes
///   - Input state [batch, d_inner, d_state]
///   - Input delta, u [batch, d_inner]
///   - Input a [d_inner, d_state]
///   - Input b, c [batch, d_state]
///   - Output y [batch, d_inner]
///   - Output state [batch, d_inner, d_state]
fn scan_token<B: Backend>(
    state: Tensor<B, 3>,
    delta: Tensor<B, 2>,
    a: Tensor<B, 2>,
    b: Tensor<B, 2>,
    c: Tensor<B, 2>,
    u: Tensor<B, 2>,
) -> (Tensor<B, 2>, Tensor<B, 3>) {
    let shape = state.dims();
    let [batch, d_inner, _d_state] = shape;

    let delta = delta.unsqueeze_dim::<3>(2).expand(shape);
    let delta_a = (delta.clone() * a.unsqueeze::<3>().expand(shape)).exp();
    let delta_bu = delta
        * b.unsqueeze_dim::<3>(1).expand(shape)
        * u.unsqueeze_dim::<3>(2).expand(shape);

    let state = state * delta_a + delta_bu;
    let y = state.clone().matmul(c.unsqueeze_dim(2)).reshape([batch, d_inner]);
    (y, state)
}

/// Sequential selective scan over the token axis, starting from `state`.
///
/// Returns `y + D u` for every token and the state after the last one.
///
/// # Shapes
///   - Input delta, u [batch, sequence, d_inner]
///   - Input a [d_inner, d_state]
///   - Input b, c [batch, sequence, d_state]
///   - Input d [d_inner]
///   - Input state [batch, d_inner, d_state]
///   - Output ys [batch, sequence, d_inner]
///   - Output state [batch, d_inner, d_state]
pub fn selective_scan<B: Backend>(
    delta: Tensor<B, 3>,
    a: Tensor<B, 2>,
    b: Tensor<B, 3>,
    c: Tensor<B, 3>,
    d: Tensor<B, 1>,
    u: Tensor<B, 3>,
    mut state: Tensor<B, 3>,
) -> (Tensor<B, 3>, Tensor<B, 3>) {
    let [batch, sequence, d_inner] = u.dims();
    let at = |x: &Tensor<B, 3>, t: usize| {
        let [_, _, width] = x.dims();
        x.clone().narrow(1, t, 1).reshape([batch, width])
    };

    let mut ys = Vec::with_capacity(sequence);
    for t in 0..sequence {
        let (y, next) = scan_token(state, at(&delta, t), a.clone(), at(&b, t), at(&c, t), at(&u, t));
        state = next;
        ys.push(y);
    }
    let ys = Tensor::stack::<3>(ys, 1);
    debug_assert_eq!([batch, sequence, d_inner], ys.dims());

    let d = d.unsqueeze_dims::<3>(&[0, 1]).expand([batch, sequence, d_inner]);
    (ys + d * u, state)
}
