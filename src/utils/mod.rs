use burn::prelude::*;
use burn::tensor::{DType, FloatDType};

/// Maps a tensor dtype onto the float dtype accepted by [Tensor::cast].
///
/// Non-float dtypes map to f32.
pub fn float_dtype(dtype: DType) -> FloatDType {
    match dtype {
        DType::F64 => FloatDType::F64,
        DType::F32 => FloatDType::F32,
        DType::Flex32 => FloatDType::Flex32,
        DType::F16 => FloatDType::F16,
        DType::BF16 => FloatDType::BF16,
        _ => FloatDType::F32,
    }
}

/// Casts `x` to `dtype`, skipping the op when it already has it.
pub fn cast_float<B: Backend, const D: usize>(x: Tensor<B, D>, dtype: DType) -> Tensor<B, D> {
    if x.dtype() == dtype {
        x
    } else {
        x.cast(float_dtype(dtype))
    }
}

/// `n` evenly spaced values from `start` to `end`, both included.
///
/// A single value is `start`.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}
