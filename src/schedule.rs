use crate::utils::linspace;

/// Per-block stochastic depth rates, rising linearly from `0` at the first block to
/// `max_rate` at the last one.
///
/// Example: depth = 5, max_rate = 0.1:
/// [0.0, 0.025, 0.05, 0.075, 0.1]
pub fn stochastic_depth_rates(depth: usize, max_rate: f64) -> Vec<f64> {
    linspace(0.0, max_rate, depth)
}
