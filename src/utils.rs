/// Utility functions
use candle_core::Tensor;

/// Calculate the number of parameters in a tensor
pub fn count_parameters(tensor: &Tensor) -> usize {
    tensor.dims().iter().product()
}

/// Linear warmup scale of `initial_lr` at `current_step`
pub fn warmup_lr(initial_lr: f64, current_step: usize, warmup_iter: usize) -> f64 {
    initial_lr / warmup_iter as f64 * current_step as f64
}
