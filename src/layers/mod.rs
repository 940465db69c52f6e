//! Numeric building blocks for the search-space networks
//!
//! Every tensor is an `Array4<f64>` laid out as (batch, channels, height, width).
//! The stages here are small and single-purpose; search-space primitives are
//! composed out of them through [`Sequential`].

mod conv;
mod linear;
mod norm;
mod pool;
mod sequential;

pub use conv::{Conv2d, Conv2dConfig};
pub use linear::Linear;
pub use norm::BatchNorm2d;
pub use pool::{Pool2d, PoolMode};
pub use sequential::{Sequential, Stage};

use ndarray::{s, Array2, Array4, ArrayView4, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

/// Evaluation phase, passed explicitly to every statistics-bearing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Batch statistics are used and running statistics are updated
    Train,
    /// Running statistics are used and nothing is mutated
    Eval,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Train
    }
}

/// Rectified linear unit
pub fn relu(x: &Array4<f64>) -> Array4<f64> {
    x.mapv(|v| v.max(0.0))
}

/// Concatenate tensors along the channel axis
pub fn concat_channels(parts: &[Array4<f64>]) -> Result<Array4<f64>> {
    if parts.is_empty() {
        return Err(NasError::ComputationError(
            "cannot concatenate an empty tensor list".to_string(),
        ));
    }
    let views: Vec<ArrayView4<f64>> = parts.iter().map(|p| p.view()).collect();
    Ok(ndarray::concatenate(Axis(1), &views)?)
}

/// Add `term` onto a running sum, starting the sum when there is none
pub fn accumulate(acc: Option<Array4<f64>>, term: Array4<f64>) -> Result<Array4<f64>> {
    match acc {
        None => Ok(term),
        Some(sum) if sum.dim() == term.dim() => Ok(sum + &term),
        Some(sum) => Err(NasError::shape(format!("{:?}", sum.dim()), format!("{:?}", term.dim()))),
    }
}

/// Global average pooling followed by flatten: (N, C, H, W) -> (N, C)
pub fn global_avg_pool(x: &Array4<f64>) -> Result<Array2<f64>> {
    let (n, c, h, w) = x.dim();
    if h == 0 || w == 0 {
        return Err(NasError::shape("non-empty spatial dims", format!("{}x{}", h, w)));
    }
    let area = (h * w) as f64;
    Ok(Array2::from_shape_fn((n, c), |(b, ch)| {
        x.slice(s![b, ch, .., ..]).sum() / area
    }))
}

/// Spatial output size of a strided, shape-preserving transform
pub(crate) fn strided_extent(size: usize, stride: usize) -> usize {
    (size + stride - 1) / stride
}
