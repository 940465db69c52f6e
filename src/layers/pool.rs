//! Max and average pooling

use std::fmt;
use std::str::FromStr;

use ndarray::Array4;
use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

/// Pooling reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolMode {
    /// Padding behaves as negative infinity
    Max,
    /// Padding is excluded from the divisor
    Avg,
}

impl FromStr for PoolMode {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "max" => Ok(Self::Max),
            "avg" => Ok(Self::Avg),
            other => Err(NasError::ConfigError(format!("invalid pooling mode '{}'", other))),
        }
    }
}

impl fmt::Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Max => write!(f, "max"),
            Self::Avg => write!(f, "avg"),
        }
    }
}

/// 2D pooling window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool2d {
    mode: PoolMode,
    kernel: usize,
    stride: usize,
    padding: usize,
}

impl Pool2d {
    pub fn new(mode: PoolMode, kernel: usize, stride: usize, padding: usize) -> Result<Self> {
        if kernel == 0 || stride == 0 {
            return Err(NasError::InvalidParameter {
                name: "kernel/stride".to_string(),
                value: format!("{}/{}", kernel, stride),
                reason: "must be positive".to_string(),
            });
        }
        if 2 * padding > kernel {
            return Err(NasError::InvalidParameter {
                name: "padding".to_string(),
                value: padding.to_string(),
                reason: format!("must be at most half of kernel size {}", kernel),
            });
        }
        Ok(Self { mode, kernel, stride, padding })
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    /// Forward pass
    pub fn forward(&self, x: &Array4<f64>) -> Result<Array4<f64>> {
        let (n, c, h, w) = x.dim();
        if h + 2 * self.padding < self.kernel || w + 2 * self.padding < self.kernel {
            return Err(NasError::shape(
                format!("spatial size of at least {}", self.kernel),
                format!("{}x{}", h, w),
            ));
        }
        let oh = (h + 2 * self.padding - self.kernel) / self.stride + 1;
        let ow = (w + 2 * self.padding - self.kernel) / self.stride + 1;
        let pad = self.padding as isize;

        let out = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, y, xo)| {
            let y0 = (y * self.stride) as isize - pad;
            let x0 = (xo * self.stride) as isize - pad;
            let ys = y0.max(0) as usize..((y0 + self.kernel as isize).min(h as isize)) as usize;
            let xs = x0.max(0) as usize..((x0 + self.kernel as isize).min(w as isize)) as usize;

            match self.mode {
                PoolMode::Max => {
                    let mut best = f64::NEG_INFINITY;
                    for iy in ys {
                        for ix in xs.clone() {
                            best = best.max(x[[b, ch, iy, ix]]);
                        }
                    }
                    best
                }
                PoolMode::Avg => {
                    let count = ys.len() * xs.len();
                    let mut sum = 0.0;
                    for iy in ys {
                        for ix in xs.clone() {
                            sum += x[[b, ch, iy, ix]];
                        }
                    }
                    sum / count as f64
                }
            }
        });
        Ok(out)
    }
}
