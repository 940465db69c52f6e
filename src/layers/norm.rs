//! Batch normalization over NCHW tensors

use ndarray::{Array1, Array4};

use super::Phase;
use crate::error::{NasError, Result};

/// 2D batch normalization
///
/// Normalizes each channel over (batch, height, width). In [`Phase::Train`]
/// batch statistics are used and the running statistics are updated; in
/// [`Phase::Eval`] the running statistics are used and nothing changes.
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    /// Number of channels
    num_features: usize,
    /// Momentum for running stats
    momentum: f64,
    /// Epsilon for numerical stability
    eps: f64,
    /// Whether gamma / beta are applied
    affine: bool,
    /// Learnable scale (gamma)
    gamma: Array1<f64>,
    /// Learnable shift (beta)
    beta: Array1<f64>,
    /// Running mean
    running_mean: Array1<f64>,
    /// Running variance (unbiased)
    running_var: Array1<f64>,
    /// Number of batches folded into the running stats
    num_batches_tracked: u64,
}

impl BatchNorm2d {
    /// Create new BatchNorm2d
    pub fn new(num_features: usize, affine: bool) -> Self {
        Self {
            num_features,
            momentum: 0.1,
            eps: 1e-5,
            affine,
            gamma: Array1::ones(num_features),
            beta: Array1::zeros(num_features),
            running_mean: Array1::zeros(num_features),
            running_var: Array1::ones(num_features),
            num_batches_tracked: 0,
        }
    }

    pub fn num_features(&self) -> usize {
        self.num_features
    }

    pub fn is_affine(&self) -> bool {
        self.affine
    }

    pub fn running_mean(&self) -> &Array1<f64> {
        &self.running_mean
    }

    pub fn running_var(&self) -> &Array1<f64> {
        &self.running_var
    }

    /// How many training batches have updated the running statistics
    pub fn num_batches_tracked(&self) -> u64 {
        self.num_batches_tracked
    }

    /// Forward pass
    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let (n, c, h, w) = x.dim();
        if c != self.num_features {
            return Err(NasError::shape(
                format!("{} channels", self.num_features),
                format!("{} channels", c),
            ));
        }
        let count = n * h * w;

        let (mean, var) = match phase {
            Phase::Train => {
                if count < 2 {
                    return Err(NasError::ComputationError(format!(
                        "expected more than 1 value per channel when training, got {}",
                        count
                    )));
                }
                let mut mean = Array1::zeros(c);
                let mut var = Array1::zeros(c);
                for ch in 0..c {
                    let lane = x.index_axis(ndarray::Axis(1), ch);
                    let m = lane.sum() / count as f64;
                    let v = lane.fold(0.0, |acc, &v| acc + (v - m) * (v - m)) / count as f64;
                    mean[ch] = m;
                    var[ch] = v;
                }

                let unbiased = &var * (count as f64 / (count - 1) as f64);
                self.running_mean = &self.running_mean * (1.0 - self.momentum) + &mean * self.momentum;
                self.running_var = &self.running_var * (1.0 - self.momentum) + &unbiased * self.momentum;
                self.num_batches_tracked += 1;
                (mean, var)
            }
            Phase::Eval => (self.running_mean.clone(), self.running_var.clone()),
        };

        let mut out = x.to_owned();
        for (ch, mut lane) in out.axis_iter_mut(ndarray::Axis(1)).enumerate() {
            let inv_std = 1.0 / (var[ch] + self.eps).sqrt();
            let (scale, shift) = if self.affine {
                (self.gamma[ch] * inv_std, self.beta[ch] - mean[ch] * self.gamma[ch] * inv_std)
            } else {
                (inv_std, -mean[ch] * inv_std)
            };
            lane.mapv_inplace(|v| v * scale + shift);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Array4<f64> {
        Array4::from_shape_fn((2, 3, 4, 4), |(b, c, y, x)| (b + 2 * c) as f64 + 0.1 * (y * 4 + x) as f64)
    }

    #[test]
    fn test_train_normalizes_each_channel() {
        let mut bn = BatchNorm2d::new(3, false);
        let y = bn.forward(&ramp(), Phase::Train).unwrap();
        for lane in y.axis_iter(ndarray::Axis(1)) {
            let mean = lane.sum() / lane.len() as f64;
            let var = lane.fold(0.0, |acc, &v| acc + v * v) / lane.len() as f64 - mean * mean;
            assert!(mean.abs() < 1e-9);
            assert!((var - 1.0).abs() < 1e-3);
        }
        assert_eq!(bn.num_batches_tracked(), 1);
    }

    #[test]
    fn test_running_stats_move_towards_batch() {
        let mut bn = BatchNorm2d::new(3, true);
        bn.forward(&ramp(), Phase::Train).unwrap();
        // Channel 2 batch mean is 4.5 + 0.75 = 5.25; one step of momentum 0.1
        assert!((bn.running_mean()[2] - 0.525).abs() < 1e-9);
        assert!(bn.running_var()[0] != 1.0);
    }

    #[test]
    fn test_eval_leaves_stats_untouched() {
        let mut bn = BatchNorm2d::new(3, false);
        let y = bn.forward(&ramp(), Phase::Eval).unwrap();
        assert_eq!(bn.num_batches_tracked(), 0);
        assert_eq!(bn.running_mean(), &Array1::<f64>::zeros(3));
        // Fresh stats are mean 0 / var 1, so eval is (almost) the identity
        assert!((y[[1, 2, 3, 3]] - ramp()[[1, 2, 3, 3]]).abs() < 1e-4);
    }

    #[test]
    fn test_channel_mismatch() {
        let mut bn = BatchNorm2d::new(4, false);
        assert!(bn.forward(&ramp(), Phase::Train).is_err());
    }

    #[test]
    fn test_single_value_per_channel_rejected_in_train() {
        let mut bn = BatchNorm2d::new(1, false);
        let x = Array4::<f64>::ones((1, 1, 1, 1));
        assert!(bn.forward(&x, Phase::Train).is_err());
        assert!(bn.forward(&x, Phase::Eval).is_ok());
    }
}
