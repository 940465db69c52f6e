//! Fully connected classifier layer

use ndarray::{Array1, Array2};
use rand::Rng;

use crate::error::{NasError, Result};

/// Affine map `y = x W^T + b`
#[derive(Debug, Clone)]
pub struct Linear {
    /// Shape: [out_features, in_features]
    weight: Array2<f64>,
    bias: Array1<f64>,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize, rng: &mut impl Rng) -> Self {
        let bound = 1.0 / (in_features.max(1) as f64).sqrt();
        let weight = Array2::from_shape_fn((out_features, in_features), |_| {
            (rng.gen::<f64>() * 2.0 - 1.0) * bound
        });
        let bias = Array1::from_shape_fn(out_features, |_| (rng.gen::<f64>() * 2.0 - 1.0) * bound);
        Self { weight, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.in_features() {
            return Err(NasError::shape(
                format!("{} features", self.in_features()),
                format!("{} features", x.ncols()),
            ));
        }
        Ok(x.dot(&self.weight.t()) + &self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_linear_shapes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let fc = Linear::new(256, 10, &mut rng);
        let x = Array2::<f64>::ones((4, 256));
        assert_eq!(fc.forward(&x).unwrap().dim(), (4, 10));
        assert!(fc.forward(&Array2::ones((4, 255))).is_err());
    }
}
