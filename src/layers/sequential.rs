//! Ordered composition of single-purpose stages

use ndarray::Array4;

use super::{relu, BatchNorm2d, Conv2d, Phase, Pool2d};
use crate::error::Result;

/// A single stage of a [`Sequential`] block
#[derive(Debug, Clone)]
pub enum Stage {
    Relu,
    Conv(Conv2d),
    Norm(BatchNorm2d),
    Pool(Pool2d),
}

impl Stage {
    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        match self {
            Stage::Relu => Ok(relu(x)),
            Stage::Conv(conv) => conv.forward(x),
            Stage::Norm(bn) => bn.forward(x, phase),
            Stage::Pool(pool) => pool.forward(x),
        }
    }
}

/// Stages applied in order, each consuming the previous output
#[derive(Debug, Clone, Default)]
pub struct Sequential {
    stages: Vec<Stage>,
}

impl Sequential {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage
    pub fn then(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Batch-norm stages, in order
    pub fn norms(&self) -> impl Iterator<Item = &BatchNorm2d> {
        self.stages.iter().filter_map(|s| match s {
            Stage::Norm(bn) => Some(bn),
            _ => None,
        })
    }

    /// Total number of batches tracked by all batch-norm stages
    pub fn batches_tracked(&self) -> u64 {
        self.norms().map(BatchNorm2d::num_batches_tracked).sum()
    }

    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let mut iter = self.stages.iter_mut();
        let mut out = match iter.next() {
            Some(first) => first.forward(x, phase)?,
            None => return Ok(x.clone()),
        };
        for stage in iter {
            out = stage.forward(&out, phase)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{Conv2dConfig, PoolMode};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_empty_sequential_is_identity() {
        let mut seq = Sequential::new();
        let x = Array4::from_elem((1, 2, 3, 3), 1.5);
        assert_eq!(seq.forward(&x, Phase::Train).unwrap(), x);
        assert!(seq.is_empty());
    }

    #[test]
    fn test_stages_compose() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let mut seq = Sequential::new()
            .then(Stage::Relu)
            .then(Stage::Conv(Conv2d::new(Conv2dConfig::new(3, 6, 3).with_padding(1), &mut rng).unwrap()))
            .then(Stage::Norm(BatchNorm2d::new(6, false)))
            .then(Stage::Pool(Pool2d::new(PoolMode::Max, 3, 2, 1).unwrap()));
        let x = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, y, x)| (b + c + y * x) as f64 - 10.0);
        let y = seq.forward(&x, Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 6, 4, 4));
        assert_eq!(seq.batches_tracked(), 1);
        assert_eq!(seq.len(), 4);
    }
}
