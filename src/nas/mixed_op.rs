//! Mixed operation: one DAG edge holding every candidate primitive

use ndarray::{Array4, ArrayView1};
use rand::Rng;

use super::operations::Primitive;
use super::search_space::OpVocabulary;
use crate::error::{NasError, Result};
use crate::layers::{accumulate, strided_extent, Phase};

/// One edge of a search cell
///
/// Holds one primitive per vocabulary entry, in vocabulary order. Edges never
/// use affine normalization.
#[derive(Debug, Clone)]
pub struct MixedOp {
    ops: Vec<Primitive>,
    c_out: usize,
    stride: usize,
}

impl MixedOp {
    pub fn new(
        c_in: usize,
        c_out: usize,
        stride: usize,
        vocab: &OpVocabulary,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let ops = vocab
            .ops()
            .iter()
            .map(|&kind| Primitive::build(kind, c_in, c_out, stride, false, rng))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ops, c_out, stride })
    }

    pub fn ops(&self) -> &[Primitive] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    fn check_weights(&self, weights: &ArrayView1<f64>) -> Result<()> {
        if weights.len() != self.ops.len() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.ops.len(),
                actual: weights.len(),
            });
        }
        Ok(())
    }

    fn output_zeros(&self, x: &Array4<f64>) -> Array4<f64> {
        let (n, _, h, w) = x.dim();
        Array4::zeros((n, self.c_out, strided_extent(h, self.stride), strided_extent(w, self.stride)))
    }

    /// Relaxed evaluation
    ///
    /// A weight of exactly 1 adds the primitive output unscaled, a weight in
    /// (0, 1) adds it scaled, and a weight of 0 skips the primitive entirely so
    /// its statistics stay untouched. If every primitive is skipped the edge
    /// contributes zeros.
    pub fn forward(&mut self, x: &Array4<f64>, weights: ArrayView1<f64>, phase: Phase) -> Result<Array4<f64>> {
        self.check_weights(&weights)?;
        let mut acc: Option<Array4<f64>> = None;
        for (op, &w) in self.ops.iter_mut().zip(weights.iter()) {
            let term = if w == 1.0 {
                op.forward(x, phase)?
            } else if w > 0.0 && w < 1.0 {
                op.forward(x, phase)? * w
            } else {
                continue;
            };
            acc = Some(accumulate(acc, term)?);
        }
        Ok(acc.unwrap_or_else(|| self.output_zeros(x)))
    }

    /// Dense DARTS evaluation: every primitive runs and is scaled by its weight
    pub fn forward_soft(&mut self, x: &Array4<f64>, weights: ArrayView1<f64>, phase: Phase) -> Result<Array4<f64>> {
        self.check_weights(&weights)?;
        let mut acc: Option<Array4<f64>> = None;
        for (op, &w) in self.ops.iter_mut().zip(weights.iter()) {
            let term = op.forward(x, phase)? * w;
            acc = Some(accumulate(acc, term)?);
        }
        acc.ok_or_else(|| NasError::ConfigError("mixed op has no primitives".to_string()))
    }

    /// GDAS evaluation: only the primitive at `index` runs, scaled by `weights[index]`
    pub fn forward_hard(
        &mut self,
        x: &Array4<f64>,
        weights: ArrayView1<f64>,
        index: usize,
        phase: Phase,
    ) -> Result<Array4<f64>> {
        self.check_weights(&weights)?;
        let op = self.ops.get_mut(index).ok_or_else(|| NasError::InvalidParameter {
            name: "index".to_string(),
            value: index.to_string(),
            reason: format!("edge holds {} primitives", weights.len()),
        })?;
        Ok(op.forward(x, phase)? * weights[index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::search_space::PrimitiveKind;
    use ndarray::{arr1, Array1};
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn edge(stride: usize) -> MixedOp {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        MixedOp::new(4, 4, stride, &OpVocabulary::darts(), &mut rng).unwrap()
    }

    fn input() -> Array4<f64> {
        Array4::from_shape_fn((2, 4, 6, 6), |(b, c, y, x)| ((b + 2 * c + 3 * y + x) % 7) as f64 * 0.3 - 1.0)
    }

    fn max_abs_diff(a: &Array4<f64>, b: &Array4<f64>) -> f64 {
        a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f64::max)
    }

    #[test]
    fn test_edges_never_affine() {
        let e = edge(1);
        for op in e.ops() {
            if let crate::nas::operations::Block::Seq(seq) = op.block() {
                assert!(seq.norms().all(|bn| !bn.is_affine()));
            }
        }
    }

    #[test]
    fn test_weight_length_mismatch() {
        let mut e = edge(1);
        let w = Array1::from_elem(7, 0.5);
        let err = e.forward(&input(), w.view(), Phase::Train).unwrap_err();
        assert!(matches!(err, NasError::WeightLengthMismatch { expected: 8, actual: 7 }));
        assert!(e.forward_soft(&input(), w.view(), Phase::Train).is_err());
        assert!(e.forward_hard(&input(), w.view(), 0, Phase::Train).is_err());
    }

    #[test]
    fn test_one_hot_equals_single_primitive() {
        let mut a = edge(1);
        let mut b = edge(1);
        // sep_conv_3x3
        let mut w = Array1::zeros(8);
        w[3] = 1.0;
        let mixed = a.forward(&input(), w.view(), Phase::Train).unwrap();
        let direct = b.ops[3].forward(&input(), Phase::Train).unwrap();
        assert_eq!(mixed, direct);

        for (i, op) in a.ops().iter().enumerate() {
            assert_eq!(op.evaluations(), u64::from(i == 3));
        }
    }

    #[test]
    fn test_relaxed_matches_soft_inside_open_interval() {
        let mut a = edge(1);
        let mut b = edge(1);
        let w = arr1(&[0.1, 0.05, 0.2, 0.15, 0.1, 0.1, 0.2, 0.1]);
        let relaxed = a.forward(&input(), w.view(), Phase::Train).unwrap();
        let soft = b.forward_soft(&input(), w.view(), Phase::Train).unwrap();
        assert!(max_abs_diff(&relaxed, &soft) < 1e-12);
    }

    #[test]
    fn test_relaxed_skips_zero_weights_soft_does_not() {
        let mut a = edge(1);
        let mut b = edge(1);
        let w = arr1(&[0.0, 0.5, 0.0, 0.5, 0.0, 0.0, 0.0, 0.0]);
        a.forward(&input(), w.view(), Phase::Train).unwrap();
        b.forward_soft(&input(), w.view(), Phase::Train).unwrap();

        let touched: Vec<u64> = a.ops().iter().map(|op| op.evaluations()).collect();
        assert_eq!(touched, vec![0, 1, 0, 1, 0, 0, 0, 0]);
        assert!(a.ops()[0].block().batches_tracked() == 0);
        assert!(b.ops().iter().all(|op| op.evaluations() == 1));
        assert_eq!(b.ops()[0].block().batches_tracked(), 1);
    }

    #[test]
    fn test_all_zero_weights_give_zero_output() {
        let mut e = edge(2);
        let w = Array1::zeros(8);
        let y = e.forward(&input(), w.view(), Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 4, 3, 3));
        assert!(y.iter().all(|&v| v == 0.0));
        assert!(e.ops().iter().all(|op| op.evaluations() == 0));
    }

    #[test]
    fn test_hard_select_touches_one_primitive() {
        let vocab = OpVocabulary::darts();
        for idx in 0..vocab.len() {
            let mut e = edge(1);
            let w = Array1::from_elem(8, 0.5);
            let y = e.forward_hard(&input(), w.view(), idx, Phase::Train).unwrap();
            assert_eq!(y.dim(), (2, 4, 6, 6));
            for (i, op) in e.ops().iter().enumerate() {
                assert_eq!(op.evaluations(), u64::from(i == idx), "index {}", idx);
                if i != idx {
                    assert_eq!(op.block().batches_tracked(), 0);
                }
            }
        }
    }

    #[test]
    fn test_hard_select_scales_by_selected_weight() {
        let mut a = edge(1);
        let mut b = edge(1);
        let skip = OpVocabulary::darts().index_of(PrimitiveKind::SkipConnect).unwrap();
        let mut w = Array1::zeros(8);
        w[skip] = 0.25;
        let y = a.forward_hard(&input(), w.view(), skip, Phase::Train).unwrap();
        assert!(max_abs_diff(&y, &(input() * 0.25)) < 1e-12);
        assert!(b.forward_hard(&input(), w.view(), 8, Phase::Train).is_err());
    }
}
