//! Primitive registry
//!
//! Builds the numeric transform behind every [`PrimitiveKind`]. Each primitive
//! is a composition of the single-purpose stages in [`crate::layers`].

use ndarray::{s, Array4};
use rand::Rng;

use super::search_space::PrimitiveKind;
use crate::error::{NasError, Result};
use crate::layers::{
    concat_channels, relu, strided_extent, BatchNorm2d, Conv2d, Conv2dConfig, Phase, Pool2d,
    PoolMode, Sequential, Stage,
};

/// ReLU - Conv - BN
pub fn relu_conv_bn(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    affine: bool,
    rng: &mut impl Rng,
) -> Result<Sequential> {
    let conv = Conv2dConfig::new(c_in, c_out, kernel)
        .with_stride(stride)
        .with_padding(padding);
    Ok(Sequential::new()
        .then(Stage::Relu)
        .then(Stage::Conv(Conv2d::new(conv, rng)?))
        .then(Stage::Norm(BatchNorm2d::new(c_out, affine))))
}

/// ReLU - (dilated) depthwise conv - pointwise conv - BN
///
/// With dilation 2 a 3x3 kernel covers a 5x5 field and a 5x5 kernel a 9x9 one.
#[allow(clippy::too_many_arguments)]
pub fn dil_conv(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    affine: bool,
    rng: &mut impl Rng,
) -> Result<Sequential> {
    let depthwise = Conv2dConfig::new(c_in, c_in, kernel)
        .with_stride(stride)
        .with_padding(padding)
        .with_dilation(dilation)
        .with_groups(c_in);
    let pointwise = Conv2dConfig::new(c_in, c_out, 1);
    Ok(Sequential::new()
        .then(Stage::Relu)
        .then(Stage::Conv(Conv2d::new(depthwise, rng)?))
        .then(Stage::Conv(Conv2d::new(pointwise, rng)?))
        .then(Stage::Norm(BatchNorm2d::new(c_out, affine))))
}

/// Depthwise separable conv applied twice; only the first one is strided
pub fn sep_conv(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    affine: bool,
    rng: &mut impl Rng,
) -> Result<Sequential> {
    let first = dil_conv(c_in, c_in, kernel, stride, padding, 1, affine, rng)?;
    let second = dil_conv(c_in, c_out, kernel, 1, padding, 1, affine, rng)?;
    let mut seq = Sequential::new();
    for stage in first.stages().iter().chain(second.stages()) {
        seq = seq.then(stage.clone());
    }
    Ok(seq)
}

/// ReLU - Conv(Kx1) - Conv(1xK) - BN
///
/// The stride is split across the two axes so the output matches the other
/// strided primitives.
pub fn fac_conv(
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    affine: bool,
    rng: &mut impl Rng,
) -> Result<Sequential> {
    let vertical = Conv2dConfig::rect(c_in, c_in, (kernel, 1))
        .with_stride_hw((stride, 1))
        .with_padding_hw((padding, 0));
    let horizontal = Conv2dConfig::rect(c_in, c_out, (1, kernel))
        .with_stride_hw((1, stride))
        .with_padding_hw((0, padding));
    Ok(Sequential::new()
        .then(Stage::Relu)
        .then(Stage::Conv(Conv2d::new(vertical, rng)?))
        .then(Stage::Conv(Conv2d::new(horizontal, rng)?))
        .then(Stage::Norm(BatchNorm2d::new(c_out, affine))))
}

/// Pool - BN
pub fn pool_bn(
    mode: PoolMode,
    channels: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    affine: bool,
) -> Result<Sequential> {
    Ok(Sequential::new()
        .then(Stage::Pool(Pool2d::new(mode, kernel, stride, padding)?))
        .then(Stage::Norm(BatchNorm2d::new(channels, affine))))
}

/// Halve the feature map with two offset, strided pointwise convolutions
#[derive(Debug, Clone)]
pub struct FactorizedReduce {
    conv1: Conv2d,
    conv2: Conv2d,
    bn: BatchNorm2d,
}

impl FactorizedReduce {
    pub fn new(c_in: usize, c_out: usize, affine: bool, rng: &mut impl Rng) -> Result<Self> {
        if c_out % 2 != 0 {
            return Err(NasError::InvalidParameter {
                name: "c_out".to_string(),
                value: c_out.to_string(),
                reason: "factorized reduce needs an even channel count".to_string(),
            });
        }
        let half = Conv2dConfig::new(c_in, c_out / 2, 1).with_stride(2);
        Ok(Self {
            conv1: Conv2d::new(half, rng)?,
            conv2: Conv2d::new(half, rng)?,
            bn: BatchNorm2d::new(c_out, affine),
        })
    }

    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let x = relu(x);
        let shifted = x.slice(s![.., .., 1.., 1..]).to_owned();
        let out = concat_channels(&[self.conv1.forward(&x)?, self.conv2.forward(&shifted)?])?;
        self.bn.forward(&out, phase)
    }

    pub fn batches_tracked(&self) -> u64 {
        self.bn.num_batches_tracked()
    }
}

/// Numeric transform behind a primitive
#[derive(Debug, Clone)]
pub enum Block {
    Identity,
    /// Zeros shaped like `x[:, :channels, ::stride, ::stride]`
    Zero { stride: usize, channels: usize },
    Seq(Sequential),
    Reduce(FactorizedReduce),
}

impl Block {
    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        match self {
            Block::Identity => Ok(x.clone()),
            Block::Zero { stride, channels } => {
                let (n, _, h, w) = x.dim();
                Ok(Array4::zeros((n, *channels, strided_extent(h, *stride), strided_extent(w, *stride))))
            }
            Block::Seq(seq) => seq.forward(x, phase),
            Block::Reduce(reduce) => reduce.forward(x, phase),
        }
    }

    /// Batches folded into running statistics by every BN inside the block
    pub fn batches_tracked(&self) -> u64 {
        match self {
            Block::Identity | Block::Zero { .. } => 0,
            Block::Seq(seq) => seq.batches_tracked(),
            Block::Reduce(reduce) => reduce.batches_tracked(),
        }
    }
}

/// A constructed primitive plus an evaluation counter
#[derive(Debug, Clone)]
pub struct Primitive {
    kind: PrimitiveKind,
    block: Block,
    c_in: usize,
    evaluations: u64,
}

impl Primitive {
    /// Registry: construct `kind` for the given channel widths and stride
    pub fn build(
        kind: PrimitiveKind,
        c_in: usize,
        c_out: usize,
        stride: usize,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if stride == 0 {
            return Err(NasError::InvalidParameter {
                name: "stride".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let block = match kind {
            PrimitiveKind::None => Block::Zero { stride, channels: c_out },
            PrimitiveKind::AvgPool3x3 => Block::Seq(pool_bn(PoolMode::Avg, c_in, 3, stride, 1, affine)?),
            PrimitiveKind::MaxPool3x3 => Block::Seq(pool_bn(PoolMode::Max, c_in, 3, stride, 1, affine)?),
            PrimitiveKind::SkipConnect if stride == 1 => Block::Identity,
            PrimitiveKind::SkipConnect => Block::Reduce(FactorizedReduce::new(c_in, c_out, affine, rng)?),
            PrimitiveKind::SepConv3x3 => Block::Seq(sep_conv(c_in, c_out, 3, stride, 1, affine, rng)?),
            PrimitiveKind::SepConv5x5 => Block::Seq(sep_conv(c_in, c_out, 5, stride, 2, affine, rng)?),
            PrimitiveKind::SepConv7x7 => Block::Seq(sep_conv(c_in, c_out, 7, stride, 3, affine, rng)?),
            PrimitiveKind::DilConv3x3 => Block::Seq(dil_conv(c_in, c_out, 3, stride, 2, 2, affine, rng)?),
            PrimitiveKind::DilConv5x5 => Block::Seq(dil_conv(c_in, c_out, 5, stride, 4, 2, affine, rng)?),
            PrimitiveKind::Conv7x1_1x7 => Block::Seq(fac_conv(c_in, c_out, 7, stride, 3, affine, rng)?),
            PrimitiveKind::NorConv3x3 => Block::Seq(relu_conv_bn(c_in, c_out, 3, stride, 1, affine, rng)?),
            PrimitiveKind::NorConv1x1 => Block::Seq(relu_conv_bn(c_in, c_out, 1, stride, 0, affine, rng)?),
        };
        Ok(Self {
            kind,
            block,
            c_in,
            evaluations: 0,
        })
    }

    pub fn kind(&self) -> PrimitiveKind {
        self.kind
    }

    pub fn block(&self) -> &Block {
        &self.block
    }

    pub fn in_channels(&self) -> usize {
        self.c_in
    }

    /// How many times this primitive has been evaluated
    pub fn evaluations(&self) -> u64 {
        self.evaluations
    }

    /// Evaluate on `x`, which must carry exactly `in_channels` channels
    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let channels = x.dim().1;
        if channels != self.c_in {
            return Err(NasError::shape(
                format!("{} input channels for {}", self.c_in, self.kind),
                channels,
            ));
        }
        self.evaluations += 1;
        self.block.forward(x, phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn input() -> Array4<f64> {
        Array4::from_shape_fn((2, 8, 8, 8), |(b, c, y, x)| ((b * 7 + c * 3 + y * x) % 5) as f64 - 2.0)
    }

    #[test]
    fn test_every_primitive_shape_contract() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        for kind in PrimitiveKind::ALL {
            for stride in [1, 2] {
                let mut op = Primitive::build(kind, 8, 8, stride, false, &mut rng).unwrap();
                let y = op.forward(&input(), Phase::Train).unwrap();
                assert_eq!(y.dim(), (2, 8, 8 / stride, 8 / stride), "{} stride {}", kind, stride);
                assert_eq!(op.evaluations(), 1);
            }
        }
    }

    #[test]
    fn test_skip_connect_is_identity_at_stride_one() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut op = Primitive::build(PrimitiveKind::SkipConnect, 8, 8, 1, false, &mut rng).unwrap();
        assert!(matches!(op.block(), Block::Identity));
        assert_eq!(op.forward(&input(), Phase::Train).unwrap(), input());

        let op = Primitive::build(PrimitiveKind::SkipConnect, 8, 8, 2, false, &mut rng).unwrap();
        assert!(matches!(op.block(), Block::Reduce(_)));
    }

    #[test]
    fn test_zero_output_is_zero() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut op = Primitive::build(PrimitiveKind::None, 8, 8, 2, false, &mut rng).unwrap();
        let y = op.forward(&input(), Phase::Train).unwrap();
        assert!(y.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_sep_conv_composition() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let seq = sep_conv(4, 6, 3, 2, 1, false, &mut rng).unwrap();
        // two (relu, depthwise, pointwise, bn) blocks
        assert_eq!(seq.len(), 8);
        assert_eq!(seq.norms().count(), 2);
    }

    #[test]
    fn test_primitive_rejects_wrong_channels() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut op = Primitive::build(PrimitiveKind::SepConv3x3, 4, 4, 1, false, &mut rng).unwrap();
        assert!(matches!(op.forward(&input(), Phase::Train), Err(NasError::ShapeError { .. })));
    }

    #[test]
    fn test_parameter_free_primitives_check_channels() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        for kind in [PrimitiveKind::SkipConnect, PrimitiveKind::None] {
            let mut op = Primitive::build(kind, 6, 6, 1, false, &mut rng).unwrap();
            assert!(matches!(op.forward(&input(), Phase::Train), Err(NasError::ShapeError { .. })));
            assert_eq!(op.evaluations(), 0);
        }
        let mut zero = Primitive::build(PrimitiveKind::None, 8, 4, 2, false, &mut rng).unwrap();
        assert_eq!(zero.forward(&input(), Phase::Train).unwrap().dim(), (2, 4, 4, 4));
    }

    #[test]
    fn test_factorized_reduce_requires_even_channels() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        assert!(FactorizedReduce::new(8, 7, false, &mut rng).is_err());
    }

    #[test]
    fn test_statistics_only_updated_in_train() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        let mut op = Primitive::build(PrimitiveKind::MaxPool3x3, 8, 8, 1, false, &mut rng).unwrap();
        op.forward(&input(), Phase::Eval).unwrap();
        assert_eq!(op.block().batches_tracked(), 0);
        op.forward(&input(), Phase::Train).unwrap();
        assert_eq!(op.block().batches_tracked(), 1);
    }
}
