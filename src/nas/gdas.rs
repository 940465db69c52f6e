//! GDAS - Gradient-based search using Differentiable Architecture Sampler
//!
//! Every edge evaluates a single primitive picked by a Gumbel-softmax draw
//! over its architecture logits. The temperature is owned by the network and
//! annealed by the caller.

use ndarray::{concatenate, Array2, Array4, ArrayView2, Axis};
use rand::Rng;
use tracing::{debug, warn};

use super::config::{SpaceConfig, SpaceKind};
use super::darts::DartsNetwork;
use super::genotype::Genotype;
use super::operations::{relu_conv_bn, Block, FactorizedReduce};
use crate::error::{NasError, Result};
use crate::layers::{
    concat_channels, BatchNorm2d, Conv2d, Conv2dConfig, Phase, Pool2d, PoolMode, Sequential,
    Stage,
};

/// Result of one Gumbel-softmax draw over an (edges, ops) logit matrix
#[derive(Debug, Clone, PartialEq)]
pub struct GumbelSample {
    /// Straight-through weights: one-hot in value, `probs` in gradient
    pub hard: Array2<f64>,
    /// Soft Gumbel-softmax probabilities
    pub probs: Array2<f64>,
    /// Selected primitive per edge
    pub index: Vec<usize>,
}

/// Gumbel-softmax sampler with a bounded resampling loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GumbelSelector {
    max_attempts: usize,
}

impl Default for GumbelSelector {
    fn default() -> Self {
        Self { max_attempts: 64 }
    }
}

impl GumbelSelector {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Draw hard weights and indices from `logits`
    ///
    /// Draws with an infinite or NaN noise or probability are discarded and
    /// resampled with fresh noise, up to `max_attempts` times.
    pub fn sample(&self, logits: ArrayView2<f64>, tau: f64, rng: &mut impl Rng) -> Result<GumbelSample> {
        check_tau(tau)?;
        if logits.ncols() == 0 {
            return Err(NasError::ConfigError("cannot sample from an empty vocabulary".to_string()));
        }
        for attempt in 1..=self.max_attempts {
            let gumbels = gumbel_noise(logits.dim(), rng);
            if let Some(sample) = relax(logits, &gumbels, tau) {
                return Ok(sample);
            }
            warn!(attempt, max_attempts = self.max_attempts, "Degenerate Gumbel draw, resampling");
        }
        Err(NasError::ConvergenceError {
            iterations: self.max_attempts,
        })
    }
}

fn check_tau(tau: f64) -> Result<()> {
    if tau.is_finite() && tau > 0.0 {
        Ok(())
    } else {
        Err(NasError::InvalidParameter {
            name: "tau".to_string(),
            value: tau.to_string(),
            reason: "must be a positive finite temperature".to_string(),
        })
    }
}

/// i.i.d. standard Gumbel noise, `-ln(E)` with `E ~ Exp(1)`
fn gumbel_noise(dim: (usize, usize), rng: &mut impl Rng) -> Array2<f64> {
    Array2::from_shape_fn(dim, |_| {
        // (0, 1] so the exponential draw is finite
        let u = 1.0 - rng.gen::<f64>();
        let e = -u.ln();
        -e.ln()
    })
}

/// Softmax of `(log_softmax(logits) + gumbels) / tau`, row by row
///
/// Returns `None` when the draw is degenerate.
fn relax(logits: ArrayView2<f64>, gumbels: &Array2<f64>, tau: f64) -> Option<GumbelSample> {
    if gumbels.iter().any(|g| g.is_infinite()) {
        return None;
    }
    let (rows, cols) = logits.dim();
    let mut probs = Array2::zeros((rows, cols));
    let mut one_hot = Array2::zeros((rows, cols));
    let mut index = Vec::with_capacity(rows);

    for r in 0..rows {
        let row = logits.row(r);
        let max = row.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        let log_z = max + row.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
        let scaled: Vec<f64> = row
            .iter()
            .zip(gumbels.row(r))
            .map(|(&l, &g)| (l - log_z + g) / tau)
            .collect();
        let smax = scaled.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let denom: f64 = scaled.iter().map(|&v| (v - smax).exp()).sum();

        let mut best = 0;
        for (c, &v) in scaled.iter().enumerate() {
            let p = (v - smax).exp() / denom;
            if !p.is_finite() {
                return None;
            }
            probs[[r, c]] = p;
            if p > probs[[r, best]] {
                best = c;
            }
        }
        one_hot[[r, best]] = 1.0;
        index.push(best);
    }

    let hard = &one_hot - &probs + &probs;
    Some(GumbelSample { hard, probs, index })
}

/// Linear temperature annealing from `tau_max` at epoch 0 to `tau_min` at the last epoch
pub fn linear_tau(tau_max: f64, tau_min: f64, epoch: usize, total_epochs: usize) -> f64 {
    if total_epochs <= 1 {
        return tau_min;
    }
    let progress = epoch.min(total_epochs - 1) as f64 / (total_epochs - 1) as f64;
    tau_max - (tau_max - tau_min) * progress
}

/// Hand-designed reduction cell used by GDAS-FRC
///
/// Two factorized strided conv branches on the inputs and two max-pool
/// branches; the output concatenates all four, so it is `4 * c` wide.
#[derive(Debug, Clone)]
pub struct GdasReductionCell {
    preproc0: Block,
    preproc1: Block,
    conv_branches: [Sequential; 2],
    pool_branches: [Sequential; 2],
    c: usize,
}

impl GdasReductionCell {
    pub fn new(
        c_pp: usize,
        c_p: usize,
        c: usize,
        reduction_p: bool,
        affine: bool,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if c % 8 != 0 {
            return Err(NasError::InvalidParameter {
                name: "c".to_string(),
                value: c.to_string(),
                reason: "grouped convolutions need a multiple of 8 channels".to_string(),
            });
        }
        let preproc0 = if reduction_p {
            Block::Reduce(FactorizedReduce::new(c_pp, c, affine, rng)?)
        } else {
            Block::Seq(relu_conv_bn(c_pp, c, 1, 1, 0, affine, rng)?)
        };
        let preproc1 = Block::Seq(relu_conv_bn(c_p, c, 1, 1, 0, affine, rng)?);

        let conv_branches = [conv_branch(c, affine, rng)?, conv_branch(c, affine, rng)?];
        let pool_branches = [pool_branch(c, affine)?, pool_branch(c, affine)?];

        Ok(Self {
            preproc0,
            preproc1,
            conv_branches,
            pool_branches,
            c,
        })
    }

    pub fn out_channels(&self) -> usize {
        4 * self.c
    }

    pub fn forward(&mut self, s0: &Array4<f64>, s1: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let s0 = self.preproc0.forward(s0, phase)?;
        let s1 = self.preproc1.forward(s1, phase)?;
        let [conv0, conv1] = &mut self.conv_branches;
        let [pool0, pool1] = &mut self.pool_branches;
        let x0 = conv0.forward(&s0, phase)?;
        let x1 = conv1.forward(&s1, phase)?;
        let x2 = pool0.forward(&s0, phase)?;
        let x3 = pool1.forward(&s1, phase)?;
        concat_channels(&[x0, x1, x2, x3])
    }
}

/// ReLU, grouped (1,3) and (3,1) strided convs, BN, ReLU, 1x1 conv, BN
fn conv_branch(c: usize, affine: bool, rng: &mut impl Rng) -> Result<Sequential> {
    let horizontal = Conv2dConfig::rect(c, c, (1, 3))
        .with_stride_hw((1, 2))
        .with_padding_hw((0, 1))
        .with_groups(8)
        .with_bias(!affine);
    let vertical = Conv2dConfig::rect(c, c, (3, 1))
        .with_stride_hw((2, 1))
        .with_padding_hw((1, 0))
        .with_groups(8)
        .with_bias(!affine);
    let pointwise = Conv2dConfig::new(c, c, 1).with_bias(!affine);
    Ok(Sequential::new()
        .then(Stage::Relu)
        .then(Stage::Conv(Conv2d::new(horizontal, rng)?))
        .then(Stage::Conv(Conv2d::new(vertical, rng)?))
        .then(Stage::Norm(BatchNorm2d::new(c, affine)))
        .then(Stage::Relu)
        .then(Stage::Conv(Conv2d::new(pointwise, rng)?))
        .then(Stage::Norm(BatchNorm2d::new(c, affine))))
}

fn pool_branch(c: usize, affine: bool) -> Result<Sequential> {
    Ok(Sequential::new()
        .then(Stage::Pool(Pool2d::new(PoolMode::Max, 3, 2, 1)?))
        .then(Stage::Norm(BatchNorm2d::new(c, affine))))
}

/// DARTS network driven by Gumbel-softmax hard selection
#[derive(Debug, Clone)]
pub struct GdasNetwork {
    network: DartsNetwork,
    selector: GumbelSelector,
    tau: f64,
}

impl GdasNetwork {
    pub fn new(config: &SpaceConfig, rng: &mut impl Rng) -> Result<Self> {
        if !matches!(config.space, SpaceKind::Gdas | SpaceKind::GdasFrc) {
            return Err(NasError::ConfigError(format!(
                "GDAS network needs a gdas or gdas_frc space, got {}",
                config.space
            )));
        }
        let network = DartsNetwork::new(config, rng)?;
        debug!(tau = config.tau, fixed_reduction = config.space == SpaceKind::GdasFrc, "Built GDAS network");
        Ok(Self {
            network,
            selector: GumbelSelector::new(config.max_gumbel_attempts),
            tau: config.tau,
        })
    }

    pub fn tau(&self) -> f64 {
        self.tau
    }

    /// Set the Gumbel-softmax temperature
    pub fn set_tau(&mut self, tau: f64) -> Result<()> {
        check_tau(tau)?;
        self.tau = tau;
        Ok(())
    }

    pub fn selector(&self) -> &GumbelSelector {
        &self.selector
    }

    pub fn network(&self) -> &DartsNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut DartsNetwork {
        &mut self.network
    }

    /// Sample hard weights for both halves of the architecture logits
    pub fn sample(&self, logits: ArrayView2<f64>, rng: &mut impl Rng) -> Result<GumbelSample> {
        let (normal, reduce) = self.network.split_weights(logits)?;
        let normal = self.selector.sample(normal, self.tau, rng)?;
        let reduce = self.selector.sample(reduce, self.tau, rng)?;
        let mut index = normal.index;
        index.extend(reduce.index);
        Ok(GumbelSample {
            hard: concatenate(Axis(0), &[normal.hard.view(), reduce.hard.view()])?,
            probs: concatenate(Axis(0), &[normal.probs.view(), reduce.probs.view()])?,
            index,
        })
    }

    /// Forward pass with a fresh Gumbel draw
    pub fn forward(
        &mut self,
        x: &Array4<f64>,
        logits: ArrayView2<f64>,
        phase: Phase,
        rng: &mut impl Rng,
    ) -> Result<Array2<f64>> {
        let sample = self.sample(logits, rng)?;
        self.network.forward_gdas(x, sample.hard.view(), &sample.index, phase)
    }

    pub fn genotype(&self, logits: ArrayView2<f64>) -> Result<Genotype> {
        self.network.genotype(logits)
    }
}
