//! DARTS - Differentiable Architecture Search network
//!
//! Stacks search cells over a convolutional stem. Reduction cells sit at
//! layers `L / 3` and `2L / 3`, where the cell width doubles. Architecture
//! weights are tied: every normal cell reads the first `num_edges` rows of the
//! architecture tensor and every reduction cell the remaining rows.

use ndarray::{Array2, Array4, ArrayView2, Axis};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::cell::{edge_count, node_index, unpack_weights, DartsCell, INPUT_NODES};
use super::config::{SpaceConfig, SpaceKind};
use super::gdas::GdasReductionCell;
use super::genotype::{self, Genotype, EDGES_PER_NODE};
use super::search_space::OpVocabulary;
use crate::error::{NasError, Result};
use crate::layers::{
    global_avg_pool, BatchNorm2d, Conv2d, Conv2dConfig, Linear, Phase, Sequential, Stage,
};

/// Channel bookkeeping of one stacked cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerPlan {
    /// Output width of cell k-2
    pub c_pp: usize,
    /// Output width of cell k-1
    pub c_p: usize,
    /// Internal width of this cell
    pub c_cur: usize,
    pub reduction_p: bool,
    pub reduction: bool,
}

/// Layers holding a reduction cell
pub fn reduction_layers(n_layers: usize) -> [usize; 2] {
    [n_layers / 3, 2 * n_layers / 3]
}

/// Channel plan of a DARTS stack
///
/// The stem output feeds both inputs of the first cell, so it starts as
/// both `c_pp` and `c_p`.
pub fn channel_plan(c: usize, n_layers: usize, n_nodes: usize, stem_multiplier: usize) -> Vec<LayerPlan> {
    let reductions = reduction_layers(n_layers);
    let stem = stem_multiplier * c;
    let (mut c_pp, mut c_p, mut c_cur) = (stem, stem, c);
    let mut reduction_p = false;

    let mut plan = Vec::with_capacity(n_layers);
    for i in 0..n_layers {
        let reduction = reductions.contains(&i);
        if reduction {
            c_cur *= 2;
        }
        plan.push(LayerPlan {
            c_pp,
            c_p,
            c_cur,
            reduction_p,
            reduction,
        });
        reduction_p = reduction;
        c_pp = c_p;
        c_p = c_cur * n_nodes;
    }
    plan
}

/// A cell in the stack
#[derive(Debug, Clone)]
pub enum StackedCell {
    Search(DartsCell),
    FixedReduction(GdasReductionCell),
}

impl StackedCell {
    pub fn is_reduction(&self) -> bool {
        match self {
            StackedCell::Search(cell) => cell.is_reduction(),
            StackedCell::FixedReduction(_) => true,
        }
    }

    pub fn out_channels(&self) -> usize {
        match self {
            StackedCell::Search(cell) => cell.out_channels(),
            StackedCell::FixedReduction(cell) => cell.out_channels(),
        }
    }
}

/// DARTS search network
#[derive(Debug, Clone)]
pub struct DartsNetwork {
    vocab: OpVocabulary,
    n_nodes: usize,
    num_classes: usize,
    stem: Sequential,
    cells: Vec<StackedCell>,
    classifier: Linear,
    plan: Vec<LayerPlan>,
    num_edges: usize,
}

impl DartsNetwork {
    /// Build the network described by `config`
    ///
    /// With [`SpaceKind::GdasFrc`] the reduction layers use the fixed GDAS
    /// reduction cell instead of a search cell.
    pub fn new(config: &SpaceConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        if config.space == SpaceKind::NasBench201 {
            return Err(NasError::ConfigError(
                "a NAS-Bench-201 configuration cannot build a DARTS network".to_string(),
            ));
        }
        let vocab = config.vocabulary()?;
        let c_stem = config.stem_multiplier * config.channels;
        let stem = Sequential::new()
            .then(Stage::Conv(Conv2d::new(
                Conv2dConfig::new(config.input_channels, c_stem, 3).with_padding(1),
                rng,
            )?))
            .then(Stage::Norm(BatchNorm2d::new(c_stem, true)));

        let plan = channel_plan(config.channels, config.layers, config.nodes, config.stem_multiplier);
        let fixed_reduction = config.space == SpaceKind::GdasFrc;
        let mut cells = Vec::with_capacity(plan.len());
        for layer in &plan {
            let cell = if layer.reduction && fixed_reduction {
                StackedCell::FixedReduction(GdasReductionCell::new(
                    layer.c_pp,
                    layer.c_p,
                    layer.c_cur,
                    layer.reduction_p,
                    false,
                    rng,
                )?)
            } else {
                StackedCell::Search(DartsCell::new(
                    config.nodes,
                    layer.c_pp,
                    layer.c_p,
                    layer.c_cur,
                    layer.reduction_p,
                    layer.reduction,
                    &vocab,
                    rng,
                )?)
            };
            cells.push(cell);
        }

        let c_last = cells.last().map(StackedCell::out_channels).unwrap_or(c_stem);
        let classifier = Linear::new(c_last, config.num_classes, rng);
        let num_edges = edge_count(config.nodes, INPUT_NODES);

        debug!(
            space = %config.space,
            layers = config.layers,
            nodes = config.nodes,
            num_edges,
            num_ops = vocab.len(),
            "Built DARTS network"
        );

        Ok(Self {
            vocab,
            n_nodes: config.nodes,
            num_classes: config.num_classes,
            stem,
            cells,
            classifier,
            plan,
            num_edges,
        })
    }

    /// Build with a seeded RNG, or from entropy when no seed is given
    pub fn from_config(config: &SpaceConfig, seed: Option<u64>) -> Result<Self> {
        let mut rng = match seed {
            Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
            None => Xoshiro256PlusPlus::from_entropy(),
        };
        Self::new(config, &mut rng)
    }

    pub fn vocabulary(&self) -> &OpVocabulary {
        &self.vocab
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Edges per cell
    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// Rows of the full architecture tensor (normal + reduction)
    pub fn all_edges(&self) -> usize {
        2 * self.num_edges
    }

    pub fn num_ops(&self) -> usize {
        self.vocab.len()
    }

    pub fn cells(&self) -> &[StackedCell] {
        &self.cells
    }

    pub fn channel_plan(&self) -> &[LayerPlan] {
        &self.plan
    }

    /// Absolute edge rows of every normal-cell node
    pub fn normal_node_index(&self) -> Vec<Vec<usize>> {
        node_index(self.n_nodes, INPUT_NODES, 0)
    }

    /// Absolute edge rows of every reduction-cell node
    pub fn reduce_node_index(&self) -> Vec<Vec<usize>> {
        node_index(self.n_nodes, INPUT_NODES, self.num_edges)
    }

    /// Split a full architecture tensor into its normal and reduction halves
    pub fn split_weights<'a>(&self, weights: ArrayView2<'a, f64>) -> Result<(ArrayView2<'a, f64>, ArrayView2<'a, f64>)> {
        if weights.nrows() != self.all_edges() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.all_edges(),
                actual: weights.nrows(),
            });
        }
        if weights.ncols() != self.num_ops() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.num_ops(),
                actual: weights.ncols(),
            });
        }
        let (normal, reduce) = weights.split_at(Axis(0), self.num_edges);
        Ok((normal, reduce))
    }

    /// Relaxed forward pass
    pub fn forward(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        let (normal, reduce) = self.split_weights(weights)?;
        self.run(x, phase, |cell, s0, s1| {
            let w = if cell.is_reduction() { reduce } else { normal };
            cell.forward(s0, s1, w, phase)
        })
    }

    /// Dense DARTS forward pass
    pub fn forward_soft(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        let (normal, reduce) = self.split_weights(weights)?;
        self.run(x, phase, |cell, s0, s1| {
            let w = if cell.is_reduction() { reduce } else { normal };
            cell.forward_soft(s0, s1, w, phase)
        })
    }

    /// GDAS forward pass with explicit hard weights and one selected index per edge
    pub fn forward_gdas(
        &mut self,
        x: &Array4<f64>,
        weights: ArrayView2<f64>,
        indices: &[usize],
        phase: Phase,
    ) -> Result<Array2<f64>> {
        let (normal, reduce) = self.split_weights(weights)?;
        if indices.len() != self.all_edges() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.all_edges(),
                actual: indices.len(),
            });
        }
        let (normal_idx, reduce_idx) = indices.split_at(self.num_edges);
        self.run(x, phase, |cell, s0, s1| {
            if cell.is_reduction() {
                cell.forward_gdas(s0, s1, reduce, reduce_idx, phase)
            } else {
                cell.forward_gdas(s0, s1, normal, normal_idx, phase)
            }
        })
    }

    fn run<F>(&mut self, x: &Array4<f64>, phase: Phase, mut eval: F) -> Result<Array2<f64>>
    where
        F: FnMut(&mut DartsCell, &Array4<f64>, &Array4<f64>) -> Result<Array4<f64>>,
    {
        let stem = self.stem.forward(x, phase)?;
        let mut s0 = stem.clone();
        let mut s1 = stem;
        for cell in self.cells.iter_mut() {
            let out = match cell {
                StackedCell::Search(cell) => eval(cell, &s0, &s1)?,
                StackedCell::FixedReduction(cell) => cell.forward(&s0, &s1, phase)?,
            };
            s0 = std::mem::replace(&mut s1, out);
        }
        let pooled = global_avg_pool(&s1)?;
        self.classifier.forward(&pooled)
    }

    /// Discretize a full architecture tensor
    pub fn genotype(&self, theta: ArrayView2<f64>) -> Result<Genotype> {
        let (normal, reduce) = self.split_weights(theta)?;
        let normal_groups = unpack_weights(normal, self.n_nodes, INPUT_NODES)?;
        let reduce_groups = unpack_weights(reduce, self.n_nodes, INPUT_NODES)?;
        Ok(Genotype::new(
            genotype::discretize(&normal_groups, EDGES_PER_NODE, &self.vocab)?,
            genotype::discretize(&reduce_groups, EDGES_PER_NODE, &self.vocab)?,
        ))
    }

    /// One-hot architecture tensor of a genotype
    pub fn genotype_to_onehot(&self, genotype: &Genotype) -> Result<Array2<f64>> {
        genotype::encode(genotype, self.n_nodes, &self.vocab)
    }

    /// Uniform architecture tensor (every primitive weighted 1 / ops)
    pub fn uniform_weights(&self) -> Array2<f64> {
        Array2::from_elem((self.all_edges(), self.num_ops()), 1.0 / self.num_ops() as f64)
    }

    /// Random logits for the architecture tensor, scaled like DARTS initialisation
    pub fn random_alpha(&self, rng: &mut impl Rng) -> Array2<f64> {
        Array2::from_shape_fn((self.all_edges(), self.num_ops()), |_| (rng.gen::<f64>() - 0.5) * 1e-3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> SpaceConfig {
        SpaceConfig::default().with_channels(4).with_layers(3).with_nodes(2)
    }

    #[test]
    fn test_reduction_layers() {
        assert_eq!(reduction_layers(8), [2, 5]);
        assert_eq!(reduction_layers(20), [6, 13]);
    }

    #[test]
    fn test_channel_plan_doubles_at_reductions_only() {
        let plan = channel_plan(16, 8, 4, 3);
        let widths: Vec<usize> = plan.iter().map(|l| l.c_cur).collect();
        assert_eq!(widths, vec![16, 16, 32, 32, 32, 64, 64, 64]);
        let reductions: Vec<usize> = plan
            .iter()
            .enumerate()
            .filter(|(_, l)| l.reduction)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(reductions, vec![2, 5]);
        for (i, pair) in plan.windows(2).enumerate() {
            let doubled = pair[1].c_cur == 2 * pair[0].c_cur;
            assert_eq!(doubled, i + 1 == 2 || i + 1 == 5);
        }
        assert_eq!((plan[0].c_pp, plan[0].c_p), (48, 48));
        assert_eq!((plan[1].c_pp, plan[1].c_p), (48, 64));
        assert_eq!((plan[3].c_pp, plan[3].c_p), (64, 128));
        assert!(plan[3].reduction_p);
    }

    #[test]
    fn test_network_bookkeeping() {
        let net = DartsNetwork::from_config(&small_config(), Some(1)).unwrap();
        assert_eq!(net.num_edges(), 5);
        assert_eq!(net.all_edges(), 10);
        assert_eq!(net.num_ops(), 8);
        assert_eq!(net.cells().len(), 3);
        assert_eq!(net.normal_node_index(), vec![vec![0, 1], vec![2, 3, 4]]);
        assert_eq!(net.reduce_node_index(), vec![vec![5, 6], vec![7, 8, 9]]);
        let flags: Vec<bool> = net.cells().iter().map(StackedCell::is_reduction).collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn test_forward_shapes() {
        let mut net = DartsNetwork::from_config(&small_config(), Some(1)).unwrap();
        let x = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, y, x)| ((b + c + y * x) % 4) as f64 - 1.5);
        let w = net.uniform_weights();
        assert_eq!(net.forward(&x, w.view(), Phase::Train).unwrap().dim(), (2, 10));
        assert_eq!(net.forward_soft(&x, w.view(), Phase::Train).unwrap().dim(), (2, 10));
        let idx = vec![3; net.all_edges()];
        assert_eq!(net.forward_gdas(&x, w.view(), &idx, Phase::Train).unwrap().dim(), (2, 10));
    }

    #[test]
    fn test_weight_shape_validation() {
        let mut net = DartsNetwork::from_config(&small_config(), Some(1)).unwrap();
        let x = Array4::<f64>::ones((2, 3, 8, 8));
        let short = Array2::<f64>::zeros((9, 8));
        assert!(matches!(
            net.forward(&x, short.view(), Phase::Train),
            Err(NasError::WeightLengthMismatch { expected: 10, actual: 9 })
        ));
        let narrow = Array2::<f64>::zeros((10, 7));
        assert!(net.forward_soft(&x, narrow.view(), Phase::Train).is_err());
        let w = net.uniform_weights();
        assert!(net.forward_gdas(&x, w.view(), &[0; 9], Phase::Train).is_err());
    }

    #[test]
    fn test_wrong_input_channels_is_shape_error() {
        let mut net = DartsNetwork::from_config(&small_config(), Some(1)).unwrap();
        let x = Array4::<f64>::ones((2, 1, 8, 8));
        let w = net.uniform_weights();
        assert!(matches!(net.forward(&x, w.view(), Phase::Train), Err(NasError::ShapeError { .. })));
    }

    #[test]
    fn test_genotype_shape_and_concat() {
        let net = DartsNetwork::from_config(&small_config(), Some(1)).unwrap();
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        let alpha = net.random_alpha(&mut rng);
        let g = net.genotype(alpha.view()).unwrap();
        assert_eq!(g.normal.len(), 2);
        assert_eq!(g.reduce.len(), 2);
        assert!(g.normal.iter().chain(&g.reduce).all(|node| node.len() == 2));
        assert_eq!(g.normal_concat, vec![2, 3]);
        assert_eq!(g.reduce_concat, vec![2, 3]);

        let onehot = net.genotype_to_onehot(&g).unwrap();
        assert_eq!(onehot.dim(), (10, 8));
        assert_eq!(net.genotype(onehot.view()).unwrap().normal.len(), 2);
    }

    #[test]
    fn test_rejects_nas_bench_config() {
        let config = SpaceConfig::new(SpaceKind::NasBench201);
        assert!(DartsNetwork::from_config(&config, Some(0)).is_err());
    }
}
