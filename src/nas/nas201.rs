//! NAS-Bench-201 search network
//!
//! Three stages of complete-DAG search cells separated by residual blocks
//! that halve the resolution and double the width. All search cells share one
//! architecture tensor with a row per edge.

use std::collections::BTreeMap;

use ndarray::{Array2, Array4, ArrayView2};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::debug;

use super::config::{SpaceConfig, SpaceKind};
use super::mixed_op::MixedOp;
use super::operations::relu_conv_bn;
use super::search_space::OpVocabulary;
use crate::error::{NasError, Result};
use crate::layers::{
    accumulate, global_avg_pool, BatchNorm2d, Conv2d, Conv2dConfig, Linear, Phase, Pool2d,
    PoolMode, Sequential, Stage,
};

/// Residual block with two 3x3 ReLU-conv-BN stages
#[derive(Debug, Clone)]
pub struct ResNetBasicBlock {
    conv_a: Sequential,
    conv_b: Sequential,
    downsample: Option<Sequential>,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
}

impl ResNetBasicBlock {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, rng: &mut impl Rng) -> Result<Self> {
        if stride != 1 && stride != 2 {
            return Err(NasError::ConfigError(format!("invalid residual block stride {}", stride)));
        }
        let conv_a = relu_conv_bn(in_channels, out_channels, 3, stride, 1, true, rng)?;
        let conv_b = relu_conv_bn(out_channels, out_channels, 3, 1, 1, true, rng)?;
        let downsample = if stride == 2 {
            Some(
                Sequential::new()
                    .then(Stage::Pool(Pool2d::new(PoolMode::Avg, 2, 2, 0)?))
                    .then(Stage::Conv(Conv2d::new(Conv2dConfig::new(in_channels, out_channels, 1), rng)?)),
            )
        } else if in_channels != out_channels {
            Some(relu_conv_bn(in_channels, out_channels, 1, 1, 0, true, rng)?)
        } else {
            None
        };
        Ok(Self {
            conv_a,
            conv_b,
            downsample,
            in_channels,
            out_channels,
            stride,
        })
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn forward(&mut self, x: &Array4<f64>, phase: Phase) -> Result<Array4<f64>> {
        let a = self.conv_a.forward(x, phase)?;
        let b = self.conv_b.forward(&a, phase)?;
        let residual = match &mut self.downsample {
            Some(down) => down.forward(x, phase)?,
            None => x.clone(),
        };
        accumulate(Some(residual), b)
    }
}

/// Key of the edge entering node `to` from node `from`
pub fn edge_key(to: usize, from: usize) -> String {
    format!("{}<-{}", to, from)
}

/// Row of each edge in the architecture tensor: keys in sorted string order
pub fn edge_to_index(max_nodes: usize) -> BTreeMap<String, usize> {
    let mut keys: Vec<String> = (1..max_nodes)
        .flat_map(|i| (0..i).map(move |j| edge_key(i, j)))
        .collect();
    keys.sort();
    keys.into_iter().enumerate().map(|(row, key)| (key, row)).collect()
}

#[derive(Debug, Clone)]
struct DagEdge {
    from: usize,
    row: usize,
    op: MixedOp,
}

/// Complete-DAG search cell: node `i` sums one mixed edge from every `j < i`
#[derive(Debug, Clone)]
pub struct Nas201SearchCell {
    nodes: Vec<Vec<DagEdge>>,
    num_edges: usize,
    out_channels: usize,
}

impl Nas201SearchCell {
    pub fn new(
        max_nodes: usize,
        c_in: usize,
        c_out: usize,
        stride: usize,
        vocab: &OpVocabulary,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if max_nodes < 2 {
            return Err(NasError::ConfigError("a search cell needs at least two nodes".to_string()));
        }
        let rows = edge_to_index(max_nodes);
        let mut nodes = Vec::with_capacity(max_nodes - 1);
        for i in 1..max_nodes {
            let mut edges = Vec::with_capacity(i);
            for j in 0..i {
                let (c, s) = if j == 0 { (c_in, stride) } else { (c_out, 1) };
                let row = rows
                    .get(&edge_key(i, j))
                    .copied()
                    .ok_or_else(|| NasError::ComputationError(format!("missing edge {}", edge_key(i, j))))?;
                edges.push(DagEdge {
                    from: j,
                    row,
                    op: MixedOp::new(c, c_out, s, vocab, rng)?,
                });
            }
            nodes.push(edges);
        }
        Ok(Self {
            nodes,
            num_edges: rows.len(),
            out_channels: c_out,
        })
    }

    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn forward(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array4<f64>> {
        self.run(x, weights, phase, false)
    }

    pub fn forward_soft(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array4<f64>> {
        self.run(x, weights, phase, true)
    }

    fn run(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase, dense: bool) -> Result<Array4<f64>> {
        if weights.nrows() != self.num_edges {
            return Err(NasError::WeightLengthMismatch {
                expected: self.num_edges,
                actual: weights.nrows(),
            });
        }
        let mut states = vec![x.clone()];
        for edges in self.nodes.iter_mut() {
            let mut acc: Option<Array4<f64>> = None;
            for edge in edges.iter_mut() {
                let w = weights.row(edge.row);
                let out = if dense {
                    edge.op.forward_soft(&states[edge.from], w, phase)?
                } else {
                    edge.op.forward(&states[edge.from], w, phase)?
                };
                acc = Some(accumulate(acc, out)?);
            }
            let node = acc.ok_or_else(|| NasError::ComputationError("node without edges".to_string()))?;
            states.push(node);
        }
        states
            .pop()
            .ok_or_else(|| NasError::ComputationError("cell has no nodes".to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum Nas201Layer {
    Search(Nas201SearchCell),
    Residual(ResNetBasicBlock),
}

/// NAS-Bench-201 search network
#[derive(Debug, Clone)]
pub struct NasBench201Network {
    vocab: OpVocabulary,
    max_nodes: usize,
    stem: Sequential,
    layers: Vec<Nas201Layer>,
    lastact: Sequential,
    classifier: Linear,
    edge2index: BTreeMap<String, usize>,
}

impl NasBench201Network {
    /// Build from a configuration: `layers` is cells per stage, `nodes` the
    /// node count of every cell including its input
    pub fn new(config: &SpaceConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        if config.space != SpaceKind::NasBench201 {
            return Err(NasError::ConfigError(format!(
                "NAS-Bench-201 network needs a nas_bench_201 space, got {}",
                config.space
            )));
        }
        let vocab = config.vocabulary()?;
        let (c, n) = (config.channels, config.layers);
        let stem = Sequential::new()
            .then(Stage::Conv(Conv2d::new(
                Conv2dConfig::new(config.input_channels, c, 3).with_padding(1),
                rng,
            )?))
            .then(Stage::Norm(BatchNorm2d::new(c, true)));

        let mut plan = Vec::with_capacity(3 * n + 2);
        for (stage, width) in [c, 2 * c, 4 * c].into_iter().enumerate() {
            if stage > 0 {
                plan.push((width, true));
            }
            plan.extend(std::iter::repeat((width, false)).take(n));
        }

        let mut c_prev = c;
        let mut layers = Vec::with_capacity(plan.len());
        for (c_cur, reduction) in plan {
            let layer = if reduction {
                Nas201Layer::Residual(ResNetBasicBlock::new(c_prev, c_cur, 2, rng)?)
            } else {
                Nas201Layer::Search(Nas201SearchCell::new(config.nodes, c_prev, c_cur, 1, &vocab, rng)?)
            };
            layers.push(layer);
            c_prev = c_cur;
        }

        let lastact = Sequential::new()
            .then(Stage::Norm(BatchNorm2d::new(c_prev, true)))
            .then(Stage::Relu);
        let classifier = Linear::new(c_prev, config.num_classes, rng);
        let edge2index = edge_to_index(config.nodes);

        debug!(
            layers = layers.len(),
            max_nodes = config.nodes,
            num_edges = edge2index.len(),
            "Built NAS-Bench-201 network"
        );

        Ok(Self {
            vocab,
            max_nodes: config.nodes,
            stem,
            layers,
            lastact,
            classifier,
            edge2index,
        })
    }

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

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.edge2index.len()
    }

    /// Every search cell shares the same rows, so this equals `num_edges`
    pub fn all_edges(&self) -> usize {
        self.num_edges()
    }

    pub fn num_ops(&self) -> usize {
        self.vocab.len()
    }

    pub fn edge2index(&self) -> &BTreeMap<String, usize> {
        &self.edge2index
    }

    pub fn layers(&self) -> &[Nas201Layer] {
        &self.layers
    }

    fn check_weights(&self, weights: &ArrayView2<f64>) -> Result<()> {
        if weights.nrows() != self.num_edges() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.num_edges(),
                actual: weights.nrows(),
            });
        }
        if weights.ncols() != self.num_ops() {
            return Err(NasError::WeightLengthMismatch {
                expected: self.num_ops(),
                actual: weights.ncols(),
            });
        }
        Ok(())
    }

    /// Relaxed forward pass
    pub fn forward(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        self.run(x, weights, phase, false)
    }

    /// Dense forward pass
    pub fn forward_soft(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        self.run(x, weights, phase, true)
    }

    fn run(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase, dense: bool) -> Result<Array2<f64>> {
        self.check_weights(&weights)?;
        let mut feature = self.stem.forward(x, phase)?;
        for layer in self.layers.iter_mut() {
            feature = match layer {
                Nas201Layer::Residual(block) => block.forward(&feature, phase)?,
                Nas201Layer::Search(cell) if dense => cell.forward_soft(&feature, weights, phase)?,
                Nas201Layer::Search(cell) => cell.forward(&feature, weights, phase)?,
            };
        }
        let feature = self.lastact.forward(&feature, phase)?;
        let pooled = global_avg_pool(&feature)?;
        self.classifier.forward(&pooled)
    }

    /// Architecture string `|op~0|+|op~0|op~1|+...`, first maximum wins
    pub fn genotype(&self, theta: ArrayView2<f64>) -> Result<String> {
        self.check_weights(&theta)?;
        let mut genotype = String::new();
        for i in 1..self.max_nodes {
            let mut node = String::from("|");
            for j in 0..i {
                let key = edge_key(i, j);
                let row = self
                    .edge2index
                    .get(&key)
                    .copied()
                    .ok_or_else(|| NasError::ComputationError(format!("missing edge {}", key)))?;
                let weights = theta.row(row);
                let mut best = 0;
                for (k, &w) in weights.iter().enumerate() {
                    if w > weights[best] {
                        best = k;
                    }
                }
                let op = self
                    .vocab
                    .get(best)
                    .ok_or_else(|| NasError::ComputationError(format!("no primitive at index {}", best)))?;
                node.push_str(&format!("{}~{}|", op, j));
            }
            if i > 1 {
                genotype.push('+');
            }
            genotype.push_str(&node);
        }
        Ok(genotype)
    }

    pub fn uniform_weights(&self) -> Array2<f64> {
        Array2::from_elem((self.num_edges(), self.num_ops()), 1.0 / self.num_ops() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas::search_space::PrimitiveKind;

    fn input() -> Array4<f64> {
        Array4::from_shape_fn((2, 3, 8, 8), |(b, c, y, x)| ((b + 2 * c + y + 3 * x) % 5) as f64 * 0.5 - 1.0)
    }

    fn small() -> SpaceConfig {
        SpaceConfig::new(SpaceKind::NasBench201).with_channels(4).with_layers(1)
    }

    #[test]
    fn test_edge_index_is_sorted_key_order() {
        let index = edge_to_index(4);
        assert_eq!(index.len(), 6);
        assert_eq!(index["1<-0"], 0);
        assert_eq!(index["2<-0"], 1);
        assert_eq!(index["2<-1"], 2);
        assert_eq!(index["3<-2"], 5);
    }

    #[test]
    fn test_residual_block() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let mut down = ResNetBasicBlock::new(4, 8, 2, &mut rng).unwrap();
        assert_eq!(down.forward(&Array4::ones((2, 4, 8, 8)), Phase::Train).unwrap().dim(), (2, 8, 4, 4));
        let mut widen = ResNetBasicBlock::new(4, 8, 1, &mut rng).unwrap();
        assert_eq!(widen.forward(&Array4::ones((2, 4, 8, 8)), Phase::Train).unwrap().dim(), (2, 8, 8, 8));
        let mut same = ResNetBasicBlock::new(4, 4, 1, &mut rng).unwrap();
        assert!(same.downsample.is_none());
        assert_eq!(same.forward(&Array4::ones((2, 4, 8, 8)), Phase::Train).unwrap().dim(), (2, 4, 8, 8));
        assert!(matches!(ResNetBasicBlock::new(4, 4, 3, &mut rng), Err(NasError::ConfigError(_))));
    }

    #[test]
    fn test_network_layout_and_forward() {
        let mut net = NasBench201Network::from_config(&small(), Some(3)).unwrap();
        assert_eq!(net.num_edges(), 6);
        assert_eq!(net.num_ops(), 5);
        let kinds: Vec<bool> = net.layers().iter().map(|l| matches!(l, Nas201Layer::Residual(_))).collect();
        assert_eq!(kinds, vec![false, true, false, true, false]);

        let w = net.uniform_weights();
        assert_eq!(net.forward(&input(), w.view(), Phase::Train).unwrap().dim(), (2, 10));
        assert_eq!(net.forward_soft(&input(), w.view(), Phase::Eval).unwrap().dim(), (2, 10));
        let bad = Array2::<f64>::zeros((5, 5));
        assert!(net.forward(&input(), bad.view(), Phase::Train).is_err());
    }

    #[test]
    fn test_genotype_string() {
        let net = NasBench201Network::from_config(&small(), Some(3)).unwrap();
        let vocab = net.vocabulary().clone();
        let conv3 = vocab.index_of(PrimitiveKind::NorConv3x3).unwrap();
        let skip = vocab.index_of(PrimitiveKind::SkipConnect).unwrap();
        let mut theta = Array2::<f64>::zeros((6, 5));
        for (key, &row) in net.edge2index() {
            let pick = if key.ends_with("<-0") { conv3 } else { skip };
            theta[[row, pick]] = 1.0;
        }
        assert_eq!(
            net.genotype(theta.view()).unwrap(),
            "|nor_conv_3x3~0|+|nor_conv_3x3~0|skip_connect~1|+|nor_conv_3x3~0|skip_connect~1|skip_connect~2|"
        );

        // ties resolve to the first primitive
        let flat = Array2::<f64>::zeros((6, 5));
        assert!(net.genotype(flat.view()).unwrap().starts_with("|none~0|"));
    }

    #[test]
    fn test_rejects_darts_space() {
        assert!(NasBench201Network::from_config(&SpaceConfig::default(), Some(0)).is_err());
    }
}
