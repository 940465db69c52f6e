//! DAG search cell and the canonical edge layout
//!
//! Edges are serialized node-major, predecessor-minor: node `i` owns the next
//! `input_nodes + i` rows of the flat architecture tensor. States are indexed
//! as `0..input_nodes` for the cell inputs and `input_nodes + i` for node `i`.

use std::ops::Range;

use ndarray::{s, Array4, ArrayView2};
use rand::Rng;
use tracing::debug;

use super::mixed_op::MixedOp;
use super::operations::{relu_conv_bn, Block, FactorizedReduce};
use super::search_space::OpVocabulary;
use crate::error::{NasError, Result};
use crate::layers::{accumulate, concat_channels, Phase};

/// Number of cell inputs (outputs of the two preceding cells)
pub const INPUT_NODES: usize = 2;

/// Total edges of a cell: sum of (input_nodes + i) for i in 0..n_nodes
pub fn edge_count(n_nodes: usize, input_nodes: usize) -> usize {
    (0..n_nodes).map(|i| input_nodes + i).sum()
}

/// Row range of every node inside a flat, per-cell architecture tensor
pub fn node_edge_ranges(n_nodes: usize, input_nodes: usize) -> Vec<Range<usize>> {
    let mut ranges = Vec::with_capacity(n_nodes);
    let mut cursor = 0;
    for i in 0..n_nodes {
        let end = cursor + input_nodes + i;
        ranges.push(cursor..end);
        cursor = end;
    }
    ranges
}

/// Absolute edge positions of every node, offset by `start`
///
/// `start = 0` addresses the normal half of a full tensor and
/// `start = edge_count(..)` the reduction half.
pub fn node_index(n_nodes: usize, input_nodes: usize, start: usize) -> Vec<Vec<usize>> {
    node_edge_ranges(n_nodes, input_nodes)
        .into_iter()
        .map(|r| (r.start + start..r.end + start).collect())
        .collect()
}

/// Split a per-cell weight matrix (edges x ops) into one group per node
pub fn unpack_weights<'a>(
    weights: ArrayView2<'a, f64>,
    n_nodes: usize,
    input_nodes: usize,
) -> Result<Vec<ArrayView2<'a, f64>>> {
    let expected = edge_count(n_nodes, input_nodes);
    if weights.nrows() != expected {
        return Err(NasError::WeightLengthMismatch {
            expected,
            actual: weights.nrows(),
        });
    }
    Ok(node_edge_ranges(n_nodes, input_nodes)
        .into_iter()
        .map(|r| weights.slice_move(s![r, ..]))
        .collect())
}

/// Split a per-cell index list (one selected primitive per edge) into one group per node
pub fn unpack_indices(indices: &[usize], n_nodes: usize, input_nodes: usize) -> Result<Vec<&[usize]>> {
    let expected = edge_count(n_nodes, input_nodes);
    if indices.len() != expected {
        return Err(NasError::WeightLengthMismatch {
            expected,
            actual: indices.len(),
        });
    }
    Ok(node_edge_ranges(n_nodes, input_nodes)
        .into_iter()
        .map(|r| &indices[r])
        .collect())
}

/// An edge of the arena: the predecessor state it reads and its mixed op
#[derive(Debug, Clone)]
pub struct Edge {
    from: usize,
    op: MixedOp,
}

impl Edge {
    pub fn from(&self) -> usize {
        self.from
    }

    pub fn op(&self) -> &MixedOp {
        &self.op
    }
}

/// An intermediate node, summing one edge per predecessor
#[derive(Debug, Clone)]
pub struct Node {
    edges: Vec<Edge>,
}

impl Node {
    /// Create node `index`; every edge must read a strictly earlier state
    pub fn new(index: usize, edges: Vec<Edge>) -> Result<Self> {
        if let Some(bad) = edges.iter().find(|e| e.from >= INPUT_NODES + index) {
            return Err(NasError::ConfigError(format!(
                "edge of node {} reads state {}, which is not a predecessor",
                index, bad.from
            )));
        }
        Ok(Self { edges })
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

/// Evaluation policy shared by the three cell forward modes
enum EdgeEval<'s, 'w> {
    Relaxed(&'s [ArrayView2<'w, f64>]),
    Soft(&'s [ArrayView2<'w, f64>]),
    Hard(&'s [ArrayView2<'w, f64>], &'s [&'s [usize]]),
}

/// DARTS-style search cell
#[derive(Debug, Clone)]
pub struct DartsCell {
    reduction: bool,
    n_nodes: usize,
    c_out: usize,
    preproc0: Block,
    preproc1: Block,
    nodes: Vec<Node>,
}

impl DartsCell {
    /// Build a cell
    ///
    /// * `c_pp`, `c_p` - output widths of the cells k-2 and k-1
    /// * `c` - internal width of this cell
    /// * `reduction_p` - whether cell k-1 was a reduction cell, in which case
    ///   the k-2 output is twice as large spatially and must be reduced
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        n_nodes: usize,
        c_pp: usize,
        c_p: usize,
        c: usize,
        reduction_p: bool,
        reduction: bool,
        vocab: &OpVocabulary,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if n_nodes == 0 {
            return Err(NasError::ConfigError("a cell needs at least one node".to_string()));
        }
        let preproc0 = if reduction_p {
            Block::Reduce(FactorizedReduce::new(c_pp, c, false, rng)?)
        } else {
            Block::Seq(relu_conv_bn(c_pp, c, 1, 1, 0, false, rng)?)
        };
        let preproc1 = Block::Seq(relu_conv_bn(c_p, c, 1, 1, 0, false, rng)?);

        let mut nodes = Vec::with_capacity(n_nodes);
        for i in 0..n_nodes {
            let mut edges = Vec::with_capacity(INPUT_NODES + i);
            for from in 0..INPUT_NODES + i {
                // only edges leaving the cell inputs downsample
                let stride = if reduction && from < INPUT_NODES { 2 } else { 1 };
                edges.push(Edge {
                    from,
                    op: MixedOp::new(c, c, stride, vocab, rng)?,
                });
            }
            nodes.push(Node::new(i, edges)?);
        }

        debug!(
            n_nodes,
            c_pp,
            c_p,
            c,
            reduction,
            edges = edge_count(n_nodes, INPUT_NODES),
            "Built search cell"
        );

        Ok(Self {
            reduction,
            n_nodes,
            c_out: c * n_nodes,
            preproc0,
            preproc1,
            nodes,
        })
    }

    pub fn is_reduction(&self) -> bool {
        self.reduction
    }

    pub fn n_nodes(&self) -> usize {
        self.n_nodes
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn num_edges(&self) -> usize {
        self.nodes.iter().map(|n| n.edges.len()).sum()
    }

    /// Output width: every intermediate node is concatenated
    pub fn out_channels(&self) -> usize {
        self.c_out
    }

    /// Relaxed forward pass
    pub fn forward(
        &mut self,
        s0: &Array4<f64>,
        s1: &Array4<f64>,
        weights: ArrayView2<f64>,
        phase: Phase,
    ) -> Result<Array4<f64>> {
        let groups = unpack_weights(weights, self.n_nodes, INPUT_NODES)?;
        self.run(s0, s1, EdgeEval::Relaxed(&groups), phase)
    }

    /// Dense DARTS forward pass
    pub fn forward_soft(
        &mut self,
        s0: &Array4<f64>,
        s1: &Array4<f64>,
        weights: ArrayView2<f64>,
        phase: Phase,
    ) -> Result<Array4<f64>> {
        let groups = unpack_weights(weights, self.n_nodes, INPUT_NODES)?;
        self.run(s0, s1, EdgeEval::Soft(&groups), phase)
    }

    /// GDAS forward pass: one selected primitive per edge
    pub fn forward_gdas(
        &mut self,
        s0: &Array4<f64>,
        s1: &Array4<f64>,
        weights: ArrayView2<f64>,
        indices: &[usize],
        phase: Phase,
    ) -> Result<Array4<f64>> {
        let groups = unpack_weights(weights, self.n_nodes, INPUT_NODES)?;
        let index_groups = unpack_indices(indices, self.n_nodes, INPUT_NODES)?;
        self.run(s0, s1, EdgeEval::Hard(&groups, &index_groups), phase)
    }

    fn run(&mut self, s0: &Array4<f64>, s1: &Array4<f64>, eval: EdgeEval<'_, '_>, phase: Phase) -> Result<Array4<f64>> {
        let mut states = Vec::with_capacity(INPUT_NODES + self.n_nodes);
        states.push(self.preproc0.forward(s0, phase)?);
        states.push(self.preproc1.forward(s1, phase)?);

        for (i, node) in self.nodes.iter_mut().enumerate() {
            let mut acc: Option<Array4<f64>> = None;
            for (j, edge) in node.edges.iter_mut().enumerate() {
                let input = &states[edge.from];
                let out = match &eval {
                    EdgeEval::Relaxed(groups) => edge.op.forward(input, groups[i].row(j), phase)?,
                    EdgeEval::Soft(groups) => edge.op.forward_soft(input, groups[i].row(j), phase)?,
                    EdgeEval::Hard(groups, indices) => {
                        edge.op.forward_hard(input, groups[i].row(j), indices[i][j], phase)?
                    }
                };
                acc = Some(accumulate(acc, out)?);
            }
            let value = acc.ok_or_else(|| {
                NasError::ComputationError(format!("node {} has no incoming edges", i))
            })?;
            states.push(value);
        }

        concat_channels(&states[INPUT_NODES..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_xoshiro::Xoshiro256PlusPlus;

    #[test]
    fn test_edge_count() {
        assert_eq!(edge_count(1, 2), 2);
        assert_eq!(edge_count(4, 2), 14);
        for n in 1..10 {
            assert_eq!(edge_count(n, 2), (0..n).map(|i| 2 + i).sum::<usize>());
        }
    }

    #[test]
    fn test_unpack_cursor_consumes_exactly() {
        let flat = Array2::from_shape_fn((14, 3), |(r, _)| r as f64);
        let groups = unpack_weights(flat.view(), 4, 2).unwrap();
        let lens: Vec<usize> = groups.iter().map(|g| g.nrows()).collect();
        assert_eq!(lens, vec![2, 3, 4, 5]);
        let firsts: Vec<f64> = groups.iter().map(|g| g[[0, 0]]).collect();
        assert_eq!(firsts, vec![0.0, 2.0, 5.0, 9.0]);
        assert_eq!(groups[3][[4, 0]], 13.0);

        assert_eq!(node_edge_ranges(4, 2), vec![0..2, 2..5, 5..9, 9..14]);
    }

    #[test]
    fn test_unpack_rejects_wrong_length() {
        let long = Array2::<f64>::zeros((15, 3));
        assert!(matches!(
            unpack_weights(long.view(), 4, 2),
            Err(NasError::WeightLengthMismatch { expected: 14, actual: 15 })
        ));
        let short = vec![0usize; 13];
        assert!(unpack_indices(&short, 4, 2).is_err());
        let exact: Vec<usize> = (0..14).collect();
        let groups = unpack_indices(&exact, 4, 2).unwrap();
        assert_eq!(groups[2], &[5, 6, 7, 8]);
    }

    #[test]
    fn test_node_index_offsets() {
        let normal = node_index(4, 2, 0);
        let reduce = node_index(4, 2, 14);
        assert_eq!(normal[1], vec![2, 3, 4]);
        assert_eq!(reduce[0], vec![14, 15]);
        assert_eq!(reduce[3], vec![23, 24, 25, 26, 27]);
    }

    #[test]
    fn test_node_rejects_forward_reference() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let op = MixedOp::new(2, 2, 1, &OpVocabulary::darts(), &mut rng).unwrap();
        let edges = vec![Edge { from: 3, op }];
        assert!(Node::new(1, edges).is_err());
    }

    #[test]
    fn test_cell_topology_and_strides() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let cell = DartsCell::new(3, 8, 8, 4, false, true, &OpVocabulary::darts(), &mut rng).unwrap();
        assert_eq!(cell.num_edges(), edge_count(3, 2));
        for (i, node) in cell.nodes().iter().enumerate() {
            assert_eq!(node.edges().len(), 2 + i);
            for edge in node.edges() {
                assert!(edge.from() < 2 + i);
                let expected = if edge.from() < 2 { 2 } else { 1 };
                assert_eq!(edge.op().stride(), expected);
            }
        }
        assert_eq!(cell.out_channels(), 12);
    }

    #[test]
    fn test_cell_forward_modes_shapes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let vocab = OpVocabulary::darts();
        let mut cell = DartsCell::new(2, 6, 6, 4, false, true, &vocab, &mut rng).unwrap();
        let x = Array4::from_shape_fn((2, 6, 8, 8), |(b, c, y, x)| ((b + c + y + x) % 3) as f64);
        let w = Array2::from_elem((edge_count(2, 2), vocab.len()), 1.0 / vocab.len() as f64);

        let y = cell.forward(&x, &x, w.view(), Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 8, 4, 4));
        let y = cell.forward_soft(&x, &x, w.view(), Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 8, 4, 4));
        let idx = vec![0, 1, 2, 3, 7];
        let y = cell.forward_gdas(&x, &x, w.view(), &idx, Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 8, 4, 4));
    }

    #[test]
    fn test_mismatched_inputs_error_instead_of_panicking() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let vocab = OpVocabulary::darts();
        let mut cell = DartsCell::new(2, 6, 6, 4, false, false, &vocab, &mut rng).unwrap();
        let s0 = Array4::<f64>::ones((2, 6, 8, 8));
        let s1 = Array4::<f64>::ones((2, 6, 4, 4));
        let w = Array2::from_elem((edge_count(2, 2), vocab.len()), 0.5);
        assert!(matches!(cell.forward(&s0, &s1, w.view(), Phase::Train), Err(NasError::ShapeError { .. })));
        assert!(matches!(cell.forward_soft(&s0, &s1, w.view(), Phase::Train), Err(NasError::ShapeError { .. })));
        let idx = vec![1; edge_count(2, 2)];
        assert!(matches!(
            cell.forward_gdas(&s0, &s1, w.view(), &idx, Phase::Train),
            Err(NasError::ShapeError { .. })
        ));
    }

    #[test]
    fn test_reduction_p_reduces_first_input() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let vocab = OpVocabulary::darts();
        let mut cell = DartsCell::new(2, 6, 8, 4, true, false, &vocab, &mut rng).unwrap();
        let s0 = Array4::<f64>::ones((2, 6, 8, 8));
        let s1 = Array4::<f64>::ones((2, 8, 4, 4));
        let mut w = Array2::zeros((5, vocab.len()));
        w.column_mut(2).fill(1.0);
        let y = cell.forward(&s0, &s1, w.view(), Phase::Train).unwrap();
        assert_eq!(y.dim(), (2, 8, 4, 4));
    }
}
