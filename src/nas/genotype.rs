//! Genotype codec
//!
//! Discretizes a continuous architecture tensor into a genotype (top-k
//! incoming edges per node, best primitive per edge) and maps a genotype back
//! to a one-hot tensor.

use std::fmt;

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use super::cell::{edge_count, node_index, INPUT_NODES};
use super::search_space::{OpVocabulary, PrimitiveKind};
use crate::error::{NasError, Result};

/// Incoming edges kept per node
pub const EDGES_PER_NODE: usize = 2;

/// A selected edge: the primitive it runs and the state it reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GeneEdge {
    pub op: PrimitiveKind,
    pub input: usize,
}

impl GeneEdge {
    pub fn new(op: PrimitiveKind, input: usize) -> Self {
        Self { op, input }
    }
}

/// Selected edges of one node
pub type NodeGene = Vec<GeneEdge>;

/// Discrete architecture of a normal and a reduction cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Genotype {
    pub normal: Vec<NodeGene>,
    pub normal_concat: Vec<usize>,
    pub reduce: Vec<NodeGene>,
    pub reduce_concat: Vec<usize>,
}

impl Genotype {
    /// Build a genotype concatenating every intermediate node
    pub fn new(normal: Vec<NodeGene>, reduce: Vec<NodeGene>) -> Self {
        let normal_concat = concat_range(normal.len());
        let reduce_concat = concat_range(reduce.len());
        Self {
            normal,
            normal_concat,
            reduce,
            reduce_concat,
        }
    }

    pub fn n_nodes(&self) -> usize {
        self.normal.len()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn concat_range(n_nodes: usize) -> Vec<usize> {
    (INPUT_NODES..INPUT_NODES + n_nodes).collect()
}

fn fmt_cell(f: &mut fmt::Formatter<'_>, genes: &[NodeGene]) -> fmt::Result {
    write!(f, "[")?;
    for (i, node) in genes.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "[")?;
        for (j, edge) in node.iter().enumerate() {
            if j > 0 {
                write!(f, ", ")?;
            }
            write!(f, "('{}', {})", edge.op, edge.input)?;
        }
        write!(f, "]")?;
    }
    write!(f, "]")
}

fn fmt_concat(concat: &[usize]) -> String {
    match (concat.first(), concat.last()) {
        (Some(first), Some(last)) => format!("range({}, {})", first, last + 1),
        _ => "range(0, 0)".to_string(),
    }
}

impl fmt::Display for Genotype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Genotype(normal=")?;
        fmt_cell(f, &self.normal)?;
        write!(f, ", normal_concat={}, reduce=", fmt_concat(&self.normal_concat))?;
        fmt_cell(f, &self.reduce)?;
        write!(f, ", reduce_concat={})", fmt_concat(&self.reduce_concat))
    }
}

/// Discretize per-node edge weights into `k` selected edges per node
///
/// Each group has shape (edges, ops). Per edge, the best primitive is picked
/// among all but the last vocabulary entry, which must be "none". Then the
/// `k` edges with the highest best-score are kept, highest first. On exact
/// ties the lower index wins, both for primitives and for edges.
pub fn discretize(groups: &[ArrayView2<f64>], k: usize, vocab: &OpVocabulary) -> Result<Vec<NodeGene>> {
    vocab.require_none_last()?;
    let scored = vocab.len() - 1;
    if scored == 0 {
        return Err(NasError::ConfigError(
            "vocabulary needs at least one primitive besides 'none'".to_string(),
        ));
    }

    let mut gene = Vec::with_capacity(groups.len());
    for (node, edges) in groups.iter().enumerate() {
        if edges.ncols() != vocab.len() {
            return Err(NasError::WeightLengthMismatch {
                expected: vocab.len(),
                actual: edges.ncols(),
            });
        }
        if edges.nrows() < k {
            return Err(NasError::InvalidParameter {
                name: "k".to_string(),
                value: k.to_string(),
                reason: format!("node {} only has {} incoming edges", node, edges.nrows()),
            });
        }

        // (edge, best primitive, score)
        let mut best: Vec<(usize, usize, f64)> = edges
            .rows()
            .into_iter()
            .enumerate()
            .map(|(edge, row)| {
                let mut arg = 0;
                for p in 1..scored {
                    if row[p] > row[arg] {
                        arg = p;
                    }
                }
                (edge, arg, row[arg])
            })
            .collect();

        // stable sort keeps the lower edge index first on ties
        best.sort_by(|a, b| b.2.total_cmp(&a.2));

        let node_gene = best
            .into_iter()
            .take(k)
            .map(|(edge, prim, _)| GeneEdge::new(vocab.ops()[prim], edge))
            .collect();
        gene.push(node_gene);
    }
    Ok(gene)
}

/// Map a genotype to a one-hot architecture tensor of shape (2 * edges, ops)
///
/// Rows of edges no node selected are set to the vocabulary's "none" entry.
pub fn encode(genotype: &Genotype, n_nodes: usize, vocab: &OpVocabulary) -> Result<Array2<f64>> {
    let none = vocab.none_index().ok_or_else(|| {
        NasError::ConfigError("vocabulary has no 'none' primitive to fill unselected edges".to_string())
    })?;
    let num_edges = edge_count(n_nodes, INPUT_NODES);
    let mut sample = Array2::zeros((2 * num_edges, vocab.len()));

    for (half, genes) in [&genotype.normal, &genotype.reduce].into_iter().enumerate() {
        if genes.len() != n_nodes {
            return Err(NasError::ConfigError(format!(
                "genotype has {} nodes, network has {}",
                genes.len(),
                n_nodes
            )));
        }
        let positions = node_index(n_nodes, INPUT_NODES, half * num_edges);
        for (node, node_gene) in genes.iter().enumerate() {
            for edge in node_gene {
                let row = *positions[node].get(edge.input).ok_or_else(|| {
                    NasError::ConfigError(format!(
                        "node {} cannot read state {} (only {} predecessors)",
                        node,
                        edge.input,
                        positions[node].len()
                    ))
                })?;
                let col = vocab.index_of(edge.op).ok_or_else(|| {
                    NasError::ConfigError(format!("primitive '{}' is not in the vocabulary", edge.op))
                })?;
                sample[[row, col]] = 1.0;
            }
        }
    }

    for mut row in sample.rows_mut() {
        if row.sum() == 0.0 {
            row[none] = 1.0;
        }
    }
    Ok(sample)
}
