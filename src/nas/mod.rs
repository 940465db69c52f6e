//! Cell-based differentiable search spaces
//!
//! Provides:
//! - Primitive registry and operation vocabularies
//! - Mixed operations with relaxed, dense and hard evaluation
//! - DARTS, GDAS (with optional fixed reduction cell) and NAS-Bench-201 networks
//! - Genotype discretization and one-hot encoding

pub mod cell;
pub mod config;
pub mod darts;
pub mod gdas;
pub mod genotype;
pub mod mixed_op;
pub mod nas201;
pub mod operations;
pub mod search_space;

pub use cell::{edge_count, node_index, unpack_indices, unpack_weights, DartsCell, Edge, Node, INPUT_NODES};
pub use config::{SpaceConfig, SpaceKind};
pub use darts::{channel_plan, DartsNetwork, LayerPlan, StackedCell};
pub use gdas::{linear_tau, GdasNetwork, GdasReductionCell, GumbelSample, GumbelSelector};
pub use genotype::{discretize, encode, GeneEdge, Genotype, NodeGene};
pub use mixed_op::MixedOp;
pub use nas201::{NasBench201Network, ResNetBasicBlock};
pub use operations::{Block, FactorizedReduce, Primitive};
pub use search_space::{OpVocabulary, PrimitiveKind};

use ndarray::{Array2, Array4, ArrayView2};
use rand::prelude::*;
use rand_xoshiro::Xoshiro256PlusPlus;
use tracing::info;

use crate::error::{NasError, Result};
use crate::layers::Phase;

/// Any of the supported search networks
#[derive(Debug, Clone)]
pub enum SearchSpace {
    Darts(DartsNetwork),
    Gdas(GdasNetwork),
    NasBench201(NasBench201Network),
}

impl SearchSpace {
    pub fn kind(&self) -> SpaceKind {
        match self {
            SearchSpace::Darts(_) => SpaceKind::Darts,
            SearchSpace::Gdas(net) => {
                let fixed = net
                    .network()
                    .cells()
                    .iter()
                    .any(|c| matches!(c, StackedCell::FixedReduction(_)));
                if fixed {
                    SpaceKind::GdasFrc
                } else {
                    SpaceKind::Gdas
                }
            }
            SearchSpace::NasBench201(_) => SpaceKind::NasBench201,
        }
    }

    pub fn vocabulary(&self) -> &OpVocabulary {
        match self {
            SearchSpace::Darts(net) => net.vocabulary(),
            SearchSpace::Gdas(net) => net.network().vocabulary(),
            SearchSpace::NasBench201(net) => net.vocabulary(),
        }
    }

    /// Rows of the architecture tensor
    pub fn all_edges(&self) -> usize {
        match self {
            SearchSpace::Darts(net) => net.all_edges(),
            SearchSpace::Gdas(net) => net.network().all_edges(),
            SearchSpace::NasBench201(net) => net.all_edges(),
        }
    }

    pub fn num_ops(&self) -> usize {
        self.vocabulary().len()
    }

    /// Uniform architecture tensor
    pub fn uniform_weights(&self) -> Array2<f64> {
        Array2::from_elem((self.all_edges(), self.num_ops()), 1.0 / self.num_ops() as f64)
    }

    /// Relaxed forward pass
    pub fn forward(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        match self {
            SearchSpace::Darts(net) => net.forward(x, weights, phase),
            SearchSpace::Gdas(net) => net.network_mut().forward(x, weights, phase),
            SearchSpace::NasBench201(net) => net.forward(x, weights, phase),
        }
    }

    /// Dense forward pass
    pub fn forward_soft(&mut self, x: &Array4<f64>, weights: ArrayView2<f64>, phase: Phase) -> Result<Array2<f64>> {
        match self {
            SearchSpace::Darts(net) => net.forward_soft(x, weights, phase),
            SearchSpace::Gdas(net) => net.network_mut().forward_soft(x, weights, phase),
            SearchSpace::NasBench201(net) => net.forward_soft(x, weights, phase),
        }
    }

    /// Hard-selection forward pass with a fresh Gumbel draw from `logits`
    pub fn forward_gdas(
        &mut self,
        x: &Array4<f64>,
        logits: ArrayView2<f64>,
        phase: Phase,
        rng: &mut impl Rng,
    ) -> Result<Array2<f64>> {
        match self {
            SearchSpace::Gdas(net) => net.forward(x, logits, phase, rng),
            other => Err(NasError::ConfigError(format!(
                "Gumbel sampling needs a gdas or gdas_frc space, got {}",
                other.kind()
            ))),
        }
    }

    /// Discretized architecture in the space's printable form
    pub fn genotype_string(&self, theta: ArrayView2<f64>) -> Result<String> {
        match self {
            SearchSpace::Darts(net) => Ok(net.genotype(theta)?.to_string()),
            SearchSpace::Gdas(net) => Ok(net.genotype(theta)?.to_string()),
            SearchSpace::NasBench201(net) => net.genotype(theta),
        }
    }
}

/// Build the network a configuration describes
///
/// The same seed always yields the same initial weights.
pub fn build_space(config: &SpaceConfig, seed: Option<u64>) -> Result<SearchSpace> {
    config.validate()?;
    let mut rng = match seed {
        Some(s) => Xoshiro256PlusPlus::seed_from_u64(s),
        None => Xoshiro256PlusPlus::from_entropy(),
    };
    let space = match config.space {
        SpaceKind::Darts => SearchSpace::Darts(DartsNetwork::new(config, &mut rng)?),
        SpaceKind::Gdas | SpaceKind::GdasFrc => SearchSpace::Gdas(GdasNetwork::new(config, &mut rng)?),
        SpaceKind::NasBench201 => SearchSpace::NasBench201(NasBench201Network::new(config, &mut rng)?),
    };
    info!(
        space = %config.space,
        edges = space.all_edges(),
        ops = space.num_ops(),
        "Search space ready"
    );
    Ok(space)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_every_space() {
        let darts = SpaceConfig::new(SpaceKind::Darts).with_channels(4).with_layers(3).with_nodes(2);
        let gdas = SpaceConfig::new(SpaceKind::Gdas).with_channels(4).with_layers(3).with_nodes(2);
        let frc = SpaceConfig::new(SpaceKind::GdasFrc).with_channels(8).with_layers(3);
        let nb201 = SpaceConfig::new(SpaceKind::NasBench201).with_channels(4).with_layers(1);

        let mut rng = Xoshiro256PlusPlus::seed_from_u64(0);
        let x = Array4::from_shape_fn((2, 3, 8, 8), |(b, c, y, x)| ((b + c + y + x) % 3) as f64);
        for (config, edges) in [(darts, 10), (gdas, 10), (frc, 28), (nb201, 6)] {
            let mut space = build_space(&config, Some(1)).unwrap();
            assert_eq!(space.kind(), config.space);
            assert_eq!(space.all_edges(), edges);
            let w = space.uniform_weights();
            assert_eq!(space.forward(&x, w.view(), Phase::Train).unwrap().dim(), (2, 10));
            assert_eq!(space.forward_soft(&x, w.view(), Phase::Train).unwrap().dim(), (2, 10));
            let gdas = space.forward_gdas(&x, w.view(), Phase::Train, &mut rng);
            match config.space {
                SpaceKind::Gdas | SpaceKind::GdasFrc => assert_eq!(gdas.unwrap().dim(), (2, 10)),
                _ => assert!(matches!(gdas, Err(NasError::ConfigError(_)))),
            }
            assert!(!space.genotype_string(w.view()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_build_is_seeded() {
        let config = SpaceConfig::default().with_channels(4).with_layers(3).with_nodes(2);
        let mut a = build_space(&config, Some(9)).unwrap();
        let mut b = build_space(&config, Some(9)).unwrap();
        let x = Array4::from_elem((2, 3, 8, 8), 0.5);
        let w = a.uniform_weights();
        let ya = a.forward(&x, w.view(), Phase::Eval).unwrap();
        let yb = b.forward(&x, w.view(), Phase::Eval).unwrap();
        assert_eq!(ya, yb);
    }
}
