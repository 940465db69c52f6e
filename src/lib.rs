//! cellnas - Cell-based differentiable neural architecture search spaces
//!
//! This crate provides the search-space side of differentiable NAS:
//! - DAG cells whose edges mix every candidate primitive
//! - Relaxed, dense (DARTS) and hard (GDAS) evaluation of those edges
//! - DARTS, GDAS and NAS-Bench-201 macro networks
//! - Genotype discretization and the reverse one-hot encoding
//!
//! # Modules
//!
//! - [`layers`] - Convolution, normalization, pooling and linear stages
//! - [`nas`] - Primitives, mixed operations, cells, networks and genotypes
//! - [`cli`] - Command-line interface

// Core error handling
pub mod error;

// Numeric stages
pub mod layers;

// Search spaces
pub mod nas;

// Services
pub mod cli;

pub use error::{NasError, Result};

/// Re-export commonly used types
pub mod prelude {
    // Error handling
    pub use crate::error::{NasError, Result};

    // Layers
    pub use crate::layers::{BatchNorm2d, Conv2d, Conv2dConfig, Linear, Phase, Pool2d, PoolMode, Sequential, Stage};

    // Primitives and edges
    pub use crate::nas::{Block, MixedOp, OpVocabulary, Primitive, PrimitiveKind};

    // Cells and networks
    pub use crate::nas::{
        build_space, DartsCell, DartsNetwork, GdasNetwork, NasBench201Network, SearchSpace, SpaceConfig, SpaceKind,
    };

    // Genotypes and sampling
    pub use crate::nas::{GeneEdge, Genotype, GumbelSample, GumbelSelector};
}
