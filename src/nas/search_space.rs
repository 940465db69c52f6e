//! NAS Search Space Definition
//!
//! The closed vocabulary of candidate primitives an edge can hold, the
//! curated subsets used by the different cell spaces, and the ordered
//! vocabulary a network is built with.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

/// Candidate computation primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrimitiveKind {
    /// Zero (drops the edge)
    None,
    /// 3x3 average pooling + BN
    AvgPool3x3,
    /// 3x3 max pooling + BN
    MaxPool3x3,
    /// Identity, or factorized reduce when strided
    SkipConnect,
    /// Two stacked depthwise-separable 3x3 convolutions
    SepConv3x3,
    /// Two stacked depthwise-separable 5x5 convolutions
    SepConv5x5,
    /// Two stacked depthwise-separable 7x7 convolutions
    SepConv7x7,
    /// Dilated separable 3x3 (5x5 receptive field)
    DilConv3x3,
    /// Dilated separable 5x5 (9x9 receptive field)
    DilConv5x5,
    /// Factorized 7x1 then 1x7 convolution
    Conv7x1_1x7,
    /// ReLU-Conv3x3-BN
    NorConv3x3,
    /// ReLU-Conv1x1-BN
    NorConv1x1,
}

impl PrimitiveKind {
    /// Every registered primitive
    pub const ALL: [PrimitiveKind; 12] = [
        Self::None,
        Self::AvgPool3x3,
        Self::MaxPool3x3,
        Self::SkipConnect,
        Self::SepConv3x3,
        Self::SepConv5x5,
        Self::SepConv7x7,
        Self::DilConv3x3,
        Self::DilConv5x5,
        Self::Conv7x1_1x7,
        Self::NorConv3x3,
        Self::NorConv1x1,
    ];

    /// Registry name
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::AvgPool3x3 => "avg_pool_3x3",
            Self::MaxPool3x3 => "max_pool_3x3",
            Self::SkipConnect => "skip_connect",
            Self::SepConv3x3 => "sep_conv_3x3",
            Self::SepConv5x5 => "sep_conv_5x5",
            Self::SepConv7x7 => "sep_conv_7x7",
            Self::DilConv3x3 => "dil_conv_3x3",
            Self::DilConv5x5 => "dil_conv_5x5",
            Self::Conv7x1_1x7 => "conv_7x1_1x7",
            Self::NorConv3x3 => "nor_conv_3x3",
            Self::NorConv1x1 => "nor_conv_1x1",
        }
    }

    /// Whether the primitive carries convolution weights
    pub fn is_parametric(&self) -> bool {
        !NON_PARAMETER_OPS.contains(self)
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PrimitiveKind {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| NasError::UnknownPrimitive(s.to_string()))
    }
}

impl TryFrom<String> for PrimitiveKind {
    type Error = NasError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PrimitiveKind> for String {
    fn from(kind: PrimitiveKind) -> Self {
        kind.name().to_string()
    }
}

/// Primitives without learnable convolution weights
pub const NON_PARAMETER_OPS: [PrimitiveKind; 4] = [
    PrimitiveKind::None,
    PrimitiveKind::AvgPool3x3,
    PrimitiveKind::MaxPool3x3,
    PrimitiveKind::SkipConnect,
];

/// Primitives with learnable convolution weights
pub const PARAMETER_OPS: [PrimitiveKind; 8] = [
    PrimitiveKind::SepConv3x3,
    PrimitiveKind::SepConv5x5,
    PrimitiveKind::SepConv7x7,
    PrimitiveKind::DilConv3x3,
    PrimitiveKind::DilConv5x5,
    PrimitiveKind::Conv7x1_1x7,
    PrimitiveKind::NorConv3x3,
    PrimitiveKind::NorConv1x1,
];

/// Operation set searched by GDAS
pub const GDAS_OPS: [PrimitiveKind; 8] = [
    PrimitiveKind::None,
    PrimitiveKind::SkipConnect,
    PrimitiveKind::AvgPool3x3,
    PrimitiveKind::MaxPool3x3,
    PrimitiveKind::DilConv3x3,
    PrimitiveKind::DilConv5x5,
    PrimitiveKind::SepConv3x3,
    PrimitiveKind::SepConv5x5,
];

/// Default DARTS vocabulary; "none" is last so genotypes can be parsed
pub const DARTS_OPS: [PrimitiveKind; 8] = [
    PrimitiveKind::MaxPool3x3,
    PrimitiveKind::AvgPool3x3,
    PrimitiveKind::SkipConnect,
    PrimitiveKind::SepConv3x3,
    PrimitiveKind::SepConv5x5,
    PrimitiveKind::DilConv3x3,
    PrimitiveKind::DilConv5x5,
    PrimitiveKind::None,
];

/// Default NAS-Bench-201 vocabulary
pub const NAS_BENCH_201_OPS: [PrimitiveKind; 5] = [
    PrimitiveKind::None,
    PrimitiveKind::SkipConnect,
    PrimitiveKind::NorConv1x1,
    PrimitiveKind::NorConv3x3,
    PrimitiveKind::AvgPool3x3,
];

/// Ordered, non-empty list of primitives held by every edge of a network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<PrimitiveKind>", into = "Vec<PrimitiveKind>")]
pub struct OpVocabulary {
    ops: Vec<PrimitiveKind>,
}

impl OpVocabulary {
    /// Create a vocabulary, rejecting empty lists
    pub fn new(ops: Vec<PrimitiveKind>) -> Result<Self> {
        if ops.is_empty() {
            return Err(NasError::ConfigError("operation vocabulary is empty".to_string()));
        }
        Ok(Self { ops })
    }

    /// Parse a vocabulary from registry names
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let ops = names
            .iter()
            .map(|name| name.as_ref().parse())
            .collect::<Result<Vec<PrimitiveKind>>>()?;
        Self::new(ops)
    }

    pub fn darts() -> Self {
        Self { ops: DARTS_OPS.to_vec() }
    }

    pub fn gdas() -> Self {
        Self { ops: GDAS_OPS.to_vec() }
    }

    pub fn nas_bench_201() -> Self {
        Self { ops: NAS_BENCH_201_OPS.to_vec() }
    }

    pub fn ops(&self) -> &[PrimitiveKind] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Never true for a constructed vocabulary
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<PrimitiveKind> {
        self.ops.get(index).copied()
    }

    /// Position of a primitive
    pub fn index_of(&self, kind: PrimitiveKind) -> Option<usize> {
        self.ops.iter().position(|&op| op == kind)
    }

    /// Position of the "none" primitive, if present
    pub fn none_index(&self) -> Option<usize> {
        self.index_of(PrimitiveKind::None)
    }

    /// Indices of parameter-free primitives
    pub fn non_parametric_indices(&self) -> Vec<usize> {
        self.indices_where(|kind| !kind.is_parametric())
    }

    /// Indices of primitives with convolution weights
    pub fn parametric_indices(&self) -> Vec<usize> {
        self.indices_where(PrimitiveKind::is_parametric)
    }

    fn indices_where(&self, pred: impl Fn(&PrimitiveKind) -> bool) -> Vec<usize> {
        self.ops
            .iter()
            .enumerate()
            .filter(|(_, kind)| pred(kind))
            .map(|(i, _)| i)
            .collect()
    }

    /// Genotype parsing scores every primitive but the last, which must be "none"
    pub fn require_none_last(&self) -> Result<()> {
        match self.ops.last() {
            Some(PrimitiveKind::None) => Ok(()),
            Some(other) => Err(NasError::ConfigError(format!(
                "the last primitive of the vocabulary must be 'none', found '{}'",
                other
            ))),
            None => Err(NasError::ConfigError("operation vocabulary is empty".to_string())),
        }
    }
}

impl TryFrom<Vec<PrimitiveKind>> for OpVocabulary {
    type Error = NasError;

    fn try_from(ops: Vec<PrimitiveKind>) -> Result<Self> {
        Self::new(ops)
    }
}

impl From<OpVocabulary> for Vec<PrimitiveKind> {
    fn from(vocab: OpVocabulary) -> Self {
        vocab.ops
    }
}

impl fmt::Display for OpVocabulary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.ops.iter().map(PrimitiveKind::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
