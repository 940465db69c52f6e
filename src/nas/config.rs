//! Search-space configuration

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::search_space::OpVocabulary;
use crate::error::{NasError, Result};

/// Which macro network to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceKind {
    /// DARTS cells with searchable normal and reduction cells
    Darts,
    /// DARTS cells driven by Gumbel-softmax hard selection
    Gdas,
    /// GDAS with a fixed, hand-designed reduction cell
    GdasFrc,
    /// NAS-Bench-201 complete-DAG cells separated by residual blocks
    #[serde(rename = "nas_bench_201", alias = "nasbench201", alias = "nb201")]
    NasBench201,
}

impl Default for SpaceKind {
    fn default() -> Self {
        Self::Darts
    }
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Darts => "darts",
            Self::Gdas => "gdas",
            Self::GdasFrc => "gdas_frc",
            Self::NasBench201 => "nas_bench_201",
        };
        f.write_str(name)
    }
}

impl FromStr for SpaceKind {
    type Err = NasError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "darts" => Ok(Self::Darts),
            "gdas" => Ok(Self::Gdas),
            "gdas_frc" => Ok(Self::GdasFrc),
            "nas_bench_201" | "nasbench201" | "nb201" => Ok(Self::NasBench201),
            other => Err(NasError::ConfigError(format!("unknown search space: {}", other))),
        }
    }
}

/// Search-space configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    /// Network family
    pub space: SpaceKind,
    /// Base channel width
    pub channels: usize,
    /// Number of output classes
    pub num_classes: usize,
    /// Number of stacked cells (NAS-Bench-201: cells per stage)
    pub layers: usize,
    /// Intermediate nodes per cell (NAS-Bench-201: total nodes)
    pub nodes: usize,
    /// Operation vocabulary; empty selects the space default
    pub basic_ops: Vec<String>,
    /// Initial Gumbel-softmax temperature
    pub tau: f64,
    /// Stem width multiplier (DARTS / GDAS)
    pub stem_multiplier: usize,
    /// Channels of the input images
    pub input_channels: usize,
    /// Resampling cap for degenerate Gumbel draws
    pub max_gumbel_attempts: usize,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            space: SpaceKind::Darts,
            channels: 16,
            num_classes: 10,
            layers: 8,
            nodes: 4,
            basic_ops: Vec::new(),
            tau: 10.0,
            stem_multiplier: 3,
            input_channels: 3,
            max_gumbel_attempts: 64,
        }
    }
}

impl SpaceConfig {
    /// Create a configuration for the given network family
    pub fn new(space: SpaceKind) -> Self {
        match space {
            SpaceKind::NasBench201 => Self {
                space,
                layers: 5,
                ..Default::default()
            },
            _ => Self {
                space,
                ..Default::default()
            },
        }
    }

    pub fn with_channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    pub fn with_layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_nodes(mut self, nodes: usize) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_basic_ops<S: Into<String>>(mut self, ops: impl IntoIterator<Item = S>) -> Self {
        self.basic_ops = ops.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tau(mut self, tau: f64) -> Self {
        self.tau = tau;
        self
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// The operation vocabulary, falling back to the space default
    pub fn vocabulary(&self) -> Result<OpVocabulary> {
        if self.basic_ops.is_empty() {
            return Ok(match self.space {
                SpaceKind::Darts | SpaceKind::Gdas | SpaceKind::GdasFrc => OpVocabulary::darts(),
                SpaceKind::NasBench201 => OpVocabulary::nas_bench_201(),
            });
        }
        OpVocabulary::parse(&self.basic_ops)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("channels", self.channels),
            ("num_classes", self.num_classes),
            ("layers", self.layers),
            ("nodes", self.nodes),
            ("stem_multiplier", self.stem_multiplier),
            ("input_channels", self.input_channels),
            ("max_gumbel_attempts", self.max_gumbel_attempts),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(NasError::InvalidParameter {
                    name: name.to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        if !(self.tau.is_finite() && self.tau > 0.0) {
            return Err(NasError::InvalidParameter {
                name: "tau".to_string(),
                value: self.tau.to_string(),
                reason: "must be a positive finite temperature".to_string(),
            });
        }
        if self.space == SpaceKind::NasBench201 && self.nodes < 2 {
            return Err(NasError::InvalidParameter {
                name: "nodes".to_string(),
                value: self.nodes.to_string(),
                reason: "a NAS-Bench-201 cell needs at least an input and an output node".to_string(),
            });
        }
        if self.space == SpaceKind::GdasFrc && (self.channels % 8 != 0 || self.nodes != 4) {
            return Err(NasError::ConfigError(
                "the fixed GDAS reduction cell needs channels divisible by 8 and 4 nodes".to_string(),
            ));
        }
        self.vocabulary()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SpaceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.vocabulary().unwrap(), OpVocabulary::darts());
        assert_eq!(SpaceConfig::new(SpaceKind::NasBench201).vocabulary().unwrap(), OpVocabulary::nas_bench_201());
    }

    #[test]
    fn test_space_kind_parse() {
        assert_eq!("gdas-frc".parse::<SpaceKind>().unwrap(), SpaceKind::GdasFrc);
        assert_eq!("NAS_BENCH_201".parse::<SpaceKind>().unwrap(), SpaceKind::NasBench201);
        assert_eq!(SpaceKind::GdasFrc.to_string().parse::<SpaceKind>().unwrap(), SpaceKind::GdasFrc);
        assert!("enas".parse::<SpaceKind>().is_err());
    }

    #[test]
    fn test_space_kind_json_matches_display() {
        for kind in [SpaceKind::Darts, SpaceKind::Gdas, SpaceKind::GdasFrc, SpaceKind::NasBench201] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
            assert_eq!(serde_json::from_str::<SpaceKind>(&json).unwrap(), kind);
        }
        assert_eq!(serde_json::from_str::<SpaceKind>(r#""nb201""#).unwrap(), SpaceKind::NasBench201);
        let config = SpaceConfig::new(SpaceKind::NasBench201).with_channels(4);
        assert_eq!(serde_json::from_str::<SpaceConfig>(&serde_json::to_string(&config).unwrap()).unwrap(), config);
    }

    #[test]
    fn test_builder() {
        let config = SpaceConfig::new(SpaceKind::Gdas)
            .with_channels(8)
            .with_layers(5)
            .with_basic_ops(["skip_connect", "none"])
            .with_tau(4.0);
        assert_eq!(config.channels, 8);
        assert_eq!(config.vocabulary().unwrap().len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        assert!(SpaceConfig::default().with_layers(0).validate().is_err());
        assert!(SpaceConfig::default().with_tau(0.0).validate().is_err());
        assert!(SpaceConfig::default().with_tau(f64::NAN).validate().is_err());
        assert!(SpaceConfig::default().with_basic_ops(["sep_conv_9x9"]).validate().is_err());
        assert!(SpaceConfig::new(SpaceKind::GdasFrc).with_channels(12).validate().is_err());
    }

    #[test]
    fn test_json_partial_config() {
        let config: SpaceConfig =
            serde_json::from_str(r#"{"space": "nas_bench_201", "channels": 8, "basic_ops": ["none", "skip_connect"]}"#)
                .unwrap();
        assert_eq!(config.space, SpaceKind::NasBench201);
        assert_eq!(config.channels, 8);
        assert_eq!(config.layers, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_file() {
        let path = std::env::temp_dir().join(format!("cellnas-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"space": "gdas", "tau": 5.0}"#).unwrap();
        let config = SpaceConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.space, SpaceKind::Gdas);
        assert_eq!(config.tau, 5.0);
        assert!(SpaceConfig::from_json_file(&path).is_err());
    }
}
