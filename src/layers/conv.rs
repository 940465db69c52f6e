//! Grouped, dilated 2D convolution

use ndarray::{Array1, Array4};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{NasError, Result};

/// Convolution hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Kernel size as (height, width)
    pub kernel: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: usize,
    /// Channel groups; `groups == in_channels` gives a depthwise convolution
    pub groups: usize,
    pub bias: bool,
}

impl Conv2dConfig {
    /// Square kernel, stride 1, no padding, no bias
    pub fn new(in_channels: usize, out_channels: usize, kernel: usize) -> Self {
        Self::rect(in_channels, out_channels, (kernel, kernel))
    }

    /// Rectangular kernel
    pub fn rect(in_channels: usize, out_channels: usize, kernel: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel,
            stride: (1, 1),
            padding: (0, 0),
            dilation: 1,
            groups: 1,
            bias: false,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = (stride, stride);
        self
    }

    pub fn with_stride_hw(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: usize) -> Self {
        self.padding = (padding, padding);
        self
    }

    pub fn with_padding_hw(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    fn validate(&self) -> Result<()> {
        let positive = [
            ("in_channels", self.in_channels),
            ("out_channels", self.out_channels),
            ("kernel_h", self.kernel.0),
            ("kernel_w", self.kernel.1),
            ("stride_h", self.stride.0),
            ("stride_w", self.stride.1),
            ("dilation", self.dilation),
            ("groups", self.groups),
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
        if self.in_channels % self.groups != 0 || self.out_channels % self.groups != 0 {
            return Err(NasError::InvalidParameter {
                name: "groups".to_string(),
                value: self.groups.to_string(),
                reason: format!(
                    "must divide in_channels ({}) and out_channels ({})",
                    self.in_channels, self.out_channels
                ),
            });
        }
        Ok(())
    }
}

/// 2D convolution over NCHW tensors
#[derive(Debug, Clone)]
pub struct Conv2d {
    config: Conv2dConfig,
    /// Shape: [out_channels, in_channels / groups, kernel_h, kernel_w]
    weight: Array4<f64>,
    bias: Option<Array1<f64>>,
}

impl Conv2d {
    /// Create a convolution with He-uniform initialised weights
    pub fn new(config: Conv2dConfig, rng: &mut impl Rng) -> Result<Self> {
        config.validate()?;
        let in_per_group = config.in_channels / config.groups;
        let fan_in = in_per_group * config.kernel.0 * config.kernel.1;
        let bound = (6.0 / fan_in as f64).sqrt();

        let weight = Array4::from_shape_fn(
            (config.out_channels, in_per_group, config.kernel.0, config.kernel.1),
            |_| (rng.gen::<f64>() * 2.0 - 1.0) * bound,
        );
        let bias = config.bias.then(|| Array1::zeros(config.out_channels));

        Ok(Self { config, weight, bias })
    }

    /// Replace the kernel weights
    #[cfg(test)]
    pub(crate) fn with_weight(mut self, weight: Array4<f64>) -> Result<Self> {
        if weight.dim() != self.weight.dim() {
            return Err(NasError::shape(
                format!("{:?}", self.weight.dim()),
                format!("{:?}", weight.dim()),
            ));
        }
        self.weight = weight;
        Ok(self)
    }

    pub fn config(&self) -> &Conv2dConfig {
        &self.config
    }

    pub fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.config.out_channels
    }

    /// Output spatial size for a given input size
    pub fn output_hw(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let c = &self.config;
        let eff_h = c.dilation * (c.kernel.0 - 1) + 1;
        let eff_w = c.dilation * (c.kernel.1 - 1) + 1;
        if h + 2 * c.padding.0 < eff_h || w + 2 * c.padding.1 < eff_w {
            return Err(NasError::shape(
                format!("spatial size of at least {}x{}", eff_h, eff_w),
                format!("{}x{} with padding {:?}", h, w, c.padding),
            ));
        }
        Ok((
            (h + 2 * c.padding.0 - eff_h) / c.stride.0 + 1,
            (w + 2 * c.padding.1 - eff_w) / c.stride.1 + 1,
        ))
    }

    /// Forward pass
    pub fn forward(&self, x: &Array4<f64>) -> Result<Array4<f64>> {
        let (n, c_in, h, w) = x.dim();
        let c = &self.config;
        if c_in != c.in_channels {
            return Err(NasError::shape(
                format!("{} input channels", c.in_channels),
                format!("{} channels", c_in),
            ));
        }
        let (oh, ow) = self.output_hw(h, w)?;
        let (kh, kw) = c.kernel;
        let c_out = c.out_channels;
        let in_per_group = c_in / c.groups;
        let out_per_group = c_out / c.groups;

        let input = x.as_standard_layout();
        let xs = input
            .as_slice()
            .ok_or_else(|| NasError::ComputationError("input is not contiguous".to_string()))?;
        let ws = self
            .weight
            .as_slice()
            .ok_or_else(|| NasError::ComputationError("weight is not contiguous".to_string()))?;

        let mut out = vec![0.0; n * c_out * oh * ow];
        for b in 0..n {
            for oc in 0..c_out {
                let group = oc / out_per_group;
                let plane_start = (b * c_out + oc) * oh * ow;
                let plane = &mut out[plane_start..plane_start + oh * ow];
                if let Some(bias) = &self.bias {
                    plane.fill(bias[oc]);
                }
                for icg in 0..in_per_group {
                    let ic = group * in_per_group + icg;
                    let chan_start = (b * c_in + ic) * h * w;
                    let chan = &xs[chan_start..chan_start + h * w];
                    for ki in 0..kh {
                        let dy = (ki * c.dilation) as isize - c.padding.0 as isize;
                        for kj in 0..kw {
                            let dx = (kj * c.dilation) as isize - c.padding.1 as isize;
                            let wv = ws[((oc * in_per_group + icg) * kh + ki) * kw + kj];
                            for y in 0..oh {
                                let iy = (y * c.stride.0) as isize + dy;
                                if iy < 0 || iy >= h as isize {
                                    continue;
                                }
                                let row = &chan[iy as usize * w..(iy as usize + 1) * w];
                                let out_row = &mut plane[y * ow..(y + 1) * ow];
                                for (xo, o) in out_row.iter_mut().enumerate() {
                                    let ix = (xo * c.stride.1) as isize + dx;
                                    if ix >= 0 && (ix as usize) < w {
                                        *o += wv * row[ix as usize];
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(Array4::from_shape_vec((n, c_out, oh, ow), out)?)
    }
}
