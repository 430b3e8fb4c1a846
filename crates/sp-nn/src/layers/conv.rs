// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use super::{init_seed, validate_positive};
use crate::module::{Module, Parameter};
use crate::{PureResult, Tensor, TensorError};
use std::cell::RefCell;

/// Two-dimensional convolution operating on `(batch, channels * height * width)` tensors.
#[derive(Debug)]
pub struct Conv2d {
    weight: Parameter,
    bias: Option<Parameter>,
    in_channels: usize,
    out_channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
    input_hw: (usize, usize),
}

impl Conv2d {
    /// Builds a convolution with a Kaiming-normal weight seeded from `name`
    /// and a zero bias.
    pub fn new(
        name: impl Into<String>,
        in_channels: usize,
        out_channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        padding: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(in_channels, "in_channels")?;
        validate_positive(out_channels, "out_channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        validate_positive(input_hw.0, "input_height")?;
        validate_positive(input_hw.1, "input_width")?;
        let name = name.into();
        let span = in_channels * kernel.0 * kernel.1;
        let std = (2.0 / span as f32).sqrt();
        let weight = Tensor::random_normal(out_channels, span, 0.0, std, Some(init_seed(&name)))?;
        let bias = Tensor::zeros(1, out_channels)?;
        let conv = Self {
            weight: Parameter::new(format!("{name}::weight"), weight),
            bias: Some(Parameter::new(format!("{name}::bias"), bias)),
            in_channels,
            out_channels,
            kernel,
            stride,
            padding,
            input_hw,
        };
        // Validate configuration by computing the output size once during construction.
        conv.output_hw()?;
        Ok(conv)
    }

    /// Drops the additive bias. Convolutions followed by a normalisation do not need one.
    pub fn without_bias(mut self) -> Self {
        self.bias = None;
        self
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn input_hw(&self) -> (usize, usize) {
        self.input_hw
    }

    /// Number of input columns a sample must carry.
    pub fn input_features(&self) -> usize {
        self.in_channels * self.input_hw.0 * self.input_hw.1
    }

    /// Kernel weight as an `(out_channels, in_channels * kh * kw)` parameter.
    pub fn weight(&self) -> &Parameter {
        &self.weight
    }

    pub fn weight_mut(&mut self) -> &mut Parameter {
        &mut self.weight
    }

    /// Spatial size of the produced feature maps.
    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        let (ph, pw) = self.padding;
        let (sh, sw) = self.stride;
        if h + 2 * ph < kh || w + 2 * pw < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h + 2 * ph,
                cols: kh.max(kw),
            });
        }
        Ok(((h + 2 * ph - kh) / sh + 1, (w + 2 * pw - kw) / sw + 1))
    }

    fn guard_input(&self, input: &Tensor) -> PureResult<()> {
        let cols = input.shape().1;
        if cols != self.input_features() {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.input_features()),
            });
        }
        Ok(())
    }

    fn im2col(&self, input: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut columns = Tensor::zeros(batch * oh * ow, kernel_elems)?;
        let cols = input.shape().1;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        {
            let input_data = input.data();
            let column_data = columns.data_mut();
            for b in 0..batch {
                let row = &input_data[b * cols..(b + 1) * cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let offset = (b * oh * ow + oh_idx * ow + ow_idx) * kernel_elems;
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h = (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w = (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    column_data[offset + col_idx] = if idx_h < 0
                                        || idx_w < 0
                                        || idx_h >= h as isize
                                        || idx_w >= w as isize
                                    {
                                        0.0
                                    } else {
                                        row[channel_offset + idx_h as usize * w + idx_w as usize]
                                    };
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(columns)
    }

    fn col2im(&self, cols: &Tensor, batch: usize, oh: usize, ow: usize) -> PureResult<Tensor> {
        let kernel_elems = self.in_channels * self.kernel.0 * self.kernel.1;
        let mut output = Tensor::zeros(batch, self.input_features())?;
        let (h, w) = self.input_hw;
        let pad_h = self.padding.0 as isize;
        let pad_w = self.padding.1 as isize;
        let output_cols = output.shape().1;
        {
            let cols_data = cols.data();
            let output_data = output.data_mut();
            for b in 0..batch {
                let grad_in_row = &mut output_data[b * output_cols..(b + 1) * output_cols];
                for oh_idx in 0..oh {
                    for ow_idx in 0..ow {
                        let row_index = b * oh * ow + oh_idx * ow + ow_idx;
                        let column_row =
                            &cols_data[row_index * kernel_elems..(row_index + 1) * kernel_elems];
                        let mut col_idx = 0;
                        for ic in 0..self.in_channels {
                            let channel_offset = ic * h * w;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let idx_h = (oh_idx * self.stride.0 + kh) as isize - pad_h;
                                    let idx_w = (ow_idx * self.stride.1 + kw) as isize - pad_w;
                                    if idx_h >= 0
                                        && idx_w >= 0
                                        && idx_h < h as isize
                                        && idx_w < w as isize
                                    {
                                        let index =
                                            channel_offset + idx_h as usize * w + idx_w as usize;
                                        grad_in_row[index] += column_row[col_idx];
                                    }
                                    col_idx += 1;
                                }
                            }
                        }
                    }
                }
            }
        }
        Ok(output)
    }

    /// Mean receptive-field patch of `input` over every sample and output
    /// position, shaped `(1, in_channels * kh * kw)`.
    ///
    /// The spatial mean of the convolution output for channel `c` equals
    /// `weight[c] · mean_patch + bias[c]`, which lets callers reduce a batch
    /// through the layer without keeping the full feature maps around.
    pub fn mean_patch(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        Tensor::row_vector(&patches.mean_axis0())
    }

    /// Runs the bias-free linear part of the convolution on a reduced patch:
    /// returns `weight @ patchᵀ` as a `(1, out_channels)` row.
    pub fn project_patch(&self, patch: &Tensor) -> PureResult<Tensor> {
        let weight = self.weight.value();
        if patch.shape() != (1, weight.shape().1) {
            return Err(TensorError::ShapeMismatch {
                left: patch.shape(),
                right: (1, weight.shape().1),
            });
        }
        patch.matmul(&weight.transpose())
    }
}

impl Module for Conv2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let patches = self.im2col(input, batch, oh, ow)?;
        let product = patches.matmul(&self.weight.value().transpose())?;
        let spatial = oh * ow;
        let mut out = Tensor::zeros(batch, self.out_channels * spatial)?;
        let bias = self.bias.as_ref().map(|b| b.value().data());
        {
            let product_data = product.data();
            let out_cols = out.shape().1;
            let out_data = out.data_mut();
            for b in 0..batch {
                for pos in 0..spatial {
                    let src = &product_data[(b * spatial + pos) * self.out_channels
                        ..(b * spatial + pos + 1) * self.out_channels];
                    for (oc, value) in src.iter().enumerate() {
                        let shift = bias.map(|bias| bias[oc]).unwrap_or(0.0);
                        out_data[b * out_cols + oc * spatial + pos] = value + shift;
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        self.guard_input(input)?;
        let batch = input.shape().0;
        let (oh, ow) = self.output_hw()?;
        let spatial = oh * ow;
        if grad_output.shape() != (batch, self.out_channels * spatial) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.out_channels * spatial),
            });
        }
        let mut grad_matrix = Tensor::zeros(batch * spatial, self.out_channels)?;
        {
            let grad_cols = grad_output.shape().1;
            let grad_data = grad_output.data();
            let matrix = grad_matrix.data_mut();
            for b in 0..batch {
                for pos in 0..spatial {
                    let offset = (b * spatial + pos) * self.out_channels;
                    for oc in 0..self.out_channels {
                        matrix[offset + oc] = grad_data[b * grad_cols + oc * spatial + pos];
                    }
                }
            }
        }
        let patches = self.im2col(input, batch, oh, ow)?;
        let grad_weight = grad_matrix.transpose().matmul(&patches)?;
        self.weight.accumulate_euclidean(&grad_weight)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.accumulate_euclidean(&Tensor::row_vector(&grad_matrix.sum_axis0())?)?;
        }
        let grad_patches = grad_matrix.matmul(self.weight.value())?;
        self.col2im(&grad_patches, batch, oh, ow)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&self.weight)?;
        if let Some(bias) = &self.bias {
            visitor(bias)?;
        }
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        visitor(&mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            visitor(bias)?;
        }
        Ok(())
    }
}

/// Max pooling over 2D feature maps.
#[derive(Debug)]
pub struct MaxPool2d {
    channels: usize,
    kernel: (usize, usize),
    stride: (usize, usize),
    input_hw: (usize, usize),
    last_indices: RefCell<Vec<usize>>,
}

impl MaxPool2d {
    pub fn new(
        channels: usize,
        kernel: (usize, usize),
        stride: (usize, usize),
        input_hw: (usize, usize),
    ) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(kernel.0, "kernel_h")?;
        validate_positive(kernel.1, "kernel_w")?;
        validate_positive(stride.0, "stride_h")?;
        validate_positive(stride.1, "stride_w")?;
        let pool = Self {
            channels,
            kernel,
            stride,
            input_hw,
            last_indices: RefCell::new(Vec::new()),
        };
        pool.output_hw()?;
        Ok(pool)
    }

    pub fn output_hw(&self) -> PureResult<(usize, usize)> {
        let (h, w) = self.input_hw;
        let (kh, kw) = self.kernel;
        if h < kh || w < kw {
            return Err(TensorError::InvalidDimensions {
                rows: h,
                cols: kh.max(kw),
            });
        }
        Ok(((h - kh) / self.stride.0 + 1, (w - kw) / self.stride.1 + 1))
    }
}

impl Module for MaxPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let (h, w) = self.input_hw;
        if cols != self.channels * h * w {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * h * w),
            });
        }
        let (oh, ow) = self.output_hw()?;
        let out_cols = self.channels * oh * ow;
        let mut out = Tensor::zeros(batch, out_cols)?;
        let mut indices = self.last_indices.borrow_mut();
        indices.clear();
        indices.resize(batch * out_cols, 0);
        {
            let out_data = out.data_mut();
            for b in 0..batch {
                let row = &input.data()[b * cols..(b + 1) * cols];
                for c in 0..self.channels {
                    let channel_offset = c * h * w;
                    for oh_idx in 0..oh {
                        for ow_idx in 0..ow {
                            let mut best = f32::MIN;
                            let mut best_idx = channel_offset;
                            for kh in 0..self.kernel.0 {
                                for kw in 0..self.kernel.1 {
                                    let index = channel_offset
                                        + (oh_idx * self.stride.0 + kh) * w
                                        + ow_idx * self.stride.1
                                        + kw;
                                    if row[index] > best {
                                        best = row[index];
                                        best_idx = index;
                                    }
                                }
                            }
                            let out_index = c * oh * ow + oh_idx * ow + ow_idx;
                            out_data[b * out_cols + out_index] = best;
                            indices[b * out_cols + out_index] = best_idx;
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = grad_output.shape();
        let (oh, ow) = self.output_hw()?;
        if cols != self.channels * oh * ow {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * oh * ow),
            });
        }
        let indices = self.last_indices.borrow();
        if indices.len() != batch * cols {
            return Err(TensorError::InvalidValue {
                label: "maxpool_backward_without_forward",
            });
        }
        let in_cols = input.shape().1;
        let mut grad_input = Tensor::zeros(batch, in_cols)?;
        {
            let grad_input_data = grad_input.data_mut();
            for b in 0..batch {
                let grad_row = &grad_output.data()[b * cols..(b + 1) * cols];
                for (idx, g) in grad_row.iter().enumerate() {
                    grad_input_data[b * in_cols + indices[b * cols + idx]] += g;
                }
            }
        }
        Ok(grad_input)
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

/// Averages each channel over its whole feature map, producing `(batch, channels)`.
#[derive(Debug, Clone, Copy)]
pub struct GlobalAvgPool2d {
    channels: usize,
    input_hw: (usize, usize),
}

impl GlobalAvgPool2d {
    pub fn new(channels: usize, input_hw: (usize, usize)) -> PureResult<Self> {
        validate_positive(channels, "channels")?;
        validate_positive(input_hw.0 * input_hw.1, "input_area")?;
        Ok(Self { channels, input_hw })
    }
}

impl Module for GlobalAvgPool2d {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        let area = self.input_hw.0 * self.input_hw.1;
        if cols != self.channels * area {
            return Err(TensorError::ShapeMismatch {
                left: (1, cols),
                right: (1, self.channels * area),
            });
        }
        let inv = 1.0 / area as f32;
        Tensor::from_fn(batch, self.channels, |b, c| {
            let start = b * cols + c * area;
            input.data()[start..start + area].iter().sum::<f32>() * inv
        })
    }

    fn backward(&mut self, input: &Tensor, grad_output: &Tensor) -> PureResult<Tensor> {
        let (batch, cols) = input.shape();
        if grad_output.shape() != (batch, self.channels) {
            return Err(TensorError::ShapeMismatch {
                left: grad_output.shape(),
                right: (batch, self.channels),
            });
        }
        let area = self.input_hw.0 * self.input_hw.1;
        let inv = 1.0 / area as f32;
        Tensor::from_fn(batch, cols, |b, col| {
            grad_output.data()[b * self.channels + col / area] * inv
        })
    }

    fn visit_parameters(
        &self,
        _visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }

    fn visit_parameters_mut(
        &mut self,
        _visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn conv_output_shape_and_bias() {
        let conv = Conv2d::new("c", 2, 3, (3, 3), (1, 1), (1, 1), (4, 4)).unwrap();
        let input = Tensor::random_normal(2, 2 * 16, 0.0, 1.0, Some(3)).unwrap();
        let out = conv.forward(&input).unwrap();
        assert_eq!(out.shape(), (2, 3 * 16));
    }

    #[test]
    fn mean_patch_projects_to_spatial_mean() {
        let conv = Conv2d::new("c", 2, 4, (3, 3), (1, 1), (1, 1), (5, 5))
            .unwrap()
            .without_bias();
        let input = Tensor::random_normal(3, 2 * 25, 0.0, 1.0, Some(9)).unwrap();
        let out = conv.forward(&input).unwrap();
        let patch = conv.mean_patch(&input).unwrap();
        let projected = conv.project_patch(&patch).unwrap();
        for oc in 0..4 {
            let mut total = 0.0f32;
            for b in 0..3 {
                let start = b * 100 + oc * 25;
                total += out.data()[start..start + 25].iter().sum::<f32>();
            }
            assert_relative_eq!(projected.data()[oc], total / 75.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn conv_backward_matches_finite_difference() {
        let mut conv = Conv2d::new("fd", 1, 2, (2, 2), (1, 1), (0, 0), (3, 3)).unwrap();
        let input = Tensor::random_normal(1, 9, 0.0, 1.0, Some(1)).unwrap();
        let out = conv.forward(&input).unwrap();
        let grad_out = Tensor::full(out.shape().0, out.shape().1, 1.0).unwrap();
        let grad_in = conv.backward(&input, &grad_out).unwrap();
        let eps = 1e-3;
        for idx in 0..9 {
            let mut plus = input.clone();
            plus.data_mut()[idx] += eps;
            let mut minus = input.clone();
            minus.data_mut()[idx] -= eps;
            let fp: f32 = conv.forward(&plus).unwrap().data().iter().sum();
            let fm: f32 = conv.forward(&minus).unwrap().data().iter().sum();
            assert_relative_eq!(grad_in.data()[idx], (fp - fm) / (2.0 * eps), epsilon = 1e-2);
        }
    }

    #[test]
    fn maxpool_routes_gradient_to_argmax() {
        let mut pool = MaxPool2d::new(1, (2, 2), (2, 2), (2, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![0.1, 0.9, -0.3, 0.2]).unwrap();
        let out = pool.forward(&input).unwrap();
        assert_eq!(out.data(), &[0.9]);
        let grad = pool
            .backward(&input, &Tensor::from_vec(1, 1, vec![2.0]).unwrap())
            .unwrap();
        assert_eq!(grad.data(), &[0.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn global_pool_averages_channels() {
        let mut pool = GlobalAvgPool2d::new(2, (1, 2)).unwrap();
        let input = Tensor::from_vec(1, 4, vec![1.0, 3.0, -2.0, 0.0]).unwrap();
        assert_eq!(pool.forward(&input).unwrap().data(), &[2.0, -1.0]);
        let grad = pool
            .backward(&input, &Tensor::from_vec(1, 2, vec![1.0, 4.0]).unwrap())
            .unwrap();
        assert_eq!(grad.data(), &[0.5, 0.5, 2.0, 2.0]);
    }
}
