//! Dense 2-D convolution over NCHW input

use crate::autograd::{add_bias, autocast, im2col, matmul, rows_to_nchw, Context, ConvGeometry};
use crate::error::{Error, Result};
use crate::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Unfold an NCHW input into patch rows for `geometry`
///
/// Returns the patch rows `[B·OH·OW, C·kh·kw]` together with `(B, OH, OW)`.
pub(crate) fn unfold(x: &Tensor, geometry: ConvGeometry) -> Result<(Tensor, (usize, usize, usize))> {
    let shape_error = || Error::ShapeMismatch {
        expected: vec![0, geometry.in_channels, 0, 0],
        got: x.shape().to_vec(),
    };
    let &[batch, channels, height, width] = x.shape() else {
        return Err(shape_error());
    };
    if channels != geometry.in_channels {
        return Err(shape_error());
    }
    let (oh, ow) = geometry
        .output_size(height, width)
        .ok_or_else(shape_error)?;
    Ok((im2col(x, geometry, batch, height, width), (batch, oh, ow)))
}

/// Convolution as im2col followed by a `[C·kh·kw, C_out]` matmul
#[derive(Debug, Clone)]
pub struct Conv2d {
    geometry: ConvGeometry,
    out_channels: usize,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Conv2d {
    /// Create a convolution with weights drawn from `U(-1/√fan_in, 1/√fan_in)`
    pub fn new(geometry: ConvGeometry, out_channels: usize, bias: bool, rng: &mut StdRng) -> Self {
        let fan_in = geometry.patch_len();
        let bound = 1.0 / (fan_in as f32).sqrt();
        let weight = (0..fan_in * out_channels)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let bias: Option<Vec<f32>> =
            bias.then(|| (0..out_channels).map(|_| rng.random_range(-bound..bound)).collect());
        Self {
            geometry,
            out_channels,
            weight: Tensor::from_shape(weight, &[fan_in, out_channels], true),
            bias: bias.map(|b| Tensor::from_vec(b, true)),
        }
    }

    /// Create from explicit weights in `[C·kh·kw, C_out]` layout
    pub fn from_weights(
        geometry: ConvGeometry,
        out_channels: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Result<Self> {
        let fan_in = geometry.patch_len();
        if weight.len() != fan_in * out_channels {
            return Err(Error::ShapeMismatch {
                expected: vec![fan_in, out_channels],
                got: vec![weight.len()],
            });
        }
        if bias.as_ref().is_some_and(|b| b.len() != out_channels) {
            return Err(Error::ShapeMismatch {
                expected: vec![out_channels],
                got: vec![bias.as_ref().map_or(0, Vec::len)],
            });
        }
        Ok(Self {
            geometry,
            out_channels,
            weight: Tensor::from_shape(weight, &[fan_in, out_channels], true),
            bias: bias.map(|b| Tensor::from_vec(b, true)),
        })
    }

    pub fn geometry(&self) -> ConvGeometry {
        self.geometry
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        let (cols, (batch, oh, ow)) = unfold(x, self.geometry)?;
        let rows = batch * oh * ow;
        let fan_in = self.geometry.patch_len();

        let y = autocast(
            &matmul(&cols, &ctx.track(&self.weight), rows, fan_in, self.out_channels),
            ctx.precision(),
        );
        let y = match &self.bias {
            Some(b) => add_bias(&y, &ctx.track(b), rows, self.out_channels),
            None => y,
        };
        Ok(rows_to_nchw(&y, batch, self.out_channels, oh, ow))
    }

    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.weight];
        params.extend(self.bias.as_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn geometry(in_channels: usize, kernel: usize, padding: usize) -> ConvGeometry {
        ConvGeometry {
            in_channels,
            kernel: (kernel, kernel),
            stride: (1, 1),
            padding: (padding, padding),
            dilation: (1, 1),
        }
    }

    #[test]
    fn test_conv_identity_kernel() {
        // 1x1 kernel mapping one channel to two: out0 = x, out1 = -x + 1
        let conv =
            Conv2d::from_weights(geometry(1, 1, 0), 2, vec![1.0, -1.0], Some(vec![0.0, 1.0])).unwrap();
        let x = Tensor::from_shape(vec![1.0, 2.0, 3.0, 4.0], &[1, 1, 2, 2], false);
        let y = conv.forward(&x, &Context::new()).unwrap();
        assert_eq!(y.shape(), &[1, 2, 2, 2]);
        assert_eq!(y.data().as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 0.0, -1.0, -2.0, -3.0]);
    }

    #[test]
    fn test_conv_box_filter_with_padding() {
        let conv = Conv2d::from_weights(geometry(1, 3, 1), 1, vec![1.0; 9], None).unwrap();
        let x = Tensor::from_shape(vec![1.0; 9], &[1, 1, 3, 3], false);
        let y = conv.forward(&x, &Context::new()).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
        // corners see 4 pixels, edges 6, center 9
        assert_abs_diff_eq!(y.data()[0], 4.0);
        assert_abs_diff_eq!(y.data()[1], 6.0);
        assert_abs_diff_eq!(y.data()[4], 9.0);
    }

    #[test]
    fn test_conv_rejects_wrong_channels() {
        let conv = Conv2d::from_weights(geometry(2, 1, 0), 1, vec![1.0; 2], None).unwrap();
        let x = Tensor::from_shape(vec![1.0; 4], &[1, 1, 2, 2], false);
        assert!(conv.forward(&x, &Context::new()).is_err());
    }
}
