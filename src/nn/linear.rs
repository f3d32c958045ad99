//! Dense fully-connected layer

use crate::autograd::{add_bias, autocast, matmul, Context};
use crate::error::{Error, Result};
use crate::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Dense layer `Y = X · W + b` with `W` stored row-major as `[n_in, n_out]`
#[derive(Debug, Clone)]
pub struct Linear {
    n_in: usize,
    n_out: usize,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    /// Create a layer with weights drawn from `U(-1/√n_in, 1/√n_in)`
    pub fn new(n_in: usize, n_out: usize, bias: bool, rng: &mut StdRng) -> Self {
        let bound = 1.0 / (n_in as f32).sqrt();
        let weight = (0..n_in * n_out)
            .map(|_| rng.random_range(-bound..bound))
            .collect();
        let bias = bias.then(|| (0..n_out).map(|_| rng.random_range(-bound..bound)).collect());
        Self {
            n_in,
            n_out,
            weight: Tensor::from_shape(weight, &[n_in, n_out], true),
            bias: bias.map(|b: Vec<f32>| Tensor::from_vec(b, true)),
        }
    }

    /// Create a layer from explicit row-major weights
    pub fn from_weights(
        n_in: usize,
        n_out: usize,
        weight: Vec<f32>,
        bias: Option<Vec<f32>>,
    ) -> Result<Self> {
        if weight.len() != n_in * n_out {
            return Err(Error::ShapeMismatch {
                expected: vec![n_in, n_out],
                got: vec![weight.len()],
            });
        }
        if let Some(b) = &bias {
            if b.len() != n_out {
                return Err(Error::ShapeMismatch {
                    expected: vec![n_out],
                    got: vec![b.len()],
                });
            }
        }
        Ok(Self {
            n_in,
            n_out,
            weight: Tensor::from_shape(weight, &[n_in, n_out], true),
            bias: bias.map(|b| Tensor::from_vec(b, true)),
        })
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Forward over `[rows, n_in]` input
    pub fn forward(&self, x: &Tensor, ctx: &Context) -> Result<Tensor> {
        let rows = rows_of(x, self.n_in)?;
        let y = autocast(
            &matmul(x, &ctx.track(&self.weight), rows, self.n_in, self.n_out),
            ctx.precision(),
        );
        Ok(match &self.bias {
            Some(b) => add_bias(&y, &ctx.track(b), rows, self.n_out),
            None => y,
        })
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

/// Number of `width`-sized rows in `x`
pub(crate) fn rows_of(x: &Tensor, width: usize) -> Result<usize> {
    let last = x.shape().last().copied().unwrap_or(0);
    if width == 0 || last != width || x.len() % width != 0 {
        return Err(Error::ShapeMismatch {
            expected: vec![x.len() / width.max(1), width],
            got: x.shape().to_vec(),
        });
    }
    Ok(x.len() / width)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;

    #[test]
    fn test_linear_forward() {
        // [1 2] · [[1 0 1], [0 1 1]] + [0.5 0.5 0.5]
        let layer = Linear::from_weights(
            2,
            3,
            vec![1.0, 0.0, 1.0, 0.0, 1.0, 1.0],
            Some(vec![0.5; 3]),
        )
        .unwrap();
        let x = Tensor::from_shape(vec![1.0, 2.0], &[1, 2], false);
        let y = layer.forward(&x, &Context::new()).unwrap();
        assert_eq!(y.shape(), &[1, 3]);
        assert_abs_diff_eq!(y.data()[0], 1.5);
        assert_abs_diff_eq!(y.data()[1], 2.5);
        assert_abs_diff_eq!(y.data()[2], 3.5);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let mut rng = StdRng::seed_from_u64(0);
        let layer = Linear::new(4, 2, true, &mut rng);
        let x = Tensor::from_shape(vec![0.0; 6], &[2, 3], false);
        assert!(matches!(
            layer.forward(&x, &Context::new()),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_linear_init_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let layer = Linear::new(16, 4, true, &mut rng);
        assert!(layer.weight().data().iter().all(|w| w.abs() <= 0.25));
        assert_eq!(layer.parameters().len(), 2);
    }

    #[test]
    fn test_no_grad_forward_leaves_weights_untouched() {
        let layer = Linear::from_weights(1, 1, vec![2.0], None).unwrap();
        let mut ctx = Context::new();
        ctx.set_grad_enabled(false);
        let x = Tensor::from_shape(vec![3.0], &[1, 1], false);
        let mut y = layer.forward(&x, &ctx).unwrap();
        crate::autograd::backward(&mut y, None);
        assert!(layer.weight().grad().is_none());
    }
}
