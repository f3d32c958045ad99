//! K/L/S factor engine shared by the low-rank linear and convolution layers
//!
//! The effective weight is `W = U · S · Vᵀ` (`[n_in, n_out]`) and maps input
//! rows to output rows: `Y = X · W + b`. `U` and `V` are orthonormal buffers;
//! the trainable parameters are the basis `K = U·S`, the co-basis `L = V·Sᵀ`
//! and the core `S`. One training step updates them in turn:
//!
//! ```text
//! K-phase: k_preprocess → step on K → k_postprocess (Û, M = ÛᵀU)
//! L-phase: l_preprocess → step on L → l_postprocess (V̂, N = V̂ᵀV)
//! S-phase: s_preprocess (S ← M·S·Nᵀ, U ← Û, V ← V̂) → step on S → rank_adaption
//! ```

use super::config::{InitMethod, LayerKind, LowRankConfig};
use super::linalg::{self, from_row_major, to_row_major, Matrix};
use super::rank::select_rank;
use super::Phase;
use crate::autograd::{add_bias, autocast, matmul, transpose, Context};
use crate::error::{Error, Result};
use crate::Tensor;
use rand::rngs::StdRng;
use rand::Rng;
use tracing::debug;

/// New orthonormal basis and its projection onto the old one
#[derive(Debug, Clone)]
struct BasisUpdate {
    basis: Matrix,
    projection: Matrix,
}

/// Factorized weight with rank adaptation
#[derive(Debug, Clone)]
pub struct LowRankCore {
    n_in: usize,
    n_out: usize,
    rank: usize,
    max_rank: usize,
    epsilon: f32,
    adaptive: bool,
    u: Matrix,
    v: Matrix,
    k: Tensor,
    l: Tensor,
    s: Tensor,
    bias: Option<Tensor>,
    basis_update: Option<BasisUpdate>,
    cobasis_update: Option<BasisUpdate>,
}

impl LowRankCore {
    /// Build the factors for a `n_in × n_out` layer
    ///
    /// `weight` is the row-major dense weight being replaced; it seeds the
    /// factors under [`InitMethod::Svd`]. The bias is always carried over.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layer: &str,
        kind: LayerKind,
        n_in: usize,
        n_out: usize,
        weight: &[f32],
        bias: Option<&[f32]>,
        config: &LowRankConfig,
        rng: &mut StdRng,
    ) -> Result<Self> {
        if weight.len() != n_in * n_out {
            return Err(Error::ShapeMismatch {
                expected: vec![n_in, n_out],
                got: vec![weight.len()],
            });
        }
        if let Some(b) = bias {
            if b.len() != n_out {
                return Err(Error::ShapeMismatch {
                    expected: vec![n_out],
                    got: vec![b.len()],
                });
            }
        }

        let max_rank = config.max_rank(n_in, n_out);
        let rank = config.initial_rank(max_rank);
        if let Some(requested) = config.initial_rank.filter(|&r| r != rank) {
            debug!(layer, requested, rank, max_rank, "initial rank clamped");
        }

        let dense = match config.init_method {
            InitMethod::Svd => from_row_major(weight, n_in, n_out),
            InitMethod::Random => {
                let bound = 1.0 / (n_in as f32).sqrt();
                Matrix::from_fn(n_in, n_out, |_, _| rng.random_range(-bound..bound))
            }
        };
        let (u, s, v) = linalg::svd(&dense)?.truncate(rank);

        let mut core = Self {
            n_in,
            n_out,
            rank,
            max_rank,
            epsilon: config.epsilon.for_kind(kind),
            adaptive: config.adaptive,
            k: Tensor::zeros(0, true),
            l: Tensor::zeros(0, true),
            s: Tensor::zeros(0, true),
            bias: bias.map(|b| Tensor::from_vec(b.to_vec(), true)),
            u,
            v,
            basis_update: None,
            cobasis_update: None,
        };
        core.set_core(&s);
        core.refresh_k();
        core.refresh_l();
        Ok(core)
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.n_out
    }

    /// Current rank
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Upper bound on the rank (capacity and percentage cap)
    pub fn max_rank(&self) -> usize {
        self.max_rank
    }

    /// `min(n_in, n_out)`
    pub fn full_rank(&self) -> usize {
        self.n_in.min(self.n_out)
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive
    }

    /// Number of basis columns; exceeds the rank between `s_preprocess` and
    /// rank adaptation
    pub fn basis_width(&self) -> usize {
        self.u.ncols()
    }

    /// Orthonormal basis `U` (`[n_in, width]`)
    pub fn basis(&self) -> &Matrix {
        &self.u
    }

    /// Orthonormal co-basis `V` (`[n_out, width]`)
    pub fn cobasis(&self) -> &Matrix {
        &self.v
    }

    pub fn k(&self) -> &Tensor {
        &self.k
    }

    pub fn l(&self) -> &Tensor {
        &self.l
    }

    pub fn s(&self) -> &Tensor {
        &self.s
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    /// Core `S` as a matrix
    pub fn core_matrix(&self) -> Matrix {
        let w = self.s.shape()[0];
        from_row_major(self.s.data().as_slice().unwrap_or_default(), w, w)
    }

    /// `U · S · Vᵀ`
    pub fn effective_weight(&self) -> Matrix {
        &self.u * self.core_matrix() * self.v.transpose()
    }

    /// Trainable tensors in a fixed order: K, L, S, bias
    pub fn parameters(&self) -> Vec<&Tensor> {
        let mut params = vec![&self.k, &self.l, &self.s];
        params.extend(self.bias.as_ref());
        params
    }

    /// Mutable trainable tensors, same order as [`Self::parameters`]
    pub fn parameters_mut(&mut self) -> Vec<&mut Tensor> {
        let mut params = vec![&mut self.k, &mut self.l, &mut self.s];
        params.extend(self.bias.as_mut());
        params
    }

    /// Non-trainable state: `U` and `V`
    pub fn buffers_mut(&mut self) -> [&mut Matrix; 2] {
        [&mut self.u, &mut self.v]
    }

    /// Freeze every factor except the one trained in `phase`
    ///
    /// The S-phase unfreezes everything; K and L simply receive no gradient
    /// because the S forward does not read them.
    pub fn set_phase(&mut self, phase: Phase) {
        let (k, l, s) = match phase {
            Phase::K => (true, false, false),
            Phase::L => (false, true, false),
            Phase::S => (true, true, true),
        };
        self.k.set_requires_grad(k);
        self.l.set_requires_grad(l);
        self.s.set_requires_grad(s);
        if let Some(bias) = self.bias.as_mut() {
            bias.set_requires_grad(s);
        }
    }

    /// Apply the layer to `rows` input rows `[rows, n_in]`
    pub fn forward_rows(&self, x: &Tensor, rows: usize, ctx: &Context) -> Result<Tensor> {
        if x.len() != rows * self.n_in {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, self.n_in],
                got: x.shape().to_vec(),
            });
        }
        let precision = ctx.precision();
        let (n_in, n_out) = (self.n_in, self.n_out);

        let y = match ctx.phase() {
            Phase::K => {
                let w = self.v.ncols();
                self.check_len(&self.k, n_in * w, &[n_in, w])?;
                // (X · K) · Vᵀ
                let xk = autocast(&matmul(x, &ctx.track(&self.k), rows, n_in, w), precision);
                matmul(&xk, &constant(&self.v.transpose()), rows, w, n_out)
            }
            Phase::L => {
                let w = self.u.ncols();
                self.check_len(&self.l, n_out * w, &[n_out, w])?;
                // (X · U) · Lᵀ
                let xu = autocast(&matmul(x, &constant(&self.u), rows, n_in, w), precision);
                let lt = transpose(&ctx.track(&self.l), n_out, w);
                matmul(&xu, &lt, rows, w, n_out)
            }
            Phase::S => {
                let w = self.u.ncols();
                if self.v.ncols() != w {
                    return Err(Error::ShapeMismatch {
                        expected: vec![w, w],
                        got: vec![w, self.v.ncols()],
                    });
                }
                self.check_len(&self.s, w * w, &[w, w])?;
                // ((X · U) · S) · Vᵀ
                let xu = autocast(&matmul(x, &constant(&self.u), rows, n_in, w), precision);
                let xus = autocast(&matmul(&xu, &ctx.track(&self.s), rows, w, w), precision);
                matmul(&xus, &constant(&self.v.transpose()), rows, w, n_out)
            }
        };
        let y = autocast(&y, precision);

        Ok(match &self.bias {
            Some(b) => add_bias(&y, &ctx.track(b), rows, n_out),
            None => y,
        })
    }

    fn check_len(&self, t: &Tensor, len: usize, shape: &[usize]) -> Result<()> {
        if t.len() == len {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                expected: shape.to_vec(),
                got: t.shape().to_vec(),
            })
        }
    }

    /// Re-orthonormalize `U`, absorb `R` into `S`, then `K ← U·S`
    pub fn k_preprocess(&mut self) -> Result<()> {
        let (q, r) = linalg::qr(&self.u)?;
        let s = r * self.core_matrix();
        self.u = q;
        self.set_core(&s);
        self.refresh_k();
        Ok(())
    }

    /// Re-orthonormalize `V`, absorb `Rᵀ` into `S`, then `L ← V·Sᵀ`
    pub fn l_preprocess(&mut self) -> Result<()> {
        let (q, r) = linalg::qr(&self.v)?;
        let s = self.core_matrix() * r.transpose();
        self.v = q;
        self.set_core(&s);
        self.refresh_l();
        Ok(())
    }

    /// Width of the augmented basis built by the post-processing steps
    fn augmented_width(&self) -> usize {
        let w = self.basis_width();
        if self.adaptive {
            (2 * w).min(self.n_in).min(self.n_out)
        } else {
            w
        }
    }

    /// Orthonormal basis of `[old | trained]` (adaptive) or of `trained`
    fn new_basis(&self, old: &Matrix, trained: &Matrix) -> Result<Matrix> {
        let width = self.augmented_width();
        let q = if self.adaptive {
            let w = old.ncols();
            let mut stacked = Matrix::zeros(old.nrows(), 2 * w);
            stacked.columns_mut(0, w).copy_from(old);
            stacked.columns_mut(w, w).copy_from(trained);
            linalg::qr(&stacked)?.0
        } else {
            linalg::qr(trained)?.0
        };
        Ok(q.columns(0, width).into_owned())
    }

    /// Build `Û` from the trained `K` and record `M = ÛᵀU`
    pub fn k_postprocess(&mut self) -> Result<()> {
        let w = self.basis_width();
        self.check_len(&self.k, self.n_in * w, &[self.n_in, w])?;
        let k = from_row_major(self.k.data().as_slice().unwrap_or_default(), self.n_in, w);
        let basis = self.new_basis(&self.u, &k)?;
        let projection = basis.transpose() * &self.u;
        self.basis_update = Some(BasisUpdate { basis, projection });
        Ok(())
    }

    /// Build `V̂` from the trained `L` and record `N = V̂ᵀV`
    pub fn l_postprocess(&mut self) -> Result<()> {
        let w = self.v.ncols();
        self.check_len(&self.l, self.n_out * w, &[self.n_out, w])?;
        let l = from_row_major(self.l.data().as_slice().unwrap_or_default(), self.n_out, w);
        let basis = self.new_basis(&self.v, &l)?;
        let projection = basis.transpose() * &self.v;
        self.cobasis_update = Some(BasisUpdate { basis, projection });
        Ok(())
    }

    /// Whether both post-processing steps are waiting for `s_preprocess`
    pub fn has_pending_update(&self) -> bool {
        self.basis_update.is_some() && self.cobasis_update.is_some()
    }

    /// Project `S` into the new bases: `S ← M·S·Nᵀ`, `U ← Û`, `V ← V̂`
    ///
    /// A no-op unless both post-processing steps ran since the last call, so
    /// it is safe to call before every S-phase forward. Returns whether the
    /// bases changed.
    pub fn s_preprocess(&mut self) -> Result<bool> {
        if !self.has_pending_update() {
            return Ok(false);
        }
        let (Some(bu), Some(cu)) = (self.basis_update.take(), self.cobasis_update.take()) else {
            return Ok(false);
        };
        let s = &bu.projection * self.core_matrix() * cu.projection.transpose();
        self.u = bu.basis;
        self.v = cu.basis;
        self.set_core(&s);
        Ok(true)
    }

    /// Truncate to the rank chosen by the singular values of `S`
    ///
    /// Returns `(old_rank, new_rank)`.
    pub fn rank_adaption(&mut self) -> Result<(usize, usize)> {
        let svd = linalg::svd(&self.core_matrix())?;
        let rank = select_rank(&svd.singular_values, self.epsilon, self.max_rank);
        self.apply_truncation(&svd, rank)
    }

    /// Truncate to a forced rank (`None` keeps the current rank)
    ///
    /// Out-of-range requests are clamped into `[1, max_rank]`.
    pub fn truncate(&mut self, rank: Option<usize>) -> Result<(usize, usize)> {
        let svd = linalg::svd(&self.core_matrix())?;
        self.apply_truncation(&svd, rank.unwrap_or(self.rank))
    }

    fn apply_truncation(&mut self, svd: &linalg::Svd, rank: usize) -> Result<(usize, usize)> {
        let upper = svd.singular_values.len().min(self.max_rank).max(1);
        let rank = rank.clamp(1, upper);
        let (p, s, q) = svd.truncate(rank);

        self.u = &self.u * p;
        self.v = &self.v * q;
        self.set_core(&s);
        self.refresh_k();
        self.refresh_l();
        self.basis_update = None;
        self.cobasis_update = None;

        let old = std::mem::replace(&mut self.rank, rank);
        if old != rank {
            debug!(old, new = rank, n_in = self.n_in, n_out = self.n_out, "rank changed");
        }
        Ok((old, rank))
    }

    fn set_core(&mut self, s: &Matrix) {
        self.s.replace(to_row_major(s), &[s.nrows(), s.ncols()]);
    }

    fn refresh_k(&mut self) {
        let k = &self.u * self.core_matrix();
        self.k.replace(to_row_major(&k), &[k.nrows(), k.ncols()]);
    }

    fn refresh_l(&mut self) {
        let l = &self.v * self.core_matrix().transpose();
        self.l.replace(to_row_major(&l), &[l.nrows(), l.ncols()]);
    }
}

/// Frozen buffer as a graph leaf
fn constant(m: &Matrix) -> Tensor {
    Tensor::from_shape(to_row_major(m), &[m.nrows(), m.ncols()], false)
}
