//! Autograd operations with backward passes

use super::precision::{round_to_precision, Precision};
use super::{BackwardOp, Tensor};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use std::cell::RefCell;
use std::rc::Rc;

type GradCell = Rc<RefCell<Option<Array1<f32>>>>;

fn view2(data: &Array1<f32>, rows: usize, cols: usize) -> ArrayView2<'_, f32> {
    data.view()
        .into_shape_with_order((rows, cols))
        .expect("tensor data is contiguous and sized rows * cols")
}

fn flatten(a: Array2<f32>) -> Array1<f32> {
    a.iter().copied().collect()
}

/// Add two tensors of identical shape
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.len(), b.len(), "add operands must have the same length");
    let data = a.data() + b.data();
    let requires_grad = a.requires_grad() || b.requires_grad();

    let mut result = Tensor::new(data, requires_grad).reshape(a.shape());

    if requires_grad {
        let backward_op = Rc::new(AddBackward {
            a: a.clone(),
            b: b.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBackward {
    a: Tensor,
    b: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AddBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
            if self.b.requires_grad() {
                self.b.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }
}

/// ReLU activation
pub fn relu(a: &Tensor) -> Tensor {
    let data = a.data().mapv(|x| x.max(0.0));
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad).reshape(a.shape());

    if requires_grad {
        let backward_op = Rc::new(ReluBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct ReluBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for ReluBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂out * (a > 0)
                let grad_a = grad * &self.a.data().mapv(|x| if x > 0.0 { 1.0 } else { 0.0 });
                self.a.accumulate_grad(grad_a);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// Sum all elements
pub fn sum(a: &Tensor) -> Tensor {
    let data = Array1::from(vec![a.data().sum()]);
    let requires_grad = a.requires_grad();

    let mut result = Tensor::new(data, requires_grad);

    if requires_grad {
        let backward_op = Rc::new(SumBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct SumBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for SumBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                // ∂L/∂a = ∂L/∂sum * 1 (broadcast)
                self.a
                    .accumulate_grad(Array1::from_elem(self.a.len(), grad[0]));
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// Matrix multiplication
///
/// Computes C = A @ B where:
/// - A is m×k (flattened to length m*k)
/// - B is k×n (flattened to length k*n)
/// - C is m×n (flattened to length m*n)
pub fn matmul(a: &Tensor, b: &Tensor, m: usize, k: usize, n: usize) -> Tensor {
    assert_eq!(a.len(), m * k, "Matrix A size mismatch");
    assert_eq!(b.len(), k * n, "Matrix B size mismatch");

    let c = view2(a.data(), m, k).dot(&view2(b.data(), k, n));

    let requires_grad = a.requires_grad() || b.requires_grad();
    let mut result = Tensor::new(flatten(c), requires_grad).reshape(&[m, n]);

    if requires_grad {
        let backward_op = Rc::new(MatmulBackward {
            a: a.clone(),
            b: b.clone(),
            m,
            k,
            n,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct MatmulBackward {
    a: Tensor,
    b: Tensor,
    m: usize,
    k: usize,
    n: usize,
    result_grad: GradCell,
}

impl BackwardOp for MatmulBackward {
    fn backward(&self) {
        if let Some(grad_output) = self.result_grad.borrow().as_ref() {
            let g = view2(grad_output, self.m, self.n);

            // ∂L/∂A = ∂L/∂C @ B^T
            if self.a.requires_grad() {
                let b = view2(self.b.data(), self.k, self.n);
                self.a.accumulate_grad(flatten(g.dot(&b.t())));
            }

            // ∂L/∂B = A^T @ ∂L/∂C
            if self.b.requires_grad() {
                let a = view2(self.a.data(), self.m, self.k);
                self.b.accumulate_grad(flatten(a.t().dot(&g)));
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone(), self.b.clone()]
    }
}

/// Transpose a rows×cols matrix into cols×rows
pub fn transpose(a: &Tensor, rows: usize, cols: usize) -> Tensor {
    assert_eq!(a.len(), rows * cols, "Matrix size mismatch");

    let data = flatten(view2(a.data(), rows, cols).t().to_owned());
    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, requires_grad).reshape(&[cols, rows]);

    if requires_grad {
        let backward_op = Rc::new(TransposeBackward {
            a: a.clone(),
            rows,
            cols,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct TransposeBackward {
    a: Tensor,
    rows: usize,
    cols: usize,
    result_grad: GradCell,
}

impl BackwardOp for TransposeBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                let g = view2(grad, self.cols, self.rows);
                self.a.accumulate_grad(flatten(g.t().to_owned()));
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}

/// Add a bias row vector to every row of an m×n matrix
pub fn add_bias(x: &Tensor, bias: &Tensor, m: usize, n: usize) -> Tensor {
    assert_eq!(x.len(), m * n, "Input size mismatch");
    assert_eq!(bias.len(), n, "Bias size mismatch");

    let out = &view2(x.data(), m, n) + &bias.data().view().insert_axis(Axis(0));
    let requires_grad = x.requires_grad() || bias.requires_grad();
    let mut result = Tensor::new(flatten(out), requires_grad).reshape(&[m, n]);

    if requires_grad {
        let backward_op = Rc::new(AddBiasBackward {
            x: x.clone(),
            bias: bias.clone(),
            m,
            n,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AddBiasBackward {
    x: Tensor,
    bias: Tensor,
    m: usize,
    n: usize,
    result_grad: GradCell,
}

impl BackwardOp for AddBiasBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.x.requires_grad() {
                self.x.accumulate_grad(grad.clone());
            }
            if self.bias.requires_grad() {
                let g = view2(grad, self.m, self.n);
                self.bias.accumulate_grad(g.sum_axis(Axis(0)));
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone(), self.bias.clone()]
    }
}

/// Geometry of a 2-D convolution over NCHW inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    /// Input channels
    pub in_channels: usize,
    /// Kernel height and width
    pub kernel: (usize, usize),
    /// Stride (rows, cols)
    pub stride: (usize, usize),
    /// Zero padding (rows, cols)
    pub padding: (usize, usize),
    /// Dilation (rows, cols)
    pub dilation: (usize, usize),
}

impl ConvGeometry {
    /// Length of one unfolded patch: C·kh·kw
    pub fn patch_len(&self) -> usize {
        self.in_channels * self.kernel.0 * self.kernel.1
    }

    /// Output spatial size for an input of `height`×`width`, or `None` when the
    /// kernel does not fit.
    pub fn output_size(&self, height: usize, width: usize) -> Option<(usize, usize)> {
        let span_h = self.dilation.0 * (self.kernel.0.saturating_sub(1)) + 1;
        let span_w = self.dilation.1 * (self.kernel.1.saturating_sub(1)) + 1;
        let padded_h = height + 2 * self.padding.0;
        let padded_w = width + 2 * self.padding.1;
        if padded_h < span_h || padded_w < span_w || self.stride.0 == 0 || self.stride.1 == 0 {
            return None;
        }
        Some((
            (padded_h - span_h) / self.stride.0 + 1,
            (padded_w - span_w) / self.stride.1 + 1,
        ))
    }

    /// Input index feeding patch element `(c, i, j)` of output pixel `(oy, ox)`,
    /// or `None` inside the zero padding.
    fn source(&self, h: usize, w: usize, oy: usize, ox: usize, i: usize, j: usize) -> Option<(usize, usize)> {
        let y = (oy * self.stride.0 + i * self.dilation.0).checked_sub(self.padding.0)?;
        let x = (ox * self.stride.1 + j * self.dilation.1).checked_sub(self.padding.1)?;
        (y < h && x < w).then_some((y, x))
    }
}

/// Unfold NCHW input patches into rows: `[B·OH·OW, C·kh·kw]`
pub fn im2col(x: &Tensor, geometry: ConvGeometry, batch: usize, height: usize, width: usize) -> Tensor {
    let channels = geometry.in_channels;
    assert_eq!(x.len(), batch * channels * height * width, "Input size mismatch");
    let (oh, ow) = geometry
        .output_size(height, width)
        .expect("kernel must fit inside the padded input");
    let patch = geometry.patch_len();
    let (kh, kw) = geometry.kernel;

    let src = x.data();
    let mut cols = vec![0.0; batch * oh * ow * patch];
    for b in 0..batch {
        for oy in 0..oh {
            for ox in 0..ow {
                let row = (b * oh + oy) * ow + ox;
                for c in 0..channels {
                    for i in 0..kh {
                        for j in 0..kw {
                            if let Some((y, xx)) = geometry.source(height, width, oy, ox, i, j) {
                                cols[row * patch + (c * kh + i) * kw + j] =
                                    src[((b * channels + c) * height + y) * width + xx];
                            }
                        }
                    }
                }
            }
        }
    }

    let requires_grad = x.requires_grad();
    let mut result = Tensor::from_shape(cols, &[batch * oh * ow, patch], requires_grad);

    if requires_grad {
        let backward_op = Rc::new(Im2ColBackward {
            x: x.clone(),
            geometry,
            batch,
            height,
            width,
            out: (oh, ow),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct Im2ColBackward {
    x: Tensor,
    geometry: ConvGeometry,
    batch: usize,
    height: usize,
    width: usize,
    out: (usize, usize),
    result_grad: GradCell,
}

impl BackwardOp for Im2ColBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if !self.x.requires_grad() {
                return;
            }
            let g = &self.geometry;
            let (oh, ow) = self.out;
            let (kh, kw) = g.kernel;
            let patch = g.patch_len();
            let channels = g.in_channels;

            // col2im: scatter-add every patch element back onto its source pixel
            let mut grad_x = Array1::zeros(self.x.len());
            for b in 0..self.batch {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let row = (b * oh + oy) * ow + ox;
                        for c in 0..channels {
                            for i in 0..kh {
                                for j in 0..kw {
                                    if let Some((y, x)) = g.source(self.height, self.width, oy, ox, i, j) {
                                        grad_x[((b * channels + c) * self.height + y) * self.width + x] +=
                                            grad[row * patch + (c * kh + i) * kw + j];
                                    }
                                }
                            }
                        }
                    }
                }
            }
            self.x.accumulate_grad(grad_x);
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.x.clone()]
    }
}

/// Fold convolution output rows `[B·OH·OW, O]` into NCHW `[B, O, OH, OW]`
pub fn rows_to_nchw(rows: &Tensor, batch: usize, channels: usize, oh: usize, ow: usize) -> Tensor {
    assert_eq!(rows.len(), batch * oh * ow * channels, "Row block size mismatch");

    let spatial = oh * ow;
    let src = rows.data();
    let mut data = vec![0.0; rows.len()];
    for b in 0..batch {
        for p in 0..spatial {
            for o in 0..channels {
                data[(b * channels + o) * spatial + p] = src[(b * spatial + p) * channels + o];
            }
        }
    }

    let requires_grad = rows.requires_grad();
    let mut result = Tensor::from_shape(data, &[batch, channels, oh, ow], requires_grad);

    if requires_grad {
        let backward_op = Rc::new(RowsToNchwBackward {
            rows: rows.clone(),
            batch,
            channels,
            spatial,
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct RowsToNchwBackward {
    rows: Tensor,
    batch: usize,
    channels: usize,
    spatial: usize,
    result_grad: GradCell,
}

impl BackwardOp for RowsToNchwBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.rows.requires_grad() {
                let mut grad_rows = Array1::zeros(self.rows.len());
                for b in 0..self.batch {
                    for p in 0..self.spatial {
                        for o in 0..self.channels {
                            grad_rows[(b * self.spatial + p) * self.channels + o] =
                                grad[(b * self.channels + o) * self.spatial + p];
                        }
                    }
                }
                self.rows.accumulate_grad(grad_rows);
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.rows.clone()]
    }
}

/// Round activations through a reduced precision type
///
/// Gradients pass straight through; only the forward values lose precision.
pub fn autocast(a: &Tensor, precision: Precision) -> Tensor {
    if !precision.is_reduced() {
        return a.clone();
    }

    let data = a.data().mapv(|x| round_to_precision(x, precision));
    let requires_grad = a.requires_grad();
    let mut result = Tensor::new(data, requires_grad).reshape(a.shape());

    if requires_grad {
        let backward_op = Rc::new(AutocastBackward {
            a: a.clone(),
            result_grad: result.grad_cell(),
        });
        result.set_backward_op(backward_op);
    }

    result
}

struct AutocastBackward {
    a: Tensor,
    result_grad: GradCell,
}

impl BackwardOp for AutocastBackward {
    fn backward(&self) {
        if let Some(grad) = self.result_grad.borrow().as_ref() {
            if self.a.requires_grad() {
                self.a.accumulate_grad(grad.clone());
            }
        }
    }

    fn inputs(&self) -> Vec<Tensor> {
        vec![self.a.clone()]
    }
}
