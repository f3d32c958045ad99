//! Gradient clipping utilities

use crate::Tensor;

/// Global L2 norm of all present gradients
pub fn global_grad_norm(params: &[&mut Tensor]) -> f32 {
    params
        .iter()
        .filter_map(|p| p.grad())
        .map(|g| g.iter().map(|&x| x * x).sum::<f32>())
        .sum::<f32>()
        .sqrt()
}

/// Clip gradients by global norm
///
/// If the global norm exceeds `max_norm`, every gradient is scaled by
/// `max_norm / global_norm`, preserving relative magnitudes across parameters.
/// Parameters without a gradient are ignored.
///
/// Returns the global norm before clipping.
pub fn clip_grad_norm_refs(params: &mut [&mut Tensor], max_norm: f32) -> f32 {
    let global_norm = global_grad_norm(params);

    if global_norm > max_norm {
        let clip_coef = max_norm / global_norm;
        for param in params.iter_mut() {
            if let Some(grad) = param.grad() {
                param.set_grad(grad * clip_coef);
            }
        }
    }

    global_norm
}

/// Clip gradients by global norm on owned parameters
pub fn clip_grad_norm(params: &mut [Tensor], max_norm: f32) -> f32 {
    let mut refs: Vec<&mut Tensor> = params.iter_mut().collect();
    clip_grad_norm_refs(&mut refs, max_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_clip_grad_norm_no_clipping() {
        let mut params =
            vec![Tensor::from_vec(vec![1.0, 2.0], true), Tensor::from_vec(vec![3.0], true)];
        params[0].set_grad(ndarray::arr1(&[0.1, 0.2]));
        params[1].set_grad(ndarray::arr1(&[0.1]));

        // Global norm = sqrt(0.06) ≈ 0.245
        let global_norm = clip_grad_norm(&mut params, 1.0);

        assert_abs_diff_eq!(global_norm, 0.245, epsilon = 1e-3);
        assert_abs_diff_eq!(params[0].grad().unwrap()[1], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_clip_grad_norm_scales_to_max() {
        let mut params = vec![Tensor::from_vec(vec![0.0, 0.0], true)];
        params[0].set_grad(ndarray::arr1(&[3.0, 4.0]));

        let global_norm = clip_grad_norm(&mut params, 0.1);

        assert_abs_diff_eq!(global_norm, 5.0, epsilon = 1e-6);
        let grad = params[0].grad().unwrap();
        assert_abs_diff_eq!(grad[0], 0.06, epsilon = 1e-6);
        assert_abs_diff_eq!(grad[1], 0.08, epsilon = 1e-6);
    }

    #[test]
    fn test_clip_ignores_params_without_grad() {
        let mut a = Tensor::from_vec(vec![0.0], true);
        let mut b = Tensor::from_vec(vec![0.0], false);
        a.set_grad(ndarray::arr1(&[2.0]));

        let norm = clip_grad_norm_refs(&mut [&mut a, &mut b], 1.0);

        assert_abs_diff_eq!(norm, 2.0);
        assert_abs_diff_eq!(a.grad().unwrap()[0], 1.0, epsilon = 1e-6);
        assert!(b.grad().is_none());
    }
}
