//! 2D convolution primitives on ndarray tensors.
//!
//! Direct (loop-based) implementations in NCHW layout, sized for the small
//! trainee network rather than for large-scale inference.

use ndarray::{Array1, Array4, ArrayView4};

/// Output spatial extent for a convolution along one axis.
pub fn conv_out_len(input: usize, kernel: usize, stride: usize, padding: usize) -> usize {
    (input + 2 * padding - kernel) / stride + 1
}

/// Forward 2D convolution.
///
/// `input` is `[N, C_in, H, W]`, `weight` is `[C_out, C_in, K, K]`,
/// `bias` is `[C_out]`. Returns `[N, C_out, H', W']`.
pub fn conv2d(
    input: &ArrayView4<f32>,
    weight: &Array4<f32>,
    bias: &Array1<f32>,
    stride: usize,
    padding: usize,
) -> Array4<f32> {
    let (n, in_ch, h, w) = input.dim();
    let (out_ch, _, k, _) = weight.dim();
    let out_h = conv_out_len(h, k, stride, padding);
    let out_w = conv_out_len(w, k, stride, padding);

    let mut output = Array4::<f32>::zeros((n, out_ch, out_h, out_w));

    for b in 0..n {
        for o in 0..out_ch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut acc = bias[o];
                    for i in 0..in_ch {
                        for ky in 0..k {
                            let y = (oy * stride + ky) as isize - padding as isize;
                            if y < 0 || y >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let x = (ox * stride + kx) as isize - padding as isize;
                                if x < 0 || x >= w as isize {
                                    continue;
                                }
                                acc += weight[[o, i, ky, kx]]
                                    * input[[b, i, y as usize, x as usize]];
                            }
                        }
                    }
                    output[[b, o, oy, ox]] = acc;
                }
            }
        }
    }

    output
}

/// Backward pass of [`conv2d`].
///
/// Returns `(grad_input, grad_weight, grad_bias)` for the given upstream
/// gradient `grad_output` of shape `[N, C_out, H', W']`.
pub fn conv2d_backward(
    input: &ArrayView4<f32>,
    weight: &Array4<f32>,
    grad_output: &ArrayView4<f32>,
    stride: usize,
    padding: usize,
) -> (Array4<f32>, Array4<f32>, Array1<f32>) {
    let (n, in_ch, h, w) = input.dim();
    let (out_ch, _, k, _) = weight.dim();
    let (_, _, out_h, out_w) = grad_output.dim();

    let mut grad_input = Array4::<f32>::zeros((n, in_ch, h, w));
    let mut grad_weight = Array4::<f32>::zeros(weight.raw_dim());
    let mut grad_bias = Array1::<f32>::zeros(out_ch);

    for b in 0..n {
        for o in 0..out_ch {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let g = grad_output[[b, o, oy, ox]];
                    if g == 0.0 {
                        continue;
                    }
                    grad_bias[o] += g;
                    for i in 0..in_ch {
                        for ky in 0..k {
                            let y = (oy * stride + ky) as isize - padding as isize;
                            if y < 0 || y >= h as isize {
                                continue;
                            }
                            for kx in 0..k {
                                let x = (ox * stride + kx) as isize - padding as isize;
                                if x < 0 || x >= w as isize {
                                    continue;
                                }
                                let (y, x) = (y as usize, x as usize);
                                grad_weight[[o, i, ky, kx]] += g * input[[b, i, y, x]];
                                grad_input[[b, i, y, x]] += g * weight[[o, i, ky, kx]];
                            }
                        }
                    }
                }
            }
        }
    }

    (grad_input, grad_weight, grad_bias)
}

/// Element-wise ReLU.
pub fn relu(input: &Array4<f32>) -> Array4<f32> {
    input.mapv(|v| v.max(0.0))
}

/// Backward pass of [`relu`]: gradient flows only where the pre-activation
/// input was positive.
pub fn relu_backward(pre_activation: &Array4<f32>, grad_output: &Array4<f32>) -> Array4<f32> {
    let mut grad = grad_output.clone();
    grad.zip_mut_with(pre_activation, |g, &z| {
        if z <= 0.0 {
            *g = 0.0;
        }
    });
    grad
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::Array1;

    #[test]
    fn test_conv_out_len() {
        // k3 s2 p1 halves the spatial extent for even inputs.
        assert_eq!(conv_out_len(16, 3, 2, 1), 8);
        assert_eq!(conv_out_len(8, 3, 2, 1), 4);
        // k4 s4 p0 quarters it.
        assert_eq!(conv_out_len(16, 4, 4, 0), 4);
    }

    #[test]
    fn test_identity_kernel() {
        // A 1x1 kernel with weight 1 reproduces the input channel.
        let input = Array4::from_shape_fn((1, 1, 3, 3), |(_, _, y, x)| (y * 3 + x) as f32);
        let weight = Array4::from_elem((1, 1, 1, 1), 1.0);
        let bias = Array1::zeros(1);

        let out = conv2d(&input.view(), &weight, &bias, 1, 0);
        assert_eq!(out, input);
    }

    #[test]
    fn test_bias_only() {
        let input = Array4::<f32>::zeros((1, 1, 4, 4));
        let weight = Array4::<f32>::zeros((2, 1, 3, 3));
        let bias = Array1::from_vec(vec![0.5, -1.0]);

        let out = conv2d(&input.view(), &weight, &bias, 1, 1);
        assert_eq!(out.dim(), (1, 2, 4, 4));
        assert_relative_eq!(out[[0, 0, 2, 2]], 0.5);
        assert_relative_eq!(out[[0, 1, 0, 0]], -1.0);
    }

    #[test]
    fn test_backward_matches_numerical_gradient() {
        // Finite-difference check of grad_weight on a tiny problem.
        let input = Array4::from_shape_fn((1, 2, 4, 4), |(_, c, y, x)| {
            0.1 * (c as f32 + 1.0) * (y as f32 - x as f32)
        });
        let mut weight = Array4::from_shape_fn((1, 2, 3, 3), |(_, c, ky, kx)| {
            0.05 * (c + ky + kx) as f32 - 0.1
        });
        let bias = Array1::from_vec(vec![0.2]);

        let loss = |w: &Array4<f32>| -> f32 {
            let out = conv2d(&input.view(), w, &bias, 2, 1);
            out.iter().map(|v| v * v).sum::<f32>()
        };

        let out = conv2d(&input.view(), &weight, &bias, 2, 1);
        let grad_out = out.mapv(|v| 2.0 * v);
        let (_, grad_w, _) = conv2d_backward(&input.view(), &weight, &grad_out.view(), 2, 1);

        let eps = 1e-3;
        for idx in [[0, 0, 0, 0], [0, 1, 1, 1], [0, 0, 2, 2]] {
            let orig = weight[idx];
            weight[idx] = orig + eps;
            let hi = loss(&weight);
            weight[idx] = orig - eps;
            let lo = loss(&weight);
            weight[idx] = orig;

            let numeric = (hi - lo) / (2.0 * eps);
            assert_relative_eq!(grad_w[idx], numeric, max_relative = 0.05, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_relu_and_backward() {
        let z = Array4::from_shape_vec((1, 1, 1, 4), vec![-1.0, 0.0, 0.5, 2.0]).unwrap();
        let out = relu(&z);
        assert_eq!(out.as_slice().unwrap(), &[0.0, 0.0, 0.5, 2.0]);

        let upstream = Array4::from_elem((1, 1, 1, 4), 1.0);
        let grad = relu_backward(&z, &upstream);
        assert_eq!(grad.as_slice().unwrap(), &[0.0, 0.0, 1.0, 1.0]);
    }
}
