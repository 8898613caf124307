//! # Initialization of parameter values
//!
//! Initializers produce host vectors that are then stored into the parameter
//! arena. All of them draw from the process RNG in [`crate::rng`].

use crate::dim::Dim;
use crate::error::{Error, Result};
use crate::rng::with_rng;
use rand::distributions::{Distribution, Standard, Uniform};

/// `n` values uniform in `[-scale, scale)`. A zero scale yields zeros.
pub fn uniform(n: usize, scale: f32) -> Result<Vec<f32>> {
    if !scale.is_finite() {
        return Err(Error::InvalidConfig(format!("uniform scale must be finite, got {scale}")));
    }
    let scale = scale.abs();
    if scale == 0.0 {
        return Ok(vec![0.0; n]);
    }
    let dist = Uniform::new(-scale, scale);
    Ok(with_rng(|rng| dist.sample_iter(rng).take(n).collect()))
}

/// `n` values from a normal distribution (Box-Muller).
#[must_use]
pub fn normal(n: usize, mean: f32, std: f32) -> Vec<f32> {
    with_rng(|rng| {
        let mut out = Vec::with_capacity(n + 1);
        while out.len() < n {
            let u1: f32 = Standard.sample(rng);
            let u2: f32 = Standard.sample(rng);
            // u1 in (0, 1] keeps ln finite
            let r = (-2.0 * (1.0 - u1).ln()).sqrt();
            let theta = 2.0 * core::f32::consts::PI * u2;
            out.push(mean + std * r * theta.cos());
            out.push(mean + std * r * theta.sin());
        }
        out.truncate(n);
        out
    })
}

/// Glorot (Xavier) uniform initialization for one batch element of `dim`.
pub fn glorot(dim: Dim) -> Result<Vec<f32>> {
    let fan: usize = if dim.nd() == 1 {
        dim.rows()
    } else {
        dim.axes().iter().sum()
    };
    uniform(dim.size(), (6.0 / fan.max(1) as f32).sqrt())
}

/// Orthonormal initialization (Saxe et al.), scaled by `gain`.
///
/// A Gaussian draw is orthonormalized with Gram-Schmidt along its shorter
/// side, so `rows x cols` matrices get orthonormal rows when `rows <= cols`
/// and orthonormal columns otherwise.
#[must_use]
pub fn saxe(dim: Dim, gain: f32) -> Vec<f32> {
    let (rows, cols) = (dim.rows(), dim.size() / dim.rows().max(1));
    let mut m = normal(rows * cols, 0.0, 1.0);
    let by_rows = rows <= cols;
    let (count, len) = if by_rows { (rows, cols) } else { (cols, rows) };
    let idx = |v: usize, k: usize| if by_rows { v * cols + k } else { k * cols + v };
    for v in 0..count {
        for u in 0..v {
            let dot: f32 = (0..len).map(|k| m[idx(v, k)] * m[idx(u, k)]).sum();
            for k in 0..len {
                m[idx(v, k)] -= dot * m[idx(u, k)];
            }
        }
        let norm = (0..len).map(|k| m[idx(v, k)].powi(2)).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            for k in 0..len {
                m[idx(v, k)] /= norm;
            }
        }
    }
    m.iter_mut().for_each(|x| *x *= gain);
    m
}

#[cfg(test)]
mod tests {
    use super::{glorot, normal, saxe, uniform};
    use crate::dim::Dim;
    use crate::error::Error;
    use approx::assert_abs_diff_eq;

    #[test]
    fn uniform_range() {
        let v = uniform(1000, 0.5).unwrap();
        assert!(v.iter().all(|x| (-0.5..0.5).contains(x)));
        assert!(uniform(4, 0.0).unwrap().iter().all(|x| *x == 0.0));
        let g = glorot(Dim::new(&[3, 3])).unwrap();
        assert!(g.iter().all(|x| x.abs() <= 1.0));
    }

    #[test]
    fn non_finite_scales_are_rejected() {
        for scale in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            assert!(matches!(uniform(3, scale), Err(Error::InvalidConfig(_))));
        }
    }

    #[test]
    fn normal_moments() {
        let v = normal(20_000, 1.0, 2.0);
        let mean = v.iter().sum::<f32>() / v.len() as f32;
        let var = v.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / v.len() as f32;
        assert_abs_diff_eq!(mean, 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(var.sqrt(), 2.0, epsilon = 0.1);
    }

    #[test]
    fn saxe_rows_are_orthonormal() {
        let (r, c) = (3, 5);
        let m = saxe(Dim::new(&[r, c]), 1.0);
        for a in 0..r {
            for b in 0..r {
                let dot: f32 = (0..c).map(|k| m[a * c + k] * m[b * c + k]).sum();
                assert_abs_diff_eq!(dot, if a == b { 1.0 } else { 0.0 }, epsilon = 1e-4);
            }
        }
    }
}
