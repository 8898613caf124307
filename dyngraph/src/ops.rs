//! Forward and backward kernels of the operation catalogue.
//!
//! Kernels read their arguments as [`Arg`] views and return freshly computed
//! host-side vectors which the graph then stores into the device arenas.
//! Backward kernels return the contribution to be added into one argument's
//! gradient; they never write gradients themselves.

use crate::node::Op;
use dyngraph_core::exec::BroadcastMap;
use dyngraph_core::{Dim, Executor, Mat};

/// Value of one argument (or of the node itself) during a kernel call.
#[derive(Debug, Clone, Copy)]
pub struct Arg<'a> {
    /// Shape
    pub dim: Dim,
    /// `dim.total()` values
    pub data: &'a [f32],
}

impl<'a> Arg<'a> {
    /// View of `data` shaped as `dim`.
    #[must_use]
    pub const fn new(dim: Dim, data: &'a [f32]) -> Arg<'a> {
        Arg { dim, data }
    }

    /// Values of batch element `b`, or of the only element when not batched.
    fn batch(&self, b: usize) -> &'a [f32] {
        let size = self.dim.size();
        let b = if self.dim.bd() == 1 { 0 } else { b };
        &self.data[b * size..(b + 1) * size]
    }
}

fn broadcast(exec: &Executor<'_>, x: Arg<'_>, to: Dim) -> Vec<f32> {
    let map = BroadcastMap::new(x.dim, to);
    if map.is_identity() {
        return x.data.to_vec();
    }
    exec.generate(to.total(), |i| x.data[map.index(i)])
}

fn add_into(exec: &Executor<'_>, acc: &mut Vec<f32>, dim: Dim, x: Arg<'_>) {
    let sum = exec.broadcast_zip(dim, (acc.as_slice(), dim), (x.data, x.dim), |a, b| a + b);
    *acc = sum;
}

/// `a · b` for batched operands, result laid out as `out`.
fn matmul(exec: &Executor<'_>, a: Arg<'_>, b: Arg<'_>, out: Dim) -> Vec<f32> {
    let (m, k, n) = (a.dim.rows(), a.dim.cols(), b.dim.cols());
    if a.dim.bd() == 1 && n == 1 {
        // one product for the whole batch: (bd x k) · (k x m) gives batch-major rows
        return exec.gemm(Mat::new(b.data, b.dim.bd(), k), Mat::new(a.data, m, k).t());
    }
    let mut res = Vec::with_capacity(out.total());
    for bi in 0..out.bd() {
        res.extend(exec.gemm(Mat::new(a.batch(bi), m, k), Mat::new(b.batch(bi), k, n)));
    }
    res
}

/// Contribution of `g = d(a · b)` to `a`.
fn matmul_grad_a(exec: &Executor<'_>, a: Arg<'_>, b: Arg<'_>, g: Arg<'_>) -> Vec<f32> {
    let (m, k, n) = (a.dim.rows(), a.dim.cols(), b.dim.cols());
    if a.dim.bd() == 1 && n == 1 {
        // sum over the batch of g_b x_b^T = G^T (m x bd) · B (bd x k)
        let bd = g.dim.bd();
        let bmat = broadcast(exec, b, b.dim.with_bd(bd));
        return exec.gemm(Mat::new(g.data, bd, m).t(), Mat::new(&bmat, bd, k));
    }
    let mut res = vec![0.0; a.dim.total()];
    for bi in 0..g.dim.bd() {
        let da = exec.gemm(Mat::new(g.batch(bi), m, n), Mat::new(b.batch(bi), k, n).t());
        let off = if a.dim.bd() == 1 { 0 } else { bi * m * k };
        res[off..off + m * k].iter_mut().zip(&da).for_each(|(r, d)| *r += d);
    }
    res
}

/// Contribution of `g = d(a · b)` to `b`.
fn matmul_grad_b(exec: &Executor<'_>, a: Arg<'_>, b: Arg<'_>, g: Arg<'_>) -> Vec<f32> {
    let (m, k, n) = (a.dim.rows(), a.dim.cols(), b.dim.cols());
    if a.dim.bd() == 1 && n == 1 && b.dim.bd() == g.dim.bd() {
        // G (bd x m) · A (m x k)
        return exec.gemm(Mat::new(g.data, g.dim.bd(), m), Mat::new(a.data, m, k));
    }
    let mut res = vec![0.0; b.dim.total()];
    for bi in 0..g.dim.bd() {
        let db = exec.gemm(Mat::new(a.batch(bi), m, k).t(), Mat::new(g.batch(bi), m, n));
        let off = if b.dim.bd() == 1 { 0 } else { bi * k * n };
        res[off..off + k * n].iter_mut().zip(&db).for_each(|(r, d)| *r += d);
    }
    res
}

fn per_batch(out_bd: usize, f: impl Fn(usize) -> Vec<f32>) -> Vec<f32> {
    (0..out_bd).flat_map(f).collect()
}

impl Op {
    /// Computes the node value from argument values.
    ///
    /// Source ops other than `Input` read model storage and are evaluated
    /// by the graph directly.
    #[must_use]
    pub fn forward(&self, exec: &Executor<'_>, xs: &[Arg<'_>], dim: Dim) -> Vec<f32> {
        match self {
            Op::Input { data, .. } => data.clone(),
            Op::Parameter(_) | Op::ConstParameter(_) | Op::Lookup { .. } => {
                unreachable!("{} is evaluated from model storage", self.name())
            }
            Op::Sum => {
                let mut acc = broadcast(exec, xs[0], dim);
                for x in &xs[1..] {
                    add_into(exec, &mut acc, dim, *x);
                }
                acc
            }
            Op::Sub => exec.broadcast_zip(dim, (xs[0].data, xs[0].dim), (xs[1].data, xs[1].dim), |a, b| a - b),
            Op::CwiseMultiply => {
                exec.broadcast_zip(dim, (xs[0].data, xs[0].dim), (xs[1].data, xs[1].dim), |a, b| a * b)
            }
            Op::CwiseQuotient => {
                exec.broadcast_zip(dim, (xs[0].data, xs[0].dim), (xs[1].data, xs[1].dim), |a, b| a / b)
            }
            Op::Pow => {
                let p = xs[1].data[0];
                exec.map(xs[0].data, |x| x.powf(p))
            }
            Op::Negate => exec.map(xs[0].data, |x| -x),
            Op::MatrixMultiply => matmul(exec, xs[0], xs[1], dim),
            Op::AffineTransform => {
                let mut acc = broadcast(exec, xs[0], dim);
                for pair in xs[1..].chunks(2) {
                    let prod_dim = Dim::batched(&[pair[0].dim.rows(), pair[1].dim.cols()], pair[0].dim.bd().max(pair[1].dim.bd()));
                    let prod = matmul(exec, pair[0], pair[1], prod_dim);
                    add_into(exec, &mut acc, dim, Arg::new(prod_dim, &prod));
                }
                acc
            }
            Op::Tanh => exec.map(xs[0].data, f32::tanh),
            Op::Logistic => exec.map(xs[0].data, |x| 1.0 / (1.0 + (-x).exp())),
            Op::Rectify => exec.map(xs[0].data, |x| x.max(0.0)),
            Op::Exp => exec.map(xs[0].data, f32::exp),
            Op::Log => exec.map(xs[0].data, f32::ln),
            Op::Square => exec.map(xs[0].data, |x| x * x),
            Op::Sqrt => exec.map(xs[0].data, f32::sqrt),
            Op::SumElements => {
                let x = xs[0];
                let size = x.dim.size();
                exec.generate(x.dim.bd(), |b| x.data[b * size..(b + 1) * size].iter().sum())
            }
            Op::SumBatches => {
                let x = xs[0];
                let size = x.dim.size();
                exec.generate(size, |i| (0..x.dim.bd()).map(|b| x.data[b * size + i]).sum())
            }
            Op::LogSoftmax => per_batch(dim.bd(), |b| {
                let x = xs[0].batch(b);
                let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let lse = max + x.iter().map(|v| (v - max).exp()).sum::<f32>().ln();
                x.iter().map(|v| v - lse).collect()
            }),
            Op::PickElement { indices } => (0..dim.bd())
                .map(|b| {
                    let idx = indices[if indices.len() == 1 { 0 } else { b }];
                    xs[0].batch(b)[idx]
                })
                .collect(),
            Op::SquaredDistance => per_batch(dim.bd(), |b| {
                let (x, y) = (xs[0].batch(b), xs[1].batch(b));
                vec![x.iter().zip(y).map(|(a, c)| (a - c) * (a - c)).sum()]
            }),
            Op::Concatenate => per_batch(dim.bd(), |b| xs.iter().flat_map(|x| x.batch(b).iter().copied()).collect()),
            Op::Reshape(_) | Op::ToDevice => xs[0].data.to_vec(),
        }
    }

    /// Contribution of the node's gradient `dedf` to argument `i`.
    ///
    /// The returned vector has `xs[i].dim.total()` elements and is meant to
    /// be added into that argument's gradient.
    #[must_use]
    pub fn backward(&self, exec: &Executor<'_>, xs: &[Arg<'_>], fx: Arg<'_>, dedf: Arg<'_>, i: usize) -> Vec<f32> {
        let g = dedf.data;
        let xi = xs[i];
        match self {
            Op::Input { .. } | Op::Parameter(_) | Op::ConstParameter(_) | Op::Lookup { .. } => {
                unreachable!("{} has no arguments", self.name())
            }
            Op::Sum | Op::ToDevice | Op::Reshape(_) => exec.reduce_to(g, dedf.dim, xi.dim),
            Op::Sub => {
                let r = exec.reduce_to(g, dedf.dim, xi.dim);
                if i == 0 {
                    r
                } else {
                    exec.map(&r, |v| -v)
                }
            }
            Op::Negate => exec.map(g, |v| -v),
            Op::CwiseMultiply => {
                let other = xs[1 - i];
                let other = BroadcastMap::new(other.dim, dedf.dim);
                let prod = exec.generate(dedf.dim.total(), |j| g[j] * xs[1 - i].data[other.index(j)]);
                exec.reduce_to(&prod, dedf.dim, xi.dim)
            }
            Op::CwiseQuotient => {
                let ym = BroadcastMap::new(xs[1].dim, dedf.dim);
                let y = xs[1].data;
                let d = if i == 0 {
                    exec.generate(dedf.dim.total(), |j| g[j] / y[ym.index(j)])
                } else {
                    exec.generate(dedf.dim.total(), |j| -g[j] * fx.data[j] / y[ym.index(j)])
                };
                exec.reduce_to(&d, dedf.dim, xi.dim)
            }
            Op::Pow => {
                let p = xs[1].data[0];
                let x = xs[0].data;
                if i == 0 {
                    exec.generate(x.len(), |j| g[j] * p * x[j].powf(p - 1.0))
                } else {
                    vec![exec.sum(&exec.generate(x.len(), |j| g[j] * fx.data[j] * x[j].ln()))]
                }
            }
            Op::MatrixMultiply => {
                if i == 0 {
                    matmul_grad_a(exec, xs[0], xs[1], dedf)
                } else {
                    matmul_grad_b(exec, xs[0], xs[1], dedf)
                }
            }
            Op::AffineTransform => {
                if i == 0 {
                    return exec.reduce_to(g, dedf.dim, xi.dim);
                }
                let (w, x) = if i % 2 == 1 { (xs[i], xs[i + 1]) } else { (xs[i - 1], xs[i]) };
                let prod_dim = Dim::batched(&[w.dim.rows(), x.dim.cols()], w.dim.bd().max(x.dim.bd()));
                let gp = exec.reduce_to(g, dedf.dim, prod_dim);
                let gp = Arg::new(prod_dim, &gp);
                if i % 2 == 1 {
                    matmul_grad_a(exec, w, x, gp)
                } else {
                    matmul_grad_b(exec, w, x, gp)
                }
            }
            Op::Tanh => exec.zip(fx.data, g, |f, g| g * (1.0 - f * f)),
            Op::Logistic => exec.zip(fx.data, g, |f, g| g * f * (1.0 - f)),
            Op::Rectify => exec.zip(xi.data, g, |x, g| if x > 0.0 { g } else { 0.0 }),
            Op::Exp => exec.zip(fx.data, g, |f, g| g * f),
            Op::Log => exec.zip(xi.data, g, |x, g| g / x),
            Op::Square => exec.zip(xi.data, g, |x, g| 2.0 * x * g),
            Op::Sqrt => exec.zip(fx.data, g, |f, g| g / (2.0 * f)),
            Op::SumElements => {
                let size = xi.dim.size();
                exec.generate(xi.dim.total(), |j| g[j / size])
            }
            Op::SumBatches => {
                let size = xi.dim.size();
                exec.generate(xi.dim.total(), |j| g[j % size])
            }
            Op::LogSoftmax => per_batch(dedf.dim.bd(), |b| {
                let (f, gb) = (fx.batch(b), dedf.batch(b));
                let total: f32 = gb.iter().sum();
                f.iter().zip(gb).map(|(f, g)| g - f.exp() * total).collect()
            }),
            Op::PickElement { indices } => {
                let size = xi.dim.size();
                let mut res = vec![0.0; xi.dim.total()];
                for (b, gb) in g.iter().enumerate() {
                    let idx = indices[if indices.len() == 1 { 0 } else { b }];
                    let xb = if xi.dim.bd() == 1 { 0 } else { b };
                    res[xb * size + idx] += gb;
                }
                res
            }
            Op::SquaredDistance => {
                let sign = if i == 0 { 2.0 } else { -2.0 };
                let full = xi.dim.with_bd(dedf.dim.bd());
                let d = per_batch(full.bd(), |b| {
                    let (x, y) = (xs[0].batch(b), xs[1].batch(b));
                    x.iter().zip(y).map(|(a, c)| sign * (a - c) * g[b]).collect()
                });
                exec.reduce_to(&d, full, xi.dim)
            }
            Op::Concatenate => {
                let offset: usize = xs[..i].iter().map(|x| x.dim.size()).sum();
                let size = xi.dim.size();
                let per_elem = dedf.dim.size();
                let full = xi.dim.with_bd(dedf.dim.bd());
                let d = per_batch(full.bd(), |b| g[b * per_elem + offset..b * per_elem + offset + size].to_vec());
                exec.reduce_to(&d, full, xi.dim)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Arg;
    use crate::node::Op;
    use approx::assert_relative_eq;
    use dyngraph_core::{Dim, Executor};

    #[test]
    fn batched_matvec_matches_per_column() {
        let exec = Executor::host();
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let x = [1.0, 0.0, 0.0, 1.0];
        let (wd, xd) = (Dim::new(&[3, 2]), Dim::batched(&[2], 2));
        let out = Op::MatrixMultiply.forward(&exec, &[Arg::new(wd, &w), Arg::new(xd, &x)], Dim::batched(&[3], 2));
        assert_eq!(out, vec![1.0, 3.0, 5.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn log_softmax_gradient_sums_to_zero() {
        let exec = Executor::host();
        let d = Dim::new(&[3]);
        let x = [0.5, -1.0, 2.0];
        let f = Op::LogSoftmax.forward(&exec, &[Arg::new(d, &x)], d);
        let total: f32 = f.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-6);
        let g = [1.0, 1.0, 1.0];
        let dx = Op::LogSoftmax.backward(&exec, &[Arg::new(d, &x)], Arg::new(d, &f), Arg::new(d, &g), 0);
        assert_relative_eq!(dx.iter().sum::<f32>(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn concatenate_splits_gradient() {
        let exec = Executor::host();
        let (a, b) = (Dim::new(&[2]), Dim::new(&[1]));
        let out = Dim::new(&[3]);
        let xs = [Arg::new(a, &[1.0, 2.0]), Arg::new(b, &[3.0])];
        let f = Op::Concatenate.forward(&exec, &xs, out);
        assert_eq!(f, vec![1.0, 2.0, 3.0]);
        let g = [0.1, 0.2, 0.3];
        let fx = Arg::new(out, &f);
        assert_eq!(Op::Concatenate.backward(&exec, &xs, fx, Arg::new(out, &g), 1), vec![0.3]);
        assert_eq!(Op::Concatenate.backward(&exec, &xs, fx, Arg::new(out, &g), 0), vec![0.1, 0.2]);
    }
}
