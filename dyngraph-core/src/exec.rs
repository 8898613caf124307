//! Execution back ends.
//!
//! Every operation is written once against [`Executor`]; the device's
//! [`Backend`] token decides whether the primitives run as plain loops on the
//! calling thread or data parallel on the device's worker pool.

use crate::dim::{Dim, MAX_DIMS};
use core::marker::PhantomData;
#[cfg(feature = "std")]
use rayon::prelude::*;

/// Capability token selecting the execution path of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Sequential kernels on the calling thread.
    Host,
    /// Data parallel kernels on the device's own worker pool.
    Accelerator,
}

/// Kernel launcher bound to one device.
#[derive(Clone, Copy)]
pub struct Executor<'a> {
    backend: Backend,
    #[cfg(feature = "std")]
    pool: Option<&'a rayon::ThreadPool>,
    _device: PhantomData<&'a ()>,
}

impl core::fmt::Debug for Executor<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Executor")
            .field("backend", &self.backend)
            .finish()
    }
}

/// Row-major matrix operand, optionally read transposed.
#[derive(Debug, Clone, Copy)]
pub struct Mat<'a> {
    /// Stored elements, `rows * cols` of them
    pub data: &'a [f32],
    /// Stored rows
    pub rows: usize,
    /// Stored columns
    pub cols: usize,
    /// Read as the transpose of the stored matrix
    pub trans: bool,
}

impl<'a> Mat<'a> {
    /// Matrix read as stored.
    #[must_use]
    pub const fn new(data: &'a [f32], rows: usize, cols: usize) -> Mat<'a> {
        Mat {
            data,
            rows,
            cols,
            trans: false,
        }
    }

    /// Same storage read transposed.
    #[must_use]
    pub const fn t(self) -> Mat<'a> {
        Mat {
            trans: !self.trans,
            ..self
        }
    }

    /// Logical rows
    #[must_use]
    pub const fn m(&self) -> usize {
        if self.trans {
            self.cols
        } else {
            self.rows
        }
    }

    /// Logical columns
    #[must_use]
    pub const fn n(&self) -> usize {
        if self.trans {
            self.rows
        } else {
            self.cols
        }
    }

    #[inline]
    fn at(&self, r: usize, c: usize) -> f32 {
        if self.trans {
            self.data[c * self.cols + r]
        } else {
            self.data[r * self.cols + c]
        }
    }
}

/// Offset into a broadcast operand for element `e` of one output batch element.
#[inline]
fn broadcast_offset(e: usize, out: &Dim, strides: &[usize; MAX_DIMS]) -> usize {
    let mut rem = e;
    let mut offset = 0;
    for k in (0..MAX_DIMS).rev() {
        let n = out.get(k);
        offset += (rem % n) * strides[k];
        rem /= n;
    }
    offset
}

/// Maps a flat index of `out` to the flat index of `x` broadcast into it.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastMap {
    out: Dim,
    x: Dim,
    strides: [usize; MAX_DIMS],
}

impl BroadcastMap {
    /// Index map from `out` back to `x`. `x` must be broadcast compatible with `out`.
    #[must_use]
    pub fn new(x: Dim, out: Dim) -> BroadcastMap {
        BroadcastMap {
            out,
            x,
            strides: x.broadcast_strides(),
        }
    }

    /// True when the map is the identity.
    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.x.size() == self.out.size() && self.x.bd() == self.out.bd()
    }

    /// Index into `x` for flat output index `i`.
    #[inline]
    #[must_use]
    pub fn index(&self, i: usize) -> usize {
        let size = self.out.size();
        let batch = if self.x.bd() == 1 { 0 } else { i / size };
        batch * self.x.size() + broadcast_offset(i % size, &self.out, &self.strides)
    }
}

impl<'a> Executor<'a> {
    /// Executor running sequentially on the calling thread.
    #[must_use]
    pub const fn host() -> Executor<'static> {
        Executor {
            backend: Backend::Host,
            #[cfg(feature = "std")]
            pool: None,
            _device: PhantomData,
        }
    }

    #[cfg(feature = "std")]
    pub(crate) fn accelerator(pool: Option<&'a rayon::ThreadPool>) -> Executor<'a> {
        Executor {
            backend: Backend::Accelerator,
            pool,
            _device: PhantomData,
        }
    }

    /// Back end this executor dispatches to
    #[must_use]
    pub const fn backend(&self) -> Backend {
        self.backend
    }

    /// `out[i] = f(i)` for `i in 0..len`.
    pub fn generate(&self, len: usize, f: impl Fn(usize) -> f32 + Sync + Send) -> Vec<f32> {
        #[cfg(feature = "std")]
        if let (Backend::Accelerator, Some(pool)) = (self.backend, self.pool) {
            return pool.install(|| (0..len).into_par_iter().map(&f).collect());
        }
        (0..len).map(f).collect()
    }

    /// Elementwise `f(x)`.
    pub fn map(&self, x: &[f32], f: impl Fn(f32) -> f32 + Sync + Send) -> Vec<f32> {
        self.generate(x.len(), |i| f(x[i]))
    }

    /// Elementwise `f(a, b)` over equally long slices.
    pub fn zip(&self, a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32 + Sync + Send) -> Vec<f32> {
        debug_assert_eq!(a.len(), b.len());
        self.generate(a.len(), |i| f(a[i], b[i]))
    }

    /// Elementwise `f(a, b)` with both operands broadcast to `out`.
    pub fn broadcast_zip(
        &self,
        out: Dim,
        (a, ad): (&[f32], Dim),
        (b, bd): (&[f32], Dim),
        f: impl Fn(f32, f32) -> f32 + Sync + Send,
    ) -> Vec<f32> {
        let am = BroadcastMap::new(ad, out);
        let bm = BroadcastMap::new(bd, out);
        if am.is_identity() && bm.is_identity() {
            return self.zip(a, b, f);
        }
        self.generate(out.total(), |i| f(a[am.index(i)], b[bm.index(i)]))
    }

    /// Sums `g` (laid out as `from`) down to the broadcast source `to`.
    pub fn reduce_to(&self, g: &[f32], from: Dim, to: Dim) -> Vec<f32> {
        let map = BroadcastMap::new(to, from);
        if map.is_identity() {
            return g.to_vec();
        }
        let mut out = vec![0.0; to.total()];
        for (i, v) in g.iter().enumerate() {
            out[map.index(i)] += v;
        }
        out
    }

    /// Sum of all elements
    #[must_use]
    pub fn sum(&self, x: &[f32]) -> f32 {
        #[cfg(feature = "std")]
        if let (Backend::Accelerator, Some(pool)) = (self.backend, self.pool) {
            return pool.install(|| x.par_iter().sum());
        }
        x.iter().sum()
    }

    /// Sum of squares
    #[must_use]
    pub fn squared_norm(&self, x: &[f32]) -> f32 {
        #[cfg(feature = "std")]
        if let (Backend::Accelerator, Some(pool)) = (self.backend, self.pool) {
            return pool.install(|| x.par_iter().map(|v| v * v).sum());
        }
        x.iter().map(|v| v * v).sum()
    }

    /// Matrix product `a · b`, row-major `a.m() x b.n()` result.
    pub fn gemm(&self, a: Mat<'_>, b: Mat<'_>) -> Vec<f32> {
        debug_assert_eq!(a.n(), b.m());
        let (k, n) = (a.n(), b.n());
        self.generate(a.m() * n, |i| {
            let (r, c) = (i / n, i % n);
            (0..k).map(|t| a.at(r, t) * b.at(t, c)).sum()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{BroadcastMap, Executor, Mat};
    use crate::dim::Dim;

    #[test]
    fn gemm_transposes() {
        let exec = Executor::host();
        // [[1, 2], [3, 4]]
        let a = [1.0, 2.0, 3.0, 4.0];
        let x = [1.0, 1.0];
        assert_eq!(exec.gemm(Mat::new(&a, 2, 2), Mat::new(&x, 2, 1)), vec![3.0, 7.0]);
        assert_eq!(exec.gemm(Mat::new(&a, 2, 2).t(), Mat::new(&x, 2, 1)), vec![4.0, 6.0]);
        assert_eq!(
            exec.gemm(Mat::new(&x, 2, 1).t(), Mat::new(&a, 2, 2)),
            vec![4.0, 6.0]
        );
    }

    #[test]
    fn broadcast_column_over_matrix() {
        let exec = Executor::host();
        let out = Dim::new(&[2, 3]);
        let m = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let col = [10.0, 20.0];
        let y = exec.broadcast_zip(out, (&m, out), (&col, Dim::new(&[2])), |a, b| a + b);
        assert_eq!(y, vec![11.0, 12.0, 13.0, 24.0, 25.0, 26.0]);
        assert_eq!(exec.reduce_to(&y, out, Dim::new(&[2])), vec![36.0, 75.0]);
    }

    #[test]
    fn broadcast_over_batches() {
        let map = BroadcastMap::new(Dim::new(&[2]), Dim::batched(&[2], 3));
        assert_eq!((0..6).map(|i| map.index(i)).collect::<Vec<_>>(), vec![0, 1, 0, 1, 0, 1]);
        let map = BroadcastMap::new(Dim::batched(&[1], 3), Dim::batched(&[2], 3));
        assert_eq!((0..6).map(|i| map.index(i)).collect::<Vec<_>>(), vec![0, 0, 1, 1, 2, 2]);
    }
}
