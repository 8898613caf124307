use core::fmt::{Display, Formatter};

/// Maximum number of axes a [`Dim`] can carry.
pub const MAX_DIMS: usize = 7;

/// Shape of a tensor: up to [`MAX_DIMS`] axis sizes plus a batch multiplicity.
///
/// Axes past `nd` are stored as 1, so two dims that differ only in trailing
/// unit axes still compare unequal through `nd`, but broadcast against each
/// other without any padding.
///
/// Data is laid out row-major within one batch element, and batch elements
/// are stored as consecutive blocks of [`Dim::size`] floats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Dim {
    d: [usize; MAX_DIMS],
    nd: usize,
    bd: usize,
}

impl Dim {
    /// Dim with the given axes and a single batch element.
    ///
    /// # Panics
    /// Panics if more than [`MAX_DIMS`] axes are given.
    #[must_use]
    pub fn new(axes: &[usize]) -> Dim {
        Dim::batched(axes, 1)
    }

    /// Dim with the given axes and `bd` batch elements.
    ///
    /// # Panics
    /// Panics if more than [`MAX_DIMS`] axes are given or `bd` is zero.
    #[must_use]
    pub fn batched(axes: &[usize], bd: usize) -> Dim {
        assert!(
            axes.len() <= MAX_DIMS,
            "Dim supports at most {MAX_DIMS} axes, got {}",
            axes.len()
        );
        assert!(bd > 0, "batch multiplicity must be at least 1");
        let mut d = [1; MAX_DIMS];
        d[..axes.len()].copy_from_slice(axes);
        Dim {
            d,
            nd: axes.len(),
            bd,
        }
    }

    /// Single scalar, `{1}`.
    #[must_use]
    pub const fn scalar() -> Dim {
        Dim {
            d: [1; MAX_DIMS],
            nd: 1,
            bd: 1,
        }
    }

    /// Number of axes
    #[must_use]
    pub const fn nd(&self) -> usize {
        self.nd
    }

    /// Batch multiplicity
    #[must_use]
    pub const fn bd(&self) -> usize {
        self.bd
    }

    /// Axis sizes
    #[must_use]
    pub fn axes(&self) -> &[usize] {
        &self.d[..self.nd]
    }

    /// Size of axis `i`, 1 for axes past `nd`.
    #[must_use]
    pub fn get(&self, i: usize) -> usize {
        self.d.get(i).copied().unwrap_or(1)
    }

    /// Number of elements in one batch element.
    #[must_use]
    pub fn size(&self) -> usize {
        self.d[..self.nd].iter().product()
    }

    /// Number of elements across all batch elements.
    #[must_use]
    pub fn total(&self) -> usize {
        self.size() * self.bd
    }

    /// First axis.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.d[0]
    }

    /// Second axis, 1 for vectors.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.d[1]
    }

    /// Same axes, one batch element.
    #[must_use]
    pub const fn single_batch(&self) -> Dim {
        self.with_bd(1)
    }

    /// Same axes, `bd` batch elements.
    #[must_use]
    pub const fn with_bd(&self, bd: usize) -> Dim {
        Dim {
            d: self.d,
            nd: self.nd,
            bd,
        }
    }

    /// Drops trailing unit axes, keeping at least one.
    #[must_use]
    pub fn truncate(&self) -> Dim {
        let mut out = *self;
        while out.nd > 1 && out.d[out.nd - 1] == 1 {
            out.nd -= 1;
        }
        out
    }

    /// Swaps the first two axes.
    #[must_use]
    pub fn transpose(&self) -> Dim {
        let mut out = *self;
        out.d.swap(0, 1);
        out.nd = out.nd.max(2);
        out.truncate()
    }

    /// True when the axes (ignoring batch) are equal after truncation.
    #[must_use]
    pub fn same_shape(&self, other: &Dim) -> bool {
        self.single_batch().truncate() == other.single_batch().truncate()
    }

    /// Result of broadcasting two dims elementwise, if they are compatible.
    ///
    /// Per axis sizes must be equal or one of them 1, and the batch
    /// multiplicities must be equal or one of them 1.
    #[must_use]
    pub fn broadcast(&self, other: &Dim) -> Option<Dim> {
        let bd = match (self.bd, other.bd) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            _ => return None,
        };
        let nd = self.nd.max(other.nd);
        let mut d = [1; MAX_DIMS];
        for (i, out) in d.iter_mut().enumerate().take(nd) {
            *out = match (self.d[i], other.d[i]) {
                (a, b) if a == b => a,
                (1, b) => b,
                (a, 1) => a,
                _ => return None,
            };
        }
        Some(Dim { d, nd, bd })
    }

    /// See [`Dim::broadcast`].
    #[must_use]
    pub fn is_compatible(&self, other: &Dim) -> bool {
        self.broadcast(other).is_some()
    }

    /// Row-major strides of one batch element, 0 on axes of size 1.
    ///
    /// Broadcasting kernels read through these, so a unit axis repeats.
    #[must_use]
    pub fn broadcast_strides(&self) -> [usize; MAX_DIMS] {
        let mut strides = [0; MAX_DIMS];
        let mut acc = 1;
        for i in (0..MAX_DIMS).rev() {
            strides[i] = if self.d[i] == 1 { 0 } else { acc };
            acc *= self.d[i];
        }
        strides
    }
}

impl Default for Dim {
    fn default() -> Self {
        Dim::scalar()
    }
}

impl From<&[usize]> for Dim {
    fn from(axes: &[usize]) -> Self {
        Dim::new(axes)
    }
}

impl<const N: usize> From<[usize; N]> for Dim {
    fn from(axes: [usize; N]) -> Self {
        Dim::new(&axes)
    }
}

impl Display for Dim {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("{")?;
        for (i, d) in self.axes().iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("}")?;
        if self.bd > 1 {
            write!(f, "X{}", self.bd)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Dim;

    #[test]
    fn size_and_total() {
        let d = Dim::batched(&[3, 2], 4);
        assert_eq!(d.size(), 6);
        assert_eq!(d.total(), 24);
        assert_eq!(d.rows(), 3);
        assert_eq!(d.cols(), 2);
        assert_eq!(Dim::new(&[5]).cols(), 1);
        assert_eq!(d.to_string(), "{3,2}X4");
    }

    #[test]
    fn broadcasting() {
        let a = Dim::new(&[3, 1]);
        let b = Dim::batched(&[3, 4], 2);
        assert_eq!(a.broadcast(&b), Some(Dim::batched(&[3, 4], 2)));
        assert!(!Dim::new(&[3]).is_compatible(&Dim::new(&[2])));
        assert!(!Dim::batched(&[3], 2).is_compatible(&Dim::batched(&[3], 3)));
        // vector against matrix with an implicit trailing unit axis
        assert_eq!(
            Dim::new(&[3]).broadcast(&Dim::new(&[3, 2])),
            Some(Dim::new(&[3, 2]))
        );
    }

    #[test]
    fn transpose_truncates() {
        assert_eq!(Dim::new(&[3]).transpose(), Dim::new(&[1, 3]));
        assert_eq!(Dim::new(&[1, 3]).transpose(), Dim::new(&[3]));
        assert!(Dim::new(&[3, 1]).same_shape(&Dim::batched(&[3], 2)));
    }

    #[test]
    fn strides() {
        let s = Dim::new(&[3, 1, 2]).broadcast_strides();
        assert_eq!(&s[..3], &[2, 0, 1]);
    }
}
