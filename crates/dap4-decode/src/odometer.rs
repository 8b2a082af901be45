//! Multi-dimensional index generation.
//!
//! An [`Odometer`] walks the Cartesian product of per-dimension slices in
//! row-major order (last dimension fastest), yielding flat indices into a
//! variable's full shape. It is the single addressing primitive behind
//! both compile-time element iteration and read-time slicing.

use crate::error::{DecodeError, DecodeResult};

/// One dimension's worth of selected indices.
///
/// The two flavors are interchangeable anywhere a slice is accepted: a
/// rectangular `Span` described by start/stop/stride, or an explicit
/// enumerated index `Set`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slice {
    /// Half-open range `[start, stop)` with a positive stride.
    Span { start: u64, stop: u64, stride: u64 },
    /// Explicitly enumerated indices, walked in the given order.
    Set(Vec<u64>),
}

impl Slice {
    /// The slice selecting every index of a dimension of extent `n`.
    pub fn all(n: u64) -> Self {
        Slice::Span {
            start: 0,
            stop: n,
            stride: 1,
        }
    }

    /// The slice selecting the single index `i`.
    pub fn single(i: u64) -> Self {
        Slice::Span {
            start: i,
            stop: i + 1,
            stride: 1,
        }
    }

    /// Number of indices this slice selects.
    pub fn count(&self) -> u64 {
        match self {
            Slice::Span {
                start,
                stop,
                stride,
            } => {
                if stop <= start || *stride == 0 {
                    0
                } else {
                    // ceiling division written without an overflowable sum
                    (stop - start - 1) / stride + 1
                }
            }
            Slice::Set(v) => v.len() as u64,
        }
    }

    /// The dimension index of the `k`-th selected point.
    fn point(&self, k: u64) -> u64 {
        match self {
            Slice::Span { start, stride, .. } => start + k * stride,
            Slice::Set(v) => v[k as usize],
        }
    }

    /// Largest dimension index this slice can produce, if it is nonempty.
    fn max_point(&self) -> Option<u64> {
        let n = self.count();
        if n == 0 {
            return None;
        }
        match self {
            Slice::Span { .. } => Some(self.point(n - 1)),
            Slice::Set(v) => v.iter().copied().max(),
        }
    }
}

/// Lazy row-major walker over a set of per-dimension slices.
///
/// A zero-rank (scalar) odometer degenerates to a single-element sequence
/// yielding flat index 0.
#[derive(Debug, Clone)]
pub struct Odometer {
    slices: Vec<Slice>,
    shape: Vec<u64>,
    /// Ordinal position within each slice (not the dimension index).
    cursors: Vec<u64>,
    counts: Vec<u64>,
    done: bool,
}

impl Odometer {
    /// Build an odometer over `slices`, validated against the variable's
    /// full `shape` (rank agreement and per-dimension bounds).
    pub fn new(slices: Vec<Slice>, shape: &[u64]) -> DecodeResult<Self> {
        if slices.len() != shape.len() {
            return Err(DecodeError::SchemaMismatch(format!(
                "slice rank {} does not match variable rank {}",
                slices.len(),
                shape.len()
            )));
        }
        for (i, s) in slices.iter().enumerate() {
            if let Slice::Span { stride, .. } = s {
                if *stride == 0 {
                    return Err(DecodeError::SchemaMismatch(format!(
                        "dimension {i}: stride must be nonzero"
                    )));
                }
            }
            if let Some(max) = s.max_point() {
                if max >= shape[i] {
                    return Err(DecodeError::SchemaMismatch(format!(
                        "dimension {i}: index {max} out of bounds for extent {}",
                        shape[i]
                    )));
                }
            }
        }
        let counts: Vec<u64> = slices.iter().map(Slice::count).collect();
        if counts
            .iter()
            .try_fold(1u64, |acc, &c| acc.checked_mul(c))
            .is_none()
        {
            return Err(DecodeError::SchemaMismatch(
                "selection size overflows a 64-bit index".into(),
            ));
        }
        let done = counts.iter().any(|&c| c == 0);
        Ok(Self {
            cursors: vec![0; slices.len()],
            shape: shape.to_vec(),
            slices,
            counts,
            done,
        })
    }

    /// Odometer over every point of `shape`, in flat order.
    pub fn full(shape: &[u64]) -> DecodeResult<Self> {
        let slices = shape.iter().map(|&n| Slice::all(n)).collect();
        Self::new(slices, shape)
    }

    /// Total number of points, computed without enumeration.
    pub fn total_size(&self) -> u64 {
        self.counts.iter().product()
    }

    pub fn has_next(&self) -> bool {
        !self.done
    }

    /// Flat row-major index for the current per-dimension positions.
    fn flat_index(&self) -> u64 {
        let mut flat = 0u64;
        for (i, s) in self.slices.iter().enumerate() {
            flat = flat * self.shape[i] + s.point(self.cursors[i]);
        }
        flat
    }

    /// Advance the rightmost dimension, carrying leftward.
    fn advance(&mut self) {
        for i in (0..self.cursors.len()).rev() {
            self.cursors[i] += 1;
            if self.cursors[i] < self.counts[i] {
                return;
            }
            self.cursors[i] = 0;
        }
        self.done = true;
    }
}

impl Iterator for Odometer {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.done {
            return None;
        }
        let flat = self.flat_index();
        if self.cursors.is_empty() {
            // Scalar case: one point, flat index 0.
            self.done = true;
        } else {
            self.advance();
        }
        Some(flat)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            // Upper bound only; points already consumed are not tracked.
            (1, Some(self.total_size() as usize))
        }
    }
}
