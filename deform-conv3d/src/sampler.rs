//! # Coordinate Sampler
//!
//! Trilinear interpolation of a single `[T, H, W]` plane at fractional
//! coordinates, its partial derivatives, and the adjoint scatter used to
//! propagate gradients back onto the lattice.
//!
//! Lattice points outside the plane read as zero. Coordinates are never
//! clamped, so a sample at `size - 0.5` blends the last row with the zero
//! padding, and anything at or beyond `size` (or at or below `-1`) is zero.

use crate::element::Element;

/// The eight lattice neighbours of a fractional coordinate.
#[derive(Debug, Clone, Copy)]
struct Cell {
    low: [i64; 3],
    frac: [f64; 3],
}

impl Cell {
    fn locate(coord: [f64; 3]) -> Self {
        let floor = coord.map(f64::floor);
        Self {
            low: floor.map(|f| f as i64),
            frac: [
                coord[0] - floor[0],
                coord[1] - floor[1],
                coord[2] - floor[2],
            ],
        }
    }

    /// Offset of corner `corner` (0..8) from `low` along each axis.
    const fn corner_bits(corner: usize) -> [usize; 3] {
        [(corner >> 2) & 1, (corner >> 1) & 1, corner & 1]
    }

    /// One dimensional interpolation weights of `corner` along each axis.
    fn axis_weights(&self, corner: usize) -> [f64; 3] {
        let bits = Self::corner_bits(corner);
        [0, 1, 2].map(|axis| {
            if bits[axis] == 1 {
                self.frac[axis]
            } else {
                1.0 - self.frac[axis]
            }
        })
    }

    /// Derivative of each one dimensional weight of `corner` with respect to
    /// its own coordinate. Zero on an integer coordinate.
    fn axis_slopes(&self, corner: usize) -> [f64; 3] {
        let bits = Self::corner_bits(corner);
        [0, 1, 2].map(|axis| {
            if self.frac[axis] == 0.0 {
                0.0
            } else if bits[axis] == 1 {
                1.0
            } else {
                -1.0
            }
        })
    }

    /// Linear index of `corner` inside a plane of `dims`, if it lies inside.
    fn index(&self, corner: usize, dims: [usize; 3]) -> Option<usize> {
        let bits = Self::corner_bits(corner);
        let mut linear = 0usize;
        for axis in 0..3 {
            let position = self.low[axis] + bits[axis] as i64;
            if position < 0 || position >= dims[axis] as i64 {
                return None;
            }
            linear = linear * dims[axis] + position as usize;
        }
        Some(linear)
    }
}

/// Whether a sample at `coord` can touch any lattice point of `dims`.
fn overlaps(coord: [f64; 3], dims: [usize; 3]) -> bool {
    coord
        .iter()
        .zip(dims)
        .all(|(&c, n)| c > -1.0 && c < n as f64)
}

/// A read-only `[T, H, W]` plane.
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a, F> {
    data: &'a [F],
    dims: [usize; 3],
}

impl<'a, F: Element> Plane<'a, F> {
    /// Wraps `data` laid out row-major over `dims`.
    pub(crate) fn new(data: &'a [F], dims: [usize; 3]) -> Self {
        debug_assert_eq!(data.len(), dims.iter().product::<usize>());
        Self { data, dims }
    }

    pub const fn dims(&self) -> [usize; 3] {
        self.dims
    }

    /// Interpolated value at `coord = [t, h, w]`.
    pub fn sample(&self, coord: [f64; 3]) -> f64 {
        if !overlaps(coord, self.dims) {
            return 0.0;
        }
        let cell = Cell::locate(coord);
        (0..8)
            .filter_map(|corner| {
                let index = cell.index(corner, self.dims)?;
                let [wt, wh, ww] = cell.axis_weights(corner);
                Some(wt * wh * ww * self.data[index].as_f64())
            })
            .sum()
    }

    /// Interpolated value at `coord` together with its partial derivatives
    /// with respect to `t`, `h` and `w`.
    pub fn sample_and_gradient(&self, coord: [f64; 3]) -> (f64, [f64; 3]) {
        if !overlaps(coord, self.dims) {
            return (0.0, [0.0; 3]);
        }
        let cell = Cell::locate(coord);
        let mut value = 0.0;
        let mut gradient = [0.0; 3];
        for corner in 0..8 {
            let Some(index) = cell.index(corner, self.dims) else {
                continue;
            };
            let v = self.data[index].as_f64();
            let [wt, wh, ww] = cell.axis_weights(corner);
            let [st, sh, sw] = cell.axis_slopes(corner);
            value += wt * wh * ww * v;
            gradient[0] += st * wh * ww * v;
            gradient[1] += wt * sh * ww * v;
            gradient[2] += wt * wh * sw * v;
        }
        (value, gradient)
    }
}

/// A writable `[T, H, W]` plane of `f64` accumulators.
#[derive(Debug)]
pub struct PlaneMut<'a> {
    data: &'a mut [f64],
    dims: [usize; 3],
}

impl<'a> PlaneMut<'a> {
    pub(crate) fn new(data: &'a mut [f64], dims: [usize; 3]) -> Self {
        debug_assert_eq!(data.len(), dims.iter().product::<usize>());
        Self { data, dims }
    }

    /// Adds `value` to the lattice neighbours of `coord`, each scaled by its
    /// interpolation weight. This is the transpose of [`Plane::sample`].
    pub fn scatter(&mut self, coord: [f64; 3], value: f64) {
        if !overlaps(coord, self.dims) {
            return;
        }
        let cell = Cell::locate(coord);
        for corner in 0..8 {
            if let Some(index) = cell.index(corner, self.dims) {
                let [wt, wh, ww] = cell.axis_weights(corner);
                self.data[index] += wt * wh * ww * value;
            }
        }
    }
}
