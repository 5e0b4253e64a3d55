//! 2-D resampling of a scalar field at fractional coordinates.
//!
//! Every warp and every gradient lookup in the crate goes through
//! [`Resampler`]. Query coordinates are `(x, y)` = (column, row). Callers state
//! the index origin of their coordinates with [`IndexOrigin`]; the shift to
//! zero-based indexing happens here and nowhere else.
//!
//! With [`Boundary::Nan`] a query outside `[0, w-1] × [0, h-1]` yields `NaN`.
//! The other boundaries extend the field and never produce `NaN`.

use crate::QbpError;
use crate::plane::Plane;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpMethod {
    Nearest,
    Linear,
    /// Cubic convolution, kernel parameter `a = -0.5`.
    Cubic,
}

impl FromStr for InterpMethod {
    type Err = QbpError;

    /// ```
    /// # use libqbp::resample::InterpMethod;
    /// assert_eq!("bi-linear".parse::<InterpMethod>().unwrap(), InterpMethod::Linear);
    /// assert!("spline".parse::<InterpMethod>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Ok(InterpMethod::Nearest),
            "linear" | "bilinear" | "bi-linear" => Ok(InterpMethod::Linear),
            "cubic" | "bicubic" => Ok(InterpMethod::Cubic),
            _ => Err(QbpError::UnknownMethod(s.to_string())),
        }
    }
}

/// Edge handling for samples that fall outside the field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Boundary {
    /// Out-of-domain queries return `NaN`. Cubic samples close to the edge use
    /// the cubic convolution end conditions.
    Nan,
    /// Pad with a constant value.
    Constant(f64),
    /// Mirror about the edge sample, which is not repeated (`c b | a b c`).
    Reflect,
    /// Mirror about the pixel edge, repeating the edge sample (`b a | a b c`).
    Symmetric,
    Periodic,
    /// Repeat the edge sample.
    Clamp,
}

impl Boundary {
    /// Map an integer index onto `0..n`; `None` selects the constant pad.
    #[inline]
    fn index(&self, i: i64, n: usize) -> Option<usize> {
        let n_i = n as i64;
        if (0..n_i).contains(&i) {
            return Some(i as usize);
        }
        match *self {
            Boundary::Nan | Boundary::Constant(_) => None,
            Boundary::Clamp => Some(i.clamp(0, n_i - 1) as usize),
            Boundary::Periodic => Some(i.rem_euclid(n_i) as usize),
            Boundary::Reflect => {
                if n == 1 {
                    return Some(0);
                }
                let period = 2 * (n_i - 1);
                let m = i.rem_euclid(period);
                let r = if m >= n_i { period - m } else { m };
                Some(r as usize)
            }
            Boundary::Symmetric => {
                let period = 2 * n_i;
                let m = i.rem_euclid(period);
                let r = if m >= n_i { period - 1 - m } else { m };
                Some(r as usize)
            }
        }
    }

    #[inline]
    fn pad_value(&self) -> f64 {
        match *self {
            Boundary::Constant(c) => c,
            _ => f64::NAN,
        }
    }

    /// `v[(x, y)]` with this boundary applied on both axes.
    #[inline]
    pub(crate) fn fetch(&self, v: &Plane, x: i64, y: i64) -> f64 {
        match (self.index(x, v.width()), self.index(y, v.height())) {
            (Some(xi), Some(yi)) => v.get(xi, yi),
            _ => self.pad_value(),
        }
    }
}

/// Convention of the query coordinates handed to a [`Resampler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexOrigin {
    #[default]
    Zero,
    One,
}

impl IndexOrigin {
    #[inline]
    pub fn offset(self) -> f64 {
        match self {
            IndexOrigin::Zero => 0.0,
            IndexOrigin::One => 1.0,
        }
    }
}

/// The cubic convolution kernel with `a = -0.5`.
#[inline]
pub fn cubic_kernel(s: f64) -> f64 {
    let s = s.abs();
    if s <= 1.0 {
        (1.5 * s - 2.5) * s * s + 1.0
    } else if s < 2.0 {
        ((-0.5 * s + 2.5) * s - 4.0) * s + 2.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resampler {
    pub method: InterpMethod,
    pub boundary: Boundary,
    pub origin: IndexOrigin,
}

impl Resampler {
    pub fn new(method: InterpMethod) -> Self {
        Self {
            method,
            boundary: Boundary::Nan,
            origin: IndexOrigin::Zero,
        }
    }

    pub fn with_boundary(mut self, boundary: Boundary) -> Self {
        self.boundary = boundary;
        self
    }

    pub fn with_origin(mut self, origin: IndexOrigin) -> Self {
        self.origin = origin;
        self
    }

    /// Evaluate `v` at one query point given in this resampler's origin.
    pub fn sample(&self, v: &Plane, x: f64, y: f64) -> f64 {
        let x = x - self.origin.offset();
        let y = y - self.origin.offset();
        if !x.is_finite() || !y.is_finite() || v.is_empty() {
            return f64::NAN;
        }
        if self.boundary == Boundary::Nan {
            let (w, h) = v.size();
            if x < 0.0 || y < 0.0 || x > (w - 1) as f64 || y > (h - 1) as f64 {
                return f64::NAN;
            }
        }
        match self.method {
            InterpMethod::Nearest => self
                .boundary
                .fetch(v, x.round() as i64, y.round() as i64),
            InterpMethod::Linear => self.linear(v, x, y),
            InterpMethod::Cubic => {
                if self.boundary == Boundary::Nan {
                    self.cubic_in_domain(v, x, y)
                } else {
                    self.cubic_padded(v, x, y)
                }
            }
        }
    }

    /// Evaluate `v` at every `(xq, yq)` pair.
    /// ```
    /// # use libqbp::prelude::*;
    /// let v = Plane::from_fn(4, 4, |x, y| (x + 4 * y) as f64);
    /// let xq = Plane::filled(1, 1, 1.5);
    /// let yq = Plane::filled(1, 1, 2.0);
    /// let vq = Resampler::new(InterpMethod::Linear).resample(&v, &xq, &yq).unwrap();
    /// assert!((vq.get(0, 0) - 9.5).abs() < 1e-12);
    /// ```
    pub fn resample(&self, v: &Plane, xq: &Plane, yq: &Plane) -> Result<Plane, QbpError> {
        if !xq.same_size(yq) {
            return Err(QbpError::DimensionMismatch {
                expected: xq.size(),
                got: yq.size(),
            });
        }
        if v.has_nan() {
            return Err(QbpError::InvalidParams(
                "the field to resample contains NaN".to_string(),
            ));
        }
        let (w, h) = xq.size();
        Ok(Plane::from_fn(w, h, |x, y| {
            self.sample(v, xq.get(x, y), yq.get(x, y))
        }))
    }

    fn linear(&self, v: &Plane, x: f64, y: f64) -> f64 {
        let (w, h) = v.size();
        let mut x0 = x.floor() as i64;
        let mut y0 = y.floor() as i64;
        if self.boundary == Boundary::Nan {
            // keep the upper corner inside for queries on the last row/column
            x0 = x0.min(w as i64 - 2).max(0);
            y0 = y0.min(h as i64 - 2).max(0);
        }
        let fx = x - x0 as f64;
        let fy = y - y0 as f64;
        let b = &self.boundary;
        let corner = |dx: i64, dy: i64, weight: f64| {
            if weight == 0.0 {
                0.0
            } else {
                weight * b.fetch(v, x0 + dx, y0 + dy)
            }
        };
        corner(0, 0, (1.0 - fx) * (1.0 - fy))
            + corner(1, 0, fx * (1.0 - fy))
            + corner(0, 1, (1.0 - fx) * fy)
            + corner(1, 1, fx * fy)
    }

    fn cubic_padded(&self, v: &Plane, x: f64, y: f64) -> f64 {
        let x0 = x.floor() as i64;
        let y0 = y.floor() as i64;
        let mut acc = 0.0;
        for n in -1..=2 {
            let wy = cubic_kernel(y - (y0 + n) as f64);
            if wy == 0.0 {
                continue;
            }
            for m in -1..=2 {
                let wx = cubic_kernel(x - (x0 + m) as f64);
                if wx == 0.0 {
                    continue;
                }
                acc += wx * wy * self.boundary.fetch(v, x0 + m, y0 + n);
            }
        }
        acc
    }

    fn cubic_in_domain(&self, v: &Plane, x: f64, y: f64) -> f64 {
        let (w, h) = v.size();
        if w < 3 || h < 3 {
            // the end conditions need three samples per axis
            return self.linear(v, x, y);
        }
        let x0 = (x.floor() as i64).min(w as i64 - 2);
        let y0 = (y.floor() as i64).min(h as i64 - 2);
        let tx = x - x0 as f64;
        let ty = y - y0 as f64;
        let wx = [
            cubic_kernel(tx + 1.0),
            cubic_kernel(tx),
            cubic_kernel(tx - 1.0),
            cubic_kernel(tx - 2.0),
        ];
        let wy = [
            cubic_kernel(ty + 1.0),
            cubic_kernel(ty),
            cubic_kernel(ty - 1.0),
            cubic_kernel(ty - 2.0),
        ];
        let row_value = |yi: i64| -> f64 {
            (0..4)
                .map(|k| wx[k] * keys_sample(|i| v.get(i, yi as usize), x0 - 1 + k as i64, w))
                .sum()
        };
        (0..4)
            .map(|k| wy[k] * keys_sample(|j| row_value(j as i64), y0 - 1 + k as i64, h))
            .sum()
    }
}

/// Sample `i` of a 1-D sequence of length `n`, with the cubic convolution end
/// conditions `f(-1) = 3f(0) - 3f(1) + f(2)` and its mirror at `n`.
#[inline]
fn keys_sample<F>(f: F, i: i64, n: usize) -> f64
where
    F: Fn(usize) -> f64,
{
    if i < 0 {
        3.0 * f(0) - 3.0 * f(1) + f(2)
    } else if i as usize >= n {
        3.0 * f(n - 1) - 3.0 * f(n - 2) + f(n - 3)
    } else {
        f(i as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field() -> Plane {
        Plane::from_fn(7, 5, |x, y| ((x * 31 + y * 17) % 11) as f64 * 0.25 - 0.7)
    }

    fn all_resamplers() -> Vec<Resampler> {
        let mut out = Vec::new();
        for method in [InterpMethod::Nearest, InterpMethod::Linear, InterpMethod::Cubic] {
            for boundary in [
                Boundary::Nan,
                Boundary::Constant(0.0),
                Boundary::Reflect,
                Boundary::Symmetric,
                Boundary::Periodic,
                Boundary::Clamp,
            ] {
                out.push(Resampler::new(method).with_boundary(boundary));
            }
        }
        out
    }

    #[test]
    fn integer_grid_is_identity() {
        let v = field();
        let (w, h) = v.size();
        let xq = Plane::from_fn(w, h, |x, _| x as f64);
        let yq = Plane::from_fn(w, h, |_, y| y as f64);
        for r in all_resamplers() {
            let vq = r.resample(&v, &xq, &yq).unwrap();
            for (a, b) in vq.data().iter().zip(v.data()) {
                assert!((a - b).abs() < 1e-12, "{r:?}: {a} != {b}");
            }
        }
    }

    #[test]
    fn one_based_origin_shifts_queries() {
        let v = field();
        let zero = Resampler::new(InterpMethod::Cubic);
        let one = zero.with_origin(IndexOrigin::One);
        for &(x, y) in &[(1.25, 2.5), (0.0, 0.0), (5.9, 3.1)] {
            let a = zero.sample(&v, x, y);
            let b = one.sample(&v, x + 1.0, y + 1.0);
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn outside_domain_is_nan() {
        let v = field();
        for method in [InterpMethod::Nearest, InterpMethod::Linear, InterpMethod::Cubic] {
            let r = Resampler::new(method);
            assert!(r.sample(&v, -0.01, 1.0).is_nan());
            assert!(r.sample(&v, 1.0, 4.01).is_nan());
            assert!(r.sample(&v, f64::NAN, 1.0).is_nan());
            assert!(r.sample(&v, 6.0, 4.0).is_finite());
        }
        let clamp = Resampler::new(InterpMethod::Linear).with_boundary(Boundary::Clamp);
        assert_eq!(clamp.sample(&v, -3.0, 0.0), v.get(0, 0));
    }

    #[test]
    fn linear_and_cubic_reproduce_linear_ramps() {
        let v = Plane::from_fn(8, 8, |x, y| 0.5 * x as f64 - 0.25 * y as f64 + 1.0);
        for method in [InterpMethod::Linear, InterpMethod::Cubic] {
            let r = Resampler::new(method);
            for &(x, y) in &[(0.3, 0.7), (3.5, 6.2), (6.9, 0.1)] {
                let expected = 0.5 * x - 0.25 * y + 1.0;
                assert!((r.sample(&v, x, y) - expected).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn boundary_indexing() {
        assert_eq!(Boundary::Reflect.index(-1, 4), Some(1));
        assert_eq!(Boundary::Reflect.index(4, 4), Some(2));
        assert_eq!(Boundary::Symmetric.index(-1, 4), Some(0));
        assert_eq!(Boundary::Symmetric.index(5, 4), Some(2));
        assert_eq!(Boundary::Periodic.index(-1, 4), Some(3));
        assert_eq!(Boundary::Clamp.index(9, 4), Some(3));
        assert_eq!(Boundary::Constant(1.0).index(-1, 4), None);
    }

    #[test]
    fn kernel_partition_of_unity() {
        for &t in &[0.0, 0.2, 0.5, 0.77] {
            let s: f64 = (-1..=2).map(|k| cubic_kernel(t - k as f64)).sum();
            assert!((s - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn mismatched_queries_and_nan_fields_are_rejected() {
        let v = field();
        let r = Resampler::new(InterpMethod::Linear);
        assert!(r.resample(&v, &Plane::new(2, 2), &Plane::new(3, 2)).is_err());
        let mut bad = v.clone();
        bad.set(0, 0, f64::NAN);
        assert!(r.resample(&bad, &Plane::new(1, 1), &Plane::new(1, 1)).is_err());
    }
}
