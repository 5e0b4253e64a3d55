//! Separable merge windows.

use crate::params::WindowKind;
use crate::plane::Plane;
use std::f64::consts::PI;

/// Raised cosine `0.5 - 0.5 cos(2π (i + 0.5) / len)`. Every tap is strictly
/// positive, and two copies shifted by `len / 2` sum to one.
pub fn raised_cos_window(len: usize) -> Vec<f64> {
    (0..len)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * (i as f64 + 0.5) / len as f64).cos())
        .collect()
}

impl WindowKind {
    /// 1-D taps of this window.
    pub fn taps(&self, len: usize) -> Vec<f64> {
        match self {
            WindowKind::Box => vec![1.0; len],
            WindowKind::RaisedCosine => raised_cos_window(len),
        }
    }

    /// Outer product of the 1-D taps, `width × height`.
    /// ```
    /// # use libqbp::prelude::*;
    /// let w = WindowKind::RaisedCosine.weights(8, 8);
    /// assert!(w.data().iter().all(|v| *v > 0.0 && *v <= 1.0));
    /// assert_eq!(WindowKind::Box.weights(4, 2).sum(), 8.0);
    /// ```
    pub fn weights(&self, width: usize, height: usize) -> Plane {
        let wx = self.taps(width);
        let wy = self.taps(height);
        Plane::from_fn(width, height, |x, y| wx[x] * wy[y])
    }
}
