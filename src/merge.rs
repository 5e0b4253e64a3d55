//! Patchwise temporal Wiener merge with overlap-add reconstruction.
//!
//! Every patch position contributes one stack of aligned patches (one per
//! merge window). The stack is fused in the 2-D frequency domain, pulling
//! each frame towards the reference wherever it differs by more than the
//! expected noise, and the fused patches are blended back with the same
//! window as weights.

use crate::QbpError;
use crate::motion::PatchGrid;
use crate::params::WindowKind;
use crate::plane::{Frame, Plane};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Square patches of equal size, one per merge window.
#[derive(Clone, Debug)]
pub struct PatchStack {
    size: usize,
    frames: Vec<Plane>,
}

impl PatchStack {
    pub fn new(frames: Vec<Plane>) -> Result<Self, QbpError> {
        let Some(first) = frames.first() else {
            return Err(QbpError::InvalidParams(
                "a patch stack needs at least one frame".to_string(),
            ));
        };
        let size = first.width();
        if first.height() != size || size == 0 {
            return Err(QbpError::InvalidParams(format!(
                "patches must be square, got {}x{}",
                first.width(),
                first.height()
            )));
        }
        if let Some(p) = frames.iter().find(|p| p.size() != (size, size)) {
            return Err(QbpError::DimensionMismatch {
                expected: (size, size),
                got: p.size(),
            });
        }
        Ok(Self { size, frames })
    }

    /// Cut tile `(row, col)` out of every tiled plane.
    pub fn from_tiles(tiles: &[&Plane], row: usize, col: usize, patch: usize) -> Result<Self, QbpError> {
        let frames = tiles
            .iter()
            .map(|t| t.crop(col * patch, row * patch, patch, patch))
            .collect::<Result<Vec<_>, QbpError>>()?;
        Self::new(frames)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[inline]
    pub fn patch_size(&self) -> usize {
        self.size
    }

    pub fn frames(&self) -> &[Plane] {
        &self.frames
    }
}

/// Cached FFT plans and window for one patch size.
pub struct SpectralMerger {
    size: usize,
    window: Plane,
    forward: Arc<dyn Fft<f64>>,
    inverse: Arc<dyn Fft<f64>>,
}

impl SpectralMerger {
    pub fn new(size: usize, window: WindowKind) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            size,
            window: window.weights(size, size),
            forward: planner.plan_fft_forward(size),
            inverse: planner.plan_fft_inverse(size),
        }
    }

    pub fn window(&self) -> &Plane {
        &self.window
    }

    /// Fuse `stack` into one patch anchored on frame `ref_index`.
    ///
    /// The noise variance is the unbiased sample variance of the reference
    /// patch, floored at `f64::EPSILON`. A frequency bin whose difference to
    /// the reference is exactly zero gets a zero gain, also when `c0` is 0.
    pub fn merge(&self, stack: &PatchStack, c0: f64, ref_index: usize) -> Result<Plane, QbpError> {
        if stack.patch_size() != self.size {
            return Err(QbpError::DimensionMismatch {
                expected: (self.size, self.size),
                got: (stack.patch_size(), stack.patch_size()),
            });
        }
        if ref_index >= stack.len() {
            return Err(QbpError::InvalidParams(format!(
                "reference index {ref_index} outside a stack of {}",
                stack.len()
            )));
        }
        let n = self.size;
        let reference = &stack.frames()[ref_index];
        let noise_variance = reference.sample_variance().max(f64::EPSILON);
        let c = 2.0 * c0 * (n * n) as f64;

        let means: Vec<f64> = stack.frames().iter().map(Plane::mean).collect();
        let ref_spectrum = self.forward_windowed(reference, means[ref_index]);
        let mut merged = ref_spectrum.clone();
        for (k, frame) in stack.frames().iter().enumerate() {
            if k == ref_index {
                continue;
            }
            let spectrum = self.forward_windowed(frame, means[k]);
            for ((acc, r), f) in merged.iter_mut().zip(ref_spectrum.iter()).zip(spectrum.iter()) {
                let d2 = (*f - *r).norm_sqr();
                let denom = d2 + c * noise_variance;
                let gain = if denom > 0.0 { d2 / denom } else { 0.0 };
                *acc += *r * gain + *f * (1.0 - gain);
            }
        }
        let norm = 1.0 / stack.len() as f64;
        merged.iter_mut().for_each(|v| *v *= norm);

        let spatial = self.inverse_2d(merged);
        let mean = means.iter().sum::<f64>() * norm;
        Ok(Plane::from_fn(n, n, |x, y| {
            mean + (spatial[y * n + x] - mean) / self.window.get(x, y)
        }))
    }

    /// `m + (y - m) * w`, then the 2-D forward transform.
    fn forward_windowed(&self, p: &Plane, mean: f64) -> Vec<Complex<f64>> {
        let mut data: Vec<Complex<f64>> = p
            .data()
            .iter()
            .zip(self.window.data())
            .map(|(v, w)| Complex::new(mean + (v - mean) * w, 0.0))
            .collect();
        fft_2d(&*self.forward, &mut data, self.size);
        data
    }

    /// Real part of the normalized inverse transform.
    fn inverse_2d(&self, mut data: Vec<Complex<f64>>) -> Vec<f64> {
        fft_2d(&*self.inverse, &mut data, self.size);
        let norm = 1.0 / (self.size * self.size) as f64;
        data.into_iter().map(|v| v.re * norm).collect()
    }
}

/// Row transforms, transpose, column transforms, transpose back.
fn fft_2d(fft: &dyn Fft<f64>, data: &mut [Complex<f64>], n: usize) {
    for row in data.chunks_exact_mut(n) {
        fft.process(row);
    }
    transpose_inplace(data, n);
    for row in data.chunks_exact_mut(n) {
        fft.process(row);
    }
    transpose_inplace(data, n);
}

fn transpose_inplace(data: &mut [Complex<f64>], n: usize) {
    for i in 0..n {
        for j in (i + 1)..n {
            data.swap(i * n + j, j * n + i);
        }
    }
}

/// Temporal Wiener fusion of a single patch stack.
/// ```
/// # use libqbp::prelude::*;
/// # use libqbp::merge::{PatchStack, wiener_denoise_temporal};
/// let p = Plane::from_fn(8, 8, |x, y| ((x * 7 + y * 3) % 5) as f64);
/// let stack = PatchStack::new(vec![p.clone(); 4]).unwrap();
/// let merged = wiener_denoise_temporal(&stack, WindowKind::RaisedCosine, 8.0, 1).unwrap();
/// assert!(merged.data().iter().zip(p.data()).all(|(a, b)| (a - b).abs() < 1e-9));
/// ```
pub fn wiener_denoise_temporal(
    stack: &PatchStack,
    window: WindowKind,
    c0: f64,
    ref_index: usize,
) -> Result<Plane, QbpError> {
    SpectralMerger::new(stack.patch_size(), window).merge(stack, c0, ref_index)
}

/// Merge tiled, aligned merge-window images into a `width × height` frame.
///
/// `tiles[k]` holds `grid.rows × grid.cols` patches of `grid.patch` pixels
/// laid side by side, one channel per output channel. Patch `(row, col)` is
/// fused over all `k` and blended into the output at `grid.corner(row, col)`.
/// Pixels that no patch covers stay zero; negative values are clamped to zero.
pub fn patch_merge(
    tiles: &[Frame],
    grid: &PatchGrid,
    window: WindowKind,
    c0: f64,
    ref_index: usize,
    width: usize,
    height: usize,
) -> Result<Frame, QbpError> {
    let Some(first) = tiles.first() else {
        return Err(QbpError::NotEnoughFrames {
            required: 1,
            provided: 0,
        });
    };
    let tiled_size = (grid.cols * grid.patch, grid.rows * grid.patch);
    if let Some(t) = tiles.iter().find(|t| t.size() != tiled_size) {
        return Err(QbpError::DimensionMismatch {
            expected: tiled_size,
            got: t.size(),
        });
    }
    let channels = first.num_channels();
    if tiles.iter().any(|t| t.num_channels() != channels) {
        return Err(QbpError::InvalidParams(
            "merge windows disagree on the channel count".to_string(),
        ));
    }
    if !grid.is_empty() {
        let (x, y) = grid.corner(grid.rows - 1, grid.cols - 1);
        if x + grid.patch > width || y + grid.patch > height {
            return Err(QbpError::InvalidParams(format!(
                "{}x{} patches with stride {} do not fit a {width}x{height} image",
                grid.rows, grid.cols, grid.stride
            )));
        }
    }
    let merger = SpectralMerger::new(grid.patch, window);

    let planes = (0..channels)
        .into_par_iter()
        .map(|c| {
            let channel_tiles: Vec<&Plane> = tiles.iter().map(|t| t.channel(c)).collect();
            let merged = (0..grid.len())
                .into_par_iter()
                .map(|i| {
                    let stack =
                        PatchStack::from_tiles(&channel_tiles, i / grid.cols, i % grid.cols, grid.patch)?;
                    merger.merge(&stack, c0, ref_index)
                })
                .collect::<Result<Vec<_>, QbpError>>()?;

            let mut acc = Plane::new(width, height);
            let mut weights = Plane::new(width, height);
            for (i, patch) in merged.iter().enumerate() {
                let (x0, y0) = grid.corner(i / grid.cols, i % grid.cols);
                for y in 0..grid.patch {
                    for x in 0..grid.patch {
                        let w = merger.window().get(x, y);
                        let (ox, oy) = (x0 + x, y0 + y);
                        acc.set(ox, oy, acc.get(ox, oy) + w * patch.get(x, y));
                        weights.set(ox, oy, weights.get(ox, oy) + w);
                    }
                }
            }
            let out = acc
                .data()
                .iter()
                .zip(weights.data())
                .map(|(a, w)| if *w > 0.0 { (a / w).max(0.0) } else { 0.0 })
                .collect();
            Plane::from_vec(width, height, out)
        })
        .collect::<Result<Vec<_>, QbpError>>()?;
    Frame::from_planes(planes)
}
