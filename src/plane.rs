//! Owned image containers used throughout the burst pipeline.
//!
//! A [`Plane`] is a single-channel row-major `f64` field. A [`Frame`] is an
//! ordered set of equally sized planes (H×W×C).

use crate::QbpError;
use crate::params::DataType;

/// Single-channel 2-D field in row-major layout.
#[derive(Clone, Debug, PartialEq)]
pub struct Plane {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl Plane {
    /// Zero-initialized plane of size `width × height`.
    pub fn new(width: usize, height: usize) -> Self {
        Self::filled(width, height, 0.0)
    }

    pub fn filled(width: usize, height: usize, value: f64) -> Self {
        Self {
            width,
            height,
            data: vec![value; width * height],
        }
    }

    /// Wrap an existing row-major buffer.
    /// ```
    /// # use libqbp::plane::Plane;
    /// let p = Plane::from_vec(2, 2, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
    /// assert_eq!(p.get(1, 1), 3.0);
    /// assert!(Plane::from_vec(3, 2, vec![0.0; 4]).is_err());
    /// ```
    pub fn from_vec(width: usize, height: usize, data: Vec<f64>) -> Result<Self, QbpError> {
        if data.len() != width * height {
            return Err(QbpError::InvalidParams(format!(
                "buffer of {} values cannot hold a {}x{} plane",
                data.len(),
                width,
                height
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build a plane by evaluating `f(x, y)` at every pixel.
    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> f64,
    {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    /// `(width, height)`
    #[inline]
    pub fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    #[inline]
    fn idx(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f64 {
        self.data[self.idx(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: f64) {
        let i = self.idx(x, y);
        self.data[i] = v;
    }

    #[inline]
    pub fn row(&self, y: usize) -> &[f64] {
        let start = y * self.width;
        &self.data[start..start + self.width]
    }

    pub fn same_size(&self, other: &Plane) -> bool {
        self.size() == other.size()
    }

    pub fn map<F>(&self, f: F) -> Plane
    where
        F: Fn(f64) -> f64,
    {
        Plane {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|v| v.is_nan())
    }

    /// Copy of the `width × height` window whose upper left corner is `(x0, y0)`.
    pub fn crop(&self, x0: usize, y0: usize, width: usize, height: usize) -> Result<Plane, QbpError> {
        if x0 + width > self.width || y0 + height > self.height {
            return Err(QbpError::InvalidParams(format!(
                "crop {}x{}+{}+{} exceeds plane of {}x{}",
                width, height, x0, y0, self.width, self.height
            )));
        }
        Ok(Plane::from_fn(width, height, |x, y| self.get(x0 + x, y0 + y)))
    }

    pub fn add_assign(&mut self, other: &Plane) -> Result<(), QbpError> {
        if !self.same_size(other) {
            return Err(QbpError::DimensionMismatch {
                expected: self.size(),
                got: other.size(),
            });
        }
        self.data
            .iter_mut()
            .zip(other.data.iter())
            .for_each(|(a, b)| *a += b);
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    pub fn mean(&self) -> f64 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.sum() / self.data.len() as f64
    }

    /// Unbiased sample variance (`n - 1` in the denominator).
    pub fn sample_variance(&self) -> f64 {
        let n = self.data.len();
        if n < 2 {
            return 0.0;
        }
        let m = self.mean();
        self.data.iter().map(|v| (v - m) * (v - m)).sum::<f64>() / (n - 1) as f64
    }

    pub fn quantize(&mut self, data_type: DataType) {
        if data_type == DataType::Single {
            self.data.iter_mut().for_each(|v| *v = *v as f32 as f64);
        }
    }
}

/// An H×W×C image; every channel shares the same size.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    channels: Vec<Plane>,
}

impl Frame {
    pub fn new(width: usize, height: usize, num_channels: usize) -> Self {
        Self {
            channels: (0..num_channels).map(|_| Plane::new(width, height)).collect(),
        }
    }

    pub fn from_plane(plane: Plane) -> Self {
        Self {
            channels: vec![plane],
        }
    }

    pub fn from_planes(channels: Vec<Plane>) -> Result<Self, QbpError> {
        let first = channels
            .first()
            .ok_or_else(|| QbpError::InvalidParams("a frame needs at least one channel".to_string()))?;
        if let Some(p) = channels.iter().find(|p| !p.same_size(first)) {
            return Err(QbpError::DimensionMismatch {
                expected: first.size(),
                got: p.size(),
            });
        }
        Ok(Self { channels })
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.channels[0].width()
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.channels[0].height()
    }

    /// `(width, height)`
    #[inline]
    pub fn size(&self) -> (usize, usize) {
        self.channels[0].size()
    }

    #[inline]
    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    #[inline]
    pub fn channel(&self, c: usize) -> &Plane {
        &self.channels[c]
    }

    #[inline]
    pub fn channel_mut(&mut self, c: usize) -> &mut Plane {
        &mut self.channels[c]
    }

    pub fn channels(&self) -> &[Plane] {
        &self.channels
    }

    pub fn into_channels(self) -> Vec<Plane> {
        self.channels
    }

    /// Per-pixel mean over all channels.
    pub fn channel_mean(&self) -> Plane {
        if self.channels.len() == 1 {
            return self.channels[0].clone();
        }
        let n = self.channels.len() as f64;
        let (w, h) = self.size();
        Plane::from_fn(w, h, |x, y| {
            self.channels.iter().map(|p| p.get(x, y)).sum::<f64>() / n
        })
    }

    pub fn map<F>(&self, f: F) -> Frame
    where
        F: Fn(f64) -> f64,
    {
        Frame {
            channels: self.channels.iter().map(|p| p.map(&f)).collect(),
        }
    }

    pub fn add_assign(&mut self, other: &Frame) -> Result<(), QbpError> {
        if self.num_channels() != other.num_channels() {
            return Err(QbpError::InvalidParams(format!(
                "channel count mismatch: {} vs {}",
                self.num_channels(),
                other.num_channels()
            )));
        }
        for (a, b) in self.channels.iter_mut().zip(other.channels.iter()) {
            a.add_assign(b)?;
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.channels.iter_mut().for_each(|p| p.scale(factor));
    }

    pub fn quantize(&mut self, data_type: DataType) {
        self.channels.iter_mut().for_each(|p| p.quantize(data_type));
    }
}
