//! Photon aggregate pyramid.
//!
//! Level 0 is the photon-rate normalized block (values in `[0, 1]`). Level `i`
//! sums non-overlapping `r[i] × r[i]` cells of level `i-1` (a box filter
//! sampled with stride `r[i]`) and divides by `r[i]²`, so every level holds
//! the mean photon rate over its footprint in level 0. Trailing rows and
//! columns that do not fill a whole cell are dropped, which makes level `i`
//! exactly `floor(H / ∏r) × floor(W / ∏r)`.

use crate::QbpError;
use crate::plane::Plane;

#[derive(Clone, Debug)]
pub struct AggregatePyramid {
    levels: Vec<Plane>,
}

impl AggregatePyramid {
    /// Build a pyramid with one level per entry of `ratios`; `ratios[0]` is
    /// the identity level and is ignored.
    /// ```
    /// # use libqbp::prelude::*;
    /// let frame = Plane::from_fn(64, 48, |x, y| ((x + y) % 2) as f64);
    /// let p = AggregatePyramid::build(&frame, &[1, 2, 4]).unwrap();
    /// assert_eq!(p.level(2).size(), (8, 6));
    /// assert!((p.level(1).get(0, 0) - 0.5).abs() < 1e-12);
    /// ```
    pub fn build(frame: &Plane, ratios: &[usize]) -> Result<Self, QbpError> {
        if ratios.is_empty() {
            return Err(QbpError::InvalidParams(
                "a pyramid needs at least one level".to_string(),
            ));
        }
        if let Some(level) = ratios.iter().position(|&r| r == 0) {
            return Err(QbpError::InvalidParams(format!(
                "upsample ratio of level {level} is 0"
            )));
        }
        let mut levels = Vec::with_capacity(ratios.len());
        levels.push(frame.clone());
        for (level, &ratio) in ratios.iter().enumerate().skip(1) {
            let prev = &levels[level - 1];
            let (w, h) = (prev.width() / ratio, prev.height() / ratio);
            if w == 0 || h == 0 {
                return Err(QbpError::InvalidParams(format!(
                    "pyramid level {level} would be empty ({}x{} / {ratio})",
                    prev.width(),
                    prev.height()
                )));
            }
            let next = box_decimate(prev, ratio, w, h);
            levels.push(next);
        }
        Ok(Self { levels })
    }

    #[inline]
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    #[inline]
    pub fn level(&self, i: usize) -> &Plane {
        &self.levels[i]
    }

    pub fn levels(&self) -> &[Plane] {
        &self.levels
    }
}

/// Mean over each `ratio × ratio` cell of `src`.
fn box_decimate(src: &Plane, ratio: usize, w: usize, h: usize) -> Plane {
    let norm = 1.0 / (ratio * ratio) as f64;
    Plane::from_fn(w, h, |x, y| {
        let mut acc = 0.0;
        for dy in 0..ratio {
            let row = src.row(y * ratio + dy);
            acc += row[x * ratio..(x + 1) * ratio].iter().sum::<f64>();
        }
        acc * norm
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn binary_frame(w: usize, h: usize, seed: u64) -> Plane {
        let mut rng = StdRng::seed_from_u64(seed);
        Plane::from_fn(w, h, |_, _| if rng.random_bool(0.3) { 1.0 } else { 0.0 })
    }

    #[test]
    fn level_sizes_and_range() {
        for &(w, h) in &[(64, 64), (67, 50), (33, 95)] {
            let frame = binary_frame(w, h, 7);
            let ratios = [1, 2, 4];
            let p = AggregatePyramid::build(&frame, &ratios).unwrap();
            assert_eq!(p.num_levels(), 3);
            let mut cumulative = 1;
            for (i, &r) in ratios.iter().enumerate() {
                cumulative *= r;
                assert_eq!(p.level(i).size(), (w / cumulative, h / cumulative));
                assert!(
                    p.level(i)
                        .data()
                        .iter()
                        .all(|v| (0.0..=1.0).contains(v))
                );
            }
        }
    }

    #[test]
    fn coarse_level_is_footprint_mean() {
        let frame = binary_frame(32, 32, 11);
        let p = AggregatePyramid::build(&frame, &[1, 2, 4]).unwrap();
        // level 2 pixel (1, 2) covers rows 16..24, columns 8..16 of level 0
        let mut sum = 0.0;
        for y in 16..24 {
            for x in 8..16 {
                sum += frame.get(x, y);
            }
        }
        assert!((p.level(2).get(1, 2) - sum / 64.0).abs() < 1e-12);
    }

    #[test]
    fn zero_ratio_fails_fast() {
        let frame = binary_frame(16, 16, 3);
        assert!(AggregatePyramid::build(&frame, &[1, 0]).is_err());
        assert!(AggregatePyramid::build(&frame, &[1, 32]).is_err());
    }
}
