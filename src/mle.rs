//! Maximum likelihood inversion of accumulated binary photon counts.
//!
//! A pixel that detected `S` photons in `T` binary exposures has the
//! intensity estimate `λ = -ln(1 - S / T)`.

use crate::QbpError;
use crate::plane::{Frame, Plane};
use ordered_float::OrderedFloat;

/// Linear scale applied to the inverted intensities.
#[derive(Clone, Debug, PartialEq)]
pub enum IntensityScale {
    /// One factor for every channel.
    Uniform(f64),
    /// One factor per channel. A single-channel image uses their mean.
    PerChannel(Vec<f64>),
    /// Divide by the largest finite intensity.
    Normalize,
}

impl Default for IntensityScale {
    fn default() -> Self {
        IntensityScale::Uniform(1.0)
    }
}

/// Output of [`mle_image`].
#[derive(Clone, Debug)]
pub struct MleEstimate {
    pub intensity: Frame,
    /// `(exp(λ) - 1) / T`, only computed when near-saturation fixing is on.
    pub variance: Option<Frame>,
    /// Pixels with `S >= T` that were left at `+inf`.
    pub saturated: usize,
}

/// Invert photon counts `counts` accumulated over `total` binary exposures.
///
/// With `fix_near_saturation` every count above `T - 1` is clamped to
/// `T - 1` and a variance image is produced, where zero intensities are
/// replaced by `-ln(1 - 1/T)`. Without it, pixels with `S >= T` become
/// `+inf` and are counted in [`MleEstimate::saturated`].
/// ```
/// # use libqbp::prelude::*;
/// let s = Frame::from_plane(Plane::from_vec(3, 1, vec![0.0, 50.0, 100.0]).unwrap());
/// let est = mle_image(&s, 100.0, &IntensityScale::Uniform(1.0), false).unwrap();
/// assert_eq!(est.intensity.channel(0).get(0, 0), 0.0);
/// assert!((est.intensity.channel(0).get(1, 0) - 2f64.ln()).abs() < 1e-12);
/// assert!(est.intensity.channel(0).get(2, 0).is_infinite());
/// assert_eq!(est.saturated, 1);
/// ```
pub fn mle_image(
    counts: &Frame,
    total: f64,
    scale: &IntensityScale,
    fix_near_saturation: bool,
) -> Result<MleEstimate, QbpError> {
    if !(total > 0.0) || !total.is_finite() {
        return Err(QbpError::InvalidParams(format!(
            "total exposures must be positive, got {total}"
        )));
    }
    let channels = counts.num_channels();
    let factors: Option<Vec<f64>> = match scale {
        IntensityScale::Uniform(s) => Some(vec![*s; channels]),
        IntensityScale::PerChannel(v) if channels == 1 && !v.is_empty() => {
            Some(vec![v.iter().sum::<f64>() / v.len() as f64])
        }
        IntensityScale::PerChannel(v) if v.len() == channels => Some(v.clone()),
        IntensityScale::PerChannel(v) => {
            return Err(QbpError::InvalidParams(format!(
                "{} scale factors for {channels} channels",
                v.len()
            )));
        }
        IntensityScale::Normalize => None,
    };

    let mut saturated = 0;
    let mut planes = Vec::with_capacity(channels);
    for plane in counts.channels() {
        let lambda = plane.map(|s| {
            let s = if fix_near_saturation && s > total - 1.0 { total - 1.0 } else { s };
            if s >= total {
                f64::INFINITY
            } else {
                -(1.0 - s / total).ln()
            }
        });
        saturated += lambda.data().iter().filter(|v| **v == f64::INFINITY).count();
        planes.push(lambda);
    }
    if saturated > 0 {
        log::warn!("{saturated} pixels are saturated (S == T), their intensity is infinite");
    }

    match factors {
        Some(f) => planes
            .iter_mut()
            .zip(f.iter())
            .for_each(|(p, s)| p.scale(*s)),
        None => {
            let max = planes
                .iter()
                .flat_map(|p| p.data().iter())
                .filter(|v| v.is_finite())
                .map(|v| OrderedFloat(*v))
                .max()
                .map(|v| v.0);
            if let Some(max) = max.filter(|m| *m > 0.0) {
                planes.iter_mut().for_each(|p| p.scale(1.0 / max));
            }
        }
    }

    let variance = if fix_near_saturation {
        let floor = -(1.0 - 1.0 / total).ln();
        let v = planes
            .iter()
            .map(|p| p.map(|l| ((if l == 0.0 { floor } else { l }).exp() - 1.0) / total))
            .collect::<Vec<Plane>>();
        Some(Frame::from_planes(v)?)
    } else {
        None
    };

    Ok(MleEstimate {
        intensity: Frame::from_planes(planes)?,
        variance,
        saturated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(values: Vec<f64>) -> Frame {
        let n = values.len();
        Frame::from_plane(Plane::from_vec(n, 1, values).unwrap())
    }

    #[test]
    fn round_trip_recovers_intensity() {
        let t: f64 = 1000.0;
        let scale: f64 = 2.5;
        let lambdas: [f64; 5] = [0.01, 0.3, 1.0, 2.7, 5.0];
        let s: Vec<f64> = lambdas
            .iter()
            .map(|l| t * (1.0 - (-*l / scale).exp()))
            .collect();
        let est = mle_image(&frame(s), t, &IntensityScale::Uniform(scale), false).unwrap();
        for (i, l) in lambdas.iter().enumerate() {
            assert!((est.intensity.channel(0).get(i, 0) - l).abs() < 1e-9);
        }
        assert_eq!(est.saturated, 0);
        assert!(est.variance.is_none());
    }

    #[test]
    fn saturation_is_clamped_when_fixing() {
        let t = 10.0;
        let est = mle_image(&frame(vec![0.0, 10.0, 12.0]), t, &IntensityScale::default(), true)
            .unwrap();
        let p = est.intensity.channel(0);
        assert_eq!(p.get(0, 0), 0.0);
        assert!((p.get(1, 0) - 10f64.ln()).abs() < 1e-12);
        assert_eq!(p.get(1, 0), p.get(2, 0));
        assert_eq!(est.saturated, 0);

        let var = est.variance.unwrap();
        let floor = -(0.9f64).ln();
        assert!((var.channel(0).get(0, 0) - (floor.exp() - 1.0) / t).abs() < 1e-12);
        assert!((var.channel(0).get(1, 0) - 0.9).abs() < 1e-12);
    }

    #[test]
    fn normalize_divides_by_finite_max() {
        let est = mle_image(&frame(vec![0.0, 5.0, 7.5, 10.0]), 10.0, &IntensityScale::Normalize, false)
            .unwrap();
        let p = est.intensity.channel(0);
        assert!((p.get(2, 0) - 1.0).abs() < 1e-12);
        assert!((p.get(1, 0) - 2f64.ln() / 4f64.ln()).abs() < 1e-12);
        assert!(p.get(3, 0).is_infinite());
        assert_eq!(est.saturated, 1);
    }

    #[test]
    fn per_channel_scale() {
        let s = Frame::from_planes(vec![
            Plane::filled(2, 2, 5.0),
            Plane::filled(2, 2, 5.0),
            Plane::filled(2, 2, 5.0),
        ])
        .unwrap();
        let est = mle_image(&s, 10.0, &IntensityScale::PerChannel(vec![1.0, 2.0, 3.0]), false)
            .unwrap();
        let base = 2f64.ln();
        for c in 0..3 {
            assert!((est.intensity.channel(c).get(1, 1) - base * (c + 1) as f64).abs() < 1e-12);
        }
        let single = frame(vec![5.0]);
        let est = mle_image(&single, 10.0, &IntensityScale::PerChannel(vec![1.0, 2.0, 3.0]), false)
            .unwrap();
        assert!((est.intensity.channel(0).get(0, 0) - 2.0 * base).abs() < 1e-12);
        assert!(mle_image(&s, 10.0, &IntensityScale::PerChannel(vec![1.0, 2.0]), false).is_err());
    }

    #[test]
    fn rejects_non_positive_total() {
        assert!(mle_image(&frame(vec![0.0]), 0.0, &IntensityScale::default(), false).is_err());
    }
}
