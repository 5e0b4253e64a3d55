//! Translational Lucas-Kanade refinement of a single patch.
//!
//! Spatial derivatives use the 5-tap central difference `[1, -8, 0, 8, -1] / 12`
//! with symmetric edge extension. The target derivatives are sampled at the
//! current warp and blended with the template's own derivatives.

use crate::plane::Plane;
use crate::resample::{Boundary, Resampler};
use nalgebra::{Matrix2, Vector2};

/// Correlation taps of the central difference filter, centered on index 2.
pub const DERIVATIVE_TAPS: [f64; 5] = [1.0 / 12.0, -8.0 / 12.0, 0.0, 8.0 / 12.0, -1.0 / 12.0];

/// Horizontal (`dx = true`) or vertical derivative of `p`.
pub fn derivative_filter(p: &Plane, dx: bool) -> Plane {
    let b = Boundary::Symmetric;
    let (w, h) = p.size();
    Plane::from_fn(w, h, |x, y| {
        DERIVATIVE_TAPS
            .iter()
            .enumerate()
            .map(|(k, t)| {
                let o = k as i64 - 2;
                if dx {
                    t * b.fetch(p, x as i64 + o, y as i64)
                } else {
                    t * b.fetch(p, x as i64, y as i64 + o)
                }
            })
            .sum()
    })
}

/// An image together with its spatial derivatives.
#[derive(Clone, Debug)]
pub struct GradientField {
    pub image: Plane,
    pub dx: Plane,
    pub dy: Plane,
}

impl GradientField {
    pub fn new(image: Plane) -> Self {
        let dx = derivative_filter(&image, true);
        let dy = derivative_filter(&image, false);
        Self { image, dx, dy }
    }
}

/// Temporal and spatial derivatives over a template patch.
#[derive(Clone, Debug)]
pub struct Derivatives {
    pub it: Plane,
    pub ix: Plane,
    pub iy: Plane,
}

/// Derivatives of the optical flow constraint for `template` against
/// `target` displaced by `disp = (dx, dy)`. Pixels where any of the three
/// values is not finite are zeroed.
pub fn partial_derivatives(
    template: &Plane,
    target: &GradientField,
    disp: [f64; 2],
    resampler: &Resampler,
    blend: f64,
) -> Derivatives {
    let tg = GradientField::new(template.clone());
    derivatives_at(&tg, target, disp, resampler, blend)
}

fn derivatives_at(
    template: &GradientField,
    target: &GradientField,
    disp: [f64; 2],
    resampler: &Resampler,
    blend: f64,
) -> Derivatives {
    let (w, h) = template.image.size();
    let mut it = Plane::new(w, h);
    let mut ix = Plane::new(w, h);
    let mut iy = Plane::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let qx = x as f64 + disp[0];
            let qy = y as f64 + disp[1];
            let t = resampler.sample(&target.image, qx, qy) - template.image.get(x, y);
            let gx = blend * resampler.sample(&target.dx, qx, qy)
                + (1.0 - blend) * template.dx.get(x, y);
            let gy = blend * resampler.sample(&target.dy, qx, qy)
                + (1.0 - blend) * template.dy.get(x, y);
            if t.is_finite() && gx.is_finite() && gy.is_finite() {
                it.set(x, y, t);
                ix.set(x, y, gx);
                iy.set(x, y, gy);
            }
        }
    }
    Derivatives { it, ix, iy }
}

/// Refine the displacement of `template` inside `target`.
///
/// `init` is the absolute position `(x, y)` of the template's upper left
/// corner in the target. Per-channel derivatives are summed. Iteration stops
/// early when the least squares system loses rank; each step is clipped to
/// unit length.
pub fn lk_align(
    template: &[Plane],
    target: &[GradientField],
    iterations: usize,
    init: [f64; 2],
    resampler: &Resampler,
    blend: f64,
) -> [f64; 2] {
    let templates: Vec<GradientField> = template
        .iter()
        .map(|p| GradientField::new(p.clone()))
        .collect();
    let mut uv = Vector2::new(init[0], init[1]);
    let rows = template.first().map_or(0, |p| p.data().len());

    for _ in 0..iterations {
        let mut ata = Matrix2::<f64>::zeros();
        let mut atb = Vector2::<f64>::zeros();
        let per_channel: Vec<Derivatives> = templates
            .iter()
            .zip(target.iter())
            .map(|(t, g)| derivatives_at(t, g, [uv.x, uv.y], resampler, blend))
            .collect();
        for i in 0..rows {
            let (mut t, mut gx, mut gy) = (0.0, 0.0, 0.0);
            for d in per_channel.iter() {
                t += d.it.data()[i];
                gx += d.ix.data()[i];
                gy += d.iy.data()[i];
            }
            ata.m11 += gx * gx;
            ata.m12 += gx * gy;
            ata.m22 += gy * gy;
            atb.x -= gx * t;
            atb.y -= gy * t;
        }
        ata.m21 = ata.m12;

        if !has_full_rank(&ata, rows) {
            break;
        }
        let Some(inv) = ata.try_inverse() else {
            break;
        };
        let mut step = inv * atb;
        let norm = step.norm();
        if !norm.is_finite() {
            break;
        }
        if norm > 1.0 {
            step /= norm;
        }
        uv += step;
    }
    [uv.x, uv.y]
}

/// Rank test of `A` through the eigenvalues of `AᵀA`, with the usual SVD
/// tolerance `σ_max · max(m, n) · ε`.
fn has_full_rank(ata: &Matrix2<f64>, rows: usize) -> bool {
    let eig = ata.symmetric_eigenvalues();
    let max = eig.max();
    if !(max > 0.0) {
        return false;
    }
    let sigma_max = max.sqrt();
    let sigma_min = eig.min().max(0.0).sqrt();
    sigma_min > sigma_max * rows.max(2) as f64 * f64::EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resample::InterpMethod;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn bilinear_surface(x: f64, y: f64) -> f64 {
        0.2 + 0.01 * x + 0.015 * y + 0.0008 * x * y
    }

    #[test]
    fn derivative_of_ramp_is_slope() {
        let p = Plane::from_fn(12, 9, |x, y| 0.5 * x as f64 - 2.0 * y as f64);
        let dx = derivative_filter(&p, true);
        let dy = derivative_filter(&p, false);
        for y in 2..7 {
            for x in 2..10 {
                assert!((dx.get(x, y) - 0.5).abs() < 1e-12);
                assert!((dy.get(x, y) + 2.0).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn converges_to_subpixel_translation() {
        let (tx, ty) = (0.3, -0.2);
        let target = Plane::from_fn(64, 64, |x, y| bilinear_surface(x as f64 - tx, y as f64 - ty));
        let (xlb, ylb) = (24usize, 24usize);
        let template = Plane::from_fn(16, 16, |x, y| {
            bilinear_surface((x + xlb) as f64, (y + ylb) as f64)
        });
        let uv = lk_align(
            &[template],
            &[GradientField::new(target)],
            20,
            [xlb as f64, ylb as f64],
            &Resampler::new(InterpMethod::Linear),
            0.5,
        );
        assert!((uv[0] - (xlb as f64 + tx)).abs() < 1e-2, "{uv:?}");
        assert!((uv[1] - (ylb as f64 + ty)).abs() < 1e-2, "{uv:?}");
    }

    #[test]
    fn exact_integer_match_is_a_fixed_point() {
        let mut rng = StdRng::seed_from_u64(1);
        let target = Plane::from_fn(40, 40, |_, _| rng.random::<f64>());
        let template = target.crop(12, 10, 16, 16).unwrap();
        let uv = lk_align(
            &[template],
            &[GradientField::new(target)],
            3,
            [12.0, 10.0],
            &Resampler::new(InterpMethod::Linear),
            0.5,
        );
        assert!((uv[0] - 12.0).abs() < 1e-9 && (uv[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn flat_patch_stops_early() {
        let target = Plane::filled(32, 32, 0.4);
        let template = Plane::filled(8, 8, 0.1);
        let uv = lk_align(
            &[template],
            &[GradientField::new(target)],
            5,
            [3.0, 4.0],
            &Resampler::new(InterpMethod::Linear),
            0.5,
        );
        assert_eq!(uv, [3.0, 4.0]);
    }

    #[test]
    fn out_of_domain_pixels_are_masked() {
        let target = GradientField::new(Plane::from_fn(10, 10, |x, _| x as f64));
        let template = Plane::filled(4, 4, 1.0);
        let d = partial_derivatives(
            &template,
            &target,
            [8.0, 0.0],
            &Resampler::new(InterpMethod::Linear),
            0.5,
        );
        // columns 2 and 3 land beyond the last target column
        assert_eq!(d.it.get(3, 0), 0.0);
        assert_eq!(d.ix.get(3, 0), 0.0);
        assert!((d.it.get(0, 0) - 7.0).abs() < 1e-12);
    }
}
