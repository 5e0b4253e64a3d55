//! Brute force integer block matching with a sum of absolute differences score.

use crate::QbpError;
use crate::plane::Plane;
use crate::resample::IndexOrigin;

/// Best integer displacement `(dx, dy)` of a block and its SAD score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockMatch {
    pub displacement: [i64; 2],
    pub score: f64,
}

/// Search the displacement that best maps the `block_size` square of
/// `reference` at `upper_left = (x, y)` onto `target`.
///
/// Every `(u, v)` within `search_radius` of `init` (rounded to integers) is
/// scored, clipped so the displaced block stays inside `target`, which may
/// be smaller than `reference`. The scan is
/// row-major over `(v, u)` and only a strictly lower score replaces the
/// current best, so ties keep the earliest displacement.
///
/// Returns `Ok(None)` when the clipped search window is empty or no finite
/// score was found. Only a block that cannot be cut out of `reference` is an
/// error.
/// ```
/// # use libqbp::prelude::*;
/// # use libqbp::block_match::block_match;
/// let f = |x: usize, y: usize| ((x * x + 3 * y * y + x * y) % 17) as f64;
/// let reference = Plane::from_fn(16, 16, f);
/// let target = Plane::from_fn(16, 16, |x, y| if x >= 2 { f(x - 2, y) } else { 0.0 });
/// let m = block_match(&[reference], &[target], (4, 4), 6, 3, [0.0, 0.0], IndexOrigin::Zero)
///     .unwrap()
///     .unwrap();
/// assert_eq!(m.displacement, [2, 0]);
/// assert_eq!(m.score, 0.0);
/// ```
pub fn block_match(
    reference: &[Plane],
    target: &[Plane],
    upper_left: (usize, usize),
    block_size: usize,
    search_radius: usize,
    init: [f64; 2],
    origin: IndexOrigin,
) -> Result<Option<BlockMatch>, QbpError> {
    if reference.is_empty() || reference.len() != target.len() {
        return Err(QbpError::InvalidParams(format!(
            "channel mismatch: reference has {}, target has {}",
            reference.len(),
            target.len()
        )));
    }
    let (w, h) = reference[0].size();
    let (tw, th) = target[0].size();
    for (planes, size) in [(reference, (w, h)), (target, (tw, th))] {
        if let Some(p) = planes.iter().find(|p| p.size() != size) {
            return Err(QbpError::DimensionMismatch {
                expected: size,
                got: p.size(),
            });
        }
    }
    let shift = match origin {
        IndexOrigin::Zero => 0,
        IndexOrigin::One => 1,
    };
    let (xlb, ylb) = match (upper_left.0.checked_sub(shift), upper_left.1.checked_sub(shift)) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(QbpError::InvalidParams(format!(
                "one-based block corner {upper_left:?} has a zero coordinate"
            )));
        }
    };
    if block_size == 0 || xlb + block_size > w || ylb + block_size > h {
        return Err(QbpError::InvalidParams(format!(
            "block of size {block_size} at ({xlb}, {ylb}) exceeds the {w}x{h} reference"
        )));
    }
    if init.iter().any(|v| !v.is_finite()) {
        return Ok(None);
    }

    let r = search_radius as i64;
    let (init_u, init_v) = (init[0].round() as i64, init[1].round() as i64);
    let (xlb_i, ylb_i, bs) = (xlb as i64, ylb as i64, block_size as i64);
    let v_min = (-ylb_i).max(init_v - r);
    let v_max = (th as i64 - bs - ylb_i).min(init_v + r);
    let u_min = (-xlb_i).max(init_u - r);
    let u_max = (tw as i64 - bs - xlb_i).min(init_u + r);

    let mut best: Option<BlockMatch> = None;
    for v in v_min..=v_max {
        for u in u_min..=u_max {
            let score = sad(
                reference,
                target,
                (xlb, ylb),
                ((xlb_i + u) as usize, (ylb_i + v) as usize),
                block_size,
            );
            if score < best.map_or(f64::INFINITY, |b| b.score) {
                best = Some(BlockMatch {
                    displacement: [u, v],
                    score,
                });
            }
        }
    }
    Ok(best)
}

/// Sum of absolute differences over all channels.
fn sad(
    reference: &[Plane],
    target: &[Plane],
    ref_ul: (usize, usize),
    tgt_ul: (usize, usize),
    block_size: usize,
) -> f64 {
    let mut acc = 0.0;
    for (r, t) in reference.iter().zip(target.iter()) {
        for dy in 0..block_size {
            let rr = &r.row(ref_ul.1 + dy)[ref_ul.0..ref_ul.0 + block_size];
            let tr = &t.row(tgt_ul.1 + dy)[tgt_ul.0..tgt_ul.0 + block_size];
            acc += rr.iter().zip(tr).map(|(a, b)| (a - b).abs()).sum::<f64>();
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_plane(w: usize, h: usize, rng: &mut StdRng) -> Plane {
        Plane::from_fn(w, h, |_, _| rng.random::<f64>())
    }

    /// `target(x, y) = reference(x - dx, y - dy)`, fresh noise where undefined.
    fn shifted(reference: &Plane, dx: i64, dy: i64, rng: &mut StdRng) -> Plane {
        let (w, h) = reference.size();
        Plane::from_fn(w, h, |x, y| {
            let (sx, sy) = (x as i64 - dx, y as i64 - dy);
            if sx >= 0 && sy >= 0 && sx < w as i64 && sy < h as i64 {
                reference.get(sx as usize, sy as usize)
            } else {
                rng.random::<f64>()
            }
        })
    }

    #[test]
    fn recovers_known_integer_shift() {
        let mut rng = StdRng::seed_from_u64(42);
        let reference = random_plane(48, 40, &mut rng);
        for &(dx, dy) in &[(3, -2), (-4, 4), (0, 0), (1, 3)] {
            let target = shifted(&reference, dx, dy, &mut rng);
            let m = block_match(
                &[reference.clone()],
                &[target],
                (16, 12),
                12,
                4,
                [0.0, 0.0],
                IndexOrigin::Zero,
            )
            .unwrap()
            .unwrap();
            assert_eq!(m.displacement, [dx, dy]);
            assert_eq!(m.score, 0.0);
        }
    }

    #[test]
    fn search_is_centered_on_initial_guess() {
        let mut rng = StdRng::seed_from_u64(5);
        let reference = random_plane(64, 64, &mut rng);
        let target = shifted(&reference, 9, -7, &mut rng);
        let m = block_match(
            &[reference],
            &[target],
            (24, 24),
            16,
            2,
            [8.0, -8.0],
            IndexOrigin::Zero,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.displacement, [9, -7]);
    }

    #[test]
    fn ties_keep_the_first_candidate() {
        let flat = Plane::filled(10, 10, 0.5);
        let m = block_match(
            &[flat.clone()],
            &[flat],
            (3, 3),
            4,
            2,
            [0.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.displacement, [-2, -2]);
    }

    #[test]
    fn one_based_corner_matches_zero_based() {
        let mut rng = StdRng::seed_from_u64(9);
        let reference = random_plane(32, 32, &mut rng);
        let target = shifted(&reference, 1, 2, &mut rng);
        let zero = block_match(
            &[reference.clone()],
            &[target.clone()],
            (8, 8),
            8,
            3,
            [0.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap();
        let one = block_match(
            &[reference],
            &[target],
            (9, 9),
            8,
            3,
            [0.0, 0.0],
            IndexOrigin::One,
        )
        .unwrap();
        assert_eq!(zero, one);
    }

    #[test]
    fn degenerate_window_yields_none() {
        let p = Plane::filled(16, 16, 0.0);
        // the guess points far outside the target, the clipped window is empty
        let m = block_match(
            &[p.clone()],
            &[p.clone()],
            (0, 0),
            8,
            1,
            [20.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap();
        assert!(m.is_none());
        assert!(
            block_match(&[p.clone()], &[p], (10, 0), 8, 1, [0.0, 0.0], IndexOrigin::Zero).is_err()
        );
    }

    #[test]
    fn target_too_small_for_the_block_yields_none() {
        let reference = Plane::filled(16, 16, 0.25);
        let target = Plane::filled(8, 8, 0.25);
        let m = block_match(
            &[reference],
            &[target],
            (2, 2),
            12,
            2,
            [0.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap();
        assert!(m.is_none());
    }

    #[test]
    fn search_is_clipped_to_the_target() {
        let mut rng = StdRng::seed_from_u64(21);
        let reference = random_plane(32, 32, &mut rng);
        let target = reference.crop(0, 0, 20, 20).unwrap();
        // displacements past u = 4 or v = 4 would leave the 20x20 target
        let m = block_match(
            &[reference],
            &[target],
            (8, 8),
            8,
            6,
            [0.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.displacement, [0, 0]);
        assert_eq!(m.score, 0.0);
    }

    #[test]
    fn multichannel_scores_sum_channels() {
        let a = Plane::filled(8, 8, 1.0);
        let b = Plane::filled(8, 8, 0.0);
        let m = block_match(
            &[a.clone(), b.clone()],
            &[b, a],
            (0, 0),
            4,
            0,
            [0.0, 0.0],
            IndexOrigin::Zero,
        )
        .unwrap()
        .unwrap();
        assert_eq!(m.score, 32.0);
    }
}
