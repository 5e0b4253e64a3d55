//! Temporal windows, per-frame flow interpolation and warping onto the
//! reference patch grid.

use crate::QbpError;
use crate::motion::{FlowField, PatchGrid};
use crate::params::BurstParams;
use crate::plane::{Frame, Plane};
use crate::resample::{InterpMethod, Resampler};
use rayon::prelude::*;
use std::ops::Range;

/// Frame ranges of the alignment and merge windows. All indices are zero
/// based except `ref_frame`, which keeps its one-based configuration value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BurstSchedule {
    pub align_tw_size: usize,
    pub align_tw_num: usize,
    pub merge_tw_size: usize,
    pub merge_tw_num: usize,
    pub ref_frame: usize,
}

impl BurstSchedule {
    pub fn new(params: &BurstParams) -> Self {
        Self {
            align_tw_size: params.align_tw_size,
            align_tw_num: params.align_tw_num,
            merge_tw_size: params.merge_tw_size,
            merge_tw_num: params.merge_tw_num,
            ref_frame: params.ref_frame(),
        }
    }

    #[inline]
    pub fn align_span(&self) -> usize {
        self.align_tw_size * self.align_tw_num
    }

    #[inline]
    pub fn merge_span(&self) -> usize {
        self.merge_tw_size * self.merge_tw_num
    }

    /// Alignment block holding the reference frame.
    #[inline]
    pub fn ref_block(&self) -> usize {
        (self.ref_frame - 1) / self.align_tw_size
    }

    /// Merge window holding the reference frame.
    #[inline]
    pub fn ref_merge_window(&self) -> usize {
        (self.ref_frame - 1) / self.merge_tw_size
    }

    pub fn align_window(&self, block: usize) -> Range<usize> {
        block * self.align_tw_size..(block + 1) * self.align_tw_size
    }

    pub fn merge_window(&self, window: usize) -> Range<usize> {
        window * self.merge_tw_size..(window + 1) * self.merge_tw_size
    }
}

/// Average the frames of every alignment window into one block of photon
/// rates. Multichannel frames are reduced to their channel mean, and the
/// result is divided by `n_binary` so block values lie in `[0, 1]`.
pub fn aggregate_align_blocks(frames: &[Frame], params: &BurstParams) -> Result<Vec<Plane>, QbpError> {
    params.validate()?;
    let schedule = BurstSchedule::new(params);
    if frames.len() < schedule.align_span() {
        return Err(QbpError::NotEnoughFrames {
            required: schedule.align_span(),
            provided: frames.len(),
        });
    }
    let size = frames[0].size();
    if let Some(f) = frames.iter().find(|f| f.size() != size) {
        return Err(QbpError::DimensionMismatch {
            expected: size,
            got: f.size(),
        });
    }
    let norm = 1.0 / (schedule.align_tw_size * params.n_binary) as f64;
    (0..schedule.align_tw_num)
        .into_par_iter()
        .map(|block| {
            let mut acc = Plane::new(size.0, size.1);
            for g in schedule.align_window(block) {
                acc.add_assign(&frames[g].channel_mean())?;
            }
            acc.scale(norm);
            acc.quantize(params.data_type);
            Ok(acc)
        })
        .collect()
}

/// Flow of global frame `frame`, linearly interpolated between the block
/// flows around it. The reference frame's position inside its alignment
/// window marks where a block flow applies exactly; frames before the first
/// or after the last such position are extrapolated from the two nearest
/// blocks.
pub fn interpolate_flow(
    flows: &[FlowField],
    schedule: &BurstSchedule,
    frame: usize,
) -> Result<FlowField, QbpError> {
    let blocks = flows.len();
    if blocks < 2 {
        return Err(QbpError::InvalidParams(format!(
            "flow interpolation needs at least two alignment blocks, got {blocks}"
        )));
    }
    let size = schedule.align_tw_size;
    let block = frame / size;
    if block >= blocks {
        return Err(QbpError::InvalidParams(format!(
            "frame {frame} lies beyond the {blocks} alignment blocks"
        )));
    }
    // flows padded with one extrapolated block on either side
    let padded = |k: usize| -> Result<FlowField, QbpError> {
        if k == 0 {
            FlowField::weighted_sum(&flows[0], 2.0, &flows[1], -1.0)
        } else if k == blocks + 1 {
            FlowField::weighted_sum(&flows[blocks - 1], 2.0, &flows[blocks - 2], -1.0)
        } else {
            Ok(flows[k - 1].clone())
        }
    };
    let center = (schedule.ref_frame - 1) % size;
    let offset = frame % size;
    let s = size as f64;
    if offset < center {
        FlowField::weighted_sum(
            &padded(block)?,
            (center - offset) as f64 / s,
            &padded(block + 1)?,
            (offset + size - center) as f64 / s,
        )
    } else {
        FlowField::weighted_sum(
            &padded(block + 1)?,
            (center + size - offset) as f64 / s,
            &padded(block + 2)?,
            (offset - center) as f64 / s,
        )
    }
}

/// Warp `frame` onto the tiled patch plane of `grid`.
///
/// Tile `(row, col)` of the output samples `frame` at the patch's corner plus
/// its flow. Samples outside the frame are NaN.
pub fn warp_frame(
    frame: &Frame,
    flow: &FlowField,
    grid: &PatchGrid,
    method: InterpMethod,
) -> Result<Frame, QbpError> {
    if (flow.rows(), flow.cols()) != (grid.rows, grid.cols) {
        return Err(QbpError::DimensionMismatch {
            expected: (grid.cols, grid.rows),
            got: (flow.cols(), flow.rows()),
        });
    }
    let resampler = Resampler::new(method);
    let p = grid.patch;
    let planes = frame
        .channels()
        .iter()
        .map(|plane| {
            Plane::from_fn(grid.cols * p, grid.rows * p, |x, y| {
                let (row, col) = (y / p, x / p);
                let (x0, y0) = grid.corner(row, col);
                let d = flow.get(row, col);
                resampler.sample(
                    plane,
                    (x0 + x % p) as f64 + d[0],
                    (y0 + y % p) as f64 + d[1],
                )
            })
        })
        .collect();
    Frame::from_planes(planes)
}

/// Warp every frame of each merge window with its interpolated flow and
/// average the window into one tiled image.
///
/// With `phase_ids`, single-channel frames accumulate into channel
/// `phase_ids[g]` of the output; otherwise frame channels map one to one.
/// Every output pixel is divided by the number of finite samples it
/// received, a zero count leaving the pixel at zero.
pub fn build_aligned_patches(
    frames: &[Frame],
    flows: &[FlowField],
    params: &BurstParams,
    phase_ids: Option<&[usize]>,
) -> Result<Vec<Frame>, QbpError> {
    params.validate()?;
    let schedule = BurstSchedule::new(params);
    if frames.len() < schedule.merge_span() {
        return Err(QbpError::NotEnoughFrames {
            required: schedule.merge_span(),
            provided: frames.len(),
        });
    }
    let (w, h) = frames[0].size();
    let grid = PatchGrid::finest(params, w, h);
    let method = if params.fast_mode {
        InterpMethod::Nearest
    } else {
        InterpMethod::Linear
    };
    let out_channels = match phase_ids {
        Some(ids) => {
            if ids.len() < schedule.merge_span() {
                return Err(QbpError::InvalidParams(format!(
                    "{} phase ids for {} frames",
                    ids.len(),
                    schedule.merge_span()
                )));
            }
            if frames.iter().any(|f| f.num_channels() != 1) {
                return Err(QbpError::InvalidParams(
                    "phase ids require single-channel frames".to_string(),
                ));
            }
            ids[..schedule.merge_span()].iter().max().map_or(1, |m| m + 1)
        }
        None => frames[0].num_channels(),
    };
    let tiled = (grid.cols * grid.patch, grid.rows * grid.patch);

    let mut windows = Vec::with_capacity(schedule.merge_tw_num);
    for window in 0..schedule.merge_tw_num {
        log::debug!("warping merge window {window}");
        let accumulated = schedule
            .merge_window(window)
            .into_par_iter()
            .try_fold(
                || None,
                |acc: Option<(Frame, Frame)>, g| {
                    let flow = interpolate_flow(flows, &schedule, g)?;
                    let warped = warp_frame(&frames[g], &flow, &grid, method)?;
                    let (mut sum, mut count) = acc.unwrap_or_else(|| {
                        (
                            Frame::new(tiled.0, tiled.1, out_channels),
                            Frame::new(tiled.0, tiled.1, out_channels),
                        )
                    });
                    for (c, plane) in warped.channels().iter().enumerate() {
                        let oc = phase_ids.map_or(c, |ids| ids[g]);
                        if oc >= out_channels {
                            return Err(QbpError::InvalidParams(format!(
                                "frame {g} maps to channel {oc} of {out_channels}"
                            )));
                        }
                        let sums = sum.channel_mut(oc).data_mut();
                        let counts = count.channel_mut(oc).data_mut();
                        for ((s, n), v) in sums.iter_mut().zip(counts.iter_mut()).zip(plane.data()) {
                            if v.is_finite() {
                                *s += v;
                                *n += 1.0;
                            }
                        }
                    }
                    Ok(Some((sum, count)))
                },
            )
            .try_reduce(
                || None,
                |a, b| match (a, b) {
                    (Some((mut s1, mut n1)), Some((s2, n2))) => {
                        s1.add_assign(&s2)?;
                        n1.add_assign(&n2)?;
                        Ok(Some((s1, n1)))
                    }
                    (Some(a), None) | (None, Some(a)) => Ok(Some(a)),
                    (None, None) => Ok(None),
                },
            )?;
        let Some((sum, count)) = accumulated else {
            return Err(QbpError::ProcessingError(format!(
                "merge window {window} produced no frames"
            )));
        };
        let planes = sum
            .channels()
            .iter()
            .zip(count.channels())
            .map(|(s, n)| {
                let data = s
                    .data()
                    .iter()
                    .zip(n.data())
                    .map(|(s, n)| s / n.max(1.0))
                    .collect();
                Plane::from_vec(tiled.0, tiled.1, data)
            })
            .collect::<Result<Vec<_>, QbpError>>()?;
        let mut averaged = Frame::from_planes(planes)?;
        averaged.quantize(params.data_type);
        windows.push(averaged);
    }
    Ok(windows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(align: (usize, usize), merge: (usize, usize), ref_frame: usize) -> BurstParams {
        BurstParams {
            align_tw_size: align.0,
            align_tw_num: align.1,
            merge_tw_size: merge.0,
            merge_tw_num: merge.1,
            ref_frame: Some(ref_frame),
            ..Default::default()
        }
    }

    fn constant_flow(v: [f64; 2]) -> FlowField {
        FlowField::from_vec(1, 1, vec![v]).unwrap()
    }

    #[test]
    fn schedule_indices() {
        let s = BurstSchedule::new(&params((4, 3), (2, 6), 6));
        assert_eq!(s.ref_block(), 1);
        assert_eq!(s.ref_merge_window(), 2);
        assert_eq!(s.align_window(2), 8..12);
        assert_eq!(s.merge_window(5), 10..12);
        assert_eq!((s.align_span(), s.merge_span()), (12, 12));
    }

    #[test]
    fn interpolation_hits_block_flows_at_the_center_frame() {
        // block flows at dx = 0, 4, 8; the reference is the third frame of its window
        let flows: Vec<FlowField> = [0.0, 4.0, 8.0]
            .iter()
            .map(|dx| constant_flow([*dx, -*dx]))
            .collect();
        let s = BurstSchedule::new(&params((4, 3), (4, 3), 3));
        let at = |g| interpolate_flow(&flows, &s, g).unwrap().get(0, 0);
        assert_eq!(at(2), [0.0, 0.0]);
        assert_eq!(at(6), [4.0, -4.0]);
        assert_eq!(at(10), [8.0, -8.0]);
        assert_eq!(at(4), [2.0, -2.0]);
        // extrapolated before the first and after the last center
        assert_eq!(at(0), [-2.0, 2.0]);
        assert_eq!(at(11), [9.0, -9.0]);
    }

    #[test]
    fn one_frame_windows_use_block_flows_directly() {
        let flows: Vec<FlowField> = (0..4).map(|k| constant_flow([k as f64, 0.5])).collect();
        let s = BurstSchedule::new(&params((1, 4), (1, 4), 1));
        for g in 0..4 {
            assert_eq!(interpolate_flow(&flows, &s, g).unwrap().get(0, 0), [g as f64, 0.5]);
        }
    }

    #[test]
    fn warp_shifts_tiles_and_marks_outside_samples() {
        let frame = Frame::from_plane(Plane::from_fn(8, 8, |x, y| (x + 10 * y) as f64));
        let grid = PatchGrid::overlapping(8, 8, 4);
        let mut flow = FlowField::zeros(grid.rows, grid.cols);
        flow.set(0, 0, [1.0, 2.0]);
        flow.set(2, 2, [1.0, 0.0]);
        let warped = warp_frame(&frame, &flow, &grid, InterpMethod::Nearest).unwrap();
        assert_eq!(warped.size(), (12, 12));
        let p = warped.channel(0);
        assert_eq!(p.get(0, 0), 21.0);
        // tile (1, 1) starts at (2, 2) in the frame
        assert_eq!(p.get(4, 4), 22.0);
        // tile (2, 2) starts at (4, 4) and is pushed one column past the edge
        assert_eq!(p.get(8 + 2, 8), 47.0);
        assert!(p.get(8 + 3, 8).is_nan());
    }

    #[test]
    fn aggregation_averages_windows() {
        let frames: Vec<Frame> = (0..4)
            .map(|k| Frame::from_plane(Plane::filled(4, 4, (k % 2) as f64 * 2.0)))
            .collect();
        let mut p = params((2, 2), (2, 2), 1);
        p.n_binary = 2;
        let blocks = aggregate_align_blocks(&frames, &p).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.data().iter().all(|v| *v == 0.5)));
        assert!(aggregate_align_blocks(&frames[..3], &p).is_err());
    }

    #[test]
    fn samples_outside_the_frame_are_left_out_of_the_average() {
        let frames: Vec<Frame> = (0..4)
            .map(|k| Frame::from_plane(Plane::filled(16, 16, if k % 2 == 0 { 1.0 } else { 3.0 })))
            .collect();
        let mut p = params((2, 2), (2, 2), 1);
        p.patch_sizes = vec![8, 8, 4];
        let grid = PatchGrid::finest(&p, 16, 16);
        // frame 0 keeps tile (0, 0) in place, frames 1..=3 push it off the frame
        let still = FlowField::zeros(grid.rows, grid.cols);
        let mut away = still.clone();
        away.set(0, 0, [-200.0, 0.0]);
        let windows = build_aligned_patches(&frames, &[still, away], &p, None).unwrap();

        let first = windows[0].channel(0);
        assert_eq!(first.get(3, 3), 1.0);
        assert_eq!(first.get(12, 12), 2.0);
        // no finite sample at all leaves the pixel at zero
        let second = windows[1].channel(0);
        assert_eq!(second.get(3, 3), 0.0);
        assert_eq!(second.get(12, 12), 2.0);
    }

    #[test]
    fn zero_sized_windows_are_an_error() {
        let frames = vec![Frame::from_plane(Plane::filled(16, 16, 1.0)); 4];
        let mut p = params((2, 2), (2, 2), 1);
        p.n_binary = 0;
        assert!(matches!(
            aggregate_align_blocks(&frames, &p),
            Err(QbpError::InvalidParams(_))
        ));
        let p = params((2, 2), (0, 2), 1);
        assert!(matches!(
            build_aligned_patches(&frames, &[], &p, None),
            Err(QbpError::InvalidParams(_))
        ));
    }

    #[test]
    fn phase_channels_and_count_normalization() {
        let frames: Vec<Frame> = (0..4)
            .map(|k| Frame::from_plane(Plane::filled(16, 16, 1.0 + k as f64)))
            .collect();
        let mut p = params((2, 2), (2, 2), 1);
        p.patch_sizes = vec![8, 8, 4];
        let grid = PatchGrid::finest(&p, 16, 16);
        let flows = vec![FlowField::zeros(grid.rows, grid.cols); 2];
        let phases = [0, 1, 1, 0];
        let windows = build_aligned_patches(&frames, &flows, &p, Some(&phases)).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].num_channels(), 2);
        assert_eq!(windows[0].size(), (24, 24));
        // window 0 holds frame 0 (phase 0) and frame 1 (phase 1)
        assert!(windows[0].channel(0).data().iter().all(|v| *v == 1.0));
        assert!(windows[0].channel(1).data().iter().all(|v| *v == 2.0));
        assert!(windows[1].channel(0).data().iter().all(|v| *v == 4.0));
        assert!(windows[1].channel(1).data().iter().all(|v| *v == 3.0));

        let plain = build_aligned_patches(&frames, &flows, &p, None).unwrap();
        assert!(plain[1].channel(0).data().iter().all(|v| *v == 3.5));
    }
}
