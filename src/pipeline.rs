//! End-to-end burst reconstruction.

use crate::QbpError;
use crate::merge::patch_merge;
use crate::mle::{IntensityScale, MleEstimate, mle_image};
use crate::motion::{AlignmentReport, DegeneratePatch, FlowField, PatchGrid, patch_align};
use crate::params::BurstParams;
use crate::plane::Frame;
use crate::temporal::{BurstSchedule, aggregate_align_blocks, build_aligned_patches};

/// Naive reconstructions, without any motion compensation.
#[derive(Clone, Debug)]
pub struct NaiveRecons {
    /// Inversion of the sum over the whole merged span.
    pub burst: MleEstimate,
    /// Inversion of the merge window holding the reference frame.
    pub reference: MleEstimate,
    /// Photon counts summed over the whole merged span.
    pub counts: Frame,
}

/// Everything [`reconstruct`] produces.
#[derive(Clone, Debug)]
pub struct Reconstruction {
    pub naive: NaiveRecons,
    /// Motion compensated photon counts, before inversion.
    pub merged_counts: Frame,
    /// Final intensity image.
    pub intensity: Frame,
    /// Finest-level flow per alignment block.
    pub flows: Vec<FlowField>,
    /// Patches without a valid block match, tagged with their block index.
    pub degenerate: Vec<(usize, DegeneratePatch)>,
}

fn sum_frames(frames: &[Frame]) -> Result<Frame, QbpError> {
    let Some(first) = frames.first() else {
        return Err(QbpError::NotEnoughFrames {
            required: 1,
            provided: 0,
        });
    };
    let mut acc = first.clone();
    for f in &frames[1..] {
        acc.add_assign(f)?;
    }
    Ok(acc)
}

/// Sum and invert the merged span, and separately the reference window.
pub fn naive_recons(frames: &[Frame], params: &BurstParams) -> Result<NaiveRecons, QbpError> {
    params.validate()?;
    let schedule = BurstSchedule::new(params);
    let span = schedule.merge_span();
    if frames.len() < span {
        return Err(QbpError::NotEnoughFrames {
            required: span,
            provided: frames.len(),
        });
    }
    let scale = IntensityScale::Uniform(params.img_scale);
    let mut counts = sum_frames(&frames[..span])?;
    counts.quantize(params.data_type);
    let burst = mle_image(&counts, (span * params.n_binary) as f64, &scale, false)?;

    let window = schedule.merge_window(schedule.ref_merge_window());
    let ref_counts = sum_frames(&frames[window])?;
    let reference = mle_image(
        &ref_counts,
        (schedule.merge_tw_size * params.n_binary) as f64,
        &scale,
        false,
    )?;
    Ok(NaiveRecons {
        burst,
        reference,
        counts,
    })
}

/// Aggregate the frames into alignment blocks and estimate their flows.
pub fn patch_align_binary(frames: &[Frame], params: &BurstParams) -> Result<AlignmentReport, QbpError> {
    let blocks = aggregate_align_blocks(frames, params)?;
    patch_align(&blocks, params)
}

/// Motion compensated photon counts over the merged span.
///
/// A single alignment window has no motion to compensate and is summed
/// directly. Otherwise every merge window is warped and averaged, the
/// windows are fused with the Wiener merge and the result is scaled back
/// to counts over the whole span.
pub fn patch_merge_binary(
    frames: &[Frame],
    flows: &[FlowField],
    params: &BurstParams,
    phase_ids: Option<&[usize]>,
) -> Result<Frame, QbpError> {
    params.validate()?;
    let schedule = BurstSchedule::new(params);
    if schedule.align_tw_num == 1 {
        if frames.len() < schedule.align_tw_size {
            return Err(QbpError::NotEnoughFrames {
                required: schedule.align_tw_size,
                provided: frames.len(),
            });
        }
        log::info!("single alignment window, summing {} frames", schedule.align_tw_size);
        return sum_frames(&frames[..schedule.align_tw_size]);
    }

    let windows = build_aligned_patches(frames, flows, params, phase_ids)?;
    let (w, h) = frames[0].size();
    let grid = PatchGrid::finest(params, w, h);
    log::info!(
        "merging {} windows of {} patches",
        windows.len(),
        grid.len()
    );
    let mut merged = patch_merge(
        &windows,
        &grid,
        params.merge_window,
        params.wiener_c,
        schedule.ref_merge_window(),
        w,
        h,
    )?;
    merged.scale(schedule.merge_span() as f64);
    merged.quantize(params.data_type);
    Ok(merged)
}

/// Clamp negative counts and invert them into non-negative intensity.
pub fn post_merge(merged: &Frame, params: &BurstParams) -> Result<MleEstimate, QbpError> {
    params.validate()?;
    params.check_supported()?;
    let counts = merged.map(|v| v.max(0.0));
    let mut est = mle_image(
        &counts,
        params.total_exposures() as f64,
        &IntensityScale::Uniform(params.img_scale),
        true,
    )?;
    est.intensity = est.intensity.map(|v| v.max(0.0));
    est.intensity.quantize(params.data_type);
    Ok(est)
}

/// Run the whole pipeline on a burst of photon count frames.
///
/// Each frame holds the sum of `params.n_binary` binary exposures. The
/// parameters and the burst shape are validated before any alignment work.
pub fn reconstruct(
    frames: &[Frame],
    params: &BurstParams,
    phase_ids: Option<&[usize]>,
) -> Result<Reconstruction, QbpError> {
    params.check_supported()?;
    let Some(first) = frames.first() else {
        return Err(QbpError::NotEnoughFrames {
            required: params.align_tw_size * params.align_tw_num,
            provided: 0,
        });
    };
    let (w, h) = first.size();
    params.validate_for_burst(frames.len(), w, h)?;
    if let Some(f) = frames.iter().find(|f| f.size() != (w, h)) {
        return Err(QbpError::DimensionMismatch {
            expected: (w, h),
            got: f.size(),
        });
    }
    log::info!("reconstructing {} frames of {w}x{h}", frames.len());

    let naive = naive_recons(frames, params)?;
    let (flows, degenerate) = if params.align_tw_num > 1 {
        let report = patch_align_binary(frames, params)?;
        (report.flows, report.degenerate)
    } else {
        (Vec::new(), Vec::new())
    };
    let merged_counts = patch_merge_binary(frames, &flows, params, phase_ids)?;
    let intensity = post_merge(&merged_counts, params)?.intensity;
    Ok(Reconstruction {
        naive,
        merged_counts,
        intensity,
        flows,
        degenerate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plane::Plane;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn params() -> BurstParams {
        BurstParams {
            align_tw_size: 2,
            align_tw_num: 2,
            merge_tw_size: 2,
            merge_tw_num: 2,
            ref_frame: Some(1),
            patch_sizes: vec![8, 8, 4],
            ..Default::default()
        }
    }

    #[test]
    fn naive_inverts_summed_counts() {
        let frames: Vec<Frame> = (0..4)
            .map(|k| Frame::from_plane(Plane::filled(8, 8, (k % 2) as f64)))
            .collect();
        let n = naive_recons(&frames, &params()).unwrap();
        assert!(n.counts.channel(0).data().iter().all(|v| *v == 2.0));
        let expected = -(0.5f64).ln();
        assert!((n.burst.intensity.channel(0).get(3, 3) - expected).abs() < 1e-12);
        assert!((n.reference.intensity.channel(0).get(3, 3) - expected).abs() < 1e-12);
    }

    #[test]
    fn single_alignment_window_is_a_plain_sum() {
        let p = BurstParams {
            align_tw_size: 3,
            align_tw_num: 1,
            merge_tw_size: 3,
            merge_tw_num: 1,
            ref_frame: Some(2),
            ..params()
        };
        let frames: Vec<Frame> = (0..3)
            .map(|k| Frame::from_plane(Plane::filled(32, 32, k as f64)))
            .collect();
        let r = reconstruct(&frames, &p, None).unwrap();
        assert!(r.flows.is_empty());
        assert!(r.merged_counts.channel(0).data().iter().all(|v| *v == 3.0));
    }

    #[test]
    fn static_burst_merges_to_the_naive_sum() {
        let mut rng = StdRng::seed_from_u64(8);
        let frame = Frame::from_plane(Plane::from_fn(32, 32, |_, _| {
            if rng.random_bool(0.4) { 1.0 } else { 0.0 }
        }));
        let frames = vec![frame; 4];
        let r = reconstruct(&frames, &params(), None).unwrap();
        assert_eq!(r.flows.len(), 2);
        assert!(r.flows[1].data().iter().all(|d| *d == [0.0, 0.0]));
        for (m, n) in r
            .merged_counts
            .channel(0)
            .data()
            .iter()
            .zip(r.naive.counts.channel(0).data())
        {
            assert!((m - n).abs() < 1e-9);
        }
        assert!(r.intensity.channel(0).data().iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn stages_validate_their_params() {
        let frames = vec![Frame::from_plane(Plane::new(32, 32)); 4];
        let p = BurstParams {
            upsample_ratios: vec![2, 2, 4],
            ..params()
        };
        assert!(matches!(naive_recons(&frames, &p), Err(QbpError::InvalidParams(_))));
        assert!(matches!(
            patch_align_binary(&frames, &p),
            Err(QbpError::InvalidParams(_))
        ));
        assert!(matches!(
            patch_merge_binary(&frames, &[], &p, None),
            Err(QbpError::InvalidParams(_))
        ));
        assert!(matches!(post_merge(&frames[0], &p), Err(QbpError::InvalidParams(_))));
    }

    #[test]
    fn unsupported_extensions_fail_fast() {
        let p = BurstParams {
            do_sr: true,
            ..params()
        };
        let frames = vec![Frame::from_plane(Plane::new(16, 16)); 4];
        assert!(matches!(
            reconstruct(&frames, &p, None),
            Err(QbpError::NotImplemented(_))
        ));
        assert!(matches!(
            reconstruct(&frames[..3], &params(), None),
            Err(QbpError::NotEnoughFrames { .. })
        ));
    }
}
