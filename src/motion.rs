//! Coarse-to-fine patch motion estimation.
//!
//! Coarse levels use non-overlapping patches (stride equals the level's patch
//! size). The finest level uses overlapping patches with a stride of half the
//! patch size; those flows are what the merge stage consumes.

use crate::QbpError;
use crate::block_match::{BlockMatch, block_match};
use crate::lucas_kanade::{GradientField, lk_align};
use crate::params::BurstParams;
use crate::plane::Plane;
use crate::pyramid::AggregatePyramid;
use crate::resample::{IndexOrigin, InterpMethod, Resampler};
use ordered_float::OrderedFloat;
use rayon::prelude::*;

/// One `(dx, dy)` displacement per patch, row-major over the patch grid.
#[derive(Clone, Debug, PartialEq)]
pub struct FlowField {
    rows: usize,
    cols: usize,
    data: Vec<[f64; 2]>,
}

impl FlowField {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![[0.0; 2]; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<[f64; 2]>) -> Result<Self, QbpError> {
        if data.len() != rows * cols {
            return Err(QbpError::InvalidParams(format!(
                "flow field of {rows}x{cols} patches needs {} vectors, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> [f64; 2] {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, v: [f64; 2]) {
        self.data[row * self.cols + col] = v;
    }

    pub fn data(&self) -> &[[f64; 2]] {
        &self.data
    }

    /// `wa * a + wb * b`, patch by patch.
    pub fn weighted_sum(a: &FlowField, wa: f64, b: &FlowField, wb: f64) -> Result<FlowField, QbpError> {
        if (a.rows, a.cols) != (b.rows, b.cols) {
            return Err(QbpError::DimensionMismatch {
                expected: (a.cols, a.rows),
                got: (b.cols, b.rows),
            });
        }
        let data = a
            .data
            .iter()
            .zip(b.data.iter())
            .map(|(p, q)| [wa * p[0] + wb * q[0], wa * p[1] + wb * q[1]])
            .collect();
        Ok(FlowField {
            rows: a.rows,
            cols: a.cols,
            data,
        })
    }

    /// Per-component median over the finite vectors, `None` if there are none.
    /// ```
    /// # use libqbp::prelude::*;
    /// let f = FlowField::from_vec(1, 3, vec![[2.0, 0.0], [2.0, 1.0], [-5.0, 0.0]]).unwrap();
    /// assert_eq!(f.median_displacement(), Some([2.0, 0.0]));
    /// ```
    pub fn median_displacement(&self) -> Option<[f64; 2]> {
        let median = |axis: usize| {
            let mut v: Vec<OrderedFloat<f64>> = self
                .data
                .iter()
                .map(|d| d[axis])
                .filter(|d| d.is_finite())
                .map(OrderedFloat)
                .collect();
            if v.is_empty() {
                return None;
            }
            v.sort_unstable();
            let n = v.len();
            Some(if n % 2 == 1 {
                v[n / 2].0
            } else {
                0.5 * (v[n / 2 - 1].0 + v[n / 2].0)
            })
        };
        Some([median(0)?, median(1)?])
    }
}

/// Initial guesses per patch for block matching.
#[derive(Clone, Debug, PartialEq)]
pub struct CandidateSet {
    rows: usize,
    cols: usize,
    per_patch: usize,
    data: Vec<[f64; 2]>,
}

impl CandidateSet {
    pub fn zeros(rows: usize, cols: usize, per_patch: usize) -> Self {
        Self {
            rows,
            cols,
            per_patch,
            data: vec![[0.0; 2]; rows * cols * per_patch],
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn candidates(&self, row: usize, col: usize) -> &[[f64; 2]] {
        let start = (row * self.cols + col) * self.per_patch;
        &self.data[start..start + self.per_patch]
    }
}

/// Patch layout over one image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatchGrid {
    pub patch: usize,
    pub stride: usize,
    pub rows: usize,
    pub cols: usize,
}

impl PatchGrid {
    /// Non-overlapping patches covering as much of a `width × height` level as fits.
    pub fn tiled(width: usize, height: usize, patch: usize) -> Self {
        Self {
            patch,
            stride: patch,
            rows: height / patch,
            cols: width / patch,
        }
    }

    /// Half-overlapping patches of the finest level.
    pub fn overlapping(width: usize, height: usize, patch: usize) -> Self {
        let stride = (patch / 2).max(1);
        let count = |n: usize| if n < patch { 0 } else { (n - patch) / stride + 1 };
        Self {
            patch,
            stride,
            rows: count(height),
            cols: count(width),
        }
    }

    pub fn finest(params: &BurstParams, width: usize, height: usize) -> Self {
        Self::overlapping(width, height, params.merge_patch_size())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper left `(x, y)` corner of patch `(row, col)`.
    #[inline]
    pub fn corner(&self, row: usize, col: usize) -> (usize, usize) {
        (col * self.stride, row * self.stride)
    }
}

/// A patch whose candidates all produced an empty search window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DegeneratePatch {
    pub level: usize,
    pub row: usize,
    pub col: usize,
}

/// Flow of one pyramid level and the patches that could not be matched.
#[derive(Clone, Debug)]
pub struct LevelMatches {
    pub flow: FlowField,
    pub degenerate: Vec<DegeneratePatch>,
}

/// Block match every patch of `grid` against all of its candidates and keep
/// the lowest score. Patches with no valid candidate keep a zero flow and
/// are reported as degenerate.
pub fn find_best_matches(
    reference: &Plane,
    target: &Plane,
    grid: &PatchGrid,
    search_radius: usize,
    candidates: &CandidateSet,
    level: usize,
) -> Result<LevelMatches, QbpError> {
    if (candidates.rows(), candidates.cols()) != (grid.rows, grid.cols) {
        return Err(QbpError::DimensionMismatch {
            expected: (grid.cols, grid.rows),
            got: (candidates.cols(), candidates.rows()),
        });
    }
    let results = (0..grid.len())
        .into_par_iter()
        .map(|i| {
            let (row, col) = (i / grid.cols, i % grid.cols);
            let mut best: Option<BlockMatch> = None;
            for init in candidates.candidates(row, col) {
                let m = block_match(
                    std::slice::from_ref(reference),
                    std::slice::from_ref(target),
                    grid.corner(row, col),
                    grid.patch,
                    search_radius,
                    *init,
                    IndexOrigin::Zero,
                )?;
                if let Some(m) = m {
                    if m.score < best.map_or(f64::INFINITY, |b| b.score) {
                        best = Some(m);
                    }
                }
            }
            Ok(best)
        })
        .collect::<Result<Vec<_>, QbpError>>()?;

    let mut flow = FlowField::zeros(grid.rows, grid.cols);
    let mut degenerate = Vec::new();
    for (i, best) in results.into_iter().enumerate() {
        let (row, col) = (i / grid.cols, i % grid.cols);
        match best {
            Some(m) => flow.set(
                row,
                col,
                [m.displacement[0] as f64, m.displacement[1] as f64],
            ),
            None => {
                log::debug!("level {level}: no valid match for patch ({row}, {col})");
                degenerate.push(DegeneratePatch { level, row, col });
            }
        }
    }
    Ok(LevelMatches { flow, degenerate })
}

/// Floor index of a fractional cell position and the neighbour on the side
/// the position leans towards. The first cell always pairs with the second,
/// the last with its predecessor; a single cell pairs with itself.
fn cell_and_neighbour(pos: f64, n: usize) -> (usize, usize) {
    let cell = (pos.floor().max(0.0) as usize).min(n - 1);
    let frac = pos - pos.floor();
    let neighbour = if (frac >= 0.5 && cell < n - 1) || cell == 0 {
        cell + 1
    } else {
        cell - 1
    };
    (cell, neighbour.min(n - 1))
}

/// Derive three candidates per fine patch from a coarser flow field.
///
/// Fine patch `(row, col)` maps to the coarse cell at
/// `row * fine_stride / ratio / coarse_stride`. The candidates are the
/// co-located coarse flow, its vertical neighbour and its horizontal
/// neighbour, each scaled by `ratio` and rounded.
pub fn upsample_matches(
    coarse: &FlowField,
    fine_rows: usize,
    fine_cols: usize,
    fine_stride: usize,
    coarse_stride: usize,
    ratio: usize,
) -> Result<CandidateSet, QbpError> {
    if coarse.rows() == 0 || coarse.cols() == 0 {
        return Err(QbpError::InvalidParams(
            "cannot upsample an empty flow field".to_string(),
        ));
    }
    let scale = ratio as f64;
    let step = fine_stride as f64 / scale / coarse_stride as f64;
    let up = |v: [f64; 2]| [(v[0] * scale).round(), (v[1] * scale).round()];

    let mut set = CandidateSet::zeros(fine_rows, fine_cols, 3);
    for row in 0..fine_rows {
        let (yr, yn) = cell_and_neighbour(row as f64 * step, coarse.rows());
        for col in 0..fine_cols {
            let (xr, xn) = cell_and_neighbour(col as f64 * step, coarse.cols());
            let start = (row * fine_cols + col) * 3;
            set.data[start] = up(coarse.get(yr, xr));
            set.data[start + 1] = up(coarse.get(yn, xr));
            set.data[start + 2] = up(coarse.get(yr, xn));
        }
    }
    Ok(set)
}

/// Candidates for the overlapping finest grid, taken from level 1 when the
/// pyramid has one, otherwise three zero guesses per patch.
pub fn initialize_finest_candidates(
    level1: Option<&FlowField>,
    grid: &PatchGrid,
    params: &BurstParams,
) -> Result<CandidateSet, QbpError> {
    params.validate()?;
    match level1 {
        Some(coarse) if params.num_levels > 1 => upsample_matches(
            coarse,
            grid.rows,
            grid.cols,
            grid.stride,
            params.patch_sizes[1],
            params.upsample_ratios[1],
        ),
        _ => Ok(CandidateSet::zeros(grid.rows, grid.cols, 3)),
    }
}

/// Run block matching from the coarsest level down to level 0 and return the
/// integer flow of the overlapping finest grid.
pub fn coarse_to_fine_match(
    reference: &AggregatePyramid,
    target: &AggregatePyramid,
    params: &BurstParams,
) -> Result<LevelMatches, QbpError> {
    params.validate()?;
    if reference.num_levels() != params.num_levels || target.num_levels() != params.num_levels {
        return Err(QbpError::InvalidParams(format!(
            "pyramids have {} and {} levels, numLevels is {}",
            reference.num_levels(),
            target.num_levels(),
            params.num_levels
        )));
    }
    let mut degenerate = Vec::new();
    let mut coarser: Option<FlowField> = None;

    for level in (1..params.num_levels).rev() {
        let (w, h) = reference.level(level).size();
        let grid = PatchGrid::tiled(w, h, params.patch_sizes[level]);
        let candidates = match coarser.as_ref() {
            None => CandidateSet::zeros(grid.rows, grid.cols, 1),
            Some(c) => upsample_matches(
                c,
                grid.rows,
                grid.cols,
                grid.stride,
                params.patch_sizes[level + 1],
                params.upsample_ratios[level + 1],
            )?,
        };
        let m = find_best_matches(
            reference.level(level),
            target.level(level),
            &grid,
            params.search_radii[level],
            &candidates,
            level,
        )?;
        degenerate.extend(m.degenerate);
        coarser = Some(m.flow);
    }

    let (w, h) = reference.level(0).size();
    let grid = PatchGrid::finest(params, w, h);
    let candidates = initialize_finest_candidates(coarser.as_ref(), &grid, params)?;
    let mut m = find_best_matches(
        reference.level(0),
        target.level(0),
        &grid,
        params.search_radii[0],
        &candidates,
        0,
    )?;
    degenerate.append(&mut m.degenerate);
    Ok(LevelMatches {
        flow: m.flow,
        degenerate,
    })
}

/// Lucas-Kanade refinement of every finest-level patch, starting from its
/// block matching result. Left untouched in fast mode.
pub fn refine_finest_level(
    reference: &Plane,
    target: &Plane,
    flow: &FlowField,
    params: &BurstParams,
) -> Result<FlowField, QbpError> {
    params.validate()?;
    if params.fast_mode && !params.do_sr {
        return Ok(flow.clone());
    }
    let grid = PatchGrid::finest(params, reference.width(), reference.height());
    if (grid.rows, grid.cols) != (flow.rows(), flow.cols()) {
        return Err(QbpError::DimensionMismatch {
            expected: (grid.cols, grid.rows),
            got: (flow.cols(), flow.rows()),
        });
    }
    let gradients = [GradientField::new(target.clone())];
    let resampler = Resampler::new(InterpMethod::Linear);
    let data = (0..grid.len())
        .into_par_iter()
        .map(|i| {
            let (row, col) = (i / grid.cols, i % grid.cols);
            let (xlb, ylb) = grid.corner(row, col);
            let template = reference.crop(xlb, ylb, grid.patch, grid.patch)?;
            let d = flow.get(row, col);
            let uv = lk_align(
                &[template],
                &gradients,
                params.num_lk_iters,
                [d[0] + xlb as f64, d[1] + ylb as f64],
                &resampler,
                params.lk_blend,
            );
            Ok([uv[0] - xlb as f64, uv[1] - ylb as f64])
        })
        .collect::<Result<Vec<_>, QbpError>>()?;
    FlowField::from_vec(grid.rows, grid.cols, data)
}

/// Finest-level flows of every alignment block and the patches that could
/// not be matched, tagged with their block index.
#[derive(Clone, Debug)]
pub struct AlignmentReport {
    pub flows: Vec<FlowField>,
    pub degenerate: Vec<(usize, DegeneratePatch)>,
}

/// Estimate the flow of every alignment block relative to the block holding
/// the reference frame. Blocks hold photon rates in `[0, 1]`.
pub fn patch_align(blocks: &[Plane], params: &BurstParams) -> Result<AlignmentReport, QbpError> {
    params.validate()?;
    let Some(first) = blocks.first() else {
        return Err(QbpError::NotEnoughFrames {
            required: 1,
            provided: 0,
        });
    };
    let (w, h) = first.size();
    if let Some(b) = blocks.iter().find(|b| b.size() != (w, h)) {
        return Err(QbpError::DimensionMismatch {
            expected: (w, h),
            got: b.size(),
        });
    }
    let ref_block = (params.ref_frame() - 1) / params.align_tw_size;
    if ref_block >= blocks.len() {
        return Err(QbpError::NotEnoughFrames {
            required: ref_block + 1,
            provided: blocks.len(),
        });
    }
    log::info!(
        "aligning {} blocks of {w}x{h} against block {ref_block}",
        blocks.len()
    );

    let pyramids = blocks
        .par_iter()
        .map(|b| AggregatePyramid::build(b, &params.upsample_ratios[..params.num_levels]))
        .collect::<Result<Vec<_>, QbpError>>()?;
    let grid = PatchGrid::finest(params, w, h);

    let per_block = (0..blocks.len())
        .into_par_iter()
        .map(|i| {
            if i == ref_block {
                return Ok((FlowField::zeros(grid.rows, grid.cols), Vec::new()));
            }
            let m = coarse_to_fine_match(&pyramids[ref_block], &pyramids[i], params)?;
            let flow = refine_finest_level(&blocks[ref_block], &blocks[i], &m.flow, params)?;
            if let Some(d) = flow.median_displacement() {
                log::debug!("block {i}: median flow ({:.3}, {:.3})", d[0], d[1]);
            }
            Ok((flow, m.degenerate))
        })
        .collect::<Result<Vec<_>, QbpError>>()?;

    let mut report = AlignmentReport {
        flows: Vec::with_capacity(per_block.len()),
        degenerate: Vec::new(),
    };
    for (i, (flow, degenerate)) in per_block.into_iter().enumerate() {
        report.flows.push(flow);
        report
            .degenerate
            .extend(degenerate.into_iter().map(|d| (i, d)));
    }
    if !report.degenerate.is_empty() {
        log::warn!(
            "{} patches had no valid block match and kept a zero flow",
            report.degenerate.len()
        );
    }
    Ok(report)
}
