//! Burst reconstruction parameters.
//!
//! [`BurstParams`] is constructed once, validated, and then passed by
//! reference to every stage. Field names in JSON follow the camelCase option
//! names of the capture tooling (`patchSizes`, `alignTWSize`, ...).

use crate::QbpError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Numeric precision of stored images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Single,
    #[default]
    Double,
}

/// Window applied to merge patches, both before the temporal transform and
/// as overlap-add blending weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowKind {
    Box,
    #[default]
    RaisedCosine,
}

/// Parameters for alignment, merging and intensity inversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct BurstParams {
    /// Pyramid depth used by the coarse-to-fine motion solver.
    pub num_levels: usize,
    /// Patch size per pyramid level. The finest entry must be even; the merge
    /// stage uses it with a stride of half the patch size.
    pub patch_sizes: Vec<usize>,
    /// Per-level decimation ratio; entry 0 is always 1.
    pub upsample_ratios: Vec<usize>,
    /// Block matching search radius per level.
    pub search_radii: Vec<usize>,
    /// Lucas-Kanade iterations at the finest level.
    #[serde(rename = "numLKIters")]
    pub num_lk_iters: usize,
    /// Blend between target and template derivatives in Lucas-Kanade.
    #[serde(rename = "lkBlend")]
    pub lk_blend: f64,
    /// Frames aggregated into one alignment block.
    #[serde(rename = "alignTWSize")]
    pub align_tw_size: usize,
    /// Number of alignment blocks.
    #[serde(rename = "alignTWNum")]
    pub align_tw_num: usize,
    /// Frames aggregated into one merge sub-frame.
    #[serde(rename = "mergeTWSize")]
    pub merge_tw_size: usize,
    /// Number of merge sub-frames.
    #[serde(rename = "mergeTWNum")]
    pub merge_tw_num: usize,
    /// 1-based index of the temporal anchor frame. `None` picks the middle
    /// of the merged span.
    pub ref_frame: Option<usize>,
    pub wiener_c: f64,
    pub merge_window: WindowKind,
    /// Linear intensity scale applied by the inversion.
    pub img_scale: f64,
    /// Binary sub-exposures summed into every input frame.
    pub n_binary: usize,
    /// Skip sub-pixel refinement and warp with nearest neighbour sampling.
    pub fast_mode: bool,
    pub data_type: DataType,
    #[serde(rename = "doSR")]
    pub do_sr: bool,
    pub do_refine: bool,
    #[serde(rename = "removeHP")]
    pub remove_hp: bool,
    #[serde(rename = "correctDCR")]
    pub correct_dcr: bool,
    #[serde(rename = "bm3dSigma")]
    pub bm3d_sigma: f64,
}

impl Default for BurstParams {
    fn default() -> Self {
        Self {
            num_levels: 3,
            patch_sizes: vec![16, 16, 8],
            upsample_ratios: vec![1, 2, 4],
            search_radii: vec![1, 4, 8],
            num_lk_iters: 3,
            lk_blend: 0.5,
            align_tw_size: 100,
            align_tw_num: 20,
            merge_tw_size: 100,
            merge_tw_num: 20,
            ref_frame: None,
            wiener_c: 8.0,
            merge_window: WindowKind::RaisedCosine,
            img_scale: 1.0,
            n_binary: 1,
            fast_mode: true,
            data_type: DataType::Double,
            do_sr: false,
            do_refine: false,
            remove_hp: false,
            correct_dcr: false,
            bm3d_sigma: 0.0,
        }
    }
}

/// Config file layout: a `qbp` section plus optional dataset metadata.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigDocument {
    qbp: BurstParams,
    #[serde(default)]
    dataset: Option<DatasetSection>,
}

#[derive(Debug, Deserialize)]
struct DatasetSection {
    n_binary: Option<usize>,
}

impl BurstParams {
    /// Parse and validate parameters from JSON.
    ///
    /// Accepts either the bare parameter object or a document with a `qbp`
    /// section (and an optional `dataset.n_binary`).
    /// ```
    /// # use libqbp::prelude::*;
    /// let p = BurstParams::from_json_str(r#"{"alignTWSize": 4, "alignTWNum": 2,
    ///     "mergeTWSize": 2, "mergeTWNum": 4, "refFrame": 3}"#).unwrap();
    /// assert_eq!(p.ref_frame(), 3);
    /// assert!(BurstParams::from_json_str(r#"{"noSuchKey": 1}"#).is_err());
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, QbpError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let params = if value.get("qbp").is_some() {
            let doc: ConfigDocument = serde_json::from_value(value)?;
            let mut params = doc.qbp;
            if let Some(n_binary) = doc.dataset.and_then(|d| d.n_binary) {
                params.n_binary = n_binary;
            }
            params
        } else {
            serde_json::from_value(value)?
        };
        params.validate()?;
        Ok(params)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, QbpError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// 1-based reference frame, defaulting to the middle of the merged span.
    pub fn ref_frame(&self) -> usize {
        self.ref_frame
            .unwrap_or((self.merge_tw_size * self.merge_tw_num) / 2)
    }

    /// Finest-level patch size, also used by the merge stage.
    pub fn merge_patch_size(&self) -> usize {
        self.patch_sizes[0]
    }

    pub fn patch_stride(&self) -> usize {
        self.patch_sizes[0] / 2
    }

    /// Total binary exposures contributing to the merged image.
    pub fn total_exposures(&self) -> usize {
        self.merge_tw_size * self.merge_tw_num * self.n_binary
    }

    /// Structural checks that do not depend on the burst itself.
    pub fn validate(&self) -> Result<(), QbpError> {
        let fail = |msg: String| Err(QbpError::InvalidParams(msg));

        if self.num_levels == 0 {
            return fail("numLevels must be at least 1".to_string());
        }
        for (name, len) in [
            ("patchSizes", self.patch_sizes.len()),
            ("upsampleRatios", self.upsample_ratios.len()),
            ("searchRadii", self.search_radii.len()),
        ] {
            if len != self.num_levels {
                return fail(format!(
                    "{name} has {len} entries but numLevels is {}",
                    self.num_levels
                ));
            }
        }
        if self.upsample_ratios.contains(&0) {
            return fail("upsampleRatios must not contain 0".to_string());
        }
        if self.upsample_ratios[0] != 1 {
            return fail(format!(
                "upsampleRatios[0] must be 1, got {}",
                self.upsample_ratios[0]
            ));
        }
        if self.patch_sizes.contains(&0) {
            return fail("patchSizes must not contain 0".to_string());
        }
        if self.patch_sizes[0] % 2 != 0 {
            return fail(format!(
                "the finest patch size must be even, got {}",
                self.patch_sizes[0]
            ));
        }
        if self.align_tw_size == 0
            || self.align_tw_num == 0
            || self.merge_tw_size == 0
            || self.merge_tw_num == 0
        {
            return fail("temporal window sizes and counts must be positive".to_string());
        }
        if self.n_binary == 0 {
            return fail("nBinary must be positive".to_string());
        }
        if self.align_tw_size % self.merge_tw_size != 0 {
            return fail(format!(
                "alignTWSize ({}) must be a multiple of mergeTWSize ({})",
                self.align_tw_size, self.merge_tw_size
            ));
        }
        let align_span = self.align_tw_size * self.align_tw_num;
        let merge_span = self.merge_tw_size * self.merge_tw_num;
        if merge_span > align_span {
            return fail(format!(
                "mergeTWSize * mergeTWNum ({merge_span}) must be <= alignTWSize * alignTWNum ({align_span})"
            ));
        }
        let ref_frame = self.ref_frame();
        if ref_frame == 0 || ref_frame > merge_span {
            return fail(format!(
                "refFrame ({ref_frame}) must lie in 1..={merge_span}"
            ));
        }
        if self.align_tw_num == 1
            && (self.merge_tw_num != 1 || self.merge_tw_size != self.align_tw_size)
        {
            return fail(
                "a single alignment window requires mergeTWNum == 1 and mergeTWSize == alignTWSize"
                    .to_string(),
            );
        }
        if !(self.wiener_c >= 0.0) {
            return fail(format!("wienerC must be >= 0, got {}", self.wiener_c));
        }
        if !(0.0..=1.0).contains(&self.lk_blend) {
            return fail(format!("lkBlend must lie in [0, 1], got {}", self.lk_blend));
        }
        if !self.img_scale.is_finite() {
            return fail(format!("imgScale must be finite, got {}", self.img_scale));
        }
        Ok(())
    }

    /// Checks that additionally depend on the burst length and frame size.
    pub fn validate_for_burst(
        &self,
        frame_count: usize,
        width: usize,
        height: usize,
    ) -> Result<(), QbpError> {
        self.validate()?;
        let align_span = self.align_tw_size * self.align_tw_num;
        if align_span > frame_count {
            return Err(QbpError::NotEnoughFrames {
                required: align_span,
                provided: frame_count,
            });
        }
        let mut cumulative = 1;
        for level in 0..self.num_levels {
            cumulative *= self.upsample_ratios[level];
            let (lw, lh) = (width / cumulative, height / cumulative);
            if lw < self.patch_sizes[level] || lh < self.patch_sizes[level] {
                return Err(QbpError::InvalidParams(format!(
                    "pyramid level {level} is {lw}x{lh}, smaller than its patch size {}",
                    self.patch_sizes[level]
                )));
            }
        }
        // the merge grid must tile the frame, otherwise its right and bottom
        // band would never be covered by a patch
        let (patch, stride) = (self.merge_patch_size(), self.patch_stride());
        if self.align_tw_num > 1 && ((width - patch) % stride != 0 || (height - patch) % stride != 0) {
            return Err(QbpError::InvalidParams(format!(
                "a {width}x{height} frame is not tiled by {patch}px merge patches at stride {stride}, \
                 the last {} columns and {} rows would be uncovered",
                (width - patch) % stride,
                (height - patch) % stride
            )));
        }
        Ok(())
    }

    /// Rejects the extensions that have no implementation.
    pub fn check_supported(&self) -> Result<(), QbpError> {
        if self.do_sr {
            return Err(QbpError::NotImplemented("super-resolution (doSR)"));
        }
        if self.do_refine {
            return Err(QbpError::NotImplemented("flow refinement (doRefine)"));
        }
        if self.remove_hp {
            return Err(QbpError::NotImplemented("hot pixel removal (removeHP)"));
        }
        if self.correct_dcr {
            return Err(QbpError::NotImplemented("dark count correction (correctDCR)"));
        }
        if self.bm3d_sigma > 0.0 {
            return Err(QbpError::NotImplemented("spatial denoising (bm3dSigma > 0)"));
        }
        Ok(())
    }
}
