// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2021,2025 lacklustr@protonmail.com https://github.com/eadf

//! This library reconstructs an intensity image from a long burst of binary
//! single-photon frames that are corrupted by camera or scene motion.
//! It is multi-threaded with Rayon <https://crates.io/crates/rayon>, and can
//! read and write frames through OpenCV <https://crates.io/crates/opencv>
//! when the `opencv` feature is enabled.
//!
//! The pipeline:
//! 1. Binary frames are averaged into alignment blocks.
//! 2. Every block is turned into an [`pyramid::AggregatePyramid`] of mean photon rates.
//! 3. A coarse-to-fine block matcher followed by Lucas-Kanade estimates one
//!    displacement per overlapping patch ([`motion::patch_align`]).
//! 4. The block flows are interpolated in time and every frame is warped onto
//!    the reference grid ([`temporal::build_aligned_patches`]).
//! 5. The aligned patches are fused with a temporal Wiener filter and
//!    blended back with overlap-add ([`merge::patch_merge`]).
//! 6. The merged photon counts are inverted into linear intensity
//!    ([`mle::mle_image`]).
//!
//! Read more about quanta burst photography here:
//! <https://wisionlab.com/project/quanta-burst-photography/>

pub mod block_match;
pub mod lucas_kanade;
pub mod merge;
pub mod mle;
pub mod motion;
pub mod params;
pub mod pipeline;
pub mod plane;
pub mod pyramid;
pub mod resample;
pub mod temporal;
#[cfg(feature = "opencv")]
pub mod utils;
pub mod window;

#[cfg(feature = "opencv")]
pub use opencv;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QbpError {
    #[cfg(feature = "opencv")]
    #[error(transparent)]
    OpenCvError(#[from] opencv::Error),
    #[error("Not enough frames: {required} required, {provided} provided")]
    NotEnoughFrames { required: usize, provided: usize },
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid path encoding {0}")]
    InvalidPathEncoding(PathBuf),
    #[error("Invalid parameter(s) {0}")]
    InvalidParams(String),
    #[error("Unknown method {0}")]
    UnknownMethod(String),
    #[error("Dimension mismatch: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("Internal error {0}")]
    ProcessingError(String),
}

pub mod prelude {
    pub use super::{
        QbpError,
        merge::patch_merge,
        mle::{IntensityScale, MleEstimate, mle_image},
        motion::{FlowField, patch_align},
        params::{BurstParams, DataType, WindowKind},
        pipeline::{Reconstruction, reconstruct},
        plane::{Frame, Plane},
        pyramid::AggregatePyramid,
        resample::{Boundary, IndexOrigin, InterpMethod, Resampler},
    };
}
