//! Frame I/O through OpenCV.

use super::QbpError;
use super::plane::{Frame, Plane};
use opencv::core::{Mat, MatTrait, MatTraitConst, Scalar, Vector};
use opencv::imgcodecs;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

/// Image extensions picked up by [`collect_image_files`].
pub const IMAGE_EXTENSIONS: [&str; 6] = ["png", "tif", "tiff", "bmp", "pgm", "jpg"];

/// Extension trait for more ergonomic Mat conversions
pub trait MatExt {
    /// Convert matrix to specified type with default scaling
    ///
    /// # Arguments
    /// * `rtype` - OpenCV type constant (e.g., CV_32F, CV_64F)
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, QbpError>;
}

impl MatExt for Mat {
    fn convert(&self, rtype: i32, alpha: f64, beta: f64) -> Result<Mat, QbpError> {
        let mut dst = Mat::default();
        self.convert_to(&mut dst, rtype, alpha, beta)?;
        Ok(dst)
    }
}

fn path_str(path: &Path) -> Result<&str, QbpError> {
    path.to_str()
        .ok_or_else(|| QbpError::InvalidPathEncoding(path.to_path_buf()))
}

/// Safe wrapper around OpenCV's `imread` with proper error handling
///
/// OpenCV wants a `&str` path, so non-Unicode paths are reported as
/// `QbpError::InvalidPathEncoding` instead of panicking. An image that
/// cannot be decoded is reported as a `ProcessingError`.
///
/// # Example
/// ```no_run
/// # use libqbp::{utils::imread, prelude::*, opencv::imgcodecs };
/// # fn a() -> Result<(), QbpError> {
/// let img = imread("frames/000001.png", imgcodecs::IMREAD_UNCHANGED)?;
/// # Ok(()) }
/// ```
#[inline(always)]
pub fn imread<P: AsRef<Path>>(path: P, flags: i32) -> Result<Mat, QbpError> {
    let path = path.as_ref();
    let img = imgcodecs::imread(path_str(path)?, flags)?;
    if img.empty() {
        return Err(QbpError::ProcessingError(format!(
            "could not decode {}",
            path.display()
        )));
    }
    Ok(img)
}

/// Sorted list of the image files directly inside `dir`.
pub fn collect_image_files(dir: &Path) -> Result<Vec<PathBuf>, QbpError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if path.is_file() && is_image {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy a single-channel Mat of any depth into a [`Plane`].
pub fn mat_to_plane(mat: &Mat) -> Result<Plane, QbpError> {
    if mat.channels() != 1 {
        return Err(QbpError::InvalidParams(format!(
            "expected a single-channel image, got {} channels",
            mat.channels()
        )));
    }
    let m = mat.convert(opencv::core::CV_64F, 1.0, 0.0)?;
    let (w, h) = (m.cols() as usize, m.rows() as usize);
    let mut data = Vec::with_capacity(w * h);
    for row in 0..m.rows() {
        for col in 0..m.cols() {
            data.push(*m.at_2d::<f64>(row, col)?);
        }
    }
    Plane::from_vec(w, h, data)
}

/// Split a Mat into one plane per channel.
pub fn mat_to_frame(mat: &Mat) -> Result<Frame, QbpError> {
    if mat.channels() == 1 {
        return Ok(Frame::from_plane(mat_to_plane(mat)?));
    }
    let mut channels = Vector::<Mat>::new();
    opencv::core::split(mat, &mut channels)?;
    let planes = channels
        .iter()
        .map(|c| mat_to_plane(&c))
        .collect::<Result<Vec<_>, QbpError>>()?;
    Frame::from_planes(planes)
}

/// Read every image in `dir` as a photon count frame, in file name order.
///
/// Pixel values are taken as counts. With `binarize`, any non-zero value
/// counts as one detection, which suits 8-bit 0/255 exports.
pub fn read_binary_frames(dir: &Path, binarize: bool) -> Result<Vec<Frame>, QbpError> {
    let files = collect_image_files(dir)?;
    if files.is_empty() {
        return Err(QbpError::NotEnoughFrames {
            required: 1,
            provided: 0,
        });
    }
    log::info!("reading {} frames from {}", files.len(), dir.display());
    files
        .par_iter()
        .map(|f| {
            let frame = mat_to_frame(&imread(f, imgcodecs::IMREAD_UNCHANGED)?)?;
            Ok(if binarize {
                frame.map(|v| if v > 0.0 { 1.0 } else { 0.0 })
            } else {
                frame
            })
        })
        .collect()
}

/// Pack a frame into a `CV_64FC(n)` Mat.
pub fn frame_to_mat(frame: &Frame) -> Result<Mat, QbpError> {
    let (w, h) = frame.size();
    let mut planes = Vector::<Mat>::new();
    for plane in frame.channels() {
        let mut m = Mat::new_rows_cols_with_default(
            h as i32,
            w as i32,
            opencv::core::CV_64FC1,
            Scalar::all(0.0),
        )?;
        m.data_typed_mut::<f64>()?.copy_from_slice(plane.data());
        planes.push(m);
    }
    if planes.len() == 1 {
        return Ok(planes.get(0)?);
    }
    let mut merged = Mat::default();
    opencv::core::merge(&planes, &mut merged)?;
    Ok(merged)
}

fn imwrite(path: &Path, mat: &Mat) -> Result<(), QbpError> {
    if !imgcodecs::imwrite(path_str(path)?, mat, &Vector::new())? {
        return Err(QbpError::ProcessingError(format!(
            "could not write {}",
            path.display()
        )));
    }
    Ok(())
}

/// Write photon counts as a 16-bit image, saturating at 65535.
pub fn write_counts(path: &Path, counts: &Frame) -> Result<(), QbpError> {
    let mat = frame_to_mat(counts)?.convert(opencv::core::CV_16U, 1.0, 0.0)?;
    imwrite(path, &mat)
}

/// Write intensities as an 8-bit image normalized by the largest finite value.
pub fn write_intensity(path: &Path, intensity: &Frame) -> Result<(), QbpError> {
    let max = intensity
        .channels()
        .iter()
        .flat_map(|p| p.data().iter())
        .filter(|v| v.is_finite())
        .fold(0.0_f64, |a, b| a.max(*b));
    let alpha = if max > 0.0 { 255.0 / max } else { 1.0 };
    let clean = intensity.map(|v| if v.is_finite() { v } else { max });
    let mat = frame_to_mat(&clean)?.convert(opencv::core::CV_8U, alpha, 0.0)?;
    imwrite(path, &mat)
}
