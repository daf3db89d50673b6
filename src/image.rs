use std::path::Path;

use base64::Engine;
use opencv::core::{Mat, Size, Vector};
use opencv::imgcodecs::{imdecode, imencode, imread, IMREAD_GRAYSCALE};
use opencv::imgproc;
use opencv::prelude::*;

use crate::errors::LoadError;

/// A decoded single-channel 8-bit sheet image.
///
/// There is no way to mutate the pixels once wrapped; every stage that needs a
/// different raster produces a new one.
#[derive(Debug)]
pub struct RasterImage {
    mat: Mat,
}

impl RasterImage {
    /// Wraps `mat`, converting colour input to grayscale.
    pub fn from_mat(mat: Mat) -> Result<RasterImage, LoadError> {
        if mat.empty() {
            return Err(LoadError::NotImage);
        }
        let gray = to_grayscale(&mat)?;
        Ok(RasterImage { mat: gray })
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn mat(&self) -> &Mat {
        &self.mat
    }

    pub fn try_clone(&self) -> opencv::Result<RasterImage> {
        Ok(RasterImage {
            mat: self.mat.try_clone()?,
        })
    }
}

fn to_grayscale(mat: &Mat) -> opencv::Result<Mat> {
    let code = match mat.channels() {
        1 => return mat.try_clone(),
        4 => imgproc::COLOR_BGRA2GRAY,
        _ => imgproc::COLOR_BGR2GRAY,
    };
    let mut gray = Mat::default();
    imgproc::cvt_color_def(mat, &mut gray, code)?;
    Ok(gray)
}

pub fn read_from_path(path: &Path) -> Result<RasterImage, LoadError> {
    let path_str = path.to_str().ok_or(LoadError::NonUtfPath)?;
    let mat = imread(path_str, IMREAD_GRAYSCALE).map_err(|_| LoadError::NotImage)?;
    RasterImage::from_mat(mat)
}

/// Decodes an encoded image (PNG, JPEG, ...) held in memory.
pub fn decode_bytes(bytes: &[u8]) -> Result<RasterImage, LoadError> {
    let buf: Vector<u8> = Vector::from_slice(bytes);
    let mat = imdecode(&buf, IMREAD_GRAYSCALE).map_err(|_| LoadError::NotImage)?;
    RasterImage::from_mat(mat)
}

/// Rescales to `working_width`, keeping the aspect ratio. A non-positive width or
/// an image already at that width is returned as a copy.
pub fn normalize(raster: &RasterImage, working_width: i32) -> Result<RasterImage, LoadError> {
    let (width, height) = (raster.width(), raster.height());
    if working_width <= 0 || width == working_width {
        return Ok(raster.try_clone()?);
    }
    let factor = working_width as f64 / width as f64;
    let new_height = ((height as f64 * factor).round() as i32).max(1);
    log::debug!("resizing {width}x{height} to {working_width}x{new_height}");

    let interpolation = if factor < 1.0 {
        imgproc::INTER_AREA
    } else {
        imgproc::INTER_LINEAR
    };
    let mut dst = Mat::default();
    imgproc::resize(
        &raster.mat,
        &mut dst,
        Size::new(working_width, new_height),
        0.0,
        0.0,
        interpolation,
    )?;
    Ok(RasterImage { mat: dst })
}

pub fn encode_png(mat: &Mat) -> Result<Vec<u8>, opencv::Error> {
    let mut buf: Vector<u8> = Vector::new();
    imencode(".png", mat, &mut buf, &Vector::new())?;
    Ok(buf.to_vec())
}

pub fn mat_to_base64_png(mat: &Mat) -> Result<String, opencv::Error> {
    let buf = encode_png(mat)?;
    let base64 = base64::prelude::BASE64_STANDARD.encode(&buf);
    Ok(format!("data:image/png;base64,{base64}"))
}
