use crate::bounding_box::BoundingBox;
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use image::{imageops, imageops::FilterType, GrayImage, ImageFormat};
use std::io::Cursor;
use thiserror::Error;

pub const MODEL_INPUT_SIZE: u32 = 28;

const DATA_URL_PREFIX: &str = "data:image/png;base64,";

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("Bounding box {bbox:?} does not fit a {width}x{height} bitmap")]
    OutOfBounds {
        bbox: BoundingBox,
        width: u32,
        height: u32,
    },
    #[error("Failed to encode normalized image: {0}")]
    EncodeFailed(#[from] image::ImageError),
}

/// A 28x28 grayscale rendering of the glyph together with its PNG encoding.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pixels: GrayImage,
    png: Bytes,
}

impl NormalizedImage {
    pub fn pixels(&self) -> &GrayImage {
        &self.pixels
    }

    pub fn png(&self) -> &Bytes {
        &self.png
    }

    pub fn to_data_url(&self) -> String {
        format!("{}{}", DATA_URL_PREFIX, STANDARD.encode(&self.png))
    }
}

pub fn normalize(bitmap: &GrayImage, bbox: &BoundingBox) -> Result<NormalizedImage, NormalizeError> {
    let (width, height) = bitmap.dimensions();
    if bbox.left >= bbox.right
        || bbox.top >= bbox.bottom
        || bbox.right > width
        || bbox.bottom > height
    {
        return Err(NormalizeError::OutOfBounds {
            bbox: *bbox,
            width,
            height,
        });
    }

    let region = imageops::crop_imm(bitmap, bbox.left, bbox.top, bbox.width(), bbox.height())
        .to_image();
    let pixels = imageops::resize(
        &region,
        MODEL_INPUT_SIZE,
        MODEL_INPUT_SIZE,
        FilterType::Triangle,
    );

    let mut png = Vec::new();
    pixels.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;

    Ok(NormalizedImage {
        pixels,
        png: Bytes::from(png),
    })
}
