use image::{DynamicImage, ImageFormat};

use crate::error::ApiError;

/// One file part from the upload form.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// Detects the format of `upload` from its content, rejects anything that is not
/// JPEG, PNG or WEBP, and decodes it. WEBP input comes back as RGBA.
pub fn load(upload: &Upload) -> Result<DynamicImage, ApiError> {
    let format = image::guess_format(&upload.bytes).map_err(|e| ApiError::InvalidImage {
        filename: upload.filename.clone(),
        reason: e.to_string(),
    })?;

    if !is_supported(format) {
        return Err(ApiError::UnsupportedFormat {
            filename: upload.filename.clone(),
        });
    }

    let image = image::load_from_memory_with_format(&upload.bytes, format).map_err(|e| {
        ApiError::InvalidImage {
            filename: upload.filename.clone(),
            reason: e.to_string(),
        }
    })?;

    match format {
        ImageFormat::WebP => Ok(DynamicImage::ImageRgba8(image.to_rgba8())),
        _ => Ok(image),
    }
}

fn is_supported(format: ImageFormat) -> bool {
    matches!(
        format,
        ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP
    )
}
