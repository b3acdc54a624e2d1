use image::imageops::FilterType;
use image::DynamicImage;

pub const DEFAULT_MAX_DIMENSION: u32 = 1024;

/// Dimensions that fit `width`×`height` inside `max` on the longer side, or `None`
/// when the image already fits.
pub fn fitted_dimensions(width: u32, height: u32, max: u32) -> Option<(u32, u32)> {
    let longer = width.max(height);
    if longer <= max {
        return None;
    }

    let scale = |side: u32| -> u32 {
        let scaled = (u64::from(side) * u64::from(max) + u64::from(longer) / 2) / u64::from(longer);
        (scaled as u32).max(1)
    };

    if width >= height {
        Some((max, scale(height)))
    } else {
        Some((scale(width), max))
    }
}

/// Downscales so the longer edge is at most `max`, keeping the aspect ratio.
pub fn resize_to_fit(image: DynamicImage, max: u32) -> DynamicImage {
    match fitted_dimensions(image.width(), image.height(), max) {
        Some((width, height)) => image.resize_exact(width, height, FilterType::Lanczos3),
        None => image,
    }
}
