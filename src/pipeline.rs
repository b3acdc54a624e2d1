use base64::{engine::general_purpose, Engine as _};
use image::{DynamicImage, ImageFormat};
use log::{error, info};
use serde_derive::Serialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use crate::error::ApiError;
use crate::intake::{self, Upload};
use crate::resize;
use crate::rmbg::Segmenter;

#[derive(Debug, Serialize)]
pub struct ImageOutput {
    pub filename: String,
    /// Base64-encoded PNG.
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct RemovalResponse {
    pub images: Vec<ImageOutput>,
}

/// Shared per-process state for background removal requests.
#[derive(Clone)]
pub struct Pipeline {
    segmenter: Arc<dyn Segmenter>,
    max_dimension: u32,
}

impl Pipeline {
    pub fn new(segmenter: Arc<dyn Segmenter>, max_dimension: u32) -> Self {
        Pipeline {
            segmenter,
            max_dimension,
        }
    }

    /// Processes `uploads` one after another. The first failure aborts the batch
    /// and nothing produced so far is returned.
    pub async fn run(&self, uploads: Vec<Upload>) -> Result<RemovalResponse, ApiError> {
        let mut images = Vec::with_capacity(uploads.len());
        for upload in uploads {
            let output = self.process(upload).await.map_err(|e| {
                error!("{}", e);
                e
            })?;
            images.push(output);
        }
        Ok(RemovalResponse { images })
    }

    async fn process(&self, upload: Upload) -> Result<ImageOutput, ApiError> {
        let now = Instant::now();

        let image = intake::load(&upload)?;
        let image = resize::resize_to_fit(image, self.max_dimension);
        let segmented = self.segment(&upload.filename, image).await?;
        let encoded = image_to_base64(&segmented).map_err(|e| ApiError::Encoding {
            filename: upload.filename.clone(),
            reason: e.to_string(),
        })?;

        info!(
            "removed background from {} ({}x{}) in {} ms",
            upload.filename,
            segmented.width(),
            segmented.height(),
            now.elapsed().as_millis()
        );

        Ok(ImageOutput {
            filename: upload.filename,
            image: encoded,
        })
    }

    async fn segment(&self, filename: &str, image: DynamicImage) -> Result<DynamicImage, ApiError> {
        let segmenter = Arc::clone(&self.segmenter);
        let outcome =
            tokio::task::spawn_blocking(move || segmenter.remove_background(&image)).await;

        let reason = match outcome {
            Ok(Ok(segmented)) => return Ok(segmented),
            Ok(Err(e)) => format!("{:#}", e),
            Err(e) => e.to_string(),
        };
        Err(ApiError::Segmentation {
            filename: filename.to_string(),
            reason,
        })
    }
}

fn image_to_base64(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut image_data = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)?;
    Ok(general_purpose::STANDARD.encode(image_data))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::intake::tests::encoded;
    use anyhow::{anyhow, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Records the size of every image it sees and returns it as RGBA.
    #[derive(Default)]
    pub(crate) struct FakeSegmenter {
        pub(crate) seen: Mutex<Vec<(u32, u32)>>,
        pub(crate) fail_on_call: Option<usize>,
        calls: AtomicUsize,
    }

    impl FakeSegmenter {
        pub(crate) fn failing_on(call: usize) -> Self {
            FakeSegmenter {
                fail_on_call: Some(call),
                ..Default::default()
            }
        }
    }

    impl Segmenter for FakeSegmenter {
        fn remove_background(&self, image: &DynamicImage) -> Result<DynamicImage> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(anyhow!("CUDA out of memory"));
            }
            self.seen.lock().unwrap().push((image.width(), image.height()));
            Ok(DynamicImage::ImageRgba8(image.to_rgba8()))
        }
    }

    fn upload(name: &str, bytes: Vec<u8>) -> Upload {
        Upload {
            filename: name.to_string(),
            bytes,
        }
    }

    fn decode_png(b64: &str) -> DynamicImage {
        let bytes = general_purpose::STANDARD.decode(b64).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Png);
        image::load_from_memory_with_format(&bytes, ImageFormat::Png).unwrap()
    }

    #[tokio::test]
    async fn outputs_follow_upload_order() {
        let pipeline = Pipeline::new(Arc::new(FakeSegmenter::default()), 1024);
        let response = pipeline
            .run(vec![
                upload("one.png", encoded(10, 10, ImageFormat::Png)),
                upload("two.jpg", encoded(20, 10, ImageFormat::Jpeg)),
                upload("three.webp", encoded(5, 30, ImageFormat::WebP)),
            ])
            .await
            .unwrap();

        let names: Vec<_> = response.images.iter().map(|i| i.filename.as_str()).collect();
        assert_eq!(names, ["one.png", "two.jpg", "three.webp"]);

        let third = decode_png(&response.images[2].image);
        assert_eq!((third.width(), third.height()), (5, 30));
        assert!(third.color().has_alpha());
    }

    #[tokio::test]
    async fn oversized_image_is_resized_before_segmentation() {
        let segmenter = Arc::new(FakeSegmenter::default());
        let pipeline = Pipeline::new(segmenter.clone(), 1024);
        pipeline
            .run(vec![upload("wide.png", encoded(1280, 960, ImageFormat::Png))])
            .await
            .unwrap();

        assert_eq!(*segmenter.seen.lock().unwrap(), vec![(1024, 768)]);
    }

    #[tokio::test]
    async fn segmentation_failure_aborts_batch() {
        let segmenter = Arc::new(FakeSegmenter::failing_on(1));
        let pipeline = Pipeline::new(segmenter.clone(), 1024);
        let err = pipeline
            .run(vec![
                upload("ok.png", encoded(4, 4, ImageFormat::Png)),
                upload("bad.png", encoded(4, 4, ImageFormat::Png)),
                upload("never.png", encoded(4, 4, ImageFormat::Png)),
            ])
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Segmentation pipeline error for file bad.png: CUDA out of memory"
        );
        assert_eq!(segmenter.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_upload_stops_before_segmentation() {
        let segmenter = Arc::new(FakeSegmenter::default());
        let pipeline = Pipeline::new(segmenter.clone(), 1024);
        let err = pipeline
            .run(vec![
                upload("scan.bmp", encoded(4, 4, ImageFormat::Bmp)),
                upload("ok.png", encoded(4, 4, ImageFormat::Png)),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::UnsupportedFormat { .. }));
        assert!(segmenter.seen.lock().unwrap().is_empty());
    }
}
